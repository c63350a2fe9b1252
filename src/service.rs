//! Programmatic enrichment service: submit, status, result, events, and
//! the user actions an HTTP layer would wrap.
//!
//! The service owns the orchestrator, the job store, a global semaphore
//! bounding concurrent jobs, and the in-memory handles of live jobs. It
//! is cheap to clone and safe to share across request handlers.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, RwLock, Semaphore};
use uuid::Uuid;

use crate::annotation::LineageEvent;
use crate::config::EnrichConfig;
use crate::document::DocumentInput;
use crate::error::{Error, Result};
use crate::job::{Job, JobResult, JobState, StageTiming};
use crate::pipeline::{CancelFlag, Orchestrator, StageEvent};
use crate::store::JobStore;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Entity counts reported by [`EnrichService::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    /// Concept annotations.
    pub annotations: usize,
    /// Extracted individuals.
    pub individuals: usize,
    /// Object-property occurrences.
    pub properties: usize,
    /// Derived triples.
    pub triples: usize,
}

/// Snapshot returned by [`EnrichService::status`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    /// Lifecycle state.
    pub state: JobState,
    /// The stage currently executing, when running.
    pub current_stage: Option<String>,
    /// Entity counts so far.
    pub counts: JobCounts,
    /// Per-stage timings so far.
    pub timings: Vec<StageTiming>,
}

struct JobHandle {
    job: Arc<RwLock<Job>>,
    cancel: CancelFlag,
    events: broadcast::Sender<StageEvent>,
    state_rx: watch::Receiver<JobState>,
}

struct Inner {
    orchestrator: Arc<Orchestrator>,
    store: JobStore,
    config: EnrichConfig,
    jobs: RwLock<HashMap<Uuid, JobHandle>>,
    job_semaphore: Arc<Semaphore>,
}

/// The enrichment service facade.
#[derive(Clone)]
pub struct EnrichService {
    inner: Arc<Inner>,
}

impl EnrichService {
    /// Create a service over shared collaborators and a job store.
    #[must_use]
    pub fn new(orchestrator: Arc<Orchestrator>, store: JobStore, config: EnrichConfig) -> Self {
        let permits = config.max_concurrent_jobs.max(1);
        Self {
            inner: Arc::new(Inner {
                orchestrator,
                store,
                config,
                jobs: RwLock::new(HashMap::new()),
                job_semaphore: Arc::new(Semaphore::new(permits)),
            }),
        }
    }

    /// Submit a document for enrichment. Returns the job id immediately;
    /// the pipeline runs in the background, gated by the global job
    /// semaphore.
    pub async fn submit(&self, input: DocumentInput, config: Option<EnrichConfig>) -> Result<Uuid> {
        let config = config.unwrap_or_else(|| self.inner.config.clone());
        if input.content.len() > config.max_upload_bytes {
            return Err(Error::input(format!(
                "document is {} bytes; limit is {}",
                input.content.len(),
                config.max_upload_bytes
            )));
        }

        let job = Job::new();
        let job_id = job.id;
        let job = Arc::new(RwLock::new(job));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(JobState::Pending);
        let cancel = CancelFlag::new();

        self.inner.jobs.write().await.insert(
            job_id,
            JobHandle {
                job: Arc::clone(&job),
                cancel: cancel.clone(),
                events: events.clone(),
                state_rx,
            },
        );

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let _permit = inner.job_semaphore.acquire().await;
            inner
                .orchestrator
                .run(input, config, Arc::clone(&job), cancel, events)
                .await;

            let snapshot = job.read().await.clone();
            if let Err(e) = inner.store.save(&snapshot) {
                log::warn!("failed to persist job {job_id}: {e}");
            }
            let _ = state_tx.send(snapshot.state);
        });

        Ok(job_id)
    }

    async fn handle<T>(
        &self,
        job_id: Uuid,
        f: impl FnOnce(&JobHandle) -> T,
    ) -> Result<T> {
        let jobs = self.inner.jobs.read().await;
        jobs.get(&job_id)
            .map(f)
            .ok_or(Error::JobNotFound(job_id))
    }

    /// Current status of a job.
    pub async fn status(&self, job_id: Uuid) -> Result<JobStatus> {
        let job = self.job_arc(job_id).await?;
        let j = job.read().await;
        Ok(JobStatus {
            state: j.state,
            current_stage: j.current_stage.clone(),
            counts: JobCounts {
                annotations: j.result.annotations.len(),
                individuals: j.result.individuals.len(),
                properties: j.result.properties.len(),
                triples: j.result.triples.len(),
            },
            timings: j.result.timings.clone(),
        })
    }

    /// The job's result. Blocks until the job reaches a terminal state,
    /// or returns the partial result immediately when `partial` is set.
    pub async fn result(&self, job_id: Uuid, partial: bool) -> Result<JobResult> {
        if partial {
            let job = self.job_arc(job_id).await?;
            return Ok(job.read().await.result.clone());
        }
        // Jobs only known to the store are already terminal; only live
        // jobs need waiting on.
        if let Ok(mut state_rx) = self.handle(job_id, |h| h.state_rx.clone()).await {
            while !state_rx.borrow().is_terminal() {
                if state_rx.changed().await.is_err() {
                    break;
                }
            }
        }
        let job = self.job_arc(job_id).await?;
        let result = job.read().await.result.clone();
        Ok(result)
    }

    /// Subscribe to the job's progress events.
    pub async fn stream_events(&self, job_id: Uuid) -> Result<broadcast::Receiver<StageEvent>> {
        self.handle(job_id, |h| h.events.subscribe()).await
    }

    /// Request cooperative cancellation.
    pub async fn cancel(&self, job_id: Uuid) -> Result<()> {
        self.handle(job_id, |h| h.cancel.cancel()).await
    }

    async fn job_arc(&self, job_id: Uuid) -> Result<Arc<RwLock<Job>>> {
        if let Ok(job) = self.handle(job_id, |h| Arc::clone(&h.job)).await {
            return Ok(job);
        }
        // Fall back to the store for jobs from an earlier process life.
        let job = self.inner.store.load(job_id)?;
        Ok(Arc::new(RwLock::new(job)))
    }

    async fn mutate(
        &self,
        job_id: Uuid,
        annotation_id: Option<Uuid>,
        f: impl FnOnce(&mut JobResult) -> Result<usize>,
    ) -> Result<usize> {
        let job = self.job_arc(job_id).await?;
        let mut j = job.write().await;
        let lineage_before = annotation_id
            .and_then(|id| j.result.annotation(id))
            .map_or(0, |a| a.lineage.len());
        let updated = f(&mut j.result)?;
        j.touch();
        self.inner.store.save(&j)?;
        if let Some(id) = annotation_id {
            if let Some(ann) = j.result.annotation(id) {
                let new_events: Vec<LineageEvent> =
                    ann.lineage.iter().skip(lineage_before).cloned().collect();
                self.inner.store.append_lineage(job_id, id, &new_events)?;
                if let Ok(events) = self.handle(job_id, |h| h.events.clone()).await {
                    let _ = events.send(StageEvent {
                        stage: "user_action".to_string(),
                        event: "annotation.updated".to_string(),
                        payload: serde_json::json!(ann),
                    });
                }
            }
        }
        Ok(updated)
    }

    /// Replace an annotation's active IRI with one of its backups.
    pub async fn promote(&self, job_id: Uuid, annotation_id: Uuid, backup_iri: &str) -> Result<()> {
        self.mutate(job_id, Some(annotation_id), |result| {
            result.promote(annotation_id, backup_iri).map(|()| 1)
        })
        .await
        .map(|_| ())
    }

    /// Reject an annotation.
    pub async fn reject(&self, job_id: Uuid, annotation_id: Uuid, reason: &str) -> Result<()> {
        self.mutate(job_id, Some(annotation_id), |result| {
            result.reject(annotation_id, reason).map(|()| 1)
        })
        .await
        .map(|_| ())
    }

    /// Restore a rejected annotation to confirmed.
    pub async fn restore(&self, job_id: Uuid, annotation_id: Uuid) -> Result<()> {
        self.mutate(job_id, Some(annotation_id), |result| {
            result.restore(annotation_id).map(|()| 1)
        })
        .await
        .map(|_| ())
    }

    /// Promote `iri` across every annotation carrying it as a backup.
    /// Returns the number of annotations updated.
    pub async fn cascade_promote(&self, job_id: Uuid, iri: &str) -> Result<usize> {
        let iri = iri.to_string();
        self.mutate(job_id, None, move |result| Ok(result.cascade_promote(&iri, None)))
            .await
    }

    /// Reject every annotation whose active concept is `iri`. Returns the
    /// number of annotations updated.
    pub async fn bulk_reject(&self, job_id: Uuid, iri: &str) -> Result<usize> {
        let iri = iri.to_string();
        self.mutate(job_id, None, move |result| Ok(result.bulk_reject(&iri)))
            .await
    }

    /// An annotation's audit trail.
    pub async fn lineage(&self, job_id: Uuid, annotation_id: Uuid) -> Result<Vec<LineageEvent>> {
        let job = self.job_arc(job_id).await?;
        let j = job.read().await;
        j.result.lineage(annotation_id).map(<[LineageEvent]>::to_vec)
    }

    /// Delete expired jobs from the store.
    pub async fn cleanup_expired(&self) -> Result<usize> {
        self.inner
            .store
            .cleanup_expired(self.inner.config.job_retention_days)
    }
}
