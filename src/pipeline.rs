//! Three-phase enrichment orchestrator.
//!
//! Phase 1 runs ingestion intake and normalization sequentially. Phase 2
//! fans out the five discovery stages concurrently (ruler, concept
//! proposer, individual extractor, property matcher, document-type
//! classifier) and awaits them all. Phase 3 runs the sequential chain:
//! reconcile, resolve, rerank, branch judge, string-match expansion,
//! individual linking, property linking, dependency relations, metadata
//! synthesis. Post-pipeline, area-of-law assessment and the document-type
//! cross-check run when a model is available.
//!
//! No stage's failure escapes the orchestrator: a failing stage
//! contributes an empty output and a quality signal, and the job keeps
//! going. When the language model is absent every model-backed stage is
//! skipped with a signal; the deterministic stages still produce a usable
//! result. CPU-bound automaton scans run on the blocking pool.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, RwLock};

use crate::annotation::ConceptMatch;
use crate::config::EnrichConfig;
use crate::document::{CanonicalText, DocumentInput};
use crate::embedding::Embedder;
use crate::job::{Job, JobState, QualitySignal, StageTiming};
use crate::llm::LanguageModel;
use crate::metadata::DocumentTypeHypothesis;
use crate::normalize::normalize;
use crate::ontology::{LabelIndex, Ontology};
use crate::property::PropertyMatcher;
use crate::proposer::ProposerOutput;
use crate::reconcile::Reconciler;
use crate::resolve::Resolver;
use crate::ruler::ConceptRuler;

/// Cooperative cancellation signal, polled by every stage at its natural
/// boundaries (per chunk, per annotation, per call).
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Create an unset flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// True once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A progress event emitted while a job runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageEvent {
    /// Stage that produced the event.
    pub stage: String,
    /// Event kind: "started", "completed", "annotation.added", ...
    pub event: String,
    /// Event payload; full entities for `*.added`/`*.updated` events.
    pub payload: serde_json::Value,
}

fn emit(events: &broadcast::Sender<StageEvent>, stage: &str, event: &str, payload: serde_json::Value) {
    // Nobody listening is fine.
    let _ = events.send(StageEvent {
        stage: stage.to_string(),
        event: event.to_string(),
        payload,
    });
}

/// Drives enrichment jobs against shared read-only collaborators.
///
/// The automata, the label index, the embedding index, and the ontology
/// are built once at startup and shared across jobs; per-job mutable
/// state lives entirely in the [`Job`].
pub struct Orchestrator {
    ontology: Arc<dyn Ontology>,
    embedder: Option<Arc<dyn Embedder>>,
    llm: Option<Arc<dyn LanguageModel>>,
    ruler: Arc<ConceptRuler>,
    property_matcher: Arc<PropertyMatcher>,
    label_index: Arc<LabelIndex>,
    branch_names: Vec<String>,
}

impl Orchestrator {
    /// Build the shared collaborators. Call once at startup.
    #[must_use]
    pub fn new(
        ontology: Arc<dyn Ontology>,
        embedder: Option<Arc<dyn Embedder>>,
        llm: Option<Arc<dyn LanguageModel>>,
        config: &EnrichConfig,
    ) -> Self {
        let ruler = Arc::new(ConceptRuler::from_ontology(ontology.as_ref(), config));
        let property_matcher = Arc::new(PropertyMatcher::from_ontology(ontology.as_ref(), config));
        let label_index = Arc::new(LabelIndex::build(ontology.as_ref()));
        let mut branch_set = std::collections::BTreeSet::new();
        for class in ontology.classes() {
            branch_set.extend(class.branches.iter().cloned());
        }
        Self {
            ontology,
            embedder,
            llm,
            ruler,
            property_matcher,
            label_index,
            branch_names: branch_set.into_iter().collect(),
        }
    }

    /// Whether a language model is configured.
    #[must_use]
    pub fn has_llm(&self) -> bool {
        self.llm.is_some()
    }

    /// Run one job to completion, mutating the shared job as stages land.
    ///
    /// Never panics outward and never returns an error: every failure mode
    /// ends in one of the terminal job states with whatever partial output
    /// the stages produced.
    pub async fn run(
        &self,
        input: DocumentInput,
        config: EnrichConfig,
        job: Arc<RwLock<Job>>,
        cancel: CancelFlag,
        events: broadcast::Sender<StageEvent>,
    ) {
        let timed_out = Arc::new(AtomicBool::new(false));
        let timer = tokio::spawn({
            let cancel = cancel.clone();
            let timed_out = Arc::clone(&timed_out);
            let limit = config.job_hard_timeout();
            async move {
                tokio::time::sleep(limit).await;
                timed_out.store(true, Ordering::SeqCst);
                cancel.cancel();
            }
        });

        self.run_inner(input, config, &job, &cancel, &events).await;
        timer.abort();

        let mut j = job.write().await;
        if timed_out.load(Ordering::SeqCst) {
            j.state = JobState::Failed;
            j.error = Some("job hard timeout exceeded".to_string());
            j.result.incomplete = true;
        } else if cancel.is_cancelled() {
            j.state = JobState::Cancelled;
            j.result.incomplete = true;
        } else if j.state == JobState::Running {
            j.state = if j.result.quality_signals.is_empty() {
                JobState::Completed
            } else {
                JobState::CompletedWithWarnings
            };
        }
        j.current_stage = None;
        j.touch();
        emit(&events, "orchestrator", "finished", json!({"state": j.state}));
    }

    async fn run_inner(
        &self,
        input: DocumentInput,
        config: EnrichConfig,
        job: &Arc<RwLock<Job>>,
        cancel: &CancelFlag,
        events: &broadcast::Sender<StageEvent>,
    ) {
        {
            let mut j = job.write().await;
            j.state = JobState::Running;
            j.result.config = config.clone();
            j.touch();
        }

        // ------------------------------------------------------------------
        // Phase 1: intake and normalization, sequential.
        // ------------------------------------------------------------------
        let started = Instant::now();
        set_stage(job, "normalization").await;
        let doc = match normalize(&input, &config) {
            Ok(doc) => Arc::new(doc),
            Err(e) => {
                let mut j = job.write().await;
                j.state = JobState::Failed;
                j.error = Some(e.to_string());
                j.touch();
                return;
            }
        };
        {
            let mut j = job.write().await;
            j.result.text_sha256 = doc.sha256.clone();
            push_timing(&mut j, "normalization", started);
            j.result.log_activity(
                "normalization",
                format!(
                    "{} chars, {} chunks, {} sentences",
                    doc.text.len(),
                    doc.chunks.len(),
                    doc.sentences.len()
                ),
            );
        }
        emit(events, "normalization", "completed", json!({"chunks": doc.chunks.len()}));
        if cancel.is_cancelled() {
            return;
        }

        // ------------------------------------------------------------------
        // Phase 2: five-way concurrent discovery.
        // ------------------------------------------------------------------
        set_stage(job, "discovery").await;
        let (ruler_matches, proposer_out, mut individuals, mut properties, doc_type) =
            self.run_discovery(&doc, &config, cancel, job).await;

        {
            let mut j = job.write().await;
            j.result.quality_signals.extend(proposer_out.signals.clone());
            j.result.individuals = individuals.clone();
            j.result.properties = properties.clone();
            j.result.document_type = doc_type.clone();
            j.result.log_activity(
                "discovery",
                format!(
                    "{} ruler matches, {} proposals, {} individuals, {} properties",
                    ruler_matches.len(),
                    proposer_out.proposals.len(),
                    individuals.len(),
                    properties.len()
                ),
            );
            j.touch();
        }
        for ind in &individuals {
            emit(events, "individual_extraction", "individual.added", json!(ind));
        }
        for prop in &properties {
            emit(events, "property_matcher", "property.added", json!(prop));
        }
        if cancel.is_cancelled() {
            return;
        }

        // ------------------------------------------------------------------
        // Phase 3: sequential enrichment chain over the working set.
        // ------------------------------------------------------------------
        let mut signals: Vec<QualitySignal> = Vec::new();

        // Reconcile.
        let started = Instant::now();
        set_stage(job, "reconciliation").await;
        let reconciler = Reconciler::new(self.embedder.as_deref(), &config);
        let discoveries = reconciler.reconcile(&ruler_matches, &proposer_out.proposals, &doc);
        push_timing(&mut *job.write().await, "reconciliation", started);
        emit(events, "reconciliation", "completed", json!({"discoveries": discoveries.len()}));
        if cancel.is_cancelled() {
            return;
        }

        // Resolve.
        let started = Instant::now();
        set_stage(job, "resolution").await;
        let mut resolver = Resolver::new(
            self.ontology.as_ref(),
            &self.label_index,
            self.embedder.as_deref(),
            &config,
        );
        let mut annotations = resolver.resolve_all(&discoveries, &mut signals);
        push_timing(&mut *job.write().await, "resolution", started);
        emit(events, "resolution", "completed", json!({"resolved": annotations.len()}));
        if cancel.is_cancelled() {
            self.store_partial(job, annotations, signals).await;
            return;
        }

        // Rerank. The stage hard timeout abandons in-flight calls but
        // keeps whatever was already blended.
        if let Some(llm) = &self.llm {
            let started = Instant::now();
            set_stage(job, "contextual_rerank").await;
            let stage = crate::rerank::rerank_annotations(
                llm,
                &mut annotations,
                &doc,
                self.ontology.as_ref(),
                &config,
                cancel,
                &mut signals,
            );
            if tokio::time::timeout(config.stage_hard_timeout(), stage)
                .await
                .is_err()
            {
                signals.push(QualitySignal {
                    stage: "contextual_rerank".to_string(),
                    reason: "stage hard timeout".to_string(),
                    span_or_chunk: None,
                });
            }
            push_timing(&mut *job.write().await, "contextual_rerank", started);
        } else {
            signals.push(skipped("contextual_rerank"));
        }
        if cancel.is_cancelled() {
            self.store_partial(job, annotations, signals).await;
            return;
        }

        // Branch judge.
        if let Some(llm) = &self.llm {
            let started = Instant::now();
            set_stage(job, "branch_judge").await;
            let stage = crate::branch::judge_branches(
                llm,
                &mut annotations,
                &doc,
                &config,
                cancel,
                &mut signals,
            );
            if tokio::time::timeout(config.stage_hard_timeout(), stage)
                .await
                .is_err()
            {
                signals.push(QualitySignal {
                    stage: "branch_judge".to_string(),
                    reason: "stage hard timeout".to_string(),
                    span_or_chunk: None,
                });
            }
            push_timing(&mut *job.write().await, "branch_judge", started);
        } else {
            signals.push(skipped("branch_judge"));
        }
        if cancel.is_cancelled() {
            self.store_partial(job, annotations, signals).await;
            return;
        }

        // String-match expansion, on the blocking pool.
        let started = Instant::now();
        set_stage(job, "string_match").await;
        annotations = {
            let ontology = Arc::clone(&self.ontology);
            let doc = Arc::clone(&doc);
            let config = config.clone();
            match tokio::task::spawn_blocking(move || {
                crate::expand::expand_occurrences(annotations, ontology.as_ref(), &doc.text, &config)
            })
            .await
            {
                Ok(expanded) => expanded,
                Err(e) => {
                    log::warn!("string-match expansion failed: {e}");
                    signals.push(QualitySignal {
                        stage: "string_match".to_string(),
                        reason: format!("task failure: {e}"),
                        span_or_chunk: None,
                    });
                    Vec::new()
                }
            }
        };
        push_timing(&mut *job.write().await, "string_match", started);
        {
            let mut j = job.write().await;
            j.result.annotations = annotations.clone();
            j.touch();
        }
        for ann in &annotations {
            emit(events, "string_match", "annotation.added", json!(ann));
        }
        if cancel.is_cancelled() {
            self.store_partial(job, annotations, signals).await;
            return;
        }

        // Individual and property linking (model-backed; skipped without one).
        if let Some(llm) = &self.llm {
            let started = Instant::now();
            set_stage(job, "individual_linker").await;
            crate::individual::link_individuals(
                Some(llm),
                &mut individuals,
                &annotations,
                &doc,
                &config,
                cancel,
                &mut signals,
            )
            .await;
            push_timing(&mut *job.write().await, "individual_linker", started);

            let started = Instant::now();
            set_stage(job, "property_linker").await;
            crate::property::link_properties(
                Some(llm),
                &mut properties,
                &annotations,
                &doc,
                self.ontology.as_ref(),
                &config,
                cancel,
                &mut signals,
            )
            .await;
            push_timing(&mut *job.write().await, "property_linker", started);
        } else {
            signals.push(skipped("individual_linker"));
            signals.push(skipped("property_linker"));
        }
        {
            let mut j = job.write().await;
            j.result.individuals = individuals.clone();
            j.result.properties = properties.clone();
            j.touch();
        }
        if cancel.is_cancelled() {
            self.store_partial(job, annotations, signals).await;
            return;
        }

        // Dependency relations, on the blocking pool.
        let started = Instant::now();
        set_stage(job, "dependency_relations").await;
        let triples = {
            let ontology = Arc::clone(&self.ontology);
            let doc = Arc::clone(&doc);
            let annotations = annotations.clone();
            match tokio::task::spawn_blocking(move || {
                crate::relation::extract_triples(&doc, &annotations, ontology.as_ref())
            })
            .await
            {
                Ok(triples) => triples,
                Err(e) => {
                    log::warn!("dependency extraction failed: {e}");
                    signals.push(QualitySignal {
                        stage: "dependency_relations".to_string(),
                        reason: format!("task failure: {e}"),
                        span_or_chunk: None,
                    });
                    Vec::new()
                }
            }
        };
        push_timing(&mut *job.write().await, "dependency_relations", started);
        emit(events, "dependency_relations", "completed", json!({"triples": triples.len()}));

        {
            let mut j = job.write().await;
            j.result.triples = triples;
            j.touch();
        }
        if cancel.is_cancelled() {
            self.store_partial(job, Vec::new(), signals).await;
            return;
        }

        // Metadata synthesis (minimal record without a model).
        let started = Instant::now();
        set_stage(job, "metadata_synthesizer").await;
        if self.llm.is_none() {
            signals.push(skipped("metadata_synthesizer"));
        }
        let metadata = {
            let j = job.read().await;
            crate::metadata::synthesize_metadata(
                self.llm.as_ref(),
                &j.result,
                &doc,
                doc_type.as_ref(),
                &config,
                &mut signals,
            )
            .await
        };
        {
            let mut j = job.write().await;
            j.result.metadata = Some(metadata);
            push_timing(&mut j, "metadata_synthesizer", started);
            j.touch();
        }

        // Post-pipeline: area-of-law and the document-type cross-check.
        if let Some(llm) = &self.llm {
            let areas = {
                let j = job.read().await;
                crate::metadata::assess_areas_of_law(llm, &j.result, doc_type.as_ref(), &config)
                    .await
            };
            let check = match (&doc_type, job.read().await.result.metadata.as_ref()) {
                (Some(hypothesis), Some(metadata)) => {
                    crate::metadata::cross_check_document_type(llm, hypothesis, metadata, &config)
                        .await
                }
                _ => Vec::new(),
            };
            let mut j = job.write().await;
            j.result.areas_of_law = areas;
            j.result.quality_signals.extend(check);
            j.touch();
        }

        let mut j = job.write().await;
        j.result.quality_signals.extend(signals);
        let summary = format!(
            "pipeline complete: {} annotations, {} individuals, {} properties, {} triples",
            j.result.annotations.len(),
            j.result.individuals.len(),
            j.result.properties.len(),
            j.result.triples.len()
        );
        j.result.log_activity("orchestrator", summary);
        j.touch();
    }

    /// Phase 2 fan-out. Each arm runs as its own task; an arm that fails
    /// contributes an empty output and a quality signal.
    async fn run_discovery(
        &self,
        doc: &Arc<CanonicalText>,
        config: &EnrichConfig,
        cancel: &CancelFlag,
        job: &Arc<RwLock<Job>>,
    ) -> (
        Vec<ConceptMatch>,
        ProposerOutput,
        Vec<crate::annotation::Individual>,
        Vec<crate::annotation::PropertyAnnotation>,
        Option<DocumentTypeHypothesis>,
    ) {
        let started = Instant::now();

        let ruler_task = {
            let ruler = Arc::clone(&self.ruler);
            let ontology = Arc::clone(&self.ontology);
            let doc = Arc::clone(doc);
            let config = config.clone();
            tokio::task::spawn_blocking(move || ruler.scan(&doc.text, ontology.as_ref(), &config))
        };

        let individual_task = {
            let doc = Arc::clone(doc);
            let config = config.clone();
            tokio::task::spawn_blocking(move || {
                crate::individual::extract_individuals(&doc.text, &config)
            })
        };

        let property_task = {
            let matcher = Arc::clone(&self.property_matcher);
            let ontology = Arc::clone(&self.ontology);
            let doc = Arc::clone(doc);
            let config = config.clone();
            tokio::task::spawn_blocking(move || matcher.scan(&doc.text, ontology.as_ref(), &config))
        };

        let proposer_fut = async {
            match &self.llm {
                Some(llm) => {
                    crate::proposer::propose_concepts(llm, doc, &self.branch_names, config, cancel)
                        .await
                }
                None => {
                    let mut out = ProposerOutput::default();
                    out.signals.push(skipped("concept_proposer"));
                    out
                }
            }
        };

        let doc_type_fut = async {
            match &self.llm {
                Some(llm) => {
                    let hypothesis =
                        crate::metadata::classify_document_type(llm, doc, config).await;
                    if hypothesis.is_none() {
                        (None, Some(QualitySignal {
                            stage: "document_type_classifier".to_string(),
                            reason: "classification failed".to_string(),
                            span_or_chunk: None,
                        }))
                    } else {
                        (hypothesis, None)
                    }
                }
                None => (None, Some(skipped("document_type_classifier"))),
            }
        };

        let (ruler_result, individual_result, property_result, proposer_out, (doc_type, dt_signal)) =
            tokio::join!(ruler_task, individual_task, property_task, proposer_fut, doc_type_fut);

        let mut extra_signals = Vec::new();
        if let Some(signal) = dt_signal {
            extra_signals.push(signal);
        }
        let ruler_matches = match ruler_result {
            Ok(matches) => matches,
            Err(e) => {
                extra_signals.push(QualitySignal {
                    stage: "ruler".to_string(),
                    reason: format!("task failure: {e}"),
                    span_or_chunk: None,
                });
                Vec::new()
            }
        };
        let individuals = match individual_result {
            Ok(individuals) => individuals,
            Err(e) => {
                extra_signals.push(QualitySignal {
                    stage: "individual_extraction".to_string(),
                    reason: format!("task failure: {e}"),
                    span_or_chunk: None,
                });
                Vec::new()
            }
        };
        let properties = match property_result {
            Ok(properties) => properties,
            Err(e) => {
                extra_signals.push(QualitySignal {
                    stage: "property_matcher".to_string(),
                    reason: format!("task failure: {e}"),
                    span_or_chunk: None,
                });
                Vec::new()
            }
        };

        {
            let mut j = job.write().await;
            j.result.quality_signals.extend(extra_signals);
            push_timing(&mut j, "discovery", started);
        }

        (ruler_matches, proposer_out, individuals, properties, doc_type)
    }

    /// Preserve whatever the cancelled run produced.
    async fn store_partial(
        &self,
        job: &Arc<RwLock<Job>>,
        annotations: Vec<ConceptMatch>,
        signals: Vec<QualitySignal>,
    ) {
        let mut j = job.write().await;
        if !annotations.is_empty() {
            j.result.annotations = annotations;
        }
        j.result.quality_signals.extend(signals);
        j.result.incomplete = true;
        j.touch();
    }
}

fn skipped(stage: &str) -> QualitySignal {
    QualitySignal {
        stage: stage.to_string(),
        reason: "language model unavailable".to_string(),
        span_or_chunk: None,
    }
}

async fn set_stage(job: &Arc<RwLock<Job>>, stage: &str) {
    let mut j = job.write().await;
    j.current_stage = Some(stage.to_string());
}

fn push_timing(job: &mut Job, stage: &str, started: Instant) {
    let millis = started.elapsed().as_millis() as u64;
    if millis > job.result.config.stage_soft_timeout_secs.saturating_mul(1000) {
        log::warn!("stage {stage} exceeded its soft timeout ({millis} ms)");
    }
    job.result.timings.push(StageTiming {
        stage: stage.to_string(),
        millis,
    });
}
