//! Filesystem job persistence.
//!
//! One directory per job: `result.json` holds the serialized job, written
//! via a temporary file and an atomic rename so readers never observe a
//! torn write; `lineage.jsonl` accumulates line-delimited lineage events
//! appended by user actions.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::annotation::LineageEvent;
use crate::error::{Error, Result};
use crate::job::{Job, JobState};

/// Filesystem-backed job store.
pub struct JobStore {
    base_dir: PathBuf,
}

/// One line of the lineage log.
#[derive(Debug, Serialize)]
struct LineageLine<'a> {
    annotation_id: Uuid,
    #[serde(flatten)]
    event: &'a LineageEvent,
}

impl JobStore {
    /// Open (and create if needed) a store rooted at `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    fn job_dir(&self, job_id: Uuid) -> PathBuf {
        self.base_dir.join(job_id.to_string())
    }

    fn result_path(&self, job_id: Uuid) -> PathBuf {
        self.job_dir(job_id).join("result.json")
    }

    fn lineage_path(&self, job_id: Uuid) -> PathBuf {
        self.job_dir(job_id).join("lineage.jsonl")
    }

    /// Persist a job: serialize to a temporary file in the job directory,
    /// then rename over the final path.
    pub fn save(&self, job: &Job) -> Result<()> {
        let dir = self.job_dir(job.id);
        fs::create_dir_all(&dir)?;
        let data = serde_json::to_vec_pretty(job)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&data)?;
        tmp.persist(self.result_path(job.id))
            .map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    /// Load a job by id.
    pub fn load(&self, job_id: Uuid) -> Result<Job> {
        let path = self.result_path(job_id);
        if !path.exists() {
            return Err(Error::JobNotFound(job_id));
        }
        let data = fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Append lineage events for one annotation to the job's line-delimited
    /// log.
    pub fn append_lineage(
        &self,
        job_id: Uuid,
        annotation_id: Uuid,
        events: &[LineageEvent],
    ) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let dir = self.job_dir(job_id);
        fs::create_dir_all(&dir)?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.lineage_path(job_id))?;
        for event in events {
            let line = serde_json::to_string(&LineageLine {
                annotation_id,
                event,
            })?;
            writeln!(file, "{line}")?;
        }
        Ok(())
    }

    /// All stored job ids.
    pub fn list(&self) -> Result<Vec<Uuid>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Ok(id) = entry.file_name().to_string_lossy().parse::<Uuid>() {
                if self.result_path(id).exists() {
                    ids.push(id);
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Remove a job directory. Returns whether anything was deleted.
    pub fn delete(&self, job_id: Uuid) -> Result<bool> {
        let dir = self.job_dir(job_id);
        if dir.exists() {
            fs::remove_dir_all(dir)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Delete finished jobs whose last update is older than the retention
    /// window. Returns the number of jobs deleted.
    pub fn cleanup_expired(&self, retention_days: i64) -> Result<usize> {
        let cutoff: DateTime<Utc> = Utc::now() - Duration::days(retention_days);
        let mut deleted = 0;
        for id in self.list()? {
            let Ok(job) = self.load(id) else {
                continue;
            };
            if job.state.is_terminal() && job.updated_at < cutoff && self.delete(id)? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Count jobs still pending or running.
    pub fn count_active(&self) -> Result<usize> {
        let mut active = 0;
        for id in self.list()? {
            if let Ok(job) = self.load(id) {
                if !job.state.is_terminal() {
                    active += 1;
                }
            }
        }
        Ok(active)
    }

    /// Root directory of the store.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}
