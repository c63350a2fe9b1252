//! Pipeline configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Configuration recognized by the enrichment core.
///
/// Every job carries the configuration it ran with inside its
/// [`JobResult`](crate::job::JobResult), so results are reproducible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichConfig {
    /// Maximum accepted upload size in bytes.
    pub max_upload_bytes: usize,

    /// Maximum characters per chunk handed to the concept proposer.
    pub max_chunk_chars: usize,

    /// Overlap between consecutive chunks, in characters.
    pub chunk_overlap_chars: usize,

    /// Cosine-similarity threshold above which embedding triage resolves a
    /// branch conflict on its own (`T_conflict`).
    pub semantic_similarity_threshold: f64,

    /// Minimum gap between the best and second-best triage candidate for
    /// the best to count as agreement.
    pub triage_margin: f64,

    /// Discoveries found only by the ruler are dropped below this
    /// confidence. Filters single-word alt-label noise while keeping
    /// preferred labels and multi-word matches.
    pub ruler_only_min_confidence: f64,

    /// Confidence scale applied to expanded occurrences that matched an
    /// alternative label rather than the preferred one. A calibration
    /// choice; exposed so it can be measured and tuned.
    pub alt_label_expansion_scale: f64,

    /// Number of backup candidates retained per resolved annotation.
    pub max_candidates: usize,

    /// Labels shorter than this (after folding) are never used as patterns.
    pub min_pattern_chars: usize,

    /// Characters treated as word characters in addition to alphanumerics
    /// and underscore when validating match boundaries. Hyphen is included
    /// so that "e-discovery" does not yield a match for "discovery".
    pub boundary_extra_chars: Vec<char>,

    /// Maximum concurrent language-model calls per stage.
    pub llm_concurrency: usize,

    /// Maximum concurrently running jobs in the service.
    pub max_concurrent_jobs: usize,

    /// Days a finished job is retained by the store.
    pub job_retention_days: i64,

    /// Per language-model call timeout, in seconds.
    pub llm_call_timeout_secs: u64,

    /// Soft per-stage timeout, in seconds. Exceeding it is logged.
    pub stage_soft_timeout_secs: u64,

    /// Hard per-stage timeout, in seconds. Exceeding it abandons the stage.
    pub stage_hard_timeout_secs: u64,

    /// Hard per-job timeout, in seconds. Exceeding it terminates the job
    /// with partial outputs preserved.
    pub job_hard_timeout_secs: u64,

    /// Whether the contextual rerank stage runs at all.
    pub rerank_enabled: bool,

    /// Post-blend scores below this mark the annotation rejected.
    pub rerank_reject_below: f64,

    /// Whether rule-based individual extraction runs.
    pub individual_extraction_enabled: bool,

    /// Whether object-property matching runs.
    pub property_extraction_enabled: bool,

    /// Per-task language-model selection keys, passed through to the host
    /// application's provider registry. The core never interprets these.
    pub task_models: BTreeMap<String, String>,
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: 50 * 1024 * 1024,
            max_chunk_chars: 3000,
            chunk_overlap_chars: 200,
            semantic_similarity_threshold: 0.80,
            triage_margin: 0.05,
            ruler_only_min_confidence: 0.60,
            alt_label_expansion_scale: 0.95,
            max_candidates: 5,
            min_pattern_chars: 3,
            boundary_extra_chars: vec!['-', '_'],
            llm_concurrency: 8,
            max_concurrent_jobs: 10,
            job_retention_days: 30,
            llm_call_timeout_secs: 60,
            stage_soft_timeout_secs: 600,
            stage_hard_timeout_secs: 1200,
            job_hard_timeout_secs: 3600,
            rerank_enabled: true,
            rerank_reject_below: 0.40,
            individual_extraction_enabled: true,
            property_extraction_enabled: true,
            task_models: BTreeMap::new(),
        }
    }
}

impl EnrichConfig {
    /// Per language-model call timeout as a [`Duration`].
    #[must_use]
    pub fn llm_call_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_call_timeout_secs)
    }

    /// Hard per-stage timeout as a [`Duration`].
    #[must_use]
    pub fn stage_hard_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_hard_timeout_secs)
    }

    /// Hard per-job timeout as a [`Duration`].
    #[must_use]
    pub fn job_hard_timeout(&self) -> Duration {
        Duration::from_secs(self.job_hard_timeout_secs)
    }

    /// True if `c` counts as a word character for boundary validation.
    #[must_use]
    pub fn is_word_char(&self, c: char) -> bool {
        c.is_alphanumeric() || c == '_' || self.boundary_extra_chars.contains(&c)
    }
}
