//! Job model: the result envelope, lifecycle states, quality signals, and
//! the user-action API over annotations.
//!
//! The [`JobResult`] exclusively owns all annotations, individuals,
//! properties, and triples. Cross-references use stable ids. User actions
//! transition state deterministically and append lineage; nothing is ever
//! destroyed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::annotation::{
    AnnotationState, ConceptCandidate, ConceptMatch, Individual, LineageEvent, PropertyAnnotation,
    Triple,
};
use crate::config::EnrichConfig;
use crate::error::{Error, Result};
use crate::metadata::{AreaOfLaw, DocumentMetadata, DocumentTypeHypothesis};

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Accepted, not yet started.
    Pending,
    /// The pipeline is running.
    Running,
    /// Finished with no quality signals.
    Completed,
    /// Finished, but some stage degraded or was skipped.
    CompletedWithWarnings,
    /// Cooperatively cancelled; partial outputs preserved.
    Cancelled,
    /// A fatal error ended the job; whatever was persisted remains.
    Failed,
}

impl JobState {
    /// True once the job will no longer mutate through the pipeline.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Pending | JobState::Running)
    }
}

/// A degradation note: which stage, why, and where.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualitySignal {
    /// Stage that degraded or was skipped.
    pub stage: String,
    /// Human-readable reason.
    pub reason: String,
    /// Affected span or chunk, when the failure was localized.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_or_chunk: Option<String>,
}

/// Wall-clock duration of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTiming {
    /// Stage name.
    pub stage: String,
    /// Elapsed milliseconds.
    pub millis: u64,
}

/// Timestamped progress note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    /// When the note was appended.
    pub timestamp: DateTime<Utc>,
    /// Stage that produced it.
    pub stage: String,
    /// The note.
    pub message: String,
}

/// The result envelope a job produces.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobResult {
    /// SHA-256 of the canonical text.
    pub text_sha256: String,
    /// Concept annotations.
    pub annotations: Vec<ConceptMatch>,
    /// Extracted individuals.
    pub individuals: Vec<Individual>,
    /// Object-property occurrences.
    pub properties: Vec<PropertyAnnotation>,
    /// Derived subject–predicate–object triples.
    pub triples: Vec<Triple>,
    /// Synthesized document metadata.
    pub metadata: Option<DocumentMetadata>,
    /// Document-type hypothesis from the classifier.
    pub document_type: Option<DocumentTypeHypothesis>,
    /// Post-pipeline area-of-law assessment.
    pub areas_of_law: Vec<AreaOfLaw>,
    /// Degradation notes.
    pub quality_signals: Vec<QualitySignal>,
    /// Per-stage wall-clock timings.
    pub timings: Vec<StageTiming>,
    /// Progress notes.
    pub activity: Vec<ActivityEntry>,
    /// The configuration the job ran with.
    pub config: EnrichConfig,
    /// Set when cancellation or a hard timeout left the result partial.
    pub incomplete: bool,
}

impl JobResult {
    /// Find an annotation by id.
    #[must_use]
    pub fn annotation(&self, id: Uuid) -> Option<&ConceptMatch> {
        self.annotations.iter().find(|a| a.id == id)
    }

    fn annotation_mut(&mut self, id: Uuid) -> Result<&mut ConceptMatch> {
        self.annotations
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or(Error::AnnotationNotFound(id))
    }

    /// Replace the active IRI with the named backup; the displaced active
    /// concept becomes the top backup. Promoting the already-active IRI is
    /// a no-op, so the operation is idempotent.
    pub fn promote(&mut self, annotation_id: Uuid, backup_iri: &str) -> Result<()> {
        let ann = self.annotation_mut(annotation_id)?;
        if ann.concept_iri == backup_iri {
            return Ok(());
        }
        let position = ann
            .backup_candidates
            .iter()
            .position(|c| c.iri == backup_iri)
            .ok_or_else(|| {
                Error::input(format!("{backup_iri} is not a backup candidate"))
            })?;
        let chosen = ann.backup_candidates.remove(position);
        let displaced = ConceptCandidate {
            iri: ann.concept_iri.clone(),
            label: ann.preferred_label.clone(),
            score: ann.confidence.get(),
        };
        ann.backup_candidates.insert(0, displaced);
        let before = std::mem::replace(&mut ann.concept_iri, chosen.iri);
        ann.preferred_label = chosen.label;
        ann.state = AnnotationState::Confirmed;
        ann.record(
            LineageEvent::now("user_action", "promoted")
                .with_change(before, ann.concept_iri.clone()),
        );
        Ok(())
    }

    /// Mark an annotation rejected. The annotation is kept; only its state
    /// changes.
    pub fn reject(&mut self, annotation_id: Uuid, reason: &str) -> Result<()> {
        let ann = self.annotation_mut(annotation_id)?;
        let before = format!("{:?}", ann.state);
        ann.state = AnnotationState::Rejected;
        ann.record(
            LineageEvent::now("user_action", "rejected")
                .with_change(before, "Rejected")
                .with_reason(reason),
        );
        Ok(())
    }

    /// Restore a rejected annotation to confirmed. The earlier rejection
    /// stays in the lineage.
    pub fn restore(&mut self, annotation_id: Uuid) -> Result<()> {
        let ann = self.annotation_mut(annotation_id)?;
        let before = format!("{:?}", ann.state);
        ann.state = AnnotationState::Confirmed;
        ann.record(LineageEvent::now("user_action", "restored").with_change(before, "Confirmed"));
        Ok(())
    }

    /// Promote `iri` on every annotation that carries it as a backup,
    /// optionally restricted to the given annotation ids. Returns the
    /// number of annotations updated.
    pub fn cascade_promote(&mut self, iri: &str, only_ids: Option<&[Uuid]>) -> usize {
        let targets: Vec<Uuid> = self
            .annotations
            .iter()
            .filter(|a| {
                a.concept_iri != iri
                    && a.backup_candidates.iter().any(|c| c.iri == iri)
                    && only_ids.map_or(true, |ids| ids.contains(&a.id))
            })
            .map(|a| a.id)
            .collect();
        let mut updated = 0;
        for id in targets {
            if self.promote(id, iri).is_ok() {
                updated += 1;
            }
        }
        updated
    }

    /// Reject every annotation whose active concept is `iri`. Returns the
    /// number of annotations updated.
    pub fn bulk_reject(&mut self, iri: &str) -> usize {
        let targets: Vec<Uuid> = self
            .annotations
            .iter()
            .filter(|a| a.concept_iri == iri && a.state != AnnotationState::Rejected)
            .map(|a| a.id)
            .collect();
        let mut updated = 0;
        for id in targets {
            if self.reject(id, "bulk rejection by concept").is_ok() {
                updated += 1;
            }
        }
        updated
    }

    /// The audit trail of an annotation.
    pub fn lineage(&self, annotation_id: Uuid) -> Result<&[LineageEvent]> {
        self.annotation(annotation_id)
            .map(|a| a.lineage.as_slice())
            .ok_or(Error::AnnotationNotFound(annotation_id))
    }

    /// Append a progress note.
    pub fn log_activity(&mut self, stage: &str, message: impl Into<String>) {
        self.activity.push(ActivityEntry {
            timestamp: Utc::now(),
            stage: stage.to_string(),
            message: message.into(),
        });
    }

    /// Canonical JSON for byte-stable comparison: wall-clock noise
    /// (timings, activity timestamps, lineage timestamps) is zeroed and
    /// entity ids are renumbered in order of appearance, with triple
    /// references rewritten to match. Everything else is preserved.
    pub fn canonical_json(&self) -> Result<String> {
        let mut canonical = self.clone();
        canonical.timings.clear();
        for entry in &mut canonical.activity {
            entry.timestamp = DateTime::<Utc>::UNIX_EPOCH;
        }
        let scrub = |lineage: &mut Vec<LineageEvent>| {
            for event in lineage {
                event.timestamp = DateTime::<Utc>::UNIX_EPOCH;
            }
        };

        let mut id_map: std::collections::HashMap<Uuid, Uuid> = std::collections::HashMap::new();
        let mut next = 0u128;
        let mut renumber = |id: &mut Uuid, map: &mut std::collections::HashMap<Uuid, Uuid>| {
            let replacement = *map.entry(*id).or_insert_with(|| {
                next += 1;
                Uuid::from_u128(next)
            });
            *id = replacement;
        };

        for ann in &mut canonical.annotations {
            renumber(&mut ann.id, &mut id_map);
            scrub(&mut ann.lineage);
        }
        for ind in &mut canonical.individuals {
            renumber(&mut ind.id, &mut id_map);
            scrub(&mut ind.lineage);
        }
        for prop in &mut canonical.properties {
            renumber(&mut prop.id, &mut id_map);
            scrub(&mut prop.lineage);
        }
        for triple in &mut canonical.triples {
            if let Some(mapped) = id_map.get(&triple.subject_id) {
                triple.subject_id = *mapped;
            }
            if let Some(mapped) = id_map.get(&triple.object_id) {
                triple.object_id = *mapped;
            }
        }
        Ok(serde_json::to_string_pretty(&canonical)?)
    }
}

/// One enrichment job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Stable job id.
    pub id: Uuid,
    /// Lifecycle state.
    pub state: JobState,
    /// The stage currently executing, when running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// Fatal error, when the job failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The result envelope.
    pub result: JobResult,
}

impl Job {
    /// Create a pending job with an empty result.
    #[must_use]
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            state: JobState::Pending,
            current_stage: None,
            created_at: now,
            updated_at: now,
            error: None,
            result: JobResult::default(),
        }
    }

    /// Update the mutation timestamp.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

impl Default for Job {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::{MatchType, Source, Span};
    use crate::types::Confidence;

    fn annotation_with_backup(primary: &str, backup: &str) -> ConceptMatch {
        let mut ann = ConceptMatch::new(
            Span::new(0, 8),
            "contract",
            primary,
            "Contract",
            MatchType::PreferredLabel,
            Confidence::saturating(0.9),
            Source::Ruler,
            "resolver",
        );
        ann.backup_candidates.push(ConceptCandidate {
            iri: backup.to_string(),
            label: "Agreement".to_string(),
            score: 0.7,
        });
        ann
    }

    fn result_with(anns: Vec<ConceptMatch>) -> JobResult {
        JobResult {
            annotations: anns,
            ..JobResult::default()
        }
    }

    #[test]
    fn promote_swaps_active_and_backup() {
        let ann = annotation_with_backup("ex:old", "ex:new");
        let id = ann.id;
        let mut result = result_with(vec![ann]);

        result.promote(id, "ex:new").unwrap();
        let ann = result.annotation(id).unwrap();
        assert_eq!(ann.concept_iri, "ex:new");
        assert_eq!(ann.preferred_label, "Agreement");
        assert_eq!(ann.backup_candidates[0].iri, "ex:old");
        assert_eq!(ann.state, AnnotationState::Confirmed);
        assert!(ann.lineage.iter().any(|e| e.action == "promoted"));
    }

    #[test]
    fn promote_is_idempotent() {
        let ann = annotation_with_backup("ex:old", "ex:new");
        let id = ann.id;
        let mut result = result_with(vec![ann]);

        result.promote(id, "ex:new").unwrap();
        let events_after_first = result.annotation(id).unwrap().lineage.len();
        result.promote(id, "ex:new").unwrap();
        let ann = result.annotation(id).unwrap();
        assert_eq!(ann.concept_iri, "ex:new");
        // The second promote changed nothing and logged nothing.
        assert_eq!(ann.lineage.len(), events_after_first);
    }

    #[test]
    fn promote_unknown_backup_fails() {
        let ann = annotation_with_backup("ex:old", "ex:new");
        let id = ann.id;
        let mut result = result_with(vec![ann]);
        assert!(result.promote(id, "ex:absent").is_err());
    }

    #[test]
    fn reject_then_restore_then_reject() {
        let ann = annotation_with_backup("ex:old", "ex:new");
        let id = ann.id;
        let mut result = result_with(vec![ann]);

        result.reject(id, "wrong sense").unwrap();
        assert_eq!(result.annotation(id).unwrap().state, AnnotationState::Rejected);

        result.restore(id).unwrap();
        assert_eq!(result.annotation(id).unwrap().state, AnnotationState::Confirmed);

        result.reject(id, "still wrong").unwrap();
        assert_eq!(result.annotation(id).unwrap().state, AnnotationState::Rejected);

        // The full history is retained.
        let lineage = result.lineage(id).unwrap();
        let actions: Vec<&str> = lineage.iter().map(|e| e.action.as_str()).collect();
        assert!(actions.contains(&"rejected"));
        assert!(actions.contains(&"restored"));
    }

    #[test]
    fn cascade_promote_updates_matching_annotations() {
        let a = annotation_with_backup("ex:old", "ex:new");
        let b = annotation_with_backup("ex:old", "ex:new");
        let c = annotation_with_backup("ex:other", "ex:unrelated");
        let (a_id, b_id) = (a.id, b.id);
        let mut result = result_with(vec![a, b, c]);

        let updated = result.cascade_promote("ex:new", None);
        assert_eq!(updated, 2);
        assert_eq!(result.annotation(a_id).unwrap().concept_iri, "ex:new");
        assert_eq!(result.annotation(b_id).unwrap().concept_iri, "ex:new");
    }

    #[test]
    fn cascade_promote_respects_id_filter() {
        let a = annotation_with_backup("ex:old", "ex:new");
        let b = annotation_with_backup("ex:old", "ex:new");
        let (a_id, b_id) = (a.id, b.id);
        let mut result = result_with(vec![a, b]);

        let updated = result.cascade_promote("ex:new", Some(&[a_id]));
        assert_eq!(updated, 1);
        assert_eq!(result.annotation(a_id).unwrap().concept_iri, "ex:new");
        assert_eq!(result.annotation(b_id).unwrap().concept_iri, "ex:old");
    }

    #[test]
    fn bulk_reject_by_concept() {
        let a = annotation_with_backup("ex:bad", "ex:new");
        let b = annotation_with_backup("ex:bad", "ex:new");
        let c = annotation_with_backup("ex:good", "ex:new");
        let c_id = c.id;
        let mut result = result_with(vec![a, b, c]);

        let updated = result.bulk_reject("ex:bad");
        assert_eq!(updated, 2);
        assert_eq!(
            result.annotation(c_id).unwrap().state,
            AnnotationState::Preliminary
        );
    }

    #[test]
    fn result_roundtrips_through_json() {
        let ann = annotation_with_backup("ex:a", "ex:b");
        let mut result = result_with(vec![ann]);
        result.text_sha256 = "abc".to_string();
        result.quality_signals.push(QualitySignal {
            stage: "ruler".to_string(),
            reason: "example".to_string(),
            span_or_chunk: None,
        });

        let json = serde_json::to_string(&result).unwrap();
        let back: JobResult = serde_json::from_str(&json).unwrap();
        assert_eq!(result, back);
    }

    #[test]
    fn canonical_json_is_stable_across_timestamp_noise() {
        let ann = annotation_with_backup("ex:a", "ex:b");
        let mut r1 = result_with(vec![ann.clone()]);
        let mut r2 = result_with(vec![ann]);
        r1.log_activity("ruler", "note");
        std::thread::sleep(std::time::Duration::from_millis(2));
        r2.log_activity("ruler", "note");
        r1.timings.push(StageTiming {
            stage: "ruler".to_string(),
            millis: 12,
        });
        r2.timings.push(StageTiming {
            stage: "ruler".to_string(),
            millis: 99,
        });

        assert_eq!(r1.canonical_json().unwrap(), r2.canonical_json().unwrap());
    }
}
