//! Annotation data model: spans, concept matches, individuals, object
//! properties, and triples.
//!
//! Everything downstream of normalization carries a [`Span`] into the
//! normalized text. Scores mutate only through the fusion rules; state
//! transitions happen only through the user-action API on the job; every
//! mutation appends a [`LineageEvent`]. Nothing is destroyed; rejection
//! marks state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::types::Confidence;

/// Half-open byte range `[start, end)` into the normalized text.
///
/// Normalized text is NFKC-normalized at ingestion, so byte offsets are
/// stable for every stage and every serialized artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Span {
    /// Start offset (inclusive).
    pub start: usize,
    /// End offset (exclusive).
    pub end: usize,
}

impl Span {
    /// Create a new span. Callers must uphold `start <= end`.
    #[must_use]
    pub fn new(start: usize, end: usize) -> Self {
        debug_assert!(start <= end, "span start {start} must be <= end {end}");
        Self { start, end }
    }

    /// Length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// True when the span is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// True when the two spans share at least one byte.
    #[must_use]
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// True when `self` fully encloses `other` and the two are not equal.
    #[must_use]
    pub fn contains_strictly(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end && self != other
    }

    /// Slice the given text by this span.
    #[must_use]
    pub fn slice<'a>(&self, text: &'a str) -> &'a str {
        &text[self.start..self.end]
    }
}

/// How a span was bound to its concept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    /// Matched the concept's preferred label.
    PreferredLabel,
    /// Matched one of the concept's alternative labels.
    AltLabel,
    /// Bound through embedding similarity.
    Semantic,
    /// Proposed by the language model.
    Llm,
    /// Produced by global occurrence expansion.
    Expanded,
}

/// Evidence source that contributed to an annotation.
///
/// `sources` fields are append-only multisets: the same source may appear
/// more than once when it contributed independently, and no stage ever
/// removes an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Deterministic label match.
    Ruler,
    /// Language-model proposal.
    Llm,
    /// Embedding similarity.
    Semantic,
    /// Global occurrence expansion.
    StringMatch,
}

/// Lifecycle state of an annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationState {
    /// Created by the pipeline, not yet validated.
    Preliminary,
    /// Validated by a judge stage or a user action.
    Confirmed,
    /// Marked rejected; kept for lineage, never destroyed.
    Rejected,
}

/// One entry in an annotation's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageEvent {
    /// When the mutation happened.
    pub timestamp: DateTime<Utc>,
    /// Pipeline stage or user action that caused it.
    pub stage: String,
    /// What happened: "created", "reranked", "branch_assigned",
    /// "promoted", "rejected", "restored", ...
    pub action: String,
    /// Value before the mutation, when meaningful.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<String>,
    /// Value after the mutation, when meaningful.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
    /// Free-text explanation.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

impl LineageEvent {
    /// Create a lineage event stamped with the current time.
    #[must_use]
    pub fn now(stage: &str, action: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            stage: stage.to_string(),
            action: action.to_string(),
            before: None,
            after: None,
            reason: String::new(),
        }
    }

    /// Attach a before/after value pair.
    #[must_use]
    pub fn with_change(mut self, before: impl Into<String>, after: impl Into<String>) -> Self {
        self.before = Some(before.into());
        self.after = Some(after.into());
        self
    }

    /// Attach a reason.
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }
}

/// A ranked backup candidate for a concept annotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptCandidate {
    /// Concept IRI.
    pub iri: String,
    /// Preferred label of the candidate.
    pub label: String,
    /// Composite ranking score.
    pub score: f64,
}

/// A span bound to an ontology concept with calibrated confidence and
/// ranked backup candidates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptMatch {
    /// Stable id, assigned at creation. Cross-references use ids, never
    /// positions.
    pub id: Uuid,
    /// Location in the normalized text.
    pub span: Span,
    /// The exact text at `span`.
    pub surface_text: String,
    /// The active concept IRI.
    pub concept_iri: String,
    /// Preferred label of the active concept.
    pub preferred_label: String,
    /// Ontology branches the active concept belongs to.
    pub branches: BTreeSet<String>,
    /// Branches the branch judge considered and set aside.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub backup_branches: BTreeSet<String>,
    /// How the span was bound.
    pub match_type: MatchType,
    /// Latest fused score.
    pub confidence: Confidence,
    /// Ranked runners-up, deduplicated by IRI.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backup_candidates: Vec<ConceptCandidate>,
    /// Evidence sources, append-only.
    pub sources: Vec<Source>,
    /// Lifecycle state.
    pub state: AnnotationState,
    /// Audit trail, append-only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lineage: Vec<LineageEvent>,
}

impl ConceptMatch {
    /// Create a preliminary annotation with a fresh id and a "created"
    /// lineage event.
    #[must_use]
    pub fn new(
        span: Span,
        surface_text: impl Into<String>,
        concept_iri: impl Into<String>,
        preferred_label: impl Into<String>,
        match_type: MatchType,
        confidence: Confidence,
        source: Source,
        stage: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            span,
            surface_text: surface_text.into(),
            concept_iri: concept_iri.into(),
            preferred_label: preferred_label.into(),
            branches: BTreeSet::new(),
            backup_branches: BTreeSet::new(),
            match_type,
            confidence,
            backup_candidates: Vec::new(),
            sources: vec![source],
            state: AnnotationState::Preliminary,
            lineage: vec![LineageEvent::now(stage, "created")],
        }
    }

    /// Append a source. Sources are a multiset and only ever grow.
    pub fn add_source(&mut self, source: Source) {
        self.sources.push(source);
    }

    /// True if any contributing source equals `source`.
    #[must_use]
    pub fn has_source(&self, source: Source) -> bool {
        self.sources.contains(&source)
    }

    /// Append a lineage event.
    pub fn record(&mut self, event: LineageEvent) {
        self.lineage.push(event);
    }

    /// Ordering key used whenever a stage hands off output.
    #[must_use]
    pub fn sort_key(&self) -> (usize, usize, &str) {
        (self.span.start, self.span.end, self.concept_iri.as_str())
    }
}

/// Type of an extracted OWL individual.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum IndividualType {
    Citation,
    Date,
    Money,
    Percent,
    Duration,
    Address,
    Phone,
    Email,
    Url,
    Statute,
    Court,
    CaseNumber,
    Org,
    Person,
    Gpe,
}

impl IndividualType {
    /// Label used in serialized artifacts and metadata grouping.
    #[must_use]
    pub fn as_label(&self) -> &'static str {
        match self {
            IndividualType::Citation => "citation",
            IndividualType::Date => "date",
            IndividualType::Money => "money",
            IndividualType::Percent => "percent",
            IndividualType::Duration => "duration",
            IndividualType::Address => "address",
            IndividualType::Phone => "phone",
            IndividualType::Email => "email",
            IndividualType::Url => "url",
            IndividualType::Statute => "statute",
            IndividualType::Court => "court",
            IndividualType::CaseNumber => "case_number",
            IndividualType::Org => "org",
            IndividualType::Person => "person",
            IndividualType::Gpe => "gpe",
        }
    }
}

/// An OWL-style named instance: a citation, party, date, amount, and so on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Individual {
    /// Stable id.
    pub id: Uuid,
    /// Location in the normalized text.
    pub span: Span,
    /// The exact text at `span`.
    pub surface_text: String,
    /// Typed category.
    pub individual_type: IndividualType,
    /// Canonical form, when one exists (ISO-8601 date, citation short form).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalized_form: Option<String>,
    /// External resolution URL, when one can be derived.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_url: Option<String>,
    /// Nearest class annotation, set by the individual linker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_concept_iri: Option<String>,
    /// Extraction confidence.
    pub confidence: Confidence,
    /// Evidence sources, append-only.
    pub sources: Vec<Source>,
    /// Audit trail.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lineage: Vec<LineageEvent>,
}

impl Individual {
    /// Append a lineage event.
    pub fn record(&mut self, event: LineageEvent) {
        self.lineage.push(event);
    }

    /// Ordering key used whenever a stage hands off output.
    #[must_use]
    pub fn sort_key(&self) -> (usize, usize, &'static str) {
        (self.span.start, self.span.end, self.individual_type.as_label())
    }
}

/// An occurrence of an OWL object property (a legal verb or relation) with
/// optional domain/range linkage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyAnnotation {
    /// Stable id.
    pub id: Uuid,
    /// Location in the normalized text.
    pub span: Span,
    /// The exact text at `span`.
    pub surface_text: String,
    /// Object-property IRI.
    pub property_iri: String,
    /// Preferred label of the property.
    pub preferred_label: String,
    /// Declared domain class IRIs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domain_classes: Vec<String>,
    /// Declared range class IRIs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub range_classes: Vec<String>,
    /// Inverse property, when declared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inverse_iri: Option<String>,
    /// Concept IRI filling the subject position, set by the linker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_subject_iri: Option<String>,
    /// Concept IRI filling the object position, set by the linker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_object_iri: Option<String>,
    /// Which label stratum matched.
    pub match_type: MatchType,
    /// Extraction confidence.
    pub confidence: Confidence,
    /// Evidence sources, append-only.
    pub sources: Vec<Source>,
    /// Audit trail.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lineage: Vec<LineageEvent>,
}

impl PropertyAnnotation {
    /// Append a lineage event.
    pub fn record(&mut self, event: LineageEvent) {
        self.lineage.push(event);
    }

    /// Ordering key used whenever a stage hands off output.
    #[must_use]
    pub fn sort_key(&self) -> (usize, usize, &str) {
        (self.span.start, self.span.end, self.property_iri.as_str())
    }
}

/// Predicate of a derived triple: a verb lemma, or a property IRI when the
/// verb matched a known object property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    /// Bare verb lemma.
    Lemma(String),
    /// Object-property IRI.
    Property(String),
}

impl Predicate {
    /// The textual value, IRI or lemma.
    #[must_use]
    pub fn value(&self) -> &str {
        match self {
            Predicate::Lemma(s) | Predicate::Property(s) => s.as_str(),
        }
    }
}

/// A subject–predicate–object triple derived from syntactic structure.
///
/// Subject and object reference concept annotations by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Triple {
    /// Id of the subject annotation.
    pub subject_id: Uuid,
    /// Predicate: verb lemma or property IRI.
    pub predicate: Predicate,
    /// Id of the object annotation.
    pub object_id: Uuid,
    /// The sentence span that evidences the triple.
    pub evidence_span: Span,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(start: usize, end: usize) -> Span {
        Span::new(start, end)
    }

    #[test]
    fn span_overlap_and_containment() {
        let outer = span(10, 30);
        let inner = span(12, 20);
        let crossing = span(25, 40);
        let disjoint = span(40, 50);

        assert!(outer.overlaps(&inner));
        assert!(outer.contains_strictly(&inner));
        assert!(!inner.contains_strictly(&outer));
        assert!(outer.overlaps(&crossing));
        assert!(!outer.contains_strictly(&crossing));
        assert!(!outer.overlaps(&disjoint));
        // A span does not strictly contain itself.
        assert!(!outer.contains_strictly(&outer));
    }

    #[test]
    fn sources_are_a_multiset() {
        let mut ann = ConceptMatch::new(
            span(0, 5),
            "claim",
            "https://folio.example/C1",
            "Claim",
            MatchType::PreferredLabel,
            Confidence::saturating(0.9),
            Source::Ruler,
            "ruler",
        );
        ann.add_source(Source::StringMatch);
        ann.add_source(Source::StringMatch);
        assert_eq!(ann.sources.len(), 3);
        assert!(ann.has_source(Source::Ruler));
        assert!(ann.has_source(Source::StringMatch));
    }

    #[test]
    fn new_annotation_has_created_lineage() {
        let ann = ConceptMatch::new(
            span(0, 5),
            "claim",
            "https://folio.example/C1",
            "Claim",
            MatchType::PreferredLabel,
            Confidence::saturating(0.9),
            Source::Ruler,
            "ruler",
        );
        assert_eq!(ann.lineage.len(), 1);
        assert_eq!(ann.lineage[0].action, "created");
        assert_eq!(ann.lineage[0].stage, "ruler");
        assert_eq!(ann.state, AnnotationState::Preliminary);
    }

    #[test]
    fn concept_match_serde_roundtrip() {
        let mut ann = ConceptMatch::new(
            span(3, 9),
            "motion",
            "https://folio.example/C2",
            "Motion",
            MatchType::AltLabel,
            Confidence::saturating(0.65),
            Source::Ruler,
            "ruler",
        );
        ann.branches.insert("Document".to_string());
        ann.backup_candidates.push(ConceptCandidate {
            iri: "https://folio.example/C3".to_string(),
            label: "Motion to Dismiss".to_string(),
            score: 0.5,
        });
        let json = serde_json::to_string(&ann).unwrap();
        let back: ConceptMatch = serde_json::from_str(&json).unwrap();
        assert_eq!(ann, back);
    }

    #[test]
    fn individual_type_labels_are_stable() {
        assert_eq!(IndividualType::CaseNumber.as_label(), "case_number");
        assert_eq!(IndividualType::Gpe.as_label(), "gpe");
    }
}
