//! Object-property matching and domain/range linking.
//!
//! The matcher scans for OWL object-property labels (legal verbs and
//! relations) with the same containment-aware overlap policy as concept
//! expansion. The linker then binds each property occurrence to the
//! nearest concept annotations in its sentence, preferring candidates
//! whose concept is an ontology descendant of the property's declared
//! domain/range; a language model, when available, validates or overrides
//! the heuristic.

use once_cell::sync::Lazy;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::annotation::{
    AnnotationState, ConceptMatch, LineageEvent, MatchType, PropertyAnnotation, Source, Span,
};
use crate::config::EnrichConfig;
use crate::document::CanonicalText;
use crate::job::QualitySignal;
use crate::llm::{structured_with_retry, LanguageModel, LlmBudget};
use crate::matching::{resolve_overlaps, MultiPatternMatcher, SpanKeyed};
use crate::ontology::{LabelStratum, ObjectProperty, Ontology};
use crate::pipeline::CancelFlag;
use crate::prompts;
use crate::types::Confidence;

/// Words too common to serve as property patterns. Most single-word legal
/// verbs ("denied", "granted", "reversed") stay in.
static PROPERTY_STOPWORDS: Lazy<HashSet<&'static str>> =
    Lazy::new(|| ["not", "and", "near", "equal", "can", "has", "have", "had", "or"].into_iter().collect());

const PREFERRED_CONFIDENCE: f64 = 0.85;
const ALT_CONFIDENCE: f64 = 0.75;
const MULTIWORD_BONUS: f64 = 0.05;

#[derive(Debug, Clone)]
struct PropertyPattern {
    iri: String,
    label: String,
    stratum: LabelStratum,
    multiword: bool,
}

/// Deterministic multi-pattern matcher over object-property labels.
/// Built once at startup and shared read-only across jobs.
pub struct PropertyMatcher {
    matcher: Option<MultiPatternMatcher<PropertyPattern>>,
}

impl PropertyMatcher {
    /// Build the automaton from every usable property label.
    #[must_use]
    pub fn from_ontology(ontology: &dyn Ontology, config: &EnrichConfig) -> Self {
        let mut pairs = Vec::new();
        for prop in ontology.object_properties() {
            let mut add = |label: &str, stratum: LabelStratum| {
                let folded = crate::normalize::normalize_surface(label);
                if folded.chars().count() < config.min_pattern_chars {
                    return;
                }
                if PROPERTY_STOPWORDS.contains(folded.as_str()) {
                    return;
                }
                pairs.push((
                    folded.clone(),
                    PropertyPattern {
                        iri: prop.iri.clone(),
                        label: label.to_string(),
                        stratum,
                        multiword: folded.contains(' '),
                    },
                ));
            };
            add(&prop.preferred_label, LabelStratum::Preferred);
            for alt in &prop.alt_labels {
                add(alt, LabelStratum::Alternative);
            }
        }
        log::info!("property matcher built with {} patterns", pairs.len());
        Self {
            matcher: MultiPatternMatcher::build(pairs),
        }
    }

    /// Number of patterns in the automaton.
    #[must_use]
    pub fn pattern_count(&self) -> usize {
        self.matcher.as_ref().map_or(0, MultiPatternMatcher::pattern_count)
    }

    /// Scan the text for property occurrences, ordered by
    /// `(start, end, iri)`.
    #[must_use]
    pub fn scan(
        &self,
        text: &str,
        ontology: &dyn Ontology,
        config: &EnrichConfig,
    ) -> Vec<PropertyAnnotation> {
        let Some(matcher) = &self.matcher else {
            return Vec::new();
        };

        struct Hit<'a> {
            span: Span,
            pattern: &'a PropertyPattern,
        }
        impl SpanKeyed for Hit<'_> {
            fn span(&self) -> Span {
                self.span
            }
            fn key(&self) -> &str {
                &self.pattern.iri
            }
        }

        let raw: Vec<Hit<'_>> = matcher
            .scan(text, config)
            .into_iter()
            .map(|m| Hit {
                span: m.span,
                pattern: matcher.value(m.pattern),
            })
            .collect();
        let resolved = resolve_overlaps(raw, |_, _| {});

        let mut out: Vec<PropertyAnnotation> = resolved
            .into_iter()
            .map(|hit| {
                let p = hit.pattern;
                let base = match p.stratum {
                    LabelStratum::Preferred => PREFERRED_CONFIDENCE,
                    LabelStratum::Alternative => ALT_CONFIDENCE,
                };
                let confidence = if p.multiword { base + MULTIWORD_BONUS } else { base };
                let declared = ontology
                    .object_properties()
                    .find(|op| op.iri == p.iri)
                    .cloned();
                let (domain, range, inverse, preferred_label) = match declared {
                    Some(op) => (op.domain_iris, op.range_iris, op.inverse_iri, op.preferred_label),
                    None => (Vec::new(), Vec::new(), None, p.label.clone()),
                };
                PropertyAnnotation {
                    id: Uuid::new_v4(),
                    span: hit.span,
                    surface_text: hit.span.slice(text).to_string(),
                    property_iri: p.iri.clone(),
                    preferred_label,
                    domain_classes: domain,
                    range_classes: range,
                    inverse_iri: inverse,
                    linked_subject_iri: None,
                    linked_object_iri: None,
                    match_type: match p.stratum {
                        LabelStratum::Preferred => MatchType::PreferredLabel,
                        LabelStratum::Alternative => MatchType::AltLabel,
                    },
                    confidence: Confidence::saturating(confidence),
                    sources: vec![Source::Ruler],
                    lineage: vec![
                        LineageEvent::now("property_matcher", "created")
                            .with_reason(format!("matched label '{}'", p.label)),
                    ],
                }
            })
            .collect();
        out.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        out
    }
}

/// Candidate concept annotations around a property, within one sentence.
fn sentence_neighbors<'a>(
    property: &PropertyAnnotation,
    annotations: &'a [ConceptMatch],
    doc: &CanonicalText,
) -> (Vec<&'a ConceptMatch>, Vec<&'a ConceptMatch>) {
    let sentence = doc
        .sentences
        .sentence_of(&property.span)
        .and_then(|i| doc.sentences.span(i))
        .unwrap_or(Span::new(0, doc.text.len()));

    let in_sentence: Vec<&ConceptMatch> = annotations
        .iter()
        .filter(|a| {
            a.state != AnnotationState::Rejected
                && a.span.start >= sentence.start
                && a.span.end <= sentence.end
        })
        .collect();

    let mut preceding: Vec<&ConceptMatch> = in_sentence
        .iter()
        .copied()
        .filter(|a| a.span.end <= property.span.start)
        .collect();
    preceding.sort_by_key(|a| a.span.end);
    let mut following: Vec<&ConceptMatch> = in_sentence
        .iter()
        .copied()
        .filter(|a| a.span.start >= property.span.end)
        .collect();
    following.sort_by_key(|a| a.span.start);
    (preceding, following)
}

fn pick_linked(
    candidates: &[&ConceptMatch],
    allowed: &[String],
    ontology: &dyn Ontology,
    nearest_last: bool,
) -> Option<String> {
    let conforms = |c: &ConceptMatch| {
        allowed.is_empty()
            || allowed
                .iter()
                .any(|a| ontology.is_descendant(&c.concept_iri, a))
    };
    let ordered: Vec<&&ConceptMatch> = if nearest_last {
        candidates.iter().rev().collect()
    } else {
        candidates.iter().collect()
    };
    ordered
        .iter()
        .find(|c| conforms(c))
        .or_else(|| ordered.first())
        .map(|c| c.concept_iri.clone())
}

/// Link every property to subject and object concepts.
///
/// The heuristic takes the nearest preceding annotation as subject and the
/// nearest following one as object, preferring candidates that are
/// ontology descendants of the property's declared domain/range. When a
/// language model is available it validates or overrides the choice.
pub async fn link_properties(
    llm: Option<&Arc<dyn LanguageModel>>,
    properties: &mut [PropertyAnnotation],
    annotations: &[ConceptMatch],
    doc: &CanonicalText,
    ontology: &dyn Ontology,
    config: &EnrichConfig,
    cancel: &CancelFlag,
    signals: &mut Vec<QualitySignal>,
) {
    // Heuristic pass.
    for property in properties.iter_mut() {
        if cancel.is_cancelled() {
            return;
        }
        let (preceding, following) = sentence_neighbors(property, annotations, doc);
        property.linked_subject_iri =
            pick_linked(&preceding, &property.domain_classes, ontology, true);
        property.linked_object_iri =
            pick_linked(&following, &property.range_classes, ontology, false);
        if property.linked_subject_iri.is_some() || property.linked_object_iri.is_some() {
            property.record(
                LineageEvent::now("property_linker", "linked")
                    .with_reason("nearest in-sentence concepts"),
            );
        }
    }

    // Optional language-model validation.
    let Some(llm) = llm else {
        return;
    };
    let semaphore = Arc::new(Semaphore::new(config.llm_concurrency.max(1)));
    let budget = LlmBudget::with_timeout(config.llm_call_timeout());
    let schema = prompts::property_link_schema();

    let mut tasks = Vec::new();
    for (idx, property) in properties.iter().enumerate() {
        if cancel.is_cancelled() {
            break;
        }
        let (preceding, following) = sentence_neighbors(property, annotations, doc);
        if preceding.is_empty() && following.is_empty() {
            continue;
        }
        let sentence = doc
            .sentences
            .sentence_of(&property.span)
            .and_then(|i| doc.sentences.span(i))
            .map_or_else(String::new, |s| s.slice(&doc.text).to_string());
        let subjects: Vec<String> = preceding.iter().map(|c| c.concept_iri.clone()).collect();
        let objects: Vec<String> = following.iter().map(|c| c.concept_iri.clone()).collect();
        let prompt =
            prompts::property_link(&property.preferred_label, &sentence, &subjects, &objects);

        let llm = Arc::clone(llm);
        let sem = Arc::clone(&semaphore);
        let schema = schema.clone();
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            let _permit = sem.acquire().await;
            if cancel.is_cancelled() {
                return (idx, None);
            }
            match structured_with_retry(llm.as_ref(), &prompt, &schema, &budget).await {
                Ok(value) => (idx, Some(value)),
                Err(e) => {
                    log::warn!("property link call failed: {e}");
                    (idx, None)
                }
            }
        }));
    }

    let mut failed = 0usize;
    for outcome in futures::future::join_all(tasks).await {
        let Ok((idx, maybe_value)) = outcome else {
            failed += 1;
            continue;
        };
        let Some(value) = maybe_value else {
            failed += 1;
            continue;
        };
        apply_llm_link(&mut properties[idx], &value, annotations);
    }
    if failed > 0 {
        signals.push(QualitySignal {
            stage: "property_linker".to_string(),
            reason: format!("{failed} link validations failed"),
            span_or_chunk: None,
        });
    }
}

fn apply_llm_link(property: &mut PropertyAnnotation, value: &Value, annotations: &[ConceptMatch]) {
    let known = |iri: &str| annotations.iter().any(|a| a.concept_iri == iri);
    let get = |field: &str| {
        value
            .get(field)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty() && known(s))
            .map(str::to_string)
    };
    let subject = get("subject_iri");
    let object = get("object_iri");
    if subject.is_none() && object.is_none() {
        return;
    }
    if let Some(s) = subject {
        if property.linked_subject_iri.as_deref() != Some(s.as_str()) {
            property.record(
                LineageEvent::now("property_linker", "relinked")
                    .with_change(
                        property.linked_subject_iri.clone().unwrap_or_default(),
                        s.clone(),
                    )
                    .with_reason("model override of subject"),
            );
        }
        property.linked_subject_iri = Some(s);
    }
    if let Some(o) = object {
        if property.linked_object_iri.as_deref() != Some(o.as_str()) {
            property.record(
                LineageEvent::now("property_linker", "relinked")
                    .with_change(
                        property.linked_object_iri.clone().unwrap_or_default(),
                        o.clone(),
                    )
                    .with_reason("model override of object"),
            );
        }
        property.linked_object_iri = Some(o);
    }
}
