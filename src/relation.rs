//! Subject–predicate–object extraction from syntactic structure.
//!
//! A sentence yields triples when it carries at least two concept
//! annotations and a verbal predicate between them. The parse is shallow:
//! a legal-verb lexicon with inflection folding finds the predicate, the
//! nearest concept annotation ending before it is the subject, and the
//! nearest one starting after it is the object. When the verb's lemma
//! matches a known object-property label the triple carries the property
//! IRI; otherwise it carries the bare lemma. No model calls.

use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};

use crate::annotation::{AnnotationState, ConceptMatch, Predicate, Span, Triple};
use crate::document::CanonicalText;
use crate::ontology::Ontology;

/// Lemmas that count as verbal predicates in legal prose.
static VERB_LEMMAS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "affirm", "agree", "allege", "appeal", "argue", "award", "breach", "claim", "contend",
        "deny", "dismiss", "enforce", "enter", "execute", "file", "find", "grant", "hold",
        "indemnify", "issue", "move", "order", "overrule", "owe", "pay", "remand", "request",
        "reverse", "rule", "seek", "settle", "sign", "sue", "sustain", "terminate", "vacate",
        "violate", "waive",
    ]
    .into_iter()
    .collect()
});

/// Irregular past forms the suffix rules cannot reach.
static IRREGULAR: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    [
        ("held", "hold"),
        ("found", "find"),
        ("sought", "seek"),
        ("paid", "pay"),
        ("sued", "sue"),
        ("owed", "owe"),
    ]
    .into_iter()
    .collect()
});

/// Reduce an inflected verb form to its lemma, returning `None` when the
/// result is not a known verb.
#[must_use]
pub fn verb_lemma(word: &str) -> Option<&'static str> {
    let lowered = word.to_lowercase();
    if let Some(lemma) = IRREGULAR.get(lowered.as_str()) {
        return Some(lemma);
    }
    let find = |candidate: &str| VERB_LEMMAS.get(candidate).copied();

    if let Some(lemma) = find(&lowered) {
        return Some(lemma);
    }
    for (suffix, replacement) in [("ied", "y"), ("ies", "y")] {
        if let Some(stem) = lowered.strip_suffix(suffix) {
            let candidate = format!("{stem}{replacement}");
            if let Some(lemma) = find(&candidate) {
                return Some(lemma);
            }
        }
    }
    for suffix in ["ing", "ed", "es", "s"] {
        if let Some(stem) = lowered.strip_suffix(suffix) {
            if let Some(lemma) = find(stem) {
                return Some(lemma);
            }
            // Dropped final "e": filing -> file, executed -> execute.
            let with_e = format!("{stem}e");
            if let Some(lemma) = find(&with_e) {
                return Some(lemma);
            }
        }
    }
    None
}

fn word_spans(text: &str, base: usize) -> Vec<(Span, &str)> {
    let mut out = Vec::new();
    let mut start = None;
    for (i, c) in text.char_indices() {
        if c.is_alphabetic() {
            if start.is_none() {
                start = Some(i);
            }
        } else if let Some(s) = start.take() {
            out.push((Span::new(base + s, base + i), &text[s..i]));
        }
    }
    if let Some(s) = start {
        out.push((Span::new(base + s, base + text.len()), &text[s..]));
    }
    out
}

/// Extract SPO triples from every qualifying sentence.
///
/// Output is deduplicated by `(subject, predicate, object)` and ordered by
/// evidence span.
#[must_use]
pub fn extract_triples(
    doc: &CanonicalText,
    annotations: &[ConceptMatch],
    ontology: &dyn Ontology,
) -> Vec<Triple> {
    // Folded property labels, for promoting lemmas to property IRIs.
    let mut property_labels: HashMap<String, String> = HashMap::new();
    for prop in ontology.object_properties() {
        property_labels
            .entry(crate::normalize::normalize_surface(&prop.preferred_label))
            .or_insert_with(|| prop.iri.clone());
        for alt in &prop.alt_labels {
            property_labels
                .entry(crate::normalize::normalize_surface(alt))
                .or_insert_with(|| prop.iri.clone());
        }
    }

    let mut triples = Vec::new();
    let mut seen: HashSet<(uuid::Uuid, String, uuid::Uuid)> = HashSet::new();

    for sentence in doc.sentences.spans() {
        let in_sentence: Vec<&ConceptMatch> = annotations
            .iter()
            .filter(|a| {
                a.state != AnnotationState::Rejected
                    && a.span.start >= sentence.start
                    && a.span.end <= sentence.end
            })
            .collect();
        if in_sentence.len() < 2 {
            continue;
        }

        let sentence_text = sentence.slice(&doc.text);
        for (word_span, word) in word_spans(sentence_text, sentence.start) {
            // Skip words inside a concept annotation; those are arguments,
            // not predicates.
            if in_sentence.iter().any(|a| a.span.overlaps(&word_span)) {
                continue;
            }
            let Some(lemma) = verb_lemma(word) else {
                continue;
            };

            let subject = in_sentence
                .iter()
                .filter(|a| a.span.end <= word_span.start)
                .max_by_key(|a| (a.span.end, std::cmp::Reverse(a.span.start)));
            let object = in_sentence
                .iter()
                .filter(|a| a.span.start >= word_span.end)
                .min_by_key(|a| (a.span.start, a.span.end));
            let (Some(subject), Some(object)) = (subject, object) else {
                continue;
            };

            let predicate = match property_labels.get(lemma) {
                Some(iri) => Predicate::Property(iri.clone()),
                None => Predicate::Lemma(lemma.to_string()),
            };
            if seen.insert((subject.id, predicate.value().to_string(), object.id)) {
                triples.push(Triple {
                    subject_id: subject.id,
                    predicate,
                    object_id: object.id,
                    evidence_span: *sentence,
                });
            }
        }
    }

    triples.sort_by_key(|t| (t.evidence_span, t.predicate.value().to_string()));
    triples
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::{MatchType, Source};
    use crate::config::EnrichConfig;
    use crate::document::DocumentInput;
    use crate::normalize::normalize;
    use crate::ontology::{InMemoryOntology, ObjectProperty};
    use crate::types::Confidence;

    fn concept(surface: &str, span: Span, iri: &str) -> ConceptMatch {
        ConceptMatch::new(
            span,
            surface,
            iri,
            surface,
            MatchType::PreferredLabel,
            Confidence::saturating(0.8),
            Source::Ruler,
            "resolver",
        )
    }

    fn doc(text: &str) -> CanonicalText {
        normalize(&DocumentInput::text(text), &EnrichConfig::default()).unwrap()
    }

    #[test]
    fn lemma_folding() {
        assert_eq!(verb_lemma("denied"), Some("deny"));
        assert_eq!(verb_lemma("denies"), Some("deny"));
        assert_eq!(verb_lemma("granted"), Some("grant"));
        assert_eq!(verb_lemma("filing"), Some("file"));
        assert_eq!(verb_lemma("executed"), Some("execute"));
        assert_eq!(verb_lemma("held"), Some("hold"));
        assert_eq!(verb_lemma("table"), None);
    }

    #[test]
    fn court_denied_the_motion() {
        let doc = doc("The Court denied the motion.");
        let ont = InMemoryOntology::new(Vec::new(), Vec::new());
        let court = concept("Court", Span::new(4, 9), "ex:court");
        let motion = concept("motion", Span::new(21, 27), "ex:motion");
        let (court_id, motion_id) = (court.id, motion.id);

        let triples = extract_triples(&doc, &[court, motion], &ont);
        assert_eq!(triples.len(), 1);
        let t = &triples[0];
        assert_eq!(t.subject_id, court_id);
        assert_eq!(t.object_id, motion_id);
        assert_eq!(t.predicate, Predicate::Lemma("deny".to_string()));
    }

    #[test]
    fn known_property_label_promotes_predicate() {
        let doc = doc("The Court denied the motion.");
        let ont = InMemoryOntology::new(
            Vec::new(),
            vec![ObjectProperty {
                iri: "ex:denies".to_string(),
                preferred_label: "deny".to_string(),
                alt_labels: Vec::new(),
                domain_iris: Vec::new(),
                range_iris: Vec::new(),
                inverse_iri: None,
                definition: None,
            }],
        );
        let court = concept("Court", Span::new(4, 9), "ex:court");
        let motion = concept("motion", Span::new(21, 27), "ex:motion");

        let triples = extract_triples(&doc, &[court, motion], &ont);
        assert_eq!(triples.len(), 1);
        assert_eq!(
            triples[0].predicate,
            Predicate::Property("ex:denies".to_string())
        );
    }

    #[test]
    fn single_concept_sentences_yield_nothing() {
        let doc = doc("The Court adjourned early.");
        let ont = InMemoryOntology::new(Vec::new(), Vec::new());
        let court = concept("Court", Span::new(4, 9), "ex:court");
        assert!(extract_triples(&doc, &[court], &ont).is_empty());
    }

    #[test]
    fn rejected_annotations_do_not_participate() {
        let doc = doc("The Court denied the motion.");
        let ont = InMemoryOntology::new(Vec::new(), Vec::new());
        let court = concept("Court", Span::new(4, 9), "ex:court");
        let mut motion = concept("motion", Span::new(21, 27), "ex:motion");
        motion.state = AnnotationState::Rejected;
        assert!(extract_triples(&doc, &[court, motion], &ont).is_empty());
    }

    #[test]
    fn verbless_sentences_yield_nothing() {
        let doc = doc("The contract and the lease.");
        let ont = InMemoryOntology::new(Vec::new(), Vec::new());
        let a = concept("contract", Span::new(4, 12), "ex:c");
        let b = concept("lease", Span::new(21, 26), "ex:l");
        assert!(extract_triples(&doc, &[a, b], &ont).is_empty());
    }

    #[test]
    fn multiple_sentences_multiple_triples() {
        let text = "The Court granted the injunction. The tenant breached the lease.";
        let doc = doc(text);
        let ont = InMemoryOntology::new(Vec::new(), Vec::new());
        let anns = vec![
            concept("Court", Span::new(4, 9), "ex:court"),
            concept("injunction", Span::new(22, 32), "ex:inj"),
            concept("tenant", Span::new(38, 44), "ex:tenant"),
            concept("lease", Span::new(58, 63), "ex:lease"),
        ];
        let triples = extract_triples(&doc, &anns, &ont);
        assert_eq!(triples.len(), 2);
        assert_eq!(triples[0].predicate, Predicate::Lemma("grant".to_string()));
        assert_eq!(triples[1].predicate, Predicate::Lemma("breach".to_string()));
    }
}
