//! Global occurrence expansion: apply each resolved concept to every
//! occurrence of its labels in the document.
//!
//! One automaton is built per job, keyed by `(concept IRI, label variant)`
//! over the resolved concepts' surfaces, preferred labels, and alternative
//! labels. The text is scanned once; occurrences pass through the shared
//! containment-aware overlap policy, so nested concepts survive while
//! partial overlaps keep the longer span.

use std::collections::{HashMap, HashSet};

use crate::annotation::{AnnotationState, ConceptMatch, MatchType, Source, Span};
use crate::config::EnrichConfig;
use crate::matching::{resolve_overlaps, MultiPatternMatcher, SpanKeyed};
use crate::ontology::Ontology;

#[derive(Debug, Clone)]
struct ExpandPattern {
    iri: String,
    alt_variant: bool,
}

struct Occurrence {
    span: Span,
    iri: String,
    alt_variant: bool,
}

impl SpanKeyed for Occurrence {
    fn span(&self) -> Span {
        self.span
    }
    fn key(&self) -> &str {
        &self.iri
    }
}

/// Expand resolved annotations to all document occurrences.
///
/// Existing annotations are preserved with their identity and lineage;
/// an expansion that lands on an existing `(span, iri)` pair only augments
/// its sources with `string_match`. New occurrences inherit the seed
/// annotation's confidence, scaled by `alt_label_expansion_scale` when the
/// occurrence matched an alternative label rather than the preferred one.
/// Rejected annotations are kept but never used as expansion seeds.
#[must_use]
pub fn expand_occurrences(
    mut annotations: Vec<ConceptMatch>,
    ontology: &dyn Ontology,
    text: &str,
    config: &EnrichConfig,
) -> Vec<ConceptMatch> {
    // Best seed per concept IRI, copied out so the annotation list stays
    // free for mutation below.
    let mut seeds: HashMap<String, ConceptMatch> = HashMap::new();
    for ann in &annotations {
        if ann.state == AnnotationState::Rejected || ann.concept_iri.is_empty() {
            continue;
        }
        match seeds.get_mut(&ann.concept_iri) {
            Some(best) => {
                if ann.confidence.get() > best.confidence.get() {
                    *best = ann.clone();
                }
            }
            None => {
                seeds.insert(ann.concept_iri.clone(), ann.clone());
            }
        }
    }
    if seeds.is_empty() {
        annotations.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        return annotations;
    }

    // One pattern per (iri, folded label variant).
    let mut pairs: Vec<(String, ExpandPattern)> = Vec::new();
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut sorted_iris: Vec<String> = seeds.keys().cloned().collect();
    sorted_iris.sort_unstable();
    for iri in &sorted_iris {
        let seed = &seeds[iri];
        let mut add = |label: &str, alt_variant: bool| {
            let folded = crate::normalize::normalize_surface(label);
            if folded.chars().count() < config.min_pattern_chars {
                return;
            }
            if !seen.insert((iri.clone(), folded.clone())) {
                return;
            }
            pairs.push((
                folded,
                ExpandPattern {
                    iri: iri.clone(),
                    alt_variant,
                },
            ));
        };
        add(&seed.surface_text, false);
        if let Some(class) = ontology.class(iri) {
            add(&class.preferred_label, false);
            for alt in &class.alt_labels {
                add(alt, true);
            }
        }
    }

    let Some(matcher) = MultiPatternMatcher::build(pairs) else {
        annotations.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        return annotations;
    };

    let raw: Vec<Occurrence> = matcher
        .scan(text, config)
        .into_iter()
        .map(|m| {
            let p = matcher.value(m.pattern);
            Occurrence {
                span: m.span,
                iri: p.iri.clone(),
                alt_variant: p.alt_variant,
            }
        })
        .collect();

    // Within a group the preferred variant wins; collapse duplicates.
    let occurrences = resolve_overlaps(raw, |kept, dropped| {
        kept.alt_variant = kept.alt_variant && dropped.alt_variant;
    });

    // Index existing annotations by (span, iri) for the collapse rule.
    let mut existing: HashMap<(Span, String), usize> = HashMap::new();
    for (i, ann) in annotations.iter().enumerate() {
        existing.insert((ann.span, ann.concept_iri.clone()), i);
    }

    let mut added = 0usize;
    for occ in occurrences {
        if let Some(&i) = existing.get(&(occ.span, occ.iri.clone())) {
            annotations[i].add_source(Source::StringMatch);
            continue;
        }
        let seed = &seeds[occ.iri.as_str()];
        let confidence = if occ.alt_variant {
            seed.confidence.scale(config.alt_label_expansion_scale)
        } else {
            seed.confidence
        };
        let mut ann = ConceptMatch::new(
            occ.span,
            occ.span.slice(text),
            occ.iri.clone(),
            seed.preferred_label.clone(),
            MatchType::Expanded,
            confidence,
            seed.sources[0],
            "string_match",
        );
        for source in &seed.sources[1..] {
            ann.add_source(*source);
        }
        ann.add_source(Source::StringMatch);
        ann.branches = seed.branches.clone();
        ann.backup_branches = seed.backup_branches.clone();
        ann.backup_candidates = seed.backup_candidates.clone();
        ann.lineage[0].reason = format!("expanded from '{}'", seed.preferred_label);
        annotations.push(ann);
        added += 1;
    }

    log::info!("string-match expansion added {added} occurrences");
    annotations.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    annotations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::{MatchType, Source};
    use crate::ontology::{InMemoryOntology, OntologyClass};
    use crate::types::Confidence;
    use std::collections::BTreeSet;

    fn class(iri: &str, label: &str, alts: &[&str]) -> OntologyClass {
        OntologyClass {
            iri: iri.to_string(),
            preferred_label: label.to_string(),
            alt_labels: alts.iter().map(|a| (*a).to_string()).collect(),
            branches: BTreeSet::new(),
            definition: None,
            parents: Vec::new(),
        }
    }

    fn resolved(surface: &str, span: Span, iri: &str, label: &str, conf: f64) -> ConceptMatch {
        let mut ann = ConceptMatch::new(
            span,
            surface,
            iri,
            label,
            MatchType::PreferredLabel,
            Confidence::saturating(conf),
            Source::Ruler,
            "resolver",
        );
        ann.add_source(Source::Llm);
        ann
    }

    #[test]
    fn expands_to_every_occurrence() {
        let text = "The contract was signed. A second contract followed.";
        let ont = InMemoryOntology::new(vec![class("ex:c", "Contract", &[])], Vec::new());
        let seed = resolved("contract", Span::new(4, 12), "ex:c", "Contract", 0.8);
        let seed_id = seed.id;

        let out = expand_occurrences(vec![seed], &ont, text, &EnrichConfig::default());
        assert_eq!(out.len(), 2);
        // The seed annotation keeps its identity and gains string_match.
        let kept = out.iter().find(|a| a.id == seed_id).unwrap();
        assert!(kept.has_source(Source::StringMatch));
        // The new occurrence carries the seed's confidence and sources.
        let new = out.iter().find(|a| a.id != seed_id).unwrap();
        assert_eq!(new.match_type, MatchType::Expanded);
        assert!((new.confidence.get() - 0.8).abs() < 1e-9);
        assert!(new.has_source(Source::Ruler));
        assert!(new.has_source(Source::Llm));
        assert!(new.has_source(Source::StringMatch));
    }

    #[test]
    fn alt_label_occurrences_are_scaled() {
        let text = "The contract and the later agreement.";
        let ont = InMemoryOntology::new(
            vec![class("ex:c", "Contract", &["agreement"])],
            Vec::new(),
        );
        let seed = resolved("contract", Span::new(4, 12), "ex:c", "Contract", 0.8);

        let out = expand_occurrences(vec![seed], &ont, text, &EnrichConfig::default());
        assert_eq!(out.len(), 2);
        let alt = out.iter().find(|a| a.surface_text == "agreement").unwrap();
        // 0.8 * 0.95
        assert!((alt.confidence.get() - 0.76).abs() < 1e-9);
    }

    #[test]
    fn nested_concepts_both_expand() {
        let text = "A claim for breach of contract was filed.";
        let ont = InMemoryOntology::new(
            vec![
                class("ex:boc", "Breach of Contract", &[]),
                class("ex:c", "Contract", &[]),
            ],
            Vec::new(),
        );
        let outer_span = Span::new(12, 30);
        let inner_span = Span::new(22, 30);
        let seeds = vec![
            resolved("breach of contract", outer_span, "ex:boc", "Breach of Contract", 0.9),
            resolved("contract", inner_span, "ex:c", "Contract", 0.72),
        ];

        let out = expand_occurrences(seeds, &ont, text, &EnrichConfig::default());
        assert_eq!(out.len(), 2);
        let outer = out.iter().find(|a| a.concept_iri == "ex:boc").unwrap();
        let inner = out.iter().find(|a| a.concept_iri == "ex:c").unwrap();
        assert!(outer.span.contains_strictly(&inner.span));
        assert!(outer.has_source(Source::StringMatch));
        assert!(inner.has_source(Source::StringMatch));
    }

    #[test]
    fn rejected_annotations_are_not_seeds() {
        let text = "interest here and interest there.";
        let ont = InMemoryOntology::new(vec![class("ex:i", "Interest", &[])], Vec::new());
        let mut seed = resolved("interest", Span::new(0, 8), "ex:i", "Interest", 0.3);
        seed.state = AnnotationState::Rejected;

        let out = expand_occurrences(vec![seed], &ont, text, &EnrichConfig::default());
        // No expansion happened; the rejected annotation is preserved.
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].state, AnnotationState::Rejected);
    }

    #[test]
    fn output_sorted_by_start_end_iri() {
        let text = "contract then contract again.";
        let ont = InMemoryOntology::new(vec![class("ex:c", "Contract", &[])], Vec::new());
        let seed = resolved("contract", Span::new(0, 8), "ex:c", "Contract", 0.8);
        let out = expand_occurrences(vec![seed], &ont, text, &EnrichConfig::default());
        let keys: Vec<_> = out.iter().map(|a| (a.span.start, a.span.end)).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }
}
