//! Deterministic concept matcher over the ontology's label set.
//!
//! The ruler scans the canonical text once against every preferred and
//! alternative label and emits preliminary concept matches with a
//! graduated initial confidence:
//!
//! | label stratum | multi-word | single-word |
//! |---------------|------------|-------------|
//! | preferred     | 0.90       | 0.72        |
//! | alternative   | 0.65       | 0.35        |
//!
//! "Multi-word" means the folded label contains whitespace. A surface that
//! matches several concepts (the same synonym on different IRIs) produces
//! one match per candidate IRI with an identical span.

use once_cell::sync::Lazy;
use std::collections::HashSet;

use crate::annotation::{ConceptMatch, MatchType, Source, Span};
use crate::config::EnrichConfig;
use crate::matching::{resolve_overlaps, MultiPatternMatcher, SpanKeyed};
use crate::ontology::{LabelStratum, Ontology};
use crate::types::Confidence;

/// Common words that are false-positive matches for concept labels.
static STOPWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "the", "and", "for", "not", "but", "has", "had", "was", "are", "its", "may", "can",
        "did", "she", "his", "her", "him", "our", "who", "how", "all", "any", "new", "one",
        "two", "out", "own", "set", "use", "way", "day", "get", "see", "now", "old", "end",
        "put", "run", "let", "say", "too", "yet", "off", "try", "ask", "got", "met", "cut",
        "pay", "due", "add", "etc", "per", "via",
    ]
    .into_iter()
    .collect()
});

#[derive(Debug, Clone)]
struct RulerPattern {
    iri: String,
    label: String,
    preferred_label: String,
    stratum: LabelStratum,
    multiword: bool,
}

/// The graduated initial confidence schedule.
#[must_use]
pub fn initial_confidence(stratum: LabelStratum, multiword: bool) -> Confidence {
    let value = match (stratum, multiword) {
        (LabelStratum::Preferred, true) => 0.90,
        (LabelStratum::Preferred, false) => 0.72,
        (LabelStratum::Alternative, true) => 0.65,
        (LabelStratum::Alternative, false) => 0.35,
    };
    Confidence::saturating(value)
}

/// Deterministic multi-pattern concept matcher. Built once at startup and
/// shared read-only across jobs.
pub struct ConceptRuler {
    matcher: Option<MultiPatternMatcher<RulerPattern>>,
}

impl ConceptRuler {
    /// Build the automaton from every usable class label in the ontology.
    ///
    /// Labels shorter than `min_pattern_chars` after folding, and labels
    /// that are common stopwords, are skipped.
    #[must_use]
    pub fn from_ontology(ontology: &dyn Ontology, config: &EnrichConfig) -> Self {
        let mut pairs = Vec::new();
        for class in ontology.classes() {
            let mut add = |label: &str, stratum: LabelStratum| {
                let folded = crate::normalize::normalize_surface(label);
                if folded.chars().count() < config.min_pattern_chars {
                    return;
                }
                if STOPWORDS.contains(folded.as_str()) {
                    return;
                }
                pairs.push((
                    folded.clone(),
                    RulerPattern {
                        iri: class.iri.clone(),
                        label: label.to_string(),
                        preferred_label: class.preferred_label.clone(),
                        stratum,
                        multiword: folded.contains(' '),
                    },
                ));
            };
            add(&class.preferred_label, LabelStratum::Preferred);
            for alt in &class.alt_labels {
                add(alt, LabelStratum::Alternative);
            }
        }
        log::info!("concept ruler built with {} patterns", pairs.len());
        Self {
            matcher: MultiPatternMatcher::build(pairs),
        }
    }

    /// Number of patterns in the automaton.
    #[must_use]
    pub fn pattern_count(&self) -> usize {
        self.matcher.as_ref().map_or(0, MultiPatternMatcher::pattern_count)
    }

    /// Scan the canonical text and return preliminary concept matches,
    /// ordered by `(start, end, iri)`.
    #[must_use]
    pub fn scan(&self, text: &str, ontology: &dyn Ontology, config: &EnrichConfig) -> Vec<ConceptMatch> {
        let Some(matcher) = &self.matcher else {
            return Vec::new();
        };

        struct Hit<'a> {
            span: Span,
            pattern: &'a RulerPattern,
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

        let mut out: Vec<ConceptMatch> = resolved
            .into_iter()
            .map(|hit| {
                let p = hit.pattern;
                let match_type = match p.stratum {
                    LabelStratum::Preferred => MatchType::PreferredLabel,
                    LabelStratum::Alternative => MatchType::AltLabel,
                };
                let mut ann = ConceptMatch::new(
                    hit.span,
                    hit.span.slice(text),
                    p.iri.clone(),
                    p.preferred_label.clone(),
                    match_type,
                    initial_confidence(p.stratum, p.multiword),
                    Source::Ruler,
                    "ruler",
                );
                ann.branches = ontology.branches_for(&p.iri);
                ann.lineage[0].reason = format!("matched label '{}'", p.label);
                ann
            })
            .collect();

        out.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ontology::{InMemoryOntology, OntologyClass};
    use std::collections::BTreeSet;

    fn class(iri: &str, label: &str, alts: &[&str], branch: &str) -> OntologyClass {
        let mut branches = BTreeSet::new();
        if !branch.is_empty() {
            branches.insert(branch.to_string());
        }
        OntologyClass {
            iri: iri.to_string(),
            preferred_label: label.to_string(),
            alt_labels: alts.iter().map(|a| (*a).to_string()).collect(),
            branches,
            definition: None,
            parents: Vec::new(),
        }
    }

    fn ontology() -> InMemoryOntology {
        InMemoryOntology::new(
            vec![
                class("ex:boc", "Breach of Contract", &[], "Event"),
                class("ex:contract", "Contract", &["agreement"], "Document"),
                class("ex:motion", "Motion to Dismiss", &["MTD"], "Document"),
                class("ex:the", "The", &[], ""), // stopword, never a pattern
            ],
            Vec::new(),
        )
    }

    fn scan(text: &str) -> Vec<ConceptMatch> {
        let ont = ontology();
        let config = EnrichConfig::default();
        let ruler = ConceptRuler::from_ontology(&ont, &config);
        ruler.scan(text, &ont, &config)
    }

    #[test]
    fn confidence_schedule_anchors() {
        assert_eq!(
            initial_confidence(LabelStratum::Preferred, true).get(),
            0.90
        );
        assert_eq!(
            initial_confidence(LabelStratum::Preferred, false).get(),
            0.72
        );
        assert_eq!(
            initial_confidence(LabelStratum::Alternative, true).get(),
            0.65
        );
        assert_eq!(
            initial_confidence(LabelStratum::Alternative, false).get(),
            0.35
        );
    }

    #[test]
    fn nested_labels_both_match() {
        let text = "A claim for breach of contract was filed.";
        let matches = scan(text);
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].surface_text, "breach of contract");
        assert_eq!(matches[0].concept_iri, "ex:boc");
        assert!((matches[0].confidence.get() - 0.90).abs() < 1e-9);
        assert_eq!(matches[1].surface_text, "contract");
        assert_eq!(matches[1].concept_iri, "ex:contract");
        assert!((matches[1].confidence.get() - 0.72).abs() < 1e-9);
        // The contained span sits inside the containing one.
        assert!(matches[0].span.contains_strictly(&matches[1].span));
    }

    #[test]
    fn alt_label_matches_lower_confidence() {
        let matches = scan("The parties signed an agreement yesterday.");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].concept_iri, "ex:contract");
        assert_eq!(matches[0].match_type, MatchType::AltLabel);
        assert!((matches[0].confidence.get() - 0.35).abs() < 1e-9);
        assert_eq!(matches[0].preferred_label, "Contract");
    }

    #[test]
    fn stopword_labels_are_skipped() {
        let matches = scan("The the the.");
        assert!(matches.is_empty());
    }

    #[test]
    fn branches_come_from_ontology() {
        let matches = scan("Motion to Dismiss filed today.");
        assert_eq!(matches.len(), 1);
        assert!(matches[0].branches.contains("Document"));
        assert_eq!(matches[0].sources, vec![Source::Ruler]);
    }

    #[test]
    fn output_sorted_by_span_then_iri() {
        let text = "A contract about a contract: breach of contract.";
        let matches = scan(text);
        let keys: Vec<(usize, usize, String)> = matches
            .iter()
            .map(|m| (m.span.start, m.span.end, m.concept_iri.clone()))
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys.len(), 4);
        assert_eq!(keys, sorted);
    }

    #[test]
    fn empty_ontology_scans_nothing() {
        let ont = InMemoryOntology::new(Vec::new(), Vec::new());
        let config = EnrichConfig::default();
        let ruler = ConceptRuler::from_ontology(&ont, &config);
        assert_eq!(ruler.pattern_count(), 0);
        assert!(ruler.scan("Some text.", &ont, &config).is_empty());
    }
}
