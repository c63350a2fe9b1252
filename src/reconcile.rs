//! Reconciliation of ruler and language-model concept discoveries.
//!
//! Discoveries are aligned by normalized surface text. When both arms
//! found the same surface and agree on branch, they merge into a single
//! discovery carrying both sources and the higher confidence. Branch
//! conflicts go to embedding triage; an unresolved conflict keeps both
//! arms and lets the reranker sort it out. Surfaces found by only one arm
//! are retained as-is, except that ruler-only discoveries below the
//! confidence floor are dropped (single-word alt-label noise).

use std::collections::BTreeMap;

use crate::annotation::{ConceptMatch, MatchType, Source, Span};
use crate::config::EnrichConfig;
use crate::document::CanonicalText;
use crate::embedding::Embedder;
use crate::normalize::normalize_surface;
use crate::proposer::ConceptProposal;

/// How a discovery came out of reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileCategory {
    /// Both arms found the surface and agreed.
    BothAgree,
    /// Only the ruler found it.
    RulerOnly,
    /// Only the language model found it.
    LlmOnly,
    /// A branch conflict that embedding triage settled.
    ConflictResolved,
    /// A branch conflict left for the reranker; both arms emitted.
    ConflictKeptBoth,
}

/// A unified concept discovery awaiting resolution.
#[derive(Debug, Clone)]
pub struct Discovery {
    /// Representative surface text (first occurrence).
    pub surface: String,
    /// Folded alignment key.
    pub normalized_surface: String,
    /// First-seen span of the surface.
    pub span: Span,
    /// Branch hint from the language-model arm, possibly empty.
    pub branch_hint: String,
    /// Concept IRI already known from the ruler arm, when available.
    pub iri_hint: Option<String>,
    /// Match type of the strongest contributing evidence.
    pub match_type: MatchType,
    /// Merged confidence.
    pub confidence: f64,
    /// Contributing sources.
    pub sources: Vec<Source>,
    /// Reconciliation outcome.
    pub category: ReconcileCategory,
}

struct RulerArm<'a> {
    best: &'a ConceptMatch,
    confidence: f64,
}

struct LlmArm<'a> {
    best: &'a ConceptProposal,
    confidence: f64,
}

/// Merges ruler and concept-proposer outputs.
pub struct Reconciler<'a> {
    embedder: Option<&'a dyn Embedder>,
    config: &'a EnrichConfig,
}

impl<'a> Reconciler<'a> {
    /// Create a reconciler. Without an embedder, branch conflicts keep
    /// both arms.
    #[must_use]
    pub fn new(embedder: Option<&'a dyn Embedder>, config: &'a EnrichConfig) -> Self {
        Self { embedder, config }
    }

    /// Reconcile the two arms into a unified discovery set, ordered by
    /// `(span, surface)`.
    #[must_use]
    pub fn reconcile(
        &self,
        ruler_matches: &[ConceptMatch],
        proposals: &[ConceptProposal],
        doc: &CanonicalText,
    ) -> Vec<Discovery> {
        // Group each arm by normalized surface. BTreeMap keeps iteration
        // deterministic.
        let mut ruler_by_surface: BTreeMap<String, Vec<&ConceptMatch>> = BTreeMap::new();
        for m in ruler_matches {
            ruler_by_surface
                .entry(normalize_surface(&m.surface_text))
                .or_default()
                .push(m);
        }
        let mut llm_by_surface: BTreeMap<String, Vec<&ConceptProposal>> = BTreeMap::new();
        for p in proposals {
            llm_by_surface
                .entry(normalize_surface(&p.surface))
                .or_default()
                .push(p);
        }

        let mut keys: Vec<&String> = ruler_by_surface
            .keys()
            .chain(llm_by_surface.keys())
            .collect();
        keys.sort();
        keys.dedup();
        let keys: Vec<String> = keys.into_iter().cloned().collect();

        let mut out = Vec::new();
        for key in keys {
            let ruler = ruler_by_surface.get(&key).map(|group| {
                // Preferred stratum first, then confidence, then IRI.
                let best = group
                    .iter()
                    .copied()
                    .min_by(|a, b| {
                        let pa = matches!(a.match_type, MatchType::AltLabel);
                        let pb = matches!(b.match_type, MatchType::AltLabel);
                        pa.cmp(&pb)
                            .then_with(|| {
                                b.confidence
                                    .get()
                                    .partial_cmp(&a.confidence.get())
                                    .unwrap_or(std::cmp::Ordering::Equal)
                            })
                            .then_with(|| a.concept_iri.cmp(&b.concept_iri))
                    })
                    .expect("non-empty group");
                let confidence = group
                    .iter()
                    .map(|m| m.confidence.get())
                    .fold(0.0, f64::max);
                RulerArm { best, confidence }
            });
            let llm = llm_by_surface.get(&key).map(|group| {
                let best = group
                    .iter()
                    .copied()
                    .max_by(|a, b| {
                        a.confidence
                            .partial_cmp(&b.confidence)
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then_with(|| b.span.cmp(&a.span))
                    })
                    .expect("non-empty group");
                let confidence = best.confidence;
                LlmArm { best, confidence }
            });

            match (ruler, llm) {
                (Some(r), Some(l)) => self.merge_arms(&key, r, l, doc, &mut out),
                (Some(r), None) => {
                    if r.confidence >= self.config.ruler_only_min_confidence {
                        out.push(Discovery {
                            surface: r.best.surface_text.clone(),
                            normalized_surface: key,
                            span: r.best.span,
                            branch_hint: String::new(),
                            iri_hint: Some(r.best.concept_iri.clone()),
                            match_type: r.best.match_type,
                            confidence: r.confidence,
                            sources: vec![Source::Ruler],
                            category: ReconcileCategory::RulerOnly,
                        });
                    } else {
                        log::debug!(
                            "filtered ruler-only discovery '{}' (confidence {:.2})",
                            key,
                            r.confidence
                        );
                    }
                }
                (None, Some(l)) => out.push(Discovery {
                    surface: l.best.surface.clone(),
                    normalized_surface: key,
                    span: l.best.span,
                    branch_hint: l.best.branch_hint.clone(),
                    iri_hint: None,
                    match_type: MatchType::Llm,
                    confidence: l.confidence,
                    sources: vec![Source::Llm],
                    category: ReconcileCategory::LlmOnly,
                }),
                (None, None) => unreachable!("key came from one of the maps"),
            }
        }

        out.sort_by(|a, b| (a.span, &a.surface).cmp(&(b.span, &b.surface)));
        out
    }

    fn merge_arms(
        &self,
        key: &str,
        ruler: RulerArm<'_>,
        llm: LlmArm<'_>,
        doc: &CanonicalText,
        out: &mut Vec<Discovery>,
    ) {
        let hint = llm.best.branch_hint.trim();
        let branches_agree = hint.is_empty()
            || ruler.best.branches.is_empty()
            || ruler
                .best
                .branches
                .iter()
                .any(|b| b.eq_ignore_ascii_case(hint));

        if branches_agree {
            out.push(Discovery {
                surface: ruler.best.surface_text.clone(),
                normalized_surface: key.to_string(),
                span: ruler.best.span,
                branch_hint: hint.to_string(),
                iri_hint: Some(ruler.best.concept_iri.clone()),
                match_type: ruler.best.match_type,
                confidence: ruler.confidence.max(llm.confidence),
                sources: vec![Source::Ruler, Source::Llm],
                category: ReconcileCategory::BothAgree,
            });
            return;
        }

        // Branch conflict: embedding triage when an index is available.
        if let Some(embedder) = self.embedder {
            if let Some(winner) = self.triage(key, &ruler, &llm, embedder, doc) {
                out.push(winner);
                return;
            }
        }

        // Unresolved: keep both arms with their own sources; the reranker
        // settles it later.
        out.push(Discovery {
            surface: ruler.best.surface_text.clone(),
            normalized_surface: key.to_string(),
            span: ruler.best.span,
            branch_hint: String::new(),
            iri_hint: Some(ruler.best.concept_iri.clone()),
            match_type: ruler.best.match_type,
            confidence: ruler.confidence,
            sources: vec![Source::Ruler],
            category: ReconcileCategory::ConflictKeptBoth,
        });
        out.push(Discovery {
            surface: llm.best.surface.clone(),
            normalized_surface: key.to_string(),
            span: llm.best.span,
            branch_hint: hint.to_string(),
            iri_hint: None,
            match_type: MatchType::Llm,
            confidence: llm.confidence,
            sources: vec![Source::Llm],
            category: ReconcileCategory::ConflictKeptBoth,
        });
    }

    /// Embedding triage: score each candidate concept against the sentence
    /// containing the disputed surface. The argmax wins when it clears the
    /// conflict threshold with enough margin.
    fn triage(
        &self,
        key: &str,
        ruler: &RulerArm<'_>,
        llm: &LlmArm<'_>,
        embedder: &dyn Embedder,
        doc: &CanonicalText,
    ) -> Option<Discovery> {
        let context = doc
            .sentences
            .sentence_of(&llm.best.span)
            .and_then(|i| doc.sentences.span(i))
            .map_or_else(|| llm.best.surface.clone(), |s| s.slice(&doc.text).to_string());

        // Candidates: the ruler's concept plus the model arm's nearest
        // label for the surface.
        let mut candidate_iris = vec![ruler.best.concept_iri.clone()];
        for near in embedder.nearest(&llm.best.surface, 1) {
            if !candidate_iris.contains(&near.iri) {
                candidate_iris.push(near.iri);
            }
        }

        let scored = embedder.nearest_in(&context, &candidate_iris, candidate_iris.len());
        let best = scored.first()?;
        let second = scored.get(1).map_or(0.0, |s| s.score);

        let threshold = self.config.semantic_similarity_threshold as f32;
        let margin = self.config.triage_margin as f32;
        if best.score < threshold || (best.score - second) < margin {
            return None;
        }

        log::debug!(
            "triage resolved '{}' to {} (score {:.3})",
            key,
            best.iri,
            best.score
        );
        Some(Discovery {
            surface: ruler.best.surface_text.clone(),
            normalized_surface: key.to_string(),
            span: ruler.best.span,
            branch_hint: String::new(),
            iri_hint: Some(best.iri.clone()),
            match_type: MatchType::Semantic,
            confidence: ruler.confidence.max(llm.confidence),
            sources: vec![Source::Ruler, Source::Llm, Source::Semantic],
            category: ReconcileCategory::ConflictResolved,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::Span;
    use crate::document::DocumentInput;
    use crate::normalize::normalize;
    use crate::types::Confidence;
    use std::collections::BTreeSet;

    fn doc(text: &str) -> CanonicalText {
        normalize(&DocumentInput::text(text), &EnrichConfig::default()).unwrap()
    }

    fn ruler_match(surface: &str, span: Span, iri: &str, conf: f64, branch: &str) -> ConceptMatch {
        let mut m = ConceptMatch::new(
            span,
            surface,
            iri,
            surface,
            MatchType::PreferredLabel,
            Confidence::saturating(conf),
            Source::Ruler,
            "ruler",
        );
        if !branch.is_empty() {
            m.branches = BTreeSet::from([branch.to_string()]);
        }
        m
    }

    fn proposal(surface: &str, span: Span, branch: &str, conf: f64) -> ConceptProposal {
        ConceptProposal {
            surface: surface.to_string(),
            span,
            branch_hint: branch.to_string(),
            confidence: conf,
            chunk_index: 0,
        }
    }

    #[test]
    fn agreement_takes_max_confidence_and_both_sources() {
        let doc = doc("The contract was breached.");
        let config = EnrichConfig::default();
        let rec = Reconciler::new(None, &config);
        let ruler = vec![ruler_match("contract", Span::new(4, 12), "ex:c", 0.72, "Document")];
        let llm = vec![proposal("contract", Span::new(4, 12), "Document", 0.85)];

        let discoveries = rec.reconcile(&ruler, &llm, &doc);
        assert_eq!(discoveries.len(), 1);
        let d = &discoveries[0];
        assert_eq!(d.category, ReconcileCategory::BothAgree);
        assert!((d.confidence - 0.85).abs() < 1e-9);
        assert_eq!(d.sources, vec![Source::Ruler, Source::Llm]);
        assert_eq!(d.iri_hint.as_deref(), Some("ex:c"));
    }

    #[test]
    fn ruler_only_below_floor_is_dropped() {
        let doc = doc("An agreement and a motion were filed.");
        let config = EnrichConfig::default();
        let rec = Reconciler::new(None, &config);
        let ruler = vec![
            // Single-word alt label: 0.35, below the 0.60 floor.
            ruler_match("agreement", Span::new(3, 12), "ex:c", 0.35, "Document"),
            // Single-word preferred: 0.72, kept.
            ruler_match("motion", Span::new(19, 25), "ex:m", 0.72, "Document"),
        ];

        let discoveries = rec.reconcile(&ruler, &[], &doc);
        assert_eq!(discoveries.len(), 1);
        assert_eq!(discoveries[0].normalized_surface, "motion");
        assert_eq!(discoveries[0].category, ReconcileCategory::RulerOnly);
    }

    #[test]
    fn llm_only_is_retained() {
        let doc = doc("The tortious interference claim proceeds.");
        let config = EnrichConfig::default();
        let rec = Reconciler::new(None, &config);
        let llm = vec![proposal(
            "tortious interference",
            Span::new(4, 26),
            "Event",
            0.8,
        )];

        let discoveries = rec.reconcile(&[], &llm, &doc);
        assert_eq!(discoveries.len(), 1);
        assert_eq!(discoveries[0].category, ReconcileCategory::LlmOnly);
        assert_eq!(discoveries[0].sources, vec![Source::Llm]);
        assert!(discoveries[0].iri_hint.is_none());
    }

    #[test]
    fn branch_conflict_without_embedder_keeps_both_arms() {
        let doc = doc("The interest accrued daily.");
        let config = EnrichConfig::default();
        let rec = Reconciler::new(None, &config);
        let ruler = vec![ruler_match("interest", Span::new(4, 12), "ex:fin", 0.72, "Asset")];
        let llm = vec![proposal("interest", Span::new(4, 12), "Event", 0.8)];

        let discoveries = rec.reconcile(&ruler, &llm, &doc);
        assert_eq!(discoveries.len(), 2);
        assert!(discoveries
            .iter()
            .all(|d| d.category == ReconcileCategory::ConflictKeptBoth));
        assert!(discoveries.iter().any(|d| d.iri_hint.is_some()));
        assert!(discoveries.iter().any(|d| d.iri_hint.is_none()));
    }

    #[test]
    fn surfaces_align_across_case_and_whitespace() {
        let doc = doc("BREACH  OF  CONTRACT alleged.");
        let config = EnrichConfig::default();
        let rec = Reconciler::new(None, &config);
        let ruler = vec![ruler_match(
            "BREACH OF CONTRACT",
            Span::new(0, 20),
            "ex:boc",
            0.90,
            "Event",
        )];
        let llm = vec![proposal("breach of contract", Span::new(0, 20), "Event", 0.7)];

        let discoveries = rec.reconcile(&ruler, &llm, &doc);
        assert_eq!(discoveries.len(), 1);
        assert_eq!(discoveries[0].category, ReconcileCategory::BothAgree);
    }
}
