//! Concept resolution: discoveries to ranked concept IRIs.
//!
//! Resolve-once-use-many: each unique `(normalized_surface, branch)`
//! discovery is resolved at most once per job; later occurrences reuse the
//! cached outcome. Candidates are ranked by a composite of lexical and
//! semantic evidence, `0.6 * lexical + 0.4 * semantic`; without an
//! embedding index the composite is the lexical score alone. Ties prefer
//! preferred-label bindings, then lexicographic IRI order, so resolution
//! is deterministic.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::annotation::{AnnotationState, ConceptCandidate, ConceptMatch, LineageEvent, Source};
use crate::config::EnrichConfig;
use crate::embedding::Embedder;
use crate::job::QualitySignal;
use crate::normalize::normalize_surface;
use crate::ontology::{LabelIndex, LabelStratum, Ontology};
use crate::reconcile::Discovery;
use crate::types::Confidence;

const LEXICAL_EXACT: f64 = 1.0;
const LEXICAL_ALT: f64 = 0.85;
const NEAREST_POOL: usize = 10;

#[derive(Debug, Clone)]
struct Candidate {
    iri: String,
    label: String,
    lexical: f64,
    semantic: Option<f64>,
    preferred_stratum: bool,
}

impl Candidate {
    fn composite(&self) -> f64 {
        match self.semantic {
            Some(s) => 0.6 * self.lexical + 0.4 * s,
            None => self.lexical,
        }
    }
}

#[derive(Debug, Clone)]
enum Resolution {
    Resolved {
        iri: String,
        preferred_label: String,
        branches: BTreeSet<String>,
        backups: Vec<ConceptCandidate>,
    },
    Unresolved,
}

/// Resolves discoveries to concept IRIs with ranked backups.
pub struct Resolver<'a> {
    ontology: &'a dyn Ontology,
    label_index: &'a LabelIndex,
    embedder: Option<&'a dyn Embedder>,
    config: &'a EnrichConfig,
    cache: HashMap<(String, String), Resolution>,
    invocations: usize,
}

impl<'a> Resolver<'a> {
    /// Create a resolver for one job.
    #[must_use]
    pub fn new(
        ontology: &'a dyn Ontology,
        label_index: &'a LabelIndex,
        embedder: Option<&'a dyn Embedder>,
        config: &'a EnrichConfig,
    ) -> Self {
        Self {
            ontology,
            label_index,
            embedder,
            config,
            cache: HashMap::new(),
            invocations: 0,
        }
    }

    /// Number of uncached resolution computations performed.
    #[must_use]
    pub fn invocations(&self) -> usize {
        self.invocations
    }

    /// Resolve every discovery into a preliminary annotation, ordered by
    /// `(start, end, iri)`. Unresolvable discoveries come back rejected
    /// with reason `unresolved_iri` and a matching quality signal.
    pub fn resolve_all(
        &mut self,
        discoveries: &[Discovery],
        signals: &mut Vec<QualitySignal>,
    ) -> Vec<ConceptMatch> {
        let mut out = Vec::new();
        for discovery in discoveries {
            let key = (
                discovery.normalized_surface.clone(),
                discovery.branch_hint.to_lowercase(),
            );
            let resolution = match self.cache.get(&key) {
                Some(r) => r.clone(),
                None => {
                    self.invocations += 1;
                    let r = self.resolve_uncached(discovery);
                    self.cache.insert(key, r.clone());
                    r
                }
            };

            match resolution {
                Resolution::Resolved {
                    iri,
                    preferred_label,
                    branches,
                    backups,
                } => {
                    let mut ann = ConceptMatch::new(
                        discovery.span,
                        discovery.surface.clone(),
                        iri.clone(),
                        preferred_label,
                        discovery.match_type,
                        Confidence::saturating(discovery.confidence),
                        discovery.sources[0],
                        "resolver",
                    );
                    for source in &discovery.sources[1..] {
                        ann.add_source(*source);
                    }
                    ann.branches = branches;
                    ann.backup_candidates = backups;
                    ann.lineage[0].reason = format!("resolved '{}' to {}", discovery.surface, iri);
                    out.push(ann);
                }
                Resolution::Unresolved => {
                    let mut ann = ConceptMatch::new(
                        discovery.span,
                        discovery.surface.clone(),
                        discovery.iri_hint.clone().unwrap_or_default(),
                        discovery.surface.clone(),
                        discovery.match_type,
                        Confidence::saturating(discovery.confidence),
                        discovery.sources[0],
                        "resolver",
                    );
                    ann.state = AnnotationState::Rejected;
                    ann.record(
                        LineageEvent::now("resolver", "rejected").with_reason("unresolved_iri"),
                    );
                    signals.push(QualitySignal {
                        stage: "resolver".to_string(),
                        reason: "unresolved_iri".to_string(),
                        span_or_chunk: Some(format!(
                            "{}..{}",
                            discovery.span.start, discovery.span.end
                        )),
                    });
                    out.push(ann);
                }
            }
        }
        out.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        out
    }

    fn resolve_uncached(&self, discovery: &Discovery) -> Resolution {
        let mut candidates: Vec<Candidate> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        // Fast path: the ruler already knows the IRI.
        if let Some(hint) = &discovery.iri_hint {
            if let Some(class) = self.ontology.class(hint) {
                seen.insert(hint.clone());
                candidates.push(Candidate {
                    iri: hint.clone(),
                    label: class.preferred_label.clone(),
                    lexical: LEXICAL_EXACT,
                    semantic: None,
                    preferred_stratum: true,
                });
            } else {
                log::warn!("IRI hint {hint} not in ontology; falling back to label search");
            }
        }

        // Lexical candidates from the label index.
        for hit in self.label_index.lookup(&discovery.normalized_surface) {
            if !seen.insert(hit.iri.clone()) {
                continue;
            }
            let preferred = matches!(hit.stratum, LabelStratum::Preferred);
            let label = self
                .ontology
                .class(&hit.iri)
                .map_or_else(|| hit.label.clone(), |c| c.preferred_label.clone());
            candidates.push(Candidate {
                iri: hit.iri.clone(),
                label,
                lexical: if preferred { LEXICAL_EXACT } else { LEXICAL_ALT },
                semantic: None,
                preferred_stratum: preferred,
            });
        }

        // Semantic candidates from the embedding index, with a fuzzy
        // lexical component.
        if let Some(embedder) = self.embedder {
            for near in embedder.nearest(&discovery.surface, NEAREST_POOL) {
                if !seen.insert(near.iri.clone()) {
                    continue;
                }
                let label = self
                    .ontology
                    .class(&near.iri)
                    .map_or_else(|| near.label.clone(), |c| c.preferred_label.clone());
                candidates.push(Candidate {
                    lexical: jaccard_words(
                        &discovery.normalized_surface,
                        &normalize_surface(&label),
                    ),
                    iri: near.iri,
                    label,
                    semantic: Some(f64::from(near.score)),
                    preferred_stratum: false,
                });
            }
            // Fill in semantic scores for lexical candidates.
            let iris: Vec<String> = candidates.iter().map(|c| c.iri.clone()).collect();
            let scored = embedder.nearest_in(&discovery.surface, &iris, iris.len());
            let by_iri: HashMap<&str, f32> =
                scored.iter().map(|s| (s.iri.as_str(), s.score)).collect();
            for c in &mut candidates {
                if c.semantic.is_none() {
                    c.semantic = by_iri.get(c.iri.as_str()).map(|&s| f64::from(s));
                }
            }
        }

        if candidates.is_empty() {
            return Resolution::Unresolved;
        }

        // Branch hint prefers candidates inside the hinted branch.
        if !discovery.branch_hint.is_empty() {
            let hint = discovery.branch_hint.to_lowercase();
            let in_branch = |c: &Candidate| {
                self.ontology
                    .branches_for(&c.iri)
                    .iter()
                    .any(|b| b.to_lowercase() == hint)
            };
            if candidates.iter().any(in_branch) {
                candidates.retain(in_branch);
            }
        }

        candidates.sort_by(|a, b| {
            b.composite()
                .partial_cmp(&a.composite())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.preferred_stratum.cmp(&a.preferred_stratum))
                .then_with(|| a.iri.cmp(&b.iri))
        });

        let top = &candidates[0];
        let backups: Vec<ConceptCandidate> = candidates
            .iter()
            .skip(1)
            .take(self.config.max_candidates)
            .map(|c| ConceptCandidate {
                iri: c.iri.clone(),
                label: c.label.clone(),
                score: c.composite(),
            })
            .collect();

        Resolution::Resolved {
            iri: top.iri.clone(),
            preferred_label: top.label.clone(),
            branches: self.ontology.branches_for(&top.iri),
            backups,
        }
    }
}

/// Word-set Jaccard similarity over folded strings.
#[must_use]
pub fn jaccard_words(a: &str, b: &str) -> f64 {
    let wa: HashSet<&str> = a.split_whitespace().collect();
    let wb: HashSet<&str> = b.split_whitespace().collect();
    let union = wa.union(&wb).count();
    if union == 0 {
        return 0.0;
    }
    wa.intersection(&wb).count() as f64 / union as f64
}
