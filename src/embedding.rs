//! Embedding collaborator: nearest-neighbor queries over concept labels
//! and pairwise similarity.
//!
//! The pipeline only sees the [`Embedder`] trait. The shipped
//! [`HashedEmbedder`] is a deterministic hashed bag-of-tokens vectorizer:
//! no model weights, stable across runs, good enough for triage and for
//! tests. Hosts with a real embedding model implement the trait instead.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::ontology::Ontology;

/// A scored label returned by nearest-neighbor queries.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredLabel {
    /// Concept IRI the label belongs to.
    pub iri: String,
    /// The label text.
    pub label: String,
    /// Cosine similarity in [-1, 1].
    pub score: f32,
}

/// Nearest-neighbor index over concept labels plus pairwise similarity.
pub trait Embedder: Send + Sync {
    /// Embed free text into the index's vector space.
    fn embed(&self, text: &str) -> Vec<f32>;

    /// Cosine similarity between two vectors.
    fn similarity(&self, a: &[f32], b: &[f32]) -> f32 {
        cosine(a, b)
    }

    /// Top-k labels nearest to the query text.
    fn nearest(&self, text: &str, k: usize) -> Vec<ScoredLabel>;

    /// Top-k labels nearest to the query text, restricted to the given
    /// candidate IRIs.
    fn nearest_in(&self, text: &str, candidate_iris: &[String], k: usize) -> Vec<ScoredLabel>;
}

/// Cosine similarity of two f32 vectors. Zero when either norm is zero.
#[must_use]
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len().min(b.len());
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for i in 0..n {
        dot += a[i] * b[i];
        na += a[i] * a[i];
        nb += b[i] * b[i];
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

const DIMS: usize = 256;

fn token_slot(token: &str) -> usize {
    let mut hasher = DefaultHasher::new();
    token.hash(&mut hasher);
    (hasher.finish() as usize) % DIMS
}

fn vectorize(text: &str) -> Vec<f32> {
    let folded = crate::normalize::normalize_surface(text);
    let mut v = vec![0.0f32; DIMS];
    for token in folded.split_whitespace() {
        v[token_slot(token)] += 1.0;
        // Character trigrams give partial credit to inflected variants.
        let chars: Vec<char> = token.chars().collect();
        if chars.len() > 3 {
            for w in chars.windows(3) {
                let tri: String = w.iter().collect();
                v[token_slot(&tri)] += 0.25;
            }
        }
    }
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

struct IndexedLabel {
    iri: String,
    label: String,
    vector: Vec<f32>,
}

/// Deterministic embedding index over every label in an ontology.
pub struct HashedEmbedder {
    labels: Vec<IndexedLabel>,
    by_iri: HashMap<String, Vec<usize>>,
}

impl HashedEmbedder {
    /// Index the preferred and alternative labels of every class.
    #[must_use]
    pub fn from_ontology(ontology: &dyn Ontology) -> Self {
        let mut labels = Vec::new();
        let mut by_iri: HashMap<String, Vec<usize>> = HashMap::new();
        for class in ontology.classes() {
            let mut add = |label: &str| {
                if label.is_empty() {
                    return;
                }
                by_iri
                    .entry(class.iri.clone())
                    .or_default()
                    .push(labels.len());
                labels.push(IndexedLabel {
                    iri: class.iri.clone(),
                    label: label.to_string(),
                    vector: vectorize(label),
                });
            };
            add(&class.preferred_label);
            for alt in &class.alt_labels {
                add(alt);
            }
        }
        Self { labels, by_iri }
    }

    /// Number of indexed labels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// True when nothing was indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    fn rank(&self, query: &[f32], indices: impl Iterator<Item = usize>, k: usize) -> Vec<ScoredLabel> {
        let mut scored: Vec<ScoredLabel> = indices
            .map(|i| {
                let entry = &self.labels[i];
                ScoredLabel {
                    iri: entry.iri.clone(),
                    label: entry.label.clone(),
                    score: cosine(query, &entry.vector),
                }
            })
            .collect();
        // Deterministic: score desc, then IRI asc, then label asc.
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.iri.cmp(&b.iri))
                .then_with(|| a.label.cmp(&b.label))
        });
        // One entry per IRI: the best-scoring label wins.
        let mut seen = std::collections::HashSet::new();
        scored.retain(|s| seen.insert(s.iri.clone()));
        scored.truncate(k);
        scored
    }
}

impl Embedder for HashedEmbedder {
    fn embed(&self, text: &str) -> Vec<f32> {
        vectorize(text)
    }

    fn nearest(&self, text: &str, k: usize) -> Vec<ScoredLabel> {
        let query = vectorize(text);
        self.rank(&query, 0..self.labels.len(), k)
    }

    fn nearest_in(&self, text: &str, candidate_iris: &[String], k: usize) -> Vec<ScoredLabel> {
        let query = vectorize(text);
        let indices: Vec<usize> = candidate_iris
            .iter()
            .filter_map(|iri| self.by_iri.get(iri))
            .flatten()
            .copied()
            .collect();
        self.rank(&query, indices.into_iter(), k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ontology::{InMemoryOntology, OntologyClass};
    use std::collections::BTreeSet;

    fn ontology() -> InMemoryOntology {
        let mk = |iri: &str, label: &str, alts: &[&str]| OntologyClass {
            iri: iri.to_string(),
            preferred_label: label.to_string(),
            alt_labels: alts.iter().map(|a| (*a).to_string()).collect(),
            branches: BTreeSet::new(),
            definition: None,
            parents: Vec::new(),
        };
        InMemoryOntology::new(
            vec![
                mk("ex:boc", "Breach of Contract", &["contract breach"]),
                mk("ex:contract", "Contract", &["agreement"]),
                mk("ex:motion", "Motion to Dismiss", &[]),
            ],
            Vec::new(),
        )
    }

    #[test]
    fn identical_text_scores_highest() {
        let index = HashedEmbedder::from_ontology(&ontology());
        let results = index.nearest("breach of contract", 3);
        assert_eq!(results[0].iri, "ex:boc");
        assert!(results[0].score > 0.99);
    }

    #[test]
    fn related_text_outranks_unrelated() {
        let index = HashedEmbedder::from_ontology(&ontology());
        let results = index.nearest("contract", 3);
        let contract_rank = results.iter().position(|r| r.iri == "ex:contract").unwrap();
        let motion_rank = results
            .iter()
            .position(|r| r.iri == "ex:motion")
            .unwrap_or(usize::MAX);
        assert!(contract_rank < motion_rank);
    }

    #[test]
    fn nearest_in_respects_candidates() {
        let index = HashedEmbedder::from_ontology(&ontology());
        let results = index.nearest_in(
            "contract",
            &["ex:motion".to_string()],
            5,
        );
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].iri, "ex:motion");
    }

    #[test]
    fn embed_is_deterministic() {
        let index = HashedEmbedder::from_ontology(&ontology());
        assert_eq!(index.embed("some text"), index.embed("some text"));
    }

    #[test]
    fn cosine_bounds() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!((cosine(&a, &a) - 1.0).abs() < 1e-6);
        assert!(cosine(&a, &b).abs() < 1e-6);
        assert_eq!(cosine(&[], &[]), 0.0);
    }
}
