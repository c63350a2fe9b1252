//! Ontology collaborator: class and object-property records, the label
//! index, and descendant queries.
//!
//! The ontology is a DAG with multiple-inheritance concepts, so everything
//! here works with IRIs (stable ids) rather than object references.
//! `is_descendant` is a memoized BFS over the parent edges.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::RwLock;

/// A concept class from the ontology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OntologyClass {
    /// Stable identifier.
    pub iri: String,
    /// Primary human label.
    pub preferred_label: String,
    /// Synonyms and variants.
    #[serde(default)]
    pub alt_labels: Vec<String>,
    /// High-level categories this class belongs to (Actor, Document,
    /// Event, ...). Multiple branches are possible.
    #[serde(default)]
    pub branches: BTreeSet<String>,
    /// Textual definition, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<String>,
    /// Direct superclass IRIs.
    #[serde(default)]
    pub parents: Vec<String>,
}

/// An OWL object property (a legal verb or relation between classes).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectProperty {
    /// Stable identifier.
    pub iri: String,
    /// Primary human label.
    pub preferred_label: String,
    /// Synonyms and variants.
    #[serde(default)]
    pub alt_labels: Vec<String>,
    /// Allowed subject class IRIs.
    #[serde(default)]
    pub domain_iris: Vec<String>,
    /// Allowed object class IRIs.
    #[serde(default)]
    pub range_iris: Vec<String>,
    /// Inverse property, when declared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inverse_iri: Option<String>,
    /// Textual definition, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<String>,
}

/// Read-only ontology access consumed by the pipeline.
///
/// Implementations are process-wide singletons constructed at startup; no
/// stage mutates them.
pub trait Ontology: Send + Sync {
    /// All concept classes.
    fn classes(&self) -> Box<dyn Iterator<Item = &OntologyClass> + '_>;

    /// All object properties.
    fn object_properties(&self) -> Box<dyn Iterator<Item = &ObjectProperty> + '_>;

    /// Look up a class by IRI.
    fn class(&self, iri: &str) -> Option<&OntologyClass>;

    /// Branch membership for a class, walking ancestors when the class
    /// itself carries none.
    fn branches_for(&self, iri: &str) -> BTreeSet<String>;

    /// True when `iri` is `ancestor_iri` or transitively below it.
    fn is_descendant(&self, iri: &str, ancestor_iri: &str) -> bool;
}

/// Which label stratum an index entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelStratum {
    /// The concept's primary label.
    Preferred,
    /// One of its alternative labels.
    Alternative,
}

/// One label-to-concept binding in the label index.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelHit {
    /// Concept IRI the label belongs to.
    pub iri: String,
    /// The label text as it appears in the ontology.
    pub label: String,
    /// Preferred or alternative.
    pub stratum: LabelStratum,
}

/// Folded-label lookup over every class label in the ontology.
///
/// The same folded label may bind several concepts (same synonym on
/// different IRIs); all bindings are kept, and the ruler emits one match
/// per candidate IRI.
#[derive(Debug, Default)]
pub struct LabelIndex {
    entries: HashMap<String, Vec<LabelHit>>,
}

impl LabelIndex {
    /// Build the index from an ontology.
    #[must_use]
    pub fn build(ontology: &dyn Ontology) -> Self {
        let mut entries: HashMap<String, Vec<LabelHit>> = HashMap::new();
        for class in ontology.classes() {
            let mut push = |label: &str, stratum: LabelStratum| {
                if label.is_empty() {
                    return;
                }
                let key = crate::normalize::normalize_surface(label);
                let hits = entries.entry(key).or_default();
                // Same (iri, stratum) pair only once per label.
                if !hits.iter().any(|h| h.iri == class.iri && h.stratum == stratum) {
                    hits.push(LabelHit {
                        iri: class.iri.clone(),
                        label: label.to_string(),
                        stratum,
                    });
                }
            };
            push(&class.preferred_label, LabelStratum::Preferred);
            for alt in &class.alt_labels {
                push(alt, LabelStratum::Alternative);
            }
        }
        // Deterministic hit order: preferred first, then by IRI.
        for hits in entries.values_mut() {
            hits.sort_by(|a, b| {
                let sa = matches!(a.stratum, LabelStratum::Alternative);
                let sb = matches!(b.stratum, LabelStratum::Alternative);
                sa.cmp(&sb).then_with(|| a.iri.cmp(&b.iri))
            });
        }
        Self { entries }
    }

    /// All bindings for a folded surface string.
    #[must_use]
    pub fn lookup(&self, folded_surface: &str) -> &[LabelHit] {
        self.entries.get(folded_surface).map_or(&[], Vec::as_slice)
    }

    /// Iterate every (folded label, hits) pair.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<LabelHit>)> {
        self.entries.iter()
    }

    /// Number of distinct folded labels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the index holds no labels.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// In-memory [`Ontology`] built from class and property records.
pub struct InMemoryOntology {
    classes: Vec<OntologyClass>,
    by_iri: HashMap<String, usize>,
    properties: Vec<ObjectProperty>,
    descendant_memo: RwLock<HashMap<(String, String), bool>>,
}

impl InMemoryOntology {
    /// Build from records. Later duplicates of an IRI are ignored.
    #[must_use]
    pub fn new(classes: Vec<OntologyClass>, properties: Vec<ObjectProperty>) -> Self {
        let mut by_iri = HashMap::with_capacity(classes.len());
        for (i, class) in classes.iter().enumerate() {
            by_iri.entry(class.iri.clone()).or_insert(i);
        }
        Self {
            classes,
            by_iri,
            properties,
            descendant_memo: RwLock::new(HashMap::new()),
        }
    }

    /// Number of classes.
    #[must_use]
    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    fn bfs_is_descendant(&self, iri: &str, ancestor: &str) -> bool {
        if iri == ancestor {
            return true;
        }
        let mut seen: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(iri);
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(&idx) = self.by_iri.get(current) {
                for parent in &self.classes[idx].parents {
                    if parent == ancestor {
                        return true;
                    }
                    queue.push_back(parent);
                }
            }
        }
        false
    }
}

impl Ontology for InMemoryOntology {
    fn classes(&self) -> Box<dyn Iterator<Item = &OntologyClass> + '_> {
        Box::new(self.classes.iter())
    }

    fn object_properties(&self) -> Box<dyn Iterator<Item = &ObjectProperty> + '_> {
        Box::new(self.properties.iter())
    }

    fn class(&self, iri: &str) -> Option<&OntologyClass> {
        self.by_iri.get(iri).map(|&i| &self.classes[i])
    }

    fn branches_for(&self, iri: &str) -> BTreeSet<String> {
        // Direct branches win; otherwise inherit from the nearest ancestors
        // that carry any.
        let mut seen: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(iri);
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(class) = self.class(current) {
                if !class.branches.is_empty() {
                    return class.branches.clone();
                }
                for parent in &class.parents {
                    queue.push_back(parent);
                }
            }
        }
        BTreeSet::new()
    }

    fn is_descendant(&self, iri: &str, ancestor_iri: &str) -> bool {
        let key = (iri.to_string(), ancestor_iri.to_string());
        if let Some(&cached) = self.descendant_memo.read().expect("memo lock").get(&key) {
            return cached;
        }
        let result = self.bfs_is_descendant(iri, ancestor_iri);
        self.descendant_memo
            .write()
            .expect("memo lock")
            .insert(key, result);
        result
    }
}
