//! # folio-enrich
//!
//! Legal-document enrichment against the FOLIO ontology: maps spans of
//! unstructured text to concepts, individuals, and relations, producing
//! span annotations with calibrated confidence and ranked backups, OWL
//! individuals, object-property occurrences, subject–predicate–object
//! triples, and a synthesized document metadata record.
//!
//! ## Architecture
//!
//! One document per job, three phases:
//!
//! ```text
//! Phase 1 (sequential)   intake → normalization
//! Phase 2 (concurrent)   ruler ∥ concept proposer ∥ individual extractor
//!                        ∥ property matcher ∥ document-type classifier
//! Phase 3 (sequential)   reconcile → resolve → rerank → branch judge
//!                        → string-match expansion → individual linker
//!                        → property linker → dependency relations
//!                        → metadata synthesis
//! ```
//!
//! Language-model stages degrade gracefully: with no model configured the
//! deterministic stages still run, every skipped stage leaves a quality
//! signal, and the job completes.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use folio_enrich::prelude::*;
//! use std::sync::Arc;
//!
//! let ontology = Arc::new(InMemoryOntology::new(classes, properties));
//! let embedder = Arc::new(HashedEmbedder::from_ontology(ontology.as_ref()));
//! let config = EnrichConfig::default();
//! let orchestrator = Arc::new(Orchestrator::new(ontology, Some(embedder), None, &config));
//! let service = EnrichService::new(orchestrator, JobStore::new("jobs")?, config);
//!
//! let job_id = service.submit(DocumentInput::text("A claim for breach of contract."), None).await?;
//! let result = service.result(job_id, false).await?;
//! for annotation in &result.annotations {
//!     println!("{} -> {}", annotation.surface_text, annotation.concept_iri);
//! }
//! ```
//!
//! ## Design notes
//!
//! - Spans are byte offsets into the NFKC-normalized canonical text.
//! - Stage outputs are sorted by `(start, end, iri)` before handoff, so a
//!   fixed input, configuration, and deterministic model produce
//!   byte-identical canonical JSON.
//! - "Properties" throughout are OWL object properties, never key/value
//!   record fields.

#![warn(missing_docs)]

pub mod annotation;
pub mod branch;
pub mod config;
pub mod document;
pub mod embedding;
mod error;
pub mod expand;
pub mod individual;
pub mod job;
pub mod llm;
pub mod matching;
pub mod metadata;
pub mod normalize;
pub mod ontology;
pub mod pipeline;
pub mod prompts;
pub mod property;
pub mod proposer;
pub mod reconcile;
pub mod relation;
pub mod rerank;
pub mod resolve;
pub mod ruler;
pub mod service;
pub mod store;
pub mod types;

pub use annotation::{
    AnnotationState, ConceptCandidate, ConceptMatch, Individual, IndividualType, LineageEvent,
    MatchType, Predicate, PropertyAnnotation, Source, Span, Triple,
};
pub use config::EnrichConfig;
pub use document::{CanonicalText, DocumentFormat, DocumentInput, SentenceIndex, TextChunk};
pub use embedding::{Embedder, HashedEmbedder, ScoredLabel};
pub use error::{Error, Result};
pub use job::{Job, JobResult, JobState, QualitySignal, StageTiming};
pub use llm::{LanguageModel, LlmBudget, ScriptedModel};
pub use metadata::{AreaOfLaw, DocumentMetadata, DocumentTypeHypothesis};
pub use ontology::{
    InMemoryOntology, LabelIndex, LabelStratum, ObjectProperty, Ontology, OntologyClass,
};
pub use pipeline::{CancelFlag, Orchestrator, StageEvent};
pub use service::{EnrichService, JobCounts, JobStatus};
pub use store::JobStore;
pub use types::Confidence;

pub mod prelude {
    //! Commonly used items, re-exported for convenience.
    pub use crate::annotation::{
        AnnotationState, ConceptMatch, Individual, IndividualType, MatchType, PropertyAnnotation,
        Source, Span, Triple,
    };
    pub use crate::config::EnrichConfig;
    pub use crate::document::DocumentInput;
    pub use crate::embedding::{Embedder, HashedEmbedder};
    pub use crate::error::{Error, Result};
    pub use crate::job::{Job, JobResult, JobState};
    pub use crate::llm::{LanguageModel, ScriptedModel};
    pub use crate::ontology::{InMemoryOntology, ObjectProperty, Ontology, OntologyClass};
    pub use crate::pipeline::{CancelFlag, Orchestrator};
    pub use crate::service::EnrichService;
    pub use crate::store::JobStore;
    pub use crate::types::Confidence;
}
