//! Shared fixtures for integration tests.

use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use folio_enrich::pipeline::{CancelFlag, Orchestrator};
use folio_enrich::{
    DocumentInput, Embedder, EnrichConfig, HashedEmbedder, InMemoryOntology, Job, LanguageModel,
    ObjectProperty, OntologyClass,
};

pub fn class(iri: &str, label: &str, alts: &[&str], branches: &[&str]) -> OntologyClass {
    OntologyClass {
        iri: iri.to_string(),
        preferred_label: label.to_string(),
        alt_labels: alts.iter().map(|a| (*a).to_string()).collect(),
        branches: branches.iter().map(|b| (*b).to_string()).collect::<BTreeSet<_>>(),
        definition: None,
        parents: Vec::new(),
    }
}

pub fn property(iri: &str, label: &str, alts: &[&str]) -> ObjectProperty {
    ObjectProperty {
        iri: iri.to_string(),
        preferred_label: label.to_string(),
        alt_labels: alts.iter().map(|a| (*a).to_string()).collect(),
        domain_iris: Vec::new(),
        range_iris: Vec::new(),
        inverse_iri: None,
        definition: None,
    }
}

/// A small legal ontology shared by the scenario tests.
pub fn legal_ontology() -> Arc<InMemoryOntology> {
    Arc::new(InMemoryOntology::new(
        vec![
            class("ex:breach-of-contract", "Breach of Contract", &[], &["Event"]),
            class("ex:contract", "Contract", &[], &["Document"]),
            class("ex:motion-to-dismiss", "Motion to Dismiss", &[], &["Document"]),
            class("ex:court", "Court", &[], &["Actor"]),
            class("ex:motion", "Motion", &[], &["Document"]),
            class("ex:interest", "Interest", &[], &["Asset"]),
            class("ex:claim", "Claim", &[], &["Event"]),
        ],
        vec![property("ex:denies", "deny", &["denied", "denies"])],
    ))
}

/// Run one document through the full pipeline and return the job.
pub async fn run_pipeline(
    ontology: Arc<InMemoryOntology>,
    llm: Option<Arc<dyn LanguageModel>>,
    with_embedder: bool,
    text: &str,
    config: EnrichConfig,
) -> Job {
    let embedder: Option<Arc<dyn Embedder>> = if with_embedder {
        Some(Arc::new(HashedEmbedder::from_ontology(ontology.as_ref())))
    } else {
        None
    };
    let orchestrator = Orchestrator::new(ontology, embedder, llm, &config);
    let job = Arc::new(RwLock::new(Job::new()));
    let (events, _rx) = broadcast::channel(64);
    orchestrator
        .run(
            DocumentInput::text(text),
            config,
            Arc::clone(&job),
            CancelFlag::new(),
            events,
        )
        .await;
    let snapshot = job.read().await.clone();
    snapshot
}
