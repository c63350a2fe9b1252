//! Contextual reranking: a language-model score over a three-sentence
//! window, blended 50/50 with the pipeline score.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::annotation::{AnnotationState, ConceptMatch, LineageEvent};
use crate::config::EnrichConfig;
use crate::document::CanonicalText;
use crate::job::QualitySignal;
use crate::llm::{structured_with_retry, LanguageModel, LlmBudget};
use crate::ontology::Ontology;
use crate::pipeline::CancelFlag;
use crate::prompts;
use crate::types::Confidence;

/// Weight of the prior in the rerank blend.
const PRIOR_WEIGHT: f64 = 0.5;

/// Rerank every resolved annotation in place.
///
/// Each annotation gets a context window of the target sentence plus one
/// sentence on either side; the model scores the match against a
/// four-anchor rubric (0.95 unambiguous, 0.70 plausible, 0.40 weak, 0.20
/// likely false positive), and the new confidence is
/// `0.5 * prior + 0.5 * context`. Annotations the model failed to score
/// keep their prior. Post-blend scores below the configured floor mark the
/// annotation rejected.
pub async fn rerank_annotations(
    llm: &Arc<dyn LanguageModel>,
    annotations: &mut [ConceptMatch],
    doc: &CanonicalText,
    ontology: &dyn Ontology,
    config: &EnrichConfig,
    cancel: &CancelFlag,
    signals: &mut Vec<QualitySignal>,
) {
    if !config.rerank_enabled {
        return;
    }
    let semaphore = Arc::new(Semaphore::new(config.llm_concurrency.max(1)));
    let budget = LlmBudget::with_timeout(config.llm_call_timeout());
    let schema = prompts::contextual_rerank_schema();

    let mut tasks = Vec::new();
    for (idx, ann) in annotations.iter().enumerate() {
        if cancel.is_cancelled() {
            break;
        }
        if ann.state == AnnotationState::Rejected {
            continue;
        }
        let window = doc
            .sentences
            .sentence_of(&ann.span)
            .and_then(|i| doc.sentences.window(i, 1, 1))
            .map_or_else(|| ann.surface_text.clone(), |s| s.slice(&doc.text).to_string());
        let definition = ontology
            .class(&ann.concept_iri)
            .and_then(|c| c.definition.clone())
            .unwrap_or_default();
        let prompt = prompts::contextual_rerank(
            &ann.surface_text,
            &ann.preferred_label,
            &definition,
            &window,
        );

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
                Ok(value) => (idx, parse_score(&value)),
                Err(e) => {
                    log::warn!("contextual rerank call failed: {e}");
                    (idx, None)
                }
            }
        }));
    }

    let mut scored = 0usize;
    let mut attempted = 0usize;
    for outcome in futures::future::join_all(tasks).await {
        attempted += 1;
        let Ok((idx, maybe_score)) = outcome else {
            continue;
        };
        let Some(context_score) = maybe_score else {
            continue;
        };
        let ann = &mut annotations[idx];
        let prior = ann.confidence;
        ann.confidence = prior.blend(Confidence::saturating(context_score), PRIOR_WEIGHT);
        ann.record(
            LineageEvent::now("contextual_rerank", "reranked")
                .with_change(format!("{:.4}", prior.get()), format!("{:.4}", ann.confidence.get()))
                .with_reason(format!("context score {context_score:.2}, blended 50/50")),
        );
        if ann.confidence.get() < config.rerank_reject_below {
            ann.state = AnnotationState::Rejected;
            ann.record(
                LineageEvent::now("contextual_rerank", "rejected")
                    .with_reason("context score below floor"),
            );
        }
        scored += 1;
    }

    if scored < attempted {
        signals.push(QualitySignal {
            stage: "contextual_rerank".to_string(),
            reason: format!("scored {scored}/{attempted} annotations"),
            span_or_chunk: None,
        });
    }
    log::info!("contextual rerank scored {scored}/{attempted} annotations");
}

fn parse_score(value: &Value) -> Option<f64> {
    value
        .get("context_score")
        .and_then(Value::as_f64)
        .map(|s| s.clamp(0.0, 1.0))
}
