//! Language-model concept proposer: per-chunk contextual discovery.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::annotation::Span;
use crate::config::EnrichConfig;
use crate::document::CanonicalText;
use crate::job::QualitySignal;
use crate::llm::{structured_with_retry, LanguageModel, LlmBudget};
use crate::matching::{fold_pattern, FoldedText};
use crate::pipeline::CancelFlag;
use crate::prompts;

/// A `(concept_text, branch_hint, confidence)` tuple proposed by the
/// language model, located in the document.
#[derive(Debug, Clone, PartialEq)]
pub struct ConceptProposal {
    /// Verbatim text copied from the chunk.
    pub surface: String,
    /// First document occurrence of the surface inside the chunk.
    pub span: Span,
    /// Branch hint, possibly empty.
    pub branch_hint: String,
    /// Self-reported confidence, clamped to [0.1, 0.99].
    pub confidence: f64,
    /// Chunk the proposal came from.
    pub chunk_index: usize,
}

/// Outcome of the proposer stage: located proposals plus any quality
/// signals for chunks that failed.
#[derive(Debug, Default)]
pub struct ProposerOutput {
    /// Proposals ordered by `(span.start, span.end, surface)`.
    pub proposals: Vec<ConceptProposal>,
    /// One signal per chunk whose response could not be used.
    pub signals: Vec<QualitySignal>,
}

fn parse_chunk_response(
    value: &Value,
    chunk_text: &str,
    chunk_span: Span,
    chunk_index: usize,
) -> Vec<ConceptProposal> {
    let Some(items) = value.get("concepts").and_then(Value::as_array) else {
        return Vec::new();
    };
    // Case folding can change byte lengths, so the surface is located in
    // the folded view and mapped back through the offset table, the same
    // path the automaton scans take.
    let folded = FoldedText::fold(chunk_text);
    let mut out = Vec::new();
    for item in items {
        let Some(surface) = item.get("concept_text").and_then(Value::as_str) else {
            continue;
        };
        let surface = surface.trim();
        if surface.is_empty() {
            continue;
        }
        // Tuples whose text is not a substring of the chunk are discarded.
        let needle = fold_pattern(surface);
        let Some(rel) = folded.as_str().find(&needle) else {
            continue;
        };
        let local = folded.to_original(Span::new(rel, rel + needle.len()));
        if local.is_empty()
            || !chunk_text.is_char_boundary(local.start)
            || !chunk_text.is_char_boundary(local.end)
        {
            continue;
        }
        let branch_hint = item
            .get("branch_hint")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();
        let confidence = item
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.5)
            .clamp(0.1, 0.99);
        out.push(ConceptProposal {
            surface: chunk_text[local.start..local.end].to_string(),
            span: Span::new(chunk_span.start + local.start, chunk_span.start + local.end),
            branch_hint,
            confidence,
            chunk_index,
        });
    }
    out
}

/// Run the proposer over every chunk with bounded parallelism.
///
/// A chunk whose response fails schema validation is retried once by the
/// shared retry policy; a persistently failing chunk contributes an empty
/// result and one quality signal. Cancellation is polled per chunk.
pub async fn propose_concepts(
    llm: &Arc<dyn LanguageModel>,
    doc: &CanonicalText,
    branches: &[String],
    config: &EnrichConfig,
    cancel: &CancelFlag,
) -> ProposerOutput {
    let semaphore = Arc::new(Semaphore::new(config.llm_concurrency.max(1)));
    let budget = LlmBudget::with_timeout(config.llm_call_timeout());
    let schema = prompts::concept_identification_schema();

    let mut tasks = Vec::new();
    for chunk in &doc.chunks {
        if cancel.is_cancelled() {
            break;
        }
        let llm = Arc::clone(llm);
        let sem = Arc::clone(&semaphore);
        let chunk_text = chunk.slice(&doc.text).to_string();
        let chunk_span = chunk.span;
        let chunk_index = chunk.index;
        let prompt = prompts::concept_identification(&chunk_text, branches);
        let schema = schema.clone();
        let cancel = cancel.clone();

        tasks.push(tokio::spawn(async move {
            let _permit = sem.acquire().await;
            if cancel.is_cancelled() {
                return (chunk_index, Ok(Vec::new()));
            }
            match structured_with_retry(llm.as_ref(), &prompt, &schema, &budget).await {
                Ok(value) => (
                    chunk_index,
                    Ok(parse_chunk_response(&value, &chunk_text, chunk_span, chunk_index)),
                ),
                Err(e) => (chunk_index, Err(e)),
            }
        }));
    }

    let mut output = ProposerOutput::default();
    for task in futures::future::join_all(tasks).await {
        match task {
            Ok((_, Ok(proposals))) => output.proposals.extend(proposals),
            Ok((chunk_index, Err(e))) => {
                log::warn!("concept proposer failed for chunk {chunk_index}: {e}");
                output.signals.push(QualitySignal {
                    stage: "concept_proposer".to_string(),
                    reason: e.to_string(),
                    span_or_chunk: Some(format!("chunk:{chunk_index}")),
                });
            }
            Err(join_err) => {
                log::warn!("concept proposer task panicked: {join_err}");
                output.signals.push(QualitySignal {
                    stage: "concept_proposer".to_string(),
                    reason: format!("task failure: {join_err}"),
                    span_or_chunk: None,
                });
            }
        }
    }

    output
        .proposals
        .sort_by(|a, b| (a.span, &a.surface).cmp(&(b.span, &b.surface)));
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentInput;
    use crate::llm::ScriptedModel;
    use crate::normalize::normalize;
    use serde_json::json;

    fn doc(text: &str) -> CanonicalText {
        normalize(&DocumentInput::text(text), &EnrichConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn proposals_are_located_in_the_document() {
        let doc = doc("The plaintiff alleges breach of contract in this case.");
        let llm: Arc<dyn LanguageModel> = Arc::new(ScriptedModel::new().with_default(json!({
            "concepts": [
                {"concept_text": "breach of contract", "branch_hint": "Event", "confidence": 0.9}
            ]
        })));
        let out = propose_concepts(
            &llm,
            &doc,
            &["Event".to_string()],
            &EnrichConfig::default(),
            &CancelFlag::new(),
        )
        .await;

        assert_eq!(out.proposals.len(), 1);
        let p = &out.proposals[0];
        assert_eq!(p.surface, "breach of contract");
        assert_eq!(p.span.slice(&doc.text), "breach of contract");
        assert_eq!(p.branch_hint, "Event");
        assert!(out.signals.is_empty());
    }

    #[tokio::test]
    async fn folded_location_survives_multibyte_case_folding() {
        // "İ" lowercases to two chars, so folded byte offsets drift from
        // the original text before the match.
        let doc = doc("İnci Ltd breached the contract.");
        let llm: Arc<dyn LanguageModel> = Arc::new(ScriptedModel::new().with_default(json!({
            "concepts": [
                {"concept_text": "contract", "branch_hint": "Document", "confidence": 0.8}
            ]
        })));
        let out = propose_concepts(
            &llm,
            &doc,
            &[],
            &EnrichConfig::default(),
            &CancelFlag::new(),
        )
        .await;

        assert_eq!(out.proposals.len(), 1);
        let p = &out.proposals[0];
        assert_eq!(p.surface, "contract");
        assert_eq!(p.span.slice(&doc.text), "contract");
    }

    #[tokio::test]
    async fn non_substring_tuples_are_discarded() {
        let doc = doc("A short filing.");
        let llm: Arc<dyn LanguageModel> = Arc::new(ScriptedModel::new().with_default(json!({
            "concepts": [
                {"concept_text": "habeas corpus", "branch_hint": "", "confidence": 0.8}
            ]
        })));
        let out = propose_concepts(
            &llm,
            &doc,
            &[],
            &EnrichConfig::default(),
            &CancelFlag::new(),
        )
        .await;
        assert!(out.proposals.is_empty());
        assert!(out.signals.is_empty());
    }

    #[tokio::test]
    async fn confidence_is_clamped() {
        let doc = doc("The contract is void.");
        let llm: Arc<dyn LanguageModel> = Arc::new(ScriptedModel::new().with_default(json!({
            "concepts": [
                {"concept_text": "contract", "confidence": 1.5},
                {"concept_text": "void", "confidence": 0.0}
            ]
        })));
        let out = propose_concepts(
            &llm,
            &doc,
            &[],
            &EnrichConfig::default(),
            &CancelFlag::new(),
        )
        .await;
        assert_eq!(out.proposals.len(), 2);
        let by_surface = |s: &str| {
            out.proposals
                .iter()
                .find(|p| p.surface == s)
                .unwrap()
                .confidence
        };
        assert!((by_surface("contract") - 0.99).abs() < 1e-9);
        assert!((by_surface("void") - 0.1).abs() < 1e-9);
    }

    #[tokio::test]
    async fn failing_chunk_yields_quality_signal() {
        let doc = doc("Some text nobody scripted.");
        // No default response: every chunk fails with a schema error.
        let llm: Arc<dyn LanguageModel> = Arc::new(ScriptedModel::new());
        let out = propose_concepts(
            &llm,
            &doc,
            &[],
            &EnrichConfig::default(),
            &CancelFlag::new(),
        )
        .await;
        assert!(out.proposals.is_empty());
        assert_eq!(out.signals.len(), 1);
        assert_eq!(out.signals[0].stage, "concept_proposer");
        assert_eq!(out.signals[0].span_or_chunk.as_deref(), Some("chunk:0"));
    }
}
