//! Branch disambiguation for concepts that live in several ontology
//! branches.

use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::annotation::{AnnotationState, ConceptMatch, LineageEvent};
use crate::config::EnrichConfig;
use crate::document::CanonicalText;
use crate::job::QualitySignal;
use crate::llm::{structured_with_retry, LanguageModel, LlmBudget};
use crate::pipeline::CancelFlag;
use crate::prompts;
use crate::types::Confidence;

/// Weight of the existing score in the branch-judge blend.
const PRIOR_WEIGHT: f64 = 0.7;

/// Disambiguate branches for annotations whose resolved concept belongs to
/// two or more branches.
///
/// The judge sees the surface text, its enclosing sentence, and the
/// candidate branches. Its verdict replaces `branches`; the losers move to
/// `backup_branches`; confidence fuses as
/// `0.7 * existing + 0.3 * judge_score`. When the judge returns no score,
/// no fusion is applied and the prior is preserved unchanged.
pub async fn judge_branches(
    llm: &Arc<dyn LanguageModel>,
    annotations: &mut [ConceptMatch],
    doc: &CanonicalText,
    config: &EnrichConfig,
    cancel: &CancelFlag,
    signals: &mut Vec<QualitySignal>,
) {
    let semaphore = Arc::new(Semaphore::new(config.llm_concurrency.max(1)));
    let budget = LlmBudget::with_timeout(config.llm_call_timeout());
    let schema = prompts::branch_judge_schema();

    let mut tasks = Vec::new();
    for (idx, ann) in annotations.iter().enumerate() {
        if cancel.is_cancelled() {
            break;
        }
        if ann.state == AnnotationState::Rejected || ann.branches.len() < 2 {
            continue;
        }
        let sentence = doc
            .sentences
            .sentence_of(&ann.span)
            .and_then(|i| doc.sentences.span(i))
            .map_or_else(|| ann.surface_text.clone(), |s| s.slice(&doc.text).to_string());
        let candidates: Vec<String> = ann.branches.iter().cloned().collect();
        let prompt = prompts::branch_judge(&ann.surface_text, &sentence, &candidates);

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
                Ok(value) => (idx, Some(value)),
                Err(e) => {
                    log::warn!("branch judge call failed: {e}");
                    (idx, None)
                }
            }
        }));
    }

    let mut judged = 0usize;
    let mut attempted = 0usize;
    for outcome in futures::future::join_all(tasks).await {
        attempted += 1;
        let Ok((idx, maybe_value)) = outcome else {
            continue;
        };
        let Some(value) = maybe_value else {
            continue;
        };
        let ann = &mut annotations[idx];
        apply_verdict(ann, &value);
        judged += 1;
    }

    if judged < attempted {
        signals.push(QualitySignal {
            stage: "branch_judge".to_string(),
            reason: format!("judged {judged}/{attempted} annotations"),
            span_or_chunk: None,
        });
    }
    log::info!("branch judge settled {judged}/{attempted} multi-branch annotations");
}

fn apply_verdict(ann: &mut ConceptMatch, value: &Value) {
    let chosen = value
        .get("branch")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string();
    if chosen.is_empty() || !ann.branches.iter().any(|b| b.eq_ignore_ascii_case(&chosen)) {
        // The judge could not pick one of the candidates; leave the
        // annotation untouched.
        ann.record(
            LineageEvent::now("branch_judge", "skipped")
                .with_reason("judge returned no usable branch"),
        );
        return;
    }

    let before = ann
        .branches
        .iter()
        .cloned()
        .collect::<Vec<_>>()
        .join(", ");

    let winner = ann
        .branches
        .iter()
        .find(|b| b.eq_ignore_ascii_case(&chosen))
        .cloned()
        .expect("checked above");
    let losers: BTreeSet<String> = ann
        .branches
        .iter()
        .filter(|b| **b != winner)
        .cloned()
        .collect();
    ann.branches = BTreeSet::from([winner.clone()]);
    ann.backup_branches.extend(losers);

    // Missing judge score means no fusion is applied.
    if let Some(judge_score) = value.get("judge_score").and_then(Value::as_f64) {
        let prior = ann.confidence;
        ann.confidence = prior.blend(Confidence::saturating(judge_score), PRIOR_WEIGHT);
        ann.record(
            LineageEvent::now("branch_judge", "branch_assigned")
                .with_change(before, winner)
                .with_reason(format!(
                    "judge score {judge_score:.2}, blended 70/30"
                )),
        );
    } else {
        ann.record(
            LineageEvent::now("branch_judge", "branch_assigned")
                .with_change(before, winner)
                .with_reason("judge returned no score; prior preserved"),
        );
    }
    ann.state = AnnotationState::Confirmed;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::{MatchType, Source, Span};
    use crate::document::DocumentInput;
    use crate::llm::ScriptedModel;
    use crate::normalize::normalize;
    use serde_json::json;

    fn doc(text: &str) -> CanonicalText {
        normalize(&DocumentInput::text(text), &EnrichConfig::default()).unwrap()
    }

    fn multi_branch(surface: &str, span: Span, conf: f64, branches: &[&str]) -> ConceptMatch {
        let mut ann = ConceptMatch::new(
            span,
            surface,
            format!("ex:{surface}"),
            surface,
            MatchType::PreferredLabel,
            Confidence::saturating(conf),
            Source::Ruler,
            "resolver",
        );
        ann.branches = branches.iter().map(|b| (*b).to_string()).collect();
        ann
    }

    #[tokio::test]
    async fn winner_replaces_branches_and_fusion_applies() {
        let doc = doc("The trustee holds the estate.");
        let llm: Arc<dyn LanguageModel> = Arc::new(ScriptedModel::new().with_default(json!({
            "branch": "Actor", "judge_score": 0.9, "reasoning": "an actor"
        })));
        let mut anns = vec![multi_branch(
            "trustee",
            Span::new(4, 11),
            0.6,
            &["Actor", "Document"],
        )];
        let mut signals = Vec::new();

        judge_branches(
            &llm,
            &mut anns,
            &doc,
            &EnrichConfig::default(),
            &CancelFlag::new(),
            &mut signals,
        )
        .await;

        let ann = &anns[0];
        // 0.7 * 0.6 + 0.3 * 0.9 = 0.69
        assert!((ann.confidence.get() - 0.69).abs() < 1e-9);
        assert_eq!(ann.branches, BTreeSet::from(["Actor".to_string()]));
        assert_eq!(ann.backup_branches, BTreeSet::from(["Document".to_string()]));
        assert_eq!(ann.state, AnnotationState::Confirmed);
    }

    #[tokio::test]
    async fn single_branch_annotations_are_skipped() {
        let doc = doc("The contract controls.");
        let llm: Arc<dyn LanguageModel> = Arc::new(ScriptedModel::new().with_default(json!({
            "branch": "Document", "judge_score": 0.9
        })));
        let mut anns = vec![multi_branch("contract", Span::new(4, 12), 0.8, &["Document"])];
        let mut signals = Vec::new();

        judge_branches(
            &llm,
            &mut anns,
            &doc,
            &EnrichConfig::default(),
            &CancelFlag::new(),
            &mut signals,
        )
        .await;

        assert!((anns[0].confidence.get() - 0.8).abs() < 1e-9);
        assert!(anns[0].backup_branches.is_empty());
    }

    #[tokio::test]
    async fn missing_judge_score_preserves_prior() {
        let doc = doc("The security interest attached.");
        let llm: Arc<dyn LanguageModel> = Arc::new(
            ScriptedModel::new().with_default(json!({"branch": "Asset"})),
        );
        let mut anns = vec![multi_branch(
            "security interest",
            Span::new(4, 21),
            0.65,
            &["Asset", "Event"],
        )];
        let mut signals = Vec::new();

        judge_branches(
            &llm,
            &mut anns,
            &doc,
            &EnrichConfig::default(),
            &CancelFlag::new(),
            &mut signals,
        )
        .await;

        let ann = &anns[0];
        assert!((ann.confidence.get() - 0.65).abs() < 1e-9);
        assert_eq!(ann.branches, BTreeSet::from(["Asset".to_string()]));
        assert_eq!(ann.backup_branches, BTreeSet::from(["Event".to_string()]));
    }

    #[tokio::test]
    async fn unusable_verdict_leaves_annotation_untouched() {
        let doc = doc("The filing was late.");
        let llm: Arc<dyn LanguageModel> = Arc::new(
            ScriptedModel::new().with_default(json!({"branch": "Nonexistent", "judge_score": 0.9})),
        );
        let mut anns = vec![multi_branch(
            "filing",
            Span::new(4, 10),
            0.7,
            &["Document", "Event"],
        )];
        let mut signals = Vec::new();

        judge_branches(
            &llm,
            &mut anns,
            &doc,
            &EnrichConfig::default(),
            &CancelFlag::new(),
            &mut signals,
        )
        .await;

        assert_eq!(anns[0].branches.len(), 2);
        assert!((anns[0].confidence.get() - 0.7).abs() < 1e-9);
        assert!(anns[0].lineage.iter().any(|e| e.action == "skipped"));
    }
}
