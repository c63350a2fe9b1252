//! Document-level synthesis: type classification, the metadata record,
//! area-of-law assessment, and the document-type quality cross-check.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::annotation::IndividualType;
use crate::config::EnrichConfig;
use crate::document::CanonicalText;
use crate::job::{JobResult, QualitySignal};
use crate::llm::{structured_with_retry, LanguageModel, LlmBudget};
use crate::prompts;

/// Classifier output for the document's type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentTypeHypothesis {
    /// The predicted type, e.g. "Motion to Dismiss".
    pub document_type: String,
    /// Classifier confidence.
    pub confidence: f64,
    /// One-line explanation.
    #[serde(default)]
    pub reasoning: String,
}

/// One ranked area-of-law assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AreaOfLaw {
    /// Area name, e.g. "Contract Law".
    pub area: String,
    /// Assessment confidence.
    pub confidence: f64,
}

/// The synthesized document metadata record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
#[allow(missing_docs)]
pub struct DocumentMetadata {
    pub document_type: String,
    pub document_title: String,
    pub case_name: String,
    pub court: String,
    pub judge: String,
    pub case_number: String,
    pub docket_entry_number: String,
    pub parties: Vec<String>,
    pub attorneys: Vec<String>,
    pub signatories: Vec<String>,
    pub witnesses: Vec<String>,
    pub jurisdiction: String,
    pub procedural_posture: String,
    pub cause_of_action: String,
    pub claim_types: Vec<String>,
    pub relief_sought: String,
    pub disposition: String,
    pub standard_of_review: String,
    pub governing_law: String,
    pub contract_type: String,
    pub counterparties: Vec<String>,
    pub term_duration: String,
    pub termination_conditions: String,
    pub consideration: String,
    pub date_filed: String,
    pub date_signed: String,
    pub date_effective: String,
    pub dates_mentioned: Vec<String>,
}

/// Classify the document's type from its opening. Runs in the concurrent
/// phase; returns `None` on failure (recorded by the caller).
pub async fn classify_document_type(
    llm: &Arc<dyn LanguageModel>,
    doc: &CanonicalText,
    config: &EnrichConfig,
) -> Option<DocumentTypeHypothesis> {
    let opening: String = doc.text.chars().take(500).collect();
    let budget = LlmBudget::with_timeout(config.llm_call_timeout());
    let value = structured_with_retry(
        llm.as_ref(),
        &prompts::document_type(&opening),
        &prompts::document_type_schema(),
        &budget,
    )
    .await
    .ok()?;
    Some(DocumentTypeHypothesis {
        document_type: value.get("document_type")?.as_str()?.to_string(),
        confidence: value
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.5)
            .clamp(0.0, 1.0),
        reasoning: value
            .get("reasoning")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
    })
}

/// Assemble the context block fed to the metadata synthesizer: entities by
/// type, relationships, concepts, properties, and the document bookends.
#[must_use]
pub fn build_context_block(result: &JobResult, doc: &CanonicalText) -> String {
    let mut lines: Vec<String> = Vec::new();

    let mut by_type: HashMap<IndividualType, Vec<&str>> = HashMap::new();
    for ind in &result.individuals {
        by_type
            .entry(ind.individual_type)
            .or_default()
            .push(&ind.surface_text);
    }
    if !by_type.is_empty() {
        lines.push("NAMED ENTITIES:".to_string());
        let mut types: Vec<_> = by_type.keys().copied().collect();
        types.sort();
        for t in types {
            let mut names = by_type[&t].clone();
            names.dedup();
            lines.push(format!("  {}: {}", t.as_label(), names.join(", ")));
        }
    }

    if !result.triples.is_empty() {
        lines.push(String::new());
        lines.push("RELATIONSHIPS:".to_string());
        let by_id: HashMap<_, _> = result
            .annotations
            .iter()
            .map(|a| (a.id, a.surface_text.as_str()))
            .collect();
        for t in result.triples.iter().take(30) {
            let subject = by_id.get(&t.subject_id).copied().unwrap_or("?");
            let object = by_id.get(&t.object_id).copied().unwrap_or("?");
            lines.push(format!("  {} -{}-> {}", subject, t.predicate.value(), object));
        }
    }

    let mut concepts: Vec<&str> = result
        .annotations
        .iter()
        .filter(|a| a.state != crate::annotation::AnnotationState::Rejected)
        .map(|a| a.preferred_label.as_str())
        .collect();
    concepts.sort_unstable();
    concepts.dedup();
    if !concepts.is_empty() {
        lines.push(String::new());
        lines.push(format!("LEGAL CONCEPTS (top {}):", concepts.len().min(40)));
        lines.push(format!("  {}", concepts[..concepts.len().min(40)].join(", ")));
    }

    let mut props: Vec<&str> = result
        .properties
        .iter()
        .map(|p| p.preferred_label.as_str())
        .collect();
    props.sort_unstable();
    props.dedup();
    if !props.is_empty() {
        lines.push(String::new());
        lines.push("PROPERTIES/RELATIONS FOUND:".to_string());
        lines.push(format!("  {}", props.join(", ")));
    }

    let header: String = doc.text.chars().take(1000).collect();
    lines.push(String::new());
    lines.push("DOCUMENT HEADER (first ~1000 chars):".to_string());
    lines.push(header);
    if doc.text.len() > 1500 {
        let tail_start = doc.text.len() - 500;
        let tail_start = (tail_start..doc.text.len())
            .find(|&i| doc.text.is_char_boundary(i))
            .unwrap_or(doc.text.len());
        lines.push(String::new());
        lines.push("SIGNATURE BLOCK (last ~500 chars):".to_string());
        lines.push(doc.text[tail_start..].to_string());
    }

    lines.join("\n")
}

/// Synthesize the metadata record.
///
/// With a language model the full pipeline context goes into one
/// structured call. Without one, a minimal record is assembled from the
/// extracted individuals and the most frequent concept branches.
pub async fn synthesize_metadata(
    llm: Option<&Arc<dyn LanguageModel>>,
    result: &JobResult,
    doc: &CanonicalText,
    doc_type: Option<&DocumentTypeHypothesis>,
    config: &EnrichConfig,
    signals: &mut Vec<QualitySignal>,
) -> DocumentMetadata {
    let type_label = doc_type.map_or("Unknown", |h| h.document_type.as_str());

    if let Some(llm) = llm {
        let context = build_context_block(result, doc);
        let budget = LlmBudget::with_timeout(config.llm_call_timeout());
        match structured_with_retry(
            llm.as_ref(),
            &prompts::metadata_synthesis(&context, type_label),
            &prompts::metadata_schema(),
            &budget,
        )
        .await
        {
            Ok(value) => match serde_json::from_value::<DocumentMetadata>(value) {
                Ok(mut metadata) => {
                    if metadata.document_type.is_empty() {
                        metadata.document_type = type_label.to_string();
                    }
                    return metadata;
                }
                Err(e) => {
                    log::warn!("metadata response failed to deserialize: {e}");
                    signals.push(QualitySignal {
                        stage: "metadata_synthesizer".to_string(),
                        reason: format!("schema mismatch: {e}"),
                        span_or_chunk: None,
                    });
                }
            },
            Err(e) => {
                log::warn!("metadata synthesis failed: {e}");
                signals.push(QualitySignal {
                    stage: "metadata_synthesizer".to_string(),
                    reason: e.to_string(),
                    span_or_chunk: None,
                });
            }
        }
    }

    minimal_metadata(result, type_label)
}

/// The LM-less fallback: parties from person/org individuals, dates from
/// date individuals, court from court individuals, claim types from the
/// most frequent concept branches.
#[must_use]
pub fn minimal_metadata(result: &JobResult, type_label: &str) -> DocumentMetadata {
    let mut metadata = DocumentMetadata {
        document_type: type_label.to_string(),
        ..DocumentMetadata::default()
    };

    let of_type = |t: IndividualType| -> Vec<String> {
        let mut v: Vec<String> = result
            .individuals
            .iter()
            .filter(|i| i.individual_type == t)
            .map(|i| i.surface_text.clone())
            .collect();
        v.dedup();
        v
    };

    metadata.parties = of_type(IndividualType::Person);
    metadata.counterparties = of_type(IndividualType::Org);
    if let Some(court) = of_type(IndividualType::Court).into_iter().next() {
        metadata.court = court;
    }
    if let Some(number) = result
        .individuals
        .iter()
        .find(|i| i.individual_type == IndividualType::CaseNumber)
    {
        metadata.case_number = number
            .normalized_form
            .clone()
            .unwrap_or_else(|| number.surface_text.clone());
    }
    let dates: Vec<String> = result
        .individuals
        .iter()
        .filter(|i| i.individual_type == IndividualType::Date)
        .map(|i| {
            i.normalized_form
                .clone()
                .unwrap_or_else(|| i.surface_text.clone())
        })
        .collect();
    if let Some(first) = dates.first() {
        metadata.date_filed = first.clone();
    }
    metadata.dates_mentioned = dates;

    // Most frequent branches across accepted annotations.
    let mut branch_counts: HashMap<&str, usize> = HashMap::new();
    for ann in &result.annotations {
        if ann.state == crate::annotation::AnnotationState::Rejected {
            continue;
        }
        for branch in &ann.branches {
            *branch_counts.entry(branch.as_str()).or_insert(0) += 1;
        }
    }
    let mut ranked: Vec<(&str, usize)> = branch_counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    metadata.claim_types = ranked
        .into_iter()
        .take(3)
        .map(|(branch, _)| branch.to_string())
        .collect();

    metadata
}

/// Post-pipeline area-of-law assessment. Empty on failure.
pub async fn assess_areas_of_law(
    llm: &Arc<dyn LanguageModel>,
    result: &JobResult,
    doc_type: Option<&DocumentTypeHypothesis>,
    config: &EnrichConfig,
) -> Vec<AreaOfLaw> {
    let mut concepts: Vec<String> = result
        .annotations
        .iter()
        .filter(|a| a.state != crate::annotation::AnnotationState::Rejected)
        .map(|a| a.preferred_label.clone())
        .collect();
    concepts.sort();
    concepts.dedup();
    concepts.truncate(40);

    let type_label = doc_type.map_or("Unknown", |h| h.document_type.as_str());
    let budget = LlmBudget::with_timeout(config.llm_call_timeout());
    let Ok(value) = structured_with_retry(
        llm.as_ref(),
        &prompts::area_of_law(&concepts, type_label),
        &prompts::area_of_law_schema(),
        &budget,
    )
    .await
    else {
        return Vec::new();
    };

    let Some(items) = value.get("areas").and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            Some(AreaOfLaw {
                area: item.get("area")?.as_str()?.to_string(),
                confidence: item
                    .get("confidence")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.5)
                    .clamp(0.0, 1.0),
            })
        })
        .collect()
}

/// Cross-check the classifier hypothesis against the synthesized record.
/// A disagreement produces one quality signal.
pub async fn cross_check_document_type(
    llm: &Arc<dyn LanguageModel>,
    hypothesis: &DocumentTypeHypothesis,
    metadata: &DocumentMetadata,
    config: &EnrichConfig,
) -> Vec<QualitySignal> {
    if metadata.document_type.is_empty() {
        return Vec::new();
    }
    let budget = LlmBudget::with_timeout(config.llm_call_timeout());
    let Ok(value) = structured_with_retry(
        llm.as_ref(),
        &prompts::document_type_check(&hypothesis.document_type, &metadata.document_type),
        &prompts::document_type_check_schema(),
        &budget,
    )
    .await
    else {
        return Vec::new();
    };

    if value.get("agree").and_then(Value::as_bool) == Some(false) {
        let note = value
            .get("note")
            .and_then(Value::as_str)
            .unwrap_or("document type determinations disagree");
        return vec![QualitySignal {
            stage: "document_type_check".to_string(),
            reason: note.to_string(),
            span_or_chunk: None,
        }];
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::{Individual, LineageEvent, Source, Span};
    use crate::document::DocumentInput;
    use crate::llm::ScriptedModel;
    use crate::normalize::normalize;
    use crate::types::Confidence;
    use serde_json::json;
    use uuid::Uuid;

    fn individual(t: IndividualType, surface: &str, normalized: Option<&str>) -> Individual {
        Individual {
            id: Uuid::new_v4(),
            span: Span::new(0, surface.len()),
            surface_text: surface.to_string(),
            individual_type: t,
            normalized_form: normalized.map(str::to_string),
            resolved_url: None,
            linked_concept_iri: None,
            confidence: Confidence::saturating(0.9),
            sources: vec![Source::Ruler],
            lineage: vec![LineageEvent::now("individual_extraction", "created")],
        }
    }

    #[test]
    fn minimal_record_uses_individuals() {
        let mut result = JobResult::default();
        result.individuals = vec![
            individual(IndividualType::Person, "Mr. John Public", None),
            individual(IndividualType::Org, "Acme Corp.", None),
            individual(IndividualType::Court, "Supreme Court of Ohio", None),
            individual(IndividualType::Date, "January 15, 2024", Some("2024-01-15")),
            individual(IndividualType::CaseNumber, "No. 19-1234", Some("19-1234")),
        ];

        let metadata = minimal_metadata(&result, "Complaint");
        assert_eq!(metadata.document_type, "Complaint");
        assert_eq!(metadata.parties, vec!["Mr. John Public".to_string()]);
        assert_eq!(metadata.counterparties, vec!["Acme Corp.".to_string()]);
        assert_eq!(metadata.court, "Supreme Court of Ohio");
        assert_eq!(metadata.case_number, "19-1234");
        assert_eq!(metadata.date_filed, "2024-01-15");
        assert_eq!(metadata.dates_mentioned, vec!["2024-01-15".to_string()]);
    }

    #[tokio::test]
    async fn classifier_parses_hypothesis() {
        let doc = normalize(
            &DocumentInput::text("MOTION TO DISMISS. Defendant moves to dismiss."),
            &EnrichConfig::default(),
        )
        .unwrap();
        let llm: Arc<dyn LanguageModel> = Arc::new(ScriptedModel::new().with_response(
            "classifier",
            json!({"document_type": "Motion to Dismiss", "confidence": 0.95, "reasoning": "caption"}),
        ).with_default(json!({"document_type": "Motion to Dismiss", "confidence": 0.95})));

        let hypothesis = classify_document_type(&llm, &doc, &EnrichConfig::default())
            .await
            .unwrap();
        assert_eq!(hypothesis.document_type, "Motion to Dismiss");
        assert!((hypothesis.confidence - 0.95).abs() < 1e-9);
    }

    #[tokio::test]
    async fn synthesis_falls_back_on_failure() {
        let result = JobResult::default();
        let doc = normalize(&DocumentInput::text("Text."), &EnrichConfig::default()).unwrap();
        let llm: Arc<dyn LanguageModel> = Arc::new(ScriptedModel::new()); // always fails
        let mut signals = Vec::new();

        let metadata = synthesize_metadata(
            Some(&llm),
            &result,
            &doc,
            None,
            &EnrichConfig::default(),
            &mut signals,
        )
        .await;
        assert_eq!(metadata.document_type, "Unknown");
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].stage, "metadata_synthesizer");
    }

    #[tokio::test]
    async fn cross_check_disagreement_signals() {
        let hypothesis = DocumentTypeHypothesis {
            document_type: "Complaint".to_string(),
            confidence: 0.9,
            reasoning: String::new(),
        };
        let metadata = DocumentMetadata {
            document_type: "Commercial Lease".to_string(),
            ..DocumentMetadata::default()
        };
        let llm: Arc<dyn LanguageModel> = Arc::new(
            ScriptedModel::new().with_default(json!({"agree": false, "note": "mismatch"})),
        );

        let signals = cross_check_document_type(
            &llm,
            &hypothesis,
            &metadata,
            &EnrichConfig::default(),
        )
        .await;
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].stage, "document_type_check");
    }

    #[test]
    fn metadata_serde_roundtrip() {
        let metadata = DocumentMetadata {
            document_type: "Order".to_string(),
            parties: vec!["A".to_string(), "B".to_string()],
            ..DocumentMetadata::default()
        };
        let json = serde_json::to_string(&metadata).unwrap();
        let back: DocumentMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(metadata, back);
    }
}
