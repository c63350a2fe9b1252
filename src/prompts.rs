//! Prompt templates and structured-response schemas.
//!
//! Prompts are data: templates with injected lists (branch names,
//! candidate labels, pipeline context). Each structured prompt has a JSON
//! schema versioned alongside it; the version string travels in the prompt
//! so responses can be audited against the schema that produced them.

use serde_json::{json, Value};

/// Schema version stamped into every structured prompt.
pub const SCHEMA_VERSION: &str = "2024-06";

/// Prompt for per-chunk concept discovery.
#[must_use]
pub fn concept_identification(chunk_text: &str, branches: &[String]) -> String {
    format!(
        "You are a legal ontology annotator (schema {version}). Identify legal concepts \
         in the passage below.\n\n\
         Ontology branches:\n{branches}\n\n\
         Rules:\n\
         - concept_text must be verbatim contiguous text copied from the passage\n\
         - branch_hint must be one of the branches listed above, or empty\n\
         - confidence is your own estimate in [0, 1]\n\n\
         Respond with JSON: {{\"concepts\": [{{\"concept_text\": \"...\", \
         \"branch_hint\": \"...\", \"confidence\": 0.9}}]}}\n\n\
         PASSAGE:\n{chunk}",
        version = SCHEMA_VERSION,
        branches = branches.join(", "),
        chunk = chunk_text,
    )
}

/// Schema for [`concept_identification`] responses.
#[must_use]
pub fn concept_identification_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "concepts": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "concept_text": {"type": "string"},
                        "branch_hint": {"type": "string"},
                        "confidence": {"type": "number"}
                    },
                    "required": ["concept_text"]
                }
            }
        },
        "required": ["concepts"]
    })
}

/// Prompt for contextual reranking of one resolved annotation.
#[must_use]
pub fn contextual_rerank(surface: &str, label: &str, definition: &str, window: &str) -> String {
    format!(
        "You are scoring how well an ontology concept fits its context \
         (schema {version}).\n\n\
         Concept: {label}\n\
         Definition: {definition}\n\
         Matched text: \"{surface}\"\n\
         Context:\n{window}\n\n\
         Score the match against this rubric:\n\
         - 0.95: unambiguous, this is clearly the concept\n\
         - 0.70: plausible reading in this context\n\
         - 0.40: weak, the context suggests another sense\n\
         - 0.20: likely a false positive\n\n\
         Respond with JSON: {{\"context_score\": 0.7}}",
        version = SCHEMA_VERSION,
        label = label,
        definition = definition,
        surface = surface,
        window = window,
    )
}

/// Schema for [`contextual_rerank`] responses.
#[must_use]
pub fn contextual_rerank_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "context_score": {"type": "number"}
        },
        "required": ["context_score"]
    })
}

/// Prompt for branch disambiguation of one annotation.
#[must_use]
pub fn branch_judge(surface: &str, sentence: &str, candidates: &[String]) -> String {
    format!(
        "You are a legal ontology expert (schema {version}). A concept appears in a \
         sentence; pick the single branch it best belongs to.\n\n\
         Concept: {surface}\n\
         Sentence: {sentence}\n\
         Candidate branches: {candidates}\n\n\
         Respond with JSON: {{\"branch\": \"...\", \"judge_score\": 0.9, \
         \"reasoning\": \"...\"}}",
        version = SCHEMA_VERSION,
        surface = surface,
        sentence = sentence,
        candidates = candidates.join(", "),
    )
}

/// Schema for [`branch_judge`] responses.
#[must_use]
pub fn branch_judge_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "branch": {"type": "string"},
            "judge_score": {"type": "number"},
            "reasoning": {"type": "string"}
        },
        "required": ["branch"]
    })
}

/// Prompt for single-shot document-type classification from the opening.
#[must_use]
pub fn document_type(opening: &str) -> String {
    format!(
        "You are a legal document classifier (schema {version}). Classify the document \
         from its opening.\n\n\
         Common types: Motion to Dismiss, Motion for Summary Judgment, Complaint, \
         Answer, Counterclaim, Commercial Lease, Employment Agreement, NDA, \
         Purchase Agreement, Court Opinion, Order, Judgment, Brief, Memorandum of \
         Law, Deposition Transcript, Affidavit, Declaration, Statute, Regulation, \
         Settlement Agreement.\n\n\
         Respond with JSON: {{\"document_type\": \"...\", \"confidence\": 0.95, \
         \"reasoning\": \"...\"}}\n\n\
         OPENING (first 500 chars):\n{opening}",
        version = SCHEMA_VERSION,
        opening = opening,
    )
}

/// Schema for [`document_type`] responses.
#[must_use]
pub fn document_type_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "document_type": {"type": "string"},
            "confidence": {"type": "number"},
            "reasoning": {"type": "string"}
        },
        "required": ["document_type"]
    })
}

/// Prompt for validating a property's domain/range linkage.
#[must_use]
pub fn property_link(
    property_label: &str,
    sentence: &str,
    subject_candidates: &[String],
    object_candidates: &[String],
) -> String {
    format!(
        "You are linking an ontology object property to its subject and object \
         (schema {version}).\n\n\
         Property: {label}\n\
         Sentence: {sentence}\n\
         Subject candidates: {subjects}\n\
         Object candidates: {objects}\n\n\
         Pick the best subject and object from the candidates, or empty strings if \
         none fits. Respond with JSON: {{\"subject_iri\": \"...\", \
         \"object_iri\": \"...\"}}",
        version = SCHEMA_VERSION,
        label = property_label,
        sentence = sentence,
        subjects = subject_candidates.join(", "),
        objects = object_candidates.join(", "),
    )
}

/// Schema for [`property_link`] responses.
#[must_use]
pub fn property_link_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "subject_iri": {"type": "string"},
            "object_iri": {"type": "string"}
        }
    })
}

/// Prompt for linking an individual to the nearest class annotation.
#[must_use]
pub fn individual_link(surface: &str, individual_type: &str, candidates: &[String]) -> String {
    format!(
        "You are linking an extracted legal individual to an ontology class \
         (schema {version}).\n\n\
         Individual: \"{surface}\" ({kind})\n\
         Candidate class IRIs: {candidates}\n\n\
         Pick the class this individual instantiates, or an empty string if none \
         fits. Respond with JSON: {{\"concept_iri\": \"...\"}}",
        version = SCHEMA_VERSION,
        surface = surface,
        kind = individual_type,
        candidates = candidates.join(", "),
    )
}

/// Schema for [`individual_link`] responses.
#[must_use]
pub fn individual_link_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "concept_iri": {"type": "string"}
        }
    })
}

/// Prompt for the metadata synthesizer. `context_block` is the assembled
/// pipeline output; `doc_type` is the classifier hypothesis.
#[must_use]
pub fn metadata_synthesis(context_block: &str, doc_type: &str) -> String {
    format!(
        "You are a legal metadata extractor (schema {version}). A pipeline has already \
         extracted entities, relationships, and concepts from the document. Use the \
         structured context below to fill the metadata record. Leave fields empty \
         when the context does not support a value; never invent information.\n\n\
         Document type hypothesis: {doc_type}\n\n\
         {context}\n\n\
         Respond with JSON matching the metadata schema exactly.",
        version = SCHEMA_VERSION,
        doc_type = doc_type,
        context = context_block,
    )
}

/// Schema for [`metadata_synthesis`] responses: the full metadata record.
#[must_use]
pub fn metadata_schema() -> Value {
    let s = |name: &str| (name.to_string(), json!({"type": "string"}));
    let arr = |name: &str| {
        (
            name.to_string(),
            json!({"type": "array", "items": {"type": "string"}}),
        )
    };
    let props: serde_json::Map<String, Value> = [
        s("document_type"),
        s("document_title"),
        s("case_name"),
        s("court"),
        s("judge"),
        s("case_number"),
        s("docket_entry_number"),
        arr("parties"),
        arr("attorneys"),
        arr("signatories"),
        arr("witnesses"),
        s("jurisdiction"),
        s("procedural_posture"),
        s("cause_of_action"),
        arr("claim_types"),
        s("relief_sought"),
        s("disposition"),
        s("standard_of_review"),
        s("governing_law"),
        s("contract_type"),
        arr("counterparties"),
        s("term_duration"),
        s("termination_conditions"),
        s("consideration"),
        s("date_filed"),
        s("date_signed"),
        s("date_effective"),
        arr("dates_mentioned"),
    ]
    .into_iter()
    .collect();
    json!({"type": "object", "properties": Value::Object(props)})
}

/// Prompt for post-pipeline area-of-law assessment.
#[must_use]
pub fn area_of_law(concepts: &[String], doc_type: &str) -> String {
    format!(
        "You are classifying a legal document's areas of law (schema {version}).\n\n\
         Document type: {doc_type}\n\
         Concepts found: {concepts}\n\n\
         List up to three areas of law with confidence. Respond with JSON: \
         {{\"areas\": [{{\"area\": \"...\", \"confidence\": 0.9}}]}}",
        version = SCHEMA_VERSION,
        doc_type = doc_type,
        concepts = concepts.join(", "),
    )
}

/// Schema for [`area_of_law`] responses.
#[must_use]
pub fn area_of_law_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "areas": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "area": {"type": "string"},
                        "confidence": {"type": "number"}
                    },
                    "required": ["area"]
                }
            }
        },
        "required": ["areas"]
    })
}

/// Prompt for the document-type quality cross-check.
#[must_use]
pub fn document_type_check(hypothesis: &str, synthesized: &str) -> String {
    format!(
        "You are cross-checking two document-type determinations \
         (schema {version}).\n\n\
         Classifier hypothesis: {hypothesis}\n\
         Metadata synthesis says: {synthesized}\n\n\
         Do these agree? Respond with JSON: {{\"agree\": true, \"note\": \"...\"}}",
        version = SCHEMA_VERSION,
        hypothesis = hypothesis,
        synthesized = synthesized,
    )
}

/// Schema for [`document_type_check`] responses.
#[must_use]
pub fn document_type_check_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "agree": {"type": "boolean"},
            "note": {"type": "string"}
        },
        "required": ["agree"]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompts_carry_schema_version() {
        assert!(concept_identification("text", &[]).contains(SCHEMA_VERSION));
        assert!(contextual_rerank("a", "b", "c", "d").contains(SCHEMA_VERSION));
        assert!(branch_judge("a", "b", &[]).contains(SCHEMA_VERSION));
        assert!(document_type("a").contains(SCHEMA_VERSION));
        assert!(metadata_synthesis("ctx", "Complaint").contains(SCHEMA_VERSION));
    }

    #[test]
    fn branch_list_is_injected() {
        let p = concept_identification(
            "text",
            &["Actor".to_string(), "Document".to_string()],
        );
        assert!(p.contains("Actor, Document"));
    }

    #[test]
    fn metadata_schema_has_twenty_eight_fields() {
        let schema = metadata_schema();
        let props = schema["properties"].as_object().unwrap();
        assert_eq!(props.len(), 28);
    }
}
