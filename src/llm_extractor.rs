//! LLM Extractor: LLM-based entity extraction, complementing the Pattern
//! Extractor for unstructured or implicit facts regex recipes miss (free
//! text narrative, non-standard phrasing, implied temporal relationships).
//!
//! Long note bundles are chunked with overlap before being sent to the
//! LLM Gateway, so an entity whose evidence straddles a chunk boundary is
//! still captured in at least one chunk.

use crate::context_builder::ComplexityLevel;
use crate::cost_tracker::CostTracker;
use crate::error::{PipelineError, Result};
use crate::llm_gateway::{parse_extraction_response, LlmGateway, LlmTask};
use crate::types::{
    ComplicationTiming, ComplicationValue, ConsultationValue, DateRole, DateValue, Demographic,
    DiagnosisValue, Entity, EntityValue, ExtractionMethod, FollowUpValue, FunctionalScoreValue,
    ImagingFindingValue, ImagingTiming, MedicationPhase, MedicationValue, NeuroExamValue, Note,
    Pathology, ProcedureValue, SourceSpan, TemporalContext,
};
use serde_json::Value;
use strsim::jaro_winkler;
use tracing::{debug, warn};

/// Below this name/quote similarity, an entity's claimed value is
/// considered a near-miss against its own cited evidence and its
/// confidence is demoted rather than trusted at face value.
const FUZZY_VERIFICATION_FLOOR: f64 = 0.5;
const DEMOTED_CONFIDENCE_CAP: f64 = 0.3;

/// Additional focused passes issued for `Complex` note bundles, each with
/// its own narrowed instruction appended to the base system prompt so the
/// model isn't asked to do everything in one shot.
const MULTI_PASS_FOCUS: &[&str] = &[
    "This pass: focus ONLY on procedures, complications, and medications.",
    "This pass: focus ONLY on demographics, dates, diagnoses, and consultations.",
    "This pass: focus ONLY on imaging findings, functional scores, neuro exam findings, and follow-up plans.",
];

/// Maximum characters sent to the LLM in a single call before chunking
/// kicks in.
pub const CHUNK_THRESHOLD_CHARS: usize = 100_000;
const CHUNK_SIZE_CHARS: usize = 60_000;
const CHUNK_OVERLAP_CHARS: usize = 4_000;

const SYSTEM_PROMPT_TEMPLATE: &str = "You are a clinical information extraction assistant specializing in \
neurosurgery. Extract structured entities (procedures, complications, medications, imaging findings, \
functional scores, neuro exam findings, consultations, diagnoses, follow-up plans) from the supplied \
clinical notes. For every entity, return only facts explicitly stated in the text -- never infer or \
extrapolate beyond what is written. Respond with a single JSON object: {\"entities\": [...]}. Each entry \
must include a \"kind\", a \"value\" object matching that kind's fields, and a \"quote\" field containing \
the exact verbatim substring of the notes that supports it.";

/// Splits note text into overlapping chunks so no single LLM call exceeds
/// [`CHUNK_THRESHOLD_CHARS`]. Overlap ensures an entity whose evidence
/// straddles a chunk boundary is still captured in at least one chunk.
pub fn chunk_notes(notes: &[Note]) -> Vec<(usize, String)> {
    let mut chunks = Vec::new();
    for (index, note) in notes.iter().enumerate() {
        if note.text.len() <= CHUNK_THRESHOLD_CHARS {
            chunks.push((index, note.text.clone()));
            continue;
        }
        let bytes = note.text.as_bytes();
        let mut start = 0;
        while start < bytes.len() {
            let end = (start + CHUNK_SIZE_CHARS).min(bytes.len());
            let end = align_to_char_boundary(&note.text, end);
            chunks.push((index, note.text[start..end].to_string()));
            if end == bytes.len() {
                break;
            }
            start = end.saturating_sub(CHUNK_OVERLAP_CHARS);
            start = align_to_char_boundary(&note.text, start);
        }
    }
    chunks
}

fn align_to_char_boundary(text: &str, mut index: usize) -> usize {
    while index < text.len() && !text.is_char_boundary(index) {
        index += 1;
    }
    index
}

/// Runs entity extraction via the LLM Gateway for every chunk and merges
/// the results. Returns `Ok(vec![])` rather than an error when the gateway
/// has no providers configured, so callers can rely on the Pattern
/// Extractor alone: an LLM outage is non-fatal.
///
/// `Simple` bundles get one pass per chunk with the full system prompt.
/// `Complex` bundles (multiple pathologies, multiple consultants, long
/// corpora) get one additional focused pass per chunk per entry in
/// [`MULTI_PASS_FOCUS`], since a single generic prompt tends to under-
/// extract secondary findings when the note set covers more ground.
pub async fn extract(
    notes: &[Note],
    pathology: Pathology,
    complexity: ComplexityLevel,
    gateway: &LlmGateway,
    cost_tracker: &CostTracker,
) -> (Vec<Entity>, Vec<crate::llm_gateway::AttemptOutcome>) {
    if !gateway.has_providers() {
        debug!("no LLM providers configured, skipping LLM extraction");
        return (Vec::new(), Vec::new());
    }

    let chunks = chunk_notes(notes);
    let mut entities = Vec::new();
    let mut all_attempts = Vec::new();

    let focuses: Vec<Option<&str>> = match complexity {
        ComplexityLevel::Simple => vec![None],
        ComplexityLevel::Complex => MULTI_PASS_FOCUS.iter().map(|f| Some(*f)).collect(),
    };

    for (note_index, chunk_text) in &chunks {
        for focus in &focuses {
            let system_prompt = match focus {
                Some(focus) => format!("{SYSTEM_PROMPT_TEMPLATE} The primary pathology context is {pathology}. {focus}"),
                None => format!("{SYSTEM_PROMPT_TEMPLATE} The primary pathology context is {pathology}."),
            };
            let (result, attempts) = gateway
                .dispatch(LlmTask::EntityExtraction, &system_prompt, chunk_text, cost_tracker)
                .await;
            all_attempts.extend(attempts);

            match result {
                Ok(response) => match parse_extraction_response(&response.text) {
                    Ok(envelope) => {
                        for raw in envelope.entities {
                            match entity_from_json(*note_index, chunk_text, &raw) {
                                Ok(Some(entity)) => entities.push(entity),
                                Ok(None) => {}
                                Err(e) => warn!(error = %e, "dropping malformed LLM entity"),
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "LLM extraction response was not valid JSON"),
                },
                Err(e) => {
                    warn!(error = %e, "LLM extraction unavailable for this chunk");
                }
            }
        }
    }

    (entities, all_attempts)
}

/// Converts one raw JSON entity from the LLM into a typed [`Entity`],
/// enforcing Invariant E1 (the quoted evidence must be a verbatim
/// substring of the chunk it was extracted from). Entities that fail this
/// check are dropped rather than passed downstream.
fn entity_from_json(note_index: usize, chunk_text: &str, raw: &Value) -> Result<Option<Entity>> {
    let kind = raw.get("kind").and_then(|v| v.as_str()).ok_or_else(|| {
        PipelineError::LlmMalformedResponse {
            task: "entity_extraction".to_string(),
            reason: "missing kind".to_string(),
        }
    })?;
    let quote = raw.get("quote").and_then(|v| v.as_str()).unwrap_or("");
    if quote.is_empty() || !chunk_text.contains(quote) {
        return Ok(None);
    }
    let start_offset = match chunk_text.find(quote) {
        Some(offset) => offset,
        None => return Ok(None),
    };
    let span = SourceSpan {
        note_index,
        start_offset,
        end_offset: start_offset + quote.len(),
        matched_text: quote.to_string(),
    };

    let value = raw.get("value").cloned().unwrap_or(Value::Null);
    let name_like = primary_name_field(kind, &value);
    let entity_value = match kind {
        "procedure" => EntityValue::Procedure(ProcedureValue {
            name: field_str(&value, "name"),
            date: None,
            pod_zero: false,
        }),
        "complication" => EntityValue::Complication(ComplicationValue {
            name: field_str(&value, "name"),
            timing: ComplicationTiming::Unspecified,
            linked_procedure: None,
        }),
        "medication" => EntityValue::Medication(MedicationValue {
            name: field_str(&value, "name"),
            dose: value.get("dose").and_then(|v| v.as_str()).map(String::from),
            route: value.get("route").and_then(|v| v.as_str()).map(String::from),
            frequency: value.get("frequency").and_then(|v| v.as_str()).map(String::from),
            phase: MedicationPhase::Discharge,
            indication: value.get("indication").and_then(|v| v.as_str()).map(String::from),
        }),
        "demographic" => EntityValue::Demographic(Demographic {
            age: value.get("age").and_then(|v| v.as_u64()).map(|a| a as u32),
            sex: value.get("sex").and_then(|v| v.as_str()).map(String::from),
            mrn: value.get("mrn").and_then(|v| v.as_str()).map(String::from),
            name: value.get("name").and_then(|v| v.as_str()).map(String::from),
        }),
        "date" => EntityValue::Date(DateValue {
            role: parse_date_role(value.get("role").and_then(|v| v.as_str()).unwrap_or("other")),
            date: value
                .get("date")
                .and_then(|v| v.as_str())
                .and_then(|s| chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()),
        }),
        "imaging_finding" => EntityValue::ImagingFinding(ImagingFindingValue {
            modality: field_str(&value, "modality"),
            finding: field_str(&value, "finding"),
            timing: if field_str(&value, "timing") == "pre_op" { ImagingTiming::PreOp } else { ImagingTiming::PostOp },
        }),
        "functional_score" => EntityValue::FunctionalScore(FunctionalScoreValue {
            scale_name: field_str(&value, "scale_name"),
            score: value.get("score").and_then(|v| v.as_f64()).unwrap_or(0.0),
            range: (
                value.get("range_low").and_then(|v| v.as_f64()).unwrap_or(0.0),
                value.get("range_high").and_then(|v| v.as_f64()).unwrap_or(0.0),
            ),
            from_gold_standard_source: false,
        }),
        "neuro_exam" => EntityValue::NeuroExam(NeuroExamValue {
            finding: field_str(&value, "finding"),
            exam_type: field_str(&value, "exam_type"),
        }),
        "consultation" => EntityValue::Consultation(ConsultationValue {
            service: field_str(&value, "service"),
            reason: value.get("reason").and_then(|v| v.as_str()).map(String::from),
        }),
        "diagnosis" => EntityValue::Diagnosis(DiagnosisValue {
            name: field_str(&value, "name"),
            is_principal: value.get("is_principal").and_then(|v| v.as_bool()).unwrap_or(false),
        }),
        "follow_up" => EntityValue::FollowUp(FollowUpValue {
            service: field_str(&value, "service"),
            timeframe: value.get("timeframe").and_then(|v| v.as_str()).map(String::from),
            instructions: value.get("instructions").and_then(|v| v.as_str()).map(String::from),
        }),
        other => {
            debug!(kind = other, "unrecognized LLM entity kind, skipping");
            return Ok(None);
        }
    };

    let reported_confidence = raw.get("confidence").and_then(|v| v.as_f64()).unwrap_or(0.80).clamp(0.0, 1.0);
    let confidence = match name_like {
        Some(name) if !name.is_empty() => {
            let similarity = jaro_winkler(&name.to_lowercase(), &quote.to_lowercase());
            if similarity < FUZZY_VERIFICATION_FLOOR {
                debug!(kind, similarity, "demoting LLM entity confidence, claimed value barely matches cited quote");
                reported_confidence.min(DEMOTED_CONFIDENCE_CAP)
            } else {
                reported_confidence
            }
        }
        _ => reported_confidence,
    };

    let context_start = start_offset.saturating_sub(40);
    let mut from = context_start;
    while from < start_offset && !chunk_text.is_char_boundary(from) {
        from += 1;
    }
    let indicator = format!("{}{}", &chunk_text[from..start_offset], quote);

    Ok(Some(Entity::new(
        entity_value,
        confidence,
        vec![span],
        ExtractionMethod::Llm,
        TemporalContext::new_event(confidence, indicator),
    )))
}

/// The field whose text ought to resemble the cited quote, for the
/// post-hoc fuzzy verification check. Kinds without an obvious "name"
/// field (dates, demographics, functional scores) skip the check.
fn primary_name_field(kind: &str, value: &Value) -> Option<String> {
    match kind {
        "procedure" | "complication" | "medication" | "diagnosis" => {
            let name = field_str(value, "name");
            if name.is_empty() { None } else { Some(name) }
        }
        "imaging_finding" => {
            let finding = field_str(value, "finding");
            if finding.is_empty() { None } else { Some(finding) }
        }
        "consultation" => {
            let service = field_str(value, "service");
            if service.is_empty() { None } else { Some(service) }
        }
        _ => None,
    }
}

fn parse_date_role(role: &str) -> DateRole {
    match role {
        "admission" => DateRole::Admission,
        "surgery" => DateRole::Surgery,
        "discharge" => DateRole::Discharge,
        "ictus" => DateRole::Ictus,
        _ => DateRole::Other,
    }
}

fn field_str(value: &Value, key: &str) -> String {
    value.get(key).and_then(|v| v.as_str()).unwrap_or("").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_note_is_not_chunked() {
        let notes = vec![Note::new("short note")];
        let chunks = chunk_notes(&notes);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn long_note_is_split_with_overlap() {
        let long_text = "a".repeat(CHUNK_THRESHOLD_CHARS + 10_000);
        let notes = vec![Note::new(long_text)];
        let chunks = chunk_notes(&notes);
        assert!(chunks.len() > 1);
        for (index, _) in &chunks {
            assert_eq!(*index, 0);
        }
    }

    #[test]
    fn entity_from_json_rejects_unverifiable_quote() {
        let raw = serde_json::json!({
            "kind": "procedure",
            "value": {"name": "craniotomy"},
            "quote": "text not present in chunk"
        });
        let result = entity_from_json(0, "the actual note text", &raw).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn entity_from_json_accepts_verifiable_quote() {
        let chunk = "Patient underwent craniotomy for tumor resection.";
        let raw = serde_json::json!({
            "kind": "procedure",
            "value": {"name": "craniotomy for tumor resection"},
            "quote": "craniotomy for tumor resection"
        });
        let result = entity_from_json(0, chunk, &raw).unwrap();
        assert!(result.is_some());
        assert!(result.unwrap().has_verifiable_evidence(&[Note::new(chunk)]));
    }

    #[test]
    fn entity_from_json_uses_reported_confidence() {
        let chunk = "Patient underwent craniotomy.";
        let raw = serde_json::json!({
            "kind": "procedure",
            "value": {"name": "craniotomy"},
            "quote": "craniotomy",
            "confidence": 0.55
        });
        let entity = entity_from_json(0, chunk, &raw).unwrap().unwrap();
        assert_eq!(entity.confidence, 0.55);
    }

    #[test]
    fn entity_from_json_demotes_confidence_on_name_quote_mismatch() {
        let chunk = "Patient is doing well overall today.";
        let raw = serde_json::json!({
            "kind": "procedure",
            "value": {"name": "external ventricular drain placement"},
            "quote": "doing well overall today",
            "confidence": 0.9
        });
        let entity = entity_from_json(0, chunk, &raw).unwrap().unwrap();
        assert!(entity.confidence <= 0.3);
    }

    #[test]
    fn entity_from_json_covers_demographic_kind() {
        let chunk = "62yo male, MRN 445566.";
        let raw = serde_json::json!({
            "kind": "demographic",
            "value": {"age": 62, "sex": "male", "mrn": "445566"},
            "quote": "62yo male, MRN 445566"
        });
        let entity = entity_from_json(0, chunk, &raw).unwrap().unwrap();
        match entity.value {
            EntityValue::Demographic(d) => {
                assert_eq!(d.age, Some(62));
                assert_eq!(d.mrn.as_deref(), Some("445566"));
            }
            _ => panic!("expected demographic"),
        }
    }

    #[test]
    fn entity_from_json_covers_functional_score_kind() {
        let chunk = "Physical therapy: mRS 2.";
        let raw = serde_json::json!({
            "kind": "functional_score",
            "value": {"scale_name": "mRS", "score": 2.0, "range_low": 0.0, "range_high": 6.0},
            "quote": "mRS 2"
        });
        let entity = entity_from_json(0, chunk, &raw).unwrap().unwrap();
        match entity.value {
            EntityValue::FunctionalScore(f) => assert_eq!(f.scale_name, "mRS"),
            _ => panic!("expected functional score"),
        }
    }
}
