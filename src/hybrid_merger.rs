//! Hybrid Merger: combines Pattern Extractor and LLM Extractor output into
//! one [`ExtractedData`], merging entities that both sources found into a
//! single higher-confidence entity via the probabilistic-OR formula
//! `1 - (1 - c_pattern) * (1 - c_llm)`, capped at 0.98, then calibrated by
//! [`SourceQuality::calibration_factor`].

use crate::types::{Demographic, Entity, EntityValue, ExtractedData, ExtractionMethod, Note, SourceQuality};
use strsim::jaro_winkler;
use tracing::debug;

/// Matches of the same normalized name above this similarity are
/// considered the same underlying fact for merge purposes.
const MERGE_SIMILARITY_THRESHOLD: f64 = 0.90;
const MAX_MERGED_CONFIDENCE: f64 = 0.98;

/// An LLM-only entity (never matched against a pattern entity) is kept
/// only if it clears this confidence floor and its source spans verify
/// against the note text; below it, an unmatched LLM claim is more likely
/// a hallucinated or misquoted entity than a genuine pattern-extractor
/// miss.
const UNMATCHED_LLM_CONFIDENCE_FLOOR: f64 = 0.6;

/// Merges pattern-derived and LLM-derived entities and groups them into
/// [`ExtractedData`]'s category fields. Entities whose normalized names are
/// similar enough within the same category are folded into one, with
/// their confidences combined by probabilistic OR and their source spans
/// concatenated (never dropped, per Invariant E1). LLM entities that never
/// matched a pattern entity are dropped unless they clear
/// [`UNMATCHED_LLM_CONFIDENCE_FLOOR`] and verify against `notes`.
pub fn merge(
    pattern_entities: Vec<Entity>,
    llm_entities: Vec<Entity>,
    source_quality: &SourceQuality,
    notes: &[Note],
) -> ExtractedData {
    let calibration = source_quality.calibration_factor();
    let mut all: Vec<Entity> = Vec::new();
    all.extend(pattern_entities);
    all.extend(llm_entities);

    let merged = merge_similar_entities(all, calibration);

    let mut data = ExtractedData::default();
    for entity in merged {
        if entity.method == ExtractionMethod::Llm
            && (entity.confidence < UNMATCHED_LLM_CONFIDENCE_FLOOR || !entity.has_verifiable_evidence(notes))
        {
            debug!(
                category = entity.category_key(),
                confidence = entity.confidence,
                "dropping unmatched LLM entity below keep threshold"
            );
            continue;
        }

        match &entity.value {
            EntityValue::Demographic(incoming) => {
                let existing = data.demographics.take();
                let existing_demo = existing.as_ref().map(|e| match &e.value {
                    EntityValue::Demographic(d) => d.clone(),
                    _ => unreachable!(),
                });
                let merged_demo = merge_demographics(existing_demo, Some(incoming.clone()));
                let mut carrier = existing.unwrap_or_else(|| entity.clone());
                carrier.value = EntityValue::Demographic(merged_demo.unwrap_or_default());
                data.demographics = Some(carrier);
            }
            EntityValue::Date(_) => data.dates.push(entity),
            EntityValue::Procedure(_) => data.procedures.push(entity),
            EntityValue::Complication(_) => data.complications.push(entity),
            EntityValue::Medication(_) => data.medications.push(entity),
            EntityValue::ImagingFinding(_) => data.imaging.push(entity),
            EntityValue::FunctionalScore(_) => data.functional_scores.push(entity),
            EntityValue::NeuroExam(_) => data.neuro_exams.push(entity),
            EntityValue::Consultation(_) => data.consultations.push(entity),
            EntityValue::Diagnosis(_) => data.diagnoses.push(entity),
            EntityValue::FollowUp(_) => data.follow_up.push(entity),
        }
    }
    data
}

fn merge_similar_entities(entities: Vec<Entity>, calibration: f64) -> Vec<Entity> {
    let mut buckets: Vec<Entity> = Vec::new();

    'outer: for entity in entities {
        for existing in buckets.iter_mut() {
            if existing.category_key() != entity.category_key() {
                continue;
            }
            if !same_date_role(existing, &entity) {
                continue;
            }
            let similarity = jaro_winkler(&existing.value.normalized_name(), &entity.value.normalized_name());
            if similarity >= MERGE_SIMILARITY_THRESHOLD {
                merge_into(existing, entity, calibration);
                continue 'outer;
            }
        }
        buckets.push(entity);
    }
    buckets
}

fn same_date_role(a: &Entity, b: &Entity) -> bool {
    match (&a.value, &b.value) {
        (EntityValue::Date(x), EntityValue::Date(y)) => x.role == y.role,
        _ => true,
    }
}

/// Folds `incoming` into `existing` in place: combines confidence via
/// probabilistic OR, concatenates source spans, bumps `merge_count`, and
/// marks the method `Merged` when the two came from different extractors.
fn merge_into(existing: &mut Entity, incoming: Entity, calibration: f64) {
    let combined = 1.0 - (1.0 - existing.confidence) * (1.0 - incoming.confidence);
    let calibrated = (combined * calibration).min(MAX_MERGED_CONFIDENCE);

    debug!(
        category = existing.category_key(),
        before = existing.confidence,
        incoming = incoming.confidence,
        after = calibrated,
        "merged entity confidence"
    );

    existing.confidence = calibrated;
    existing.source_spans.extend(incoming.source_spans);
    existing.merge_count += incoming.merge_count;
    if existing.method != incoming.method {
        existing.method = ExtractionMethod::Merged;
    }
    if incoming.temporal_context.confidence > existing.temporal_context.confidence {
        existing.temporal_context = incoming.temporal_context;
    }

    if let (EntityValue::Medication(existing_med), EntityValue::Medication(incoming_med)) =
        (&mut existing.value, &incoming.value)
    {
        if existing_med.dose.is_none() {
            existing_med.dose = incoming_med.dose.clone();
        }
        if existing_med.route.is_none() {
            existing_med.route = incoming_med.route.clone();
        }
        if existing_med.frequency.is_none() {
            existing_med.frequency = incoming_med.frequency.clone();
        }
    }
}

/// Fills missing demographic fields from a second source rather than
/// letting a later, sparser entity overwrite an earlier, fuller one.
/// Called from [`merge`] whenever more than one `Demographic` entity is
/// produced across the two extractors.
pub fn merge_demographics(existing: Option<Demographic>, incoming: Option<Demographic>) -> Option<Demographic> {
    match (existing, incoming) {
        (Some(mut e), Some(i)) => {
            e.age = e.age.or(i.age);
            e.sex = e.sex.or(i.sex);
            e.mrn = e.mrn.or(i.mrn);
            e.name = e.name.or(i.name);
            Some(e)
        }
        (Some(e), None) => Some(e),
        (None, Some(i)) => Some(i),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        ComplicationTiming, ComplicationValue, DateValue, ExtractionMethod, MedicationPhase,
        MedicationValue, ProcedureValue, SourceGrade, SourceSpan, TemporalContext,
    };

    fn quality(score: f64) -> SourceQuality {
        SourceQuality { overall_score: score, grade: SourceGrade::from_score(score), issues: vec![] }
    }

    fn span(text: &str) -> SourceSpan {
        SourceSpan { note_index: 0, start_offset: 0, end_offset: text.len(), matched_text: text.to_string() }
    }

    #[test]
    fn identical_procedures_from_both_extractors_merge_with_boosted_confidence() {
        let pattern = Entity::new(
            EntityValue::Procedure(ProcedureValue { name: "craniotomy".into(), date: None, pod_zero: false }),
            0.80,
            vec![span("craniotomy")],
            ExtractionMethod::Pattern,
            TemporalContext::new_event(0.8, "procedure label"),
        );
        let llm = Entity::new(
            EntityValue::Procedure(ProcedureValue { name: "craniotomy".into(), date: None, pod_zero: false }),
            0.75,
            vec![span("craniotomy")],
            ExtractionMethod::Llm,
            TemporalContext::new_event(0.75, "llm extraction"),
        );
        let data = merge(vec![pattern], vec![llm], &quality(100.0), &[]);
        assert_eq!(data.procedures.len(), 1);
        let merged = &data.procedures[0];
        assert!(merged.confidence > 0.80);
        assert_eq!(merged.method, ExtractionMethod::Merged);
        assert_eq!(merged.source_spans.len(), 2);
    }

    #[test]
    fn distinct_procedures_stay_separate() {
        let craniotomy = Entity::new(
            EntityValue::Procedure(ProcedureValue { name: "craniotomy".into(), date: None, pod_zero: false }),
            0.8,
            vec![span("craniotomy")],
            ExtractionMethod::Pattern,
            TemporalContext::new_event(0.8, "procedure label"),
        );
        let laminectomy = Entity::new(
            EntityValue::Procedure(ProcedureValue { name: "laminectomy".into(), date: None, pod_zero: false }),
            0.8,
            vec![span("laminectomy")],
            ExtractionMethod::Pattern,
            TemporalContext::new_event(0.8, "procedure label"),
        );
        let data = merge(vec![craniotomy, laminectomy], vec![], &quality(100.0), &[]);
        assert_eq!(data.procedures.len(), 2);
    }

    #[test]
    fn poor_source_quality_lowers_merged_confidence() {
        let a = Entity::new(
            EntityValue::Complication(ComplicationValue {
                name: "vasospasm".into(),
                timing: ComplicationTiming::Unspecified,
                linked_procedure: None,
            }),
            0.9,
            vec![span("vasospasm")],
            ExtractionMethod::Pattern,
            TemporalContext::new_event(0.9, "complication keyword"),
        );
        let b = a.clone();
        let high_quality = merge(vec![a.clone()], vec![b.clone()], &quality(100.0), &[]);
        let low_quality = merge(vec![a], vec![b], &quality(0.0), &[]);
        assert!(high_quality.complications[0].confidence > low_quality.complications[0].confidence);
    }

    #[test]
    fn medication_merge_fills_missing_fields() {
        let sparse = Entity::new(
            EntityValue::Medication(MedicationValue {
                name: "levetiracetam".into(),
                dose: None,
                route: None,
                frequency: None,
                phase: MedicationPhase::Discharge,
                indication: None,
            }),
            0.7,
            vec![span("levetiracetam")],
            ExtractionMethod::Llm,
            TemporalContext::new_event(0.7, "llm extraction"),
        );
        let detailed = Entity::new(
            EntityValue::Medication(MedicationValue {
                name: "levetiracetam".into(),
                dose: Some("500 mg".into()),
                route: Some("PO".into()),
                frequency: Some("BID".into()),
                phase: MedicationPhase::Discharge,
                indication: None,
            }),
            0.9,
            vec![span("levetiracetam 500 mg PO BID")],
            ExtractionMethod::Pattern,
            TemporalContext::new_event(0.9, "medication line"),
        );
        let data = merge(vec![detailed], vec![sparse], &quality(100.0), &[]);
        let med = match &data.medications[0].value {
            EntityValue::Medication(m) => m,
            _ => panic!("expected medication"),
        };
        assert_eq!(med.dose.as_deref(), Some("500 mg"));
    }

    #[test]
    fn unmatched_low_confidence_llm_entity_is_dropped() {
        let weak = Entity::new(
            EntityValue::Procedure(ProcedureValue { name: "possible debridement".into(), date: None, pod_zero: false }),
            0.4,
            vec![span("possible debridement")],
            ExtractionMethod::Llm,
            TemporalContext::new_event(0.4, "llm extraction"),
        );
        let data = merge(vec![], vec![weak], &quality(100.0), &[]);
        assert!(data.procedures.is_empty());
    }

    #[test]
    fn unmatched_llm_entity_with_unverifiable_span_is_dropped() {
        let note = Note::new("patient underwent craniotomy on 3/2".to_string());
        let unverifiable = Entity::new(
            EntityValue::Procedure(ProcedureValue { name: "laminectomy".into(), date: None, pod_zero: false }),
            0.9,
            vec![span("laminectomy")],
            ExtractionMethod::Llm,
            TemporalContext::new_event(0.9, "llm extraction"),
        );
        let data = merge(vec![], vec![unverifiable], &quality(100.0), &[note]);
        assert!(data.procedures.is_empty());
    }

    #[test]
    fn unmatched_high_confidence_verified_llm_entity_is_kept() {
        let note = Note::new("Patient is s/p laminectomy last year.".to_string());
        let mut span = span("s/p laminectomy");
        span.matched_text = "s/p laminectomy".into();
        let verified = Entity::new(
            EntityValue::Procedure(ProcedureValue { name: "laminectomy".into(), date: None, pod_zero: false }),
            0.7,
            vec![span],
            ExtractionMethod::Llm,
            TemporalContext::new_event(0.7, "llm extraction"),
        );
        let data = merge(vec![], vec![verified], &quality(100.0), &[note]);
        assert_eq!(data.procedures.len(), 1);
    }

    #[test]
    fn demographics_merge_fills_missing_fields_from_second_source() {
        let note = Note::new("62yo patient, MRN123, female.".to_string());
        let sparse = Entity::new(
            EntityValue::Demographic(Demographic { age: Some(62), sex: None, mrn: None, name: None }),
            0.8,
            vec![span("62")],
            ExtractionMethod::Pattern,
            TemporalContext::new_event(0.8, "demographic shorthand"),
        );
        let detailed = Entity::new(
            EntityValue::Demographic(Demographic { age: None, sex: Some("F".into()), mrn: Some("MRN123".into()), name: None }),
            0.9,
            vec![span("MRN123")],
            ExtractionMethod::Llm,
            TemporalContext::new_event(0.9, "llm extraction"),
        );
        let data = merge(vec![sparse], vec![detailed], &quality(100.0), &[note]);
        let demo = match &data.demographics.unwrap().value {
            EntityValue::Demographic(d) => d.clone(),
            _ => panic!("expected demographic"),
        };
        assert_eq!(demo.age, Some(62));
        assert_eq!(demo.sex.as_deref(), Some("F"));
        assert_eq!(demo.mrn.as_deref(), Some("MRN123"));
    }
}
