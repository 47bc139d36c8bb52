//! Validator: checks extracted data against the pipeline's invariants and
//! cross-field consistency rules, producing [`ValidationIssue`]s rather
//! than failing the request. Validation failures degrade quality; they do
//! not abort the run.

use crate::knowledge::KnowledgePack;
use crate::types::{
    EntityValue, ExtractedData, IssueSeverity, Narrative, Note, ValidationIssue,
};
use tracing::warn;

/// Runs every invariant and consistency check against `data` and the
/// source `notes` used to verify evidence, plus pathology-aware
/// completeness and numeric-range checks drawn from `pack`. Called before
/// narrative generation; [`validate_narrative`] runs the style check
/// afterward, once there is a narrative to check.
pub fn validate(data: &ExtractedData, notes: &[Note], pack: &KnowledgePack) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    issues.extend(check_evidence_invariant(data, notes));
    issues.extend(check_admission_before_discharge(data));
    issues.extend(check_procedure_dates_within_stay(data));
    issues.extend(check_medication_indications(data));
    issues.extend(check_unresolved_temporal_references(data));
    issues.extend(check_pathology_completeness(data, pack));
    issues.extend(check_numeric_ranges(data, pack));
    issues
}

/// Runs the narrative style check. Separate from [`validate`] because it
/// needs a generated narrative to inspect, which doesn't exist until
/// after the stage `validate` is invoked from runs.
pub fn validate_narrative(narrative: &Narrative) -> Vec<ValidationIssue> {
    check_narrative_style(narrative)
}

/// Invariant E1: every entity must carry non-empty, verifiable source
/// spans. A violation here indicates a pipeline bug (a stage fabricated an
/// entity), not a data-quality issue, so it is reported as `Critical`.
fn check_evidence_invariant(data: &ExtractedData, notes: &[Note]) -> Vec<ValidationIssue> {
    data.all_entities()
        .into_iter()
        .filter(|entity| !entity.has_verifiable_evidence(notes))
        .map(|entity| {
            warn!(category = entity.category_key(), "entity missing verifiable evidence");
            ValidationIssue {
                severity: IssueSeverity::Critical,
                message: format!("{} entity has no verifiable source evidence", entity.category_key()),
                field: Some(entity.category_key().to_string()),
            }
        })
        .collect()
}

fn check_admission_before_discharge(data: &ExtractedData) -> Vec<ValidationIssue> {
    use crate::types::DateRole;
    let admission = data.date_by_role(DateRole::Admission);
    let discharge = data.date_by_role(DateRole::Discharge);
    match (admission, discharge) {
        (Some(a), Some(d)) if d < a => vec![ValidationIssue {
            severity: IssueSeverity::Major,
            message: "discharge date precedes admission date".to_string(),
            field: Some("dates".to_string()),
        }],
        _ => Vec::new(),
    }
}

/// Procedures dated outside `[admission, discharge]` are flagged (rather
/// than discarded) unless their temporal context is explicitly marked
/// pre-admission history.
fn check_procedure_dates_within_stay(data: &ExtractedData) -> Vec<ValidationIssue> {
    use crate::types::DateRole;
    let admission = data.date_by_role(DateRole::Admission);
    let discharge = data.date_by_role(DateRole::Discharge);
    let (Some(admission), Some(discharge)) = (admission, discharge) else {
        return Vec::new();
    };

    data.procedures
        .iter()
        .filter_map(|entity| {
            if entity.temporal_context.pre_admission {
                return None;
            }
            let EntityValue::Procedure(procedure) = &entity.value else { return None };
            let date = procedure.date.or(entity.temporal_context.resolved_date)?;
            if date < admission || date > discharge {
                Some(ValidationIssue {
                    severity: IssueSeverity::Minor,
                    message: format!("procedure '{}' dated outside the admission window", procedure.name),
                    field: Some("procedures".to_string()),
                })
            } else {
                None
            }
        })
        .collect()
}

/// Flags discharge medications with no recorded indication among the
/// extracted complications/diagnoses, a soft consistency signal rather
/// than a hard error (a legitimate indication may simply not have been
/// captured as a separate entity).
fn check_medication_indications(data: &ExtractedData) -> Vec<ValidationIssue> {
    data.medications
        .iter()
        .filter_map(|entity| {
            let EntityValue::Medication(medication) = &entity.value else { return None };
            if medication.indication.is_none() && medication.name.to_lowercase().contains("levetiracetam") {
                Some(ValidationIssue {
                    severity: IssueSeverity::Info,
                    message: format!("medication '{}' has no documented indication", medication.name),
                    field: Some("medications".to_string()),
                })
            } else {
                None
            }
        })
        .collect()
}

/// Flags a pathology's expected fields (e.g. SAH's `hunt_hess_grade`,
/// `aneurysm_location`) that have no corresponding populated entity.
/// Mirrors the heuristic `quality_scorer::score_completeness` uses, kept
/// independent here since the Validator reports per-field issues rather
/// than a single aggregate score.
fn check_pathology_completeness(data: &ExtractedData, pack: &KnowledgePack) -> Vec<ValidationIssue> {
    let entities = data.all_entities();
    pack.expected_fields
        .iter()
        .filter(|field| !field_is_populated(field, &entities))
        .map(|field| ValidationIssue {
            severity: IssueSeverity::Minor,
            message: format!("expected field '{field}' for this pathology was not extracted"),
            field: Some(field.clone()),
        })
        .collect()
}

fn field_is_populated(field: &str, entities: &[&crate::types::Entity]) -> bool {
    let field = field.to_lowercase();
    entities.iter().any(|e| {
        let name = e.value.normalized_name();
        name.contains(&field) || field.split('_').all(|part| name.contains(part))
    })
}

/// Flags demographic ages and functional scores that fall outside the
/// plausible or scale-defined range -- a parsing or extraction error, not
/// a clinical fact.
fn check_numeric_ranges(data: &ExtractedData, pack: &KnowledgePack) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    if let Some(demographics) = &data.demographics {
        if let EntityValue::Demographic(demo) = &demographics.value {
            if let Some(age) = demo.age {
                if age > 120 {
                    issues.push(ValidationIssue {
                        severity: IssueSeverity::Major,
                        message: format!("age {age} is outside the plausible range [0, 120]"),
                        field: Some("demographics".to_string()),
                    });
                }
            }
        }
    }

    for entity in &data.functional_scores {
        let EntityValue::FunctionalScore(score) = &entity.value else { continue };
        let (low, high) = pack
            .grading_scales
            .iter()
            .find(|(name, _)| name.to_lowercase() == score.scale_name.to_lowercase())
            .map(|(_, range)| *range)
            .unwrap_or(score.range);
        if score.score < low || score.score > high {
            issues.push(ValidationIssue {
                severity: IssueSeverity::Minor,
                message: format!("{} score {} is outside the expected range [{low}, {high}]", score.scale_name, score.score),
                field: Some("functional_scores".to_string()),
            });
        }
    }

    issues
}

/// Flags narrative sections with leftover placeholder text or no
/// generated content at all -- signals the section fell back to a
/// template that couldn't fill in a required blank, or was never
/// generated.
fn check_narrative_style(narrative: &Narrative) -> Vec<ValidationIssue> {
    const PLACEHOLDER_MARKERS: &[&str] = &["TODO", "TBD", "[INSERT", "{{"];
    let mut issues = Vec::new();
    for section_name in crate::types::SECTION_ORDER {
        let Some(section) = narrative.get(section_name) else { continue };
        if PLACEHOLDER_MARKERS.iter().any(|marker| section.text.contains(marker)) {
            issues.push(ValidationIssue {
                severity: IssueSeverity::Major,
                message: format!("section '{section_name}' contains an unresolved placeholder"),
                field: Some(section_name.to_string()),
            });
        }
    }
    issues
}

fn check_unresolved_temporal_references(data: &ExtractedData) -> Vec<ValidationIssue> {
    data.all_entities()
        .into_iter()
        .filter(|entity| entity.temporal_context.resolution_failed)
        .map(|entity| ValidationIssue {
            severity: IssueSeverity::Minor,
            message: format!("{} entity has an unresolved temporal reference", entity.category_key()),
            field: Some(entity.category_key().to_string()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        DateRole, DateValue, Entity, ExtractionMethod, Narrative, ProcedureValue, SectionOrigin,
        SourceSpan, TemporalContext,
    };
    use chrono::NaiveDate;
    use std::collections::HashMap;

    fn date_entity(role: DateRole, date: &str) -> Entity {
        Entity::new(
            EntityValue::Date(DateValue { role, date: NaiveDate::parse_from_str(date, "%Y-%m-%d").ok() }),
            0.95,
            vec![SourceSpan { note_index: 0, start_offset: 0, end_offset: 1, matched_text: date.into() }],
            ExtractionMethod::Pattern,
            TemporalContext::new_event(0.95, "date label"),
        )
    }

    #[test]
    fn missing_evidence_is_flagged_critical() {
        let mut data = ExtractedData::default();
        let mut entity = date_entity(DateRole::Admission, "2024-03-01");
        entity.source_spans.clear();
        data.dates.push(entity);
        let issues = check_evidence_invariant(&data, &[]);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, IssueSeverity::Critical);
    }

    #[test]
    fn discharge_before_admission_is_flagged() {
        let mut data = ExtractedData::default();
        data.dates.push(date_entity(DateRole::Admission, "2024-03-10"));
        data.dates.push(date_entity(DateRole::Discharge, "2024-03-01"));
        let issues = check_admission_before_discharge(&data);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, IssueSeverity::Major);
    }

    #[test]
    fn procedure_outside_stay_is_flagged_minor() {
        let mut data = ExtractedData::default();
        data.dates.push(date_entity(DateRole::Admission, "2024-03-01"));
        data.dates.push(date_entity(DateRole::Discharge, "2024-03-10"));
        data.procedures.push(Entity::new(
            EntityValue::Procedure(ProcedureValue {
                name: "craniotomy".into(),
                date: NaiveDate::parse_from_str("2024-04-01", "%Y-%m-%d").ok(),
                pod_zero: false,
            }),
            0.9,
            vec![SourceSpan { note_index: 0, start_offset: 0, end_offset: 1, matched_text: "x".into() }],
            ExtractionMethod::Pattern,
            TemporalContext::new_event(0.9, "procedure label"),
        ));
        let issues = check_procedure_dates_within_stay(&data);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, IssueSeverity::Minor);
    }

    #[test]
    fn pre_admission_flag_exempts_procedure_from_window_check() {
        let mut data = ExtractedData::default();
        data.dates.push(date_entity(DateRole::Admission, "2024-03-01"));
        data.dates.push(date_entity(DateRole::Discharge, "2024-03-10"));
        let mut procedure = Entity::new(
            EntityValue::Procedure(ProcedureValue {
                name: "prior shunt placement".into(),
                date: NaiveDate::parse_from_str("2020-01-01", "%Y-%m-%d").ok(),
                pod_zero: false,
            }),
            0.9,
            vec![SourceSpan { note_index: 0, start_offset: 0, end_offset: 1, matched_text: "x".into() }],
            ExtractionMethod::Pattern,
            TemporalContext::new_event(0.9, "procedure label"),
        );
        procedure.temporal_context.pre_admission = true;
        data.procedures.push(procedure);
        assert!(check_procedure_dates_within_stay(&data).is_empty());
    }

    fn pack_with_expected_fields(fields: &[&str]) -> KnowledgePack {
        use crate::types::Pathology;
        KnowledgePack {
            name: Pathology::Sah,
            aliases: Vec::new(),
            keyword_weights: HashMap::new(),
            expected_fields: fields.iter().map(|f| f.to_string()).collect(),
            grading_scales: HashMap::new(),
            common_procedures: Vec::new(),
            common_complications: Vec::new(),
            follow_up_conventions: Vec::new(),
            narrative_template: String::new(),
            canonical_spellings: HashMap::new(),
        }
    }

    #[test]
    fn missing_expected_field_is_flagged() {
        let data = ExtractedData::default();
        let pack = pack_with_expected_fields(&["hunt_hess_grade"]);
        let issues = check_pathology_completeness(&data, &pack);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, IssueSeverity::Minor);
    }

    #[test]
    fn present_expected_field_is_not_flagged() {
        use crate::types::{FunctionalScoreValue};
        let mut data = ExtractedData::default();
        data.functional_scores.push(Entity::new(
            EntityValue::FunctionalScore(FunctionalScoreValue {
                scale_name: "hunt_hess_grade".into(),
                score: 3.0,
                range: (1.0, 5.0),
                from_gold_standard_source: false,
            }),
            0.9,
            vec![SourceSpan { note_index: 0, start_offset: 0, end_offset: 1, matched_text: "x".into() }],
            ExtractionMethod::Pattern,
            TemporalContext::new_event(0.9, "score label"),
        ));
        let pack = pack_with_expected_fields(&["hunt_hess_grade"]);
        assert!(check_pathology_completeness(&data, &pack).is_empty());
    }

    #[test]
    fn age_outside_plausible_range_is_flagged_major() {
        use crate::types::Demographic;
        let mut data = ExtractedData::default();
        data.demographics = Some(Entity::new(
            EntityValue::Demographic(Demographic { age: Some(140), ..Default::default() }),
            0.9,
            vec![SourceSpan { note_index: 0, start_offset: 0, end_offset: 1, matched_text: "x".into() }],
            ExtractionMethod::Pattern,
            TemporalContext::new_event(0.9, "demographics label"),
        ));
        let pack = pack_with_expected_fields(&[]);
        let issues = check_numeric_ranges(&data, &pack);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, IssueSeverity::Major);
    }

    #[test]
    fn functional_score_outside_scale_range_is_flagged() {
        use crate::types::FunctionalScoreValue;
        let mut data = ExtractedData::default();
        data.functional_scores.push(Entity::new(
            EntityValue::FunctionalScore(FunctionalScoreValue {
                scale_name: "hunt_hess".into(),
                score: 9.0,
                range: (1.0, 5.0),
                from_gold_standard_source: false,
            }),
            0.9,
            vec![SourceSpan { note_index: 0, start_offset: 0, end_offset: 1, matched_text: "x".into() }],
            ExtractionMethod::Pattern,
            TemporalContext::new_event(0.9, "score label"),
        ));
        let mut pack = pack_with_expected_fields(&[]);
        pack.grading_scales.insert("hunt_hess".into(), (1.0, 5.0));
        let issues = check_numeric_ranges(&data, &pack);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, IssueSeverity::Minor);
    }

    #[test]
    fn narrative_with_placeholder_marker_is_flagged() {
        let mut narrative = Narrative::default();
        narrative.set("hospital_course", "Patient admitted. [INSERT DETAILS]".into(), SectionOrigin::Llm);
        let issues = check_narrative_style(&narrative);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, IssueSeverity::Major);
    }

    #[test]
    fn narrative_without_placeholder_is_not_flagged() {
        let mut narrative = Narrative::default();
        narrative.set("hospital_course", "Patient admitted and treated uneventfully.".into(), SectionOrigin::Llm);
        assert!(check_narrative_style(&narrative).is_empty());
    }
}
