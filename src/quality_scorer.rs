//! Quality Scorer: computes the six-dimension [`QualityReport`] from
//! extracted data, the narrative, and validation issues, as a weighted,
//! per-dimension score aggregated into a single overall figure.

use crate::knowledge::KnowledgeRegistry;
use crate::narrative_generator::missing_critical_sections;
use crate::types::{
    ExtractedData, IssueSeverity, Narrative, Pathology, QualityReport, QualityWeights,
    ValidationIssue,
};

/// Scores `data`/`narrative` against `issues` and the pathology's expected
/// fields, producing the six-dimension report the Refinement Planner and
/// the Orchestrator's stop condition both read.
pub fn score(
    data: &ExtractedData,
    narrative: &Narrative,
    issues: &[ValidationIssue],
    pathology: Pathology,
    registry: &KnowledgeRegistry,
) -> QualityReport {
    let weights = QualityWeights::default();

    let completeness = score_completeness(data, pathology, registry);
    let accuracy = score_accuracy(issues);
    let consistency = score_consistency(issues);
    let narrative_quality = score_narrative_quality(narrative);
    let specificity = score_specificity(data);
    let timeliness = score_timeliness(data);

    let overall = QualityReport::compute_overall(
        completeness,
        accuracy,
        consistency,
        narrative_quality,
        specificity,
        timeliness,
        weights,
    );

    QualityReport {
        completeness,
        accuracy,
        consistency,
        narrative_quality,
        specificity,
        timeliness,
        overall,
        issues: issues.to_vec(),
    }
}

/// Fraction of the pathology's expected fields that were populated.
fn score_completeness(data: &ExtractedData, pathology: Pathology, registry: &KnowledgeRegistry) -> f64 {
    let pack = registry.get(pathology);
    if pack.expected_fields.is_empty() {
        return if data.all_entities().is_empty() { 40.0 } else { 85.0 };
    }

    let populated = pack
        .expected_fields
        .iter()
        .filter(|field| field_is_populated(data, field))
        .count();

    (populated as f64 / pack.expected_fields.len() as f64) * 100.0
}

fn field_is_populated(data: &ExtractedData, field: &str) -> bool {
    match field {
        f if f.contains("procedure") => !data.procedures.is_empty(),
        f if f.contains("grade") || f.contains("location") || f.contains("type") => {
            !data.procedures.is_empty() || !data.complications.is_empty()
        }
        _ => !data.all_entities().is_empty(),
    }
}

/// Penalized by critical/major validation issues; a clean run starts at
/// 100 and loses points per issue severity.
fn score_accuracy(issues: &[ValidationIssue]) -> f64 {
    let mut score = 100.0;
    for issue in issues {
        score -= match issue.severity {
            IssueSeverity::Critical => 25.0,
            IssueSeverity::Major => 10.0,
            IssueSeverity::Minor => 3.0,
            IssueSeverity::Info => 0.0,
        };
    }
    score.clamp(0.0, 100.0)
}

/// Consistency specifically tracks cross-field issues (major/minor), as
/// distinct from the critical evidence-invariant violations accuracy
/// tracks.
fn score_consistency(issues: &[ValidationIssue]) -> f64 {
    let inconsistencies = issues
        .iter()
        .filter(|i| matches!(i.severity, IssueSeverity::Major | IssueSeverity::Minor))
        .count();
    (100.0 - (inconsistencies as f64 * 8.0)).clamp(0.0, 100.0)
}

fn score_narrative_quality(narrative: &Narrative) -> f64 {
    let missing = missing_critical_sections(narrative).len();
    let mut score = 100.0 - (missing as f64 * 15.0);

    let avg_len: f64 = if narrative.sections.is_empty() {
        0.0
    } else {
        narrative.sections.values().map(|s| s.text.len()).sum::<usize>() as f64
            / narrative.sections.len() as f64
    };
    if avg_len < 20.0 {
        score -= 20.0;
    }

    score.clamp(0.0, 100.0)
}

/// Rewards entities with high per-entity confidence (specific, well-
/// evidenced facts) over a large count of low-confidence guesses.
fn score_specificity(data: &ExtractedData) -> f64 {
    let entities = data.all_entities();
    if entities.is_empty() {
        return 0.0;
    }
    let avg_confidence: f64 = entities.iter().map(|e| e.confidence).sum::<f64>() / entities.len() as f64;
    avg_confidence * 100.0
}

/// Rewards entities whose temporal context resolved cleanly over ones
/// left with an unresolved reference.
fn score_timeliness(data: &ExtractedData) -> f64 {
    let entities = data.all_entities();
    if entities.is_empty() {
        return 50.0;
    }
    let resolved = entities.iter().filter(|e| !e.temporal_context.resolution_failed).count();
    (resolved as f64 / entities.len() as f64) * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        ComplicationTiming, ComplicationValue, Entity, EntityValue, ExtractionMethod, SourceSpan,
        TemporalContext,
    };

    #[test]
    fn empty_data_scores_low_but_does_not_panic() {
        let data = ExtractedData::default();
        let narrative = Narrative::default();
        let registry = KnowledgeRegistry::with_defaults();
        let report = score(&data, &narrative, &[], Pathology::General, &registry);
        assert!(report.overall < 50.0);
    }

    #[test]
    fn critical_issue_tanks_accuracy() {
        let issues = vec![ValidationIssue {
            severity: IssueSeverity::Critical,
            message: "missing evidence".to_string(),
            field: None,
        }];
        let accuracy = score_accuracy(&issues);
        assert!(accuracy <= 75.0);
    }

    #[test]
    fn high_confidence_entities_improve_specificity() {
        let mut data = ExtractedData::default();
        data.complications.push(Entity::new(
            EntityValue::Complication(ComplicationValue {
                name: "vasospasm".into(),
                timing: ComplicationTiming::Unspecified,
                linked_procedure: None,
            }),
            0.95,
            vec![SourceSpan { note_index: 0, start_offset: 0, end_offset: 1, matched_text: "x".into() }],
            ExtractionMethod::Pattern,
            TemporalContext::new_event(0.95, "complication keyword"),
        ));
        assert!(score_specificity(&data) > 90.0);
    }
}
