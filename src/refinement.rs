//! Refinement Planner: converts a [`QualityReport`]'s issues into a
//! focused re-extraction plan for the iterative refinement loop, turning a
//! flat list of findings into typed, actionable work items.

use crate::types::{IssueSeverity, QualityReport, ValidationIssue};

/// One focused instruction for the next refinement pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefinementAction {
    /// Re-run LLM extraction focused on `field`, since pattern-only
    /// coverage left it empty or unresolved.
    ReExtractField { field: String },
    /// Re-run narrative generation for `section`, since it was empty or
    /// fell back to a low-information template.
    RegenerateSection { section: String },
    /// No further action is useful; refinement should stop.
    Stop,
}

/// Builds a refinement plan from `report`. Returns `[Stop]` once the
/// report already meets `quality_target` or carries no actionable issues,
/// so the Orchestrator's refinement loop terminates rather than spinning.
pub fn plan(report: &QualityReport, quality_target: f64) -> Vec<RefinementAction> {
    if report.overall >= quality_target {
        return vec![RefinementAction::Stop];
    }

    let mut actions: Vec<RefinementAction> = report
        .issues
        .iter()
        .filter(|issue| matches!(issue.severity, IssueSeverity::Critical | IssueSeverity::Major))
        .filter_map(field_action)
        .collect();

    if report.narrative_quality < 70.0 {
        for section in crate::types::CRITICAL_SECTIONS {
            actions.push(RefinementAction::RegenerateSection { section: section.to_string() });
        }
    }

    actions.dedup();

    if actions.is_empty() {
        actions.push(RefinementAction::Stop);
    }
    actions
}

fn field_action(issue: &ValidationIssue) -> Option<RefinementAction> {
    issue.field.clone().map(|field| RefinementAction::ReExtractField { field })
}

/// Whether a plan contains only [`RefinementAction::Stop`].
pub fn is_terminal(plan: &[RefinementAction]) -> bool {
    plan.len() == 1 && plan[0] == RefinementAction::Stop
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(overall: f64, issues: Vec<ValidationIssue>) -> QualityReport {
        QualityReport {
            completeness: overall,
            accuracy: overall,
            consistency: overall,
            narrative_quality: overall,
            specificity: overall,
            timeliness: overall,
            overall,
            issues,
        }
    }

    #[test]
    fn meeting_target_stops_immediately() {
        let report = report(95.0, vec![]);
        let plan = plan(&report, 90.0);
        assert!(is_terminal(&plan));
    }

    #[test]
    fn critical_issue_below_target_produces_reextract_action() {
        let issue = ValidationIssue {
            severity: IssueSeverity::Critical,
            message: "missing evidence".into(),
            field: Some("procedures".into()),
        };
        let report = report(60.0, vec![issue]);
        let plan = plan(&report, 90.0);
        assert!(plan.contains(&RefinementAction::ReExtractField { field: "procedures".into() }));
    }

    #[test]
    fn low_narrative_quality_triggers_section_regeneration() {
        let mut report = report(60.0, vec![]);
        report.narrative_quality = 50.0;
        let plan = plan(&report, 90.0);
        assert!(plan.iter().any(|a| matches!(a, RefinementAction::RegenerateSection { .. })));
    }

    #[test]
    fn no_actionable_issues_below_target_still_terminates() {
        let info_issue = ValidationIssue {
            severity: IssueSeverity::Info,
            message: "minor note".into(),
            field: None,
        };
        let mut report = report(85.0, vec![info_issue]);
        report.narrative_quality = 85.0;
        let plan = plan(&report, 90.0);
        assert!(is_terminal(&plan));
    }
}
