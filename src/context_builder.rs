//! Context Builder: assigns a primary and secondary pathology tag to a
//! note bundle by scoring each [`crate::knowledge::KnowledgePack`]'s
//! keyword dictionary against the normalized text, then bundles the
//! winning knowledge pack with the notes for downstream stages.

use crate::knowledge::KnowledgeRegistry;
use crate::types::{Note, Pathology, PathologyAssignment};
use std::collections::HashMap;
use tracing::{debug, info};

/// Whether a note bundle warrants the LLM Extractor's single focused pass
/// or several narrower passes. A bundle is `Complex` when it spans more
/// than one plausible pathology, runs long, or documents more than one
/// admission -- situations where a single generic extraction prompt tends
/// to miss secondary findings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComplexityLevel {
    Simple,
    Complex,
}

/// Services recognized as consultants rather than the primary team, keyed
/// by the word that appears immediately before "consult"/"consulted" in
/// free text.
const CONSULTANT_SERVICES: &[&str] = &[
    "neurology",
    "neurosurgery",
    "cardiology",
    "pulmonology",
    "nephrology",
    "infectious disease",
    "psychiatry",
    "physical therapy",
    "occupational therapy",
    "speech therapy",
    "palliative care",
    "social work",
    "endocrine",
];

const GOLD_STANDARD_FUNCTIONAL_CUES: &[&str] = &["physical therapy", "occupational therapy", " pt ", " ot ", "pt/ot", "pt note", "ot note"];

/// Everything downstream stages need about the subject of the notes: the
/// normalized notes, the pathology assignment, and the knowledge pack
/// tracking it. Built once per request, read-only afterward.
#[derive(Debug, Clone)]
pub struct PipelineContext<'a> {
    pub notes: Vec<Note>,
    pub pathology: PathologyAssignment,
    pub registry: &'a KnowledgeRegistry,
    pub consultant_services: Vec<String>,
    pub complexity: ComplexityLevel,
    pub has_gold_standard_functional_source: bool,
}

/// Score every knowledge pack's keyword dictionary against `notes` and
/// assign the primary (highest-scoring) and secondary (any pack scoring
/// above [`SECONDARY_THRESHOLD`] of the primary's score, excluding it)
/// pathologies. A `hint` from [`crate::types::PipelineOptions`] short-circuits
/// detection when supplied.
const SECONDARY_THRESHOLD: f64 = 0.4;

pub fn build_context<'a>(
    notes: Vec<Note>,
    registry: &'a KnowledgeRegistry,
    hint: Option<Pathology>,
) -> PipelineContext<'a> {
    let assignment = if let Some(hint) = hint {
        info!(pathology = %hint, "pathology supplied by caller, skipping detection");
        PathologyAssignment {
            primary: hint,
            secondary: Vec::new(),
            scores: HashMap::new(),
        }
    } else {
        detect_pathology(&notes, registry)
    };

    debug!(primary = %assignment.primary, secondary = ?assignment.secondary, "pathology assigned");

    let consultant_services = detect_consultant_services(&notes);
    let complexity = score_complexity(&notes, &assignment, &consultant_services);
    let has_gold_standard_functional_source = detect_gold_standard_functional_source(&notes);

    PipelineContext {
        notes,
        pathology: assignment,
        registry,
        consultant_services,
        complexity,
        has_gold_standard_functional_source,
    }
}

/// Finds mentions of the form "<service> consult"/"<service> consulted"/
/// "consulted <service>" for each name in [`CONSULTANT_SERVICES`].
fn detect_consultant_services(notes: &[Note]) -> Vec<String> {
    let corpus: String = notes.iter().map(|n| n.text.to_lowercase()).collect::<Vec<_>>().join("\n");
    CONSULTANT_SERVICES
        .iter()
        .filter(|service| {
            let forward = format!("{service} consult");
            let reverse = format!("consulted {service}");
            corpus.contains(&forward) || corpus.contains(&reverse)
        })
        .map(|service| service.to_string())
        .collect()
}

/// A bundle is `Complex` when more than one pathology scores meaningfully
/// (secondary pathologies present), more than one consultant service is
/// involved, or the corpus is long enough that a single pass tends to
/// under-extract. Otherwise `Simple`.
fn score_complexity(notes: &[Note], assignment: &PathologyAssignment, consultant_services: &[String]) -> ComplexityLevel {
    let total_chars: usize = notes.iter().map(|n| n.text.len()).sum();
    if !assignment.secondary.is_empty() || consultant_services.len() > 1 || notes.len() > 3 || total_chars > 20_000 {
        ComplexityLevel::Complex
    } else {
        ComplexityLevel::Simple
    }
}

/// PT/OT notes are the gold-standard source for functional status scores
/// (mRS, Barthel, FIM); a score documented in a PT/OT note is trusted
/// over one paraphrased secondhand in a physician progress note.
fn detect_gold_standard_functional_source(notes: &[Note]) -> bool {
    let corpus: String = notes.iter().map(|n| n.text.to_lowercase()).collect::<Vec<_>>().join("\n");
    GOLD_STANDARD_FUNCTIONAL_CUES.iter().any(|cue| corpus.contains(cue))
}

fn detect_pathology(notes: &[Note], registry: &KnowledgeRegistry) -> PathologyAssignment {
    let corpus: String = notes
        .iter()
        .map(|n| n.text.to_lowercase())
        .collect::<Vec<_>>()
        .join("\n");

    let mut scores: HashMap<Pathology, f64> = HashMap::new();
    for pack in registry.all() {
        if pack.name == Pathology::General {
            continue;
        }
        let mut score = 0.0;
        for (keyword, weight) in &pack.keyword_weights {
            let count = corpus.matches(keyword.as_str()).count();
            if count > 0 {
                score += weight * count as f64;
            }
        }
        scores.insert(pack.name, score);
    }

    let primary = scores
        .iter()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .filter(|(_, score)| **score > 0.0)
        .map(|(pathology, _)| *pathology)
        .unwrap_or(Pathology::General);

    let primary_score = scores.get(&primary).copied().unwrap_or(0.0);
    let secondary = if primary_score > 0.0 {
        scores
            .iter()
            .filter(|(p, s)| **p != primary && **s >= primary_score * SECONDARY_THRESHOLD && **s > 0.0)
            .map(|(p, _)| *p)
            .collect()
    } else {
        Vec::new()
    };

    PathologyAssignment {
        primary,
        secondary,
        scores,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_sah_from_keywords() {
        let registry = KnowledgeRegistry::with_defaults();
        let notes = vec![Note::new(
            "Patient presented with aneurysmal subarachnoid hemorrhage, Hunt and Hess grade 3, \
             Fisher grade 3. Underwent craniotomy for aneurysm clipping. Started on nimodipine \
             for vasospasm prophylaxis.",
        )];
        let ctx = build_context(notes, &registry, None);
        assert_eq!(ctx.pathology.primary, Pathology::Sah);
    }

    #[test]
    fn falls_back_to_general_with_no_keyword_hits() {
        let registry = KnowledgeRegistry::with_defaults();
        let notes = vec![Note::new("Patient is doing well today, no complaints.")];
        let ctx = build_context(notes, &registry, None);
        assert_eq!(ctx.pathology.primary, Pathology::General);
    }

    #[test]
    fn hint_bypasses_detection() {
        let registry = KnowledgeRegistry::with_defaults();
        let notes = vec![Note::new("totally unrelated free text about spine surgery")];
        let ctx = build_context(notes, &registry, Some(Pathology::Tumor));
        assert_eq!(ctx.pathology.primary, Pathology::Tumor);
        assert!(ctx.pathology.secondary.is_empty());
    }

    #[test]
    fn detects_consultant_service_mentions() {
        let registry = KnowledgeRegistry::with_defaults();
        let notes = vec![Note::new("Neurology consult obtained for seizure management. Physical therapy consult placed.")];
        let ctx = build_context(notes, &registry, None);
        assert!(ctx.consultant_services.contains(&"neurology".to_string()));
        assert!(ctx.consultant_services.contains(&"physical therapy".to_string()));
    }

    #[test]
    fn short_single_pathology_note_is_simple() {
        let registry = KnowledgeRegistry::with_defaults();
        let notes = vec![Note::new("Patient with SAH s/p coiling, doing well.")];
        let ctx = build_context(notes, &registry, None);
        assert_eq!(ctx.complexity, ComplexityLevel::Simple);
    }

    #[test]
    fn many_notes_are_flagged_complex() {
        let registry = KnowledgeRegistry::with_defaults();
        let notes: Vec<Note> = (0..5).map(|i| Note::new(format!("Progress note {i}: patient stable."))).collect();
        let ctx = build_context(notes, &registry, None);
        assert_eq!(ctx.complexity, ComplexityLevel::Complex);
    }

    #[test]
    fn pt_note_flags_gold_standard_functional_source() {
        let registry = KnowledgeRegistry::with_defaults();
        let notes = vec![Note::new("Physical therapy evaluation: mRS 2, ambulating with assist.")];
        let ctx = build_context(notes, &registry, None);
        assert!(ctx.has_gold_standard_functional_source);
    }

    #[test]
    fn no_pt_ot_cues_means_no_gold_standard_source() {
        let registry = KnowledgeRegistry::with_defaults();
        let notes = vec![Note::new("Patient ambulating independently per nursing note.")];
        let ctx = build_context(notes, &registry, None);
        assert!(!ctx.has_gold_standard_functional_source);
    }
}
