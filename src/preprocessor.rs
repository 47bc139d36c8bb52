//! Preprocessor: normalizes raw notes and assesses source documentation
//! quality before extraction begins.

use crate::error::{PipelineError, Result};
use crate::types::{Note, NoteType, SourceGrade, SourceQuality, SourceQualityIssue};
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::{debug, warn};

/// Section-header spelling variants folded to the canonical form the
/// pattern extractor's recipes look for. Anchored to the start of a line
/// so free-text mentions elsewhere aren't rewritten.
static HEADER_ALIASES: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    vec![
        (Regex::new(r"(?im)^\s*admit\s*date\s*:?").unwrap(), "Admission Date:"),
        (Regex::new(r"(?im)^\s*date\s*of\s*admission\s*:?").unwrap(), "Admission Date:"),
        (Regex::new(r"(?im)^\s*d/?c\s*date\s*:?").unwrap(), "Discharge Date:"),
        (Regex::new(r"(?im)^\s*date\s*of\s*discharge\s*:?").unwrap(), "Discharge Date:"),
        (Regex::new(r"(?im)^\s*op\s*date\s*:?").unwrap(), "Surgery Date:"),
        (Regex::new(r"(?im)^\s*surgical\s*date\s*:?").unwrap(), "Surgery Date:"),
        (Regex::new(r"(?im)^\s*hpi\s*:?").unwrap(), "History of Present Illness:"),
        (Regex::new(r"(?im)^\s*pmh\s*:?").unwrap(), "Past Medical History:"),
    ]
});

static BARE_DATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{1,2}/\d{1,2}/\d{2,4})\b").expect("invalid bare date regex"));

/// Abbreviations common enough across neurosurgical documentation to be
/// worth expanding regardless of pathology, mirroring the canonical
/// spellings the SAH knowledge pack documents for the same terms.
const GENERIC_ABBREVIATIONS: &[(&str, &str)] = &[
    ("evd", "external ventricular drain"),
    ("vps", "ventriculoperitoneal shunt"),
    ("sdh", "subdural hematoma"),
    ("sah", "subarachnoid hemorrhage"),
    ("csf", "cerebrospinal fluid"),
    ("gcs", "glasgow coma scale"),
];

/// Normalized note text plus the quality assessment the rest of the
/// pipeline conditions on.
#[derive(Debug, Clone)]
pub struct PreprocessedInput {
    pub notes: Vec<Note>,
    pub source_quality: SourceQuality,
}

/// Normalize whitespace/line endings and compute [`SourceQuality`] for a
/// batch of notes. Returns [`PipelineError::EmptyInput`] if `notes` is
/// empty and [`PipelineError::PreprocessingError`] if every note is blank
/// after normalization.
pub fn preprocess(notes: Vec<Note>) -> Result<PreprocessedInput> {
    if notes.is_empty() {
        return Err(PipelineError::EmptyInput);
    }

    let normalized: Vec<Note> = notes.into_iter().map(normalize_note).collect();

    if normalized.iter().all(|n| n.text.trim().is_empty()) {
        return Err(PipelineError::PreprocessingError(
            "all notes were empty after normalization".to_string(),
        ));
    }

    let source_quality = assess_source_quality(&normalized);
    debug!(
        score = source_quality.overall_score,
        grade = ?source_quality.grade,
        "assessed source quality"
    );
    if matches!(source_quality.grade, SourceGrade::Poor | SourceGrade::VeryPoor) {
        warn!(score = source_quality.overall_score, "low source documentation quality");
    }

    Ok(PreprocessedInput {
        notes: normalized,
        source_quality,
    })
}

fn normalize_note(mut note: Note) -> Note {
    let collapsed = note
        .text
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n");
    let collapsed = collapsed.trim().to_string();

    let canonicalized = canonicalize_headers(&collapsed);
    let with_iso_dates = annotate_iso_dates(&canonicalized);
    let with_abbreviations = expand_generic_abbreviations(&with_iso_dates);

    note.text = with_abbreviations;
    if note.note_type.is_none() {
        note.note_type = classify_note_type(&note.text);
    }
    note
}

/// Folds header spelling variants (e.g. "Admit Date", "D/C Date", "HPI")
/// to the canonical form so the same section reads consistently across
/// notes from different authors or templates.
fn canonicalize_headers(text: &str) -> String {
    let mut result = text.to_string();
    for (pattern, canonical) in HEADER_ALIASES.iter() {
        result = pattern.replace_all(&result, *canonical).into_owned();
    }
    result
}

/// Appends an ISO-8601 rendering after every `M/D/YYYY`-style date found,
/// e.g. `03/01/2024 (2024-03-01)`. Additive rather than a rewrite, so the
/// original token (and every regex downstream that still expects the
/// `M/D/YYYY` form) keeps matching.
fn annotate_iso_dates(text: &str) -> String {
    BARE_DATE_RE
        .replace_all(text, |caps: &Captures| {
            let raw = &caps[0];
            match parse_loose_date(raw) {
                Some(date) => format!("{raw} ({})", date.format("%Y-%m-%d")),
                None => raw.to_string(),
            }
        })
        .into_owned()
}

/// Parses `M/D/YYYY` or `M/D/YY`, matching the pattern extractor's date
/// convention (two-digit years fall in 2000-2099).
fn parse_loose_date(raw: &str) -> Option<NaiveDate> {
    let parts: Vec<&str> = raw.split('/').collect();
    if parts.len() != 3 {
        return None;
    }
    let month: u32 = parts[0].parse().ok()?;
    let day: u32 = parts[1].parse().ok()?;
    let mut year: i32 = parts[2].parse().ok()?;
    if year < 100 {
        year += 2000;
    }
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Appends the spelled-out form after an abbreviation's first appearance
/// per note, e.g. `EVD (external ventricular drain)`. Skips occurrences
/// already followed by a parenthetical so re-running normalization is a
/// no-op.
fn expand_generic_abbreviations(text: &str) -> String {
    let mut result = text.to_string();
    for (abbrev, expansion) in GENERIC_ABBREVIATIONS {
        let Ok(re) = Regex::new(&format!(r"(?i)\b{}\b(?!\s*\()", regex::escape(abbrev))) else { continue };
        result = re.replace(&result, |caps: &Captures| format!("{} ({expansion})", &caps[0])).into_owned();
    }
    result
}

/// Infers the note's clinical type from header and section cues. Only
/// applied when the caller didn't already declare a type.
fn classify_note_type(text: &str) -> Option<NoteType> {
    let lower = text.to_lowercase();
    if lower.trim().is_empty() {
        None
    } else if lower.contains("discharge summary") || lower.contains("discharge date") {
        Some(NoteType::Discharge)
    } else if lower.contains("operative report") || lower.contains("operative note") || lower.contains("procedure note") {
        Some(NoteType::Operative)
    } else if lower.contains("consult") {
        Some(NoteType::Consult)
    } else if lower.contains("admission date") || lower.contains("history of present illness") {
        Some(NoteType::Admission)
    } else {
        Some(NoteType::Progress)
    }
}

/// Scores the note corpus across five dimensions (structure, completeness,
/// formality, detail, consistency) and folds them into a single 0-100
/// score used by the Hybrid Merger for confidence calibration.
fn assess_source_quality(notes: &[Note]) -> SourceQuality {
    let mut issues = Vec::new();
    let mut score = 100.0f64;

    let total_chars: usize = notes.iter().map(|n| n.text.chars().count()).sum();
    let avg_len = total_chars as f64 / notes.len().max(1) as f64;

    if avg_len < 200.0 {
        score -= 20.0;
        issues.push(SourceQualityIssue::Detail);
    }

    let has_section_headers = notes
        .iter()
        .any(|n| n.text.contains(':') && n.text.lines().any(|l| l.trim_end().ends_with(':')));
    if !has_section_headers {
        score -= 15.0;
        issues.push(SourceQualityIssue::Structure);
    }

    let has_dates = notes.iter().any(|n| {
        n.text.contains('/') || n.text.to_lowercase().contains("pod") || n.text.to_lowercase().contains("hd")
    });
    if !has_dates {
        score -= 15.0;
        issues.push(SourceQualityIssue::Completeness);
    }

    let shouting_ratio = notes
        .iter()
        .map(|n| {
            let upper = n.text.chars().filter(|c| c.is_uppercase()).count();
            let alpha = n.text.chars().filter(|c| c.is_alphabetic()).count().max(1);
            upper as f64 / alpha as f64
        })
        .fold(0.0, f64::max);
    if shouting_ratio > 0.6 {
        score -= 10.0;
        issues.push(SourceQualityIssue::Formality);
    }

    if notes.len() > 1 {
        let lengths: Vec<usize> = notes.iter().map(|n| n.text.len()).collect();
        let max = *lengths.iter().max().unwrap_or(&0);
        let min = *lengths.iter().min().unwrap_or(&0);
        if max > 0 && (max - min) as f64 / max as f64 > 0.9 {
            score -= 10.0;
            issues.push(SourceQualityIssue::Consistency);
        }
    }

    let overall_score = score.clamp(0.0, 100.0);
    SourceQuality {
        overall_score,
        grade: SourceGrade::from_score(overall_score),
        issues,
    }
}
