//! Temporal Engine: classifies each entity's temporal context as a new
//! event or a reference to a previously-extracted event, and resolves
//! POD ("post-op day")/HD ("hospital day") offsets into calendar dates
//! against the admission and surgery anchors.

use crate::types::{ComplicationValue, DateRole, Entity, EntityValue, ExtractedData, TemporalKind};
use chrono::{Days, NaiveDate};
use regex::Regex;
use once_cell::sync::Lazy;
use tracing::debug;

/// Textual cues that mark a mention as referring back to an already-known
/// event rather than introducing a new one. Checked in priority order,
/// highest-priority cues first.
static REFERENCE_INDICATORS: &[&str] = &["s/p", "status post", "post-op", "postoperative", "following her", "following his"];
static NEW_EVENT_INDICATORS: &[&str] = &["underwent", "taken to the operating room", "procedure:", "was performed"];

/// Phrases that resolve to a calendar date relative to the entity's note,
/// rather than naming an absolute date or a POD/HD offset.
static RELATIVE_NEXT_DAY: &[&str] = &["the next day", "the following day"];
static RELATIVE_BY_DISCHARGE: &[&str] = &["by discharge", "by the time of discharge"];

static POD_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bPOD\s*#?\s*(\d+)\b").expect("invalid POD regex"));
static HD_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bHD\s*#?\s*(\d+)\b").expect("invalid HD regex"));

/// Maximum character distance within the same note for a complication to
/// be considered causally adjacent to a procedure mention.
const CAUSAL_ADJACENCY_WINDOW: usize = 250;

const CONFIDENCE_NEW_EVENT_CUE: f64 = 0.95;
const CONFIDENCE_REFERENCE_CUE: f64 = 0.90;
const CONFIDENCE_RELATIVE_PHRASE: f64 = 0.85;
const CONFIDENCE_NO_CUE: f64 = 0.50;

/// Runs temporal classification and date resolution over every entity in
/// `data`, using `data`'s own admission/surgery/discharge dates as anchors.
/// Mutates entities in place; never removes one. Unresolved references are
/// flagged, not discarded.
pub fn resolve(data: &mut ExtractedData) {
    let admission = data.date_by_role(DateRole::Admission);
    let surgery = data.date_by_role(DateRole::Surgery);
    let discharge = data.date_by_role(DateRole::Discharge);

    for entity in data.all_entities_mut() {
        classify_new_event_vs_reference(entity);
        resolve_offsets(entity, admission, surgery);
        resolve_relative_phrase(entity, admission, discharge);
    }

    link_complications_to_procedures(data);
}

fn classify_new_event_vs_reference(entity: &mut Entity) {
    let indicator = entity.temporal_context.indicator.to_lowercase();

    for cue in REFERENCE_INDICATORS {
        if indicator.contains(cue) {
            entity.temporal_context.kind = TemporalKind::Reference;
            entity.temporal_context.confidence = CONFIDENCE_REFERENCE_CUE;
            debug!(cue, "classified as reference");
            return;
        }
    }
    for cue in NEW_EVENT_INDICATORS {
        if indicator.contains(cue) {
            entity.temporal_context.kind = TemporalKind::NewEvent;
            entity.temporal_context.confidence = CONFIDENCE_NEW_EVENT_CUE;
            debug!(cue, "classified as new event");
            return;
        }
    }
    // No explicit cue: leave the extractor's default classification in
    // place (new event). Under-counting distinct events is worse than
    // over-counting for a clinical summary. Confidence drops to reflect
    // the guess.
    entity.temporal_context.confidence = CONFIDENCE_NO_CUE;
}

/// Resolves phrases like "the next day" (relative to admission, as a
/// stand-in for the preceding anchor date) and "by discharge" against the
/// discharge date. Only fires when POD/HD resolution above didn't already
/// set a resolved date.
fn resolve_relative_phrase(entity: &mut Entity, admission: Option<NaiveDate>, discharge: Option<NaiveDate>) {
    if entity.temporal_context.resolved_date.is_some() {
        return;
    }
    let indicator = entity.temporal_context.indicator.to_lowercase();

    if RELATIVE_BY_DISCHARGE.iter().any(|p| indicator.contains(p)) {
        if let Some(discharge) = discharge {
            entity.temporal_context.resolved_date = Some(discharge);
            entity.temporal_context.confidence = entity.temporal_context.confidence.max(CONFIDENCE_RELATIVE_PHRASE);
        }
        return;
    }
    if RELATIVE_NEXT_DAY.iter().any(|p| indicator.contains(p)) {
        if let Some(admission) = admission {
            entity.temporal_context.resolved_date = add_days(admission, 1);
            entity.temporal_context.confidence = entity.temporal_context.confidence.max(CONFIDENCE_RELATIVE_PHRASE);
        }
    }
}

/// Soft-links each complication without an explicit cause to the nearest
/// procedure mentioned in the same note, when the two spans fall within
/// [`CAUSAL_ADJACENCY_WINDOW`] characters of each other. This is a
/// heuristic, not an extraction claim: it never invents a procedure name
/// not already present in `data.procedures`.
fn link_complications_to_procedures(data: &mut ExtractedData) {
    let procedures: Vec<(usize, usize, String)> = data
        .procedures
        .iter()
        .filter_map(|p| {
            let span = p.source_spans.first()?;
            let name = match &p.value {
                EntityValue::Procedure(v) => v.name.clone(),
                _ => return None,
            };
            Some((span.note_index, span.start_offset, name))
        })
        .collect();

    for complication in &mut data.complications {
        let EntityValue::Complication(ComplicationValue { linked_procedure, .. }) = &mut complication.value else {
            continue;
        };
        if linked_procedure.is_some() {
            continue;
        }
        let Some(span) = complication.source_spans.first() else { continue };
        let nearest = procedures
            .iter()
            .filter(|(note_index, offset, _)| {
                *note_index == span.note_index && offset.abs_diff(span.start_offset) <= CAUSAL_ADJACENCY_WINDOW
            })
            .min_by_key(|(_, offset, _)| offset.abs_diff(span.start_offset));
        if let Some((_, _, name)) = nearest {
            *linked_procedure = Some(name.clone());
        }
    }
}

fn resolve_offsets(entity: &mut Entity, admission: Option<NaiveDate>, surgery: Option<NaiveDate>) {
    // The indicator carries the text surrounding the match (see
    // `pattern_extractor::context_window` / `llm_extractor`'s equivalent),
    // since a POD/HD marker is often just outside the entity's own matched
    // span (e.g. "POD#3 developed vasospasm" -- the span is "vasospasm").
    let quote = &entity.temporal_context.indicator;

    if let Some(captures) = POD_REGEX.captures(quote) {
        let offset: i64 = captures[1].parse().unwrap_or(0);
        entity.temporal_context.pod_offset = Some(offset);
        if let Some(anchor) = surgery {
            entity.temporal_context.resolved_date = add_days(anchor, offset);
        } else {
            entity.temporal_context.resolution_failed = true;
        }
        return;
    }

    if let Some(captures) = HD_REGEX.captures(quote) {
        let offset: i64 = captures[1].parse().unwrap_or(0);
        if let Some(anchor) = admission {
            entity.temporal_context.resolved_date = add_days(anchor, offset);
        } else {
            entity.temporal_context.resolution_failed = true;
        }
    }
}

fn add_days(anchor: NaiveDate, offset: i64) -> Option<NaiveDate> {
    if offset >= 0 {
        anchor.checked_add_days(Days::new(offset as u64))
    } else {
        anchor.checked_sub_days(Days::new((-offset) as u64))
    }
}
