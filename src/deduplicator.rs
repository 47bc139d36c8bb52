//! Deduplicator: collapses duplicate entities produced by overlapping
//! notes (the same procedure documented in both the operative note and a
//! progress note) while preserving genuine progression (vasospasm on POD 2
//! vs. worsening vasospasm on POD 5 are kept distinct). Reference-kind
//! entities (an "s/p X" mention referring back to an already-documented
//! event) are attached to the new-event entity they refer to rather than
//! surviving as their own entity.
//!
//! Tracks a before/after count plus a content-hash identity key per entity,
//! the same reduction-bookkeeping shape used for file content hashes
//! elsewhere in this codebase, applied here to entity identity instead.

use crate::types::{Entity, EntityValue, ExtractedData, TemporalKind};
use sha2::{Digest, Sha256};
use tracing::info;

/// Summary of what the dedup pass collapsed, surfaced in telemetry.
#[derive(Debug, Clone, Default)]
pub struct DedupSummary {
    pub entities_before: usize,
    pub entities_after: usize,
    pub duplicates_collapsed: usize,
}

impl DedupSummary {
    pub fn reduction_percent(&self) -> f64 {
        if self.entities_before == 0 {
            return 0.0;
        }
        (self.duplicates_collapsed as f64 / self.entities_before as f64) * 100.0
    }
}

/// Runs structural dedup (identical normalized name + identical temporal
/// anchor) then semantic dedup (near-identical spans after normalization)
/// across every category in `data`. Progression is preserved: two
/// mentions of the same complication name are only merged when their
/// resolved dates (or POD offsets) match or are both absent.
pub fn deduplicate(data: &mut ExtractedData) -> DedupSummary {
    let before = data.all_entities().len();

    data.procedures = dedup_category(std::mem::take(&mut data.procedures));
    data.complications = dedup_category(std::mem::take(&mut data.complications));
    data.medications = dedup_category(std::mem::take(&mut data.medications));
    data.imaging = dedup_category(std::mem::take(&mut data.imaging));
    data.consultations = dedup_category(std::mem::take(&mut data.consultations));
    data.follow_up = dedup_category(std::mem::take(&mut data.follow_up));
    data.functional_scores = dedup_category(std::mem::take(&mut data.functional_scores));
    data.labs = dedup_category(std::mem::take(&mut data.labs));
    data.dates = dedup_dates(std::mem::take(&mut data.dates));

    let after = data.all_entities().len();
    let summary = DedupSummary {
        entities_before: before,
        entities_after: after,
        duplicates_collapsed: before.saturating_sub(after),
    };
    info!(
        before,
        after,
        collapsed = summary.duplicates_collapsed,
        "deduplication complete"
    );
    summary
}

fn identity_key(entity: &Entity) -> String {
    let mut hasher = Sha256::new();
    hasher.update(entity.category_key().as_bytes());
    hasher.update(entity.value.normalized_name().as_bytes());
    hasher.update(progression_marker(entity).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// The part of an entity's temporal placement that distinguishes a
/// genuinely new occurrence from a repeat mention of the same occurrence.
/// Two entities with the same name but different progression markers are
/// NOT merged. Only reached for `Reference`-kind entities that
/// `attach_reference` couldn't fold into an existing new-event (no match
/// kept yet), in which case they still dedup among themselves by name.
fn progression_marker(entity: &Entity) -> String {
    match (&entity.temporal_context.kind, entity.temporal_context.pod_offset, entity.temporal_context.resolved_date) {
        (TemporalKind::Reference, _, _) => "reference".to_string(),
        (_, Some(pod), _) => format!("pod:{pod}"),
        (_, None, Some(date)) => format!("date:{date}"),
        _ => "unanchored".to_string(),
    }
}

fn dedup_category(entities: Vec<Entity>) -> Vec<Entity> {
    let mut kept: Vec<Entity> = Vec::new();
    let mut keys: Vec<String> = Vec::new();

    for entity in entities {
        let entity = if entity.temporal_context.kind == TemporalKind::Reference {
            match attach_reference(&mut kept, entity) {
                None => continue,
                Some(unattached) => unattached,
            }
        } else {
            entity
        };

        let key = identity_key(&entity);
        if let Some(position) = keys.iter().position(|k| *k == key) {
            merge_duplicate(&mut kept[position], entity);
        } else {
            keys.push(key);
            kept.push(entity);
        }
    }
    kept
}

/// Folds a reference-kind entity into the new-event entity it refers back
/// to, by normalized-name containment within the same category, bumping
/// `merge_count`/source spans rather than minting a second, separate
/// entity. Returns the entity back (unconsumed) if no matching new-event
/// has been kept yet, so the caller falls back to identity-key bucketing --
/// a reference that precedes its event in note order still ends up as one
/// entity per distinct name rather than `n` separate ones.
fn attach_reference(kept: &mut [Entity], reference: Entity) -> Option<Entity> {
    let reference_name = reference.value.normalized_name();
    let existing = kept.iter_mut().find(|e| {
        e.temporal_context.kind == TemporalKind::NewEvent
            && names_refer_to_same_event(&e.value.normalized_name(), &reference_name)
    });
    match existing {
        Some(existing) => {
            merge_duplicate(existing, reference);
            None
        }
        None => Some(reference),
    }
}

fn names_refer_to_same_event(new_event_name: &str, reference_name: &str) -> bool {
    new_event_name == reference_name
        || new_event_name.contains(reference_name)
        || reference_name.contains(new_event_name)
}

/// Unlike dates-by-category, admission/surgery/discharge dates are unique
/// by role regardless of exact text; keep one entity per role and merge
/// the rest as corroborating evidence. Admission is the one role where a
/// patient can genuinely have multiple documented hospitalizations in the
/// same note set, so the latest resolved date wins there instead of the
/// highest-confidence entity -- a transfer summary's later admission date
/// outranks an earlier one even if the earlier mention had cleaner
/// labeling, since the narrative covers the most recent stay.
fn dedup_dates(entities: Vec<Entity>) -> Vec<Entity> {
    let mut kept: Vec<Entity> = Vec::new();
    for entity in entities {
        let role = match &entity.value {
            EntityValue::Date(d) => d.role,
            _ => unreachable!("dedup_dates only receives Date entities"),
        };
        if let Some(existing) = kept.iter_mut().find(|e| matches!(&e.value, EntityValue::Date(d) if d.role == role)) {
            let incoming_wins = if role == crate::types::DateRole::Admission {
                match (date_of(existing), date_of(&entity)) {
                    (Some(existing_date), Some(new_date)) => new_date > existing_date,
                    (None, Some(_)) => true,
                    _ => entity.confidence > existing.confidence,
                }
            } else {
                entity.confidence > existing.confidence
            };

            if incoming_wins {
                let mut spans = existing.source_spans.clone();
                spans.extend(entity.source_spans.clone());
                let merge_count = existing.merge_count + entity.merge_count;
                *existing = entity;
                existing.source_spans = spans;
                existing.merge_count = merge_count;
            } else {
                existing.source_spans.extend(entity.source_spans);
                existing.merge_count += entity.merge_count;
            }
        } else {
            kept.push(entity);
        }
    }
    kept
}

fn date_of(entity: &Entity) -> Option<chrono::NaiveDate> {
    match &entity.value {
        EntityValue::Date(d) => d.date,
        _ => None,
    }
}

fn merge_duplicate(existing: &mut Entity, incoming: Entity) {
    existing.source_spans.extend(incoming.source_spans);
    existing.merge_count += incoming.merge_count;
    if incoming.confidence > existing.confidence {
        existing.confidence = incoming.confidence;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        ComplicationTiming, ComplicationValue, ExtractionMethod, ProcedureValue, SourceSpan,
        TemporalContext,
    };

    fn entity(name: &str, pod: Option<i64>) -> Entity {
        let mut e = Entity::new(
            EntityValue::Complication(ComplicationValue { name: name.into(), timing: ComplicationTiming::Unspecified, linked_procedure: None }),
            0.8,
            vec![SourceSpan { note_index: 0, start_offset: 0, end_offset: name.len(), matched_text: name.into() }],
            ExtractionMethod::Pattern,
            TemporalContext::new_event(0.8, "complication keyword"),
        );
        e.temporal_context.pod_offset = pod;
        e
    }

    #[test]
    fn identical_complication_same_pod_collapses() {
        let mut data = ExtractedData::default();
        data.complications = vec![entity("vasospasm", Some(3)), entity("vasospasm", Some(3))];
        let summary = deduplicate(&mut data);
        assert_eq!(data.complications.len(), 1);
        assert_eq!(summary.duplicates_collapsed, 1);
        assert_eq!(data.complications[0].merge_count, 2);
    }

    #[test]
    fn same_complication_different_pod_is_progression_not_duplicate() {
        let mut data = ExtractedData::default();
        data.complications = vec![entity("vasospasm", Some(2)), entity("vasospasm", Some(5))];
        deduplicate(&mut data);
        assert_eq!(data.complications.len(), 2);
    }

    #[test]
    fn reference_mention_attaches_to_existing_new_event_instead_of_duplicating() {
        let mut new_event = Entity::new(
            EntityValue::Procedure(ProcedureValue { name: "underwent coiling 10/12".into(), date: None, pod_zero: false }),
            0.90,
            vec![SourceSpan { note_index: 0, start_offset: 0, end_offset: 1, matched_text: "x".into() }],
            ExtractionMethod::Pattern,
            TemporalContext::new_event(0.90, "underwent coiling 10/12"),
        );
        new_event.temporal_context.kind = crate::types::TemporalKind::NewEvent;

        let reference_one = Entity::new(
            EntityValue::Procedure(ProcedureValue { name: "coiling".into(), date: None, pod_zero: false }),
            0.75,
            vec![SourceSpan { note_index: 1, start_offset: 0, end_offset: 1, matched_text: "y".into() }],
            ExtractionMethod::Pattern,
            TemporalContext::reference(0.75, "s/p coiling"),
        );
        let reference_two = Entity::new(
            EntityValue::Procedure(ProcedureValue { name: "coiling".into(), date: None, pod_zero: false }),
            0.75,
            vec![SourceSpan { note_index: 2, start_offset: 0, end_offset: 1, matched_text: "z".into() }],
            ExtractionMethod::Pattern,
            TemporalContext::reference(0.75, "s/p coiling"),
        );

        let mut data = ExtractedData::default();
        data.procedures = vec![new_event, reference_one, reference_two];
        deduplicate(&mut data);

        assert_eq!(data.procedures.len(), 1);
        assert_eq!(data.procedures[0].merge_count, 3);
    }

    #[test]
    fn procedure_dedup_keeps_distinct_names() {
        let mut data = ExtractedData::default();
        data.procedures = vec![
            Entity::new(
                EntityValue::Procedure(ProcedureValue { name: "craniotomy".into(), date: None, pod_zero: false }),
                0.8,
                vec![SourceSpan { note_index: 0, start_offset: 0, end_offset: 1, matched_text: "c".into() }],
                ExtractionMethod::Pattern,
                TemporalContext::new_event(0.8, "procedure label"),
            ),
            Entity::new(
                EntityValue::Procedure(ProcedureValue { name: "laminectomy".into(), date: None, pod_zero: false }),
                0.8,
                vec![SourceSpan { note_index: 0, start_offset: 0, end_offset: 1, matched_text: "l".into() }],
                ExtractionMethod::Pattern,
                TemporalContext::new_event(0.8, "procedure label"),
            ),
        ];
        deduplicate(&mut data);
        assert_eq!(data.procedures.len(), 2);
    }

    #[test]
    fn multiple_admissions_keep_the_latest_date() {
        use crate::types::{DateRole, DateValue};
        let earlier = Entity::new(
            EntityValue::Date(DateValue { role: DateRole::Admission, date: chrono::NaiveDate::from_ymd_opt(2024, 1, 2) }),
            0.95,
            vec![SourceSpan { note_index: 0, start_offset: 0, end_offset: 1, matched_text: "x".into() }],
            ExtractionMethod::Pattern,
            TemporalContext::new_event(0.95, "admission date"),
        );
        let later = Entity::new(
            EntityValue::Date(DateValue { role: DateRole::Admission, date: chrono::NaiveDate::from_ymd_opt(2024, 3, 15) }),
            0.70,
            vec![SourceSpan { note_index: 1, start_offset: 0, end_offset: 1, matched_text: "y".into() }],
            ExtractionMethod::Pattern,
            TemporalContext::new_event(0.70, "admission date"),
        );
        let kept = dedup_dates(vec![earlier, later]);
        assert_eq!(kept.len(), 1);
        assert_eq!(date_of(&kept[0]), chrono::NaiveDate::from_ymd_opt(2024, 3, 15));
        assert_eq!(kept[0].merge_count, 2);
    }

    #[test]
    fn reduction_percent_computes_correctly() {
        let summary = DedupSummary { entities_before: 10, entities_after: 7, duplicates_collapsed: 3 };
        assert_eq!(summary.reduction_percent(), 30.0);
    }
}
