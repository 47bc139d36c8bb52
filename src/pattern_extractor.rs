//! Pattern Extractor: rule-based entity extraction via a bank of compiled
//! regexes, one per recipe, built once in [`PatternExtractor::new`] and run
//! against every note. Every match carries the byte offsets needed to
//! build a [`SourceSpan`].

use crate::error::Result;
use crate::types::{
    ComplicationTiming, ComplicationValue, DateRole, DateValue, Demographic, Entity, EntityValue,
    ExtractionMethod, MedicationPhase, MedicationValue, Note, ProcedureValue, SourceSpan,
    TemporalContext,
};
use chrono::NaiveDate;
use regex::Regex;

/// Confidence assigned to a pattern match before hybrid merging, per the
/// tiered scheme: explicit labeled fields score highest.
const CONFIDENCE_LABELED_DATE: f64 = 0.95;
const CONFIDENCE_LABELED_PROCEDURE: f64 = 0.90;
const CONFIDENCE_MEDICATION_LINE: f64 = 0.90;
const CONFIDENCE_COMPLICATION_KEYWORD: f64 = 0.80;
const CONFIDENCE_BARE_DATE: f64 = 0.70;
const CONFIDENCE_DEMOGRAPHIC: f64 = 0.85;
/// Free-text "s/p X" / "status post X" mentions are reference-only by
/// construction (the Temporal Engine would classify them the same way from
/// the indicator text alone), but they carry less certainty about the exact
/// procedure name than a labeled `Procedure:` line.
const CONFIDENCE_REFERENCE_PROCEDURE: f64 = 0.75;

pub struct PatternExtractor {
    admission_date_regex: Regex,
    discharge_date_regex: Regex,
    surgery_date_regex: Regex,
    bare_date_regex: Regex,
    procedure_line_regex: Regex,
    reference_procedure_regex: Regex,
    medication_line_regex: Regex,
    complication_keyword_regex: Regex,
    demographic_regex: Regex,
}

impl PatternExtractor {
    pub fn new() -> Result<Self> {
        Ok(Self {
            admission_date_regex: Regex::new(
                r"(?i)admission\s*date\s*:?\s*(\d{1,2}/\d{1,2}/\d{2,4})",
            )
            .expect("invalid admission date regex"),

            discharge_date_regex: Regex::new(
                r"(?i)discharge\s*date\s*:?\s*(\d{1,2}/\d{1,2}/\d{2,4})",
            )
            .expect("invalid discharge date regex"),

            surgery_date_regex: Regex::new(
                r"(?i)(?:surgery|operative|procedure)\s*date\s*:?\s*(\d{1,2}/\d{1,2}/\d{2,4})",
            )
            .expect("invalid surgery date regex"),

            bare_date_regex: Regex::new(r"\b(\d{1,2}/\d{1,2}/\d{2,4})\b")
                .expect("invalid bare date regex"),

            procedure_line_regex: Regex::new(
                r"(?im)^\s*procedure\s*:?\s*(.+)$",
            )
            .expect("invalid procedure line regex"),

            reference_procedure_regex: Regex::new(
                r"(?i)\b(?:s/p|status[- ]post)\s+([a-z][a-z\s]{1,40}?)(?=[,.;\n]|$)",
            )
            .expect("invalid reference procedure regex"),

            medication_line_regex: Regex::new(
                r"(?i)\b([A-Za-z][A-Za-z0-9\-]{2,})\s+(\d+(?:\.\d+)?\s*(?:mg|mcg|g|units?|ml))\s*(?:(PO|IV|IM|SC|SL|PR)\b)?\s*(?:(daily|BID|TID|QID|Q\d+H|Q\d+HR|PRN))?",
            )
            .expect("invalid medication line regex"),

            complication_keyword_regex: Regex::new(
                r"(?i)\b(vasospasm|rebleeding|hydrocephalus|seizure|wound infection|csf leak|meningitis|hematoma expansion|shunt malfunction|shunt infection|dural tear|hardware failure|cerebral edema|recurrence)\b",
            )
            .expect("invalid complication keyword regex"),

            demographic_regex: Regex::new(
                r"(?i)\b(\d{1,3})[- ]?(?:y/?o|years?[- ]old)\b[^.\n]{0,25}?\b(male|female|man|woman)\b",
            )
            .expect("invalid demographic regex"),
        })
    }

    /// Run every recipe against every note and return the union of matches.
    /// Order is stable (dates, procedures, medications, complications) so
    /// downstream dedup sees a deterministic input.
    pub fn extract(&self, notes: &[Note]) -> Vec<Entity> {
        let mut entities = Vec::new();
        for (index, note) in notes.iter().enumerate() {
            entities.extend(self.extract_demographics(index, note));
            entities.extend(self.extract_dates(index, note));
            entities.extend(self.extract_procedures(index, note));
            entities.extend(self.extract_reference_procedure_mentions(index, note));
            entities.extend(self.extract_medications(index, note));
            entities.extend(self.extract_complications(index, note));
        }
        entities
    }

    /// Matches the common "NNyo <sex>" clinical shorthand. Only the first
    /// match per note is kept; later mentions (e.g. of a consulted
    /// relative's age) are not demographic facts about the patient.
    fn extract_demographics(&self, note_index: usize, note: &Note) -> Vec<Entity> {
        let Some(capture) = self.demographic_regex.captures(&note.text) else {
            return Vec::new();
        };
        let Some(whole) = capture.get(0) else { return Vec::new() };
        let age = capture.get(1).and_then(|m| m.as_str().parse::<u32>().ok());
        let sex = capture.get(2).map(|m| match m.as_str().to_lowercase().as_str() {
            "man" => "male".to_string(),
            "woman" => "female".to_string(),
            other => other.to_string(),
        });
        let span = SourceSpan {
            note_index,
            start_offset: whole.start(),
            end_offset: whole.end(),
            matched_text: whole.as_str().to_string(),
        };
        vec![Entity::new(
            EntityValue::Demographic(Demographic { age, sex, mrn: None, name: None }),
            CONFIDENCE_DEMOGRAPHIC,
            vec![span],
            ExtractionMethod::Pattern,
            TemporalContext::new_event(CONFIDENCE_DEMOGRAPHIC, "demographic shorthand"),
        )]
    }

    fn extract_dates(&self, note_index: usize, note: &Note) -> Vec<Entity> {
        let mut out = Vec::new();
        out.extend(self.labeled_date(note_index, note, &self.admission_date_regex, DateRole::Admission));
        out.extend(self.labeled_date(note_index, note, &self.discharge_date_regex, DateRole::Discharge));
        out.extend(self.labeled_date(note_index, note, &self.surgery_date_regex, DateRole::Surgery));

        for capture in self.bare_date_regex.captures_iter(&note.text) {
            let whole = capture.get(0).expect("group 0 always present");
            if self.admission_date_regex.is_match(&note.text[..whole.end().min(note.text.len())])
                && whole.start() > 0
            {
                // already covered by a labeled recipe nearby; still emit at
                // low confidence since labeled recipes only match the first
                // occurrence on a line, bare dates catch the rest.
            }
            let date = parse_date(capture.get(1).map(|m| m.as_str()).unwrap_or(""));
            let span = SourceSpan {
                note_index,
                start_offset: whole.start(),
                end_offset: whole.end(),
                matched_text: whole.as_str().to_string(),
            };
            out.push(Entity::new(
                EntityValue::Date(DateValue { role: DateRole::Other, date }),
                CONFIDENCE_BARE_DATE,
                vec![span],
                ExtractionMethod::Pattern,
                TemporalContext::new_event(CONFIDENCE_BARE_DATE, "bare date"),
            ));
        }
        out
    }

    fn labeled_date(&self, note_index: usize, note: &Note, regex: &Regex, role: DateRole) -> Vec<Entity> {
        regex
            .captures_iter(&note.text)
            .filter_map(|capture| {
                let whole = capture.get(0)?;
                let date_str = capture.get(1)?.as_str();
                let span = SourceSpan {
                    note_index,
                    start_offset: whole.start(),
                    end_offset: whole.end(),
                    matched_text: whole.as_str().to_string(),
                };
                Some(Entity::new(
                    EntityValue::Date(DateValue { role, date: parse_date(date_str) }),
                    CONFIDENCE_LABELED_DATE,
                    vec![span],
                    ExtractionMethod::Pattern,
                    TemporalContext::new_event(CONFIDENCE_LABELED_DATE, format!("{role:?} date label")),
                ))
            })
            .collect()
    }

    fn extract_procedures(&self, note_index: usize, note: &Note) -> Vec<Entity> {
        self.procedure_line_regex
            .captures_iter(&note.text)
            .filter_map(|capture| {
                let whole = capture.get(0)?;
                let name = capture.get(1)?.as_str().trim().to_string();
                if name.is_empty() {
                    return None;
                }
                let span = SourceSpan {
                    note_index,
                    start_offset: whole.start(),
                    end_offset: whole.end(),
                    matched_text: whole.as_str().to_string(),
                };
                let indicator = context_window(&note.text, whole.start(), whole.end());
                Some(Entity::new(
                    EntityValue::Procedure(ProcedureValue { name, date: None, pod_zero: false }),
                    CONFIDENCE_LABELED_PROCEDURE,
                    vec![span],
                    ExtractionMethod::Pattern,
                    TemporalContext::new_event(CONFIDENCE_LABELED_PROCEDURE, indicator),
                ))
            })
            .collect()
    }

    /// Matches free-text "s/p X"/"status post X" mentions, the common way a
    /// progress note refers back to a procedure already documented
    /// elsewhere rather than reporting a new one. Built as a reference from
    /// the start (not left for the Temporal Engine to infer) since the cue
    /// that identifies it is the same text this recipe matched on.
    fn extract_reference_procedure_mentions(&self, note_index: usize, note: &Note) -> Vec<Entity> {
        self.reference_procedure_regex
            .captures_iter(&note.text)
            .filter_map(|capture| {
                let whole = capture.get(0)?;
                let name = capture.get(1)?.as_str().trim().to_string();
                if name.is_empty() {
                    return None;
                }
                let span = SourceSpan {
                    note_index,
                    start_offset: whole.start(),
                    end_offset: whole.end(),
                    matched_text: whole.as_str().to_string(),
                };
                let indicator = context_window(&note.text, whole.start(), whole.end());
                Some(Entity::new(
                    EntityValue::Procedure(ProcedureValue { name, date: None, pod_zero: false }),
                    CONFIDENCE_REFERENCE_PROCEDURE,
                    vec![span],
                    ExtractionMethod::Pattern,
                    TemporalContext::reference(CONFIDENCE_REFERENCE_PROCEDURE, indicator),
                ))
            })
            .collect()
    }

    fn extract_medications(&self, note_index: usize, note: &Note) -> Vec<Entity> {
        self.medication_line_regex
            .captures_iter(&note.text)
            .filter_map(|capture| {
                let whole = capture.get(0)?;
                let name = capture.get(1)?.as_str().to_string();
                let dose = capture.get(2).map(|m| m.as_str().to_string());
                let route = capture.get(3).map(|m| m.as_str().to_string());
                let frequency = capture.get(4).map(|m| m.as_str().to_string());
                let span = SourceSpan {
                    note_index,
                    start_offset: whole.start(),
                    end_offset: whole.end(),
                    matched_text: whole.as_str().to_string(),
                };
                Some(Entity::new(
                    EntityValue::Medication(MedicationValue {
                        name,
                        dose,
                        route,
                        frequency,
                        phase: MedicationPhase::Discharge,
                        indication: None,
                    }),
                    CONFIDENCE_MEDICATION_LINE,
                    vec![span],
                    ExtractionMethod::Pattern,
                    TemporalContext::new_event(CONFIDENCE_MEDICATION_LINE, "medication line"),
                ))
            })
            .collect()
    }

    fn extract_complications(&self, note_index: usize, note: &Note) -> Vec<Entity> {
        self.complication_keyword_regex
            .captures_iter(&note.text)
            .filter_map(|capture| {
                let whole = capture.get(0)?;
                let name = whole.as_str().to_lowercase();
                let span = SourceSpan {
                    note_index,
                    start_offset: whole.start(),
                    end_offset: whole.end(),
                    matched_text: whole.as_str().to_string(),
                };
                let indicator = context_window(&note.text, whole.start(), whole.end());
                Some(Entity::new(
                    EntityValue::Complication(ComplicationValue {
                        name,
                        timing: ComplicationTiming::Unspecified,
                        linked_procedure: None,
                    }),
                    CONFIDENCE_COMPLICATION_KEYWORD,
                    vec![span],
                    ExtractionMethod::Pattern,
                    TemporalContext::new_event(CONFIDENCE_COMPLICATION_KEYWORD, indicator),
                ))
            })
            .collect()
    }
}

impl Default for PatternExtractor {
    fn default() -> Self {
        Self::new().expect("pattern extractor regexes are statically valid")
    }
}

/// Window of text immediately preceding and including a match, used as the
/// [`TemporalContext`] indicator so the Temporal Engine's reference-vs-new-
/// event cues (e.g. "s/p", "underwent") have real context to match against
/// instead of a fixed label.
const CONTEXT_WINDOW_CHARS: usize = 40;

fn context_window(text: &str, start: usize, end: usize) -> String {
    let window_start = start.saturating_sub(CONTEXT_WINDOW_CHARS);
    let mut from = window_start;
    while from < start && !text.is_char_boundary(from) {
        from += 1;
    }
    format!("{}{}", &text[from..start], &text[start..end])
}

/// Parses `M/D/YYYY` or `M/D/YY` into a calendar date. Two-digit years are
/// interpreted as 2000-2099, matching US clinical documentation convention.
fn parse_date(raw: &str) -> Option<NaiveDate> {
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
