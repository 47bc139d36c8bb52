//! Core data model for the discharge summary pipeline: `Note`,
//! `SourceQuality`, `Pathology`, `Entity` and its variants,
//! `TemporalContext`, `ExtractedData`, `Narrative`, `QualityReport`, plus
//! the ambient `PipelineResult`/`Telemetry` envelope.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Notes
// ---------------------------------------------------------------------------

/// Classification of a single input note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteType {
    Admission,
    Progress,
    Operative,
    Consult,
    Discharge,
}

/// One immutable input note. Notes are never mutated by the pipeline; every
/// later stage addresses text in a note by `(note_index, start, end)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    /// Raw note text, exactly as supplied by the caller.
    pub text: String,
    /// Author-declared or inferred note type.
    pub note_type: Option<NoteType>,
    /// Timestamp the note was authored, if known.
    pub timestamp: Option<DateTime<Utc>>,
}

impl Note {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            note_type: None,
            timestamp: None,
        }
    }

    pub fn with_type(mut self, note_type: NoteType) -> Self {
        self.note_type = Some(note_type);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

// ---------------------------------------------------------------------------
// Source quality
// ---------------------------------------------------------------------------

/// Coarse grade bucket for [`SourceQuality::overall_score`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceGrade {
    Excellent,
    Good,
    Fair,
    Poor,
    VeryPoor,
}

impl SourceGrade {
    pub fn from_score(score: f64) -> Self {
        match score {
            s if s >= 90.0 => SourceGrade::Excellent,
            s if s >= 75.0 => SourceGrade::Good,
            s if s >= 55.0 => SourceGrade::Fair,
            s if s >= 35.0 => SourceGrade::Poor,
            _ => SourceGrade::VeryPoor,
        }
    }
}

/// A documentation-quality issue observed by the Preprocessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceQualityIssue {
    Structure,
    Completeness,
    Formality,
    Detail,
    Consistency,
}

/// Assessment of the raw note corpus, computed once per extraction by the
/// Preprocessor and consumed by the Hybrid Merger for confidence calibration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceQuality {
    pub overall_score: f64,
    pub grade: SourceGrade,
    pub issues: Vec<SourceQualityIssue>,
}

impl SourceQuality {
    /// Confidence calibration factor in `[0.5, 1.0]` derived from
    /// `overall_score`, used by the Hybrid Merger.
    pub fn calibration_factor(&self) -> f64 {
        0.5 + (self.overall_score.clamp(0.0, 100.0) / 100.0) * 0.5
    }
}

// ---------------------------------------------------------------------------
// Pathology and knowledge packs
// ---------------------------------------------------------------------------

/// The closed set of pathology tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pathology {
    Sah,
    Tumor,
    Spine,
    Tbi,
    Hydrocephalus,
    Csdh,
    CsfLeak,
    Seizures,
    Metastases,
    General,
}

impl Pathology {
    pub fn all() -> &'static [Pathology] {
        &[
            Pathology::Sah,
            Pathology::Tumor,
            Pathology::Spine,
            Pathology::Tbi,
            Pathology::Hydrocephalus,
            Pathology::Csdh,
            Pathology::CsfLeak,
            Pathology::Seizures,
            Pathology::Metastases,
            Pathology::General,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Pathology::Sah => "SAH",
            Pathology::Tumor => "TUMOR",
            Pathology::Spine => "SPINE",
            Pathology::Tbi => "TBI",
            Pathology::Hydrocephalus => "HYDROCEPHALUS",
            Pathology::Csdh => "CSDH",
            Pathology::CsfLeak => "CSF_LEAK",
            Pathology::Seizures => "SEIZURES",
            Pathology::Metastases => "METASTASES",
            Pathology::General => "GENERAL",
        }
    }
}

impl std::fmt::Display for Pathology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of the Context Builder's pathology scoring pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathologyAssignment {
    pub primary: Pathology,
    pub secondary: Vec<Pathology>,
    /// Raw weighted-dictionary scores, primary first, for diagnostics.
    pub scores: HashMap<Pathology, f64>,
}

/// The per-pathology knowledge pack: expected fields, grading scales,
/// common procedures/complications, follow-up conventions, and a
/// narrative template hint.
/// Read-only at startup; adding a pathology means adding a pack, not
/// changing code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgePack {
    pub name: Pathology,
    pub aliases: Vec<String>,
    /// Keyword -> weight dictionary used for pathology detection scoring.
    pub keyword_weights: HashMap<String, f64>,
    pub expected_fields: Vec<String>,
    pub grading_scales: HashMap<String, (f64, f64)>,
    pub common_procedures: Vec<String>,
    pub common_complications: Vec<String>,
    pub follow_up_conventions: Vec<String>,
    pub narrative_template: String,
    /// Canonical spelling map used by the Hybrid Merger for normalization,
    /// e.g. `"evd" -> "external ventricular drain"`.
    pub canonical_spellings: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Source spans and provenance
// ---------------------------------------------------------------------------

/// A pointer into an input note identifying the textual evidence for an
/// extracted entity ("source span").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpan {
    pub note_index: usize,
    pub start_offset: usize,
    pub end_offset: usize,
    pub matched_text: String,
}

impl SourceSpan {
    /// Invariant E1: the span's matched text must be a verifiable substring
    /// of the corresponding note.
    pub fn verify(&self, notes: &[Note]) -> bool {
        notes
            .get(self.note_index)
            .map(|n| n.text.contains(self.matched_text.as_str()))
            .unwrap_or(false)
    }
}

/// How an entity (or entity field) was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    Pattern,
    Llm,
    Merged,
    InferredFromKnowledge,
}

// ---------------------------------------------------------------------------
// Temporal context
// ---------------------------------------------------------------------------

/// Whether a textual mention introduces a new clinical event or merely
/// refers back to one already extracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemporalKind {
    NewEvent,
    Reference,
}

/// Resolved (or flagged-unresolved) temporal placement for an entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemporalContext {
    pub kind: TemporalKind,
    pub confidence: f64,
    /// The textual cue that drove the classification (e.g. `"s/p"`,
    /// `"Procedure:"`, `"underwent"`).
    pub indicator: String,
    pub resolved_date: Option<NaiveDate>,
    pub pod_offset: Option<i64>,
    pub temporal_qualifier: Option<String>,
    /// Set when a date reference could not be resolved against any anchor;
    /// the entity is retained rather than discarded.
    pub resolution_failed: bool,
    /// Explicitly marked pre-admission history, exempting it from
    /// Invariant T1's admission/discharge window check.
    pub pre_admission: bool,
}

impl TemporalContext {
    pub fn new_event(confidence: f64, indicator: impl Into<String>) -> Self {
        Self {
            kind: TemporalKind::NewEvent,
            confidence,
            indicator: indicator.into(),
            resolved_date: None,
            pod_offset: None,
            temporal_qualifier: None,
            resolution_failed: false,
            pre_admission: false,
        }
    }

    pub fn reference(confidence: f64, indicator: impl Into<String>) -> Self {
        Self {
            kind: TemporalKind::Reference,
            confidence,
            indicator: indicator.into(),
            resolved_date: None,
            pod_offset: None,
            temporal_qualifier: None,
            resolution_failed: false,
            pre_admission: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Demographic {
    pub age: Option<u32>,
    pub sex: Option<String>,
    pub mrn: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateRole {
    Admission,
    Surgery,
    Discharge,
    Ictus,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DateValue {
    pub role: DateRole,
    pub date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcedureValue {
    pub name: String,
    pub date: Option<NaiveDate>,
    pub pod_zero: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplicationTiming {
    PreOp,
    PostOp,
    Unspecified,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplicationValue {
    pub name: String,
    pub timing: ComplicationTiming,
    /// Procedure this complication is causally adjacent to, if the Temporal
    /// Engine recorded a soft link.
    pub linked_procedure: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MedicationPhase {
    PreOp,
    PostOp,
    Discharge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MedicationValue {
    pub name: String,
    pub dose: Option<String>,
    pub route: Option<String>,
    pub frequency: Option<String>,
    pub phase: MedicationPhase,
    /// Complication or diagnosis this medication is indicated for, if known
    /// (used by the Validator's cross-field consistency check).
    pub indication: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImagingTiming {
    PreOp,
    PostOp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagingFindingValue {
    pub modality: String,
    pub finding: String,
    pub timing: ImagingTiming,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionalScoreValue {
    pub scale_name: String,
    pub score: f64,
    pub range: (f64, f64),
    /// Whether this value came from a PT/OT note (gold-standard source for
    /// functional status).
    pub from_gold_standard_source: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeuroExamValue {
    pub finding: String,
    /// GCS, pupil exam, motor exam, etc.
    pub exam_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsultationValue {
    pub service: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosisValue {
    pub name: String,
    pub is_principal: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowUpValue {
    pub service: String,
    pub timeframe: Option<String>,
    pub instructions: Option<String>,
}

/// A discriminated record for every fact the pipeline can extract from the
/// notes. Every variant carries the same provenance envelope via
/// [`Entity`]; only the payload differs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum EntityValue {
    Demographic(Demographic),
    Date(DateValue),
    Procedure(ProcedureValue),
    Complication(ComplicationValue),
    Medication(MedicationValue),
    ImagingFinding(ImagingFindingValue),
    FunctionalScore(FunctionalScoreValue),
    NeuroExam(NeuroExamValue),
    Consultation(ConsultationValue),
    Diagnosis(DiagnosisValue),
    FollowUp(FollowUpValue),
}

impl EntityValue {
    /// A stable, category-scoped normalized name used for matching across
    /// sources and for dedup keys (lower-cased, whitespace-collapsed).
    pub fn normalized_name(&self) -> String {
        let raw = match self {
            EntityValue::Demographic(d) => d.mrn.clone().unwrap_or_else(|| "demographics".into()),
            EntityValue::Date(d) => format!("{:?}", d.role),
            EntityValue::Procedure(p) => p.name.clone(),
            EntityValue::Complication(c) => c.name.clone(),
            EntityValue::Medication(m) => m.name.clone(),
            EntityValue::ImagingFinding(i) => format!("{}:{}", i.modality, i.finding),
            EntityValue::FunctionalScore(f) => f.scale_name.clone(),
            EntityValue::NeuroExam(n) => format!("{}:{}", n.exam_type, n.finding),
            EntityValue::Consultation(c) => c.service.clone(),
            EntityValue::Diagnosis(d) => d.name.clone(),
            EntityValue::FollowUp(f) => f.service.clone(),
        };
        raw.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

/// One extracted fact, with its full provenance envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: Uuid,
    pub value: EntityValue,
    pub confidence: f64,
    /// Invariant E1: always non-empty.
    pub source_spans: Vec<SourceSpan>,
    pub method: ExtractionMethod,
    pub temporal_context: TemporalContext,
    pub merge_count: u32,
}

impl Entity {
    pub fn new(
        value: EntityValue,
        confidence: f64,
        source_spans: Vec<SourceSpan>,
        method: ExtractionMethod,
        temporal_context: TemporalContext,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            value,
            confidence: confidence.clamp(0.0, 1.0),
            source_spans,
            method,
            temporal_context,
            merge_count: 1,
        }
    }

    /// Invariant E1: non-empty spans, each verifiable in its note.
    pub fn has_verifiable_evidence(&self, notes: &[Note]) -> bool {
        !self.source_spans.is_empty() && self.source_spans.iter().all(|s| s.verify(notes))
    }

    pub fn category_key(&self) -> &'static str {
        match &self.value {
            EntityValue::Demographic(_) => "demographic",
            EntityValue::Date(_) => "date",
            EntityValue::Procedure(_) => "procedure",
            EntityValue::Complication(_) => "complication",
            EntityValue::Medication(_) => "medication",
            EntityValue::ImagingFinding(_) => "imaging_finding",
            EntityValue::FunctionalScore(_) => "functional_score",
            EntityValue::NeuroExam(_) => "neuro_exam",
            EntityValue::Consultation(_) => "consultation",
            EntityValue::Diagnosis(_) => "diagnosis",
            EntityValue::FollowUp(_) => "follow_up",
        }
    }
}

// ---------------------------------------------------------------------------
// Extracted data (the structured payload)
// ---------------------------------------------------------------------------

/// The structured payload grouping entities by category. Created by the
/// Hybrid Merger, mutated only by the Temporal Engine, Deduplicator, and
/// refinement loop, and frozen before narrative generation.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExtractedData {
    pub demographics: Option<Entity>,
    pub dates: Vec<Entity>,
    pub pathology: Option<PathologyAssignment>,
    pub procedures: Vec<Entity>,
    pub complications: Vec<Entity>,
    pub medications: Vec<Entity>,
    pub imaging: Vec<Entity>,
    pub consultations: Vec<Entity>,
    pub follow_up: Vec<Entity>,
    pub functional_scores: Vec<Entity>,
    pub neuro_exams: Vec<Entity>,
    pub diagnoses: Vec<Entity>,
    pub labs: Vec<Entity>,
}

impl ExtractedData {
    /// All entities across every category, for passes that operate
    /// uniformly (Validator, Deduplicator, Quality Scorer).
    pub fn all_entities(&self) -> Vec<&Entity> {
        let mut out: Vec<&Entity> = Vec::new();
        out.extend(self.demographics.iter());
        out.extend(self.dates.iter());
        out.extend(self.procedures.iter());
        out.extend(self.complications.iter());
        out.extend(self.medications.iter());
        out.extend(self.imaging.iter());
        out.extend(self.consultations.iter());
        out.extend(self.follow_up.iter());
        out.extend(self.functional_scores.iter());
        out.extend(self.neuro_exams.iter());
        out.extend(self.diagnoses.iter());
        out.extend(self.labs.iter());
        out
    }

    pub fn all_entities_mut(&mut self) -> Vec<&mut Entity> {
        let mut out: Vec<&mut Entity> = Vec::new();
        out.extend(self.demographics.iter_mut());
        out.extend(self.dates.iter_mut());
        out.extend(self.procedures.iter_mut());
        out.extend(self.complications.iter_mut());
        out.extend(self.medications.iter_mut());
        out.extend(self.imaging.iter_mut());
        out.extend(self.consultations.iter_mut());
        out.extend(self.follow_up.iter_mut());
        out.extend(self.functional_scores.iter_mut());
        out.extend(self.neuro_exams.iter_mut());
        out.extend(self.diagnoses.iter_mut());
        out.extend(self.labs.iter_mut());
        out
    }

    pub fn date_by_role(&self, role: DateRole) -> Option<NaiveDate> {
        self.dates.iter().find_map(|e| match &e.value {
            EntityValue::Date(d) if d.role == role => d.date,
            _ => None,
        })
    }
}

// ---------------------------------------------------------------------------
// Narrative
// ---------------------------------------------------------------------------

/// The closed set of narrative sections, in display order.
pub const SECTION_ORDER: &[&str] = &[
    "demographics",
    "principal_diagnosis",
    "secondary_diagnoses",
    "chief_complaint",
    "history_of_present_illness",
    "hospital_course",
    "procedures",
    "complications",
    "consultations",
    "discharge_status",
    "discharge_medications",
    "discharge_disposition",
    "follow_up_plan",
];

/// The subset of sections that P4 requires to always be present.
pub const CRITICAL_SECTIONS: &[&str] = &[
    "demographics",
    "principal_diagnosis",
    "hospital_course",
    "procedures",
    "discharge_medications",
    "discharge_disposition",
    "follow_up_plan",
];

/// Where a section's prose came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionOrigin {
    Llm,
    Template,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NarrativeSection {
    pub text: String,
    pub origin: SectionOrigin,
}

/// A mapping from section name (§4.9's closed set) to generated prose.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Narrative {
    pub sections: HashMap<String, NarrativeSection>,
}

impl Narrative {
    pub fn set(&mut self, name: &str, text: String, origin: SectionOrigin) {
        self.sections
            .insert(name.to_string(), NarrativeSection { text, origin });
    }

    pub fn get(&self, name: &str) -> Option<&NarrativeSection> {
        self.sections.get(name)
    }

    /// P4: narrative keys are a subset of the closed section set.
    pub fn keys_are_closed(&self) -> bool {
        self.sections.keys().all(|k| SECTION_ORDER.contains(&k.as_str()))
    }

    /// P4: every critical section is present and non-empty.
    pub fn has_all_critical_sections(&self) -> bool {
        CRITICAL_SECTIONS.iter().all(|name| {
            self.sections
                .get(*name)
                .map(|s| !s.text.trim().is_empty())
                .unwrap_or(false)
        })
    }
}

// ---------------------------------------------------------------------------
// Quality report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Critical,
    Major,
    Minor,
    Info,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub severity: IssueSeverity,
    pub message: String,
    /// Category/field this issue concerns, used by the Refinement Planner
    /// to build a focused re-extraction plan.
    pub field: Option<String>,
}

/// Per-dimension weights for [`QualityReport::overall`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QualityWeights {
    pub completeness: f64,
    pub accuracy: f64,
    pub consistency: f64,
    pub narrative_quality: f64,
    pub specificity: f64,
    pub timeliness: f64,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            completeness: 0.30,
            accuracy: 0.25,
            consistency: 0.20,
            narrative_quality: 0.15,
            specificity: 0.05,
            timeliness: 0.05,
        }
    }
}

/// Six-dimension quality score plus an issue list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityReport {
    pub completeness: f64,
    pub accuracy: f64,
    pub consistency: f64,
    pub narrative_quality: f64,
    pub specificity: f64,
    pub timeliness: f64,
    pub overall: f64,
    pub issues: Vec<ValidationIssue>,
}

impl QualityReport {
    pub fn compute_overall(
        completeness: f64,
        accuracy: f64,
        consistency: f64,
        narrative_quality: f64,
        specificity: f64,
        timeliness: f64,
        weights: QualityWeights,
    ) -> f64 {
        completeness * weights.completeness
            + accuracy * weights.accuracy
            + consistency * weights.consistency
            + narrative_quality * weights.narrative_quality
            + specificity * weights.specificity
            + timeliness * weights.timeliness
    }
}

// ---------------------------------------------------------------------------
// Options, telemetry, and the pipeline result envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NarrativeStyle {
    Formal,
    Concise,
    Detailed,
}

/// Options accepted by [`crate::orchestrator::generate_discharge_summary`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineOptions {
    pub pathology_hint: Option<Pathology>,
    pub style: NarrativeStyle,
    pub use_llm: bool,
    pub quality_target: f64,
    pub max_refinement_iterations: u32,
    pub deadline_ms: u64,
    pub provider_order: Vec<String>,
    pub strict_validation: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            pathology_hint: None,
            style: NarrativeStyle::Formal,
            use_llm: true,
            quality_target: 90.0,
            max_refinement_iterations: 2,
            deadline_ms: 60_000,
            provider_order: Vec::new(),
            strict_validation: true,
        }
    }
}

/// Edge cases the Orchestrator classifies before running the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeCaseFlag {
    VeryShortInput { chars: usize },
    VeryLongInput { chars: usize, chunks: usize },
    NoPathologyDetected,
    MultipleAdmissions { count: usize },
    UnusualPathology { detected: String },
}

/// One recorded attempt through the LLM Gateway, forming the attempt
/// chain surfaced in telemetry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmAttempt {
    pub provider: String,
    pub task: String,
    pub succeeded: bool,
    pub reason: Option<String>,
}

/// Telemetry returned alongside every [`PipelineResult`].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Telemetry {
    #[serde(with = "duration_map")]
    pub stage_timings: HashMap<String, Duration>,
    pub llm_attempts: Vec<LlmAttempt>,
    pub cost_cents: f64,
    pub edge_case_flags: Vec<EdgeCaseFlag>,
    pub warnings: Vec<String>,
}

mod duration_map {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        map: &HashMap<String, Duration>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        let as_millis: HashMap<&String, u128> =
            map.iter().map(|(k, v)| (k, v.as_millis())).collect();
        as_millis.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<HashMap<String, Duration>, D::Error> {
        let as_millis: HashMap<String, u64> = HashMap::deserialize(deserializer)?;
        Ok(as_millis
            .into_iter()
            .map(|(k, v)| (k, Duration::from_millis(v)))
            .collect())
    }
}

/// The full result of [`crate::orchestrator::generate_discharge_summary`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub extracted_data: ExtractedData,
    pub narrative: Narrative,
    pub quality_report: QualityReport,
    pub telemetry: Telemetry,
}

/// A correction a clinician applies to a generated [`PipelineResult`]:
/// an entity's value was wrong, a narrative section needed rewriting, or
/// a whole section was rejected outright.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Correction {
    EntityValueCorrected { category: String, corrected: EntityValue },
    NarrativeSectionRewritten { section: String, text: String },
    SectionRejected { section: String },
}

/// Stateless collaborator hook: the pipeline core never persists
/// corrections itself. A collaborator implements this to feed them back
/// into a knowledge pack, a training set, or an audit log. The default
/// no-op implementation on `()` lets callers who don't care about
/// corrections pass it in without writing a stub.
pub trait CorrectionSink {
    fn record(&self, correction: Correction);
}

impl CorrectionSink for () {
    fn record(&self, _correction: Correction) {}
}
