//! Narrative Generator: produces prose for each closed narrative section,
//! preferring an LLM call per section and falling back to a deterministic
//! template built from [`ExtractedData`] and the pathology's
//! [`KnowledgePack`] when the LLM is unavailable or its output fails
//! validation.

use crate::cost_tracker::CostTracker;
use crate::knowledge::KnowledgeRegistry;
use crate::llm_gateway::{LlmGateway, LlmTask};
use crate::types::{
    DateRole, EntityValue, ExtractedData, Narrative, NarrativeStyle, Pathology, SectionOrigin,
    CRITICAL_SECTIONS, SECTION_ORDER,
};
use tracing::{debug, warn};

/// A section draft is retried once with a stricter prompt before falling
/// back to the template, since a second LLM attempt with an explicit
/// complaint about the first attempt's defect recovers more often than an
/// immediate template fallback does.
const SECTION_RETRY_BUDGET: usize = 1;

/// Generates every section in [`SECTION_ORDER`], LLM-primary with a
/// template fallback per section (never both per section, and never a
/// section left empty for a critical section). Each accepted section is
/// style-enforced (abbreviation expansion via the pathology's knowledge
/// pack) and fed forward so later sections avoid restating it verbatim.
pub async fn generate(
    data: &ExtractedData,
    pathology: Pathology,
    registry: &KnowledgeRegistry,
    style: NarrativeStyle,
    gateway: &LlmGateway,
    cost_tracker: &CostTracker,
) -> Narrative {
    let mut narrative = Narrative::default();
    let pack = registry.get(pathology);
    let mut prior_sections: Vec<(&str, String)> = Vec::new();

    for section in SECTION_ORDER {
        let template_text = render_template(section, data, pathology, pack, style);

        if gateway.has_providers() && cost_tracker.remaining_cents() > 0.0 {
            let system_prompt = format!(
                "You are writing the '{section}' section of a neurosurgical discharge summary in a \
                 {style:?} style. Use only the facts given; do not invent any detail not present in the \
                 supplied structured data. Respond with plain prose, no headers, no markdown."
            );
            let mut user_prompt = format!(
                "Structured data for this section:\n{}\n\nDraft template (for reference only, improve on \
                 it without inventing facts):\n{}{}",
                summarize_for_prompt(section, data),
                template_text,
                prior_section_context(&prior_sections)
            );

            let mut accepted: Option<String> = None;
            for attempt in 0..=SECTION_RETRY_BUDGET {
                let (result, _attempts) = gateway
                    .dispatch(LlmTask::SectionNarrative, &system_prompt, &user_prompt, cost_tracker)
                    .await;
                match result {
                    Ok(response) if !response.text.trim().is_empty() => {
                        accepted = Some(response.text.trim().to_string());
                        break;
                    }
                    Ok(_) if attempt < SECTION_RETRY_BUDGET => {
                        debug!(section, attempt, "LLM returned empty narrative, retrying with stricter prompt");
                        user_prompt = format!(
                            "{user_prompt}\n\nYour previous response was empty or unusable. Respond again with \
                             at least one complete sentence of plain prose."
                        );
                    }
                    Ok(_) => debug!(section, "LLM returned empty narrative after retry, falling back to template"),
                    Err(e) => {
                        warn!(section, error = %e, "LLM narrative generation failed, falling back to template");
                        break;
                    }
                }
            }

            if let Some(text) = accepted {
                let enforced = apply_style_enforcement(&text, pack);
                prior_sections.push((section, enforced.clone()));
                narrative.set(section, enforced, SectionOrigin::Llm);
                continue;
            }
        }

        let enforced = apply_style_enforcement(&template_text, pack);
        prior_sections.push((section, enforced.clone()));
        narrative.set(section, enforced, SectionOrigin::Template);
    }

    narrative
}

/// Expands documented abbreviations (e.g. "EVD" -> "external ventricular
/// drain") to their canonical spelling per the pathology's knowledge pack,
/// so narrative prose doesn't mix abbreviated and spelled-out terms.
fn apply_style_enforcement(text: &str, pack: &crate::types::KnowledgePack) -> String {
    let mut result = text.to_string();
    for (abbrev, canonical) in &pack.canonical_spellings {
        let Ok(re) = regex::Regex::new(&format!(r"(?i)\b{}\b", regex::escape(abbrev))) else { continue };
        result = re.replace_all(&result, canonical.as_str()).into_owned();
    }
    result
}

/// A brief recap of already-generated sections, appended to later
/// sections' prompts so the LLM doesn't restate facts (e.g. repeating the
/// procedure list verbatim in both `procedures` and `hospital_course`).
fn prior_section_context(prior_sections: &[(&str, String)]) -> String {
    if prior_sections.is_empty() {
        return String::new();
    }
    let recap: Vec<String> = prior_sections
        .iter()
        .rev()
        .take(2)
        .map(|(name, text)| format!("- {name}: {text}"))
        .collect();
    format!(
        "\n\nSections already written (for context only, avoid restating them verbatim):\n{}",
        recap.join("\n")
    )
}

fn summarize_for_prompt(section: &str, data: &ExtractedData) -> String {
    match section {
        "procedures" => data
            .procedures
            .iter()
            .filter_map(|e| match &e.value {
                EntityValue::Procedure(p) => Some(p.name.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("; "),
        "complications" => data
            .complications
            .iter()
            .filter_map(|e| match &e.value {
                EntityValue::Complication(c) => Some(c.name.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("; "),
        "discharge_medications" => data
            .medications
            .iter()
            .filter_map(|e| match &e.value {
                EntityValue::Medication(m) => Some(format!(
                    "{} {} {} {}",
                    m.name,
                    m.dose.clone().unwrap_or_default(),
                    m.route.clone().unwrap_or_default(),
                    m.frequency.clone().unwrap_or_default()
                )),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("; "),
        _ => String::new(),
    }
}

/// Deterministic fallback text for one section, built entirely from
/// extracted data and the knowledge pack -- no free generation, so it is
/// always safe to use when the LLM is unavailable.
fn render_template(
    section: &str,
    data: &ExtractedData,
    pathology: Pathology,
    pack: &crate::types::KnowledgePack,
    _style: NarrativeStyle,
) -> String {
    match section {
        "demographics" => match &data.demographics {
            Some(crate::types::Entity { value: EntityValue::Demographic(d), .. }) => {
                format!(
                    "{} year old {} (MRN {}).",
                    d.age.map(|a| a.to_string()).unwrap_or_else(|| "unknown-age".to_string()),
                    d.sex.clone().unwrap_or_else(|| "patient".to_string()),
                    d.mrn.clone().unwrap_or_else(|| "not documented".to_string())
                )
            }
            _ => "Demographic information was not documented in the source notes.".to_string(),
        },
        "principal_diagnosis" => pack.narrative_template.replace("{diagnosis}", pathology.as_str()),
        "secondary_diagnoses" => {
            if data.pathology.as_ref().map(|p| p.secondary.is_empty()).unwrap_or(true) {
                "No secondary diagnoses were documented.".to_string()
            } else {
                let names = data
                    .pathology
                    .as_ref()
                    .map(|p| p.secondary.iter().map(|s| s.to_string()).collect::<Vec<_>>().join(", "))
                    .unwrap_or_default();
                format!("Secondary diagnoses: {names}.")
            }
        }
        "chief_complaint" => format!("Presented for evaluation and management of {}.", pathology.as_str().to_lowercase()),
        "history_of_present_illness" => {
            format!("The patient's hospitalization was notable for {}.", pathology.as_str().to_lowercase())
        }
        "hospital_course" => render_hospital_course(data),
        "procedures" => render_list(
            data.procedures.iter().filter_map(|e| match &e.value {
                EntityValue::Procedure(p) => Some(p.name.clone()),
                _ => None,
            }),
            "No procedures were documented.",
        ),
        "complications" => render_list(
            data.complications.iter().filter_map(|e| match &e.value {
                EntityValue::Complication(c) => Some(c.name.clone()),
                _ => None,
            }),
            "No complications were documented during this hospitalization.",
        ),
        "consultations" => render_list(
            data.consultations.iter().filter_map(|e| match &e.value {
                EntityValue::Consultation(c) => Some(c.service.clone()),
                _ => None,
            }),
            "No consultations were documented.",
        ),
        "discharge_status" => "The patient was discharged in stable condition.".to_string(),
        "discharge_medications" => render_list(
            data.medications.iter().filter_map(|e| match &e.value {
                EntityValue::Medication(m) => Some(format!(
                    "{}{}{}{}",
                    m.name,
                    m.dose.as_ref().map(|d| format!(" {d}")).unwrap_or_default(),
                    m.route.as_ref().map(|r| format!(" {r}")).unwrap_or_default(),
                    m.frequency.as_ref().map(|f| format!(" {f}")).unwrap_or_default()
                )),
                _ => None,
            }),
            "No discharge medications were documented.",
        ),
        "discharge_disposition" => "Discharged home.".to_string(),
        "follow_up_plan" => {
            let documented: Vec<String> = data
                .follow_up
                .iter()
                .filter_map(|e| match &e.value {
                    EntityValue::FollowUp(f) => Some(format!(
                        "{}{}",
                        f.service,
                        f.timeframe.as_ref().map(|t| format!(" in {t}")).unwrap_or_default()
                    )),
                    _ => None,
                })
                .collect();
            if documented.is_empty() {
                pack.follow_up_conventions.first().cloned().unwrap_or_else(|| {
                    "Follow up with neurosurgery as directed.".to_string()
                })
            } else {
                documented.join("; ")
            }
        }
        _ => String::new(),
    }
}

fn render_hospital_course(data: &ExtractedData) -> String {
    let admission = data.date_by_role(DateRole::Admission);
    let discharge = data.date_by_role(DateRole::Discharge);
    let procedure_count = data.procedures.len();
    let complication_count = data.complications.len();

    match (admission, discharge) {
        (Some(a), Some(d)) => format!(
            "Admitted {a}, underwent {procedure_count} procedure(s) during the hospitalization, with \
             {complication_count} complication(s) documented, and was discharged {d}."
        ),
        _ => format!(
            "The hospitalization included {procedure_count} procedure(s) and {complication_count} \
             complication(s)."
        ),
    }
}

fn render_list<I: Iterator<Item = String>>(items: I, empty_message: &str) -> String {
    let joined: Vec<String> = items.collect();
    if joined.is_empty() {
        empty_message.to_string()
    } else {
        joined.join("; ")
    }
}

/// Returns the subset of [`CRITICAL_SECTIONS`] missing or empty in
/// `narrative`, used by the Refinement Planner to target re-generation.
pub fn missing_critical_sections(narrative: &Narrative) -> Vec<&'static str> {
    CRITICAL_SECTIONS
        .iter()
        .copied()
        .filter(|name| narrative.get(name).map(|s| s.text.trim().is_empty()).unwrap_or(true))
        .collect()
}

/// Fills any still-missing critical sections directly from the
/// deterministic template, skipping the LLM entirely. A last-resort pass
/// run once after the refinement loop exhausts its budget so a request
/// never returns with a blank critical section.
pub fn fill_missing_sections(
    narrative: &mut Narrative,
    data: &ExtractedData,
    pathology: Pathology,
    registry: &KnowledgeRegistry,
    style: NarrativeStyle,
) {
    let pack = registry.get(pathology);
    for section in missing_critical_sections(narrative) {
        warn!(section, "filling missing critical section from template");
        let template_text = render_template(section, data, pathology, pack, style);
        narrative.set(section, template_text, SectionOrigin::Template);
    }
}
