//! Orchestrator: the pipeline's single public entry point,
//! `generate_discharge_summary`, wiring every stage together with non-fatal
//! degradation at each step.
//!
//! Each stage is an explicit numbered step, logged, and wrapped so a stage
//! failure degrades the result rather than aborting the whole run.

use crate::config::Config;
use crate::cost_tracker::CostTracker;
use crate::deduplicator;
use crate::hybrid_merger;
use crate::knowledge::KnowledgeRegistry;
use crate::llm_extractor;
use crate::llm_gateway::{LlmGateway, ProviderConfig};
use crate::narrative_generator;
use crate::pattern_extractor::PatternExtractor;
use crate::preprocessor;
use crate::quality_scorer;
use crate::refinement::{self, RefinementAction};
use crate::temporal_engine;
use crate::types::{
    EdgeCaseFlag, EntityValue, LlmAttempt, Note, PipelineOptions, PipelineResult, Telemetry,
};
use crate::{context_builder, validator};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Runs the full pipeline: preprocess, detect pathology, extract (pattern
/// and LLM in parallel), merge, resolve temporal context, deduplicate,
/// validate, generate narrative, score quality, and refine until the
/// quality target is met or the iteration/deadline budget is exhausted.
pub async fn generate_discharge_summary(
    notes: &[Note],
    options: PipelineOptions,
    config: &Config,
    registry: &KnowledgeRegistry,
) -> crate::error::Result<PipelineResult> {
    let deadline = Instant::now() + Duration::from_millis(options.deadline_ms);
    let mut telemetry = Telemetry::default();

    info!("Step 1: preprocessing notes");
    let stage_start = Instant::now();
    let preprocessed = preprocessor::preprocess(notes.to_vec())?;
    telemetry.stage_timings.insert("preprocess".to_string(), stage_start.elapsed());

    classify_edge_cases(&preprocessed.notes, &mut telemetry);

    info!("Step 2: building pathology context");
    let stage_start = Instant::now();
    let context = context_builder::build_context(preprocessed.notes.clone(), registry, options.pathology_hint);
    telemetry.stage_timings.insert("context_builder".to_string(), stage_start.elapsed());
    if context.pathology.scores.values().all(|s| *s <= 0.0) && options.pathology_hint.is_none() {
        telemetry.edge_case_flags.push(EdgeCaseFlag::NoPathologyDetected);
    }

    let gateway = build_gateway(config, &options)?;
    let cost_tracker = CostTracker::new(config.cost.max_cost_cents_per_request);

    info!("Step 3: extracting entities");
    let stage_start = Instant::now();
    let pattern_extractor = PatternExtractor::new()?;
    let pattern_entities = pattern_extractor.extract(&context.notes);

    let (llm_entities, llm_attempts) = if options.use_llm {
        llm_extractor::extract(&context.notes, context.pathology.primary, context.complexity, &gateway, &cost_tracker).await
    } else {
        (Vec::new(), Vec::new())
    };
    record_attempts(&mut telemetry, llm_attempts);
    telemetry.stage_timings.insert("extraction".to_string(), stage_start.elapsed());

    info!("Step 4: merging extraction results");
    let stage_start = Instant::now();
    let mut extracted = hybrid_merger::merge(pattern_entities, llm_entities, &preprocessed.source_quality, &context.notes);
    extracted.pathology = Some(context.pathology.clone());
    if context.has_gold_standard_functional_source {
        for entity in extracted.functional_scores.iter_mut() {
            if let EntityValue::FunctionalScore(score) = &mut entity.value {
                score.from_gold_standard_source = true;
            }
        }
    }
    telemetry.stage_timings.insert("merge".to_string(), stage_start.elapsed());

    if context
        .pathology
        .scores
        .get(&context.pathology.primary)
        .map(|s| *s > 0.0 && context.pathology.secondary.len() >= 2)
        .unwrap_or(false)
    {
        telemetry.edge_case_flags.push(EdgeCaseFlag::UnusualPathology {
            detected: context.pathology.primary.as_str().to_string(),
        });
    }

    info!("Step 5: resolving temporal context");
    let stage_start = Instant::now();
    temporal_engine::resolve(&mut extracted);
    telemetry.stage_timings.insert("temporal".to_string(), stage_start.elapsed());

    info!("Step 6: deduplicating entities");
    let stage_start = Instant::now();
    let dedup_summary = deduplicator::deduplicate(&mut extracted);
    telemetry.stage_timings.insert("dedup".to_string(), stage_start.elapsed());
    debug_dedup(&dedup_summary);

    info!("Step 7: validating extracted data");
    let stage_start = Instant::now();
    let pack = registry.get(context.pathology.primary);
    let mut issues = validator::validate(&extracted, &context.notes, pack);
    telemetry.stage_timings.insert("validate".to_string(), stage_start.elapsed());

    info!("Step 8: generating narrative");
    let stage_start = Instant::now();
    let mut narrative = narrative_generator::generate(
        &extracted,
        context.pathology.primary,
        registry,
        options.style,
        &gateway,
        &cost_tracker,
    )
    .await;
    issues.extend(validator::validate_narrative(&narrative));
    telemetry.stage_timings.insert("narrative".to_string(), stage_start.elapsed());

    info!("Step 9: scoring quality");
    let mut report = quality_scorer::score(&extracted, &narrative, &issues, context.pathology.primary, registry);

    info!("Step 10: refinement loop");
    let mut iteration = 0;
    while iteration < options.max_refinement_iterations && Instant::now() < deadline {
        let plan = refinement::plan(&report, options.quality_target);
        if refinement::is_terminal(&plan) {
            break;
        }
        info!(iteration, actions = plan.len(), "refinement pass");

        for action in &plan {
            if Instant::now() >= deadline {
                telemetry.warnings.push("deadline reached during refinement".to_string());
                break;
            }
            match action {
                RefinementAction::RegenerateSection { .. } => {
                    narrative = narrative_generator::generate(
                        &extracted,
                        context.pathology.primary,
                        registry,
                        options.style,
                        &gateway,
                        &cost_tracker,
                    )
                    .await;
                }
                RefinementAction::ReExtractField { field } => {
                    if options.use_llm {
                        let (more_entities, attempts) = llm_extractor::extract(
                            &context.notes,
                            context.pathology.primary,
                            context.complexity,
                            &gateway,
                            &cost_tracker,
                        )
                        .await;
                        record_attempts(&mut telemetry, attempts);
                        if !more_entities.is_empty() {
                            extracted = hybrid_merger::merge(
                                extracted.all_entities().into_iter().cloned().collect(),
                                more_entities,
                                &preprocessed.source_quality,
                                &context.notes,
                            );
                            extracted.pathology = Some(context.pathology.clone());
                            if context.has_gold_standard_functional_source {
                                for entity in extracted.functional_scores.iter_mut() {
                                    if let EntityValue::FunctionalScore(score) = &mut entity.value {
                                        score.from_gold_standard_source = true;
                                    }
                                }
                            }
                            temporal_engine::resolve(&mut extracted);
                            deduplicator::deduplicate(&mut extracted);
                        }
                    }
                    debug!(field, "re-extraction pass complete");
                }
                RefinementAction::Stop => {}
            }
        }

        issues = validator::validate(&extracted, &context.notes, pack);
        issues.extend(validator::validate_narrative(&narrative));
        report = quality_scorer::score(&extracted, &narrative, &issues, context.pathology.primary, registry);
        iteration += 1;
    }

    narrative_generator::fill_missing_sections(&mut narrative, &extracted, context.pathology.primary, registry, options.style);

    telemetry.cost_cents = cost_tracker.total_cents();

    Ok(PipelineResult {
        extracted_data: extracted,
        narrative,
        quality_report: report,
        telemetry,
    })
}

fn build_gateway(config: &Config, options: &PipelineOptions) -> crate::error::Result<LlmGateway> {
    if !options.use_llm || !config.llm.enabled {
        return LlmGateway::new(Vec::new(), config.llm.request_timeout_ms);
    }

    let mut providers = Vec::new();
    let model = config.llm.default_model.clone();

    if let Some(key) = &config.llm.anthropic_api_key {
        providers.push(ProviderConfig {
            name: "anthropic".to_string(),
            api_key: key.clone(),
            model: model.clone(),
            base_url: "https://api.anthropic.com/v1".to_string(),
        });
    }
    if let Some(key) = &config.llm.openai_api_key {
        providers.push(ProviderConfig {
            name: "openai".to_string(),
            api_key: key.clone(),
            model: "gpt-4o".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
        });
    }
    if let Some(key) = &config.llm.google_api_key {
        providers.push(ProviderConfig {
            name: "google".to_string(),
            api_key: key.clone(),
            model: "gemini-2.0-flash".to_string(),
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
        });
    }
    if let Some(key) = &config.llm.xai_api_key {
        providers.push(ProviderConfig {
            name: "xai".to_string(),
            api_key: key.clone(),
            model: "grok-4-1-fast-reasoning".to_string(),
            base_url: "https://api.x.ai/v1".to_string(),
        });
    }

    if !options.provider_order.is_empty() {
        providers.sort_by_key(|p| options.provider_order.iter().position(|name| name == &p.name).unwrap_or(usize::MAX));
    }

    LlmGateway::new(providers, config.llm.request_timeout_ms)
}

fn classify_edge_cases(notes: &[Note], telemetry: &mut Telemetry) {
    let total_chars: usize = notes.iter().map(|n| n.text.len()).sum();
    if total_chars < 200 {
        telemetry.edge_case_flags.push(EdgeCaseFlag::VeryShortInput { chars: total_chars });
    }
    if total_chars > crate::llm_extractor::CHUNK_THRESHOLD_CHARS {
        let chunks = (total_chars / crate::llm_extractor::CHUNK_THRESHOLD_CHARS) + 1;
        telemetry.edge_case_flags.push(EdgeCaseFlag::VeryLongInput { chars: total_chars, chunks });
    }
    let admission_mentions = notes.iter().filter(|n| n.text.to_lowercase().contains("admission date")).count();
    if admission_mentions > 1 {
        telemetry.edge_case_flags.push(EdgeCaseFlag::MultipleAdmissions { count: admission_mentions });
    }
}

fn record_attempts(telemetry: &mut Telemetry, attempts: Vec<crate::llm_gateway::AttemptOutcome>) {
    for attempt in attempts {
        telemetry.llm_attempts.push(LlmAttempt {
            provider: attempt.provider,
            task: "llm_extraction".to_string(),
            succeeded: attempt.succeeded,
            reason: attempt.reason,
        });
    }
}

fn debug_dedup(summary: &deduplicator::DedupSummary) {
    if summary.duplicates_collapsed > 0 {
        warn!(
            collapsed = summary.duplicates_collapsed,
            reduction_pct = summary.reduction_percent(),
            "deduplication collapsed entities"
        );
    }
}
