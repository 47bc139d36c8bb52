//! Cost Tracker: in-memory per-request LLM spend accounting.
//!
//! The pipeline core is stateless across requests, so there is no
//! persistence layer here; a fresh [`CostTracker`] is created per
//! [`crate::orchestrator::generate_discharge_summary`] call and folded into
//! the returned [`crate::types::Telemetry`].

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::warn;

/// Per-million-token pricing for one provider/model pair.
#[derive(Debug, Clone, Copy)]
pub struct Pricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

/// Token usage for a single LLM call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn cost_cents(&self, pricing: Pricing) -> f64 {
        let input_cost = self.input_tokens as f64 / 1_000_000.0 * pricing.input_per_million;
        let output_cost = self.output_tokens as f64 / 1_000_000.0 * pricing.output_per_million;
        (input_cost + output_cost) * 100.0
    }
}

/// Looks up approximate pricing for a model name. Unknown models fall back
/// to a conservative mid-tier estimate rather than erroring, since pricing
/// should never block extraction.
pub fn pricing_for_model(model: &str) -> Pricing {
    if model.contains("opus") {
        Pricing { input_per_million: 15.0, output_per_million: 75.0 }
    } else if model.contains("sonnet") {
        Pricing { input_per_million: 3.0, output_per_million: 15.0 }
    } else if model.contains("haiku") {
        Pricing { input_per_million: 0.25, output_per_million: 1.25 }
    } else if model.contains("gpt-4o") {
        Pricing { input_per_million: 2.5, output_per_million: 10.0 }
    } else if model.contains("gemini") {
        Pricing { input_per_million: 0.35, output_per_million: 1.05 }
    } else if model.contains("grok") {
        Pricing { input_per_million: 0.20, output_per_million: 0.50 }
    } else {
        Pricing { input_per_million: 2.0, output_per_million: 8.0 }
    }
}

/// One logged call, kept for the telemetry breakdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostEntry {
    pub task: String,
    pub model: String,
    pub usage: TokenUsage,
    pub cost_cents: f64,
}

/// Accumulates LLM spend for a single pipeline request and enforces the
/// configured per-request ceiling.
pub struct CostTracker {
    max_cost_cents: f64,
    entries: Mutex<Vec<CostEntry>>,
}

impl CostTracker {
    pub fn new(max_cost_cents: f64) -> Self {
        Self {
            max_cost_cents,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Record a completed call. Returns `DeadlineExceeded`-style error only
    /// when the running total has breached the budget; callers are expected
    /// to treat this as a signal to stop issuing further LLM calls, not to
    /// discard already-extracted data.
    pub fn record(&self, task: &str, model: &str, usage: TokenUsage) -> Result<()> {
        let pricing = pricing_for_model(model);
        let cost_cents = usage.cost_cents(pricing);
        let mut entries = self.entries.lock().expect("cost tracker mutex poisoned");
        entries.push(CostEntry {
            task: task.to_string(),
            model: model.to_string(),
            usage,
            cost_cents,
        });
        let total: f64 = entries.iter().map(|e| e.cost_cents).sum();
        if total > self.max_cost_cents {
            warn!(total_cents = total, cap_cents = self.max_cost_cents, "LLM cost budget exceeded");
            return Err(PipelineError::other(format!(
                "LLM cost budget of {:.2} cents exceeded ({:.2} cents spent)",
                self.max_cost_cents, total
            )));
        }
        Ok(())
    }

    pub fn total_cents(&self) -> f64 {
        self.entries
            .lock()
            .expect("cost tracker mutex poisoned")
            .iter()
            .map(|e| e.cost_cents)
            .sum()
    }

    pub fn entries(&self) -> Vec<CostEntry> {
        self.entries.lock().expect("cost tracker mutex poisoned").clone()
    }

    pub fn remaining_cents(&self) -> f64 {
        (self.max_cost_cents - self.total_cents()).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_accumulate_cost() {
        let tracker = CostTracker::new(100.0);
        tracker
            .record("extraction", "claude-sonnet-4", TokenUsage { input_tokens: 10_000, output_tokens: 2_000 })
            .unwrap();
        assert!(tracker.total_cents() > 0.0);
        assert_eq!(tracker.entries().len(), 1);
    }

    #[test]
    fn exceeding_budget_errors_but_keeps_entry() {
        let tracker = CostTracker::new(0.01);
        let result = tracker.record(
            "extraction",
            "claude-opus-4",
            TokenUsage { input_tokens: 1_000_000, output_tokens: 500_000 },
        );
        assert!(result.is_err());
        assert_eq!(tracker.entries().len(), 1);
    }

    #[test]
    fn unknown_model_gets_mid_tier_pricing() {
        let pricing = pricing_for_model("some-unreleased-model");
        assert_eq!(pricing.input_per_million, 2.0);
    }
}
