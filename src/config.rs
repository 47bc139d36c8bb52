//! Configuration for the discharge summary pipeline.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level pipeline configuration, loaded once at process startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub llm: LlmConfig,
    pub cost: CostConfig,
    pub knowledge: KnowledgeConfig,
    pub quality: QualityConfig,
}

impl Config {
    /// Load configuration from environment variables (and `.env`, if
    /// present). Every field has a safe default; nothing here is required
    /// for the pattern-only extraction path.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let llm = LlmConfig {
            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
            openai_api_key: std::env::var("OPENAI_API_KEY").ok(),
            google_api_key: std::env::var("GOOGLE_API_KEY").ok(),
            xai_api_key: std::env::var("XAI_API_KEY").ok(),
            default_model: std::env::var("LLM_DEFAULT_MODEL")
                .unwrap_or_else(|_| "claude-sonnet-4".to_string()),
            max_tokens: std::env::var("LLM_MAX_TOKENS")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(4096),
            temperature: std::env::var("LLM_TEMPERATURE")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(0.2),
            request_timeout_ms: std::env::var("LLM_REQUEST_TIMEOUT_MS")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(20_000),
            max_retries: std::env::var("LLM_MAX_RETRIES")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(2),
            enabled: std::env::var("LLM_ENABLED")
                .ok()
                .and_then(|e| e.parse().ok())
                .unwrap_or(true),
        };

        let cost = CostConfig {
            max_cost_cents_per_request: std::env::var("MAX_COST_CENTS_PER_REQUEST")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(50.0),
        };

        let knowledge = KnowledgeConfig {
            packs_dir: std::env::var("KNOWLEDGE_PACKS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./knowledge_packs")),
        };

        let quality = QualityConfig {
            default_quality_target: std::env::var("DEFAULT_QUALITY_TARGET")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(90.0),
            default_max_refinement_iterations: std::env::var("DEFAULT_MAX_REFINEMENT_ITERATIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2),
            default_deadline_ms: std::env::var("DEFAULT_DEADLINE_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60_000),
        };

        Ok(Self {
            llm,
            cost,
            knowledge,
            quality,
        })
    }

    /// Validate the configuration. LLM use is optional (`use_llm: false`
    /// falls back to the pattern extractor and narrative templates), so a
    /// missing API key is only an error when the caller insists on LLM use.
    pub fn validate(&self) -> Result<()> {
        if self.llm.enabled && !self.llm.has_any_credential() {
            return Err(PipelineError::other(
                "LLM is enabled but no provider API key is configured (ANTHROPIC_API_KEY, \
                 OPENAI_API_KEY, GOOGLE_API_KEY, or XAI_API_KEY)",
            ));
        }

        if self.cost.max_cost_cents_per_request <= 0.0 {
            return Err(PipelineError::other(
                "max_cost_cents_per_request must be positive",
            ));
        }

        if !(0.0..=100.0).contains(&self.quality.default_quality_target) {
            return Err(PipelineError::other(
                "default_quality_target must be between 0 and 100",
            ));
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            cost: CostConfig::default(),
            knowledge: KnowledgeConfig::default(),
            quality: QualityConfig::default(),
        }
    }
}

/// LLM Gateway configuration: credentials, defaults, and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub anthropic_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub google_api_key: Option<String>,
    pub xai_api_key: Option<String>,
    pub default_model: String,
    pub max_tokens: usize,
    pub temperature: f64,
    pub request_timeout_ms: u64,
    pub max_retries: u32,
    pub enabled: bool,
}

impl LlmConfig {
    pub fn has_any_credential(&self) -> bool {
        self.anthropic_api_key.is_some()
            || self.openai_api_key.is_some()
            || self.google_api_key.is_some()
            || self.xai_api_key.is_some()
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            anthropic_api_key: None,
            openai_api_key: None,
            google_api_key: None,
            xai_api_key: None,
            default_model: "claude-sonnet-4".to_string(),
            max_tokens: 4096,
            temperature: 0.2,
            request_timeout_ms: 20_000,
            max_retries: 2,
            enabled: false,
        }
    }
}

/// Cost Tracker budget configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CostConfig {
    pub max_cost_cents_per_request: f64,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            max_cost_cents_per_request: 50.0,
        }
    }
}

/// Knowledge pack registry location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeConfig {
    pub packs_dir: PathBuf,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            packs_dir: PathBuf::from("./knowledge_packs"),
        }
    }
}

/// Defaults for [`crate::types::PipelineOptions`] when the caller doesn't
/// override them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QualityConfig {
    pub default_quality_target: f64,
    pub default_max_refinement_iterations: u32,
    pub default_deadline_ms: u64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            default_quality_target: 90.0,
            default_max_refinement_iterations: 2,
            default_deadline_ms: 60_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_llm_disabled_and_valid_ranges() {
        let config = Config::default();
        assert!(!config.llm.enabled);
        assert_eq!(config.quality.default_max_refinement_iterations, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_enabled_llm_without_credentials() {
        let mut config = Config::default();
        config.llm.enabled = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_accepts_enabled_llm_with_credential() {
        let mut config = Config::default();
        config.llm.enabled = true;
        config.llm.anthropic_api_key = Some("test-key".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_out_of_range_quality_target() {
        let mut config = Config::default();
        config.quality.default_quality_target = 150.0;
        assert!(config.validate().is_err());
    }
}
