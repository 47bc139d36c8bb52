//! LLM Gateway: provider-agnostic dispatch with ordered fallback and
//! exponential-backoff retry.
//!
//! Detects the provider family from the model name (model name -> provider
//! -> base URL) and retries each provider attempt with exponential backoff
//! before falling through to the next configured provider.

use crate::cost_tracker::{CostTracker, TokenUsage};
use crate::error::{PipelineError, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

/// One configured backend the gateway may call.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub name: String,
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

/// Detects provider family from a model name.
pub fn provider_family(model: &str) -> &'static str {
    if model.starts_with("gemini") {
        "google"
    } else if model.starts_with("grok") {
        "xai"
    } else if model.starts_with("gpt") {
        "openai"
    } else if model.starts_with("claude") {
        "anthropic"
    } else {
        "anthropic"
    }
}

fn base_url_for(family: &str) -> &'static str {
    match family {
        "google" => "https://generativelanguage.googleapis.com/v1beta",
        "xai" => "https://api.x.ai/v1",
        "openai" => "https://api.openai.com/v1",
        "anthropic" => "https://api.anthropic.com/v1",
        _ => "https://api.anthropic.com/v1",
    }
}

/// Retry policy for a single provider attempt.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay_ms: 500,
            max_delay_ms: 8_000,
        }
    }
}

impl RetryConfig {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.initial_delay_ms.saturating_mul(2u64.saturating_pow(attempt));
        Duration::from_millis(exp.min(self.max_delay_ms))
    }
}

fn is_retryable_error(message: &str) -> bool {
    const RETRYABLE_PATTERNS: &[&str] = &[
        "timeout",
        "connection",
        "temporarily unavailable",
        "rate limit",
        "429",
        "500",
        "502",
        "503",
        "504",
        "overloaded",
        "capacity",
    ];
    let lower = message.to_lowercase();
    RETRYABLE_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Named LLM tasks the pipeline issues. Each maps to a system-prompt
/// template; the caller supplies the task-specific payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmTask {
    EntityExtraction,
    SectionNarrative,
    RefinementPass,
}

impl LlmTask {
    fn as_str(&self) -> &'static str {
        match self {
            LlmTask::EntityExtraction => "entity_extraction",
            LlmTask::SectionNarrative => "section_narrative",
            LlmTask::RefinementPass => "refinement_pass",
        }
    }
}

/// Checks a raw response for the minimal shape its task expects before the
/// caller attempts to parse it. Catches empty responses, truncated JSON
/// (an extraction task should always close every brace it opens), and
/// suspiciously short narrative text, all of which tend to come back from
/// a provider that was cut off mid-stream or returned an error wrapped as
/// 200 OK.
fn validate_response(task: LlmTask, text: &str) -> std::result::Result<(), String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err("empty response body".to_string());
    }
    if trimmed.len() < 10 {
        return Err(format!("response too short ({} chars)", trimmed.len()));
    }
    match task {
        LlmTask::EntityExtraction => {
            let opens = trimmed.matches('{').count();
            let closes = trimmed.matches('}').count();
            if opens == 0 {
                return Err("response has no JSON object markers".to_string());
            }
            if opens != closes {
                return Err(format!("response looks truncated ({opens} '{{' vs {closes} '}}')"));
            }
        }
        LlmTask::SectionNarrative | LlmTask::RefinementPass => {
            if trimmed.len() < 20 {
                return Err(format!("narrative response too short ({} chars)", trimmed.len()));
            }
        }
    }
    Ok(())
}

/// Record of one attempted call for [`crate::types::LlmAttempt`] telemetry.
#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    pub provider: String,
    pub succeeded: bool,
    pub reason: Option<String>,
}

/// A completed LLM response: raw text plus accounting for the cost tracker.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
    pub usage: TokenUsage,
    pub provider: String,
}

/// Dispatches tasks across an ordered list of providers, retrying each with
/// backoff before falling through to the next.
pub struct LlmGateway {
    client: Client,
    providers: Vec<ProviderConfig>,
    retry: RetryConfig,
    timeout: Duration,
}

impl LlmGateway {
    pub fn new(providers: Vec<ProviderConfig>, timeout_ms: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| PipelineError::other(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            providers,
            retry: RetryConfig::default(),
            timeout: Duration::from_millis(timeout_ms),
        })
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn has_providers(&self) -> bool {
        !self.providers.is_empty()
    }

    /// Issues a minimal, cheap call against the first configured provider
    /// to confirm it is reachable and returning well-formed responses,
    /// without touching the cost tracker (a health check is diagnostic,
    /// not billable work). Returns `false` with no providers configured.
    pub async fn healthy(&self) -> bool {
        let Some(provider) = self.providers.first() else {
            return false;
        };
        match self.call_once(provider, "Respond with the single word OK.", "Health check.").await {
            Ok(response) => !response.text.trim().is_empty(),
            Err(e) => {
                warn!(provider = %provider.name, error = %e, "health check failed");
                false
            }
        }
    }

    /// Run `task` against each configured provider in order, retrying
    /// transient failures, until one succeeds or all are exhausted.
    /// Returns the response plus the per-attempt log for telemetry.
    pub async fn dispatch(
        &self,
        task: LlmTask,
        system_prompt: &str,
        user_prompt: &str,
        cost_tracker: &CostTracker,
    ) -> (Result<LlmResponse>, Vec<AttemptOutcome>) {
        let mut attempts = Vec::new();

        if self.providers.is_empty() {
            return (
                Err(PipelineError::LlmUnavailable("no providers configured".to_string())),
                attempts,
            );
        }

        for provider in &self.providers {
            if cost_tracker.remaining_cents() <= 0.0 {
                attempts.push(AttemptOutcome {
                    provider: provider.name.clone(),
                    succeeded: false,
                    reason: Some("cost budget exhausted".to_string()),
                });
                break;
            }

            let mut last_error = String::new();
            let mut prompt = user_prompt.to_string();
            for attempt in 0..=self.retry.max_retries {
                match self.call_once(provider, system_prompt, &prompt).await {
                    Ok(response) => match validate_response(task, &response.text) {
                        Ok(()) => {
                            attempts.push(AttemptOutcome {
                                provider: provider.name.clone(),
                                succeeded: true,
                                reason: None,
                            });
                            let _ = cost_tracker.record(task.as_str(), &provider.model, response.usage);
                            return (Ok(response), attempts);
                        }
                        Err(reason) => {
                            last_error = reason.clone();
                            warn!(provider = %provider.name, task = task.as_str(), reason = %reason, "response failed validation");
                            if attempt < self.retry.max_retries {
                                prompt = format!(
                                    "{user_prompt}\n\nYour previous response was rejected: {reason}. \
                                     Respond again with a complete, well-formed answer only."
                                );
                                continue;
                            }
                            break;
                        }
                    },
                    Err(e) => {
                        last_error = e.to_string();
                        if attempt < self.retry.max_retries && is_retryable_error(&last_error) {
                            let delay = self.retry.delay_for_attempt(attempt);
                            debug!(provider = %provider.name, attempt, delay_ms = delay.as_millis() as u64, "retrying LLM call");
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                        break;
                    }
                }
            }
            warn!(provider = %provider.name, task = task.as_str(), error = %last_error, "provider failed, falling back");
            attempts.push(AttemptOutcome {
                provider: provider.name.clone(),
                succeeded: false,
                reason: Some(last_error),
            });
        }

        (
            Err(PipelineError::LlmUnavailable(format!(
                "all {} provider(s) failed for task {}",
                self.providers.len(),
                task.as_str()
            ))),
            attempts,
        )
    }

    async fn call_once(
        &self,
        provider: &ProviderConfig,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<LlmResponse> {
        let family = provider_family(&provider.model);
        info!(provider = %provider.name, model = %provider.model, family, "calling LLM provider");

        let (url, body, headers): (String, Value, Vec<(&str, String)>) = match family {
            "anthropic" => (
                format!("{}/messages", provider.base_url),
                json!({
                    "model": provider.model,
                    "max_tokens": 4096,
                    "system": system_prompt,
                    "messages": [{"role": "user", "content": user_prompt}],
                }),
                vec![
                    ("x-api-key", provider.api_key.clone()),
                    ("anthropic-version", "2023-06-01".to_string()),
                ],
            ),
            "openai" | "xai" => (
                format!("{}/chat/completions", provider.base_url),
                json!({
                    "model": provider.model,
                    "messages": [
                        {"role": "system", "content": system_prompt},
                        {"role": "user", "content": user_prompt},
                    ],
                }),
                vec![("Authorization", format!("Bearer {}", provider.api_key))],
            ),
            "google" => (
                format!(
                    "{}/models/{}:generateContent?key={}",
                    provider.base_url, provider.model, provider.api_key
                ),
                json!({
                    "systemInstruction": {"parts": [{"text": system_prompt}]},
                    "contents": [{"role": "user", "parts": [{"text": user_prompt}]}],
                }),
                vec![],
            ),
            other => {
                return Err(PipelineError::other(format!("unsupported provider family: {other}")));
            }
        };

        let mut request = self.client.post(&url).timeout(self.timeout).json(&body);
        for (key, value) in headers {
            request = request.header(key, value);
        }

        let response = request.send().await?;
        let status = response.status();
        let payload: Value = response.json().await?;

        if !status.is_success() {
            let message = payload
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error");
            return Err(PipelineError::other(format!("HTTP {status}: {message}")));
        }

        extract_text_and_usage(family, &payload, &provider.name)
    }
}

fn extract_text_and_usage(family: &str, payload: &Value, provider_name: &str) -> Result<LlmResponse> {
    let malformed = |reason: &str| {
        PipelineError::LlmMalformedResponse {
            task: "dispatch".to_string(),
            reason: reason.to_string(),
        }
    };

    let (text, input_tokens, output_tokens) = match family {
        "anthropic" => {
            let text = payload["content"][0]["text"]
                .as_str()
                .ok_or_else(|| malformed("missing content[0].text"))?
                .to_string();
            let input = payload["usage"]["input_tokens"].as_u64().unwrap_or(0);
            let output = payload["usage"]["output_tokens"].as_u64().unwrap_or(0);
            (text, input, output)
        }
        "openai" | "xai" => {
            let text = payload["choices"][0]["message"]["content"]
                .as_str()
                .ok_or_else(|| malformed("missing choices[0].message.content"))?
                .to_string();
            let input = payload["usage"]["prompt_tokens"].as_u64().unwrap_or(0);
            let output = payload["usage"]["completion_tokens"].as_u64().unwrap_or(0);
            (text, input, output)
        }
        "google" => {
            let text = payload["candidates"][0]["content"]["parts"][0]["text"]
                .as_str()
                .ok_or_else(|| malformed("missing candidates[0].content.parts[0].text"))?
                .to_string();
            let input = payload["usageMetadata"]["promptTokenCount"].as_u64().unwrap_or(0);
            let output = payload["usageMetadata"]["candidatesTokenCount"].as_u64().unwrap_or(0);
            (text, input, output)
        }
        _ => return Err(malformed("unknown provider family")),
    };

    Ok(LlmResponse {
        text,
        usage: TokenUsage {
            input_tokens,
            output_tokens,
        },
        provider: provider_name.to_string(),
    })
}

/// A structured JSON response the Entity Extractor LLM task is expected to
/// return, validated before merging.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmExtractionEnvelope {
    pub entities: Vec<Value>,
}

pub fn parse_extraction_response(text: &str) -> Result<LlmExtractionEnvelope> {
    let trimmed = text.trim().trim_start_matches("```json").trim_start_matches("```").trim_end_matches("```");
    serde_json::from_str(trimmed.trim()).map_err(|e| PipelineError::LlmMalformedResponse {
        task: "entity_extraction".to_string(),
        reason: e.to_string(),
    })
}
