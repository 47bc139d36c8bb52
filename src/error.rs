//! Error taxonomy for the discharge summary pipeline.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Error kinds for the discharge summary pipeline.
///
/// Only [`PipelineError::EmptyInput`] and [`PipelineError::PreprocessingError`]
/// are fatal to a request. Every other variant is recorded in
/// `QualityReport.issues` or `Telemetry` and the pipeline proceeds with
/// whatever has been computed so far.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// No notes were supplied. Fatal; returned before any work starts.
    #[error("no notes supplied")]
    EmptyInput,

    /// Normalization could not proceed (e.g. note text could not be decoded).
    #[error("preprocessing failed: {0}")]
    PreprocessingError(String),

    /// Every registered LLM provider failed for this call. Non-fatal: the
    /// Pattern Extractor runs regardless and the Narrative Generator falls
    /// back to templates.
    #[error("no LLM provider available: {0}")]
    LlmUnavailable(String),

    /// An LLM response failed structural validation. Retried once with a
    /// stricter prompt; treated as `LlmUnavailable` for that call once
    /// retries are exhausted.
    #[error("malformed LLM response for task {task}: {reason}")]
    LlmMalformedResponse { task: String, reason: String },

    /// An entity lacked a verifiable source span and was discarded.
    #[error("entity evidence missing for {field}")]
    EntityEvidenceMissing { field: String },

    /// A date reference could not be resolved against any anchor.
    #[error("could not resolve temporal reference: {0}")]
    TemporalUnresolved(String),

    /// The pipeline-wide or per-attempt deadline elapsed before completion.
    #[error("deadline exceeded during {stage}")]
    DeadlineExceeded { stage: String },

    /// An internal invariant was violated. This must never be caused by
    /// input; it indicates a bug in the pipeline itself.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// I/O errors (reading a knowledge pack file, etc.).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP/network errors talking to an LLM provider.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A knowledge pack file was missing a required path.
    #[error("knowledge pack not found: {0}")]
    KnowledgePackNotFound(PathBuf),

    /// Generic error with attached context.
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        source: Box<PipelineError>,
    },

    /// Catch-all for conditions that don't warrant a dedicated variant.
    #[error("{0}")]
    Other(String),
}

impl PipelineError {
    /// Attach human-readable context to an existing error.
    pub fn context(self, context: impl Into<String>) -> Self {
        PipelineError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Build an [`PipelineError::Other`].
    pub fn other(msg: impl Into<String>) -> Self {
        PipelineError::Other(msg.into())
    }

    /// True for the two kinds that must abort the request outright.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::EmptyInput | PipelineError::PreprocessingError(_)
        )
    }
}

/// Extension trait for adding context to `Result`s.
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }
}
