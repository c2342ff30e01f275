// Engine error types, mapped onto the shared failure taxonomy

use metronome_core::ErrorKind;
use thiserror::Error;

/// A template that failed to render.
#[derive(Debug, Clone, Error)]
#[error("{detail}")]
pub struct TemplateError {
    pub detail: String,
}

impl TemplateError {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

/// Failure of a pipeline at a specific step.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Template failed to render; pipeline-terminal, never retried.
    #[error("template error at step '{step}': {detail}")]
    Template { step: String, detail: String },

    /// Tool adapter reported a failure; retryable per policy.
    #[error("tool error at step '{step}': {detail}")]
    Tool { step: String, detail: String },

    /// Step exceeded its deadline; retried the same way tool errors are.
    #[error("step '{step}' timed out after {seconds}s")]
    Timeout { step: String, seconds: u64 },
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Template { .. } => ErrorKind::Template,
            EngineError::Tool { .. } => ErrorKind::Tool,
            EngineError::Timeout { .. } => ErrorKind::Timeout,
        }
    }

    pub fn step(&self) -> &str {
        match self {
            EngineError::Template { step, .. }
            | EngineError::Tool { step, .. }
            | EngineError::Timeout { step, .. } => step,
        }
    }
}
