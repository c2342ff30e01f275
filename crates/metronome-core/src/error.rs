// Error taxonomy shared across component boundaries

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a failure, carried on Run records and used by the
/// queue to decide between retry and terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Input rejected at the API boundary; never enters the queue.
    Validation,
    /// Schedule expression no longer valid at fire time (e.g. exhausted RRULE).
    Schedule,
    /// Template failed to render: missing path or bad expression.
    Template,
    /// Tool adapter reported a failure.
    Tool,
    /// Step exceeded its deadline or the lease deadline.
    Timeout,
    /// Database or stream I/O error; retried at the worker loop level.
    TransientStore,
    /// Lease expired before commit; the attempt is discarded silently.
    LeaseLost,
    /// Task was canceled while a run was in flight.
    Canceled,
}

impl ErrorKind {
    /// Whether a failure of this kind consumes a task retry and re-arms the
    /// work item. Timeouts retry the same way tool failures do.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Tool | ErrorKind::Timeout)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Schedule => "schedule",
            ErrorKind::Template => "template",
            ErrorKind::Tool => "tool",
            ErrorKind::Timeout => "timeout",
            ErrorKind::TransientStore => "transient_store",
            ErrorKind::LeaseLost => "lease_lost",
            ErrorKind::Canceled => "canceled",
        };
        write!(f, "{}", s)
    }
}

/// A field-level validation failure, surfaced at the REST boundary as a
/// 422 with `{error, message, details: {field, value, expected}}`.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{field}: expected {expected}, got {value:?}")]
pub struct ValidationError {
    pub field: String,
    pub value: String,
    pub expected: String,
}

impl ValidationError {
    pub fn new(
        field: impl Into<String>,
        value: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
            expected: expected.into(),
        }
    }
}
