//! Error taxonomy shared by every component of the execution core.
//!
//! Handlers classify failures into a [`CoreError`]; the worker pool only
//! looks at the coarse [`ErrorKind`] when applying the retry policy.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// Coarse classification driving retry behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Eligible for re-enqueue under the retry policy.
    Transient,
    /// Never retried; the job is dead-lettered immediately.
    Permanent,
    /// The handler observed its cancel handle. Terminal, not retried.
    Cancelled,
    /// Worker-imposed deadline exceeded. Treated as transient.
    Timeout,
    /// Queue capacity exceeded. Surfaced to the caller only, never
    /// produced by a running handler.
    Backpressure,
}

impl ErrorKind {
    /// Whether the retry policy may re-enqueue an error of this kind.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::Timeout)
    }
}

// ---------------------------------------------------------------------------
// CoreError
// ---------------------------------------------------------------------------

/// Domain error for the execution core.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Source configuration invalid: {0}")]
    SourceInvalid(String),

    #[error("Destination unavailable: {0}")]
    DestinationUnavailable(String),

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Quality rule violated: {rule} on column '{column}'")]
    QualityViolation { rule: String, column: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Job queue is full")]
    QueueFull,

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Execution timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Notification delivery failed: {0}")]
    NotifyFailed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Classify this error for the retry policy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::SourceUnavailable(_)
            | CoreError::DestinationUnavailable(_)
            | CoreError::NotifyFailed(_) => ErrorKind::Transient,
            CoreError::SourceInvalid(_)
            | CoreError::SchemaMismatch(_)
            | CoreError::QualityViolation { .. }
            | CoreError::Configuration(_)
            | CoreError::Validation(_)
            | CoreError::NotFound { .. }
            | CoreError::Internal(_) => ErrorKind::Permanent,
            CoreError::QueueFull => ErrorKind::Backpressure,
            CoreError::Cancelled => ErrorKind::Cancelled,
            CoreError::Timeout(_) => ErrorKind::Timeout,
        }
    }

    /// Whether the retry policy may re-enqueue this error.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
