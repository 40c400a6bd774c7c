//! Error types for the fleet-worker crate.

use thiserror::Error;

/// Errors raised while building or persisting a worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The definition failed validation.
    #[error("invalid definition: {reason}")]
    InvalidDefinition {
        /// Why the definition was rejected.
        reason: String,
    },

    /// A cron expression could not be parsed.
    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidCron {
        /// The offending expression.
        expr: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for WorkerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Errors returned by a metrics backend query.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The backend could not be reached.
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    /// The backend rejected the query.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// The backend answered with something that is not an instant vector.
    #[error("unexpected backend response: {0}")]
    Decode(String),
}

/// Errors from a single action execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    /// A failure worth retrying, such as a timeout or refused connection.
    #[error("transient action failure: {0}")]
    Transient(String),

    /// A failure retrying cannot fix, such as a malformed request.
    #[error("permanent action failure: {0}")]
    Permanent(String),
}

impl ActionError {
    /// Returns true if the failure may succeed on another attempt.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Result type for worker operations.
pub type Result<T> = std::result::Result<T, WorkerError>;
