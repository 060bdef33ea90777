//! Public error model of the job engine.

use thiserror::Error;

/// Result type used across the public job API.
pub type EventingResult<T> = Result<T, EventingError>;

/// Error surfaced to callers of the job engine.
///
/// Storage failures are carried as strings so the error stays
/// `Clone` and independent of any concrete backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventingError {
    /// A value failed validation (e.g. empty topic).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier could not be parsed.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A job asked for a named queue while the maximum number of queues exists.
    #[error("cannot create job queue '{queue}': limit of {limit} job queues reached")]
    QueueLimitExceeded { queue: String, limit: usize },

    /// The durable job store failed; the caller may retry later.
    #[error("storage error: {0}")]
    Storage(String),

    /// The handler has been shut down.
    #[error("job handler is not running")]
    Stopped,

    /// A background thread could not be started.
    #[error("failed to spawn thread '{name}': {reason}")]
    Spawn { name: String, reason: String },
}

impl EventingError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn spawn(name: impl Into<String>, err: &std::io::Error) -> Self {
        Self::Spawn {
            name: name.into(),
            reason: err.to_string(),
        }
    }

    /// Storage failures are transient: the operation may succeed later.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}
