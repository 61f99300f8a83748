//! Error types for queue operations.

use crate::job::JobId;
use thiserror::Error;

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Queue-specific errors.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The caller supplied an unusable payload or options. Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The broker substrate could not be reached.
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// The broker was reached but rejected the command.
    #[error("Broker error: {0}")]
    Broker(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// The attempt no longer holds its lease, so its outcome was dropped.
    #[error("Lease lost for job {0}")]
    LeaseLost(JobId),

    /// Job execution failed
    #[error("Job execution failed: {0}")]
    ExecutionFailed(String),

    /// Worker not running
    #[error("Worker not running")]
    WorkerNotRunning,

    /// Worker already running
    #[error("Worker already running")]
    WorkerAlreadyRunning,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Handler exceeded the configured job timeout
    #[error("Operation timeout")]
    Timeout,
}

impl QueueError {
    /// Shorthand for a handler failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::ExecutionFailed(message.into())
    }

    /// Message recorded on the job when a handler fails with this error.
    pub fn failure_message(&self) -> String {
        match self {
            Self::ExecutionFailed(message) => message.clone(),
            other => other.to_string(),
        }
    }

    /// Whether the error was caused by the caller (maps to a 4xx response).
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Whether the error came from the broker substrate (maps to a 5xx response).
    pub fn is_broker_error(&self) -> bool {
        matches!(self, Self::BrokerUnavailable(_) | Self::Broker(_))
    }
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_timeout()
        {
            Self::BrokerUnavailable(err.to_string())
        } else {
            Self::Broker(err.to_string())
        }
    }
}
