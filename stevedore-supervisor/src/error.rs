//! Supervisor error types

use thiserror::Error;

/// Supervisor errors
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// A child process could not be started
    #[error("Failed to spawn worker process: {0}")]
    Spawn(String),

    /// The shared listener could not be bound or prepared
    #[error("Listener error: {0}")]
    Listener(String),

    /// A signal could not be delivered
    #[error("Failed to signal process {pid}: {message}")]
    Signal { pid: u32, message: String },

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for supervisor operations
pub type Result<T> = std::result::Result<T, SupervisorError>;
