//! Error types for Yard
//!
//! One taxonomy shared by every layer. Variants line up with how a failure is
//! reported: rejected input, missing records, infrastructure commands,
//! timeouts and user cancellation. Quota exhaustion is a run outcome recorded
//! on the task, not an `Error`.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Yard error type
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Caller input
    // ========================================================================
    /// Caller-supplied data rejected before any side effect
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Task, run, environment or account missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// Request is illegal in the current state (e.g. a run is already in flight)
    #[error("Conflict: {0}")]
    Conflict(String),

    // ========================================================================
    // Execution
    // ========================================================================
    /// git / container-engine command failed with an unrecognized message
    #[error("{0}")]
    Infra(String),

    /// Command or readiness deadline elapsed; carries the last underlying error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Caller cancelled the operation (user stop)
    #[error("Cancelled")]
    Cancelled,

    // ========================================================================
    // Configuration / storage
    // ========================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    // ========================================================================
    // External error conversion
    // ========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error represents a caller-initiated cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidInput(message.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Internal(s.to_string())
    }
}
