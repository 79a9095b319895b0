//! Error types for the write engine.

use search_names::NamesError;
use thiserror::Error;

/// Errors raised by the write engine and store client.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Transport-level HTTP failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Backend answered with an unexpected status
    #[error("Backend error {status}: {body}")]
    Backend { status: u16, body: String },

    /// External-version write rejected: an equal-or-newer version is
    /// already stored. Not a failure; callers treat it as a skip.
    #[error("Version conflict")]
    VersionConflict,

    /// Response body did not decode
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Name store failure
    #[error("Name store error: {0}")]
    Names(#[from] NamesError),

    /// Bounded retries exhausted for an operation
    #[error("Retries exhausted for {operation}: {last}")]
    RetriesExhausted { operation: String, last: String },

    /// Backend version below the supported minimum
    #[error("Unsupported backend version {0}")]
    UnsupportedBackend(String),

    /// Shutdown requested while waiting
    #[error("Cancelled")]
    Cancelled,
}

impl EngineError {
    /// Whether a retry could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Http(_) => true,
            EngineError::Backend { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}
