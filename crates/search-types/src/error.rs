//! Error types shared across the search system.

use thiserror::Error;

/// Errors raised by the shared domain types.
#[derive(Debug, Error)]
pub enum TypesError {
    /// Configuration load or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Document envelope failed a consistency check
    #[error("Corrupt document {id}: {reason}")]
    CorruptDocument { id: String, reason: String },

    /// Timestamp could not be parsed
    #[error("Invalid timestamp {0:?}")]
    InvalidTimestamp(String),
}
