//! Error types for feed sources.

use search_types::TypesError;
use thiserror::Error;

/// Errors raised while polling or fetching from an upstream feed.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Transport-level HTTP failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Feed answered with an unexpected status
    #[error("Feed error {status}: {body}")]
    Upstream { status: u16, body: String },

    /// Get-by-id for a listed reference came back 404
    #[error("Document {id} not found upstream")]
    NotFound { id: String },

    /// Fetched document disagrees with the reference that listed it
    #[error("Document {id} inconsistent: {reason}")]
    Inconsistent { id: String, reason: String },

    /// Document body did not parse or did not carry the required fields
    #[error(transparent)]
    Types(#[from] TypesError),

    /// Response body did not decode
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Shutdown requested while waiting
    #[error("Cancelled")]
    Cancelled,
}
