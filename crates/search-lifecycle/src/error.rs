//! Error types for the index lifecycle.

use search_engine::EngineError;
use search_source::SourceError;
use thiserror::Error;

/// Errors raised while managing index generations.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Write engine or store failure
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Upstream feed failure
    #[error(transparent)]
    Source(#[from] SourceError),

    /// Template file missing or malformed
    #[error("Template error: {0}")]
    Template(String),

    /// A generation failed its pre-promotion validation
    #[error("Generation {name} failed validation: {reason}")]
    Validation { name: String, reason: String },

    /// Reindex worker could not be spawned or managed
    #[error("Reindex worker error: {0}")]
    Worker(String),

    /// No current generation resolvable for a logical key
    #[error("No current index for {0}")]
    NoCurrentIndex(String),

    /// Shutdown requested while working
    #[error("Cancelled")]
    Cancelled,
}
