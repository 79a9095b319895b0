//! Error types for the name store.

use thiserror::Error;

/// Errors raised by the name store and heartbeat file.
#[derive(Debug, Error)]
pub enum NamesError {
    /// File read/write failed
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Store file could not be parsed
    #[error("Malformed name store {path}: {reason}")]
    Malformed { path: String, reason: String },

    /// Heartbeat file held something other than a timestamp
    #[error("Malformed heartbeat value {0:?}")]
    MalformedHeartbeat(String),
}

impl NamesError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        NamesError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}
