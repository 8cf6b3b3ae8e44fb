//! Error types for deluge

use thiserror::Error;

// Re-export StageError from deluge-core
pub use deluge_core::StageError;

/// Result type alias for deluge operations
pub type Result<T> = std::result::Result<T, DelugeError>;

/// Main error type for deluge
///
/// These surface at setup time. Once the pipeline runs, per-message and
/// per-window failures are `StageError`s that get logged, never returned.
#[derive(Error, Debug)]
pub enum DelugeError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Bus setup error (cannot get or create a topic/subscription)
    #[error("bus error: {0}")]
    Bus(String),

    /// Sink setup error
    #[error("sink '{sink}' error: {message}")]
    Sink { sink: String, message: String },

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Metrics error
    #[error("metrics error: {0}")]
    Metrics(String),
}

impl From<StageError> for DelugeError {
    fn from(err: StageError) -> Self {
        match err {
            StageError::Decode(msg) => DelugeError::Serialization(msg),
            other => DelugeError::Bus(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for DelugeError {
    fn from(err: serde_json::Error) -> Self {
        DelugeError::Serialization(err.to_string())
    }
}
