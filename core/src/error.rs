//! Error types for deluge stages

use thiserror::Error;

/// Error type for per-message and per-window stage operations
///
/// Every bus, sink and decoding primitive reports failures with this type.
/// Stages never let a `StageError` escape a message handler or a window
/// routine: it is logged and the message is acknowledged.
///
/// # Example
///
/// ```
/// use deluge_core::StageError;
///
/// fn push_config() -> Result<i64, StageError> {
///     Err(StageError::Push("503 Service Unavailable".to_string()))
/// }
///
/// match push_config() {
///     Ok(version) => println!("pushed version {version}"),
///     Err(e) if e.is_transient() => println!("will retry: {e}"),
///     Err(e) => println!("giving up: {e}"),
/// }
/// ```
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StageError {
    /// Setup failed
    ///
    /// Returned when a client, topic or subscription cannot be created.
    /// These are fatal at startup.
    #[error("initialization failed: {0}")]
    Init(String),

    /// Payload could not be decoded
    ///
    /// Examples: invalid JSON, missing field, knob id out of range.
    #[error("decode failed: {0}")]
    Decode(String),

    /// Publishing to a topic failed
    #[error("publish failed: {0}")]
    Publish(String),

    /// Pushing a document to the sink failed
    #[error("push failed: {0}")]
    Push(String),

    /// Connection error
    ///
    /// Examples: DNS lookup failed, connection refused, TLS handshake error.
    #[error("connection error: {0}")]
    Connection(String),

    /// The topic or subscription has been closed
    #[error("closed: {0}")]
    Closed(String),
}

impl StageError {
    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StageError::Publish(_) | StageError::Push(_) | StageError::Connection(_)
        )
    }
}
