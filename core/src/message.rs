//! Bus message envelope
//!
//! A [`Message`] is what a subscription delivers to a handler: opaque
//! payload bytes plus the few fields the bus itself assigns. Payloads use
//! `Bytes`, so fanning one publish out to several subscriptions only bumps
//! a refcount.

use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

/// Compact message identifier (binary ULID, 16 bytes, Copy)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(ulid::Ulid);

impl MessageId {
    /// Generate a new unique ID
    #[inline]
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self.0)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A delivered bus message
///
/// # Example
///
/// ```
/// use bytes::Bytes;
/// use deluge_core::Message;
///
/// let msg = Message::new("mapper", Bytes::from_static(b"3"));
/// assert_eq!(msg.topic(), "mapper");
/// assert_eq!(msg.data_str(), Some("3"));
/// ```
#[derive(Debug, Clone)]
pub struct Message {
    /// Unique identifier assigned at publish time
    pub id: MessageId,

    /// Topic the message was published to
    topic: Arc<str>,

    /// Opaque payload
    pub data: Bytes,
}

impl Message {
    /// Create a message stamped with a fresh ID
    pub fn new(topic: impl Into<Arc<str>>, data: Bytes) -> Self {
        Self {
            id: MessageId::new(),
            topic: topic.into(),
            data,
        }
    }

    /// Topic name
    #[inline]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Payload as a string slice (if valid UTF-8)
    pub fn data_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }
}
