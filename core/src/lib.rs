//! deluge-core - Core types for the deluge load pipeline
//!
//! This crate holds everything the pipeline stages and external adapters
//! share:
//!
//! - [`wire`] - JSON payloads exchanged between stages, plus the hex-encoded
//!   [`TaggedEvent`]
//! - [`Bus`], [`Topic`], [`Subscription`] - the message bus interface
//! - [`AckGuard`] - acknowledge-on-every-path delivery guard
//! - [`Sink`] and [`DeviceConfig`] - the remote config surface
//! - [`AtomicCounters`] - lock-free per-knob counters with read-and-reset
//! - [`StageError`] - error type for bus, sink and decoding operations
//!
//! # Why this crate exists
//!
//! Bus and sink adapters only need the traits and payload types. Keeping
//! them here lets an adapter crate depend on `deluge-core` without pulling
//! in the stages, and lets `deluge-pipeline` optionally depend on adapters
//! without a cycle:
//!
//! ```text
//! deluge-core ◄── deluge-pipeline ◄── deluge-runtime
//!     ▲
//!     └────────── bus / sink adapters
//! ```

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]
#![warn(missing_docs)]

/// Message bus interface
pub mod bus;
/// Lock-free per-knob counters
pub mod counters;
mod error;
/// Bus message envelope
pub mod message;
/// Remote config sink interface
pub mod sink;
/// Stage payloads
pub mod wire;

pub use bus::{
    AckGuard, Acknowledge, Bus, MessageHandler, ReceiveSettings, Subscription, Topic, deliver,
};
pub use counters::AtomicCounters;
pub use error::StageError;
pub use message::{Message, MessageId};
pub use sink::{DeviceConfig, Sink};
pub use wire::{CountVector, FloodVector, KnobUpdate, SinkSnapshot, TaggedEvent, WirePayload};

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // StageError Tests
    // ==========================================================================

    #[test]
    fn test_stage_error_init_display() {
        let err = StageError::Init("topic 'knobs' unavailable".to_string());
        assert_eq!(err.to_string(), "initialization failed: topic 'knobs' unavailable");
    }

    #[test]
    fn test_stage_error_decode_display() {
        let err = StageError::Decode("invalid JSON".to_string());
        assert_eq!(err.to_string(), "decode failed: invalid JSON");
    }

    #[test]
    fn test_stage_error_push_display() {
        let err = StageError::Push("timeout".to_string());
        assert_eq!(err.to_string(), "push failed: timeout");
    }

    #[test]
    fn test_stage_error_closed_display() {
        let err = StageError::Closed("mapper".to_string());
        assert_eq!(err.to_string(), "closed: mapper");
    }

    #[test]
    fn test_stage_error_transient_classification() {
        assert!(StageError::Push("x".into()).is_transient());
        assert!(StageError::Publish("x".into()).is_transient());
        assert!(StageError::Connection("x".into()).is_transient());
        assert!(!StageError::Decode("x".into()).is_transient());
        assert!(!StageError::Init("x".into()).is_transient());
    }

    #[test]
    fn test_stage_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<StageError>();
    }

    // ==========================================================================
    // Trait object safety
    // ==========================================================================

    #[test]
    fn test_traits_are_object_safe() {
        fn _bus(_: &dyn Bus) {}
        fn _topic(_: &dyn Topic) {}
        fn _sub(_: &dyn Subscription) {}
        fn _handler(_: &dyn MessageHandler) {}
        fn _sink(_: &dyn Sink) {}
    }
}
