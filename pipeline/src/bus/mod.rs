//! Bus implementations
//!
//! The stages only depend on the [`deluge_core::Bus`] traits. [`MemoryBus`]
//! runs every stage in one process; hosted transports implement the same
//! traits in their own crates.

mod memory;

pub use memory::{DeliverySnapshot, MemoryBus, MemorySubscription, MemoryTopic};
