//! Convenience re-exports for embedding the pipeline.
//!
//! ```rust
//! use deluge_runtime::prelude::*;
//! ```

// Core types
pub use deluge_core::{
    Bus, CountVector, DeviceConfig, FloodVector, KnobUpdate, Message, MessageHandler, Sink,
    SinkSnapshot, StageError, Subscription, TaggedEvent, Topic,
};

// Pipeline
pub use deluge_pipeline::{Config, Pipeline, Role, RunningPipeline};

// Bus and sinks
pub use deluge_pipeline::{HttpSink, LogSink, MemoryBus, RetryPolicy, RetrySink};

// Error types
pub use deluge_pipeline::DelugeError;

// Runtime
pub use crate::RuntimeBuilder;
