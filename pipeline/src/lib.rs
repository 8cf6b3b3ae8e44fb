//! deluge - a load-amplification pipeline
//!
//! Knob intents go in one end, a flood of single-knob events runs through
//! the middle, and per-knob rates plus a running total come out the other
//! end into a remote device config.
//!
//! # Stages
//!
//! ```text
//! KnobSource ──► KnobAggregator ──► Amplifier ──► Counter ──► Reducer ──► SinkPusher
//!   updates        FloodVector       TaggedEvent   CountVector  snapshot     Sink
//! ```
//!
//! Stages only talk over the bus ([`deluge_core::Bus`]). Counting is
//! at-least-once and tolerates duplicates; windows are wall-clock based.

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod bus;
pub mod config;
pub mod error;
pub mod metrics;
pub mod metrics_server;
pub mod pipeline;
pub mod sink;
pub mod stage;

pub use bus::{DeliverySnapshot, MemoryBus};
pub use config::{Config, DevicePath, LogFormat, Role, SimulationConfig, TopicNames};
pub use error::{DelugeError, Result, StageError};
pub use metrics::Metrics;
pub use metrics_server::{HealthSources, MetricsServer};
pub use pipeline::{Pipeline, RunningPipeline};
pub use sink::{HttpSink, LogSink, RetryPolicy, RetrySink, build_sink};
pub use stage::flood::{Amplified, Amplifier};
pub use stage::knobs::{DerivationPolicy, KnobAggregator, KnobTable};
pub use stage::mapper::Counter;
pub use stage::pusher::{PushOutcome, SinkPusher};
pub use stage::reducer::{GlobalAggregate, Reducer};
pub use stage::source::{KnobSimulator, KnobSource, LoadShape, SimulatorHandle};
