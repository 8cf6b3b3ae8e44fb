//! Mapper: concurrent per-knob event counter
//!
//! Many deliveries increment the counters at once; a periodic rollup swaps
//! every slot with zero and publishes the drained counts as a
//! [`CountVector`]. An event racing the swap lands in either this window or
//! the next, never both and never neither.

use crate::metrics::Metrics;
use async_trait::async_trait;
use deluge_core::{
    AtomicCounters, CountVector, Message, MessageHandler, StageError, TaggedEvent, Topic,
    WirePayload,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const STAGE: &str = "mapper";

/// Mapper stage
pub struct Counter {
    counters: AtomicCounters,
    window: Duration,
    output: Arc<dyn Topic>,
}

impl Counter {
    /// Counter for `knob_count` knobs publishing to `output` every `window`
    pub fn new(knob_count: usize, window: Duration, output: Arc<dyn Topic>) -> Self {
        Self {
            counters: AtomicCounters::new(knob_count),
            window,
            output,
        }
    }

    /// Count one encoded event, returning its knob id
    pub fn record(&self, data: &[u8]) -> Result<usize, StageError> {
        let TaggedEvent(id) = TaggedEvent::decode(data)?;
        if !self.counters.add(id, 1) {
            return Err(StageError::Decode(format!(
                "knob id {id} out of range [0, {})",
                self.counters.len()
            )));
        }
        Ok(id)
    }

    /// Counts since the last rollup, without resetting them
    pub fn pending(&self) -> Vec<i64> {
        self.counters.peek()
    }

    /// Drain the counters; `None` when nothing was counted
    pub fn rollup(&self) -> Option<CountVector> {
        let vector = CountVector::new(self.counters.drain());
        (vector.sum() > 0).then_some(vector)
    }

    /// Drain and publish one window
    pub async fn emit_window(&self) -> Option<CountVector> {
        let vector = self.rollup()?;
        let sum = vector.sum();

        let payload = match vector.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "failed to encode count vector");
                return None;
            }
        };

        match self.output.publish(payload).await {
            Ok(_) => {
                debug!(messages = ?vector.messages, sum = sum, "count vector emitted");
                if let Some(metrics) = Metrics::get() {
                    metrics.record_window(STAGE, sum);
                }
                Some(vector)
            }
            Err(e) => {
                warn!(
                    topic = self.output.name(),
                    lost = sum,
                    error = %e,
                    "failed to publish count vector"
                );
                if let Some(metrics) = Metrics::get() {
                    metrics.record_publish_failures(self.output.name(), 1);
                }
                None
            }
        }
    }

    /// Spawn the rollup loop
    pub fn spawn_windows(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        super::every(STAGE, self.window, shutdown, move || {
            let this = Arc::clone(&this);
            async move {
                this.emit_window().await;
            }
        })
    }
}

#[async_trait]
impl MessageHandler for Counter {
    async fn handle(&self, msg: &Message) -> Result<(), StageError> {
        let result = self.record(&msg.data);
        if result.is_err() {
            if let Some(metrics) = Metrics::get() {
                metrics.record_dropped(STAGE, "malformed");
            }
        }
        result.map(|_| ())
    }
}
