//! Amplifier
//!
//! Turns each [`FloodVector`] into `Σn` single-knob events: for knob `i`
//! with `n > 0`, exactly `n` [`TaggedEvent`]s tagged `i`. There is no
//! burst bound; publishing goes as fast as the output topic accepts.

use crate::metrics::Metrics;
use async_trait::async_trait;
use deluge_core::{FloodVector, Message, MessageHandler, StageError, TaggedEvent, Topic, WirePayload};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const STAGE: &str = "flood";

/// Result of amplifying one vector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Amplified {
    /// Events accepted by the output topic
    pub sent: u64,
    /// Events the output topic rejected
    pub failed: u64,
    /// Events skipped because shutdown was requested mid-vector
    pub skipped: u64,
}

/// Amplifier stage
pub struct Amplifier {
    knob_count: usize,
    output: Arc<dyn Topic>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl Amplifier {
    /// Amplifier for `knob_count` knobs publishing to `output`
    pub fn new(knob_count: usize, output: Arc<dyn Topic>) -> Self {
        Self {
            knob_count,
            output,
            shutdown: None,
        }
    }

    /// Stop issuing events once `shutdown` flips to `true`
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    fn stopping(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Publish the events for one vector
    ///
    /// Individual publish failures are counted and logged, never retried.
    /// Vectors of the wrong length are rejected before anything is sent.
    pub async fn amplify(&self, vector: &FloodVector) -> Result<Amplified, StageError> {
        if vector.ns.len() != self.knob_count {
            return Err(StageError::Decode(format!(
                "flood vector has {} entries, expected {}",
                vector.ns.len(),
                self.knob_count
            )));
        }

        let planned = vector.emit_count();
        debug!(ns = ?vector.ns, events = planned, "amplifying flood vector");

        let mut result = Amplified::default();
        let mut first_error = None;

        'knobs: for (id, &n) in vector.ns.iter().enumerate() {
            if n <= 0 {
                continue;
            }
            let event = TaggedEvent(id).encode();
            for _ in 0..n {
                if self.stopping() {
                    break 'knobs;
                }
                match self.output.publish(event.clone()).await {
                    Ok(_) => result.sent += 1,
                    Err(e) => {
                        result.failed += 1;
                        debug!(knob = id, error = %e, "event publish failed");
                        first_error.get_or_insert(e);
                    }
                }
            }
        }
        result.skipped = planned - result.sent - result.failed;

        if let Some(e) = first_error {
            warn!(
                topic = self.output.name(),
                failed = result.failed,
                error = %e,
                "event publishes failed"
            );
            if let Some(metrics) = Metrics::get() {
                metrics.record_publish_failures(self.output.name(), result.failed);
            }
        }
        if result.skipped > 0 {
            info!(skipped = result.skipped, "amplification cut short by shutdown");
        }
        if result.sent > 0 {
            info!(ns = ?vector.ns, sent = result.sent, "flood vector amplified");
            if let Some(metrics) = Metrics::get() {
                metrics.record_window(STAGE, result.sent as i64);
            }
        }
        Ok(result)
    }
}

#[async_trait]
impl MessageHandler for Amplifier {
    async fn handle(&self, msg: &Message) -> Result<(), StageError> {
        let result = match FloodVector::decode(&msg.data) {
            Ok(vector) => self.amplify(&vector).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if result.is_err() {
            if let Some(metrics) = Metrics::get() {
                metrics.record_dropped(STAGE, "malformed");
            }
        }
        result
    }
}
