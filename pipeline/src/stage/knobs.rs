//! Knob state aggregator
//!
//! Keeps the latest intent per knob, ordered by the update's own timestamp
//! rather than arrival order, and turns the table into a [`FloodVector`]
//! once per window.
//!
//! An update replaces the stored one only when its `ts` is strictly greater.
//! Equal timestamps are stale.

use crate::metrics::Metrics;
use async_trait::async_trait;
use deluge_core::{FloodVector, KnobUpdate, Message, MessageHandler, StageError, Topic, WirePayload};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const STAGE: &str = "knobs";

/// How a stored intent becomes a per-window count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DerivationPolicy {
    /// Emit the stored intent verbatim
    #[default]
    PassThrough,
    /// Treat the intent as a per-second rate: `intent × window_secs`,
    /// truncated toward zero
    RateScaled,
}

impl DerivationPolicy {
    /// Per-window count for one knob
    pub fn derive(self, intent: i64, window: Duration) -> i64 {
        match self {
            DerivationPolicy::PassThrough => intent,
            DerivationPolicy::RateScaled => (intent as f64 * window.as_secs_f64()).trunc() as i64,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct KnobSlot {
    intent: i64,
    ts: f64,
}

/// Latest-by-timestamp intent per knob
///
/// Each slot has its own lock, so updates to different knobs never contend.
pub struct KnobTable {
    slots: Box<[Mutex<KnobSlot>]>,
}

impl KnobTable {
    /// All-zero table with `len` knobs
    pub fn new(len: usize) -> Self {
        Self {
            slots: (0..len).map(|_| Mutex::new(KnobSlot::default())).collect(),
        }
    }

    /// Number of knobs
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the table has no knobs
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Store `intent` for `id` if `ts` is newer than what is stored
    ///
    /// Returns `false` for stale updates and out-of-range ids.
    pub fn update(&self, id: usize, intent: i64, ts: f64) -> bool {
        let Some(slot) = self.slots.get(id) else {
            return false;
        };
        let mut slot = slot.lock();
        if ts > slot.ts {
            *slot = KnobSlot { intent, ts };
            true
        } else {
            false
        }
    }

    /// Stored `(intent, ts)` for `id`
    pub fn get(&self, id: usize) -> Option<(i64, f64)> {
        self.slots.get(id).map(|slot| {
            let slot = slot.lock();
            (slot.intent, slot.ts)
        })
    }

    /// Current intents, index = knob id
    pub fn intents(&self) -> Vec<i64> {
        self.slots.iter().map(|slot| slot.lock().intent).collect()
    }

    /// Derive this window's amplification vector
    pub fn derive(&self, policy: DerivationPolicy, window: Duration) -> FloodVector {
        FloodVector::new(
            self.intents()
                .into_iter()
                .map(|intent| policy.derive(intent, window))
                .collect(),
        )
    }
}

/// Aggregator stage: handles knob updates and emits flood vectors
pub struct KnobAggregator {
    table: KnobTable,
    policy: DerivationPolicy,
    window: Duration,
    output: Arc<dyn Topic>,
}

impl KnobAggregator {
    /// Aggregator for `knob_count` knobs publishing to `output`
    pub fn new(
        knob_count: usize,
        policy: DerivationPolicy,
        window: Duration,
        output: Arc<dyn Topic>,
    ) -> Self {
        Self {
            table: KnobTable::new(knob_count),
            policy,
            window,
            output,
        }
    }

    /// Current knob table
    pub fn table(&self) -> &KnobTable {
        &self.table
    }

    /// Validate and apply one update
    ///
    /// Returns whether the update replaced the stored value.
    pub fn apply(&self, update: KnobUpdate) -> Result<bool, StageError> {
        let id = usize::try_from(update.id)
            .ok()
            .filter(|id| *id < self.table.len())
            .ok_or_else(|| {
                StageError::Decode(format!(
                    "knob id {} out of range [0, {})",
                    update.id,
                    self.table.len()
                ))
            })?;

        let applied = self.table.update(id, update.n, update.ts);
        if applied {
            debug!(knob = id, intent = update.n, ts = update.ts, "knob updated");
            if let Some(metrics) = Metrics::get() {
                metrics.set_knob_intent(id, update.n);
            }
        } else {
            debug!(knob = id, ts = update.ts, "stale knob update ignored");
        }
        Ok(applied)
    }

    /// Derive and publish one window
    ///
    /// Returns the vector if it was emitted. Vectors summing to zero are not.
    pub async fn emit_window(&self) -> Option<FloodVector> {
        let vector = self.table.derive(self.policy, self.window);
        let sum = vector.sum();
        if sum == 0 {
            return None;
        }

        let payload = match vector.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "failed to encode flood vector");
                return None;
            }
        };

        match self.output.publish(payload).await {
            Ok(_) => {
                info!(ns = ?vector.ns, sum = sum, "flood vector emitted");
                if let Some(metrics) = Metrics::get() {
                    metrics.record_window(STAGE, sum);
                }
                Some(vector)
            }
            Err(e) => {
                warn!(topic = self.output.name(), error = %e, "failed to publish flood vector");
                if let Some(metrics) = Metrics::get() {
                    metrics.record_publish_failures(self.output.name(), 1);
                }
                None
            }
        }
    }

    /// Spawn the window loop
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
impl MessageHandler for KnobAggregator {
    async fn handle(&self, msg: &Message) -> Result<(), StageError> {
        let result = KnobUpdate::decode(&msg.data).and_then(|update| self.apply(update));
        if result.is_err() {
            if let Some(metrics) = Metrics::get() {
                metrics.record_dropped(STAGE, "malformed");
            }
        }
        result.map(|_| ())
    }
}
