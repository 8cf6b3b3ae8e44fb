//! Reducer: global aggregation
//!
//! Any number of mappers feed [`CountVector`]s in; each is added slot by
//! slot into atomic counters. Once per window the counters are drained into
//! the per-knob rate (`mps`) and the window sum is added to the running
//! total. The total only grows.

use crate::metrics::Metrics;
use async_trait::async_trait;
use deluge_core::{
    AtomicCounters, CountVector, Message, MessageHandler, SinkSnapshot, StageError, WirePayload,
};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

const STAGE: &str = "reducer";

/// Per-knob rate and running total
pub struct GlobalAggregate {
    counters: AtomicCounters,
    state: RwLock<SinkSnapshot>,
}

impl GlobalAggregate {
    /// Empty aggregate for `knob_count` knobs
    pub fn new(knob_count: usize) -> Self {
        Self {
            counters: AtomicCounters::new(knob_count),
            state: RwLock::new(SinkSnapshot {
                mps: vec![0; knob_count],
                total: 0,
            }),
        }
    }

    /// Add one mapper's counts
    ///
    /// Vectors of the wrong length or with negative counts are rejected
    /// whole; nothing is added.
    pub fn absorb(&self, vector: &CountVector) -> Result<(), StageError> {
        if vector.messages.len() != self.counters.len() {
            return Err(StageError::Decode(format!(
                "count vector has {} entries, expected {}",
                vector.messages.len(),
                self.counters.len()
            )));
        }
        if vector.messages.iter().any(|n| *n < 0) {
            return Err(StageError::Decode("count vector has negative counts".into()));
        }
        self.counters.add_all(&vector.messages);
        Ok(())
    }

    /// Close the current window
    ///
    /// Drained counts become `mps`; their sum is added to `total`.
    pub fn rollup(&self) -> SinkSnapshot {
        let mps = self.counters.drain();
        let sum = mps.iter().fold(0i64, |acc, n| acc.saturating_add(*n));

        let snapshot = {
            let mut state = self.state.write();
            state.mps = mps;
            state.total = state.total.saturating_add(sum);
            state.clone()
        };

        debug!(mps = ?snapshot.mps, total = snapshot.total, "reducer window closed");
        if let Some(metrics) = Metrics::get() {
            if sum > 0 {
                metrics.record_window(STAGE, sum);
            }
            metrics.set_running_total(snapshot.total);
        }
        snapshot
    }

    /// Latest closed window and running total
    pub fn snapshot(&self) -> SinkSnapshot {
        self.state.read().clone()
    }

    /// Running total
    pub fn total(&self) -> i64 {
        self.state.read().total
    }
}

/// Reducer stage: absorbs count vectors into a [`GlobalAggregate`]
pub struct Reducer {
    aggregate: Arc<GlobalAggregate>,
    window: Duration,
}

impl Reducer {
    /// Reducer over a shared aggregate, closing windows every `window`
    pub fn new(aggregate: Arc<GlobalAggregate>, window: Duration) -> Self {
        Self { aggregate, window }
    }

    /// The aggregate this reducer feeds
    pub fn aggregate(&self) -> &Arc<GlobalAggregate> {
        &self.aggregate
    }

    /// Spawn the rollup loop
    pub fn spawn_windows(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let aggregate = Arc::clone(&self.aggregate);
        super::every(STAGE, self.window, shutdown, move || {
            let aggregate = Arc::clone(&aggregate);
            async move {
                aggregate.rollup();
            }
        })
    }
}

#[async_trait]
impl MessageHandler for Reducer {
    async fn handle(&self, msg: &Message) -> Result<(), StageError> {
        let result =
            CountVector::decode(&msg.data).and_then(|vector| self.aggregate.absorb(&vector));
        if result.is_err() {
            if let Some(metrics) = Metrics::get() {
                metrics.record_dropped(STAGE, "malformed");
            }
        }
        result
    }
}
