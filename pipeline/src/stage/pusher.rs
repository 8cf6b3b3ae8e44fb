//! Sink pusher
//!
//! Reports the reducer's latest snapshot to a [`Sink`] on its own cadence.
//!
//! ```text
//! IDLE ─► CHECK_CHANGED ─┬─► SKIP ───────────────────────────► IDLE
//!                        └─► PUSH (sink retries) ─┬─► SUCCESS ─► IDLE
//!                                                 └─► EXHAUSTED ► IDLE
//! ```
//!
//! A cycle whose total equals the last considered total is skipped. The
//! total is recorded as considered before the push, so a snapshot whose
//! push is exhausted is not retried on the next cycle unless the total moves.

use super::reducer::GlobalAggregate;
use crate::metrics::Metrics;
use deluge_core::{DeviceConfig, Sink, StageError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// What one push cycle did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// Total unchanged since the last considered cycle
    Skipped,
    /// Serialized but not pushed
    DryRun,
    /// Sink accepted the snapshot
    Pushed {
        /// Version returned by the sink
        version: i64,
    },
    /// Every attempt failed
    Exhausted {
        /// Last error
        error: StageError,
    },
}

impl PushOutcome {
    /// Metric label
    pub fn label(&self) -> &'static str {
        match self {
            PushOutcome::Skipped => "skipped",
            PushOutcome::DryRun => "dry_run",
            PushOutcome::Pushed { .. } => "pushed",
            PushOutcome::Exhausted { .. } => "exhausted",
        }
    }
}

/// Periodic snapshot reporter
pub struct SinkPusher {
    aggregate: Arc<GlobalAggregate>,
    sink: Arc<dyn Sink>,
    interval: Duration,
    dry_run: bool,
    last_total: Mutex<i64>,
    last_outcome: Mutex<Option<PushOutcome>>,
    last_push: Mutex<Option<PushOutcome>>,
}

impl SinkPusher {
    /// Pusher reading `aggregate` every `interval`
    ///
    /// Retries belong to the sink; wrap it in
    /// [`RetrySink`](crate::sink::RetrySink) for the bounded retry policy.
    pub fn new(aggregate: Arc<GlobalAggregate>, sink: Arc<dyn Sink>, interval: Duration) -> Self {
        Self {
            aggregate,
            sink,
            interval,
            dry_run: false,
            last_total: Mutex::new(0),
            last_outcome: Mutex::new(None),
            last_push: Mutex::new(None),
        }
    }

    /// Serialize snapshots without pushing them
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Outcome of the most recent cycle
    pub fn last_outcome(&self) -> Option<PushOutcome> {
        self.last_outcome.lock().clone()
    }

    /// Outcome of the most recent cycle that was not skipped
    ///
    /// Skipped cycles leave it alone, so an exhausted push stays visible
    /// until a later total is pushed.
    pub fn last_push(&self) -> Option<PushOutcome> {
        self.last_push.lock().clone()
    }

    /// Whether the sink reports itself reachable
    pub async fn sink_healthy(&self) -> bool {
        self.sink.health().await
    }

    /// Run one cycle
    pub async fn tick(&self) -> PushOutcome {
        let outcome = self.cycle().await;
        if let Some(metrics) = Metrics::get() {
            metrics.record_sink_cycle(outcome.label());
        }
        if outcome != PushOutcome::Skipped {
            *self.last_push.lock() = Some(outcome.clone());
        }
        *self.last_outcome.lock() = Some(outcome.clone());
        outcome
    }

    async fn cycle(&self) -> PushOutcome {
        let snapshot = self.aggregate.snapshot();
        {
            let mut last = self.last_total.lock();
            if snapshot.total == *last {
                return PushOutcome::Skipped;
            }
            *last = snapshot.total;
        }

        info!(mps = ?snapshot.mps, total = snapshot.total, "reporting snapshot");

        let config = match DeviceConfig::from_snapshot(&snapshot) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "failed to serialize snapshot");
                return PushOutcome::Exhausted { error: e };
            }
        };

        if self.dry_run {
            return PushOutcome::DryRun;
        }

        let started = Instant::now();
        let result = self.sink.push(&config).await;
        if let Some(metrics) = Metrics::get() {
            metrics
                .sink_push_duration_seconds
                .observe(started.elapsed().as_secs_f64());
        }

        match result {
            Ok(version) => {
                info!(sink = self.sink.name(), version = version, "snapshot pushed");
                if let Some(metrics) = Metrics::get() {
                    metrics.sink_version.set(version as f64);
                }
                PushOutcome::Pushed { version }
            }
            Err(e) => {
                error!(
                    sink = self.sink.name(),
                    total = snapshot.total,
                    error = %e,
                    "snapshot push exhausted"
                );
                PushOutcome::Exhausted { error: e }
            }
        }
    }

    /// Spawn the push loop
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        super::every("pusher", self.interval, shutdown, move || {
            let this = Arc::clone(&this);
            async move {
                this.tick().await;
            }
        })
    }
}
