//! Knob source
//!
//! [`KnobSource`] publishes intent updates when something external sets a
//! knob. [`KnobSimulator`] drives a source with synthetic load: every knob
//! gets its own cadence, and on shutdown every knob is driven back to zero
//! so downstream stages stop amplifying.

use crate::config::SimulationConfig;
use crate::error::{DelugeError, Result};
use crate::metrics::Metrics;
use deluge_core::{KnobUpdate, StageError, Topic, WirePayload};
use std::f64::consts::PI;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Shape of simulated load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadShape {
    /// Every knob holds the amplitude
    #[default]
    Constant,
    /// Each knob traces a half sine between 0 and the amplitude
    Sine,
}

impl FromStr for LoadShape {
    type Err = DelugeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "constant" => Ok(LoadShape::Constant),
            "sine" | "sin" => Ok(LoadShape::Sine),
            other => Err(DelugeError::Config(format!("unknown load shape '{other}'"))),
        }
    }
}

impl LoadShape {
    /// Intent for `knob` at wall-clock `now` seconds
    ///
    /// Sine knobs have period `(knob + 1) × cycle` and value
    /// `amplitude × sin(π × (now mod period) / period)`, truncated.
    pub fn intent(self, amplitude: i64, knob: usize, cycle: Duration, now: f64) -> i64 {
        match self {
            LoadShape::Constant => amplitude,
            LoadShape::Sine => {
                let period = cycle.as_secs_f64() * (knob as f64 + 1.0);
                if period <= 0.0 {
                    return 0;
                }
                let phase = now.rem_euclid(period);
                (amplitude as f64 * (PI * phase / period).sin()) as i64
            }
        }
    }
}

/// Publishes knob intent updates
pub struct KnobSource {
    knob_count: usize,
    output: Arc<dyn Topic>,
}

impl KnobSource {
    /// Source for `knob_count` knobs publishing to `output`
    pub fn new(knob_count: usize, output: Arc<dyn Topic>) -> Self {
        Self { knob_count, output }
    }

    /// Number of knobs
    pub fn knob_count(&self) -> usize {
        self.knob_count
    }

    /// Set knob `id` to `intent`, stamped with the current time
    pub async fn set(&self, id: usize, intent: i64) -> std::result::Result<KnobUpdate, StageError> {
        if id >= self.knob_count {
            return Err(StageError::Decode(format!(
                "knob id {id} out of range [0, {})",
                self.knob_count
            )));
        }
        let update = KnobUpdate::now(id, intent);
        self.publish(update).await?;
        Ok(update)
    }

    /// Publish a pre-stamped update as is
    pub async fn publish(&self, update: KnobUpdate) -> std::result::Result<(), StageError> {
        let payload = update.encode()?;
        self.output.publish(payload).await.map(|_| ())
    }
}

/// Synthetic load generator over a [`KnobSource`]
pub struct KnobSimulator {
    source: Arc<KnobSource>,
    config: SimulationConfig,
    grace: Duration,
}

impl KnobSimulator {
    /// Simulator with the given load settings and shutdown grace delay
    pub fn new(source: Arc<KnobSource>, config: SimulationConfig, grace: Duration) -> Self {
        Self {
            source,
            config,
            grace,
        }
    }

    /// Start one publishing task per knob
    ///
    /// Knob `i` publishes every `(i + 1) × interval`.
    pub fn start(self) -> SimulatorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let knob_count = self.source.knob_count();

        let tasks = (0..knob_count)
            .map(|knob| {
                let period = self.config.interval * (knob as u32 + 1);
                let source = Arc::clone(&self.source);
                let config = self.config.clone();
                super::every("simulate", period, shutdown_rx.clone(), move || {
                    let source = Arc::clone(&source);
                    let intent = config.shape.intent(
                        config.amplitude,
                        knob,
                        config.cycle,
                        deluge_core::wire::unix_seconds(),
                    );
                    async move {
                        match source.set(knob, intent).await {
                            Ok(_) => debug!(knob = knob, intent = intent, "simulated update"),
                            Err(e) => {
                                warn!(knob = knob, error = %e, "failed to publish simulated update");
                                if let Some(metrics) = Metrics::get() {
                                    metrics.record_publish_failures(source.output.name(), 1);
                                }
                            }
                        }
                    }
                })
            })
            .collect();

        info!(
            knobs = knob_count,
            shape = ?self.config.shape,
            amplitude = self.config.amplitude,
            "knob simulator started"
        );

        SimulatorHandle {
            shutdown_tx,
            tasks,
            source: self.source,
            grace: self.grace,
        }
    }
}

/// Running simulator
pub struct SimulatorHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    source: Arc<KnobSource>,
    grace: Duration,
}

impl SimulatorHandle {
    /// Stop publishing, zero every knob, then wait out the grace delay
    ///
    /// In-flight publishes finish before the zero updates go out, so a zero
    /// is always the last value each knob publishes.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "simulator task failed during shutdown");
            }
        }

        let mut failed = 0usize;
        for knob in 0..self.source.knob_count() {
            if let Err(e) = self.source.set(knob, 0).await {
                failed += 1;
                warn!(knob = knob, error = %e, "failed to publish zero update");
            }
        }

        info!(
            grace_ms = self.grace.as_millis() as u64,
            "simulator stopped, waiting for publishes to flush"
        );
        tokio::time::sleep(self.grace).await;

        if failed > 0 {
            return Err(DelugeError::Bus(format!(
                "{failed} zero updates could not be published"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use deluge_core::MessageId;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct CaptureTopic(Mutex<Vec<KnobUpdate>>);

    #[async_trait]
    impl Topic for CaptureTopic {
        fn name(&self) -> &str {
            "knobs"
        }

        async fn publish(&self, data: Bytes) -> std::result::Result<MessageId, StageError> {
            self.0.lock().push(KnobUpdate::decode(&data)?);
            Ok(MessageId::new())
        }
    }

    #[test]
    fn test_load_shape_parse() {
        assert_eq!("constant".parse::<LoadShape>().unwrap(), LoadShape::Constant);
        assert_eq!("SINE".parse::<LoadShape>().unwrap(), LoadShape::Sine);
        assert!("square".parse::<LoadShape>().is_err());
    }

    #[test]
    fn test_sine_intent() {
        let cycle = Duration::from_secs(20);
        // Knob 0: period 20s, peak at 10s
        assert_eq!(LoadShape::Sine.intent(10_000, 0, cycle, 10.0), 10_000);
        assert_eq!(LoadShape::Sine.intent(10_000, 0, cycle, 0.0), 0);
        // Knob 1: period 40s, 10s in is sin(π/4)
        assert_eq!(LoadShape::Sine.intent(10_000, 1, cycle, 50.0), 7071);
        assert_eq!(LoadShape::Constant.intent(10_000, 3, cycle, 123.0), 10_000);
    }

    #[tokio::test]
    async fn test_set_publishes_stamped_update() {
        let topic = Arc::new(CaptureTopic::default());
        let source = KnobSource::new(5, topic.clone());

        let update = source.set(2, 40).await.unwrap();
        assert_eq!(update.id, 2);
        assert_eq!(update.n, 40);
        assert!(update.ts > 0.0);
        assert_eq!(topic.0.lock().as_slice(), &[update]);
    }

    #[tokio::test]
    async fn test_set_rejects_unknown_knob() {
        let topic = Arc::new(CaptureTopic::default());
        let source = KnobSource::new(5, topic.clone());
        assert!(source.set(5, 1).await.is_err());
        assert!(topic.0.lock().is_empty());
    }

    #[tokio::test]
    async fn test_simulator_ends_every_knob_at_zero() {
        let topic = Arc::new(CaptureTopic::default());
        let source = Arc::new(KnobSource::new(3, topic.clone()));
        let config = SimulationConfig {
            shape: LoadShape::Constant,
            amplitude: 42,
            interval: Duration::from_millis(10),
            cycle: Duration::from_secs(1),
        };

        let handle = KnobSimulator::new(source, config, Duration::from_millis(10)).start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown().await.unwrap();

        let updates = topic.0.lock();
        assert!(updates.iter().any(|u| u.n == 42));
        for knob in 0..3 {
            let last = updates.iter().rev().find(|u| u.id == knob).unwrap();
            assert_eq!(last.n, 0, "knob {knob} did not end at zero");
        }

        // Knob 0 publishes more often than knob 2
        let count = |id| updates.iter().filter(|u| u.id == id && u.n == 42).count();
        assert!(count(0) > count(2));
    }
}
