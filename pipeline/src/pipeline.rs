//! Pipeline - wires the stages onto a bus
//!
//! # Example
//!
//! ```ignore
//! use deluge_pipeline::{Config, Pipeline};
//!
//! let running = Pipeline::new(Config::from_env()?).start().await?;
//! tokio::signal::ctrl_c().await?;
//! running.shutdown().await?;
//! ```
//!
//! # Roles
//!
//! A process runs the stages its [`Role`] selects. `All` runs every stage
//! plus the simulator on one bus; the other roles run one stage each and
//! expect the rest of the pipeline elsewhere on a shared bus. A single-stage
//! role therefore needs a bus passed through [`Pipeline::bus`]; on the
//! default in-process bus nothing else could reach it, so `start` rejects it.
//!
//! ```text
//! Role::Simulate ──► knobs ──► Role::Knobs ──► flood ──► Role::Flood
//!                                                          │
//!            Role::Reduce ◄── reducer ◄── Role::Map ◄── mapper
//! ```
//!
//! Subscriptions are created before anything publishes, so nothing the
//! simulator emits is lost to a subscription that does not exist yet.

use crate::bus::MemoryBus;
use crate::config::{Config, Role};
use crate::error::{DelugeError, Result};
use crate::metrics_server::HealthSources;
use crate::sink::build_sink;
use crate::stage::flood::Amplifier;
use crate::stage::knobs::KnobAggregator;
use crate::stage::mapper::Counter;
use crate::stage::pusher::SinkPusher;
use crate::stage::reducer::{GlobalAggregate, Reducer};
use crate::stage::source::{KnobSimulator, KnobSource, SimulatorHandle};
use deluge_core::{Bus, MessageHandler, ReceiveSettings, Sink, Subscription};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Pipeline builder
pub struct Pipeline {
    config: Config,
    bus: Option<Arc<dyn Bus>>,
    sink: Option<Arc<dyn Sink>>,
    simulate: Option<bool>,
}

impl Pipeline {
    /// Pipeline for `config` on an in-process bus
    pub fn new(config: Config) -> Self {
        Self {
            config,
            bus: None,
            sink: None,
            simulate: None,
        }
    }

    /// Use `bus` instead of a fresh [`MemoryBus`]
    pub fn bus(mut self, bus: Arc<dyn Bus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Push snapshots to `sink` as is, instead of the configured sink
    ///
    /// The sink is used without a retry wrapper.
    pub fn sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Override whether the simulator runs
    ///
    /// By default it runs for `Role::All` and `Role::Simulate`. Turn it off
    /// to drive knobs through [`RunningPipeline::source`].
    pub fn simulate(mut self, simulate: bool) -> Self {
        self.simulate = Some(simulate);
        self
    }

    /// Create topics and subscriptions, then start every selected stage
    pub async fn start(self) -> Result<RunningPipeline> {
        let config = self.config;
        config.validate()?;
        let role = config.role;
        let bus: Arc<dyn Bus> = match self.bus {
            Some(bus) => bus,
            None if role == Role::All => Arc::new(MemoryBus::new()),
            None => {
                return Err(DelugeError::Config(format!(
                    "DELUGE_ROLE={role:?} runs a single stage and needs a shared bus; \
                     the in-process bus only supports role 'all'"
                )));
            }
        };
        let runs = |stage: Role| role == Role::All || role == stage;
        let simulate = self
            .simulate
            .unwrap_or(matches!(role, Role::All | Role::Simulate));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (producer_tx, producer_rx) = watch::channel(false);
        let topics = &config.topics;
        let n = config.knob_count;
        let inbox = |concurrency: usize| {
            ReceiveSettings::with_concurrency(concurrency).max_outstanding(config.subscription_capacity)
        };

        let mut tasks = Vec::new();
        let mut health = HealthSources::default();

        if runs(Role::Knobs) {
            let sub = bus.subscription(&topics.knobs, &topics.knobs, inbox(1)).await?;
            let output = bus.topic(&topics.flood).await?;
            let aggregator = Arc::new(KnobAggregator::new(
                n,
                config.derivation,
                config.knob_window,
                output,
            ));
            tasks.push(aggregator.spawn_windows(shutdown_rx.clone()));
            tasks.push(spawn_receive(sub, aggregator, shutdown_rx.clone()));
        }

        if runs(Role::Flood) {
            let sub = bus.subscription(&topics.flood, &topics.flood, inbox(1)).await?;
            let output = bus.topic(&topics.mapper).await?;
            let amplifier = Arc::new(Amplifier::new(n, output).with_shutdown(producer_rx.clone()));
            tasks.push(spawn_receive(sub, amplifier, producer_rx.clone()));
        }

        if runs(Role::Map) {
            let sub = bus
                .subscription(&topics.mapper, &topics.mapper, inbox(config.mapper_workers))
                .await?;
            let output = bus.topic(&topics.reducer).await?;
            let counter = Arc::new(Counter::new(n, config.mapper_window, output));
            tasks.push(counter.spawn_windows(shutdown_rx.clone()));
            tasks.push(spawn_receive(sub, counter, shutdown_rx.clone()));
        }

        if runs(Role::Reduce) {
            let sub = bus
                .subscription(&topics.reducer, &topics.reducer, inbox(config.reducer_workers))
                .await?;
            let aggregate = Arc::new(GlobalAggregate::new(n));
            let reducer = Arc::new(Reducer::new(Arc::clone(&aggregate), config.reducer_window));
            tasks.push(reducer.spawn_windows(shutdown_rx.clone()));
            tasks.push(spawn_receive(sub, reducer, shutdown_rx.clone()));

            let sink = match self.sink {
                Some(sink) => sink,
                None => build_sink(&config)?,
            };
            let pusher = Arc::new(
                SinkPusher::new(Arc::clone(&aggregate), sink, config.push_interval)
                    .dry_run(config.dry_run),
            );
            tasks.push(pusher.spawn(shutdown_rx.clone()));

            health.aggregate = Some(aggregate);
            health.pusher = Some(pusher);
            info!(device = %config.device_path(), dry_run = config.dry_run, "sink pusher ready");
        }

        let source = Arc::new(KnobSource::new(n, bus.topic(&topics.knobs).await?));
        let simulator = simulate.then(|| {
            KnobSimulator::new(
                Arc::clone(&source),
                config.simulation.clone(),
                config.shutdown_grace,
            )
            .start()
        });

        info!(
            role = ?role,
            knobs = n,
            tasks = tasks.len(),
            simulate = simulate,
            "pipeline started"
        );

        Ok(RunningPipeline {
            shutdown_tx,
            producer_tx,
            tasks,
            simulator,
            source,
            health,
        })
    }
}

fn spawn_receive(
    sub: Arc<dyn Subscription>,
    handler: Arc<dyn MessageHandler>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = sub.receive(handler, shutdown).await {
            error!(subscription = sub.name(), error = %e, "receive loop failed");
        }
    })
}

/// A started pipeline
pub struct RunningPipeline {
    shutdown_tx: watch::Sender<bool>,
    producer_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    simulator: Option<SimulatorHandle>,
    source: Arc<KnobSource>,
    health: HealthSources,
}

impl RunningPipeline {
    /// Knob source publishing to the knobs topic
    pub fn source(&self) -> &Arc<KnobSource> {
        &self.source
    }

    /// Components for the health endpoint
    pub fn health_sources(&self) -> HealthSources {
        self.health.clone()
    }

    /// Stop the pipeline
    ///
    /// Producers stop first: the amplifier stops issuing events and the
    /// simulator publishes a final zero per knob, then waits out its grace
    /// delay. Only then do the remaining stages stop.
    pub async fn shutdown(self) -> Result<()> {
        info!("pipeline shutting down");
        let _ = self.producer_tx.send(true);

        let mut result = Ok(());
        if let Some(simulator) = self.simulator {
            if let Err(e) = simulator.shutdown().await {
                warn!(error = %e, "simulator shutdown incomplete");
                result = Err(e);
            }
        }

        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "stage task failed during shutdown");
            }
        }
        info!("pipeline stopped");
        result
    }
}
