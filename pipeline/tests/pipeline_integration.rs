//! Pipeline integration tests
//!
//! Validates the stage chain over the in-process bus:
//! - One knob intent becomes exactly that many counted events
//! - Last-write-wins on knob updates delivered out of order
//! - Sink pushes retry within their bound and never repeat a total
//! - A full `Pipeline` carries knob intents through to the sink

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use bytes::Bytes;
use deluge_core::{
    Bus, DeviceConfig, KnobUpdate, Message, MessageHandler, ReceiveSettings, Sink, SinkSnapshot,
    StageError, Subscription, WirePayload,
};
use deluge_pipeline::{
    Amplifier, Config, Counter, DerivationPolicy, GlobalAggregate, KnobAggregator, MemoryBus,
    Pipeline, PushOutcome, Reducer, RetryPolicy, RetrySink, SinkPusher,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;

// ============================================================================
// Shared test sinks
// ============================================================================

/// Sink that captures pushed snapshots, failing the first `failures` pushes
#[derive(Default)]
struct CaptureSink {
    failures: usize,
    calls: AtomicUsize,
    captured: Mutex<Vec<SinkSnapshot>>,
}

impl CaptureSink {
    fn failing(failures: usize) -> Self {
        Self {
            failures,
            ..Default::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn captured(&self) -> Vec<SinkSnapshot> {
        self.captured.lock().clone()
    }
}

#[async_trait::async_trait]
impl Sink for CaptureSink {
    fn name(&self) -> &'static str {
        "capture"
    }

    async fn push(&self, config: &DeviceConfig) -> Result<i64, StageError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(StageError::Push("simulated outage".into()));
        }
        let mut captured = self.captured.lock();
        captured.push(config.snapshot()?);
        Ok(captured.len() as i64)
    }
}

async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn spawn_receive(
    sub: Arc<dyn Subscription>,
    handler: Arc<dyn MessageHandler>,
    shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        sub.receive(handler, shutdown).await.unwrap();
    })
}

fn knob_message(id: i64, n: i64, ts: f64) -> Message {
    Message::new("knobs", KnobUpdate { id, n, ts }.encode().unwrap())
}

// ============================================================================
// Stage chain, driven one window at a time
// ============================================================================

/// Knob 0 = 100 gives vector [100,0,0,0,0], 100 events tagged "0",
/// count vector [100,0,0,0,0] and a running total of 100.
#[tokio::test]
async fn knob_intent_flows_through_every_stage() {
    let bus = MemoryBus::new();
    let (tx, rx) = watch::channel(false);

    let flood_sub = bus
        .subscription("flood", "flood", ReceiveSettings::default())
        .await
        .unwrap();
    let mapper_sub = bus
        .subscription("mapper", "mapper", ReceiveSettings::with_concurrency(8))
        .await
        .unwrap();
    let reducer_sub = bus
        .subscription("reducer", "reducer", ReceiveSettings::with_concurrency(4))
        .await
        .unwrap();

    let aggregator = KnobAggregator::new(
        5,
        DerivationPolicy::PassThrough,
        Duration::from_secs(1),
        bus.topic("flood").await.unwrap(),
    );
    let amplifier = Arc::new(Amplifier::new(5, bus.topic("mapper").await.unwrap()));
    let counter = Arc::new(Counter::new(
        5,
        Duration::from_millis(100),
        bus.topic("reducer").await.unwrap(),
    ));
    let aggregate = Arc::new(GlobalAggregate::new(5));
    let reducer = Arc::new(Reducer::new(Arc::clone(&aggregate), Duration::from_secs(1)));

    let tasks = vec![
        spawn_receive(flood_sub, amplifier, rx.clone()),
        spawn_receive(mapper_sub, counter.clone(), rx.clone()),
        spawn_receive(reducer_sub, reducer, rx.clone()),
    ];

    // Knob state aggregator
    aggregator.handle(&knob_message(0, 100, 1.0)).await.unwrap();
    let vector = aggregator.emit_window().await.unwrap();
    assert_eq!(vector.ns, vec![100, 0, 0, 0, 0]);

    // Amplifier → mapper
    wait_until("100 mapper acks", || {
        bus.stats("mapper").is_some_and(|s| s.acked == 100)
    })
    .await;

    let counts = counter.emit_window().await.unwrap();
    assert_eq!(counts.messages, vec![100, 0, 0, 0, 0]);
    assert!(counter.emit_window().await.is_none());

    // Mapper → reducer
    wait_until("reducer ack", || {
        bus.stats("reducer").is_some_and(|s| s.acked == 1)
    })
    .await;
    let snapshot = aggregate.rollup();
    assert_eq!(snapshot.mps, vec![100, 0, 0, 0, 0]);
    assert_eq!(snapshot.total, 100);

    // Reducer → sink
    let sink = Arc::new(CaptureSink::default());
    let pusher = SinkPusher::new(aggregate, sink.clone(), Duration::from_secs(1));
    assert_eq!(pusher.tick().await, PushOutcome::Pushed { version: 1 });
    assert_eq!(
        sink.captured(),
        vec![SinkSnapshot {
            mps: vec![100, 0, 0, 0, 0],
            total: 100
        }]
    );

    tx.send(true).unwrap();
    for task in tasks {
        task.await.unwrap();
    }
}

/// ts 5.0 then ts 3.0 for the same knob: the ts 5.0 value wins.
#[tokio::test]
async fn out_of_order_updates_keep_newest_timestamp() {
    let bus = MemoryBus::new();
    let (tx, rx) = watch::channel(false);
    let sub = bus
        .subscription("knobs", "knobs", ReceiveSettings::default())
        .await
        .unwrap();
    let aggregator = Arc::new(KnobAggregator::new(
        5,
        DerivationPolicy::PassThrough,
        Duration::from_secs(1),
        bus.topic("flood").await.unwrap(),
    ));
    let task = spawn_receive(sub, aggregator.clone(), rx);

    let knobs = bus.topic("knobs").await.unwrap();
    for (n, ts) in [(50, 5.0), (30, 3.0)] {
        let update = KnobUpdate { id: 2, n, ts }.encode().unwrap();
        knobs.publish(update).await.unwrap();
    }
    // Malformed updates are acked and dropped
    knobs.publish(Bytes::from_static(b"{\"id\":2}")).await.unwrap();

    wait_until("three acks", || {
        bus.stats("knobs").is_some_and(|s| s.acked == 3)
    })
    .await;
    assert_eq!(aggregator.table().get(2), Some((50, 5.0)));
    assert_eq!(bus.stats("knobs").unwrap().failed, 1);

    tx.send(true).unwrap();
    task.await.unwrap();
}

// ============================================================================
// Sink retries
// ============================================================================

fn retrying(inner: Arc<CaptureSink>, attempts: u32) -> Arc<RetrySink> {
    Arc::new(RetrySink::new(
        inner,
        RetryPolicy {
            attempts,
            delay: Duration::from_millis(1),
        },
    ))
}

fn absorb(aggregate: &GlobalAggregate, counts: Vec<i64>) {
    aggregate
        .absorb(&deluge_core::CountVector::new(counts))
        .unwrap();
    aggregate.rollup();
}

/// Three failures under a bound of 10: four attempts, then success.
#[tokio::test]
async fn push_recovers_within_retry_bound() {
    let inner = Arc::new(CaptureSink::failing(3));
    let aggregate = Arc::new(GlobalAggregate::new(5));
    let pusher = SinkPusher::new(
        Arc::clone(&aggregate),
        retrying(inner.clone(), 10),
        Duration::from_secs(1),
    );

    absorb(&aggregate, vec![1, 2, 3, 4, 5]);
    assert_eq!(pusher.tick().await, PushOutcome::Pushed { version: 1 });
    assert_eq!(inner.calls(), 4);
    assert_eq!(inner.captured()[0].total, 15);
}

/// Four failures under a bound of 3: exhausted, and the next cycle still runs.
#[tokio::test]
async fn exhausted_push_does_not_stop_the_loop() {
    let inner = Arc::new(CaptureSink::failing(4));
    let aggregate = Arc::new(GlobalAggregate::new(5));
    let pusher = SinkPusher::new(
        Arc::clone(&aggregate),
        retrying(inner.clone(), 3),
        Duration::from_secs(1),
    );

    absorb(&aggregate, vec![1, 0, 0, 0, 0]);
    let outcome = pusher.tick().await;
    assert!(matches!(outcome, PushOutcome::Exhausted { .. }), "{outcome:?}");
    assert_eq!(inner.calls(), 3);

    // Same total: skipped without touching the sink
    assert_eq!(pusher.tick().await, PushOutcome::Skipped);
    assert_eq!(inner.calls(), 3);

    // New total: the fourth failure, then success
    absorb(&aggregate, vec![1, 0, 0, 0, 0]);
    assert_eq!(pusher.tick().await, PushOutcome::Pushed { version: 1 });
    assert_eq!(inner.calls(), 5);
    assert_eq!(inner.captured()[0].total, 2);
}

// ============================================================================
// Full pipeline
// ============================================================================

fn fast_config() -> Config {
    Config {
        knob_window: Duration::from_millis(50),
        mapper_window: Duration::from_millis(10),
        reducer_window: Duration::from_millis(20),
        push_interval: Duration::from_millis(20),
        push_retry_delay: Duration::from_millis(1),
        shutdown_grace: Duration::from_millis(10),
        mapper_workers: 4,
        reducer_workers: 2,
        ..Config::default()
    }
}

#[tokio::test]
async fn pipeline_pushes_growing_totals() {
    let sink = Arc::new(CaptureSink::default());
    let running = Pipeline::new(fast_config())
        .sink(sink.clone())
        .simulate(false)
        .start()
        .await
        .unwrap();

    running.source().set(3, 10).await.unwrap();
    wait_until("a total of at least 30", || {
        sink.captured().last().is_some_and(|s| s.total >= 30)
    })
    .await;

    // Stop amplifying and let the last counts drain
    running.source().set(3, 0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let pushes = sink.captured();
    for pair in pushes.windows(2) {
        assert!(pair[1].total > pair[0].total, "total repeated or shrank");
    }
    for snapshot in &pushes {
        assert_eq!(snapshot.mps.len(), 5);
        let others: i64 = [0, 1, 2, 4].iter().map(|&i| snapshot.mps[i]).sum();
        assert_eq!(others, 0);
    }
    assert_eq!(pushes.last().unwrap().total % 10, 0);

    let health = running.health_sources();
    assert_eq!(
        health.aggregate.unwrap().total(),
        pushes.last().unwrap().total
    );

    running.shutdown().await.unwrap();
}

#[tokio::test]
async fn simulator_drives_pipeline_and_stops_cleanly() {
    let mut config = fast_config();
    config.knob_count = 2;
    config.simulation.amplitude = 3;
    config.simulation.interval = Duration::from_millis(10);

    let sink = Arc::new(CaptureSink::default());
    let running = Pipeline::new(config).sink(sink.clone()).start().await.unwrap();

    wait_until("a push", || !sink.captured().is_empty()).await;
    tokio::time::timeout(Duration::from_secs(5), running.shutdown())
        .await
        .unwrap()
        .unwrap();

    let last = sink.captured().last().cloned().unwrap();
    assert!(last.total > 0);
    assert_eq!(last.mps.len(), 2);
}
