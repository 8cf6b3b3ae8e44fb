//! In-process bus
//!
//! Topics fan every publish out to each attached subscription. Each
//! subscription owns a bounded queue (`max_outstanding`); publishers wait
//! when it is full. Payloads published to a topic with no subscriptions are
//! dropped, as on a hosted bus.
//!
//! Every delivery runs in its own task so a panicking handler cannot take
//! the receive loop down. The delivery's [`AckGuard`] acks on every path.

use crate::metrics::Metrics;
use async_trait::async_trait;
use bytes::Bytes;
use deluge_core::{
    AckGuard, Acknowledge, Bus, Message, MessageHandler, MessageId, ReceiveSettings, StageError,
    Subscription, Topic, deliver,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

/// In-process [`Bus`] implementation
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<BusInner>,
}

#[derive(Default)]
struct BusInner {
    topics: RwLock<HashMap<String, Arc<MemoryTopic>>>,
    subscriptions: RwLock<HashMap<String, Arc<MemorySubscription>>>,
}

impl MemoryBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create a topic, returning the concrete type
    pub fn memory_topic(&self, name: &str) -> Arc<MemoryTopic> {
        if let Some(topic) = self.inner.topics.read().get(name) {
            return Arc::clone(topic);
        }
        let mut topics = self.inner.topics.write();
        Arc::clone(
            topics
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(MemoryTopic::new(name))),
        )
    }

    /// Get or create a subscription, returning the concrete type
    ///
    /// Fails if `name` already exists on a different topic.
    pub fn memory_subscription(
        &self,
        topic: &str,
        name: &str,
        settings: ReceiveSettings,
    ) -> Result<Arc<MemorySubscription>, StageError> {
        if settings.concurrency == 0 || settings.max_outstanding == 0 {
            return Err(StageError::Init(format!(
                "subscription '{name}': concurrency and max_outstanding must be > 0"
            )));
        }

        let topic_handle = self.memory_topic(topic);
        let mut subs = self.inner.subscriptions.write();
        if let Some(existing) = subs.get(name) {
            if existing.topic.as_ref() != topic {
                return Err(StageError::Init(format!(
                    "subscription '{name}' is attached to '{}', not '{topic}'",
                    existing.topic
                )));
            }
            return Ok(Arc::clone(existing));
        }

        let (tx, rx) = mpsc::channel(settings.max_outstanding);
        topic_handle.attach(tx);
        let sub = Arc::new(MemorySubscription {
            name: Arc::from(name),
            topic: Arc::from(topic),
            concurrency: settings.concurrency,
            rx: tokio::sync::Mutex::new(rx),
            stats: Arc::new(DeliveryStats::default()),
        });
        subs.insert(name.to_string(), Arc::clone(&sub));
        debug!(subscription = name, topic = topic, "subscription created");
        Ok(sub)
    }

    /// Delivery counters for a subscription, if it exists
    pub fn stats(&self, subscription: &str) -> Option<DeliverySnapshot> {
        self.inner
            .subscriptions
            .read()
            .get(subscription)
            .map(|s| s.stats())
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn topic(&self, name: &str) -> Result<Arc<dyn Topic>, StageError> {
        Ok(self.memory_topic(name))
    }

    async fn subscription(
        &self,
        topic: &str,
        name: &str,
        settings: ReceiveSettings,
    ) -> Result<Arc<dyn Subscription>, StageError> {
        Ok(self.memory_subscription(topic, name, settings)?)
    }
}

/// A topic on the in-process bus
pub struct MemoryTopic {
    name: Arc<str>,
    subscribers: RwLock<Vec<mpsc::Sender<Message>>>,
    published: AtomicU64,
}

impl MemoryTopic {
    fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            subscribers: RwLock::new(Vec::new()),
            published: AtomicU64::new(0),
        }
    }

    fn attach(&self, tx: mpsc::Sender<Message>) {
        self.subscribers.write().push(tx);
    }

    /// Payloads accepted so far
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Topic for MemoryTopic {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, data: Bytes) -> Result<MessageId, StageError> {
        let msg = Message::new(Arc::clone(&self.name), data);
        let id = msg.id;

        // Clone the senders so no lock is held across the awaits below
        let subscribers: Vec<_> = self.subscribers.read().clone();
        let mut closed = 0usize;
        for tx in &subscribers {
            if tx.send(msg.clone()).await.is_err() {
                closed += 1;
            }
        }
        if closed > 0 {
            self.subscribers.write().retain(|tx| !tx.is_closed());
            warn!(topic = %self.name, closed = closed, "dropped closed subscriptions");
        }

        self.published.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = Metrics::get() {
            metrics.record_published(&self.name, 1);
        }
        Ok(id)
    }
}

/// Delivery counters
#[derive(Default)]
struct DeliveryStats {
    delivered: AtomicU64,
    acked: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
}

impl Acknowledge for DeliveryStats {
    fn ack(&self, _id: MessageId) {
        self.acked.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of a subscription's delivery counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliverySnapshot {
    /// Messages handed to a handler
    pub delivered: u64,
    /// Messages acknowledged
    pub acked: u64,
    /// Handler invocations that returned an error
    pub failed: u64,
    /// Handler invocations that panicked
    pub panicked: u64,
}

/// A subscription on the in-process bus
pub struct MemorySubscription {
    name: Arc<str>,
    topic: Arc<str>,
    concurrency: usize,
    rx: tokio::sync::Mutex<mpsc::Receiver<Message>>,
    stats: Arc<DeliveryStats>,
}

impl MemorySubscription {
    /// Current delivery counters
    pub fn stats(&self) -> DeliverySnapshot {
        DeliverySnapshot {
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            acked: self.stats.acked.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            panicked: self.stats.panicked.load(Ordering::Relaxed),
        }
    }

    fn reap(&self, result: Result<(), tokio::task::JoinError>) {
        if let Err(e) = result {
            if e.is_panic() {
                self.stats.panicked.fetch_add(1, Ordering::Relaxed);
                error!(subscription = %self.name, "message handler panicked");
            }
        }
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    fn name(&self) -> &str {
        &self.name
    }

    fn topic(&self) -> &str {
        &self.topic
    }

    async fn receive(
        &self,
        handler: Arc<dyn MessageHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), StageError> {
        // One receive loop per subscription at a time
        let mut rx = self.rx.lock().await;
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut in_flight = JoinSet::new();

        debug!(
            subscription = %self.name,
            concurrency = self.concurrency,
            "receive started"
        );

        while !*shutdown.borrow() {
            let msg = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };

            let permit = Arc::clone(&permits)
                .acquire_owned()
                .await
                .map_err(|_| StageError::Closed(format!("subscription '{}'", self.name)))?;

            self.stats.delivered.fetch_add(1, Ordering::Relaxed);
            if let Some(metrics) = Metrics::get() {
                metrics.record_received(&self.name);
            }

            let guard = AckGuard::new(msg.id, Arc::clone(&self.stats) as Arc<dyn Acknowledge>);
            let handler = Arc::clone(&handler);
            let stats = Arc::clone(&self.stats);
            let name = Arc::clone(&self.name);
            in_flight.spawn(async move {
                let _permit = permit;
                if let Err(e) = deliver(handler.as_ref(), &msg, guard).await {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(subscription = %name, id = %msg.id, error = %e, "handler failed");
                }
            });

            while let Some(result) = in_flight.try_join_next() {
                self.reap(result);
            }
        }

        while let Some(result) = in_flight.join_next().await {
            self.reap(result);
        }
        debug!(subscription = %self.name, "receive stopped");
        Ok(())
    }
}
