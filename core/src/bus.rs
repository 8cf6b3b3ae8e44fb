//! Message bus interface
//!
//! The bus is an external collaborator; stages only see these traits.
//! Implementations must provide:
//!
//! - get-or-create semantics for topics and subscriptions
//! - best-effort `publish` with whatever batching the transport wants
//! - at-least-once `receive`, with every delivery acknowledged exactly once
//!
//! # Acknowledgement
//!
//! Each delivery is paired with an [`AckGuard`]. The guard acks on drop, so
//! a handler that returns an error, or panics inside a spawned task, still
//! releases the message and the bus never redelivers a poison message
//! forever.
//!
//! ```text
//! receive ──► decode ──► process ──► ack
//!                 │          │
//!                 └──────────┴──► error/panic ──► (guard drop) ack
//! ```

use crate::error::StageError;
use crate::message::{Message, MessageId};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::watch;

/// A named topic that accepts publishes
#[async_trait]
pub trait Topic: Send + Sync {
    /// Topic name
    fn name(&self) -> &str;

    /// Publish one payload
    ///
    /// Best effort: `Ok` means the bus accepted the payload, not that any
    /// subscriber has seen it.
    async fn publish(&self, data: Bytes) -> Result<MessageId, StageError>;
}

/// Per-message processing callback
///
/// Errors returned here are logged by the bus and the message is still
/// acknowledged.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one delivered message
    async fn handle(&self, msg: &Message) -> Result<(), StageError>;
}

/// Flow control for a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveSettings {
    /// Maximum handler invocations running at once
    pub concurrency: usize,
    /// Maximum undelivered messages queued before publishers wait
    pub max_outstanding: usize,
}

impl Default for ReceiveSettings {
    fn default() -> Self {
        Self {
            concurrency: 1,
            max_outstanding: 1000,
        }
    }
}

impl ReceiveSettings {
    /// Settings with `concurrency` parallel handlers
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Self::default()
        }
    }

    /// Override the outstanding-message bound
    pub fn max_outstanding(mut self, max_outstanding: usize) -> Self {
        self.max_outstanding = max_outstanding;
        self
    }
}

/// A subscription that delivers messages to a handler
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Subscription name
    fn name(&self) -> &str;

    /// Name of the topic this subscription is attached to
    fn topic(&self) -> &str;

    /// Deliver messages to `handler` until `shutdown` flips to `true` or
    /// its sender is dropped
    ///
    /// Deliveries run concurrently up to the subscription's
    /// [`ReceiveSettings::concurrency`]. In-flight deliveries are awaited
    /// before returning.
    async fn receive(
        &self,
        handler: Arc<dyn MessageHandler>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), StageError>;
}

/// Topic/subscription factory
#[async_trait]
pub trait Bus: Send + Sync {
    /// Get a topic, creating it if absent
    async fn topic(&self, name: &str) -> Result<Arc<dyn Topic>, StageError>;

    /// Get a subscription on `topic`, creating both if absent
    ///
    /// `settings` apply only when the subscription is created.
    async fn subscription(
        &self,
        topic: &str,
        name: &str,
        settings: ReceiveSettings,
    ) -> Result<Arc<dyn Subscription>, StageError>;
}

/// Receiver of acknowledgements
pub trait Acknowledge: Send + Sync {
    /// Mark `id` as processed
    fn ack(&self, id: MessageId);
}

/// Scoped acknowledgement: acks exactly once, on explicit call or on drop
pub struct AckGuard {
    id: MessageId,
    acker: Option<Arc<dyn Acknowledge>>,
}

impl AckGuard {
    /// Guard the delivery of message `id`
    pub fn new(id: MessageId, acker: Arc<dyn Acknowledge>) -> Self {
        Self {
            id,
            acker: Some(acker),
        }
    }

    /// Acknowledge now
    pub fn ack(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(acker) = self.acker.take() {
            acker.ack(self.id);
        }
    }
}

impl Drop for AckGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Run `handler` on one delivery and acknowledge it on every path
///
/// Handler errors are logged through the returned value only; callers
/// decide how to report them. The guard is consumed either way.
pub async fn deliver(
    handler: &dyn MessageHandler,
    msg: &Message,
    guard: AckGuard,
) -> Result<(), StageError> {
    let result = handler.handle(msg).await;
    guard.ack();
    result
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingAcker(AtomicUsize);

    impl Acknowledge for CountingAcker {
        fn ack(&self, _id: MessageId) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl MessageHandler for FailingHandler {
        async fn handle(&self, _msg: &Message) -> Result<(), StageError> {
            Err(StageError::Decode("bad payload".into()))
        }
    }

    struct PanickingHandler;

    #[async_trait]
    impl MessageHandler for PanickingHandler {
        async fn handle(&self, _msg: &Message) -> Result<(), StageError> {
            panic!("handler blew up");
        }
    }

    #[test]
    fn test_guard_acks_once_on_explicit_ack() {
        let acker = Arc::new(CountingAcker::default());
        let guard = AckGuard::new(MessageId::new(), acker.clone());
        guard.ack();
        assert_eq!(acker.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_guard_acks_on_drop() {
        let acker = Arc::new(CountingAcker::default());
        {
            let _guard = AckGuard::new(MessageId::new(), acker.clone());
        }
        assert_eq!(acker.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_deliver_acks_on_handler_error() {
        let acker = Arc::new(CountingAcker::default());
        let msg = Message::new("t", Bytes::new());
        let guard = AckGuard::new(msg.id, acker.clone());

        let result = deliver(&FailingHandler, &msg, guard).await;

        assert!(result.is_err());
        assert_eq!(acker.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_deliver_acks_on_handler_panic() {
        let acker = Arc::new(CountingAcker::default());
        let msg = Message::new("t", Bytes::new());
        let guard = AckGuard::new(msg.id, acker.clone());

        let task = tokio::spawn(async move { deliver(&PanickingHandler, &msg, guard).await });

        assert!(task.await.unwrap_err().is_panic());
        assert_eq!(acker.0.load(Ordering::SeqCst), 1);
    }
}
