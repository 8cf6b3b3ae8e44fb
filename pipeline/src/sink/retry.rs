//! Retrying sink wrapper
//!
//! Wraps a sink so each push makes up to `attempts` tries with a fixed
//! delay between them. Non-transient errors fail immediately.

use crate::metrics::Metrics;
use async_trait::async_trait;
use deluge_core::{DeviceConfig, Sink, StageError};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Bounded fixed-delay retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per push, the first one included (at least 1)
    pub attempts: u32,
    /// Pause between consecutive attempts
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_millis(100),
        }
    }
}

/// Sink wrapper that retries failed pushes
pub struct RetrySink {
    inner: Arc<dyn Sink>,
    policy: RetryPolicy,
    /// Metrics: retries after a failed attempt
    retry_count: AtomicU64,
    /// Metrics: pushes that succeeded after at least one failure
    recovered_count: AtomicU64,
    /// Metrics: pushes that ran out of attempts
    exhausted_count: AtomicU64,
}

impl RetrySink {
    /// Wrap `inner` with `policy`
    pub fn new(inner: Arc<dyn Sink>, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy: RetryPolicy {
                attempts: policy.attempts.max(1),
                ..policy
            },
            retry_count: AtomicU64::new(0),
            recovered_count: AtomicU64::new(0),
            exhausted_count: AtomicU64::new(0),
        }
    }

    /// Get total retries
    pub fn retry_count(&self) -> u64 {
        self.retry_count.load(Ordering::Relaxed)
    }

    /// Get count of pushes that recovered after failing
    pub fn recovered_count(&self) -> u64 {
        self.recovered_count.load(Ordering::Relaxed)
    }

    /// Get count of pushes that exhausted every attempt
    pub fn exhausted_count(&self) -> u64 {
        self.exhausted_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Sink for RetrySink {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn push(&self, config: &DeviceConfig) -> Result<i64, StageError> {
        let mut last_error = None;

        for attempt in 1..=self.policy.attempts {
            if attempt > 1 {
                self.retry_count.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    sink = self.inner.name(),
                    attempt = attempt,
                    delay_ms = self.policy.delay.as_millis() as u64,
                    "retrying push"
                );
                tokio::time::sleep(self.policy.delay).await;
            }

            if let Some(metrics) = Metrics::get() {
                metrics.sink_attempts.inc();
            }

            match self.inner.push(config).await {
                Ok(version) => {
                    if attempt > 1 {
                        self.recovered_count.fetch_add(1, Ordering::Relaxed);
                        tracing::info!(
                            sink = self.inner.name(),
                            attempt = attempt,
                            "push recovered after retry"
                        );
                    }
                    return Ok(version);
                }
                Err(e) if !e.is_transient() => {
                    tracing::warn!(
                        sink = self.inner.name(),
                        error = %e,
                        "push failed permanently"
                    );
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(
                        sink = self.inner.name(),
                        attempt = attempt,
                        attempts = self.policy.attempts,
                        error = %e,
                        "push failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        self.exhausted_count.fetch_add(1, Ordering::Relaxed);
        Err(last_error.unwrap_or_else(|| StageError::Push("all attempts exhausted".into())))
    }

    async fn health(&self) -> bool {
        self.inner.health().await
    }
}
