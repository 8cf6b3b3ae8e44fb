//! Prometheus metrics for deluge

use crate::error::{DelugeError, Result};
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, TextEncoder, register_counter,
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram,
};
use std::sync::OnceLock;

/// Global metrics instance
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Serializes registration so concurrent `init` calls cannot double-register
static INIT_LOCK: parking_lot::Mutex<()> = parking_lot::Mutex::new(());

/// All deluge metrics
pub struct Metrics {
    // ─────────────────────────────────────────────────────────────────────────
    // Bus traffic
    // ─────────────────────────────────────────────────────────────────────────
    /// Payloads accepted by a topic (by topic)
    pub messages_published: CounterVec,

    /// Publishes that failed (by topic)
    pub publish_failures: CounterVec,

    /// Deliveries handled (by subscription)
    pub messages_received: CounterVec,

    /// Payloads discarded (by stage, reason)
    pub messages_dropped: CounterVec,

    // ─────────────────────────────────────────────────────────────────────────
    // Windows
    // ─────────────────────────────────────────────────────────────────────────
    /// Windows that produced output (by stage)
    pub windows_emitted: CounterVec,

    /// Sum of counts emitted across windows (by stage)
    pub window_events: CounterVec,

    /// Latest stored intent (by knob)
    pub knob_intent: GaugeVec,

    /// Reducer running total
    pub running_total: Gauge,

    // ─────────────────────────────────────────────────────────────────────────
    // Sink
    // ─────────────────────────────────────────────────────────────────────────
    /// Push cycles by outcome (pushed, skipped, dry_run, exhausted)
    pub sink_cycles: CounterVec,

    /// Individual push attempts, including retries
    pub sink_attempts: Counter,

    /// Time from first attempt to success or exhaustion
    pub sink_push_duration_seconds: Histogram,

    /// Last version returned by the sink
    pub sink_version: Gauge,
}

impl Metrics {
    /// Initialize metrics (call once at startup)
    ///
    /// Returns error if metric registration fails.
    pub fn init() -> Result<&'static Metrics> {
        let _guard = INIT_LOCK.lock();
        if let Some(metrics) = METRICS.get() {
            return Ok(metrics);
        }

        let metrics = Metrics {
            messages_published: register_counter_vec!(
                "deluge_messages_published_total",
                "Payloads accepted by a topic",
                &["topic"]
            )
            .map_err(|e| DelugeError::Metrics(format!("messages_published: {e}")))?,

            publish_failures: register_counter_vec!(
                "deluge_publish_failures_total",
                "Publishes rejected by the bus",
                &["topic"]
            )
            .map_err(|e| DelugeError::Metrics(format!("publish_failures: {e}")))?,

            messages_received: register_counter_vec!(
                "deluge_messages_received_total",
                "Deliveries handled per subscription",
                &["subscription"]
            )
            .map_err(|e| DelugeError::Metrics(format!("messages_received: {e}")))?,

            messages_dropped: register_counter_vec!(
                "deluge_messages_dropped_total",
                "Payloads discarded",
                &["stage", "reason"]
            )
            .map_err(|e| DelugeError::Metrics(format!("messages_dropped: {e}")))?,

            windows_emitted: register_counter_vec!(
                "deluge_windows_emitted_total",
                "Windows that produced output",
                &["stage"]
            )
            .map_err(|e| DelugeError::Metrics(format!("windows_emitted: {e}")))?,

            window_events: register_counter_vec!(
                "deluge_window_events_total",
                "Sum of window counts emitted",
                &["stage"]
            )
            .map_err(|e| DelugeError::Metrics(format!("window_events: {e}")))?,

            knob_intent: register_gauge_vec!(
                "deluge_knob_intent",
                "Latest stored knob intent",
                &["knob"]
            )
            .map_err(|e| DelugeError::Metrics(format!("knob_intent: {e}")))?,

            running_total: register_gauge!("deluge_running_total", "Reducer running total")
                .map_err(|e| DelugeError::Metrics(format!("running_total: {e}")))?,

            sink_cycles: register_counter_vec!(
                "deluge_sink_cycles_total",
                "Sink push cycles by outcome",
                &["outcome"]
            )
            .map_err(|e| DelugeError::Metrics(format!("sink_cycles: {e}")))?,

            sink_attempts: register_counter!(
                "deluge_sink_attempts_total",
                "Individual sink push attempts"
            )
            .map_err(|e| DelugeError::Metrics(format!("sink_attempts: {e}")))?,

            sink_push_duration_seconds: register_histogram!(
                "deluge_sink_push_duration_seconds",
                "Time from first push attempt to success or exhaustion",
                // Buckets: 1ms to 10s (10 attempts × 100ms sits around 1s)
                vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0]
            )
            .map_err(|e| DelugeError::Metrics(format!("sink_push_duration_seconds: {e}")))?,

            sink_version: register_gauge!("deluge_sink_version", "Last version returned by the sink")
                .map_err(|e| DelugeError::Metrics(format!("sink_version: {e}")))?,
        };

        let _ = METRICS.set(metrics);

        METRICS
            .get()
            .ok_or_else(|| DelugeError::Metrics("Failed to initialize metrics".to_string()))
    }

    /// Get the global metrics instance
    ///
    /// Returns None if metrics haven't been initialized yet.
    pub fn get() -> Option<&'static Metrics> {
        METRICS.get()
    }

    pub fn record_published(&self, topic: &str, count: u64) {
        self.messages_published
            .with_label_values(&[topic])
            .inc_by(count as f64);
    }

    pub fn record_publish_failures(&self, topic: &str, count: u64) {
        self.publish_failures
            .with_label_values(&[topic])
            .inc_by(count as f64);
    }

    pub fn record_received(&self, subscription: &str) {
        self.messages_received
            .with_label_values(&[subscription])
            .inc();
    }

    pub fn record_dropped(&self, stage: &str, reason: &str) {
        self.messages_dropped
            .with_label_values(&[stage, reason])
            .inc();
    }

    /// Record one emitted window and its summed count
    pub fn record_window(&self, stage: &str, total: i64) {
        self.windows_emitted.with_label_values(&[stage]).inc();
        if total > 0 {
            self.window_events
                .with_label_values(&[stage])
                .inc_by(total as f64);
        }
    }

    pub fn set_knob_intent(&self, knob: usize, intent: i64) {
        let knob = knob.to_string();
        self.knob_intent
            .with_label_values(&[knob.as_str()])
            .set(intent as f64);
    }

    pub fn set_running_total(&self, total: i64) {
        self.running_total.set(total as f64);
    }

    pub fn record_sink_cycle(&self, outcome: &str) {
        self.sink_cycles.with_label_values(&[outcome]).inc();
    }
}

/// Gather all metrics as Prometheus text format
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
