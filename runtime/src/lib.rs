//! deluge runtime - process wiring around the pipeline
//!
//! Provides [`run()`] for the stock binary, and [`RuntimeBuilder`] for
//! embedders that bring their own bus or sink.
//!
//! # Quick start
//!
//! ```ignore
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     deluge_runtime::run().await
//! }
//! ```

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod prelude;

use deluge_pipeline::{Config, LogFormat, Metrics, MetricsServer, Pipeline};
use std::future::Future;
use std::net::SocketAddr;
use tokio::signal;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Run the pipeline with settings from the environment.
///
/// Loads configuration, initialises tracing and metrics, starts the stages
/// for the configured role and runs until SIGINT or SIGTERM.
pub async fn run() -> anyhow::Result<()> {
    RuntimeBuilder::new().run().await
}

/// Builder for controlling runtime behaviour.
///
/// # Example
///
/// ```ignore
/// RuntimeBuilder::new()
///     .metrics_addr("127.0.0.1:9191".parse()?)
///     .configure(|pipeline| async move {
///         Ok(pipeline.sink(Arc::new(LogSink::new("projects/p/devices/d"))))
///     })
///     .await
/// ```
pub struct RuntimeBuilder {
    config: Option<Config>,
    metrics_addr: Option<SocketAddr>,
    metrics_enabled: bool,
}

impl RuntimeBuilder {
    /// Create a new builder; configuration is loaded from the environment.
    pub fn new() -> Self {
        Self {
            config: None,
            metrics_addr: None,
            metrics_enabled: true,
        }
    }

    /// Use `config` instead of reading `DELUGE_*` variables.
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Override the metrics HTTP server listen address.
    ///
    /// Default: `DELUGE_METRICS_ADDR`, or `0.0.0.0:9090`.
    pub fn metrics_addr(mut self, addr: SocketAddr) -> Self {
        self.metrics_addr = Some(addr);
        self
    }

    /// Do not start the metrics and health server.
    pub fn disable_metrics(mut self) -> Self {
        self.metrics_enabled = false;
        self
    }

    /// Run the pipeline as configured until a shutdown signal.
    pub async fn run(self) -> anyhow::Result<()> {
        self.configure(|pipeline| async move { Ok(pipeline) }).await
    }

    /// Adjust the pipeline, then run it to completion.
    ///
    /// This is the terminal method; it returns after shutdown.
    pub async fn configure<F, Fut>(self, configure: F) -> anyhow::Result<()>
    where
        F: FnOnce(Pipeline) -> Fut,
        Fut: Future<Output = anyhow::Result<Pipeline>>,
    {
        // ── 1. Load config ───────────────────────────────────────
        let config = match self.config {
            Some(config) => config,
            None => Config::from_env()?,
        };

        // ── 2. Init tracing ──────────────────────────────────────
        init_tracing(&config);

        let metrics_addr = self.metrics_addr.unwrap_or(config.metrics_addr);
        info!(
            role = ?config.role,
            knobs = config.knob_count,
            device = %config.device_path(),
            metrics_addr = %metrics_addr,
            "Starting deluge"
        );

        // ── 3. Init metrics before any stage records ─────────────
        if self.metrics_enabled {
            Metrics::init()?;
        }

        // ── 4. Start the pipeline + HTTP server ──────────────────
        let pipeline = configure(Pipeline::new(config)).await?;
        let running = pipeline.start().await?;
        let metrics_handle = self
            .metrics_enabled
            .then(|| MetricsServer::start(metrics_addr, running.health_sources()));

        // ── 5. Wait, then drain ──────────────────────────────────
        shutdown_signal().await;
        running.shutdown().await?;

        if let Some(handle) = metrics_handle {
            handle.abort();
        }
        info!("deluge shutdown complete");

        Ok(())
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Initialise the tracing subscriber based on config.
///
/// `RUST_LOG` wins over `DELUGE_LOG_LEVEL` when set. Safe to call twice;
/// the second call leaves the first subscriber in place.
fn init_tracing(config: &Config) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    let _ = match config.log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
    };
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = ?e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = ?e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let builder = RuntimeBuilder::default();
        assert!(builder.config.is_none());
        assert!(builder.metrics_addr.is_none());
        assert!(builder.metrics_enabled);
    }

    #[test]
    fn test_builder_overrides() {
        let addr: SocketAddr = "127.0.0.1:9191".parse().unwrap();
        let builder = RuntimeBuilder::new()
            .config(Config::default())
            .metrics_addr(addr)
            .disable_metrics();
        assert_eq!(builder.metrics_addr, Some(addr));
        assert!(!builder.metrics_enabled);
        assert!(builder.config.is_some());
    }

    #[test]
    fn test_init_tracing_twice_is_harmless() {
        let config = Config {
            log_format: LogFormat::Json,
            ..Config::default()
        };
        init_tracing(&config);
        init_tracing(&Config::default());
    }

    #[tokio::test]
    async fn test_metrics_are_ready_before_the_pipeline_starts() {
        // Start fails on validation, after metrics were initialised
        let config = Config {
            knob_count: 0,
            ..Config::default()
        };
        let result = RuntimeBuilder::new()
            .config(config)
            .metrics_addr("127.0.0.1:0".parse().unwrap())
            .run()
            .await;
        assert!(result.is_err());
        assert!(Metrics::get().is_some());
    }

    #[tokio::test]
    async fn test_configure_rejects_invalid_config() {
        let config = Config {
            knob_count: 0,
            ..Config::default()
        };
        let result = RuntimeBuilder::new()
            .config(config)
            .disable_metrics()
            .run()
            .await;
        assert!(result.is_err());
    }
}
