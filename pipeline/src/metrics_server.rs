//! HTTP server for Prometheus metrics and pipeline health
//!
//! # Endpoints
//!
//! - `GET /metrics` - Prometheus metrics
//! - `GET /health` - JSON health summary (running total, last push, sink reachability)
//!
//! # Example
//!
//! ```ignore
//! use deluge_pipeline::metrics_server::{HealthSources, MetricsServer};
//!
//! let handle = MetricsServer::start(config.metrics_addr, HealthSources::default());
//! ```

use crate::stage::pusher::{PushOutcome, SinkPusher};
use crate::stage::reducer::GlobalAggregate;
use axum::extract::State;
use axum::{Json, Router, http::StatusCode, response::IntoResponse, routing::get};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Pipeline components the health endpoint reports on
///
/// Roles that do not run the reducer leave both unset.
#[derive(Clone, Default)]
pub struct HealthSources {
    /// Reducer aggregate, for the running total
    pub aggregate: Option<Arc<GlobalAggregate>>,
    /// Sink pusher, for the last push outcome
    pub pusher: Option<Arc<SinkPusher>>,
}

/// Metrics HTTP server
pub struct MetricsServer;

impl MetricsServer {
    /// Start the metrics server on `addr`
    ///
    /// Returns a JoinHandle that can be used to abort the server.
    /// The server runs until aborted or the process exits.
    pub fn start(addr: SocketAddr, sources: HealthSources) -> JoinHandle<()> {
        tokio::spawn(async move {
            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(e) => {
                    error!(error = %e, addr = %addr, "Failed to bind metrics server");
                    return;
                }
            };
            Self::serve(listener, sources).await;
        })
    }

    /// Serve on an already bound listener until the process exits
    pub async fn serve(listener: TcpListener, sources: HealthSources) {
        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, "Metrics server starting");
        }
        if let Err(e) = axum::serve(listener, router(sources)).await {
            error!(error = %e, "Metrics server error");
        }
    }
}

fn router(sources: HealthSources) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(sources)
}

/// Handler for /metrics endpoint
async fn metrics_handler() -> impl IntoResponse {
    let body = crate::metrics::gather();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

#[derive(serde::Serialize)]
struct HealthSummary {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    total: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_push: Option<PushSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sink_reachable: Option<bool>,
}

#[derive(serde::Serialize)]
struct PushSummary {
    outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl From<PushOutcome> for PushSummary {
    fn from(outcome: PushOutcome) -> Self {
        let label = outcome.label();
        match outcome {
            PushOutcome::Pushed { version } => PushSummary {
                outcome: label,
                version: Some(version),
                error: None,
            },
            PushOutcome::Exhausted { error } => PushSummary {
                outcome: label,
                version: None,
                error: Some(error.to_string()),
            },
            PushOutcome::Skipped | PushOutcome::DryRun => PushSummary {
                outcome: label,
                version: None,
                error: None,
            },
        }
    }
}

/// Handler for /health endpoint
///
/// Always 200 while the process runs. `degraded` while the last real push
/// is exhausted or the sink reports itself unreachable.
async fn health_handler(State(sources): State<HealthSources>) -> impl IntoResponse {
    let last_push = sources.pusher.as_ref().and_then(|p| p.last_push());
    let sink_reachable = match &sources.pusher {
        Some(pusher) => Some(pusher.sink_healthy().await),
        None => None,
    };
    let status = match (&last_push, sink_reachable) {
        (Some(PushOutcome::Exhausted { .. }), _) | (_, Some(false)) => "degraded",
        _ => "healthy",
    };

    let summary = HealthSummary {
        status,
        total: sources.aggregate.as_ref().map(|a| a.total()),
        last_push: last_push.map(PushSummary::from),
        sink_reachable,
    };
    (StatusCode::OK, Json(summary))
}
