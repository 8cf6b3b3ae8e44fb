//! HTTP device-config sink
//!
//! POSTs `{"binaryData": "<base64>"}` to the configured endpoint and reads
//! the new version from `{"version": n}`. Some config stores encode the
//! version as a string; both forms are accepted.
//!
//! Transport failures map to [`StageError::Connection`] and non-2xx
//! statuses to [`StageError::Push`], so both are retried by
//! [`RetrySink`](super::RetrySink).

use crate::error::{DelugeError, Result};
use async_trait::async_trait;
use deluge_core::{DeviceConfig, Sink, StageError};
use std::time::Duration;

/// Sink that POSTs device configs over HTTP
pub struct HttpSink {
    client: reqwest::Client,
    url: String,
    device_path: String,
}

impl HttpSink {
    /// Sink posting to `url` on behalf of `device_path`
    pub fn new(
        url: impl Into<String>,
        device_path: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DelugeError::Sink {
                sink: "http".to_string(),
                message: format!("building HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            url: url.into(),
            device_path: device_path.into(),
        })
    }

    /// Endpoint URL
    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Pull `version` out of a response body
fn parse_version(body: &[u8]) -> std::result::Result<i64, StageError> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| StageError::Decode(format!("sink response: {e}")))?;
    let version = value
        .get("version")
        .ok_or_else(|| StageError::Decode("sink response has no 'version'".into()))?;

    version
        .as_i64()
        .or_else(|| version.as_str().and_then(|s| s.parse().ok()))
        .ok_or_else(|| StageError::Decode(format!("sink version {version} is not an integer")))
}

#[async_trait]
impl Sink for HttpSink {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn push(&self, config: &DeviceConfig) -> std::result::Result<i64, StageError> {
        let response = self
            .client
            .post(&self.url)
            .header("Accept", "application/json")
            .json(config)
            .send()
            .await
            .map_err(|e| StageError::Connection(format!("{}: {e}", self.url)))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| StageError::Connection(format!("reading response: {e}")))?;

        if !status.is_success() {
            let text = String::from_utf8_lossy(&body);
            return Err(StageError::Push(format!(
                "unexpected status {status} for {}: {text}",
                self.device_path
            )));
        }

        let version = parse_version(&body)?;
        tracing::debug!(device = %self.device_path, version = version, "device config updated");
        Ok(version)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::{Json, Router, http::StatusCode, routing::post};
    use deluge_core::SinkSnapshot;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/config")
    }

    fn config(total: i64) -> DeviceConfig {
        DeviceConfig::from_snapshot(&SinkSnapshot {
            mps: vec![total, 0],
            total,
        })
        .unwrap()
    }

    #[test]
    fn test_parse_version_forms() {
        assert_eq!(parse_version(br#"{"version": 7}"#).unwrap(), 7);
        assert_eq!(parse_version(br#"{"version": "12"}"#).unwrap(), 12);
        assert!(parse_version(br#"{"version": "x"}"#).is_err());
        assert!(parse_version(br#"{}"#).is_err());
    }

    #[tokio::test]
    async fn test_push_posts_binary_data_and_reads_version() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::<SinkSnapshot>::new()));
        let captured = Arc::clone(&seen);
        let app = Router::new().route(
            "/config",
            post(move |Json(body): Json<DeviceConfig>| {
                let captured = Arc::clone(&captured);
                async move {
                    captured.lock().push(body.snapshot().unwrap());
                    Json(serde_json::json!({ "version": "3" }))
                }
            }),
        );
        let url = serve(app).await;
        let sink = HttpSink::new(url, "devices/d", Duration::from_secs(5)).unwrap();

        assert_eq!(sink.push(&config(9)).await.unwrap(), 3);
        assert_eq!(seen.lock()[0].total, 9);
    }

    #[tokio::test]
    async fn test_error_status_is_transient_push_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let app = Router::new().route(
            "/config",
            post(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { (StatusCode::SERVICE_UNAVAILABLE, "busy") }
            }),
        );
        let url = serve(app).await;
        let sink = HttpSink::new(url, "devices/d", Duration::from_secs(5)).unwrap();

        let err = sink.push(&config(1)).await.unwrap_err();
        assert!(matches!(err, StageError::Push(ref m) if m.contains("503")));
        assert!(err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_connection_error() {
        // Bind then drop to get a port nobody listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let sink =
            HttpSink::new(format!("http://{addr}/config"), "d", Duration::from_secs(2)).unwrap();
        let err = sink.push(&config(1)).await.unwrap_err();
        assert!(matches!(err, StageError::Connection(_)));
    }
}
