//! Sink implementations
//!
//! - [`LogSink`] - dry run, logs documents and counts versions locally
//! - [`HttpSink`] - POSTs documents to a device-config endpoint
//! - [`RetrySink`] - bounded fixed-delay retries around any sink
//!
//! [`build_sink`] picks one from configuration.

mod http;
mod log;
mod retry;

pub use http::HttpSink;
pub use log::LogSink;
pub use retry::{RetryPolicy, RetrySink};

use crate::config::Config;
use crate::error::Result;
use deluge_core::Sink;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// HTTP request timeout for the device-config endpoint
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Sink for `config`, wrapped in the configured retry policy
///
/// Without a sink URL the log sink stands in.
pub fn build_sink(config: &Config) -> Result<Arc<dyn Sink>> {
    let device_path = config.device_path();
    let inner: Arc<dyn Sink> = match &config.sink_url {
        Some(url) => {
            let http = HttpSink::new(url.as_str(), device_path, HTTP_TIMEOUT)?;
            info!(url = http.url(), "pushing snapshots over HTTP");
            Arc::new(http)
        }
        None => Arc::new(LogSink::new(device_path)),
    };
    let policy = RetryPolicy {
        attempts: config.push_attempts,
        delay: config.push_retry_delay,
    };
    Ok(Arc::new(RetrySink::new(inner, policy)))
}
