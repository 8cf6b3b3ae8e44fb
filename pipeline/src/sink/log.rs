//! Dry-run sink
//!
//! Logs each document instead of sending it anywhere and answers with a
//! local version counter, the way a remote config store bumps its version
//! on every write.

use async_trait::async_trait;
use deluge_core::{DeviceConfig, Sink, StageError};
use std::sync::atomic::{AtomicI64, Ordering};

/// Sink that logs documents
pub struct LogSink {
    device_path: String,
    version: AtomicI64,
}

impl LogSink {
    /// Log sink standing in for `device_path`
    pub fn new(device_path: impl Into<String>) -> Self {
        Self {
            device_path: device_path.into(),
            version: AtomicI64::new(0),
        }
    }

    /// Last version handed out
    pub fn version(&self) -> i64 {
        self.version.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Sink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn push(&self, config: &DeviceConfig) -> Result<i64, StageError> {
        let snapshot = config.snapshot()?;
        let version = self.version.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(
            device = %self.device_path,
            mps = ?snapshot.mps,
            total = snapshot.total,
            version = version,
            "device config (not sent)"
        );
        Ok(version)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use deluge_core::SinkSnapshot;

    #[tokio::test]
    async fn test_versions_increase_per_push() {
        let sink = LogSink::new("projects/p/locations/r/registries/g/devices/d");
        let config = DeviceConfig::from_snapshot(&SinkSnapshot {
            mps: vec![3],
            total: 3,
        })
        .unwrap();

        assert_eq!(sink.push(&config).await.unwrap(), 1);
        assert_eq!(sink.push(&config).await.unwrap(), 2);
        assert_eq!(sink.version(), 2);
    }

    #[tokio::test]
    async fn test_rejects_undecodable_document() {
        let sink = LogSink::new("d");
        let config = DeviceConfig {
            binary_data: "not base64!".into(),
        };
        assert!(matches!(
            sink.push(&config).await,
            Err(StageError::Decode(_))
        ));
        assert_eq!(sink.version(), 0);
    }
}
