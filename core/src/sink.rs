//! Sink trait for the remote device-config surface
//!
//! The [`Sink`] receives the reducer's latest snapshot as a
//! [`DeviceConfig`] document and answers with the version the remote side
//! assigned. Authentication and transport belong to the implementation.

use crate::error::StageError;
use crate::wire::SinkSnapshot;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Device configuration document
///
/// `binaryData` carries the base64 of the snapshot JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Base64 body
    #[serde(rename = "binaryData")]
    pub binary_data: String,
}

impl DeviceConfig {
    /// Encode a snapshot into a config document
    pub fn from_snapshot(snapshot: &SinkSnapshot) -> Result<Self, StageError> {
        Ok(Self {
            binary_data: snapshot.to_base64()?,
        })
    }

    /// Decode the snapshot back out of the document
    pub fn snapshot(&self) -> Result<SinkSnapshot, StageError> {
        SinkSnapshot::from_base64(&self.binary_data)
    }
}

/// Sink trait - pushes config documents to the remote surface
///
/// # Implementation Requirements
///
/// - Must be `Send + Sync`; the pusher calls it from a spawned task
/// - `push` makes a single attempt. Retrying is layered on top by wrapping
///   the sink, so implementations should not loop internally
/// - Transient failures should map to [`StageError::Push`] or
///   [`StageError::Connection`]
///
/// # Example
///
/// ```ignore
/// use deluge_core::{DeviceConfig, Sink, StageError};
/// use async_trait::async_trait;
///
/// struct MemorySink(parking_lot::Mutex<Vec<DeviceConfig>>);
///
/// #[async_trait]
/// impl Sink for MemorySink {
///     fn name(&self) -> &'static str {
///         "memory"
///     }
///
///     async fn push(&self, config: &DeviceConfig) -> Result<i64, StageError> {
///         let mut configs = self.0.lock();
///         configs.push(config.clone());
///         Ok(configs.len() as i64)
///     }
/// }
/// ```
#[async_trait]
pub trait Sink: Send + Sync {
    /// Short name for logging
    fn name(&self) -> &'static str;

    /// Push one document, returning the remote version
    async fn push(&self, config: &DeviceConfig) -> Result<i64, StageError>;

    /// Whether the sink is reachable
    ///
    /// Defaults to `true` for sinks without a cheap probe.
    async fn health(&self) -> bool {
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_device_config_wire_name() {
        let config = DeviceConfig {
            binary_data: "e30=".to_string(),
        };
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(json, r#"{"binaryData":"e30="}"#);
    }

    #[test]
    fn test_device_config_carries_snapshot() {
        let snapshot = SinkSnapshot {
            mps: vec![100, 0, 0, 0, 0],
            total: 100,
        };
        let config = DeviceConfig::from_snapshot(&snapshot).unwrap();
        assert_eq!(config.snapshot().unwrap(), snapshot);
    }
}
