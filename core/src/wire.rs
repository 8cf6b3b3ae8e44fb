//! Wire payloads exchanged between stages
//!
//! Field names are fixed by the bus contract:
//!
//! | Payload | Shape |
//! |---|---|
//! | [`KnobUpdate`] | `{"id": 0, "n": 100, "ts": 1.5}` |
//! | [`FloodVector`] | `{"Ns": [100, 0, 0, 0, 0]}` |
//! | [`CountVector`] | `{"Messages": [98, 0, 0, 0, 0]}` |
//! | [`SinkSnapshot`] | `{"mps": [..], "total": 1234}` (base64 on the sink transport) |
//! | [`TaggedEvent`] | knob id as lowercase hex text, no JSON |

use crate::error::StageError;
use base64::Engine as _;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// JSON encode/decode for stage payloads
pub trait WirePayload: Serialize + DeserializeOwned {
    /// Serialize to JSON bytes
    fn encode(&self) -> Result<Bytes, StageError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| StageError::Decode(format!("encode: {e}")))
    }

    /// Deserialize from JSON bytes
    fn decode(data: &[u8]) -> Result<Self, StageError> {
        serde_json::from_slice(data).map_err(|e| StageError::Decode(e.to_string()))
    }
}

/// Intent update for one knob
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KnobUpdate {
    /// Knob id
    pub id: i64,
    /// Desired event count for the next window
    pub n: i64,
    /// Seconds, used only for last-write-wins
    pub ts: f64,
}

impl KnobUpdate {
    /// Create an update stamped with the current wall-clock time
    pub fn now(id: usize, n: i64) -> Self {
        Self {
            id: id as i64,
            n,
            ts: unix_seconds(),
        }
    }

    /// Lenient field extraction
    ///
    /// Numbers are accepted in either integer or float form (`"id": 2.0`
    /// is knob 2). Missing fields and non-numeric values are decode errors.
    fn from_value(value: &serde_json::Value) -> Result<Self, StageError> {
        let obj = value
            .as_object()
            .ok_or_else(|| StageError::Decode("knob update is not an object".into()))?;

        let int_field = |name: &str| -> Result<i64, StageError> {
            let v = obj
                .get(name)
                .ok_or_else(|| StageError::Decode(format!("missing field '{name}'")))?;
            v.as_i64()
                .or_else(|| v.as_f64().map(|f| f as i64))
                .ok_or_else(|| StageError::Decode(format!("field '{name}' is not a number")))
        };

        let ts = obj
            .get("ts")
            .ok_or_else(|| StageError::Decode("missing field 'ts'".into()))?
            .as_f64()
            .ok_or_else(|| StageError::Decode("field 'ts' is not a number".into()))?;

        Ok(Self {
            id: int_field("id")?,
            n: int_field("n")?,
            ts,
        })
    }
}

impl WirePayload for KnobUpdate {
    fn decode(data: &[u8]) -> Result<Self, StageError> {
        let value: serde_json::Value =
            serde_json::from_slice(data).map_err(|e| StageError::Decode(e.to_string()))?;
        Self::from_value(&value)
    }
}

/// Per-window amplification vector, one count per knob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloodVector {
    /// Count per knob, index = knob id
    #[serde(rename = "Ns")]
    pub ns: Vec<i64>,
}

impl FloodVector {
    /// Wrap per-knob counts
    pub fn new(ns: Vec<i64>) -> Self {
        Self { ns }
    }

    /// Sum of all entries, negative ones included
    pub fn sum(&self) -> i64 {
        self.ns.iter().fold(0i64, |acc, n| acc.saturating_add(*n))
    }

    /// Number of events the amplifier will emit (negative entries emit nothing)
    pub fn emit_count(&self) -> u64 {
        self.ns
            .iter()
            .filter(|n| **n > 0)
            .fold(0u64, |acc, n| acc.saturating_add(*n as u64))
    }
}

impl WirePayload for FloodVector {}

/// Per-window event counts from one mapper
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountVector {
    /// Count per knob, index = knob id
    #[serde(rename = "Messages")]
    pub messages: Vec<i64>,
}

impl CountVector {
    /// Wrap per-knob counts
    pub fn new(messages: Vec<i64>) -> Self {
        Self { messages }
    }

    /// Window total
    pub fn sum(&self) -> i64 {
        self.messages.iter().fold(0i64, |acc, n| acc.saturating_add(*n))
    }
}

impl WirePayload for CountVector {}

/// Snapshot pushed to the sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkSnapshot {
    /// Per-knob messages in the last reducer window
    pub mps: Vec<i64>,
    /// Running total since process start
    pub total: i64,
}

impl SinkSnapshot {
    /// JSON document, base64-encoded for the sink transport body
    pub fn to_base64(&self) -> Result<String, StageError> {
        let json = self.encode()?;
        Ok(base64::engine::general_purpose::STANDARD.encode(&json))
    }

    /// Inverse of [`SinkSnapshot::to_base64`]
    pub fn from_base64(data: &str) -> Result<Self, StageError> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| StageError::Decode(format!("base64: {e}")))?;
        Self::decode(&raw)
    }
}

impl WirePayload for SinkSnapshot {}

/// A single discrete event carrying only a knob id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaggedEvent(pub usize);

impl TaggedEvent {
    /// Lowercase hex text of the knob id
    pub fn encode(&self) -> Bytes {
        Bytes::from(format!("{:x}", self.0))
    }

    /// Parse hex text; range checking is the caller's job
    pub fn decode(data: &[u8]) -> Result<Self, StageError> {
        let text = std::str::from_utf8(data)
            .map_err(|_| StageError::Decode("tagged event is not UTF-8".into()))?;
        usize::from_str_radix(text, 16)
            .map(TaggedEvent)
            .map_err(|e| StageError::Decode(format!("tagged event {text:?}: {e}")))
    }
}

/// Wall-clock seconds since the Unix epoch, as used in `ts`
pub fn unix_seconds() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_nanos()) / 1_000_000_000.0
}
