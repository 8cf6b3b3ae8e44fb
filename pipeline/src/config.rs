//! Pipeline configuration
//!
//! Loaded from `DELUGE_*` environment variables. Every field has a default,
//! so an empty environment yields a runnable single-process pipeline with
//! a dry-run sink.

use crate::error::{DelugeError, Result};
use crate::stage::knobs::DerivationPolicy;
use crate::stage::source::LoadShape;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = DelugeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(DelugeError::Config(format!("unknown log format '{other}'"))),
        }
    }
}

/// Which stages a process runs
///
/// Single-stage roles need a bus shared with the other processes; the
/// in-process bus only carries `All`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    /// Every stage plus the simulator, on one in-process bus
    #[default]
    All,
    /// Knob state aggregator
    Knobs,
    /// Amplifier
    Flood,
    /// Counter
    Map,
    /// Aggregation + sink pusher
    Reduce,
    /// Knob simulator
    Simulate,
}

impl FromStr for Role {
    type Err = DelugeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(Role::All),
            "knobs" => Ok(Role::Knobs),
            "flood" => Ok(Role::Flood),
            "map" | "mapper" => Ok(Role::Map),
            "reduce" | "reducer" => Ok(Role::Reduce),
            "simulate" | "simulate-knobs" => Ok(Role::Simulate),
            other => Err(DelugeError::Config(format!("unknown role '{other}'"))),
        }
    }
}

/// Topic names for each stage edge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicNames {
    /// Knob updates (source → aggregator)
    pub knobs: String,
    /// Amplification vectors (aggregator → amplifier)
    pub flood: String,
    /// Tagged events (amplifier → mapper)
    pub mapper: String,
    /// Count vectors (mapper → reducer)
    pub reducer: String,
}

impl Default for TopicNames {
    fn default() -> Self {
        Self {
            knobs: "knobs".to_string(),
            flood: "flood".to_string(),
            mapper: "mapper".to_string(),
            reducer: "reducer".to_string(),
        }
    }
}

/// Remote device coordinates, used to build the config document path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePath {
    pub region: String,
    pub registry: String,
    pub device: String,
}

impl Default for DevicePath {
    fn default() -> Self {
        Self {
            region: "us-central1".to_string(),
            registry: "registry".to_string(),
            device: "device".to_string(),
        }
    }
}

impl DevicePath {
    /// `projects/{p}/locations/{r}/registries/{g}/devices/{d}`
    pub fn resource_name(&self, project: &str) -> String {
        format!(
            "projects/{}/locations/{}/registries/{}/devices/{}",
            project, self.region, self.registry, self.device
        )
    }
}

/// Simulated load settings
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationConfig {
    pub shape: LoadShape,
    /// Constant value, or peak of the sine
    pub amplitude: i64,
    /// Knob `i` publishes every `(i + 1) × interval`
    pub interval: Duration,
    /// Knob `i` completes a half sine every `(i + 1) × cycle`
    pub cycle: Duration,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            shape: LoadShape::Constant,
            amplitude: 10_000,
            interval: Duration::from_millis(250),
            cycle: Duration::from_secs(20),
        }
    }
}

/// Full process configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Project / credentials identifier
    pub project: String,
    /// Number of knobs (N)
    pub knob_count: usize,
    pub topics: TopicNames,

    /// Knob aggregator window
    pub knob_window: Duration,
    pub derivation: DerivationPolicy,

    /// Mapper rollup window
    pub mapper_window: Duration,
    pub mapper_workers: usize,

    /// Reducer rollup window
    pub reducer_window: Duration,
    pub reducer_workers: usize,

    /// Sink push cadence
    pub push_interval: Duration,
    /// Total push attempts per cycle
    pub push_attempts: u32,
    pub push_retry_delay: Duration,
    /// Serialize snapshots but never push them
    pub dry_run: bool,
    /// HTTP device-config endpoint; dry-run sink when unset
    pub sink_url: Option<String>,
    pub device: DevicePath,

    pub simulation: SimulationConfig,
    /// Delay after the final zero updates so publishes can flush
    pub shutdown_grace: Duration,

    /// Bound of each in-process subscription queue
    pub subscription_capacity: usize,

    pub metrics_addr: SocketAddr,
    pub log_level: String,
    pub log_format: LogFormat,
    pub role: Role,
}

impl Default for Config {
    fn default() -> Self {
        let workers = default_workers();
        Self {
            project: "local".to_string(),
            knob_count: 5,
            topics: TopicNames::default(),
            knob_window: Duration::from_secs(1),
            derivation: DerivationPolicy::PassThrough,
            mapper_window: Duration::from_millis(100),
            mapper_workers: workers,
            reducer_window: Duration::from_secs(1),
            reducer_workers: workers,
            push_interval: Duration::from_secs(1),
            push_attempts: 10,
            push_retry_delay: Duration::from_millis(100),
            dry_run: false,
            sink_url: None,
            device: DevicePath::default(),
            simulation: SimulationConfig::default(),
            shutdown_grace: Duration::from_secs(1),
            subscription_capacity: 65_536,
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            role: Role::All,
        }
    }
}

/// Twice the available parallelism
fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(8)
}

impl Config {
    /// Load from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup
    ///
    /// Unset keys keep their defaults; set keys that fail to parse are
    /// configuration errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut cfg = Config::default();

        if let Some(project) = get("DELUGE_PROJECT").or_else(|| get("PROJECT")) {
            cfg.project = project;
        }
        parse_into(&get, "DELUGE_KNOBS", &mut cfg.knob_count)?;

        if let Some(v) = get("DELUGE_KNOBS_TOPIC") {
            cfg.topics.knobs = v;
        }
        if let Some(v) = get("DELUGE_FLOOD_TOPIC") {
            cfg.topics.flood = v;
        }
        if let Some(v) = get("DELUGE_MAPPER_TOPIC") {
            cfg.topics.mapper = v;
        }
        if let Some(v) = get("DELUGE_REDUCER_TOPIC") {
            cfg.topics.reducer = v;
        }

        millis_into(&get, "DELUGE_KNOB_WINDOW_MS", &mut cfg.knob_window)?;
        let mut rate_scaled = false;
        parse_bool_into(&get, "DELUGE_RATE_SCALED", &mut rate_scaled)?;
        if rate_scaled {
            cfg.derivation = DerivationPolicy::RateScaled;
        }

        millis_into(&get, "DELUGE_MAPPER_WINDOW_MS", &mut cfg.mapper_window)?;
        parse_into(&get, "DELUGE_MAPPER_WORKERS", &mut cfg.mapper_workers)?;
        millis_into(&get, "DELUGE_REDUCER_WINDOW_MS", &mut cfg.reducer_window)?;
        parse_into(&get, "DELUGE_REDUCER_WORKERS", &mut cfg.reducer_workers)?;

        millis_into(&get, "DELUGE_PUSH_INTERVAL_MS", &mut cfg.push_interval)?;
        parse_into(&get, "DELUGE_PUSH_ATTEMPTS", &mut cfg.push_attempts)?;
        millis_into(&get, "DELUGE_PUSH_RETRY_DELAY_MS", &mut cfg.push_retry_delay)?;
        parse_bool_into(&get, "DELUGE_DRY_RUN", &mut cfg.dry_run)?;
        cfg.sink_url = get("DELUGE_SINK_URL");

        if let Some(v) = get("DELUGE_REGION") {
            cfg.device.region = v;
        }
        if let Some(v) = get("DELUGE_REGISTRY") {
            cfg.device.registry = v;
        }
        if let Some(v) = get("DELUGE_DEVICE") {
            cfg.device.device = v;
        }

        parse_into(&get, "DELUGE_SIM_MODE", &mut cfg.simulation.shape)?;
        parse_into(&get, "DELUGE_SIM_AMPLITUDE", &mut cfg.simulation.amplitude)?;
        millis_into(&get, "DELUGE_SIM_INTERVAL_MS", &mut cfg.simulation.interval)?;
        let mut cycle_secs = cfg.simulation.cycle.as_secs();
        parse_into(&get, "DELUGE_SIM_CYCLE_SECS", &mut cycle_secs)?;
        cfg.simulation.cycle = Duration::from_secs(cycle_secs);
        millis_into(&get, "DELUGE_SHUTDOWN_GRACE_MS", &mut cfg.shutdown_grace)?;

        parse_into(
            &get,
            "DELUGE_SUBSCRIPTION_CAPACITY",
            &mut cfg.subscription_capacity,
        )?;
        parse_into(&get, "DELUGE_METRICS_ADDR", &mut cfg.metrics_addr)?;
        if let Some(v) = get("DELUGE_LOG_LEVEL") {
            cfg.log_level = v;
        }
        parse_into(&get, "DELUGE_LOG_FORMAT", &mut cfg.log_format)?;
        parse_into(&get, "DELUGE_ROLE", &mut cfg.role)?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.knob_count == 0 {
            return Err(DelugeError::Config("DELUGE_KNOBS must be > 0".into()));
        }
        let windows = [
            ("DELUGE_KNOB_WINDOW_MS", self.knob_window),
            ("DELUGE_MAPPER_WINDOW_MS", self.mapper_window),
            ("DELUGE_REDUCER_WINDOW_MS", self.reducer_window),
            ("DELUGE_PUSH_INTERVAL_MS", self.push_interval),
            ("DELUGE_SIM_INTERVAL_MS", self.simulation.interval),
        ];
        for (name, period) in windows {
            if period.is_zero() {
                return Err(DelugeError::Config(format!("{name} must be > 0")));
            }
        }
        if self.simulation.cycle.is_zero() {
            return Err(DelugeError::Config("DELUGE_SIM_CYCLE_SECS must be > 0".into()));
        }
        if self.push_attempts == 0 {
            return Err(DelugeError::Config("DELUGE_PUSH_ATTEMPTS must be > 0".into()));
        }
        if self.mapper_workers == 0 || self.reducer_workers == 0 {
            return Err(DelugeError::Config("worker counts must be > 0".into()));
        }
        if self.subscription_capacity == 0 {
            return Err(DelugeError::Config(
                "DELUGE_SUBSCRIPTION_CAPACITY must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Full device resource name for this project
    pub fn device_path(&self) -> String {
        self.device.resource_name(&self.project)
    }
}

fn parse_into<G, T>(get: &G, key: &str, target: &mut T) -> Result<()>
where
    G: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = get(key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|e| DelugeError::Config(format!("{key}={raw:?}: {e}")))?;
    }
    Ok(())
}

fn millis_into<G>(get: &G, key: &str, target: &mut Duration) -> Result<()>
where
    G: Fn(&str) -> Option<String>,
{
    let mut ms = target.as_millis() as u64;
    parse_into(get, key, &mut ms)?;
    *target = Duration::from_millis(ms);
    Ok(())
}

fn parse_bool_into<G>(get: &G, key: &str, target: &mut bool) -> Result<()>
where
    G: Fn(&str) -> Option<String>,
{
    if let Some(raw) = get(key) {
        *target = match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => {
                return Err(DelugeError::Config(format!(
                    "{key}={raw:?}: expected a boolean"
                )));
            }
        };
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<Config> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = load(&[]).unwrap();
        assert_eq!(cfg.knob_count, 5);
        assert_eq!(cfg.knob_window, Duration::from_secs(1));
        assert_eq!(cfg.mapper_window, Duration::from_millis(100));
        assert_eq!(cfg.reducer_window, Duration::from_secs(1));
        assert_eq!(cfg.push_attempts, 10);
        assert_eq!(cfg.push_retry_delay, Duration::from_millis(100));
        assert_eq!(cfg.derivation, DerivationPolicy::PassThrough);
        assert_eq!(cfg.simulation.shape, LoadShape::Constant);
        assert_eq!(cfg.simulation.amplitude, 10_000);
        assert_eq!(cfg.topics, TopicNames::default());
        assert!(!cfg.dry_run);
        assert!(cfg.sink_url.is_none());
        assert_eq!(cfg.role, Role::All);
    }

    #[test]
    fn test_overrides() {
        let cfg = load(&[
            ("PROJECT", "fallback"),
            ("DELUGE_KNOBS", "3"),
            ("DELUGE_MAPPER_WINDOW_MS", "50"),
            ("DELUGE_RATE_SCALED", "true"),
            ("DELUGE_DRY_RUN", "1"),
            ("DELUGE_SIM_MODE", "sine"),
            ("DELUGE_FLOOD_TOPIC", "flood-v2"),
            ("DELUGE_LOG_FORMAT", "json"),
            ("DELUGE_ROLE", "reducer"),
        ])
        .unwrap();
        assert_eq!(cfg.project, "fallback");
        assert_eq!(cfg.knob_count, 3);
        assert_eq!(cfg.mapper_window, Duration::from_millis(50));
        assert_eq!(cfg.derivation, DerivationPolicy::RateScaled);
        assert!(cfg.dry_run);
        assert_eq!(cfg.simulation.shape, LoadShape::Sine);
        assert_eq!(cfg.topics.flood, "flood-v2");
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert_eq!(cfg.role, Role::Reduce);
    }

    #[test]
    fn test_deluge_project_wins_over_project() {
        let cfg = load(&[("PROJECT", "a"), ("DELUGE_PROJECT", "b")]).unwrap();
        assert_eq!(cfg.project, "b");
    }

    #[test]
    fn test_parse_error_names_the_key() {
        let err = load(&[("DELUGE_KNOBS", "many")]).unwrap_err();
        assert!(err.to_string().contains("DELUGE_KNOBS"));
    }

    #[test]
    fn test_zero_knobs_rejected() {
        assert!(matches!(
            load(&[("DELUGE_KNOBS", "0")]),
            Err(DelugeError::Config(_))
        ));
    }

    #[test]
    fn test_zero_window_rejected() {
        assert!(load(&[("DELUGE_REDUCER_WINDOW_MS", "0")]).is_err());
        assert!(load(&[("DELUGE_PUSH_ATTEMPTS", "0")]).is_err());
    }

    #[test]
    fn test_bad_bool_rejected() {
        assert!(load(&[("DELUGE_DRY_RUN", "maybe")]).is_err());
    }

    #[test]
    fn test_device_path() {
        let cfg = load(&[("DELUGE_PROJECT", "p1"), ("DELUGE_DEVICE", "dev-7")]).unwrap();
        assert_eq!(
            cfg.device_path(),
            "projects/p1/locations/us-central1/registries/registry/devices/dev-7"
        );
    }
}
