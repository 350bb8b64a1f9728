//! Configuration types for the acquisition agent
//!
//! The agent consumes a read-only configuration snapshot on start (and on
//! hot-reload by the host). All tunables carry serde defaults so a minimal
//! file only needs the server list.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::error::{Result, SiphonError};

/// Log verbosity for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// One monitored node on an OPC UA server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionDef {
    /// OPC UA node id, e.g. "ns=2;s=Line1.Temperature"
    pub node_id: String,

    /// Human-readable name shown on dashboards
    #[serde(default)]
    pub display_name: String,

    /// Hierarchical browse path, independent of the node id
    #[serde(default)]
    pub browse_path: String,

    /// Server-side sampling interval in milliseconds
    #[serde(default = "default_sampling_interval_ms")]
    pub sampling_interval_ms: u64,

    /// Requested publishing interval in milliseconds
    #[serde(default = "default_publishing_interval_ms")]
    pub publishing_interval_ms: u64,

    /// Server-side monitored item queue size
    #[serde(default = "default_item_queue_size")]
    pub queue_size: u32,

    /// Discard the oldest queued value when the server-side queue is full
    #[serde(default = "default_true")]
    pub discard_oldest: bool,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// One OPC UA server endpoint and its subscriptions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Unique, non-empty identifier stamped onto every Sample
    pub id: String,

    /// Display name; falls back to the id when empty
    #[serde(default)]
    pub name: String,

    /// Endpoint URL, e.g. "opc.tcp://10.0.0.5:4840"
    pub endpoint_url: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Session timeout override in milliseconds
    #[serde(default)]
    pub session_timeout_ms: Option<u64>,

    /// Keepalive interval override in milliseconds
    #[serde(default)]
    pub keepalive_interval_ms: Option<u64>,

    #[serde(default)]
    pub subscriptions: Vec<SubscriptionDef>,
}

impl ServerConfig {
    /// Validate the per-server invariants enforced at config intake.
    ///
    /// A failing server is rejected before any runtime is created for it;
    /// sibling servers are unaffected.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(SiphonError::Config("server id must not be empty".to_string()));
        }
        if self.endpoint_url.trim().is_empty() {
            return Err(SiphonError::Config(format!(
                "server '{}': endpoint URL must not be empty",
                self.id
            )));
        }
        for sub in &self.subscriptions {
            if sub.node_id.trim().is_empty() {
                return Err(SiphonError::Config(format!(
                    "server '{}': subscription node id must not be empty",
                    self.id
                )));
            }
        }
        Ok(())
    }

    /// Display name with the id as fallback
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// Top-level agent configuration snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// MongoDB connection string
    #[serde(default = "default_connection_string")]
    pub connection_string: String,

    #[serde(default = "default_database")]
    pub database: String,

    #[serde(default = "default_collection")]
    pub collection: String,

    /// Ingress queue capacity (drop-oldest beyond this)
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Maximum samples per persisted batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Batch assembly deadline in milliseconds
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,

    /// Per-call deadline for primary writes, seconds
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,

    /// Health probe cadence, seconds
    #[serde(default = "default_health_interval_secs")]
    pub health_check_interval_secs: u64,

    /// Health probe timeout, seconds
    #[serde(default = "default_health_probe_timeout_secs")]
    pub health_probe_timeout_secs: u64,

    /// Consecutive probe failures before Unhealthy
    #[serde(default = "default_health_failure_threshold")]
    pub health_failure_threshold: u32,

    /// Probe round-trip above this is classified Degraded, milliseconds
    #[serde(default = "default_latency_degraded_ms")]
    pub health_latency_degraded_ms: u64,

    /// Consecutive primary failures before the circuit opens
    #[serde(default = "default_breaker_threshold")]
    pub breaker_failure_threshold: u32,

    /// Open-circuit cooldown before a half-open probe, seconds
    #[serde(default = "default_breaker_cooldown_secs")]
    pub breaker_cooldown_secs: u64,

    /// Document TTL in days; 0 disables the expiry index
    #[serde(default)]
    pub ttl_days: u32,

    /// Default OPC UA session timeout, milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub default_session_timeout_ms: u64,

    /// Default keepalive interval, milliseconds
    #[serde(default = "default_keepalive_interval_ms")]
    pub default_keepalive_interval_ms: u64,

    #[serde(default)]
    pub servers: Vec<ServerConfig>,

    /// Operator override: route everything to the fallback sink
    #[serde(default)]
    pub force_fallback: bool,

    /// Operator override: count batches, write nowhere
    #[serde(default)]
    pub dry_run: bool,

    /// Fallback directory; empty means the OS user-data default
    #[serde(default)]
    pub fallback_dir: Option<PathBuf>,

    /// Days to keep archived fallback files; 0 disables the purge
    #[serde(default = "default_archive_retention_days")]
    pub archive_retention_days: u32,

    #[serde(default)]
    pub log_level: LogLevel,

    /// Log file path (None = stdout)
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty config deserializes via defaults")
    }
}

impl AgentConfig {
    /// Load and validate a configuration snapshot from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SiphonError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: AgentConfig = serde_json::from_str(&raw)
            .map_err(|e| SiphonError::Config(format!("cannot parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the global invariants. Per-server checks live on
    /// [`ServerConfig::validate`] so one bad server does not reject the rest.
    pub fn validate(&self) -> Result<()> {
        if self.connection_string.trim().is_empty() {
            return Err(SiphonError::Config("connection string must not be empty".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(SiphonError::Config("queue capacity must be at least 1".to_string()));
        }
        if self.batch_size == 0 {
            return Err(SiphonError::Config("batch size must be at least 1".to_string()));
        }
        let mut seen = std::collections::HashSet::new();
        for server in &self.servers {
            if !server.id.trim().is_empty() && !seen.insert(server.id.as_str()) {
                return Err(SiphonError::Config(format!(
                    "duplicate server id '{}'",
                    server.id
                )));
            }
        }
        Ok(())
    }

    /// Resolved fallback data directory.
    pub fn fallback_dir(&self) -> PathBuf {
        if let Some(dir) = &self.fallback_dir {
            if !dir.as_os_str().is_empty() {
                return dir.clone();
            }
        }
        directories::ProjectDirs::from("", "", "siphon")
            .map(|dirs| dirs.data_dir().join("fallback"))
            .unwrap_or_else(|| PathBuf::from(".").join("siphon-fallback"))
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn health_probe_timeout(&self) -> Duration {
        Duration::from_secs(self.health_probe_timeout_secs)
    }

    pub fn health_latency_degraded(&self) -> Duration {
        Duration::from_millis(self.health_latency_degraded_ms)
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.breaker_cooldown_secs)
    }

    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl_days > 0).then(|| Duration::from_secs(u64::from(self.ttl_days) * 86_400))
    }

    pub fn archive_retention(&self) -> Option<Duration> {
        (self.archive_retention_days > 0)
            .then(|| Duration::from_secs(u64::from(self.archive_retention_days) * 86_400))
    }
}

fn default_true() -> bool {
    true
}

fn default_sampling_interval_ms() -> u64 {
    1_000
}

fn default_publishing_interval_ms() -> u64 {
    1_000
}

fn default_item_queue_size() -> u32 {
    10
}

fn default_connection_string() -> String {
    "mongodb://localhost:27017".to_string()
}

fn default_database() -> String {
    "telemetry".to_string()
}

fn default_collection() -> String {
    "datapoints".to_string()
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_batch_size() -> usize {
    500
}

fn default_batch_timeout_ms() -> u64 {
    1_000
}

fn default_write_timeout_secs() -> u64 {
    5
}

fn default_health_interval_secs() -> u64 {
    5
}

fn default_health_probe_timeout_secs() -> u64 {
    2
}

fn default_health_failure_threshold() -> u32 {
    3
}

fn default_latency_degraded_ms() -> u64 {
    500
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_cooldown_secs() -> u64 {
    30
}

fn default_session_timeout_ms() -> u64 {
    60_000
}

fn default_keepalive_interval_ms() -> u64 {
    5_000
}

fn default_archive_retention_days() -> u32 {
    30
}
