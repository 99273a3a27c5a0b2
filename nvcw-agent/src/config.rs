//! Configuration management
//!
//! Handles:
//! - TOML file at the OS config location (or `NVCW_CONFIG`)
//! - Environment overrides (`NVCW_HOST`, `NVCW_INTERVAL`)
//! - Command-line overrides
//! - Validation into the immutable values the pipeline runs with

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::device::DevicePolicy;
use crate::error::ConfigError;
use crate::identity;
use crate::publisher::PublisherConfig;
use crate::retry::RetryPolicy;
use crate::scheduler::ScheduleConfig;

pub const CONFIG_ENV: &str = "NVCW_CONFIG";
pub const HOST_ENV: &str = "NVCW_HOST";
pub const INTERVAL_ENV: &str = "NVCW_INTERVAL";

pub const DEFAULT_NAMESPACE: &str = "nvcw";
pub const DEFAULT_INTERVAL_SECS: i64 = 60;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub agent: AgentSection,
    pub sink: SinkConfig,
    pub publish: PublishSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// Workstation label used as the `host` dimension
    pub host: Option<String>,
    pub namespace: String,
    pub interval_secs: i64,
    pub device_policy: DevicePolicy,
    /// Print one JSON line of snapshots per cycle on stdout
    pub emit_snapshots: bool,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            host: None,
            namespace: DEFAULT_NAMESPACE.to_string(),
            interval_secs: DEFAULT_INTERVAL_SECS,
            device_policy: DevicePolicy::Strict,
            emit_snapshots: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    #[default]
    Mqtt,
    Http,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub kind: SinkKind,
    pub mqtt: MqttConfig,
    pub http: HttpConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: Option<String>,
    pub keep_alive_secs: u16,
    pub topic_prefix: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            client_id: None,
            keep_alive_secs: 30,
            topic_prefix: "nvcw".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub endpoint: Option<String>,
    #[serde(skip_serializing)] // Never write tokens back out
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishSection {
    pub max_points_per_request: usize,
    pub max_payload_bytes: usize,
    pub request_timeout_ms: u64,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter: f64,
}

impl Default for PublishSection {
    fn default() -> Self {
        Self {
            max_points_per_request: 20,
            max_payload_bytes: 1024 * 1024,
            request_timeout_ms: 10_000,
            max_attempts: 3,
            base_backoff_ms: 500,
            max_backoff_ms: 10_000,
            jitter: 0.2,
        }
    }
}

/// Values given on the command line, highest precedence
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub host: Option<String>,
    pub interval_secs: Option<i64>,
    pub namespace: Option<String>,
    pub sink: Option<SinkKind>,
    pub device_policy: Option<DevicePolicy>,
}

/// Validated configuration, immutable for the life of the process
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schedule: ScheduleConfig,
    pub publisher: PublisherConfig,
    pub device_policy: DevicePolicy,
    pub sink: SinkConfig,
}

impl AgentConfig {
    /// Load from `explicit`, then `NVCW_CONFIG`, then the OS config location.
    /// Only the implicit default location may be missing.
    pub async fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load_from(path, true).await;
        }
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Self::load_from(Path::new(&path), true).await;
        }
        match Self::config_file_path() {
            Some(path) => Self::load_from(&path, false).await,
            None => Ok(Self::default()),
        }
    }

    pub async fn load_from(path: &Path, required: bool) -> Result<Self, ConfigError> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => {
                debug!(path = %path.display(), "Loading configuration");
                toml::from_str(&content).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
                debug!(path = %path.display(), "No configuration file, using defaults");
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// OS-specific config file path
    pub fn config_file_path() -> Option<PathBuf> {
        let mut path = dirs::config_dir()?;
        path.push("nvcw");
        path.push("config.toml");
        Some(path)
    }

    /// Apply environment overrides through `lookup` (usually `std::env::var`)
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup(HOST_ENV) {
            self.agent.host = Some(host);
        }
        if let Some(value) = lookup(INTERVAL_ENV) {
            self.agent.interval_secs = value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidEnv { name: INTERVAL_ENV, value })?;
        }
        Ok(())
    }

    pub fn apply_overrides(&mut self, overrides: Overrides) {
        if let Some(host) = overrides.host {
            self.agent.host = Some(host);
        }
        if let Some(interval) = overrides.interval_secs {
            self.agent.interval_secs = interval;
        }
        if let Some(namespace) = overrides.namespace {
            self.agent.namespace = namespace;
        }
        if let Some(kind) = overrides.sink {
            self.sink.kind = kind;
        }
        if let Some(policy) = overrides.device_policy {
            self.agent.device_policy = policy;
        }
    }

    /// Validate; `detect_host` is consulted only when no label is configured
    pub fn resolve<F>(self, detect_host: F) -> Result<ResolvedConfig, ConfigError>
    where
        F: FnOnce() -> Option<String>,
    {
        if self.agent.interval_secs <= 0 {
            return Err(ConfigError::InvalidInterval(self.agent.interval_secs));
        }
        let configured = self.agent.host.as_deref().and_then(identity::normalize_label);
        let host = configured.or_else(detect_host).ok_or(ConfigError::EmptyHost)?;

        let namespace = self.agent.namespace.trim().to_string();
        if namespace.is_empty() {
            return Err(ConfigError::EmptyNamespace);
        }

        let publish = &self.publish;
        if publish.max_points_per_request == 0 {
            return Err(ConfigError::InvalidLimit { field: "max_points_per_request" });
        }
        if publish.max_payload_bytes == 0 {
            return Err(ConfigError::InvalidLimit { field: "max_payload_bytes" });
        }
        if publish.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidLimit { field: "request_timeout_ms" });
        }
        if publish.max_attempts == 0 {
            return Err(ConfigError::InvalidLimit { field: "max_attempts" });
        }
        if self.sink.kind == SinkKind::Http && self.sink.http.endpoint.is_none() {
            return Err(ConfigError::MissingEndpoint);
        }

        let publisher = PublisherConfig {
            max_points_per_request: publish.max_points_per_request,
            max_payload_bytes: publish.max_payload_bytes,
            request_timeout: Duration::from_millis(publish.request_timeout_ms),
            retry: RetryPolicy {
                max_attempts: publish.max_attempts,
                base_delay: Duration::from_millis(publish.base_backoff_ms),
                max_delay: Duration::from_millis(publish.max_backoff_ms),
                jitter: publish.jitter.clamp(0.0, 1.0),
            },
        };

        Ok(ResolvedConfig {
            schedule: ScheduleConfig {
                host,
                namespace,
                interval: Duration::from_secs(self.agent.interval_secs as u64),
                emit_snapshots: self.agent.emit_snapshots,
            },
            publisher,
            device_policy: self.agent.device_policy,
            sink: self.sink,
        })
    }
}
