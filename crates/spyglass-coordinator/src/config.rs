//! Coordinator configuration.
//!
//! Loaded from a TOML file; every field has a default so a minimal
//! config only needs the auth section. Durations accept humantime
//! strings (`"30s"`, `"2m"`).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level coordinator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Listener settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Probe authentication settings.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Admission ceilings.
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,

    /// Probe liveness settings.
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Scheduler settings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Logging settings.
    #[serde(default)]
    pub log: LogConfig,
}

/// Listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// TCP port for probe streams.
    #[serde(default = "default_probe_port")]
    pub probe_port: u16,

    /// HTTP/WebSocket port for client sessions.
    #[serde(default = "default_client_port")]
    pub client_port: u16,
}

const fn default_probe_port() -> u16 {
    50051
}

const fn default_client_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            probe_port: default_probe_port(),
            client_port: default_client_port(),
        }
    }
}

/// Probe authentication mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Shared secret only.
    ApiKey,
    /// Shared secret plus a network-layer allow-list.
    IpAllowlist,
}

/// Probe authentication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Authentication mode.
    #[serde(default = "default_auth_mode")]
    pub mode: AuthMode,

    /// Shared secret probes present at stream open.
    #[serde(default)]
    pub api_key: String,

    /// Allowed source addresses (single IPs or CIDR blocks); consulted
    /// only in `ip_allowlist` mode.
    #[serde(default)]
    pub ip_allowlist: Vec<String>,
}

const fn default_auth_mode() -> AuthMode {
    AuthMode::ApiKey
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: default_auth_mode(),
            api_key: String::new(),
            ip_allowlist: Vec::new(),
        }
    }
}

/// Admission ceilings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Global in-flight task ceiling across all probes.
    #[serde(default = "default_global_max")]
    pub global_max: usize,

    /// Fallback per-probe ceiling for probes that advertise none.
    #[serde(default = "default_probe_default_max")]
    pub probe_default_max: u32,
}

const fn default_global_max() -> usize {
    50
}

const fn default_probe_default_max() -> u32 {
    5
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            global_max: default_global_max(),
            probe_default_max: default_probe_default_max(),
        }
    }
}

/// Probe liveness settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// A probe whose last heartbeat is older than this is marked
    /// offline. Should exceed `heartbeat_interval` by a 2–3× factor.
    #[serde(default = "default_heartbeat_timeout")]
    #[serde(with = "humantime_serde")]
    pub heartbeat_timeout: Duration,

    /// Heartbeat interval handed to probes in the registration ack.
    #[serde(default = "default_heartbeat_interval")]
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Cadence of the background offline sweep.
    #[serde(default = "default_offline_check_interval")]
    #[serde(with = "humantime_serde")]
    pub offline_check_interval: Duration,
}

const fn default_heartbeat_timeout() -> Duration {
    Duration::from_secs(60)
}

const fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(30)
}

const fn default_offline_check_interval() -> Duration {
    Duration::from_secs(60)
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: default_heartbeat_timeout(),
            heartbeat_interval: default_heartbeat_interval(),
            offline_check_interval: default_offline_check_interval(),
        }
    }
}

/// Scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Output lines containing any of these substrings are suppressed
    /// before forwarding to clients (noisy tool banners).
    #[serde(default = "default_output_filter")]
    pub output_filter: Vec<String>,
}

fn default_output_filter() -> Vec<String> {
    vec![
        "MapTrace URL".to_string(),
        "NextTrace".to_string(),
        "IP Geo Data Provider".to_string(),
    ]
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            output_filter: default_output_filter(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level filter (`trace`..`error`).
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path; stdout when unset.
    #[serde(default)]
    pub file: Option<std::path::PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    /// The file is not valid TOML for this schema.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// The parsed config is inconsistent.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl CoordinatorConfig {
    /// Load and validate a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file is unreadable, unparsable,
    /// or fails validation.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first problem
    /// found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.api_key.is_empty() {
            return Err(ConfigError::Invalid("auth.api_key is required".to_string()));
        }
        if self.auth.mode == AuthMode::IpAllowlist && self.auth.ip_allowlist.is_empty() {
            return Err(ConfigError::Invalid(
                "auth.ip_allowlist cannot be empty in ip_allowlist mode".to_string(),
            ));
        }
        if self.concurrency.probe_default_max < 1 {
            return Err(ConfigError::Invalid(
                "concurrency.probe_default_max must be at least 1".to_string(),
            ));
        }
        if self.probe.heartbeat_timeout <= self.probe.heartbeat_interval {
            return Err(ConfigError::Invalid(
                "probe.heartbeat_timeout must exceed probe.heartbeat_interval".to_string(),
            ));
        }
        Ok(())
    }
}
