//! Probe configuration.
//!
//! Loaded from a TOML file. The executor task table is merged over
//! built-in defaults for `ping`, `mtr`, and `nexttrace`: a user entry
//! overrides field-by-field, and tasks the defaults don't know become
//! custom command tasks (which must name an executable).

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use spyglass_core::backoff::BackoffConfig;

/// Top-level probe configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProbeDaemonConfig {
    /// Identity and metadata advertised at registration.
    #[serde(default)]
    pub probe: ProbeIdentity,

    /// Coordinator endpoint and credentials.
    #[serde(default)]
    pub coordinator: CoordinatorLink,

    /// Task table and concurrency ceilings.
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Logging settings.
    #[serde(default)]
    pub log: LogConfig,
}

/// Probe identity advertised at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeIdentity {
    /// Operator-chosen unique id.
    #[serde(default)]
    pub id: String,

    /// Display name for frontends.
    #[serde(default)]
    pub name: String,

    /// Public IPv4 address; auto-detected when empty.
    #[serde(default)]
    pub ipv4: String,

    /// Public IPv6 address; auto-detected when empty.
    #[serde(default)]
    pub ipv6: String,

    /// Ask the coordinator to mask addresses before disclosure.
    #[serde(default)]
    pub hide_ip: bool,

    /// Per-probe admission ceiling advertised to the coordinator.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,

    /// Descriptive metadata.
    #[serde(default)]
    pub metadata: ProbeMetadata,
}

const fn default_max_concurrent() -> u32 {
    5
}

impl Default for ProbeIdentity {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            ipv4: String::new(),
            ipv6: String::new(),
            hide_ip: false,
            max_concurrent: default_max_concurrent(),
            metadata: ProbeMetadata::default(),
        }
    }
}

/// Descriptive probe metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProbeMetadata {
    /// Geographic location ("Los Angeles", "Singapore").
    #[serde(default)]
    pub location: String,

    /// Service provider ("AWS", "Vultr").
    #[serde(default)]
    pub provider: String,

    /// Data-center identifier ("us-west-1a", "sgp1").
    #[serde(default)]
    pub idc: String,

    /// Free-form description.
    #[serde(default)]
    pub description: String,
}

/// Coordinator endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorLink {
    /// Coordinator address, `host:port`.
    #[serde(default)]
    pub host: String,

    /// Shared secret presented at stream open.
    #[serde(default)]
    pub api_key: String,

    /// Heartbeat cadence; the registration ack may override it.
    #[serde(default = "default_heartbeat_interval")]
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Reconnect backoff policy.
    #[serde(default)]
    pub backoff: BackoffConfig,
}

const fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(30)
}

impl Default for CoordinatorLink {
    fn default() -> Self {
        Self {
            host: String::new(),
            api_key: String::new(),
            heartbeat_interval: default_heartbeat_interval(),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Executor settings: global ceiling and the task table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Global max concurrent tasks across all names.
    #[serde(default = "default_global_concurrency")]
    pub global_concurrency: usize,

    /// Default overall task timeout.
    #[serde(default = "default_task_timeout")]
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,

    /// Task table keyed by task name.
    #[serde(default)]
    pub tasks: HashMap<String, TaskEntry>,
}

const fn default_global_concurrency() -> usize {
    10
}

const fn default_task_timeout() -> Duration {
    Duration::from_secs(300)
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            global_concurrency: default_global_concurrency(),
            default_timeout: default_task_timeout(),
            tasks: HashMap::new(),
        }
    }
}

/// One task table entry as written in the config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskEntry {
    /// Disabled entries are omitted from the advertised descriptors.
    /// `None` means enabled.
    #[serde(default)]
    pub enabled: Option<bool>,

    /// Display name; falls back to the task name.
    #[serde(default)]
    pub display_name: String,

    /// Free-form description advertised to clients.
    #[serde(default)]
    pub description: String,

    /// Whether submissions must carry a target. `None` means required.
    #[serde(default)]
    pub requires_target: Option<bool>,

    /// Executor override; custom tasks must set a path.
    #[serde(default)]
    pub executor: Option<ExecutorSpec>,

    /// Per-name concurrency ceiling.
    #[serde(default)]
    pub concurrency: ConcurrencyEntry,
}

/// Executor specification for a task entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutorSpec {
    /// Path to the executable.
    #[serde(default)]
    pub path: String,

    /// Default arguments; `{target}`, `{count}`, `{timeout}` and
    /// `{ipv6}` placeholders are substituted at dispatch.
    #[serde(default)]
    pub default_args: Vec<String>,

    /// Output line formatter.
    #[serde(default)]
    pub line_formatter: Option<LineFormatter>,
}

/// Output line formatters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineFormatter {
    /// Forward stdout lines verbatim.
    None,
    /// Append a trailing newline (for tools whose output lacks it).
    Newline,
}

/// Per-name concurrency ceiling.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ConcurrencyEntry {
    /// Max concurrent tasks for this name; 0 means unset.
    #[serde(default)]
    pub max: usize,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level filter.
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

/// Built-in executor families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorKind {
    /// `ping -c N -W T -4|-6 target`
    Ping,
    /// `mtr --report --report-cycles N --no-dns -4|-6 --report-wide target`
    Mtr,
    /// `nexttrace -4|-6 -m N -t T [extras] target`
    Nexttrace,
    /// Configured command with placeholder substitution.
    Command,
}

/// Fully resolved task: config entry merged with built-in defaults,
/// ready for the runtime table and descriptor list.
#[derive(Debug, Clone)]
pub struct ResolvedTask {
    /// Task name (table key).
    pub name: String,
    /// Display name (falls back to the task name).
    pub display_name: String,
    /// Description advertised to clients.
    pub description: String,
    /// Whether submissions must carry a target.
    pub requires_target: bool,
    /// Executor family.
    pub kind: ExecutorKind,
    /// Executable path.
    pub path: String,
    /// Default arguments (placeholder substitution for `Command`).
    pub default_args: Vec<String>,
    /// Output line formatter.
    pub line_formatter: LineFormatter,
    /// Per-name concurrency ceiling.
    pub concurrency_max: usize,
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

struct BuiltinDefaults {
    display_name: &'static str,
    path: &'static str,
    kind: ExecutorKind,
    line_formatter: LineFormatter,
    concurrency_max: usize,
}

fn builtin_defaults(name: &str) -> Option<BuiltinDefaults> {
    match name {
        "ping" => Some(BuiltinDefaults {
            display_name: "Ping",
            path: "/usr/bin/ping",
            kind: ExecutorKind::Ping,
            line_formatter: LineFormatter::None,
            concurrency_max: 3,
        }),
        "mtr" => Some(BuiltinDefaults {
            display_name: "MTR",
            path: "/usr/bin/mtr",
            kind: ExecutorKind::Mtr,
            line_formatter: LineFormatter::None,
            concurrency_max: 2,
        }),
        "nexttrace" => Some(BuiltinDefaults {
            display_name: "NextTrace",
            path: "/usr/bin/nexttrace",
            kind: ExecutorKind::Nexttrace,
            line_formatter: LineFormatter::Newline,
            concurrency_max: 2,
        }),
        _ => None,
    }
}

impl ProbeDaemonConfig {
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
        if self.probe.id.is_empty() {
            return Err(ConfigError::Invalid("probe.id is required".to_string()));
        }
        if self.probe.name.is_empty() {
            return Err(ConfigError::Invalid("probe.name is required".to_string()));
        }
        if self.coordinator.host.is_empty() {
            return Err(ConfigError::Invalid(
                "coordinator.host is required".to_string(),
            ));
        }
        if self.coordinator.api_key.is_empty() {
            return Err(ConfigError::Invalid(
                "coordinator.api_key is required".to_string(),
            ));
        }
        if self.probe.max_concurrent < 1 {
            return Err(ConfigError::Invalid(
                "probe.max_concurrent must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Merge the configured task table over the built-in defaults and
    /// resolve every enabled entry.
    ///
    /// Built-in tasks (`ping`, `mtr`, `nexttrace`) appear even when the
    /// config never mentions them. Entries with `enabled = false` are
    /// dropped. Custom tasks without an executor path are rejected.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a custom task that names no
    /// executable.
    pub fn resolve_tasks(&self) -> Result<Vec<ResolvedTask>, ConfigError> {
        let mut resolved = Vec::new();

        // Built-ins first, with user overrides merged in.
        for name in ["ping", "mtr", "nexttrace"] {
            let entry = self.executor.tasks.get(name).cloned().unwrap_or_default();
            if entry.enabled == Some(false) {
                continue;
            }
            let defaults = builtin_defaults(name).expect("builtin name");
            let spec = entry.executor.clone().unwrap_or_default();

            resolved.push(ResolvedTask {
                name: name.to_string(),
                display_name: non_empty(&entry.display_name, defaults.display_name),
                description: entry.description.clone(),
                requires_target: entry.requires_target.unwrap_or(true),
                kind: defaults.kind,
                path: non_empty(&spec.path, defaults.path),
                default_args: spec.default_args,
                line_formatter: spec.line_formatter.unwrap_or(defaults.line_formatter),
                concurrency_max: if entry.concurrency.max > 0 {
                    entry.concurrency.max
                } else {
                    defaults.concurrency_max
                },
            });
        }

        // Custom tasks: anything in the table beyond the built-ins.
        let mut custom: Vec<(&String, &TaskEntry)> = self
            .executor
            .tasks
            .iter()
            .filter(|(name, _)| builtin_defaults(name).is_none())
            .collect();
        custom.sort_by_key(|(name, _)| (*name).clone());

        for (name, entry) in custom {
            if entry.enabled == Some(false) {
                continue;
            }
            let spec = entry.executor.clone().ok_or_else(|| {
                ConfigError::Invalid(format!("custom task '{name}' must specify an executor"))
            })?;
            if spec.path.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "custom task '{name}' must specify an executor path"
                )));
            }

            resolved.push(ResolvedTask {
                name: name.clone(),
                display_name: non_empty(&entry.display_name, name),
                description: entry.description.clone(),
                requires_target: entry.requires_target.unwrap_or(true),
                kind: ExecutorKind::Command,
                path: spec.path,
                default_args: spec.default_args,
                line_formatter: spec.line_formatter.unwrap_or(LineFormatter::None),
                concurrency_max: if entry.concurrency.max > 0 {
                    entry.concurrency.max
                } else {
                    1
                },
            });
        }

        Ok(resolved)
    }
}

fn non_empty(value: &str, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{body}").unwrap();
        file
    }

    const MINIMAL: &str = r#"
[probe]
id = "P1"
name = "probe one"

[coordinator]
host = "coordinator.example:50051"
api_key = "secret"
"#;

    #[test]
    fn minimal_config_resolves_builtins() {
        let file = write_config(MINIMAL);
        let config = ProbeDaemonConfig::from_file(file.path()).unwrap();

        let tasks = config.resolve_tasks().unwrap();
        let names: Vec<&str> = tasks.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["ping", "mtr", "nexttrace"]);

        let ping = &tasks[0];
        assert_eq!(ping.display_name, "Ping");
        assert_eq!(ping.path, "/usr/bin/ping");
        assert_eq!(ping.kind, ExecutorKind::Ping);
        assert_eq!(ping.concurrency_max, 3);
        assert!(ping.requires_target);

        let nexttrace = &tasks[2];
        assert_eq!(nexttrace.line_formatter, LineFormatter::Newline);
        assert_eq!(nexttrace.concurrency_max, 2);
    }

    #[test]
    fn user_entry_overrides_builtin_fields() {
        let body = format!(
            "{MINIMAL}\n[executor.tasks.ping]\ndisplay_name = \"ICMP Ping\"\n[executor.tasks.ping.executor]\npath = \"/bin/ping\"\n[executor.tasks.ping.concurrency]\nmax = 7\n"
        );
        let file = write_config(&body);
        let config = ProbeDaemonConfig::from_file(file.path()).unwrap();

        let tasks = config.resolve_tasks().unwrap();
        let ping = tasks.iter().find(|t| t.name == "ping").unwrap();
        assert_eq!(ping.display_name, "ICMP Ping");
        assert_eq!(ping.path, "/bin/ping");
        assert_eq!(ping.concurrency_max, 7);
        // Kind stays the builtin family.
        assert_eq!(ping.kind, ExecutorKind::Ping);
    }

    #[test]
    fn disabled_builtin_is_omitted() {
        let body = format!("{MINIMAL}\n[executor.tasks.mtr]\nenabled = false\n");
        let file = write_config(&body);
        let config = ProbeDaemonConfig::from_file(file.path()).unwrap();

        let tasks = config.resolve_tasks().unwrap();
        assert!(tasks.iter().all(|t| t.name != "mtr"));
    }

    #[test]
    fn custom_task_defaults_to_single_concurrency() {
        let body = format!(
            "{MINIMAL}\n[executor.tasks.curl_test]\ndisplay_name = \"Curl\"\nrequires_target = false\n[executor.tasks.curl_test.executor]\npath = \"/usr/bin/curl\"\ndefault_args = [\"-s\", \"{{target}}\"]\n"
        );
        let file = write_config(&body);
        let config = ProbeDaemonConfig::from_file(file.path()).unwrap();

        let tasks = config.resolve_tasks().unwrap();
        let curl = tasks.iter().find(|t| t.name == "curl_test").unwrap();
        assert_eq!(curl.kind, ExecutorKind::Command);
        assert_eq!(curl.concurrency_max, 1);
        assert!(!curl.requires_target);
        assert_eq!(curl.default_args, vec!["-s", "{target}"]);
    }

    #[test]
    fn custom_task_without_path_rejected() {
        let body = format!("{MINIMAL}\n[executor.tasks.mystery]\ndisplay_name = \"Mystery\"\n");
        let file = write_config(&body);
        let config = ProbeDaemonConfig::from_file(file.path()).unwrap();

        let err = config.resolve_tasks().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("mystery")));
    }

    #[test]
    fn missing_identity_rejected() {
        let file = write_config("[coordinator]\nhost = \"x:1\"\napi_key = \"k\"\n");
        let err = ProbeDaemonConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("probe.id")));
    }
}
