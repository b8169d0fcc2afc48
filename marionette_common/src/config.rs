//! Configuration loading traits and types.
//!
//! This module provides a standardized way to load the supervisor's TOML
//! configuration file and validate it before the master is built.
//!
//! # Usage
//!
//! ```rust,no_run
//! use marionette_common::config::{ConfigLoader, ConfigError, MasterConfig};
//! use std::path::Path;
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = MasterConfig::load(Path::new("marionette.toml"))?;
//!     config.validate()?;
//!     println!("main puppet count: {}", config.main_puppet().map_or(0, |p| p.count));
//!     Ok(())
//! }
//! ```

use crate::consts::{
    DEFAULT_BACKLOG, DEFAULT_LISTENER_KEY, DEFAULT_MASTER_NAP_SECS, DEFAULT_SERVICE_HOST,
    DEFAULT_TIMEOUT_SECS, DEFAULT_WORKER_COUNT, DEFAULT_WORKER_NAP_SECS,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Error type for configuration loading operations.
///
/// This enum represents all possible errors that can occur when loading
/// or validating configuration files.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Log level for application logging.
///
/// Represents the verbosity level of logging output.
/// Uses lowercase serde values for TOML compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Most verbose, detailed tracing information.
    Trace,
    /// Debug information useful during development.
    Debug,
    /// General information about application operation.
    #[default]
    Info,
    /// Warning messages for potentially problematic situations.
    Warn,
    /// Error messages for serious problems.
    Error,
}

impl LogLevel {
    /// Directive string understood by `tracing_subscriber::EnvFilter`.
    pub fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

// ─── Sections ───────────────────────────────────────────────────────

/// `[master]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MasterSection {
    /// Worker staleness threshold and shutdown deadline, in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Maximum nap between two master loop iterations, in seconds.
    #[serde(default = "default_master_nap")]
    pub nap_time: f64,

    /// Tag appended to the master's process name.
    #[serde(default)]
    pub proc_tag: Option<String>,

    /// Where the master records its pid.
    #[serde(default)]
    pub pid_file: Option<PathBuf>,

    /// Unix socket path of the control port. Disabled when absent.
    #[serde(default)]
    pub control_port: Option<PathBuf>,

    /// Append-mode log file. Logs go to stderr when absent.
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Logging verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Environment section to run (`development`, `production`, ...).
    #[serde(default)]
    pub environment: Option<String>,
}

impl Default for MasterSection {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT_SECS,
            nap_time: DEFAULT_MASTER_NAP_SECS as f64,
            proc_tag: None,
            pid_file: None,
            control_port: None,
            log_file: None,
            log_level: LogLevel::default(),
            environment: None,
        }
    }
}

/// `[socket]` section: options applied to every listener created by the master.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SocketSection {
    /// Listen backlog.
    #[serde(default = "default_backlog")]
    pub backlog: i32,

    /// `SO_RCVBUF` in bytes.
    #[serde(default)]
    pub rcvbuf: Option<usize>,

    /// `SO_SNDBUF` in bytes.
    #[serde(default)]
    pub sndbuf: Option<usize>,

    /// `TCP_NODELAY`; left untouched when absent.
    #[serde(default)]
    pub tcp_nodelay: Option<bool>,

    /// `TCP_CORK` / `TCP_NOPUSH`; left untouched when absent.
    #[serde(default)]
    pub tcp_nopush: Option<bool>,
}

impl Default for SocketSection {
    fn default() -> Self {
        Self {
            backlog: DEFAULT_BACKLOG,
            rcvbuf: None,
            sndbuf: None,
            tcp_nodelay: None,
            tcp_nopush: None,
        }
    }
}

/// How a puppet's workers drive their payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PuppetKind {
    /// Sleep-based loop: one unit of work, then nap.
    #[default]
    Loop,
    /// Reactor-driven loop with an idle heartbeat timer.
    Event,
}

/// One `[[puppet]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PuppetSection {
    /// Pool key. Absent or `"default"` marks the main puppet.
    #[serde(default)]
    pub key: Option<String>,

    /// Desired number of workers.
    #[serde(default = "default_count")]
    pub count: usize,

    /// Nap between two units of work, in seconds.
    #[serde(default = "default_worker_nap")]
    pub nap_time: f64,

    /// Process tag prefix for this pool's workers.
    #[serde(default)]
    pub proc_tag: Option<String>,

    /// Work loop style.
    #[serde(default)]
    pub kind: PuppetKind,

    /// Payload name from the payload registry.
    #[serde(default = "default_payload")]
    pub payload: String,

    /// Listener key served by the payload, if any.
    #[serde(default)]
    pub listen: Option<String>,
}

impl PuppetSection {
    /// Whether this entry describes the main puppet.
    pub fn is_main(&self) -> bool {
        self.key.as_deref().is_none_or(|k| k == DEFAULT_LISTENER_KEY)
    }

    /// Normalized key: `None` for the main puppet.
    pub fn pool_key(&self) -> Option<&str> {
        if self.is_main() { None } else { self.key.as_deref() }
    }
}

impl Default for PuppetSection {
    fn default() -> Self {
        Self {
            key: None,
            count: DEFAULT_WORKER_COUNT,
            nap_time: DEFAULT_WORKER_NAP_SECS as f64,
            proc_tag: None,
            kind: PuppetKind::default(),
            payload: default_payload(),
            listen: None,
        }
    }
}

/// One `[[service]]` entry.
///
/// `command` placeholders `{host}`, `{port}`, `{pid_file}` and `{name}` are
/// substituted right before the service is forked.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceSection {
    /// Unique service name.
    pub name: String,

    /// Command line (program first).
    pub command: Vec<String>,

    /// Host the service listens on.
    #[serde(default = "default_service_host")]
    pub listen_host: String,

    /// Fixed port. Allocated from the reserved range when absent.
    #[serde(default)]
    pub listen_port: Option<u16>,

    /// Signal used by `stop` (`TERM`, `QUIT`, `INT`, ...).
    #[serde(default = "default_stop_signal")]
    pub stop_signal: String,

    /// Check the service with a TCP connect on every liveness check.
    #[serde(default)]
    pub health_check: bool,

    /// Never auto-restart this service.
    #[serde(default)]
    pub disabled: bool,
}

/// `[environments.<name>]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentSection {
    /// Desired worker count per puppet key (`default` for the main puppet).
    #[serde(default)]
    pub workers: BTreeMap<String, usize>,
}

/// Full supervisor configuration.
///
/// # TOML Example
///
/// ```toml
/// [master]
/// timeout = 30
/// proc_tag = "web"
/// control_port = "/tmp/marionette.sock"
///
/// [listen]
/// default = ["127.0.0.1:8080"]
/// admin = ["/tmp/admin.sock"]
///
/// [[puppet]]
/// count = 4
/// payload = "echo"
/// listen = "default"
///
/// [[service]]
/// name = "redis"
/// command = ["redis-server", "--port", "{port}", "--bind", "{host}"]
/// health_check = true
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MasterConfig {
    /// Master tunables.
    #[serde(default)]
    pub master: MasterSection,

    /// Listener key to listener specs.
    #[serde(default)]
    pub listen: BTreeMap<String, Vec<String>>,

    /// Socket options for created listeners.
    #[serde(default)]
    pub socket: SocketSection,

    /// Worker pools.
    #[serde(default, rename = "puppet")]
    pub puppets: Vec<PuppetSection>,

    /// Auxiliary services.
    #[serde(default, rename = "service")]
    pub services: Vec<ServiceSection>,

    /// Per-environment overrides.
    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentSection>,
}

impl MasterConfig {
    /// Worker staleness threshold.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.master.timeout)
    }

    /// Master nap interval. Falls back to the default when the configured
    /// value is not a usable number of seconds.
    pub fn nap_time(&self) -> Duration {
        Duration::try_from_secs_f64(self.master.nap_time).unwrap_or(Duration::from_secs(DEFAULT_MASTER_NAP_SECS))
    }

    /// The main puppet entry, if configured.
    pub fn main_puppet(&self) -> Option<&PuppetSection> {
        self.puppets.iter().find(|p| p.is_main())
    }

    /// Mutable access to a puppet entry by normalized key.
    pub fn puppet_mut(&mut self, key: Option<&str>) -> Option<&mut PuppetSection> {
        self.puppets.iter_mut().find(|p| p.pool_key() == key)
    }

    /// Apply the worker-count overrides of `[environments.<name>]`.
    ///
    /// An environment without a section is not an error.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if an override names an
    /// unknown puppet.
    pub fn apply_environment(&mut self, name: &str) -> Result<(), ConfigError> {
        let Some(env) = self.environments.get(name).cloned() else {
            return Ok(());
        };

        for (key, count) in env.workers {
            let pool_key = (key != DEFAULT_LISTENER_KEY).then_some(key.as_str());
            match self.puppet_mut(pool_key) {
                Some(puppet) => puppet.count = count,
                None => {
                    return Err(ConfigError::ValidationError(format!(
                        "environment '{name}' overrides unknown puppet '{key}'"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if:
    /// - `timeout` or `nap_time` is not positive
    /// - two puppets share a key, or no main puppet exists
    /// - a puppet has a non-positive `nap_time`
    /// - two services share a name, or a service has an empty command
    /// - a listener key has no specs, or a spec is empty
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.master.timeout == 0 {
            return Err(invalid("master.timeout must be positive"));
        }
        if !(self.master.nap_time.is_finite() && self.master.nap_time > 0.0) {
            return Err(invalid("master.nap_time must be positive"));
        }

        let mut keys = HashSet::new();
        for puppet in &self.puppets {
            if !keys.insert(puppet.pool_key()) {
                return Err(invalid(format!(
                    "duplicate puppet key '{}'",
                    puppet.pool_key().unwrap_or(DEFAULT_LISTENER_KEY)
                )));
            }
            if !(puppet.nap_time.is_finite() && puppet.nap_time > 0.0) {
                return Err(invalid("puppet.nap_time must be positive"));
            }
        }
        if self.main_puppet().is_none() {
            return Err(invalid("a main puppet (no key or key = \"default\") is required"));
        }

        let mut names = HashSet::new();
        for service in &self.services {
            if !names.insert(service.name.as_str()) {
                return Err(invalid(format!("duplicate service '{}'", service.name)));
            }
            if service.command.is_empty() {
                return Err(invalid(format!("service '{}' has an empty command", service.name)));
            }
        }

        for (key, specs) in &self.listen {
            if specs.is_empty() || specs.iter().any(|s| s.trim().is_empty()) {
                return Err(invalid(format!("listener '{key}' has an empty spec")));
            }
        }

        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(msg.into())
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_master_nap() -> f64 {
    DEFAULT_MASTER_NAP_SECS as f64
}

fn default_worker_nap() -> f64 {
    DEFAULT_WORKER_NAP_SECS as f64
}

fn default_backlog() -> i32 {
    DEFAULT_BACKLOG
}

fn default_count() -> usize {
    DEFAULT_WORKER_COUNT
}

fn default_payload() -> String {
    "idle".to_string()
}

fn default_service_host() -> String {
    DEFAULT_SERVICE_HOST.to_string()
}

fn default_stop_signal() -> String {
    "TERM".to_string()
}

/// Trait for loading configuration from TOML files.
///
/// This trait provides a default implementation that works with any type
/// implementing `serde::de::DeserializeOwned`.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

// Blanket implementation for all types that implement DeserializeOwned.
impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}
