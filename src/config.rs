//! Orchestrator configuration using Figment
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Built-in defaults
//! 2. Optional TOML file
//! 3. Environment variables prefixed with `LABRELAY_`, nested keys split on `__`
//!
//! ```text
//! LABRELAY_SERVER__PORT=9000
//! LABRELAY_STREAM__POLL_INTERVAL_MS=250
//! LABRELAY_STORAGE__BACKEND=sqlite
//! ```
//!
//! # Example
//!
//! ```rust
//! use labrelay::config::OrchestratorConfig;
//!
//! let config = OrchestratorConfig::default();
//! assert_eq!(config.stream.poll_interval().as_millis(), 500);
//! assert_eq!(config.client.max_attempts, 5);
//! config.validate().unwrap();
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "LABRELAY_";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// HTTP listener
    pub server: ServerConfig,
    /// Log datastore
    pub storage: StorageConfig,
    /// Stream session polling
    pub stream: StreamConfig,
    /// Discrete log query limits
    pub logs: LogsConfig,
    /// Auto-generated experiment names
    pub naming: NamingConfig,
    /// External engine command
    pub engine: EngineConfig,
    /// Resilient client reconnect and status polling
    pub client: ClientConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub host: String,
    /// Bind port
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
        }
    }
}

impl ServerConfig {
    /// `host:port` string suitable for binding.
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Which log datastore to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Volatile in-process store
    #[default]
    Memory,
    /// SQLite database file
    Sqlite,
}

/// Log datastore settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend selection
    pub backend: StorageBackend,
    /// Database file for the sqlite backend
    pub sqlite_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            sqlite_path: PathBuf::from("labrelay.db"),
        }
    }
}

/// Stream session settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Poll tick in milliseconds
    pub poll_interval_ms: u64,
    /// Entries per tail read
    pub batch_limit: usize,
    /// Consecutive datastore failures tolerated before the session closes
    pub max_consecutive_failures: u32,
    /// Outbound message buffer per session
    pub channel_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            batch_limit: 100,
            max_consecutive_failures: 10,
            channel_capacity: 256,
        }
    }
}

impl StreamConfig {
    /// Poll tick as a [`Duration`].
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Discrete log query settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogsConfig {
    /// Page size when the request gives none
    pub default_limit: usize,
    /// Upper clamp for requested page sizes
    pub max_limit: usize,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            default_limit: 100,
            max_limit: 1000,
        }
    }
}

impl LogsConfig {
    /// Resolve a requested limit into `1..=max_limit`.
    #[must_use]
    pub fn clamp(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_limit)
            .clamp(1, self.max_limit.max(1))
    }
}

/// Auto-generated name settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingConfig {
    /// Prefix of `<prefix>_<unix-millis>` names
    pub prefix: String,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            prefix: "experiment".to_string(),
        }
    }
}

/// External engine command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Program to run per experiment; `None` means no engine is configured
    pub command: Option<String>,
    /// Arguments; `{name}` is replaced with the experiment name
    pub args: Vec<String>,
}

/// Resilient client settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// First reconnect delay in milliseconds
    pub reconnect_base_ms: u64,
    /// Delay multiplier per attempt
    pub reconnect_factor: u32,
    /// Reconnect delay cap in milliseconds
    pub reconnect_cap_ms: u64,
    /// Consecutive failed attempts before giving up
    pub max_attempts: u32,
    /// Redundant status poll interval in milliseconds
    pub status_poll_interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reconnect_base_ms: 1_000,
            reconnect_factor: 2,
            reconnect_cap_ms: 30_000,
            max_attempts: 5,
            status_poll_interval_ms: 2_000,
        }
    }
}

impl ClientConfig {
    /// Status poll interval as a [`Duration`].
    #[must_use]
    pub const fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms)
    }
}

impl OrchestratorConfig {
    /// Load defaults, then `path` if given, then `LABRELAY_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a source cannot be parsed or the result
    /// fails [`validate`](Self::validate).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            if !path.exists() {
                return Err(Error::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            figment = figment.merge(Toml::file(path));
        }
        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first offending field.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(Error::Config(msg.to_string()));

        if self.stream.poll_interval_ms == 0 {
            return invalid("stream.poll_interval_ms must be > 0");
        }
        if self.stream.batch_limit == 0 {
            return invalid("stream.batch_limit must be > 0");
        }
        if self.stream.channel_capacity == 0 {
            return invalid("stream.channel_capacity must be > 0");
        }
        if self.logs.default_limit == 0 || self.logs.max_limit == 0 {
            return invalid("logs limits must be > 0");
        }
        if self.logs.default_limit > self.logs.max_limit {
            return invalid("logs.default_limit must not exceed logs.max_limit");
        }
        if self.client.reconnect_base_ms == 0 || self.client.status_poll_interval_ms == 0 {
            return invalid("client intervals must be > 0");
        }
        if self.client.reconnect_factor == 0 {
            return invalid("client.reconnect_factor must be > 0");
        }
        if self.client.reconnect_cap_ms < self.client.reconnect_base_ms {
            return invalid("client.reconnect_cap_ms must be >= client.reconnect_base_ms");
        }
        if self.naming.prefix.is_empty() {
            return invalid("naming.prefix must not be empty");
        }
        if !crate::validate::validate_schema_name(&self.naming.prefix) {
            return Err(Error::Config(format!(
                "naming.prefix '{}' is not a valid schema name",
                self.naming.prefix
            )));
        }
        if self.engine.command.as_deref().is_some_and(str::is_empty) {
            return invalid("engine.command must not be empty when set");
        }
        Ok(())
    }
}
