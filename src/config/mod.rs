//! Configuration management for rolepool
//!
//! Configuration is normally built in memory by the caller; the TOML helpers
//! exist for applications that keep their cluster description in a file.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

pub use crate::error::ConfigError;

/// Address used when the caller gives none
pub const DEFAULT_ADDR: &str = "localhost:3301";

/// Main pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Cluster node addresses (`host:port`)
    #[serde(default)]
    pub nodes: Vec<String>,
    /// Connection configuration
    pub connection: ConnectionConfig,
    /// Health check configuration
    pub health: HealthConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Per-connection timings and credentials
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Bound on opening a link plus the handshake, in milliseconds
    pub connect_timeout_ms: u64,
    /// Deadline applied to every dispatched request, in milliseconds
    pub request_timeout_ms: u64,
    /// First reconnect delay, in milliseconds
    pub reconnect_base_ms: u64,
    /// Reconnect delay cap, in milliseconds
    pub reconnect_max_ms: u64,
    /// User to authenticate as; no auth step when unset
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Health check configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Probe interval in milliseconds
    pub interval_ms: u64,
    /// Probe timeout in milliseconds
    pub timeout_ms: u64,
    /// Number of consecutive failures before marking a node down
    pub failure_threshold: u32,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nodes: vec![DEFAULT_ADDR.to_string()],
            connection: ConnectionConfig::default(),
            health: HealthConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 3000,
            request_timeout_ms: 5000,
            reconnect_base_ms: 100,
            reconnect_max_ms: 10_000,
            user: None,
            password: None,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            timeout_ms: 500,
            failure_threshold: 3,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        for node in &self.nodes {
            validate_addr(node)?;
        }

        let conn = &self.connection;
        if conn.connect_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "connect_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if conn.request_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "request_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if conn.reconnect_base_ms == 0 {
            return Err(ConfigError::ValidationError(
                "reconnect_base_ms must be greater than 0".to_string(),
            ));
        }

        if conn.reconnect_base_ms > conn.reconnect_max_ms {
            return Err(ConfigError::ValidationError(
                "reconnect_base_ms must not exceed reconnect_max_ms".to_string(),
            ));
        }

        if conn.password.is_some() && conn.user.is_none() {
            return Err(ConfigError::ValidationError(
                "password given without user".to_string(),
            ));
        }

        // Validate health config
        if self.health.interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "health check interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.health.timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "health check timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.health.timeout_ms >= self.health.interval_ms {
            return Err(ConfigError::ValidationError(
                "health check timeout_ms must be less than interval_ms".to_string(),
            ));
        }

        if self.health.failure_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "failure_threshold must be at least 1".to_string(),
            ));
        }

        // Validate logging config
        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }
}

/// Node addresses are `host:port`; hostnames are allowed, so this checks
/// shape rather than resolving.
pub fn validate_addr(addr: &str) -> Result<(), ConfigError> {
    let valid = match addr.rsplit_once(':') {
        Some((host, port)) => !host.trim().is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(ConfigError::ValidationError(format!(
            "Invalid node address '{}': must be host:port",
            addr
        )))
    }
}

/// Install a global tracing subscriber for `config`.
///
/// `RUST_LOG` wins over the configured level. Calling this more than once is
/// harmless: later calls leave the first subscriber in place.
pub fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

    let result = match config.format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init(),
    };

    if result.is_ok() {
        tracing::info!("Logging initialized at level: {}", config.level);
    }
}
