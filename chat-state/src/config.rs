//! Configuration for the chat state cache.
//!
//! The configuration file lives at `~/.chat-state/config.json`.
//!
//! # Configuration Priority
//!
//! 1. Environment variables
//! 2. Explicit config file values
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `REDIS_URL` → store.url
//! - `CHAT_STATE_LOG_LEVEL` → observability.log_level
//! - `CHAT_STATE_LOG_FORMAT` → observability.log_format

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::connection::ReconnectPolicy;
use crate::error::ConfigError;
use crate::logging::LogFormat;

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".chat-state"),
        |dirs| dirs.home_dir().join(".chat-state"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

/// URL schemes accepted for `store.url`.
pub const SUPPORTED_SCHEMES: &[&str] = &["redis", "rediss", "memory"];

// ============================================================================
// Store Configuration
// ============================================================================

/// Key-value store connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store URL (`redis://host:port`, or `memory://` for an in-process store)
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Timeout for a single connection attempt, in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// The n-th reconnect waits `n × reconnect_step_ms`
    #[serde(default = "default_reconnect_step_ms")]
    pub reconnect_step_ms: u64,

    /// Reconnect attempts before a connection setup is abandoned
    #[serde(default = "default_max_reconnects")]
    pub max_reconnects: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            connect_timeout_secs: default_connect_timeout_secs(),
            reconnect_step_ms: default_reconnect_step_ms(),
            max_reconnects: default_max_reconnects(),
        }
    }
}

impl StoreConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            step: Duration::from_millis(self.reconnect_step_ms),
            max_retries: self.max_reconnects,
        }
    }

    /// Scheme part of the URL, e.g. `redis`.
    pub fn scheme(&self) -> Option<&str> {
        self.url.split_once("://").map(|(scheme, _)| scheme)
    }

    /// Whether the URL selects the in-process store.
    pub fn is_memory(&self) -> bool {
        self.scheme() == Some("memory")
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_reconnect_step_ms() -> u64 {
    100
}

fn default_max_reconnects() -> u32 {
    10
}

// ============================================================================
// Session Configuration
// ============================================================================

/// Session lifetime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Inactivity after which a stored session is reset to the start of the flow
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Store-side expiry of a session record, refreshed on every write
    #[serde(default = "default_record_ttl_secs")]
    pub record_ttl_secs: u64,

    /// Prefix prepended to the sender to form the store key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            record_ttl_secs: default_record_ttl_secs(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    24 * 60 * 60
}

fn default_record_ttl_secs() -> u64 {
    30 * 24 * 60 * 60
}

fn default_key_prefix() -> String {
    "user:".to_string()
}

// ============================================================================
// Observability Configuration
// ============================================================================

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Base log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Output format: "json" or "pretty"
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl ObservabilityConfig {
    /// Parsed `log_format`.
    pub fn format(&self) -> Result<LogFormat, ConfigError> {
        self.log_format.parse()
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

// ============================================================================
// Root Configuration
// ============================================================================

/// Complete configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from the default path, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path();
        if !path.exists() {
            tracing::info!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Load from `path` (or the default path), apply environment overrides, and validate.
    pub fn load_with_env(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load_from(path)?,
            None => Self::load()?,
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("REDIS_URL").filter(|url| !url.is_empty()) {
            self.store.url = url;
        }
        if let Some(level) = lookup("CHAT_STATE_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Some(format) = lookup("CHAT_STATE_LOG_FORMAT") {
            self.observability.log_format = format;
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.url.trim().is_empty() {
            return Err(invalid("store.url", "must not be empty"));
        }
        match self.store.scheme() {
            Some(scheme) if SUPPORTED_SCHEMES.contains(&scheme) => {}
            _ => {
                return Err(invalid(
                    "store.url",
                    format!("scheme must be one of {}", SUPPORTED_SCHEMES.join(", ")),
                ))
            }
        }
        if self.store.connect_timeout_secs == 0 {
            return Err(invalid("store.connect_timeout_secs", "must be greater than 0"));
        }
        if self.session.timeout_secs == 0 {
            return Err(invalid("session.timeout_secs", "must be greater than 0"));
        }
        if self.session.record_ttl_secs == 0 {
            return Err(invalid("session.record_ttl_secs", "must be greater than 0"));
        }
        self.observability.format()?;
        Ok(())
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.into(),
    }
}
