//! Configuration loading for idsync.
//!
//! Configuration is loaded from a TOML file (default: `idsync.toml`).

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for idsync.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Input identity.
    pub input: InputConfig,
    /// Synchronization cadence.
    #[serde(default)]
    pub sync: SyncConfig,
    /// Storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// API rate limiting.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// HTTP endpoints configuration.
    #[serde(default)]
    pub http: HttpConfig,
    /// Provider-specific settings, passed verbatim to the provider factory.
    #[serde(default = "default_provider_table")]
    pub provider: toml::Value,
}

/// Input identity.
#[derive(Debug, Clone, Deserialize)]
pub struct InputConfig {
    /// Input id, published as `labels.identity_source`.
    pub id: String,
    /// Registered provider name.
    pub provider: String,
}

/// Synchronization cadence.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Seconds between full synchronizations (default: 86400 = 24 hours).
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
    /// Seconds between incremental updates (default: 900 = 15 minutes).
    #[serde(default = "default_update_interval")]
    pub update_interval_secs: u64,
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Path to the state database file.
    #[serde(default = "default_database_path")]
    pub database: PathBuf,
}

/// Rate limiting configuration for provider API calls.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Quota window length in seconds (default: 60).
    #[serde(default = "default_limit_window")]
    pub window_secs: u64,
    /// Fixed request quota per window, overriding the server-reported limit.
    #[serde(default)]
    pub fixed: Option<u32>,
}

/// HTTP endpoints configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Bind address for HTTP server (default: 127.0.0.1:8080).
    #[serde(default = "default_http_bind")]
    pub bind_address: String,
    /// Serve health and metrics endpoints (default: true).
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
}

// Default value functions
fn default_sync_interval() -> u64 {
    24 * 60 * 60 // 24 hours
}

fn default_update_interval() -> u64 {
    15 * 60 // 15 minutes
}

fn default_database_path() -> PathBuf {
    PathBuf::from("idsync.db")
}

fn default_limit_window() -> u64 {
    60
}

fn default_http_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_http_enabled() -> bool {
    true
}

fn default_provider_table() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: default_sync_interval(),
            update_interval_secs: default_update_interval(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            window_secs: default_limit_window(),
            fixed: None,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_address: default_http_bind(),
            enabled: default_http_enabled(),
        }
    }
}

impl SyncConfig {
    /// Full synchronization interval.
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    /// Incremental update interval.
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    /// Check the cadence: both intervals non-zero and full syncs strictly
    /// rarer than updates.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync_interval_secs == 0 || self.update_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                reason: "sync and update intervals must be non-zero".to_string(),
            });
        }
        if self.sync_interval_secs <= self.update_interval_secs {
            return Err(ConfigError::Invalid {
                reason: format!(
                    "sync_interval_secs ({}) must be greater than update_interval_secs ({})",
                    self.sync_interval_secs, self.update_interval_secs
                ),
            });
        }
        Ok(())
    }
}

impl LimitsConfig {
    /// Quota window.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file and validate it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or fails
    /// validation.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.input.id.trim().is_empty() {
            return Err(ConfigError::Invalid {
                reason: "input.id must not be empty".to_string(),
            });
        }
        if self.limits.window_secs == 0 {
            return Err(ConfigError::Invalid {
                reason: "limits.window_secs must be non-zero".to_string(),
            });
        }
        self.sync.validate()
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// Configuration values are inconsistent.
    #[error("invalid configuration: {reason}")]
    Invalid {
        /// What is wrong.
        reason: String,
    },
}
