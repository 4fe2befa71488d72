//! Configuration for the signaling relay
//!
//! Supports a TOML configuration file with sensible defaults.
//! Configuration is loaded from:
//! - macOS: ~/Library/Application Support/signal-relay/config.toml
//! - Linux: ~/.config/signal-relay/config.toml
//! - Windows: %APPDATA%/signal-relay/config.toml

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::liveness::DEFAULT_LIVENESS_INTERVAL;
use crate::DEFAULT_PORT;

/// Longest accepted liveness interval (one day)
pub const MAX_LIVENESS_INTERVAL_MS: u64 = 24 * 60 * 60 * 1000;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener settings
    pub server: ServerConfig,
    /// Routing and liveness settings
    pub relay: RelayConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP port
    pub port: u16,
    /// Bind address
    pub bind: IpAddr,
    /// Only upgrade requests for this path (any path when unset)
    pub upgrade_path: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            upgrade_path: None,
        }
    }
}

/// How connection state is held between messages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionModel {
    /// Registry and sessions live in memory for the process lifetime
    #[default]
    Resident,
    /// Subscriptions live in per-connection attachments, recomputed per event
    Hibernating,
}

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Execution model
    pub mode: ExecutionModel,
    /// Liveness sweep interval in milliseconds (resident model)
    pub liveness_interval_ms: u64,
    /// SQLite attachment database (hibernating model; in-memory if unset)
    pub db_path: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionModel::Resident,
            liveness_interval_ms: DEFAULT_LIVENESS_INTERVAL.as_millis() as u64,
            db_path: None,
        }
    }
}

impl RelayConfig {
    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path).unwrap_or_else(|e| {
                warn!("Failed to load config from {:?}: {}, using defaults", path, e);
                Self::default()
            }),
            None => {
                debug!("No config directory found, using defaults");
                Self::default()
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Reject values the relay cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let interval = self.relay.liveness_interval_ms;
        if interval == 0 || interval > MAX_LIVENESS_INTERVAL_MS {
            return Err(ConfigError::Invalid(format!(
                "relay.liveness_interval_ms must be between 1 and {}, got {}",
                MAX_LIVENESS_INTERVAL_MS, interval
            )));
        }
        Ok(())
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("dev", "signal-relay", "signal-relay")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Generate a sample configuration file content
    pub fn sample() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid value: {0}")]
    Invalid(String),
}
