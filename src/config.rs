//! Configuration for simcard.
//!
//! Plain structs with defaults, optionally loaded from JSON. The backend is
//! selected here and resolved by [`crate::gateway::open_gateway`].

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading configuration or card profiles.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read.
    #[error("Failed to read {}: {source}", path.display())]
    Io {
        /// Path that was being read.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// JSON was malformed or did not match the schema.
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// Values parsed but are not usable.
    #[error("Invalid configuration: {reason}")]
    Invalid {
        /// Why the configuration was rejected.
        reason: String,
    },
}

/// Gateway-side settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Max queued native events before new ones are dropped.
    pub notification_queue_capacity: usize,
    /// Name of the notification delivery thread.
    pub delivery_thread_name: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            notification_queue_capacity: 1024,
            delivery_thread_name: "simcard-notify".to_string(),
        }
    }
}

/// Backend selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[non_exhaustive]
pub enum BackendConfig {
    /// In-process gateway serving a card profile.
    InMemory {
        /// JSON card profile; an empty, ready card when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        profile: Option<PathBuf>,
    },
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::InMemory { profile: None }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Which backend to open.
    pub backend: BackendConfig,
    /// Gateway settings.
    pub gateway: GatewayConfig,
    /// Default buffer capacity for state streams.
    pub stream_capacity: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            gateway: GatewayConfig::default(),
            stream_capacity: 64,
        }
    }
}

impl SimConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read, parse and validate a JSON configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    /// Reject values that cannot work at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gateway.notification_queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                reason: "gateway.notification_queue_capacity must be at least 1".to_string(),
            });
        }
        if self.gateway.delivery_thread_name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                reason: "gateway.delivery_thread_name cannot be empty".to_string(),
            });
        }
        if self.stream_capacity == 0 {
            return Err(ConfigError::Invalid {
                reason: "stream_capacity must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}
