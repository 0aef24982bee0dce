//! Daemon configuration

use futuride_core::EngineConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming the TOML config file
pub const CONFIG_ENV: &str = "FUTURIDE_CONFIG";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Configuration for the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Path to Unix socket
    pub socket_path: PathBuf,

    /// How often idle rate-limit entries are evicted
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Largest request frame accepted from a client
    pub max_frame_bytes: usize,

    /// How long in-flight connections get to finish after a shutdown signal
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,

    /// Execution engine settings
    pub engine: EngineConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: futuride_core::config::default_socket_path(),
            sweep_interval: Duration::from_secs(60),
            max_frame_bytes: futuride_core::protocol::DEFAULT_MAX_FRAME_BYTES,
            shutdown_grace: Duration::from_secs(5),
            engine: EngineConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load from `$FUTURIDE_CONFIG`, or defaults when it is unset
    pub fn load() -> Result<Self, ConfigError> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}
