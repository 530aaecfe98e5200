use std::{
    env, fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use inject_runtime::{BlockState, Bounds, Vec3I};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::assembly::{validate_identifier, AssemblyError, PacketLayout};

pub const BUILTIN_CONNECTION_CONFIG: &str = include_str!("data/connection_config.json");
pub const CONFIG_PATH_ENV: &str = "INJECT_CONFIG_PATH";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Session name; also the directory packets are written to.
    pub identifier: String,
    pub flush_interval_ms: u64,
    pub poll_interval_ms: u64,
    /// Written packets between two probes while commands keep flowing.
    pub probe_interval: u64,
    /// Unconfirmed packets tolerated before flushing pauses.
    pub timeout_flushes: u64,
    pub probe_command: String,
    /// Prefix for generated invoker names. Empty means the identifier.
    pub invoker_prefix: String,
    pub data_version: i32,
    pub author: String,
    pub background: Option<BlockState>,
    pub impulse_bounds: Bounds,
    pub repeat_bounds: Bounds,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            identifier: "default".to_string(),
            flush_interval_ms: 100,
            poll_interval_ms: 50,
            probe_interval: 20,
            timeout_flushes: 100,
            probe_command: "time query gametime".to_string(),
            invoker_prefix: String::new(),
            data_version: 1343,
            author: "inject".to_string(),
            background: Some(BlockState::air()),
            impulse_bounds: Bounds::new(Vec3I::new(0, 0, 1), Vec3I::new(7, 7, 4)),
            repeat_bounds: Bounds::new(Vec3I::new(0, 0, 5), Vec3I::new(7, 7, 6)),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse connection config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to read connection config from {path:?}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{field} must be positive")]
    NotPositive { field: &'static str },
    #[error("probe_interval ({probe_interval}) must not exceed timeout_flushes ({timeout_flushes})")]
    ProbeAfterTimeout {
        probe_interval: u64,
        timeout_flushes: u64,
    },
    #[error("invoker prefix '{0}' may not contain ':', ']' or whitespace")]
    InvalidInvokerPrefix(String),
    #[error("probe command must not be empty")]
    EmptyProbe,
    #[error(transparent)]
    Layout(#[from] AssemblyError),
}

impl ConnectionConfig {
    pub fn builtin() -> Self {
        match Self::from_json_str(BUILTIN_CONNECTION_CONFIG) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(
                    target: "inject::config",
                    error = %err,
                    "connection_config.builtin_invalid"
                );
                Self::default()
            }
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        let config = ConnectionConfig::from_json_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = identifier.into();
        self
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn invoker_prefix(&self) -> &str {
        if self.invoker_prefix.is_empty() {
            &self.identifier
        } else {
            &self.invoker_prefix
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_identifier(&self.identifier)?;
        for (field, value) in [
            ("flush_interval_ms", self.flush_interval_ms),
            ("poll_interval_ms", self.poll_interval_ms),
            ("probe_interval", self.probe_interval),
            ("timeout_flushes", self.timeout_flushes),
        ] {
            if value == 0 {
                return Err(ConfigError::NotPositive { field });
            }
        }
        if self.probe_interval > self.timeout_flushes {
            return Err(ConfigError::ProbeAfterTimeout {
                probe_interval: self.probe_interval,
                timeout_flushes: self.timeout_flushes,
            });
        }
        if self
            .invoker_prefix
            .chars()
            .any(|c| c == ':' || c == ']' || c.is_whitespace())
        {
            return Err(ConfigError::InvalidInvokerPrefix(self.invoker_prefix.clone()));
        }
        if self.probe_command.trim().is_empty() {
            return Err(ConfigError::EmptyProbe);
        }
        self.layout()?;
        Ok(())
    }

    pub fn layout(&self) -> Result<PacketLayout, AssemblyError> {
        PacketLayout::new(
            self.identifier.clone(),
            self.data_version,
            self.author.clone(),
            self.background.clone(),
            self.impulse_bounds,
            self.repeat_bounds,
        )
    }
}

/// Where the active config came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionConfigMetadata {
    path: Option<PathBuf>,
}

impl ConnectionConfigMetadata {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }
}

/// Load from `path`, falling back to the builtin config when it is absent or
/// unusable.
pub fn load_connection_config(path: Option<&Path>) -> (ConnectionConfig, ConnectionConfigMetadata) {
    if let Some(path) = path {
        match ConnectionConfig::from_file(path) {
            Ok(config) => {
                tracing::info!(
                    target: "inject::config",
                    path = %path.display(),
                    "connection_config.loaded=file"
                );
                return (
                    config,
                    ConnectionConfigMetadata::new(Some(path.to_path_buf())),
                );
            }
            Err(err) => {
                tracing::warn!(
                    target: "inject::config",
                    path = %path.display(),
                    error = %err,
                    "connection_config.load_failed"
                );
            }
        }
    }

    let config = ConnectionConfig::builtin();
    tracing::info!(
        target: "inject::config",
        "connection_config.loaded=builtin"
    );
    (config, ConnectionConfigMetadata::new(None))
}

pub fn load_connection_config_from_env() -> (ConnectionConfig, ConnectionConfigMetadata) {
    let override_path = env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from);
    load_connection_config(override_path.as_deref())
}
