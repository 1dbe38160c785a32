use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::protocol::{ProtocolVersion, PROTOCOL_VERSION};

/// Session settings, loaded from TOML. Every field is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Name reported in `serverInfo`.
    pub server_name: String,
    /// Protocol version this host speaks.
    pub protocol_version: String,
    /// How long to wait for `initialize` before giving up.
    pub handshake_timeout_ms: u64,
    /// Upper bound for each notification bus drain.
    pub drain_timeout_ms: u64,
    /// Upper bound for in-flight work to settle once reading stops.
    pub shutdown_timeout_ms: u64,
    /// How long an outbound request waits for the client's answer.
    pub outbound_request_timeout_ms: u64,
    /// Reported as `modulePath`; defaults to the current executable.
    pub module_path: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_name: env!("CARGO_PKG_NAME").to_string(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            handshake_timeout_ms: 30_000,
            drain_timeout_ms: 30_000,
            shutdown_timeout_ms: 30_000,
            outbound_request_timeout_ms: 30_000,
            module_path: None,
        }
    }
}

impl SessionConfig {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(Some(config))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.protocol_version
            .parse::<ProtocolVersion>()
            .map_err(|e| ConfigError::Invalid(format!("protocol_version: {}", e)))?;
        let timeouts = [
            ("handshake_timeout_ms", self.handshake_timeout_ms),
            ("drain_timeout_ms", self.drain_timeout_ms),
            ("shutdown_timeout_ms", self.shutdown_timeout_ms),
            ("outbound_request_timeout_ms", self.outbound_request_timeout_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn outbound_request_timeout(&self) -> Duration {
        Duration::from_millis(self.outbound_request_timeout_ms)
    }

    pub fn module_path(&self) -> String {
        if let Some(path) = &self.module_path {
            return path.clone();
        }
        std::env::current_exe()
            .ok()
            .map(|p| p.display().to_string())
            .unwrap_or_default()
    }
}

/// `$XDG_CONFIG_HOME/testhost/config.toml`, or the platform equivalent.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(env!("CARGO_PKG_NAME")).join("config.toml"))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {}: {}", .0.display(), .1)]
    ReadFailed(PathBuf, std::io::Error),
    #[error("Failed to parse config {}: {}", .0.display(), .1)]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}
