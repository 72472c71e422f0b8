//! Driver configuration.
//!
//! Read from a camelCase JSON object; every field has a default so a partial
//! file (or `{}`) is valid.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::vtk::session::{SessionLimits, DEFAULT_MAX_RESPONSE_BYTES, DEFAULT_POLL_INTERVAL};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DriverConfig {
    /// Terminal host name or IP.
    pub host: String,
    /// Terminal TCP port.
    pub port: String,
    /// Wire protocol name.
    pub protocol: String,
    pub connect_timeout_ms: u64,
    /// Default budget for one charge.
    pub timeout_ms: u64,
    /// Longest single blocking read inside a session.
    pub poll_interval_ms: u64,
    /// Accumulation ceiling for one response.
    pub max_response_bytes: usize,
    /// Quiet period that ends the stale-byte drain after a failed session.
    pub drain_window_ms: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.51".into(),
            port: "62801".into(),
            protocol: "vendotek".into(),
            connect_timeout_ms: 5000,
            timeout_ms: 60_000,
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
            drain_window_ms: 100,
        }
    }
}

impl DriverConfig {
    /// Build from a JSON object, filling missing fields with defaults.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_value(value.clone())?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("host must not be empty".into()));
        }
        if self.port.trim().is_empty() {
            return Err(ConfigError::Invalid("port must not be empty".into()));
        }
        if self.max_response_bytes == 0 {
            return Err(ConfigError::Invalid(
                "maxResponseBytes must be greater than zero".into(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "pollIntervalMs must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn drain_window(&self) -> Duration {
        Duration::from_millis(self.drain_window_ms)
    }

    pub fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            max_response_bytes: self.max_response_bytes,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }
}
