// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Node-side configuration.
//!
//! [`NodeConfig`] covers the Master connection, heartbeat cadence, RPC
//! defaults and where data-plane listeners are opened. It can be loaded from
//! a JSON file, overridden from `RENDEZ_*` environment variables, or built
//! with the `with_*` methods.

use crate::status::Status;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default Master TCP port.
pub const DEFAULT_MASTER_PORT: u16 = 8881;

/// Node configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Master address (host:port).
    #[serde(default = "default_master_address")]
    pub master_address: SocketAddr,

    /// Timeout for the initial Master connection, in milliseconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Heartbeat interval to keep the client lease alive, in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Maximum control-plane message size (bytes).
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Default RPC call timeout, in milliseconds.
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_ms: u64,

    /// Reconnect attempts after a data-plane failure (0 = never).
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,

    /// Delay between reconnect attempts, in milliseconds.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,

    /// Local address data-plane listeners bind to.
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// Directory holding Unix domain sockets.
    #[serde(default = "default_uds_dir")]
    pub uds_dir: PathBuf,
}

fn default_master_address() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_MASTER_PORT)
}

fn default_connect_timeout() -> u64 {
    5_000
}

fn default_heartbeat_interval() -> u64 {
    1_000
}

fn default_max_message_size() -> usize {
    16 * 1024 * 1024 // 16 MB
}

fn default_rpc_timeout() -> u64 {
    5_000
}

fn default_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_delay() -> u64 {
    200
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_uds_dir() -> PathBuf {
    std::env::temp_dir()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            master_address: default_master_address(),
            connect_timeout_ms: default_connect_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            max_message_size: default_max_message_size(),
            rpc_timeout_ms: default_rpc_timeout(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_delay_ms: default_reconnect_delay(),
            bind_address: default_bind_address(),
            uds_dir: default_uds_dir(),
        }
    }
}

impl NodeConfig {
    /// Create a configuration pointing at the given Master.
    pub fn new(master_address: SocketAddr) -> Self {
        Self {
            master_address,
            ..Default::default()
        }
    }

    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        serde_json::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Save configuration to a JSON file.
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))
    }

    /// Apply `RENDEZ_MASTER_ADDR`, `RENDEZ_HEARTBEAT_MS` and `RENDEZ_UDS_DIR`
    /// overrides from the environment.
    pub fn apply_env(mut self) -> Result<Self, ConfigError> {
        self.apply_vars(|key| std::env::var(key).ok())?;
        Ok(self)
    }

    fn apply_vars<F>(&mut self, get: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = get("RENDEZ_MASTER_ADDR") {
            self.master_address = addr.parse().map_err(|_| {
                ConfigError::InvalidValue(format!("RENDEZ_MASTER_ADDR '{}'", addr))
            })?;
        }
        if let Some(ms) = get("RENDEZ_HEARTBEAT_MS") {
            self.heartbeat_interval_ms = ms
                .parse()
                .map_err(|_| ConfigError::InvalidValue(format!("RENDEZ_HEARTBEAT_MS '{}'", ms)))?;
        }
        if let Some(dir) = get("RENDEZ_UDS_DIR") {
            self.uds_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    /// Builder: set Master address.
    pub fn with_master_address(mut self, addr: SocketAddr) -> Self {
        self.master_address = addr;
        self
    }

    /// Builder: set connection timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Builder: set heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Builder: set default RPC timeout.
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Builder: set data-plane reconnect policy.
    pub fn with_reconnect(mut self, attempts: u32, delay: Duration) -> Self {
        self.reconnect_attempts = attempts;
        self.reconnect_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Builder: set the Unix domain socket directory.
    pub fn with_uds_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.uds_dir = dir.into();
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.master_address.port() == 0 {
            return Err(ConfigError::InvalidValue(
                "master_address port cannot be 0".into(),
            ));
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "connect_timeout_ms cannot be 0".into(),
            ));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "heartbeat_interval_ms cannot be 0".into(),
            ));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::InvalidValue(
                "max_message_size cannot be 0".into(),
            ));
        }
        if self.rpc_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue("rpc_timeout_ms cannot be 0".into()));
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, Clone)]
pub enum ConfigError {
    IoError(String),
    ParseError(String),
    SerializeError(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IoError(s) => write!(f, "I/O error: {}", s),
            Self::ParseError(s) => write!(f, "Parse error: {}", s),
            Self::SerializeError(s) => write!(f, "Serialize error: {}", s),
            Self::InvalidValue(s) => write!(f, "Invalid value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for Status {
    fn from(e: ConfigError) -> Self {
        Status::invalid_argument(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.master_address.port(), DEFAULT_MASTER_PORT);
        assert_eq!(config.reconnect_attempts, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_methods() {
        let config = NodeConfig::default()
            .with_connect_timeout(Duration::from_secs(2))
            .with_heartbeat_interval(Duration::from_millis(250))
            .with_rpc_timeout(Duration::from_secs(1))
            .with_reconnect(3, Duration::from_millis(50));

        assert_eq!(config.connect_timeout(), Duration::from_secs(2));
        assert_eq!(config.heartbeat_interval(), Duration::from_millis(250));
        assert_eq!(config.rpc_timeout(), Duration::from_secs(1));
        assert_eq!(config.reconnect_attempts, 3);
        assert_eq!(config.reconnect_delay(), Duration::from_millis(50));
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        let config = NodeConfig::new("10.0.0.5:9000".parse().unwrap()).with_uds_dir("/run/rendez");
        config.to_file(&path).unwrap();
        let loaded = NodeConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(&path, r#"{"rpc_timeout_ms": 750}"#).unwrap();
        let loaded = NodeConfig::from_file(&path).unwrap();
        assert_eq!(loaded.rpc_timeout(), Duration::from_millis(750));
        assert_eq!(loaded.master_address.port(), DEFAULT_MASTER_PORT);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("RENDEZ_MASTER_ADDR", "127.0.0.1:9999"),
            ("RENDEZ_HEARTBEAT_MS", "300"),
        ]
        .into_iter()
        .collect();
        let mut config = NodeConfig::default();
        config
            .apply_vars(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.master_address.port(), 9999);
        assert_eq!(config.heartbeat_interval_ms, 300);

        let mut config = NodeConfig::default();
        let err = config.apply_vars(|k| (k == "RENDEZ_HEARTBEAT_MS").then(|| "soon".to_string()));
        assert!(err.is_err());
    }

    #[test]
    fn test_validation_errors() {
        let mut config = NodeConfig {
            connect_timeout_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.connect_timeout_ms = 1000;
        config.heartbeat_interval_ms = 0;
        assert!(config.validate().is_err());

        config.heartbeat_interval_ms = 1000;
        config.max_message_size = 0;
        let status: Status = config.validate().unwrap_err().into();
        assert_eq!(status.code(), crate::status::StatusCode::InvalidArgument);
    }
}
