// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Master server configuration.

use rendez::DEFAULT_MASTER_PORT;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Master server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// TCP port to listen on (default: 8881)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Client lease duration in seconds
    #[serde(default = "default_lease_duration")]
    pub lease_duration_secs: u64,

    /// Interval between lease checks (milliseconds)
    #[serde(default = "default_lease_check_interval")]
    pub lease_check_interval_ms: u64,

    /// Maximum number of connected client processes
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,

    /// Maximum number of nodes one client may register
    #[serde(default = "default_max_nodes_per_client")]
    pub max_nodes_per_client: usize,

    /// Maximum message size (bytes)
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Enable TCP keepalive on client connections
    #[serde(default = "default_true")]
    pub tcp_keepalive: bool,

    /// Idle time before keepalive probes start (seconds)
    #[serde(default = "default_keepalive_time")]
    pub tcp_keepalive_secs: u64,
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    DEFAULT_MASTER_PORT
}

fn default_lease_duration() -> u64 {
    10
}

fn default_lease_check_interval() -> u64 {
    1000
}

fn default_max_clients() -> usize {
    1000
}

fn default_max_nodes_per_client() -> usize {
    256
}

fn default_max_message_size() -> usize {
    16 * 1024 * 1024 // 16 MB
}

fn default_true() -> bool {
    true
}

fn default_keepalive_time() -> u64 {
    15
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            lease_duration_secs: default_lease_duration(),
            lease_check_interval_ms: default_lease_check_interval(),
            max_clients: default_max_clients(),
            max_nodes_per_client: default_max_nodes_per_client(),
            max_message_size: default_max_message_size(),
            tcp_keepalive: true,
            tcp_keepalive_secs: default_keepalive_time(),
        }
    }
}

impl ServerConfig {
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

    pub fn listen_address(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs)
    }

    pub fn lease_check_interval(&self) -> Duration {
        Duration::from_millis(self.lease_check_interval_ms)
    }

    pub fn tcp_keepalive_time(&self) -> Duration {
        Duration::from_secs(self.tcp_keepalive_secs)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue("port cannot be 0".into()));
        }
        if self.lease_duration_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "lease_duration_secs cannot be 0".into(),
            ));
        }
        if self.lease_check_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "lease_check_interval_ms cannot be 0".into(),
            ));
        }
        if self.max_clients == 0 {
            return Err(ConfigError::InvalidValue("max_clients cannot be 0".into()));
        }
        if self.max_nodes_per_client == 0 {
            return Err(ConfigError::InvalidValue(
                "max_nodes_per_client cannot be 0".into(),
            ));
        }
        if self.tcp_keepalive && self.tcp_keepalive_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "tcp_keepalive_secs cannot be 0 when keepalive is enabled".into(),
            ));
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, DEFAULT_MASTER_PORT);
        assert_eq!(config.lease_duration(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.json");
        std::fs::write(&path, r#"{ "port": 9000, "max_clients": 4 }"#).unwrap();

        let config = ServerConfig::from_file(&path).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.max_clients, 4);
        assert_eq!(config.lease_duration_secs, 10);
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.json");
        let config = ServerConfig {
            lease_duration_secs: 3,
            ..Default::default()
        };
        config.to_file(&path).unwrap();
        assert_eq!(ServerConfig::from_file(&path).unwrap().lease_duration_secs, 3);
    }

    #[test]
    fn test_validation_port_zero() {
        let config = ServerConfig {
            port: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_keepalive_without_time() {
        let config = ServerConfig {
            tcp_keepalive_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = ServerConfig {
            tcp_keepalive: false,
            tcp_keepalive_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}
