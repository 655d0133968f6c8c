// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Router configuration.
//!
//! Supports both programmatic and file-based (TOML) configuration.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::protocol::{DEFAULT_MAX_MESSAGE_SIZE, HEADER_SIZE};

/// Default TCP port of the router.
pub const DEFAULT_PORT: u16 = 33647;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Reserved agent file, line {line}: {reason}")]
    Reserved { line: usize, reason: String },

    #[error("No reserved agent file configured")]
    NoReservedFile,
}

/// Router configuration. Immutable once the router is started.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Address to bind to (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// TCP port to listen on (default: 33647, 0 picks a free port)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Message processing threads (default: available cores)
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// Silence after which a connected agent is disconnected (ms)
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_ms: u64,

    /// Disconnection age after which a dynamic agent is forgotten (ms, -1 disables)
    #[serde(default = "default_eviction_timeout")]
    pub client_eviction_timeout_ms: i64,

    /// Reserved agents and admin cookie (properties format)
    #[serde(default)]
    pub reserved_agents_file: Option<PathBuf>,

    /// Threads sending heartbeats
    #[serde(default = "default_heartbeat_sender_threads")]
    pub heartbeat_sender_threads: usize,

    /// Maximum envelope size (bytes)
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Give up on a peer that accepts no bytes for this long (ms)
    #[serde(default = "default_write_stall_timeout")]
    pub write_stall_timeout_ms: u64,

    /// Disable Nagle on accepted connections
    #[serde(default = "default_true")]
    pub tcp_nodelay: bool,
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_worker_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_heartbeat_timeout() -> u64 {
    9_000
}

fn default_eviction_timeout() -> i64 {
    -1
}

fn default_heartbeat_sender_threads() -> usize {
    8
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

fn default_write_stall_timeout() -> u64 {
    60_000
}

fn default_true() -> bool {
    true
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            worker_threads: default_worker_threads(),
            heartbeat_timeout_ms: default_heartbeat_timeout(),
            client_eviction_timeout_ms: default_eviction_timeout(),
            reserved_agents_file: None,
            heartbeat_sender_threads: default_heartbeat_sender_threads(),
            max_message_size: default_max_message_size(),
            write_stall_timeout_ms: default_write_stall_timeout(),
            tcp_nodelay: true,
        }
    }
}

impl RouterConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Socket address to listen on.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Heartbeat task period: a third of the timeout.
    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms / 3)
    }

    /// Eviction timeout, `None` when eviction is disabled.
    pub fn eviction_timeout(&self) -> Option<Duration> {
        u64::try_from(self.client_eviction_timeout_ms)
            .ok()
            .map(Duration::from_millis)
    }

    pub fn write_stall_timeout(&self) -> Duration {
        Duration::from_millis(self.write_stall_timeout_ms)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_threads == 0 {
            return Err(ConfigError::Invalid("worker_threads cannot be 0".into()));
        }
        if self.heartbeat_sender_threads == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat_sender_threads cannot be 0".into(),
            ));
        }
        if self.heartbeat_timeout_ms < 3 {
            return Err(ConfigError::Invalid(
                "heartbeat_timeout_ms must be at least 3".into(),
            ));
        }
        match self.client_eviction_timeout_ms {
            -1 => {}
            t if t < 3 => {
                return Err(ConfigError::Invalid(format!(
                    "client_eviction_timeout_ms must be -1 or at least 3, got {}",
                    t
                )));
            }
            _ => {}
        }
        if self.max_message_size < HEADER_SIZE + 256 {
            return Err(ConfigError::Invalid(format!(
                "max_message_size must be at least {} bytes",
                HEADER_SIZE + 256
            )));
        }
        if self.write_stall_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "write_stall_timeout_ms cannot be 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = RouterConfig::default();
        assert_eq!(config.port, 33647);
        assert_eq!(config.client_eviction_timeout_ms, -1);
        assert!(config.eviction_timeout().is_none());
        assert!(config.worker_threads >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_periods() {
        let config = RouterConfig {
            heartbeat_timeout_ms: 900,
            client_eviction_timeout_ms: 3000,
            ..Default::default()
        };
        assert_eq!(config.heartbeat_period(), Duration::from_millis(300));
        assert_eq!(config.eviction_timeout(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_eviction_zero_rejected() {
        let config = RouterConfig {
            client_eviction_timeout_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RouterConfig {
            client_eviction_timeout_ms: -5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = RouterConfig {
            worker_threads: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_toml_partial() {
        let config = RouterConfig::from_toml(
            r#"
            port = 4000
            heartbeat_timeout_ms = 1200
            reserved_agents_file = "/etc/router/agents.properties"
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 4000);
        assert_eq!(config.heartbeat_timeout_ms, 1200);
        assert_eq!(
            config.reserved_agents_file,
            Some(PathBuf::from("/etc/router/agents.properties"))
        );
        assert_eq!(config.client_eviction_timeout_ms, -1);
    }

    #[test]
    fn test_toml_invalid_value() {
        let err = RouterConfig::from_toml("client_eviction_timeout_ms = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_toml_roundtrip_file() {
        let config = RouterConfig {
            port: 5555,
            worker_threads: 3,
            ..Default::default()
        };
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(config.to_toml_string().unwrap().as_bytes())
            .unwrap();

        let loaded = RouterConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded.port, 5555);
        assert_eq!(loaded.worker_threads, 3);
    }
}
