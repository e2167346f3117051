//! Server configuration

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::broker::config::duration_ms;
use crate::broker::BrokerConfig;
use crate::error::{Error, Result};
use crate::protocol::codec::{DEFAULT_MAX_CHUNK_SIZE, DEFAULT_MAX_LINE_LENGTH};

/// Default port of the viewer-facing listener
pub const DEFAULT_INTERNAL_PORT: u16 = 9500;

/// Default port of the agent-facing listener
pub const DEFAULT_EXTERNAL_PORT: u16 = 9501;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is not set
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "camrelay=info".into(),
            format: LogFormat::Text,
        }
    }
}

/// Relay server configuration options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Listener for viewers (`stream_request`, `video_request`, approvals)
    pub internal_addr: SocketAddr,

    /// Listener for agents and devices (responses, signals, records)
    pub external_addr: SocketAddr,

    /// Maximum connections being greeted and routed at once (0 = unlimited)
    pub max_connections: usize,

    /// The request line must arrive within this time
    #[serde(with = "duration_ms", rename = "handshake_timeout_ms")]
    pub handshake_timeout: Duration,

    /// Enable TCP_NODELAY (disable Nagle's algorithm)
    pub tcp_nodelay: bool,

    /// Longest accepted request line
    pub max_line_length: usize,

    /// Largest accepted stream chunk
    pub max_chunk_size: usize,

    pub broker: BrokerConfig,

    pub logging: LoggingConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            internal_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_INTERNAL_PORT)),
            external_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_EXTERNAL_PORT)),
            max_connections: 0, // Unlimited
            handshake_timeout: Duration::from_secs(10),
            tcp_nodelay: true, // Important for low latency
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            broker: BrokerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Load from a TOML file; missing keys keep their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Parse TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Set the internal (viewer) listener address
    pub fn internal_addr(mut self, addr: SocketAddr) -> Self {
        self.internal_addr = addr;
        self
    }

    /// Set the external (agent) listener address
    pub fn external_addr(mut self, addr: SocketAddr) -> Self {
        self.external_addr = addr;
        self
    }

    /// Set maximum connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set handshake timeout
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set broker configuration
    pub fn broker(mut self, broker: BrokerConfig) -> Self {
        self.broker = broker;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();

        assert_eq!(config.internal_addr.port(), DEFAULT_INTERNAL_PORT);
        assert_eq!(config.external_addr.port(), DEFAULT_EXTERNAL_PORT);
        assert_eq!(config.max_connections, 0);
        assert_eq!(config.max_line_length, DEFAULT_MAX_LINE_LENGTH);
        assert!(config.tcp_nodelay);
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_builder_chaining() {
        let internal: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        let external: SocketAddr = "127.0.0.1:7001".parse().unwrap();
        let config = RelayConfig::default()
            .internal_addr(internal)
            .external_addr(external)
            .max_connections(50)
            .handshake_timeout(Duration::from_secs(2))
            .broker(BrokerConfig::default().relay_client_id("hub"));

        assert_eq!(config.internal_addr, internal);
        assert_eq!(config.external_addr, external);
        assert_eq!(config.max_connections, 50);
        assert_eq!(config.handshake_timeout, Duration::from_secs(2));
        assert_eq!(config.broker.relay_client_id, "hub");
    }

    #[test]
    fn test_from_toml() {
        let config = RelayConfig::from_toml(
            r#"
            internal_addr = "127.0.0.1:7000"
            handshake_timeout_ms = 1500

            [broker]
            video_request_timeout_ms = 5000
            known_clients = ["agent-1"]

            [logging]
            level = "camrelay=debug"
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.internal_addr.port(), 7000);
        assert_eq!(config.external_addr.port(), DEFAULT_EXTERNAL_PORT);
        assert_eq!(config.handshake_timeout, Duration::from_millis(1500));
        assert_eq!(config.broker.video_request_timeout, Duration::from_secs(5));
        assert_eq!(config.broker.known_clients, vec!["agent-1".to_string()]);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        let err = RelayConfig::from_toml("internal_addr = 5").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_load_missing_file() {
        let err = RelayConfig::load("/nonexistent/camrelay.toml").unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
