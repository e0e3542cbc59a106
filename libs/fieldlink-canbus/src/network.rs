//! CAN bus network front-end
//!
//! Holds the gateway endpoint settings and creates protocol connections by
//! bus name. Connections are single-session: a closed connection is replaced
//! by creating a new one here, never reopened.

use crate::socketcand::connection::{
    SocketcandConnection, DEFAULT_READ_TIMEOUT, DEFAULT_VERIFY_TIMEOUT,
};
use errors::{FieldLinkError, Result};
use serde::Deserialize;
use std::time::Duration;

/// Default socketcand TCP port
pub const DEFAULT_PORT: u16 = 29536;

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_read_timeout_ms() -> u64 {
    DEFAULT_READ_TIMEOUT.as_millis() as u64
}

fn default_verify_timeout_ms() -> u64 {
    DEFAULT_VERIFY_TIMEOUT.as_millis() as u64
}

/// CAN bus gateway configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CanbusNetworkConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_verify_timeout_ms")]
    pub verify_timeout_ms: u64,
}

/// Factory for socketcand connections to one gateway
#[derive(Debug, Clone)]
pub struct CanbusNetwork {
    config: CanbusNetworkConfig,
}

impl CanbusNetwork {
    pub fn new(config: CanbusNetworkConfig) -> Result<Self> {
        if config.host.is_empty() {
            return Err(FieldLinkError::config("CAN bus gateway host not set"));
        }
        Ok(Self { config })
    }

    /// Gateway endpoint description
    pub fn description(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }

    /// Create an unopened connection to `bus_name` on this gateway
    pub fn create_connection(&self, bus_name: impl Into<String>) -> SocketcandConnection {
        SocketcandConnection::new(self.config.host.clone(), self.config.port, bus_name)
            .with_read_timeout(Duration::from_millis(self.config.read_timeout_ms))
            .with_verify_timeout(Duration::from_millis(self.config.verify_timeout_ms))
    }
}

impl std::fmt::Display for CanbusNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CanbusNetwork{{{}}}", self.description())
    }
}
