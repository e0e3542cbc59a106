//! Unified error handling for FieldLink crates
//!
//! One error type shared by the transport and protocol crates, so callers
//! deal with a single taxonomy: configuration, transport, protocol, timeout.

use thiserror::Error;

/// Main error type for the FieldLink connection layer
#[derive(Debug, Error, Clone)]
pub enum FieldLinkError {
    // ======================================
    // Configuration Errors
    // ======================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    // ======================================
    // Transport Errors
    // ======================================
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection failed: {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Not connected")]
    NotConnected,

    // ======================================
    // Protocol Errors
    // ======================================
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Modbus exception 0x{code:02X}: {description}")]
    ModbusException { code: u8, description: &'static str },

    // ======================================
    // Timeouts
    // ======================================
    #[error("Timeout waiting for {0}")]
    Timeout(String),
}

impl FieldLinkError {
    /// Configuration error from any displayable reason
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config(reason.into())
    }

    /// Protocol error from any displayable reason
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol(reason.into())
    }

    /// Connection failure with endpoint context
    pub fn connection_failed(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }

    /// True for transport-level failures that leave the underlying handle in
    /// an unknown state (the cached connection force-closes on these).
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::ConnectionFailed { .. } | Self::ConnectionClosed | Self::NotConnected
        )
    }
}

impl From<std::io::Error> for FieldLinkError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Result type alias using [`FieldLinkError`]
pub type Result<T> = std::result::Result<T, FieldLinkError>;
