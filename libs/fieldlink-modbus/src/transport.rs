//! Transport abstraction for Modbus request/response exchanges
//!
//! A transport owns one physical handle (TCP socket or serial port) and moves
//! a single request PDU and its response PDU over it per call. Framing (MBAP
//! or RTU) is a transport concern; PDU contents are not.

use async_trait::async_trait;
use errors::Result;
use std::fmt;

/// Connection state for transports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport is disconnected
    Disconnected,
    /// Transport is attempting to connect
    Connecting,
    /// Transport is connected and ready
    Connected,
}

/// Register-moving transport over one physical connection.
///
/// Implementations have a single-transaction contract: callers must not issue
/// overlapping `execute` calls. The cached connection layer enforces this
/// with its exclusion lock.
#[async_trait]
pub trait ModbusTransport: Send + fmt::Debug {
    /// Human-readable endpoint description, e.g. `10.0.4.2:502` or `/dev/ttyS1`
    fn description(&self) -> String;

    /// Whether the physical handle is currently open
    fn is_connected(&self) -> bool;

    /// Open the physical handle. Fails with a transport error if the
    /// endpoint is unreachable.
    async fn connect(&mut self) -> Result<()>;

    /// Close the physical handle. Idempotent.
    async fn close(&mut self) -> Result<()>;

    /// One request/response round trip: frame and write `request` for
    /// `unit_id`, then read and unframe the matching response PDU.
    async fn execute(&mut self, unit_id: u8, request: &[u8]) -> Result<Vec<u8>>;
}
