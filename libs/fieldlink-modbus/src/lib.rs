//! Modbus register transports with idle-expiry connection caching
//!
//! The layer a field-node device driver sits on: a [`ModbusNetwork`] owns one
//! endpoint (TCP or serial RTU) and a [`CachedModbusConnection`] that keeps
//! the handle open across transactions, serializes callers, and expires it
//! after inactivity. Register operations are plain Modbus PDUs framed per
//! transport.

pub mod cached;
pub mod frame;
pub mod network;
pub mod pdu;
pub mod serial;
pub mod tcp;
pub mod transport;

pub use cached::{CachedModbusConnection, ConnectionGuard, TransportFactory, DEFAULT_KEEP_OPEN};
pub use network::{ModbusDevice, ModbusNetwork, ModbusNetworkConfig};
pub use pdu::FunctionCode;
pub use transport::{ConnectionState, ModbusTransport};
