//! Modbus network front-end
//!
//! Owns the endpoint configuration and the cached connection, and vends
//! per-unit device handles that run one transaction per register operation.

use crate::cached::{CachedModbusConnection, ConnectionGuard, TransportFactory};
use crate::serial::{Parity, SerialSettings, SerialTransport};
use crate::tcp::{TcpTransport, DEFAULT_PORT};
use crate::transport::ModbusTransport;
use errors::{FieldLinkError, Result};
use serde::Deserialize;
use std::time::Duration;

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_keep_open_secs() -> i64 {
    90
}

/// Modbus network configuration.
///
/// Exactly one of `host` (TCP) or `device` (serial RTU) must be set. A
/// `keep_open_secs` of zero or less disables connection caching.
#[derive(Debug, Clone, Deserialize)]
pub struct ModbusNetworkConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_keep_open_secs")]
    pub keep_open_secs: i64,
}

impl Default for ModbusNetworkConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_port(),
            device: None,
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            parity: Parity::default(),
            timeout_ms: default_timeout_ms(),
            keep_open_secs: default_keep_open_secs(),
        }
    }
}

impl ModbusNetworkConfig {
    fn description(&self) -> String {
        match (&self.host, &self.device) {
            (Some(host), _) => format!("{host}:{}", self.port),
            (None, Some(device)) => device.clone(),
            (None, None) => "unconfigured".to_string(),
        }
    }
}

/// A Modbus network: one endpoint, one cached connection, many unit ids.
///
/// Reconfiguration goes through [`ModbusNetwork::shutdown`], which closes any
/// live handle unconditionally; build a new network with the new settings
/// afterwards.
pub struct ModbusNetwork {
    config: ModbusNetworkConfig,
    cached: CachedModbusConnection,
}

impl ModbusNetwork {
    pub fn new(config: ModbusNetworkConfig) -> Result<Self> {
        let io_timeout = Duration::from_millis(config.timeout_ms);
        let keep_open = if config.keep_open_secs > 0 {
            Duration::from_secs(config.keep_open_secs as u64)
        } else {
            Duration::ZERO
        };
        let factory: TransportFactory = match (&config.host, &config.device) {
            (Some(_), Some(_)) => {
                return Err(FieldLinkError::config(
                    "both host and device configured; pick TCP or serial",
                ))
            },
            (Some(host), None) => {
                let host = host.clone();
                let port = config.port;
                Box::new(move || {
                    Box::new(TcpTransport::new(host.clone(), port, io_timeout))
                        as Box<dyn ModbusTransport>
                })
            },
            (None, Some(device)) => {
                let settings = SerialSettings {
                    device: device.clone(),
                    baud_rate: config.baud_rate,
                    data_bits: config.data_bits,
                    stop_bits: config.stop_bits,
                    parity: config.parity,
                };
                Box::new(move || {
                    Box::new(SerialTransport::new(settings.clone(), io_timeout))
                        as Box<dyn ModbusTransport>
                })
            },
            (None, None) => {
                return Err(FieldLinkError::config(
                    "no Modbus endpoint configured; set host or device",
                ))
            },
        };
        let cached = CachedModbusConnection::new(config.description(), keep_open, factory);
        Ok(Self { config, cached })
    }

    /// Endpoint description, e.g. `10.0.4.2:502`
    pub fn description(&self) -> String {
        self.config.description()
    }

    /// Handle for one unit (slave) id on this network
    pub fn device(&self, unit_id: u8) -> ModbusDevice<'_> {
        ModbusDevice {
            network: self,
            unit_id,
        }
    }

    /// Acquire the cached connection directly, for multi-operation
    /// transactions under one lock hold
    pub async fn acquire(&self) -> Result<ConnectionGuard<'_>> {
        self.cached.acquire().await
    }

    /// Close any live handle unconditionally and stop the expiry task
    pub async fn shutdown(&self) {
        self.cached.force_close().await;
    }
}

impl std::fmt::Display for ModbusNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ModbusNetwork{{{}}}", self.config.description())
    }
}

/// One unit id on a [`ModbusNetwork`]. Each operation is one transaction:
/// acquire, exchange, release.
pub struct ModbusDevice<'a> {
    network: &'a ModbusNetwork,
    unit_id: u8,
}

macro_rules! transaction {
    ($self:ident, $op:ident ( $($arg:expr),* )) => {{
        let mut conn = $self.network.acquire().await?;
        let result = conn.$op($self.unit_id, $($arg),*).await;
        conn.release().await;
        result
    }};
}

impl ModbusDevice<'_> {
    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    pub async fn read_coils(&self, address: u16, count: u16) -> Result<Vec<bool>> {
        transaction!(self, read_coils(address, count))
    }

    pub async fn read_discrete_inputs(&self, address: u16, count: u16) -> Result<Vec<bool>> {
        transaction!(self, read_discrete_inputs(address, count))
    }

    pub async fn read_holding_registers(&self, address: u16, count: u16) -> Result<Vec<u16>> {
        transaction!(self, read_holding_registers(address, count))
    }

    pub async fn read_input_registers(&self, address: u16, count: u16) -> Result<Vec<u16>> {
        transaction!(self, read_input_registers(address, count))
    }

    pub async fn write_coil(&self, address: u16, value: bool) -> Result<()> {
        transaction!(self, write_coil(address, value))
    }

    pub async fn write_coils(&self, address: u16, values: &[bool]) -> Result<()> {
        transaction!(self, write_coils(address, values))
    }

    pub async fn write_register(&self, address: u16, value: u16) -> Result<()> {
        transaction!(self, write_register(address, value))
    }

    pub async fn write_registers(&self, address: u16, values: &[u16]) -> Result<()> {
        transaction!(self, write_registers(address, values))
    }
}
