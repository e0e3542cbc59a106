//! Modbus RTU transport over a serial port

use crate::frame::RtuFramer;
use crate::transport::ModbusTransport;
use async_trait::async_trait;
use errors::{FieldLinkError, Result};
use serde::Deserialize;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_serial::SerialStream;
use tracing::trace;

/// Serial parity setting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        }
    }
}

/// Serial line settings for an RTU transport
#[derive(Debug, Clone)]
pub struct SerialSettings {
    pub device: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
}

impl SerialSettings {
    fn data_bits(&self) -> Result<tokio_serial::DataBits> {
        match self.data_bits {
            5 => Ok(tokio_serial::DataBits::Five),
            6 => Ok(tokio_serial::DataBits::Six),
            7 => Ok(tokio_serial::DataBits::Seven),
            8 => Ok(tokio_serial::DataBits::Eight),
            other => Err(FieldLinkError::config(format!(
                "unsupported data bits {other}"
            ))),
        }
    }

    fn stop_bits(&self) -> Result<tokio_serial::StopBits> {
        match self.stop_bits {
            1 => Ok(tokio_serial::StopBits::One),
            2 => Ok(tokio_serial::StopBits::Two),
            other => Err(FieldLinkError::config(format!(
                "unsupported stop bits {other}"
            ))),
        }
    }
}

/// Modbus RTU transport over a [`SerialStream`]
#[derive(Debug)]
pub struct SerialTransport {
    settings: SerialSettings,
    io_timeout: Duration,
    stream: Option<SerialStream>,
}

impl SerialTransport {
    pub fn new(settings: SerialSettings, io_timeout: Duration) -> Self {
        Self {
            settings,
            io_timeout,
            stream: None,
        }
    }
}

#[async_trait]
impl ModbusTransport for SerialTransport {
    fn description(&self) -> String {
        self.settings.device.clone()
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn connect(&mut self) -> Result<()> {
        let builder = tokio_serial::new(&self.settings.device, self.settings.baud_rate)
            .data_bits(self.settings.data_bits()?)
            .stop_bits(self.settings.stop_bits()?)
            .parity(self.settings.parity.into());
        let stream = SerialStream::open(&builder).map_err(|e| {
            FieldLinkError::connection_failed(&self.settings.device, e.to_string())
        })?;
        self.stream = Some(stream);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        // dropping the stream releases the port
        self.stream = None;
        Ok(())
    }

    async fn execute(&mut self, unit_id: u8, request: &[u8]) -> Result<Vec<u8>> {
        let frame = RtuFramer::encode(unit_id, request);
        trace!(
            "Modbus RTU {} => unit {unit_id} ({} bytes)",
            self.settings.device,
            frame.len()
        );

        let io_timeout = self.io_timeout;
        let device = self.settings.device.clone();
        let stream = self.stream.as_mut().ok_or(FieldLinkError::NotConnected)?;

        timeout(io_timeout, stream.write_all(&frame))
            .await
            .map_err(|_| FieldLinkError::Timeout(format!("Modbus write to {device}")))??;

        // The RTU response length depends on the echoed function code
        let mut head = [0u8; 2];
        timeout(io_timeout, stream.read_exact(&mut head))
            .await
            .map_err(|_| FieldLinkError::Timeout(format!("Modbus response from {device}")))??;
        let function = head[1];
        let remaining = if function & 0x80 != 0 {
            3 // exception code + CRC
        } else {
            match function {
                0x01..=0x04 => {
                    let mut count = [0u8; 1];
                    timeout(io_timeout, stream.read_exact(&mut count))
                        .await
                        .map_err(|_| {
                            FieldLinkError::Timeout(format!("Modbus response from {device}"))
                        })??;
                    let mut frame = vec![head[0], head[1], count[0]];
                    let mut data = vec![0u8; count[0] as usize + 2];
                    timeout(io_timeout, stream.read_exact(&mut data))
                        .await
                        .map_err(|_| {
                            FieldLinkError::Timeout(format!("Modbus response from {device}"))
                        })??;
                    frame.extend_from_slice(&data);
                    let (response_unit, pdu) = RtuFramer::decode(&frame)?;
                    if response_unit != unit_id {
                        return Err(FieldLinkError::Protocol(format!(
                            "unit id mismatch: sent {unit_id}, received {response_unit}"
                        )));
                    }
                    return Ok(pdu);
                },
                0x05 | 0x06 | 0x0F | 0x10 => 6, // echoed address/value + CRC
                other => {
                    return Err(FieldLinkError::Protocol(format!(
                        "unexpected RTU function code 0x{other:02X}"
                    )))
                },
            }
        };

        let mut rest = vec![0u8; remaining];
        timeout(io_timeout, stream.read_exact(&mut rest))
            .await
            .map_err(|_| FieldLinkError::Timeout(format!("Modbus response from {device}")))??;
        let mut full = head.to_vec();
        full.extend_from_slice(&rest);
        let (response_unit, pdu) = RtuFramer::decode(&full)?;
        if response_unit != unit_id {
            return Err(FieldLinkError::Protocol(format!(
                "unit id mismatch: sent {unit_id}, received {response_unit}"
            )));
        }
        Ok(pdu)
    }
}
