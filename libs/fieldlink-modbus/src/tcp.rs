//! Modbus TCP transport

use crate::frame::TcpFramer;
use crate::transport::ModbusTransport;
use async_trait::async_trait;
use errors::{FieldLinkError, Result};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

/// Default Modbus TCP port
pub const DEFAULT_PORT: u16 = 502;

/// Modbus TCP transport over a [`TcpStream`]
#[derive(Debug)]
pub struct TcpTransport {
    host: String,
    port: u16,
    io_timeout: Duration,
    framer: TcpFramer,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn new(host: impl Into<String>, port: u16, io_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            io_timeout,
            framer: TcpFramer::new(),
            stream: None,
        }
    }

}

#[async_trait]
impl ModbusTransport for TcpTransport {
    fn description(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn connect(&mut self) -> Result<()> {
        let endpoint = self.description();
        let stream = timeout(
            self.io_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| FieldLinkError::connection_failed(&endpoint, "connect timed out"))?
        .map_err(|e| FieldLinkError::connection_failed(&endpoint, e.to_string()))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("could not set TCP_NODELAY on {endpoint}: {e}");
        }
        self.stream = Some(stream);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        Ok(())
    }

    async fn execute(&mut self, unit_id: u8, request: &[u8]) -> Result<Vec<u8>> {
        let (transaction_id, frame) = self.framer.encode(unit_id, request);
        trace!(
            "Modbus TCP {} => unit {unit_id} txn {transaction_id} ({} bytes)",
            self.description(),
            frame.len()
        );

        let io_timeout = self.io_timeout;
        let endpoint = self.description();
        let stream = self.stream.as_mut().ok_or(FieldLinkError::NotConnected)?;

        timeout(io_timeout, stream.write_all(&frame))
            .await
            .map_err(|_| FieldLinkError::Timeout(format!("Modbus write to {endpoint}")))??;

        // MBAP header first, then the unit id + PDU it announces
        let mut header = [0u8; 7];
        timeout(io_timeout, stream.read_exact(&mut header))
            .await
            .map_err(|_| FieldLinkError::Timeout(format!("Modbus response from {endpoint}")))??;
        let length = u16::from_be_bytes([header[4], header[5]]) as usize;
        if length < 2 || length > 254 {
            return Err(FieldLinkError::Protocol(format!(
                "invalid MBAP length {length} from {endpoint}"
            )));
        }
        let mut rest = vec![0u8; length - 1];
        timeout(io_timeout, stream.read_exact(&mut rest))
            .await
            .map_err(|_| FieldLinkError::Timeout(format!("Modbus response from {endpoint}")))??;

        let mut response = header.to_vec();
        response.extend_from_slice(&rest);
        let (response_txn, response_unit, pdu) = TcpFramer::decode(&response)?;
        if response_txn != transaction_id {
            return Err(FieldLinkError::Protocol(format!(
                "transaction id mismatch: sent {transaction_id}, received {response_txn}"
            )));
        }
        if response_unit != unit_id {
            return Err(FieldLinkError::Protocol(format!(
                "unit id mismatch: sent {unit_id}, received {response_unit}"
            )));
        }
        Ok(pdu)
    }
}
