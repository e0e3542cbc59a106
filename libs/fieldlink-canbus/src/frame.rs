//! CAN bus frame model

use errors::{FieldLinkError, Result};
use std::fmt;

/// Largest standard (11-bit) arbitration address
pub const MAX_STANDARD_ADDRESS: u32 = 0x7FF;

/// Largest extended (29-bit) arbitration address
pub const MAX_EXTENDED_ADDRESS: u32 = 0x1FFF_FFFF;

/// Largest CAN frame payload
pub const MAX_DATA_LENGTH: usize = 8;

/// One CAN frame as captured off the bus: arbitration address, capture
/// timestamp, and up to eight data bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct CanbusFrame {
    address: u32,
    extended: bool,
    seconds: u64,
    microseconds: u32,
    data: Vec<u8>,
}

impl CanbusFrame {
    /// Create a frame, validating the address range and payload length
    pub fn new(
        address: u32,
        extended: bool,
        seconds: u64,
        microseconds: u32,
        data: Vec<u8>,
    ) -> Result<Self> {
        if address > MAX_EXTENDED_ADDRESS {
            return Err(FieldLinkError::InvalidParameter(format!(
                "address 0x{address:X} exceeds 29-bit range"
            )));
        }
        if data.len() > MAX_DATA_LENGTH {
            return Err(FieldLinkError::InvalidParameter(format!(
                "frame data of {} bytes exceeds maximum {MAX_DATA_LENGTH}",
                data.len()
            )));
        }
        Ok(Self {
            address,
            extended,
            seconds,
            microseconds,
            data,
        })
    }

    /// Arbitration address
    pub fn address(&self) -> u32 {
        self.address
    }

    /// Whether this frame uses an extended 29-bit address. An address above
    /// the standard range is extended regardless of the explicit flag.
    pub fn is_extended(&self) -> bool {
        self.extended || self.address > MAX_STANDARD_ADDRESS
    }

    /// Capture timestamp, whole seconds
    pub fn seconds(&self) -> u64 {
        self.seconds
    }

    /// Capture timestamp, microsecond fraction
    pub fn microseconds(&self) -> u32 {
        self.microseconds
    }

    /// Frame payload
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for CanbusFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CanbusFrame{{{self}}}")
    }
}

impl fmt::Display for CanbusFrame {
    // candump-style: 1A3#11223344
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_extended() {
            write!(f, "{:08X}#", self.address)?;
        } else {
            write!(f, "{:X}#", self.address)?;
        }
        for byte in &self.data {
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

/// Receiver of frames dispatched by a connection's reader task.
///
/// Implementations must not block: the reader delivers frames inline and a
/// slow listener stalls delivery for the whole connection.
pub trait FrameListener: Send + Sync {
    fn frame_received(&self, frame: &CanbusFrame);
}
