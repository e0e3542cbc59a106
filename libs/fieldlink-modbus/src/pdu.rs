//! Modbus PDU building and parsing
//!
//! Request builders and response parsers for the register operations moved
//! over a cached connection. Quantities are validated here, before any I/O.

use errors::{FieldLinkError, Result};

/// Maximum PDU length (Modbus specification)
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum number of bits in one read request
const MAX_READ_BITS: u16 = 2000;
/// Maximum number of words in one read request
const MAX_READ_WORDS: u16 = 125;
/// Maximum number of bits in one write request
const MAX_WRITE_BITS: u16 = 1968;
/// Maximum number of words in one write request
const MAX_WRITE_WORDS: u16 = 123;

/// Modbus function codes used by the register operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionCode {
    ReadCoils = 0x01,
    ReadDiscreteInputs = 0x02,
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    WriteSingleCoil = 0x05,
    WriteSingleRegister = 0x06,
    WriteMultipleCoils = 0x0F,
    WriteMultipleRegisters = 0x10,
}

impl FunctionCode {
    /// Wire value of this function code
    pub fn code(self) -> u8 {
        self as u8
    }

    fn reads_bits(self) -> bool {
        matches!(self, Self::ReadCoils | Self::ReadDiscreteInputs)
    }
}

/// Build a read request PDU for the given function
pub fn read_request(function: FunctionCode, address: u16, count: u16) -> Result<Vec<u8>> {
    let max = if function.reads_bits() {
        MAX_READ_BITS
    } else {
        MAX_READ_WORDS
    };
    if count == 0 || count > max {
        return Err(FieldLinkError::InvalidParameter(format!(
            "read count {count} out of range 1..={max} for function 0x{:02X}",
            function.code()
        )));
    }
    let mut pdu = Vec::with_capacity(5);
    pdu.push(function.code());
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&count.to_be_bytes());
    Ok(pdu)
}

/// Build a write-single-coil request PDU
pub fn write_coil_request(address: u16, value: bool) -> Vec<u8> {
    let encoded: u16 = if value { 0xFF00 } else { 0x0000 };
    let mut pdu = Vec::with_capacity(5);
    pdu.push(FunctionCode::WriteSingleCoil.code());
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&encoded.to_be_bytes());
    pdu
}

/// Build a write-single-register request PDU
pub fn write_register_request(address: u16, value: u16) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(5);
    pdu.push(FunctionCode::WriteSingleRegister.code());
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&value.to_be_bytes());
    pdu
}

/// Build a write-multiple-coils request PDU (bits packed LSB-first)
pub fn write_coils_request(address: u16, values: &[bool]) -> Result<Vec<u8>> {
    let count = values.len() as u16;
    if values.is_empty() || count > MAX_WRITE_BITS {
        return Err(FieldLinkError::InvalidParameter(format!(
            "write count {} out of range 1..={MAX_WRITE_BITS} for coils",
            values.len()
        )));
    }
    let byte_count = values.len().div_ceil(8);
    let mut pdu = Vec::with_capacity(6 + byte_count);
    pdu.push(FunctionCode::WriteMultipleCoils.code());
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&count.to_be_bytes());
    pdu.push(byte_count as u8);
    let mut packed = vec![0u8; byte_count];
    for (i, &bit) in values.iter().enumerate() {
        if bit {
            packed[i / 8] |= 1 << (i % 8);
        }
    }
    pdu.extend_from_slice(&packed);
    Ok(pdu)
}

/// Build a write-multiple-registers request PDU
pub fn write_registers_request(address: u16, values: &[u16]) -> Result<Vec<u8>> {
    let count = values.len() as u16;
    if values.is_empty() || count > MAX_WRITE_WORDS {
        return Err(FieldLinkError::InvalidParameter(format!(
            "write count {} out of range 1..={MAX_WRITE_WORDS} for registers",
            values.len()
        )));
    }
    let mut pdu = Vec::with_capacity(6 + values.len() * 2);
    pdu.push(FunctionCode::WriteMultipleRegisters.code());
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&count.to_be_bytes());
    pdu.push((values.len() * 2) as u8);
    for value in values {
        pdu.extend_from_slice(&value.to_be_bytes());
    }
    Ok(pdu)
}

/// Check for an exception response (function code with the error bit set)
fn check_response(function: FunctionCode, pdu: &[u8]) -> Result<()> {
    let Some(&code) = pdu.first() else {
        return Err(FieldLinkError::protocol("empty response PDU"));
    };
    if code == function.code() | 0x80 {
        let exception = pdu.get(1).copied().unwrap_or(0);
        return Err(FieldLinkError::ModbusException {
            code: exception,
            description: exception_description(exception),
        });
    }
    if code != function.code() {
        return Err(FieldLinkError::Protocol(format!(
            "response function 0x{code:02X} does not match request 0x{:02X}",
            function.code()
        )));
    }
    Ok(())
}

/// Parse a bit-valued read response into `count` booleans
pub fn parse_bit_response(function: FunctionCode, pdu: &[u8], count: u16) -> Result<Vec<bool>> {
    check_response(function, pdu)?;
    let byte_count = *pdu
        .get(1)
        .ok_or_else(|| FieldLinkError::protocol("truncated bit response"))? as usize;
    let data = &pdu[2..];
    if data.len() != byte_count || byte_count < (count as usize).div_ceil(8) {
        return Err(FieldLinkError::Protocol(format!(
            "bit response carries {} bytes, expected {byte_count}",
            data.len()
        )));
    }
    let mut bits = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        bits.push(data[i / 8] & (1 << (i % 8)) != 0);
    }
    Ok(bits)
}

/// Parse a word-valued read response into `count` registers
pub fn parse_word_response(function: FunctionCode, pdu: &[u8], count: u16) -> Result<Vec<u16>> {
    check_response(function, pdu)?;
    let byte_count = *pdu
        .get(1)
        .ok_or_else(|| FieldLinkError::protocol("truncated word response"))? as usize;
    let data = &pdu[2..];
    if data.len() != byte_count || byte_count != count as usize * 2 {
        return Err(FieldLinkError::Protocol(format!(
            "word response carries {} bytes, expected {}",
            data.len(),
            count as usize * 2
        )));
    }
    let words = data
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    Ok(words)
}

/// Validate a write response (the device echoes the request header)
pub fn parse_write_response(function: FunctionCode, pdu: &[u8]) -> Result<()> {
    check_response(function, pdu)?;
    if pdu.len() < 5 {
        return Err(FieldLinkError::protocol("truncated write response"));
    }
    Ok(())
}

/// Standard Modbus exception descriptions
pub fn exception_description(exception_code: u8) -> &'static str {
    match exception_code {
        0x01 => "Illegal Function",
        0x02 => "Illegal Data Address",
        0x03 => "Illegal Data Value",
        0x04 => "Slave Device Failure",
        0x05 => "Acknowledge",
        0x06 => "Slave Device Busy",
        0x07 => "Negative Acknowledge",
        0x08 => "Memory Parity Error",
        0x0A => "Gateway Path Unavailable",
        0x0B => "Gateway Target Device Failed to Respond",
        _ => "Unknown Exception",
    }
}
