//! Socketcand message model
//!
//! Every message on the wire is `<` verb [args...] `>`. This module models
//! the verbs the connection understands, plus builders for the outbound
//! control commands and a parser for inbound frame messages.

use crate::frame::{CanbusFrame, MAX_STANDARD_ADDRESS};
use errors::{FieldLinkError, Result};
use std::fmt;
use std::time::Duration;

/// Command verbs of the socketcand protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Server greeting, sent immediately after connecting
    Hi,
    /// Open a named bus
    Open,
    /// Positive acknowledgement
    Ok,
    Add,
    Update,
    Delete,
    /// Write a frame onto the bus
    Send,
    /// Subscribe with a data-filter bitmask
    Filter,
    /// Subscribe with a multiplex identifier mask and filter values
    Muxfilter,
    /// Plain per-address subscription
    Subscribe,
    Unsubscribe,
    /// Connectivity probe; echoed back by the server
    Echo,
    /// Enter promiscuous (monitor) mode
    Rawmode,
    /// Return to broadcast-manager mode
    Bcmmode,
    /// Unsolicited bus frame
    Frame,
    Statistics,
    Stat,
}

impl MessageKind {
    /// Wire verb for this kind
    pub fn verb(self) -> &'static str {
        match self {
            Self::Hi => "hi",
            Self::Open => "open",
            Self::Ok => "ok",
            Self::Add => "add",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Send => "send",
            Self::Filter => "filter",
            Self::Muxfilter => "muxfilter",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::Echo => "echo",
            Self::Rawmode => "rawmode",
            Self::Bcmmode => "bcmmode",
            Self::Frame => "frame",
            Self::Statistics => "statistics",
            Self::Stat => "stat",
        }
    }

    /// Parse a wire verb; `None` for verbs this implementation does not know
    pub fn from_verb(verb: &str) -> Option<Self> {
        match verb {
            "hi" => Some(Self::Hi),
            "open" => Some(Self::Open),
            "ok" => Some(Self::Ok),
            "add" => Some(Self::Add),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            "send" => Some(Self::Send),
            "filter" => Some(Self::Filter),
            "muxfilter" => Some(Self::Muxfilter),
            "subscribe" => Some(Self::Subscribe),
            "unsubscribe" => Some(Self::Unsubscribe),
            "echo" => Some(Self::Echo),
            "rawmode" => Some(Self::Rawmode),
            "bcmmode" => Some(Self::Bcmmode),
            "frame" => Some(Self::Frame),
            "statistics" => Some(Self::Statistics),
            "stat" => Some(Self::Stat),
            _ => None,
        }
    }
}

/// Format an arbitration address: bare hex for standard addresses,
/// zero-padded to eight digits for extended ones
pub fn format_address(address: u32, extended: bool) -> String {
    if extended || address > MAX_STANDARD_ADDRESS {
        format!("{address:08X}")
    } else {
        format!("{address:X}")
    }
}

/// Parse an arbitration address token, inferring the extended flag from the
/// zero-padded form or the value range
pub fn parse_address(token: &str) -> Result<(u32, bool)> {
    let address = u32::from_str_radix(token, 16)
        .map_err(|_| FieldLinkError::Protocol(format!("invalid address token [{token}]")))?;
    if address > crate::frame::MAX_EXTENDED_ADDRESS {
        return Err(FieldLinkError::Protocol(format!(
            "address 0x{address:X} exceeds 29-bit range"
        )));
    }
    let extended = token.len() >= 8 || address > MAX_STANDARD_ADDRESS;
    Ok((address, extended))
}

/// Seconds and microseconds components of a subscription duration limit
pub fn limit_components(limit: Option<Duration>) -> (u64, u32) {
    match limit {
        Some(limit) => (limit.as_secs(), limit.subsec_micros()),
        None => (0, 0),
    }
}

/// One socketcand message: a verb plus whitespace-separated arguments.
///
/// Unknown verbs are preserved as-is so the reader can log and skip them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    verb: String,
    args: Vec<String>,
}

impl Message {
    /// Message with a known verb
    pub fn new(kind: MessageKind, args: Vec<String>) -> Self {
        Self {
            verb: kind.verb().to_string(),
            args,
        }
    }

    /// Message with an arbitrary verb, as read off the wire
    pub fn raw(verb: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            verb: verb.into(),
            args,
        }
    }

    pub fn kind(&self) -> Option<MessageKind> {
        MessageKind::from_verb(&self.verb)
    }

    pub fn verb(&self) -> &str {
        &self.verb
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    // ======================================
    // Outbound command builders
    // ======================================

    pub fn open(bus_name: &str) -> Self {
        Self::new(MessageKind::Open, vec![bus_name.to_string()])
    }

    pub fn echo() -> Self {
        Self::new(MessageKind::Echo, Vec::new())
    }

    pub fn rawmode() -> Self {
        Self::new(MessageKind::Rawmode, Vec::new())
    }

    pub fn bcmmode() -> Self {
        Self::new(MessageKind::Bcmmode, Vec::new())
    }

    pub fn subscribe(address: u32, extended: bool, limit: Option<Duration>) -> Self {
        let (secs, usecs) = limit_components(limit);
        Self::new(
            MessageKind::Subscribe,
            vec![
                format_address(address, extended),
                secs.to_string(),
                usecs.to_string(),
            ],
        )
    }

    pub fn unsubscribe(address: u32, extended: bool) -> Self {
        Self::new(
            MessageKind::Unsubscribe,
            vec![format_address(address, extended)],
        )
    }

    pub fn filter(address: u32, extended: bool, limit: Option<Duration>, mask: u64) -> Self {
        let (secs, usecs) = limit_components(limit);
        Self::new(
            MessageKind::Filter,
            vec![
                format_address(address, extended),
                secs.to_string(),
                usecs.to_string(),
                format!("{mask:X}"),
            ],
        )
    }

    pub fn muxfilter(
        address: u32,
        extended: bool,
        limit: Option<Duration>,
        identifier_mask: u64,
        filters: &[u64],
    ) -> Self {
        let (secs, usecs) = limit_components(limit);
        let mut args = vec![
            format_address(address, extended),
            secs.to_string(),
            usecs.to_string(),
            format!("{identifier_mask:X}"),
        ];
        args.extend(filters.iter().map(|filter| format!("{filter:X}")));
        Self::new(MessageKind::Muxfilter, args)
    }

    pub fn send_frame(frame: &CanbusFrame) -> Self {
        let mut args = vec![
            format_address(frame.address(), frame.is_extended()),
            frame.data().len().to_string(),
        ];
        args.extend(frame.data().iter().map(|byte| format!("{byte:02X}")));
        Self::new(MessageKind::Send, args)
    }

    // ======================================
    // Inbound frame parsing
    // ======================================

    /// Interpret a `frame` message as a [`CanbusFrame`].
    ///
    /// Wire form: `frame <addr> <secs>.<usecs> <byte> <byte>...`
    pub fn to_frame(&self) -> Result<CanbusFrame> {
        if self.kind() != Some(MessageKind::Frame) {
            return Err(FieldLinkError::Protocol(format!(
                "not a frame message: [{}]",
                self.verb
            )));
        }
        if self.args.len() < 2 {
            return Err(FieldLinkError::protocol("frame message missing arguments"));
        }
        let (address, extended) = parse_address(&self.args[0])?;
        let (seconds, microseconds) = parse_timestamp(&self.args[1])?;
        let data = self.args[2..]
            .iter()
            .map(|token| {
                u8::from_str_radix(token, 16).map_err(|_| {
                    FieldLinkError::Protocol(format!("invalid frame data token [{token}]"))
                })
            })
            .collect::<Result<Vec<u8>>>()?;
        CanbusFrame::new(address, extended, seconds, microseconds, data)
    }
}

/// Parse a `secs.usecs` timestamp token; the fraction is microseconds,
/// right-padded when the server sends fewer than six digits
fn parse_timestamp(token: &str) -> Result<(u64, u32)> {
    let invalid =
        || FieldLinkError::Protocol(format!("invalid frame timestamp token [{token}]"));
    let (secs, frac) = match token.split_once('.') {
        Some((secs, frac)) => (secs, frac),
        None => (token, ""),
    };
    let seconds = secs.parse::<u64>().map_err(|_| invalid())?;
    let microseconds = if frac.is_empty() {
        0
    } else {
        if frac.len() > 6 || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let padded = format!("{frac:0<6}");
        padded.parse::<u32>().map_err(|_| invalid())?
    };
    Ok((seconds, microseconds))
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "< {}", self.verb)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        write!(f, " >")
    }
}
