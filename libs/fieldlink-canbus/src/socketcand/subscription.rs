//! Per-address subscriptions

use super::message::Message;
use crate::frame::{FrameListener, MAX_EXTENDED_ADDRESS};
use errors::{FieldLinkError, Result};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Multiplex narrowing: an identifier mask plus the multiplex values to pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxFilter {
    pub identifier_mask: u64,
    pub filters: Vec<u64>,
}

/// One subscription: a bus address mapped to exactly one listener, optionally
/// narrowed by a data filter or multiplex filter and bounded by a duration.
#[derive(Clone)]
pub struct Subscription {
    address: u32,
    extended: bool,
    limit: Option<Duration>,
    data_filter: Option<u64>,
    mux_filter: Option<MuxFilter>,
    listener: Arc<dyn FrameListener>,
}

impl Subscription {
    pub fn new(
        address: u32,
        extended: bool,
        limit: Option<Duration>,
        listener: Arc<dyn FrameListener>,
    ) -> Result<Self> {
        if address > MAX_EXTENDED_ADDRESS {
            return Err(FieldLinkError::InvalidParameter(format!(
                "address 0x{address:X} exceeds 29-bit range"
            )));
        }
        Ok(Self {
            address,
            extended,
            limit,
            data_filter: None,
            mux_filter: None,
            listener,
        })
    }

    /// Narrow to frames matching a data-filter bitmask
    pub fn with_data_filter(mut self, mask: u64) -> Self {
        self.data_filter = Some(mask);
        self
    }

    /// Narrow to multiplexed frames matching any of `filters` under
    /// `identifier_mask`. Takes precedence over a plain data filter.
    pub fn with_mux_filter(mut self, identifier_mask: u64, filters: Vec<u64>) -> Result<Self> {
        if filters.is_empty() {
            return Err(FieldLinkError::InvalidParameter(
                "multiplex filter values must not be empty".to_string(),
            ));
        }
        self.mux_filter = Some(MuxFilter {
            identifier_mask,
            filters,
        });
        Ok(self)
    }

    pub fn address(&self) -> u32 {
        self.address
    }

    pub fn is_extended(&self) -> bool {
        self.extended
    }

    pub fn limit(&self) -> Option<Duration> {
        self.limit
    }

    pub fn has_filter(&self) -> bool {
        self.data_filter.is_some() || self.mux_filter.is_some()
    }

    pub(crate) fn listener(&self) -> Arc<dyn FrameListener> {
        Arc::clone(&self.listener)
    }

    /// The outbound command this subscription registers with: `muxfilter`
    /// when multiplex-narrowed, `filter` when data-filtered, plain
    /// `subscribe` otherwise.
    pub(crate) fn to_message(&self) -> Message {
        if let Some(mux) = &self.mux_filter {
            Message::muxfilter(
                self.address,
                self.extended,
                self.limit,
                mux.identifier_mask,
                &mux.filters,
            )
        } else if let Some(mask) = self.data_filter {
            Message::filter(self.address, self.extended, self.limit, mask)
        } else {
            Message::subscribe(self.address, self.extended, self.limit)
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("address", &format_args!("0x{:X}", self.address))
            .field("extended", &self.extended)
            .field("limit", &self.limit)
            .field("data_filter", &self.data_filter)
            .field("mux_filter", &self.mux_filter)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X}", self.address)?;
        if let Some(mux) = &self.mux_filter {
            write!(f, " muxfilter 0x{:X}", mux.identifier_mask)?;
        } else if let Some(mask) = self.data_filter {
            write!(f, " filter 0x{mask:X}")?;
        }
        if let Some(limit) = self.limit {
            write!(f, " limit {limit:?}")?;
        }
        Ok(())
    }
}
