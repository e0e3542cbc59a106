//! Socketcand CAN bus protocol connection
//!
//! A [`SocketcandConnection`] owns a dedicated reader task over a persistent
//! socket to a CAN bus gateway, routing unsolicited frames to address-keyed
//! subscriptions (or one monitor listener in promiscuous mode) while
//! correlating solicited command/response pairs for the control operations.

pub mod frame;
pub mod network;
pub mod socketcand;

pub use frame::{
    CanbusFrame, FrameListener, MAX_DATA_LENGTH, MAX_EXTENDED_ADDRESS, MAX_STANDARD_ADDRESS,
};
pub use network::{CanbusNetwork, CanbusNetworkConfig};
pub use socketcand::{ConnectivityCheck, SocketcandConnection, Subscription};
