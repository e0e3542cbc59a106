//! Socketcand protocol support
//!
//! Wire model, codec, subscriptions, and the protocol connection for
//! socketcand CAN bus gateways.
//! See <https://github.com/linux-can/socketcand>.

pub mod codec;
pub mod connection;
pub mod message;
pub mod subscription;

pub use codec::SocketcandCodec;
pub use connection::{
    ConnectivityCheck, SocketcandConnection, DEFAULT_READ_TIMEOUT, DEFAULT_VERIFY_TIMEOUT,
};
pub use message::{Message, MessageKind};
pub use subscription::{MuxFilter, Subscription};
