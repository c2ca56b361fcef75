//! dVPN P2P Channels
//!
//! Connects a consumer to a provider without a central relay for traffic:
//! - Signed, sealed config exchange over a message broker
//! - NAT traversal through manual forwarding, UPnP or hole punching
//! - Encrypted, multiplexed request/reply channels over UDP
//! - Text and binary wire formats, negotiated per channel

pub mod broker;
pub mod channel;
pub mod config;
pub mod dialer;
pub mod error;
pub mod exchange;
pub mod listener;
pub mod message;
pub mod session;
pub mod wireformat;

pub use broker::{
    connect_with_retry, BrokerConnection, BrokerConnector, BrokerMsg, HttpConnector,
    MemoryBroker, NatsConnector, Subscription,
};
pub use channel::{Channel, Context, Handler, HandlerError, HandlerResult, Reply};
pub use config::{P2PConfig, WireFormatKind};
pub use dialer::Dialer;
pub use error::{P2PError, P2PResult};
pub use exchange::ExchangeState;
pub use listener::{Contact, ListenHandle, Listener};
pub use message::topic;
pub use session::{Session, UdpSession};
pub use wireformat::{StatusCode, TransportMsg, WireFormat};
