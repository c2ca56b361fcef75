//! P2P error types

use thiserror::Error;

/// Errors of the config exchange and the channel
#[derive(Debug, Error)]
pub enum P2PError {
    /// Crypto error (from dvpn-crypto)
    #[error("Crypto error: {0}")]
    Crypto(#[from] dvpn_crypto::CryptoError),

    /// Network error (from dvpn-network)
    #[error("Network error: {0}")]
    Network(#[from] dvpn_network::NetworkError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Broker connection or delivery failed
    #[error("Broker error: {0}")]
    Broker(String),

    /// Broker request got no reply in time
    #[error("Broker request to {0} timed out")]
    BrokerTimeout(String),

    /// Provider never answered the config exchange
    #[error("Timeout while performing configuration exchange")]
    HandshakeTimeout,

    /// Broker message signature did not verify
    #[error("Invalid message signature")]
    InvalidSignature,

    /// Ack arrived without a matching init
    #[error("Pending config not found for key {0}")]
    PendingConfigNotFound(String),

    /// Payload could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Malformed channel frame
    #[error("Wire format error: {0}")]
    Wire(String),

    /// Channel frame above the codec limit
    #[error("Message too long: {len} bytes, max {max}")]
    MessageTooLong { len: usize, max: usize },

    /// No reply arrived within the send timeout
    #[error("Timeout waiting for reply to {0:?}")]
    SendTimeout(String),

    /// Peer has no handler for the topic
    #[error("Handler {0:?} not found")]
    HandlerNotFound(String),

    /// Peer rejected the request with a displayable message
    #[error("Public peer error: {0}")]
    PeerPublic(String),

    /// Peer failed the request internally
    #[error("Peer error: {0}")]
    PeerInternal(String),

    /// Channel was closed
    #[error("Channel is closed")]
    ChannelClosed,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<bincode::Error> for P2PError {
    fn from(e: bincode::Error) -> Self {
        P2PError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for P2PError {
    fn from(e: serde_json::Error) -> Self {
        P2PError::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for P2PError {
    fn from(e: reqwest::Error) -> Self {
        P2PError::Broker(e.to_string())
    }
}

impl P2PError {
    /// True when the peer answered, as opposed to a local or transport failure
    pub fn is_peer_error(&self) -> bool {
        matches!(
            self,
            P2PError::HandlerNotFound(_) | P2PError::PeerPublic(_) | P2PError::PeerInternal(_)
        )
    }
}

/// Result type for p2p operations
pub type P2PResult<T> = Result<T, P2PError>;
