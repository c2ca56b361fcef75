//! Network error types

use std::net::SocketAddr;

use thiserror::Error;

/// Network layer errors
#[derive(Debug, Error)]
pub enum NetworkError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Address already in use
    #[error("Address already in use: {0}")]
    AddressInUse(SocketAddr),

    /// Bind error
    #[error("Bind error: {0}")]
    BindError(String),

    /// Address could not be parsed or resolved
    #[error("Address resolution failed: {0}")]
    ResolveFailed(String),

    /// Protocol error (malformed STUN, echo or ping datagram)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Timeout with context
    #[error("Timeout: {0}")]
    TimeoutWithMessage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Port pool has no free port left
    #[error("Port pool is exhausted")]
    PortPoolExhausted,

    /// Gateway refused or failed a port mapping
    #[error("Port mapping failed: {0}")]
    PortMappingFailed(String),

    /// Traversal strategy does not apply to this node
    #[error("Traversal strategy {0} is not available")]
    TraversalUnavailable(String),

    /// Every configured traversal strategy failed
    #[error("All traversal strategies failed, last error: {0}")]
    AllStrategiesFailed(String),

    /// Hole punching exceeded its deadline
    #[error("NAT ping timed out")]
    PingTimeout,

    /// Hole punching was stopped by the caller
    #[error("NAT pinger stopped")]
    PingStopped,

    /// Punching finished with fewer connections than requested
    #[error("Too few connections were built")]
    TooFewConnections,

    /// Local and remote port lists differ in length
    #[error("Number of local ({local}) and remote ({remote}) ports does not match")]
    PortCountMismatch { local: usize, remote: usize },

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl NetworkError {
    /// Timeouts are worth retrying, explicit stops are not
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NetworkError::PingTimeout
                | NetworkError::TooFewConnections
                | NetworkError::TimeoutWithMessage(_)
        )
    }
}

/// Result type for network operations
pub type NetworkResult<T> = Result<T, NetworkError>;
