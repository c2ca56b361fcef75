//! Channel and handshake configuration

use std::time::Duration;

use dvpn_network::TraversalMethod;
use serde::{Deserialize, Serialize};

use crate::error::{P2PError, P2PResult};

/// Channel frame encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormatKind {
    /// Header lines and a dot-terminated body
    Text,
    /// Length-prefixed envelope
    Binary,
}

/// P2P configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct P2PConfig {
    /// How long `Channel::send` waits for a reply
    pub send_timeout: Duration,

    /// Keep-alive ping interval on an open channel
    pub keepalive_interval: Duration,

    /// Close the channel when nothing authenticated arrives in this time
    pub initial_traffic_timeout: Duration,

    /// Frames buffered for sending
    pub send_queue_len: usize,

    /// How long the dialer waits for the provider's handlers ready signal
    pub handlers_ready_timeout: Duration,

    /// Preferred frame encoding
    pub wire_format: WireFormatKind,

    /// Traversal strategies, tried in order
    pub traversal: Vec<TraversalMethod>,

    /// The operator forwarded ports by hand
    pub manual_port_forwarding: bool,

    /// STUN servers used to pick advertised ports for hole punching
    pub stun_servers: Vec<String>,

    /// Echo servers verifying UPnP mappings
    pub echo_servers: Vec<String>,

    /// Attempts to reach the broker
    pub broker_connect_attempts: usize,

    /// Pause between broker connect attempts
    pub broker_connect_retry: Duration,
}

impl Default for P2PConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(2),
            initial_traffic_timeout: Duration::from_secs(30),
            send_queue_len: 100,
            handlers_ready_timeout: Duration::from_secs(5),
            wire_format: WireFormatKind::Binary,
            traversal: TraversalMethod::default_order(),
            manual_port_forwarding: false,
            stun_servers: Vec::new(),
            echo_servers: Vec::new(),
            broker_connect_attempts: 25,
            broker_connect_retry: Duration::from_secs(1),
        }
    }
}

impl P2PConfig {
    /// Node with forwarded ports: no mapping, no punching
    pub fn port_forwarded() -> Self {
        Self {
            manual_port_forwarding: true,
            traversal: vec![TraversalMethod::Manual],
            ..Default::default()
        }
    }

    /// Short timeouts for tests and local setups
    pub fn local() -> Self {
        Self {
            send_timeout: Duration::from_secs(5),
            handlers_ready_timeout: Duration::from_secs(2),
            broker_connect_attempts: 1,
            broker_connect_retry: Duration::from_millis(100),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> P2PResult<()> {
        if self.send_timeout.is_zero() {
            return Err(P2PError::Config("send timeout must be > 0".into()));
        }
        if self.keepalive_interval.is_zero() {
            return Err(P2PError::Config("keep-alive interval must be > 0".into()));
        }
        if self.send_queue_len == 0 {
            return Err(P2PError::Config("send queue length must be > 0".into()));
        }
        if self.broker_connect_attempts == 0 {
            return Err(P2PError::Config("at least one broker connect attempt is required".into()));
        }
        if self.traversal.is_empty() {
            return Err(P2PError::Config("no traversal strategy configured".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = P2PConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.send_timeout, Duration::from_secs(30));
        assert_eq!(config.send_queue_len, 100);
        assert_eq!(config.traversal, TraversalMethod::default_order());
    }

    #[test]
    fn test_presets() {
        assert!(P2PConfig::port_forwarded().validate().is_ok());
        assert!(P2PConfig::local().validate().is_ok());

        let bad = P2PConfig {
            traversal: Vec::new(),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_wire_format_serde() {
        let json = serde_json::to_string(&WireFormatKind::Text).unwrap();
        assert_eq!(json, "\"text\"");
        let parsed: WireFormatKind = serde_json::from_str("\"binary\"").unwrap();
        assert_eq!(parsed, WireFormatKind::Binary);
    }
}
