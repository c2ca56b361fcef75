//! Config exchange state and the steps shared by dialer and listener

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use dvpn_crypto::{PrivateKey, PublicKey};
use dvpn_network::NetworkError;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::channel::Channel;
use crate::config::{P2PConfig, WireFormatKind};
use crate::error::{P2PError, P2PResult};
use crate::message::COMPATIBILITY_BINARY;
use crate::session::UdpSession;

/// Handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Idle,
    KeysGenerated,
    InitSent,
    PeerConfigReceived,
    AckSent,
    HandlersReady,
    Established,
    Failed,
}

impl std::fmt::Display for ExchangeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ExchangeState::Idle => "idle",
            ExchangeState::KeysGenerated => "keys-generated",
            ExchangeState::InitSent => "init-sent",
            ExchangeState::PeerConfigReceived => "peer-config-received",
            ExchangeState::AckSent => "ack-sent",
            ExchangeState::HandlersReady => "handlers-ready",
            ExchangeState::Established => "established",
            ExchangeState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Tracks and logs one handshake's state
#[derive(Debug)]
pub(crate) struct Exchange {
    peer: String,
    state: ExchangeState,
}

impl Exchange {
    pub(crate) fn new(peer: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            state: ExchangeState::Idle,
        }
    }

    pub(crate) fn advance(&mut self, next: ExchangeState) {
        debug!("Exchange with {}: {} -> {}", self.peer, self.state, next);
        self.state = next;
    }

    pub(crate) fn state(&self) -> ExchangeState {
        self.state
    }
}

/// Address to dial: loopback when both peers share a public IP
pub fn peer_ip(own_public_ip: &str, peer_public_ip: &str) -> P2PResult<IpAddr> {
    if own_public_ip == peer_public_ip {
        return Ok(IpAddr::V4(Ipv4Addr::LOCALHOST));
    }
    peer_public_ip
        .parse()
        .map_err(|_| P2PError::Serialization(format!("invalid peer IP {:?}", peer_public_ip)))
}

/// Level advertised in `ConnectConfig::compatibility`
pub fn compatibility_level(preferred: WireFormatKind) -> u32 {
    match preferred {
        WireFormatKind::Binary => COMPATIBILITY_BINARY,
        WireFormatKind::Text => 0,
    }
}

/// Binary only if both ends asked for it. Both sides compute the same answer
/// because each advertises its own preference.
pub fn negotiate_wire_format(preferred: WireFormatKind, peer_compatibility: u32) -> WireFormatKind {
    if compatibility_level(preferred) >= COMPATIBILITY_BINARY
        && peer_compatibility >= COMPATIBILITY_BINARY
    {
        WireFormatKind::Binary
    } else {
        WireFormatKind::Text
    }
}

/// Build the channel on the first socket; the second is the service socket
pub(crate) fn open_channel(
    conns: Vec<UdpSocket>,
    private_key: &PrivateKey,
    peer_public_key: &PublicKey,
    wire: WireFormatKind,
    config: &P2PConfig,
) -> P2PResult<(Channel, Option<UdpSocket>)> {
    let mut conns = conns.into_iter();
    let conn = conns
        .next()
        .ok_or(P2PError::Network(NetworkError::TooFewConnections))?;
    let service = conns.next();

    let key = private_key.channel_key(peer_public_key)?;
    let session = UdpSession::open(conn, key)?;
    let channel = Channel::with_peer_key(Arc::new(session), wire, config, Some(*peer_public_key));
    Ok((channel, service))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_ip() {
        assert_eq!(
            peer_ip("5.6.7.8", "5.6.7.8").unwrap(),
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        );
        assert_eq!(
            peer_ip("5.6.7.8", "1.2.3.4").unwrap(),
            "1.2.3.4".parse::<IpAddr>().unwrap()
        );
        assert!(peer_ip("5.6.7.8", "not an ip").is_err());
    }

    #[test]
    fn test_negotiation_is_symmetric() {
        use WireFormatKind::*;
        for a in [Text, Binary] {
            for b in [Text, Binary] {
                let a_side = negotiate_wire_format(a, compatibility_level(b));
                let b_side = negotiate_wire_format(b, compatibility_level(a));
                assert_eq!(a_side, b_side);
            }
        }
        assert_eq!(negotiate_wire_format(Binary, 1), Binary);
        assert_eq!(negotiate_wire_format(Binary, 0), Text);
    }

    #[test]
    fn test_exchange_states() {
        let mut exchange = Exchange::new("peer");
        assert_eq!(exchange.state(), ExchangeState::Idle);
        exchange.advance(ExchangeState::KeysGenerated);
        assert_eq!(exchange.state(), ExchangeState::KeysGenerated);
        assert_eq!(ExchangeState::PeerConfigReceived.to_string(), "peer-config-received");
    }
}
