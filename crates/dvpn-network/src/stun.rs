//! STUN Port Classification
//!
//! Implements enough of RFC 5389 to learn the external port a NAT assigns
//! to a local UDP port. Each local port is probed against several servers
//! from one socket; comparing the mapped ports tells how the NAT behaves:
//! - `full`: every server saw the same port, equal to the local one
//! - `semi`: every server saw the same port, but it was translated
//! - `fail`: servers saw different ports (symmetric NAT)

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, trace};

use crate::error::{NetworkError, NetworkResult};
use crate::transport::bind_udp;

/// STUN message types (RFC 5389)
const STUN_BINDING_REQUEST: u16 = 0x0001;
const STUN_BINDING_RESPONSE: u16 = 0x0101;
const STUN_BINDING_ERROR: u16 = 0x0111;

/// STUN attributes
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// STUN magic cookie (RFC 5389)
const MAGIC_COOKIE: u32 = 0x2112A442;

const HEADER_LEN: usize = 20;

/// Responses needed before a port can be classified
pub const STUN_RESPONSE_LIMIT: usize = 2;

/// How long a port probe waits for server responses
pub const STUN_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Default STUN servers
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun.l.google.com:19302",
    "stun1.l.google.com:19302",
    "stun.cloudflare.com:3478",
];

/// How a NAT maps one local port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NatSymmetry {
    /// Same external port for every destination, no translation
    Full,
    /// Same external port for every destination, translated
    Semi,
    /// Different external port per destination
    Fail,
    /// Fewer than two servers answered
    Unknown,
}

impl NatSymmetry {
    /// Classify the ports reported by each server for `local_port`
    pub fn classify(local_port: u16, mapped: &[u16]) -> Self {
        if mapped.len() < 2 {
            return NatSymmetry::Unknown;
        }
        let first = mapped[0];
        if mapped.iter().any(|&p| p != first) {
            NatSymmetry::Fail
        } else if first == local_port {
            NatSymmetry::Full
        } else {
            NatSymmetry::Semi
        }
    }
}

impl std::fmt::Display for NatSymmetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NatSymmetry::Full => "full",
            NatSymmetry::Semi => "semi",
            NatSymmetry::Fail => "fail",
            NatSymmetry::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Outcome of probing one local port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortProbe {
    pub local_port: u16,
    pub mapped_ports: Vec<u16>,
    pub symmetry: NatSymmetry,
}

impl PortProbe {
    /// Port to advertise to the peer for this local port
    pub fn advertised_port(&self) -> u16 {
        match self.symmetry {
            NatSymmetry::Full | NatSymmetry::Semi => self.mapped_ports[0],
            NatSymmetry::Unknown => self.mapped_ports.first().copied().unwrap_or(self.local_port),
            NatSymmetry::Fail => self.local_port,
        }
    }
}

/// STUN client bound to a single local socket
pub struct StunClient {
    socket: UdpSocket,
    timeout: Duration,
}

impl StunClient {
    /// Bind a client on `port` (0 for an ephemeral port)
    pub async fn bind(port: u16) -> NetworkResult<Self> {
        Ok(Self::from_socket(bind_udp(port).await?))
    }

    /// Create from existing socket
    pub fn from_socket(socket: UdpSocket) -> Self {
        Self {
            socket,
            timeout: STUN_PROBE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> NetworkResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Ask one server for our mapped address
    pub async fn mapped_address(&self, server: &str) -> NetworkResult<SocketAddr> {
        let ports = self.mapped_addresses(&[server.to_string()], 1).await?;
        ports
            .into_iter()
            .next()
            .ok_or_else(|| NetworkError::TimeoutWithMessage("STUN request timed out".into()))
    }

    /// Send a binding request to every server from this socket and collect
    /// up to `limit` mapped addresses before the deadline.
    ///
    /// Unreachable servers are skipped; fewer answers than `limit` is not an
    /// error.
    pub async fn mapped_addresses(
        &self,
        servers: &[String],
        limit: usize,
    ) -> NetworkResult<Vec<SocketAddr>> {
        let mut pending: HashMap<[u8; 12], SocketAddr> = HashMap::new();
        for server in servers {
            let server_addr = match resolve(server).await {
                Ok(addr) => addr,
                Err(e) => {
                    trace!("Skipping STUN server {}: {}", server, e);
                    continue;
                }
            };
            let mut transaction_id = [0u8; 12];
            rand::thread_rng().fill_bytes(&mut transaction_id);

            let request = build_binding_request(&transaction_id);
            if let Err(e) = self.socket.send_to(&request, server_addr).await {
                trace!("Failed to send STUN request to {}: {}", server_addr, e);
                continue;
            }
            pending.insert(transaction_id, server_addr);
        }

        let deadline = Instant::now() + self.timeout;
        let mut mapped = Vec::new();
        // STUN messages should fit in 576 bytes, allow headroom for attributes
        let mut buf = [0u8; 1024];
        while !pending.is_empty() && mapped.len() < limit {
            let (len, from) = match timeout_at(deadline, self.socket.recv_from(&mut buf)).await {
                Ok(result) => result?,
                Err(_) => break,
            };
            let Some(txn) = transaction_id_of(&buf[..len]) else {
                continue;
            };
            if pending.remove(&txn).is_none() {
                continue;
            }
            match parse_binding_response(&buf[..len], &txn) {
                Ok(addr) => {
                    debug!("STUN {} reported mapped address {}", from, addr);
                    mapped.push(addr);
                }
                Err(e) => trace!("Bad STUN response from {}: {}", from, e),
            }
        }
        Ok(mapped)
    }
}

/// Probe one local port against `servers`, stopping after `limit` answers
pub async fn multi_server_stun(
    servers: &[String],
    local_port: u16,
    limit: usize,
) -> NetworkResult<PortProbe> {
    let client = StunClient::bind(local_port).await?;
    let mapped_ports: Vec<u16> = client
        .mapped_addresses(servers, limit)
        .await?
        .into_iter()
        .map(|a| a.port())
        .collect();
    let symmetry = NatSymmetry::classify(local_port, &mapped_ports);
    Ok(PortProbe {
        local_port,
        mapped_ports,
        symmetry,
    })
}

/// External ports to advertise for `local_ports`.
///
/// Ports are probed concurrently. A port that cannot be probed or whose
/// mapping differs per server is advertised as itself. With no servers the
/// local ports are returned unchanged.
pub async fn stun_ports(servers: &[String], local_ports: &[u16]) -> Vec<u16> {
    if servers.is_empty() {
        return local_ports.to_vec();
    }

    let probes = local_ports.iter().map(|&port| {
        let servers = servers.to_vec();
        tokio::spawn(async move { multi_server_stun(&servers, port, STUN_RESPONSE_LIMIT).await })
    });

    let mut remote = Vec::with_capacity(local_ports.len());
    for (&local, probe) in local_ports.iter().zip(probes.collect::<Vec<_>>()) {
        match probe.await {
            Ok(Ok(probe)) => {
                info!("NAT type for port {}: {}", local, probe.symmetry);
                remote.push(probe.advertised_port());
            }
            Ok(Err(e)) => {
                debug!("STUN probe for port {} failed: {}", local, e);
                remote.push(local);
            }
            Err(e) => {
                debug!("STUN probe task for port {} aborted: {}", local, e);
                remote.push(local);
            }
        }
    }
    remote
}

async fn resolve(server: &str) -> NetworkResult<SocketAddr> {
    if let Ok(addr) = server.parse() {
        return Ok(addr);
    }
    tokio::net::lookup_host(server)
        .await
        .map_err(|e| NetworkError::ResolveFailed(format!("{}: {}", server, e)))?
        .find(|a| a.is_ipv4())
        .ok_or_else(|| NetworkError::ResolveFailed(format!("no IPv4 address for {}", server)))
}

/// Build STUN binding request packet
fn build_binding_request(transaction_id: &[u8; 12]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(HEADER_LEN);
    packet.extend_from_slice(&STUN_BINDING_REQUEST.to_be_bytes());
    // No attributes
    packet.extend_from_slice(&0u16.to_be_bytes());
    packet.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    packet.extend_from_slice(transaction_id);
    packet
}

fn transaction_id_of(data: &[u8]) -> Option<[u8; 12]> {
    if data.len() < HEADER_LEN {
        return None;
    }
    data[8..HEADER_LEN].try_into().ok()
}

/// Parse STUN binding response
fn parse_binding_response(data: &[u8], expected_txn_id: &[u8; 12]) -> NetworkResult<SocketAddr> {
    if data.len() < HEADER_LEN {
        return Err(NetworkError::Protocol("STUN response too short".into()));
    }

    let msg_type = u16::from_be_bytes([data[0], data[1]]);
    let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    let magic = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);

    if magic != MAGIC_COOKIE {
        return Err(NetworkError::Protocol("Invalid STUN magic cookie".into()));
    }
    if &data[8..HEADER_LEN] != expected_txn_id {
        return Err(NetworkError::Protocol("Transaction ID mismatch".into()));
    }
    match msg_type {
        STUN_BINDING_RESPONSE => {}
        STUN_BINDING_ERROR => {
            return Err(NetworkError::Protocol("STUN binding error response".into()))
        }
        other => {
            return Err(NetworkError::Protocol(format!(
                "Unexpected STUN message type: 0x{:04x}",
                other
            )))
        }
    }
    if data.len() < HEADER_LEN + msg_len {
        return Err(NetworkError::Protocol("STUN message truncated".into()));
    }

    let mut mapped = None;
    let mut xor_mapped = None;
    let mut pos = HEADER_LEN;
    while pos + 4 <= HEADER_LEN + msg_len {
        let attr_type = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let attr_len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        pos += 4;
        if pos + attr_len > data.len() {
            break;
        }
        let attr = &data[pos..pos + attr_len];
        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => xor_mapped = parse_mapped_address(attr, Some(&data[4..HEADER_LEN])),
            ATTR_MAPPED_ADDRESS => mapped = parse_mapped_address(attr, None),
            _ => {}
        }
        // Attributes are padded to 4 bytes
        pos += (attr_len + 3) & !3;
    }

    xor_mapped
        .or(mapped)
        .ok_or_else(|| NetworkError::Protocol("No mapped address in STUN response".into()))
}

/// Parse MAPPED-ADDRESS, or XOR-MAPPED-ADDRESS when `xor_key` (cookie and
/// transaction id) is given
fn parse_mapped_address(data: &[u8], xor_key: Option<&[u8]>) -> Option<SocketAddr> {
    if data.len() < 8 {
        return None;
    }
    let family = data[1];
    let mut port = u16::from_be_bytes([data[2], data[3]]);
    if let Some(key) = xor_key {
        port ^= u16::from_be_bytes([key[0], key[1]]);
    }

    match family {
        0x01 => {
            let mut ip = [data[4], data[5], data[6], data[7]];
            if let Some(key) = xor_key {
                ip.iter_mut().zip(key).for_each(|(b, k)| *b ^= k);
            }
            Some(SocketAddr::from((ip, port)))
        }
        0x02 => {
            if data.len() < 20 {
                return None;
            }
            let mut ip = [0u8; 16];
            ip.copy_from_slice(&data[4..20]);
            if let Some(key) = xor_key {
                ip.iter_mut().zip(key).for_each(|(b, k)| *b ^= k);
            }
            Some(SocketAddr::from((ip, port)))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xor_response(txn: &[u8; 12], addr: SocketAddr) -> Vec<u8> {
        let SocketAddr::V4(v4) = addr else {
            panic!("ipv4 only");
        };
        let cookie = MAGIC_COOKIE.to_be_bytes();
        let port = v4.port() ^ u16::from_be_bytes([cookie[0], cookie[1]]);
        let mut ip = v4.ip().octets();
        ip.iter_mut().zip(cookie).for_each(|(b, k)| *b ^= k);

        let mut packet = Vec::new();
        packet.extend_from_slice(&STUN_BINDING_RESPONSE.to_be_bytes());
        packet.extend_from_slice(&12u16.to_be_bytes());
        packet.extend_from_slice(&cookie);
        packet.extend_from_slice(txn);
        packet.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
        packet.extend_from_slice(&8u16.to_be_bytes());
        packet.extend_from_slice(&[0, 0x01]);
        packet.extend_from_slice(&port.to_be_bytes());
        packet.extend_from_slice(&ip);
        packet
    }

    /// Minimal STUN server answering with a fixed mapped port
    async fn fake_server(mapped_port: u16) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            while let Ok((n, from)) = socket.recv_from(&mut buf).await {
                let txn = transaction_id_of(&buf[..n]).unwrap();
                let mapped = SocketAddr::new(from.ip(), mapped_port);
                let _ = socket.send_to(&xor_response(&txn, mapped), from).await;
            }
        });
        addr
    }

    #[test]
    fn test_stun_request_building() {
        let txn_id = [1u8; 12];
        let request = build_binding_request(&txn_id);

        assert_eq!(request.len(), HEADER_LEN);
        assert_eq!(request[0..2], [0x00, 0x01]);
        assert_eq!(request[4..8], MAGIC_COOKIE.to_be_bytes());
        assert_eq!(&request[8..20], &txn_id);
    }

    #[test]
    fn test_parse_xor_mapped_address() {
        let txn = [9u8; 12];
        let addr: SocketAddr = "203.0.113.7:40123".parse().unwrap();
        let parsed = parse_binding_response(&xor_response(&txn, addr), &txn).unwrap();
        assert_eq!(parsed, addr);

        assert!(parse_binding_response(&xor_response(&txn, addr), &[0u8; 12]).is_err());
        assert!(parse_binding_response(&[0u8; 8], &txn).is_err());
    }

    #[test]
    fn test_classify() {
        assert_eq!(NatSymmetry::classify(4000, &[4000, 4000]), NatSymmetry::Full);
        assert_eq!(NatSymmetry::classify(4000, &[5000, 5000]), NatSymmetry::Semi);
        assert_eq!(NatSymmetry::classify(4000, &[5000, 5001]), NatSymmetry::Fail);
        assert_eq!(NatSymmetry::classify(4000, &[5000]), NatSymmetry::Unknown);
        assert_eq!(NatSymmetry::classify(4000, &[]), NatSymmetry::Unknown);
    }

    #[tokio::test]
    async fn test_stun_ports_against_local_servers() {
        let servers = vec![
            fake_server(50123).await.to_string(),
            fake_server(50123).await.to_string(),
        ];
        let local = bind_udp(0).await.unwrap();
        let port = local.local_addr().unwrap().port();
        drop(local);

        let remote = stun_ports(&servers, &[port]).await;
        assert_eq!(remote, vec![50123]);
    }

    #[tokio::test]
    async fn test_stun_ports_symmetric_keeps_local() {
        let servers = vec![
            fake_server(50001).await.to_string(),
            fake_server(50002).await.to_string(),
        ];
        let local = bind_udp(0).await.unwrap();
        let port = local.local_addr().unwrap().port();
        drop(local);

        let remote = stun_ports(&servers, &[port]).await;
        assert_eq!(remote, vec![port]);
    }

    #[tokio::test]
    async fn test_stun_ports_without_servers() {
        assert_eq!(stun_ports(&[], &[1, 2, 3]).await, vec![1, 2, 3]);
    }

    #[tokio::test]
    #[ignore] // Requires network
    async fn test_real_stun_request() {
        let client = StunClient::bind(0).await.unwrap();
        let mapped = client.mapped_address(DEFAULT_STUN_SERVERS[0]).await.unwrap();
        assert!(mapped.port() > 0);
    }
}
