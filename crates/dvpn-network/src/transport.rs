//! UDP Socket Helpers
//!
//! Binding and dialing for the sockets the channel and the pinger own.
//! Punched sockets are bound with address reuse so a pinger socket can be
//! closed and immediately re-opened as a connected socket on the same port.

use std::net::{Ipv4Addr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, trace};

use crate::error::{NetworkError, NetworkResult};

/// Bind a UDP socket on all interfaces at `port` (0 for an ephemeral port)
pub async fn bind_udp(port: u16) -> NetworkResult<UdpSocket> {
    bind_udp_addr(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))).await
}

/// Bind a UDP socket at `addr`
pub async fn bind_udp_addr(addr: SocketAddr) -> NetworkResult<UdpSocket> {
    let socket = UdpSocket::bind(addr).await.map_err(|e| map_bind_error(e, addr))?;
    trace!("UDP socket bound to {}", socket.local_addr()?);
    Ok(socket)
}

/// Bind `local_port` and connect it to `remote`
pub async fn dial_udp(local_port: u16, remote: SocketAddr) -> NetworkResult<UdpSocket> {
    let socket = UdpSocketBuilder::new(SocketAddr::from((Ipv4Addr::UNSPECIFIED, local_port)))
        .reuse_address(true)
        .build()?;
    socket.connect(remote).await?;
    debug!("UDP socket {} connected to {}", socket.local_addr()?, remote);
    Ok(socket)
}

/// Dial every `(local, remote)` port pair towards `peer_ip`.
///
/// On any failure the sockets opened so far are dropped.
pub async fn dial_pairs(
    peer_ip: std::net::IpAddr,
    local_ports: &[u16],
    remote_ports: &[u16],
) -> NetworkResult<Vec<UdpSocket>> {
    if local_ports.len() != remote_ports.len() {
        return Err(NetworkError::PortCountMismatch {
            local: local_ports.len(),
            remote: remote_ports.len(),
        });
    }
    let mut sockets = Vec::with_capacity(local_ports.len());
    for (&local, &remote) in local_ports.iter().zip(remote_ports) {
        sockets.push(dial_udp(local, SocketAddr::new(peer_ip, remote)).await?);
    }
    Ok(sockets)
}

fn map_bind_error(e: std::io::Error, addr: SocketAddr) -> NetworkError {
    if e.kind() == std::io::ErrorKind::AddrInUse {
        NetworkError::AddressInUse(addr)
    } else {
        NetworkError::BindError(format!("{}: {}", addr, e))
    }
}

/// Builder for UDP sockets with custom options
pub struct UdpSocketBuilder {
    bind_addr: SocketAddr,
    reuse_address: bool,
    recv_buffer_size: Option<usize>,
    send_buffer_size: Option<usize>,
    ttl: Option<u32>,
}

impl UdpSocketBuilder {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            reuse_address: false,
            recv_buffer_size: None,
            send_buffer_size: None,
            ttl: None,
        }
    }

    pub fn reuse_address(mut self, reuse: bool) -> Self {
        self.reuse_address = reuse;
        self
    }

    pub fn recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = Some(size);
        self
    }

    pub fn send_buffer_size(mut self, size: usize) -> Self {
        self.send_buffer_size = Some(size);
        self
    }

    /// Initial IP TTL for outgoing datagrams
    pub fn ttl(mut self, ttl: u32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Build the socket. Must be called inside a tokio runtime.
    pub fn build(self) -> NetworkResult<UdpSocket> {
        let domain = if self.bind_addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

        if let Some(size) = self.recv_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        if let Some(size) = self.send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }
        if let Some(ttl) = self.ttl {
            socket.set_ttl(ttl)?;
        }
        if self.reuse_address {
            socket.set_reuse_address(true)?;
        }

        socket.set_nonblocking(true)?;
        socket
            .bind(&self.bind_addr.into())
            .map_err(|e| map_bind_error(e, self.bind_addr))?;

        let std_socket: std::net::UdpSocket = socket.into();
        Ok(UdpSocket::from_std(std_socket)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_ephemeral() {
        let socket = bind_udp(0).await.unwrap();
        assert!(socket.local_addr().unwrap().port() > 0);
    }

    #[tokio::test]
    async fn test_bind_in_use() {
        let held = bind_udp_addr("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = held.local_addr().unwrap();
        let again = bind_udp_addr(addr).await;
        assert!(matches!(again, Err(NetworkError::AddressInUse(a)) if a == addr));
    }

    #[tokio::test]
    async fn test_dial_pairs() {
        let a = bind_udp_addr("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b = bind_udp_addr("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let remote = [a.local_addr().unwrap().port(), b.local_addr().unwrap().port()];
        let local = [0u16, 0u16];

        let sockets = dial_pairs("127.0.0.1".parse().unwrap(), &local, &remote)
            .await
            .unwrap();
        sockets[0].send(b"hello").await.unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = a.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from.port(), sockets[0].local_addr().unwrap().port());
    }

    #[tokio::test]
    async fn test_dial_pairs_mismatch() {
        let result = dial_pairs("127.0.0.1".parse().unwrap(), &[1, 2], &[3]).await;
        assert!(matches!(
            result,
            Err(NetworkError::PortCountMismatch { local: 2, remote: 1 })
        ));
    }
}
