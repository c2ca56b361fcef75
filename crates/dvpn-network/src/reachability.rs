//! Global Reachability Probe
//!
//! Checks whether a UDP port is reachable from the internet by asking
//! asymmetric echo servers to send a probe back to it. The probe is the
//! port (2 bytes, big endian) followed by a random 16-byte probe id; a
//! server answers from a different address with the probe id alone.

use std::time::Duration;

use rand::RngCore;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::error::{NetworkError, NetworkResult};
use crate::transport::bind_udp;

const PORT_FIELD_SIZE: usize = 2;

/// Size of the random probe id
pub const PROBE_ID_SIZE: usize = 16;

const PROBE_PACKET_SIZE: usize = PORT_FIELD_SIZE + PROBE_ID_SIZE;

/// Each server gets a few copies in case some are lost
const SEND_PACKETS: usize = 3;

/// Probe `port` through `echo_servers`.
///
/// Returns `Ok(false)` when no echo arrives within `wait`; that is a valid
/// answer, not an error. Errors only when no server list is given or no
/// probe could be sent at all.
pub async fn globally_reachable(
    port: u16,
    echo_servers: &[String],
    wait: Duration,
) -> NetworkResult<bool> {
    if echo_servers.is_empty() {
        return Err(NetworkError::ConfigError("empty echo server list".into()));
    }
    debug!("Checking if port {} is globally reachable via {:?}", port, echo_servers);

    let rx = bind_udp(port).await?;

    let mut probe_id = [0u8; PROBE_ID_SIZE];
    rand::thread_rng().fill_bytes(&mut probe_id);
    let mut packet = [0u8; PROBE_PACKET_SIZE];
    packet[..PORT_FIELD_SIZE].copy_from_slice(&port.to_be_bytes());
    packet[PORT_FIELD_SIZE..].copy_from_slice(&probe_id);

    let mut sent = false;
    let mut last_err = None;
    for server in echo_servers {
        match send_probe(server, &packet).await {
            Ok(()) => sent = true,
            Err(e) => {
                trace!("Probe to {} failed: {}", server, e);
                last_err = Some(e);
            }
        }
    }
    if !sent {
        let e = last_err.map(|e| e.to_string()).unwrap_or_default();
        return Err(NetworkError::Protocol(format!(
            "every port probe send failed, last error: {}",
            e
        )));
    }

    match timeout(wait, await_echo(&rx, &probe_id)).await {
        Ok(reachable) => Ok(reachable),
        Err(_) => {
            debug!("No echo for port {} within {:?}", port, wait);
            Ok(false)
        }
    }
}

async fn send_probe(server: &str, packet: &[u8]) -> NetworkResult<()> {
    let tx = UdpSocket::bind("0.0.0.0:0").await?;
    tx.connect(server)
        .await
        .map_err(|e| NetworkError::ResolveFailed(format!("{}: {}", server, e)))?;
    for i in 0..SEND_PACKETS {
        if let Err(e) = tx.send(packet).await {
            if i == 0 {
                return Err(e.into());
            }
        }
    }
    Ok(())
}

/// Read until a datagram carrying `probe_id` arrives
async fn await_echo(rx: &UdpSocket, probe_id: &[u8; PROBE_ID_SIZE]) -> bool {
    let mut buf = [0u8; 64];
    loop {
        match rx.recv_from(&mut buf).await {
            Ok((n, from)) => {
                if n >= PROBE_ID_SIZE && &buf[..PROBE_ID_SIZE] == probe_id {
                    debug!("Received echo from {}", from);
                    return true;
                }
            }
            Err(e) => trace!("Echo receive error: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Echo server answering from a second socket, like the real ones do
    async fn echo_server(reply: bool) -> String {
        let rx = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = rx.local_addr().unwrap();
        tokio::spawn(async move {
            let tx = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let mut buf = [0u8; 64];
            while let Ok((n, from)) = rx.recv_from(&mut buf).await {
                if n != PROBE_PACKET_SIZE || !reply {
                    continue;
                }
                let port = u16::from_be_bytes([buf[0], buf[1]]);
                let target = std::net::SocketAddr::new(from.ip(), port);
                let _ = tx.send_to(&buf[PORT_FIELD_SIZE..n], target).await;
            }
        });
        addr.to_string()
    }

    async fn free_port() -> u16 {
        let s = bind_udp(0).await.unwrap();
        s.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_reachable_port() {
        let servers = vec![echo_server(true).await];
        let port = free_port().await;
        let reachable = globally_reachable(port, &servers, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(reachable);
    }

    #[tokio::test]
    async fn test_unreachable_is_not_an_error() {
        let servers = vec![echo_server(false).await];
        let port = free_port().await;
        let reachable = globally_reachable(port, &servers, Duration::from_millis(200))
            .await
            .unwrap();
        assert!(!reachable);
    }

    #[tokio::test]
    async fn test_empty_server_list() {
        assert!(globally_reachable(0, &[], Duration::from_millis(10)).await.is_err());
    }
}
