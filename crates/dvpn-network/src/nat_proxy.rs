//! NAT Proxy
//!
//! Pipes datagrams between a punched socket and the local port a VPN
//! service listens on, so the service never has to own the socket that
//! survived hole punching.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

use crate::error::{NetworkError, NetworkResult};

/// Datagram buffer size; large enough for any VPN packet
const BUFFER_LEN: usize = 30000;

/// Forwards traffic between punched sockets and registered local services
pub struct NatProxy {
    service_ports: RwLock<HashMap<String, u16>>,
    closed: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

impl NatProxy {
    pub fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            service_ports: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            stop_tx,
        }
    }

    /// Route traffic for `service_type` to `127.0.0.1:port`
    pub async fn register_service_port(&self, service_type: &str, port: u16) {
        info!("Registering service {} for port {} to NAT proxy", service_type, port);
        self.service_ports
            .write()
            .await
            .insert(service_type.to_string(), port);
    }

    pub async fn is_available(&self, service_type: &str) -> bool {
        self.service_ports
            .read()
            .await
            .get(service_type)
            .is_some_and(|&port| port > 0)
    }

    /// Provider side: connect `incoming` to the service's local port and
    /// copy datagrams both ways until either side fails or the proxy closes.
    pub async fn hand_off(
        &self,
        service_type: &str,
        incoming: UdpSocket,
    ) -> NetworkResult<JoinHandle<()>> {
        let port = self
            .service_ports
            .read()
            .await
            .get(service_type)
            .copied()
            .filter(|&p| p > 0)
            .ok_or_else(|| {
                NetworkError::ConfigError(format!("no service port registered for {}", service_type))
            })?;

        let service = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        service.connect((Ipv4Addr::LOCALHOST, port)).await?;
        info!("Handing off a connection to a service on 127.0.0.1:{}", port);

        let incoming = Arc::new(incoming);
        let service = Arc::new(service);
        let mut stop_rx = self.stop_tx.subscribe();
        Ok(tokio::spawn(async move {
            tokio::select! {
                _ = copy_datagrams(incoming.clone(), service.clone()) => {}
                _ = copy_datagrams(service, incoming) => {}
                _ = stop_rx.wait_for(|stopped| *stopped) => debug!("NAT proxy hand-off stopped"),
            }
        }))
    }

    /// Consumer side: listen on `127.0.0.1:consumer_port + 1` for the local
    /// VPN client and relay its traffic through `remote`. Replies go to
    /// whichever local address spoke last.
    pub async fn consumer_hand_off(
        &self,
        consumer_port: u16,
        remote: UdpSocket,
    ) -> NetworkResult<JoinHandle<()>> {
        let listen_port = consumer_port.checked_add(1).ok_or_else(|| {
            NetworkError::ConfigError(format!("no proxy port above {}", consumer_port))
        })?;
        let local = UdpSocket::bind((Ipv4Addr::LOCALHOST, listen_port)).await?;
        info!("Consumer NAT proxy waiting for the VPN client on {}", local.local_addr()?);

        let local = Arc::new(local);
        let remote = Arc::new(remote);
        let (last_tx, last_rx) = watch::channel::<Option<SocketAddr>>(None);
        let mut stop_rx = self.stop_tx.subscribe();

        Ok(tokio::spawn(async move {
            tokio::select! {
                _ = local_to_remote(local.clone(), remote.clone(), last_tx) => {}
                _ = remote_to_local(remote, local, last_rx) => {}
                _ = stop_rx.wait_for(|stopped| *stopped) => debug!("Consumer NAT proxy stopped"),
            }
        }))
    }

    /// Stop every running hand-off. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.stop_tx.send_replace(true);
            debug!("NAT proxy closed");
        }
    }
}

impl Default for NatProxy {
    fn default() -> Self {
        Self::new()
    }
}

/// ICMP port unreachable surfacing on a connected socket, e.g. a service
/// that is not bound yet
fn is_refused(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::ConnectionRefused
}

/// Copy datagrams between two connected sockets
async fn copy_datagrams(src: Arc<UdpSocket>, dst: Arc<UdpSocket>) {
    let mut buf = vec![0u8; BUFFER_LEN];
    let mut total: u64 = 0;
    loop {
        let n = match src.recv(&mut buf).await {
            Ok(n) => n,
            Err(e) if is_refused(&e) => {
                debug!("Peer {:?} refused a datagram, continuing", src.peer_addr().ok());
                continue;
            }
            Err(e) => {
                error!("Failed to read from {:?}: {}", src.peer_addr().ok(), e);
                break;
            }
        };
        match dst.send(&buf[..n]).await {
            Ok(_) => total += n as u64,
            Err(e) if is_refused(&e) => {
                debug!("Dropping {} bytes refused by {:?}", n, dst.peer_addr().ok());
            }
            Err(e) => {
                error!("Failed to write to {:?}: {}", dst.peer_addr().ok(), e);
                break;
            }
        }
    }
    trace!("NAT proxy copied {} bytes", total);
}

async fn local_to_remote(
    local: Arc<UdpSocket>,
    remote: Arc<UdpSocket>,
    last_tx: watch::Sender<Option<SocketAddr>>,
) {
    let mut buf = vec![0u8; BUFFER_LEN];
    loop {
        let (n, from) = match local.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                error!("Failed to read local process: {}", e);
                return;
            }
        };
        if let Err(e) = remote.send(&buf[..n]).await {
            error!("Failed to write remote peer: {}", e);
            return;
        }
        last_tx.send_if_modified(|last| {
            if *last == Some(from) {
                false
            } else {
                *last = Some(from);
                true
            }
        });
    }
}

async fn remote_to_local(
    remote: Arc<UdpSocket>,
    local: Arc<UdpSocket>,
    last_rx: watch::Receiver<Option<SocketAddr>>,
) {
    let mut buf = vec![0u8; BUFFER_LEN];
    loop {
        let n = match remote.recv(&mut buf).await {
            Ok(n) => n,
            Err(e) if is_refused(&e) => continue,
            Err(e) => {
                error!("Failed to read remote peer: {}", e);
                return;
            }
        };
        let target = *last_rx.borrow();
        match target {
            Some(addr) => {
                if let Err(e) = local.send_to(&buf[..n], addr).await {
                    error!("Failed to write to local process: {}", e);
                    return;
                }
            }
            None => trace!("Dropping {} bytes, no local client yet", n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn connected_pair() -> (UdpSocket, UdpSocket) {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        a.connect(b.local_addr().unwrap()).await.unwrap();
        b.connect(a.local_addr().unwrap()).await.unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn test_register_service_port() {
        let proxy = NatProxy::new();
        assert!(!proxy.is_available("wireguard").await);
        proxy.register_service_port("wireguard", 51820).await;
        assert!(proxy.is_available("wireguard").await);
        assert!(!proxy.is_available("openvpn").await);
    }

    #[tokio::test]
    async fn test_hand_off_unregistered() {
        let proxy = NatProxy::new();
        let (incoming, _peer) = connected_pair().await;
        assert!(proxy.hand_off("wireguard", incoming).await.is_err());
    }

    #[tokio::test]
    async fn test_hand_off_pipes_both_ways() {
        let service = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let proxy = NatProxy::new();
        proxy
            .register_service_port("wireguard", service.local_addr().unwrap().port())
            .await;

        let (incoming, peer) = connected_pair().await;
        let task = proxy.hand_off("wireguard", incoming).await.unwrap();

        peer.send(b"handshake").await.unwrap();
        let mut buf = [0u8; 64];
        let (n, from) = timeout(Duration::from_secs(2), service.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"handshake");

        service.send_to(b"response", from).await.unwrap();
        let n = timeout(Duration::from_secs(2), peer.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"response");

        proxy.close();
        proxy.close();
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_hand_off_survives_service_starting_late() {
        let placeholder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let service_port = placeholder.local_addr().unwrap().port();
        drop(placeholder);

        let proxy = NatProxy::new();
        proxy.register_service_port("wireguard", service_port).await;
        let (incoming, peer) = connected_pair().await;
        let task = proxy.hand_off("wireguard", incoming).await.unwrap();

        // Nothing listens yet, the proxy socket gets port unreachable back
        peer.send(b"early").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!task.is_finished());

        let service = UdpSocket::bind(("127.0.0.1", service_port)).await.unwrap();
        let mut buf = [0u8; 64];
        let received = timeout(Duration::from_secs(2), async {
            loop {
                peer.send(b"late").await.unwrap();
                if let Ok(Ok((n, _))) =
                    timeout(Duration::from_millis(100), service.recv_from(&mut buf)).await
                {
                    return buf[..n].to_vec();
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(received, b"late");

        proxy.close();
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_consumer_hand_off() {
        let placeholder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let consumer_port = placeholder.local_addr().unwrap().port() - 1;
        drop(placeholder);

        let proxy = NatProxy::new();
        let (remote, peer) = connected_pair().await;
        let _task = proxy.consumer_hand_off(consumer_port, remote).await.unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .connect((Ipv4Addr::LOCALHOST, consumer_port + 1))
            .await
            .unwrap();
        client.send(b"from client").await.unwrap();

        let mut buf = [0u8; 64];
        let n = timeout(Duration::from_secs(2), peer.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"from client");

        peer.send(b"from provider").await.unwrap();
        let n = timeout(Duration::from_secs(2), client.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"from provider");
        proxy.close();
    }
}
