//! Encrypted Datagram Sessions
//!
//! A [`Session`] moves opaque frames between the two channel ends. The
//! reliable transport underneath is pluggable; [`UdpSession`] is the plain
//! one: each frame is one datagram sealed with the channel key, nothing is
//! retransmitted.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use dvpn_crypto::{open, seal, SymmetricKey};
use dvpn_network::UdpSocketBuilder;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, trace};

use crate::error::{P2PError, P2PResult};

/// Largest UDP payload over IPv4
pub const MAX_DATAGRAM_LEN: usize = 65507;

/// Frame transport between two channel ends
#[async_trait]
pub trait Session: Send + Sync {
    /// Send one frame
    async fn send(&self, frame: &[u8]) -> P2PResult<()>;

    /// Receive the next authenticated frame
    async fn recv(&self) -> P2PResult<Vec<u8>>;

    fn local_addr(&self) -> P2PResult<SocketAddr>;

    /// Where frames are currently sent
    fn peer_addr(&self) -> SocketAddr;

    /// Release the transport. Pending and later `send`/`recv` calls fail
    /// with `ChannelClosed`. Idempotent.
    fn close(&self);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sealed datagrams over one UDP socket.
///
/// The session follows the peer when authenticated frames start arriving
/// from a new source address.
pub struct UdpSession {
    socket: Mutex<Option<Arc<UdpSocket>>>,
    key: SymmetricKey,
    peer: Mutex<SocketAddr>,
    closed_tx: watch::Sender<bool>,
}

impl UdpSession {
    /// Take over a connected socket.
    ///
    /// The socket is reopened unconnected on the same local port so frames
    /// from a roaming peer are still received.
    pub fn open(conn: UdpSocket, key: SymmetricKey) -> P2PResult<Self> {
        let local = conn.local_addr()?;
        let peer = conn.peer_addr()?;
        drop(conn);

        let socket = UdpSocketBuilder::new(local).reuse_address(true).build()?;
        debug!("Session on {} opened towards {}", local, peer);
        Ok(Self::new(socket, peer, key))
    }

    /// Session on an already bound, unconnected socket
    pub fn new(socket: UdpSocket, peer: SocketAddr, key: SymmetricKey) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            socket: Mutex::new(Some(Arc::new(socket))),
            key,
            peer: Mutex::new(peer),
            closed_tx,
        }
    }

    fn socket(&self) -> P2PResult<Arc<UdpSocket>> {
        lock(&self.socket).clone().ok_or(P2PError::ChannelClosed)
    }

    fn set_peer(&self, addr: SocketAddr) {
        let mut peer = lock(&self.peer);
        if *peer != addr {
            info!("Peer address changed from {} to {}", *peer, addr);
            *peer = addr;
        }
    }
}

#[async_trait]
impl Session for UdpSession {
    async fn send(&self, frame: &[u8]) -> P2PResult<()> {
        let sealed = seal(&self.key, frame)?;
        if sealed.len() > MAX_DATAGRAM_LEN {
            return Err(P2PError::MessageTooLong {
                len: sealed.len(),
                max: MAX_DATAGRAM_LEN,
            });
        }
        let peer = self.peer_addr();
        self.socket()?.send_to(&sealed, peer).await?;
        trace!("Sent {} byte frame to {}", frame.len(), peer);
        Ok(())
    }

    async fn recv(&self) -> P2PResult<Vec<u8>> {
        let socket = self.socket()?;
        let mut closed_rx = self.closed_tx.subscribe();
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        loop {
            let (n, from) = tokio::select! {
                received = socket.recv_from(&mut buf) => received?,
                _ = async { let _ = closed_rx.wait_for(|closed| *closed).await; } => {
                    return Err(P2PError::ChannelClosed)
                }
            };
            match open(&self.key, &buf[..n]) {
                Ok(frame) => {
                    self.set_peer(from);
                    return Ok(frame);
                }
                // Stray pings and forged datagrams
                Err(e) => trace!("Dropping {} bytes from {}: {}", n, from, e),
            }
        }
    }

    fn local_addr(&self) -> P2PResult<SocketAddr> {
        Ok(self.socket()?.local_addr()?)
    }

    fn peer_addr(&self) -> SocketAddr {
        *lock(&self.peer)
    }

    fn close(&self) {
        if lock(&self.socket).take().is_some() {
            self.closed_tx.send_replace(true);
            debug!("Session towards {} closed", self.peer_addr());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn session_pair(key: &SymmetricKey) -> (UdpSession, UdpSession) {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (a_addr, b_addr) = (a.local_addr().unwrap(), b.local_addr().unwrap());
        (
            UdpSession::new(a, b_addr, key.clone()),
            UdpSession::new(b, a_addr, key.clone()),
        )
    }

    #[tokio::test]
    async fn test_sealed_roundtrip() {
        let key = SymmetricKey::generate().unwrap();
        let (a, b) = session_pair(&key).await;
        a.send(b"frame").await.unwrap();
        let got = timeout(Duration::from_secs(2), b.recv()).await.unwrap().unwrap();
        assert_eq!(got, b"frame");
    }

    #[tokio::test]
    async fn test_drops_unauthenticated_and_roams() {
        let key = SymmetricKey::generate().unwrap();
        let (a, b) = session_pair(&key).await;
        let b_addr = b.local_addr().unwrap();

        // Plaintext from a stranger is ignored
        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        stranger.send_to(b"hello", b_addr).await.unwrap();

        // The peer shows up from a new port
        let moved = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let moved_addr = moved.local_addr().unwrap();
        moved
            .send_to(&seal(&key, b"roamed").unwrap(), b_addr)
            .await
            .unwrap();

        let got = timeout(Duration::from_secs(2), b.recv()).await.unwrap().unwrap();
        assert_eq!(got, b"roamed");
        assert_eq!(b.peer_addr(), moved_addr);
        drop(a);
    }

    #[tokio::test]
    async fn test_close_releases_socket() {
        let key = SymmetricKey::generate().unwrap();
        let (a, b) = session_pair(&key).await;
        let a = Arc::new(a);
        let local = a.local_addr().unwrap();

        let reader = a.clone();
        let pending = tokio::spawn(async move { reader.recv().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        a.close();
        a.close();
        let result = timeout(Duration::from_secs(2), pending).await.unwrap().unwrap();
        assert!(matches!(result, Err(P2PError::ChannelClosed)));
        assert!(matches!(a.send(b"late").await, Err(P2PError::ChannelClosed)));
        assert!(std::net::UdpSocket::bind(local).is_ok());
        drop(b);
    }

    #[tokio::test]
    async fn test_open_reuses_local_port() {
        let key = SymmetricKey::generate().unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let conn = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        conn.connect(peer.local_addr().unwrap()).await.unwrap();
        let local = conn.local_addr().unwrap();

        let session = UdpSession::open(conn, key.clone()).unwrap();
        assert_eq!(session.local_addr().unwrap(), local);
        assert_eq!(session.peer_addr(), peer.local_addr().unwrap());

        session.send(b"x").await.unwrap();
        let mut buf = [0u8; 128];
        let (n, from) = timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, local);
        assert_eq!(open(&key, &buf[..n]).unwrap(), b"x");
    }
}
