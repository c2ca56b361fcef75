//! UDP Hole Punching
//!
//! Both peers fire datagrams from pre-agreed local ports at each other's
//! advertised ports. The first datagram that makes it through proves the
//! path is open; the socket is then connected to the address it came from
//! and confirmed with a short `OK` / `OK_ACK` exchange.
//!
//! The provider starts with a low TTL so that its first packets die in
//! transit after opening its own NAT binding instead of reaching the
//! consumer's router unprompted. After `low_ttl_pings` packets every socket
//! escalates to TTL 128.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, trace, warn};

use crate::error::{NetworkError, NetworkResult};
use crate::transport::UdpSocketBuilder;

const BUFFER_LEN: usize = 64;

/// TTL used once a hole is plausibly open
pub const MAX_TTL: u32 = 128;

/// Initial TTL of the consumer's pings
pub const CONSUMER_INITIAL_TTL: u32 = 128;

/// Initial TTL of the provider's pings
pub const PROVIDER_INITIAL_TTL: u32 = 2;

const MSG_OK: &[u8] = b"OK";
const MSG_OK_ACK: &[u8] = b"OK_ACK";
const MSG_PING: &str = "continuously pinging to ";
const SEND_RETRIES: usize = 10;

/// Hole punching timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingConfig {
    /// Delay between pings on one socket
    pub interval: Duration,

    /// Deadline for the whole punching attempt
    pub timeout: Duration,

    /// Delay between repeated `OK` while waiting for `OK_ACK`
    pub send_ack_interval: Duration,

    /// Pings sent at the initial TTL before escalating to 128
    pub low_ttl_pings: u32,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(200),
            timeout: Duration::from_secs(10),
            send_ack_interval: Duration::from_millis(100),
            low_ttl_pings: 10,
        }
    }
}

impl PingConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.interval.is_zero() {
            return Err("ping interval must be > 0".into());
        }
        if self.timeout < self.interval {
            return Err("ping timeout must be at least one interval".into());
        }
        if self.send_ack_interval.is_zero() {
            return Err("send ack interval must be > 0".into());
        }
        Ok(())
    }
}

/// Opens UDP paths through NAT
#[async_trait]
pub trait NatPinger: Send + Sync {
    /// Consumer side: punch towards the provider and wait for its `OK`.
    /// Returns `n` connected sockets ordered by local port index.
    async fn ping_provider_peer(
        &self,
        local_ip: Option<IpAddr>,
        remote_ip: IpAddr,
        local_ports: &[u16],
        remote_ports: &[u16],
        initial_ttl: u32,
        n: usize,
    ) -> NetworkResult<Vec<UdpSocket>>;

    /// Provider side: punch towards the consumer and repeat `OK` until it
    /// acknowledges. Returns `n` connected sockets ordered by local port index.
    async fn ping_consumer_peer(
        &self,
        id: &str,
        remote_ip: IpAddr,
        local_ports: &[u16],
        remote_ports: &[u16],
        initial_ttl: u32,
        n: usize,
    ) -> NetworkResult<Vec<UdpSocket>>;

    /// Interval the provider's reply delay is based on
    fn ping_interval(&self) -> Duration;

    /// True for pingers that never punch
    fn is_noop(&self) -> bool {
        false
    }

    fn stop(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Consumer,
    Provider,
}

/// Hole punching pinger
pub struct Pinger {
    config: PingConfig,
    stopped: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

impl Pinger {
    pub fn new(config: PingConfig) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            config,
            stopped: AtomicBool::new(false),
            stop_tx,
        }
    }

    pub fn config(&self) -> &PingConfig {
        &self.config
    }

    /// Allow pinging again after a `stop`
    pub fn start(&self) {
        if self.stopped.swap(false, Ordering::SeqCst) {
            self.stop_tx.send_replace(false);
            debug!("NAT pinger started");
        }
    }

    /// Abort running attempts and refuse new ones. Idempotent.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.stop_tx.send_replace(true);
            debug!("NAT pinger stopped");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    #[allow(clippy::too_many_arguments)]
    async fn ping_peer(
        &self,
        role: Role,
        local_ip: Option<IpAddr>,
        remote_ip: IpAddr,
        local_ports: &[u16],
        remote_ports: &[u16],
        initial_ttl: u32,
        n: usize,
    ) -> NetworkResult<Vec<UdpSocket>> {
        if local_ports.len() != remote_ports.len() {
            return Err(NetworkError::PortCountMismatch {
                local: local_ports.len(),
                remote: remote_ports.len(),
            });
        }
        if n == 0 || n > local_ports.len() {
            return Err(NetworkError::TooFewConnections);
        }
        let mut stop_rx = self.stop_tx.subscribe();
        if *stop_rx.borrow() {
            return Err(NetworkError::PingStopped);
        }

        info!("NAT pinging to remote peer {} over {} ports", remote_ip, local_ports.len());

        let deadline = Instant::now() + self.config.timeout;
        let local_ip = local_ip.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let mut pings = JoinSet::new();
        for (id, ttl) in ttl_schedule(initial_ttl, local_ports.len(), n).into_iter().enumerate() {
            let local = SocketAddr::new(local_ip, local_ports[id]);
            let remote = SocketAddr::new(remote_ip, remote_ports[id]);
            let config = self.config.clone();
            pings.spawn(async move {
                let socket = single_ping(&config, local, remote, ttl).await?;
                socket.set_ttl(MAX_TTL)?;
                match role {
                    Role::Provider => {
                        send_msg(&config, &socket, MSG_OK).await;
                        send_conn_ack(&config, &socket).await?;
                    }
                    Role::Consumer => {
                        send_msg(&config, &socket, MSG_OK).await;
                        wait_msg(&socket, MSG_OK).await?;
                        send_msg(&config, &socket, MSG_OK_ACK).await;
                    }
                }
                Ok::<_, NetworkError>((id, socket))
            });
        }

        // Dropping the set aborts pings still in flight and closes their sockets.
        let mut conns: Vec<(usize, UdpSocket)> = Vec::with_capacity(n);
        loop {
            tokio::select! {
                joined = pings.join_next() => match joined {
                    Some(Ok(Ok(conn))) => {
                        conns.push(conn);
                        if conns.len() == n {
                            break;
                        }
                    }
                    Some(Ok(Err(e))) => warn!("One of the pings has error: {}", e),
                    Some(Err(e)) => warn!("Ping task failed: {}", e),
                    None => {
                        warn!("Hole punching to {} built {} of {} connections", remote_ip, conns.len(), n);
                        return Err(NetworkError::TooFewConnections);
                    }
                },
                _ = sleep_until(deadline) => {
                    warn!("Hole punching to {} timed out", remote_ip);
                    return Err(NetworkError::PingTimeout);
                }
                _ = stop_rx.wait_for(|stopped| *stopped) => {
                    return Err(NetworkError::PingStopped);
                }
            }
        }

        conns.sort_by_key(|(id, _)| *id);
        Ok(conns.into_iter().map(|(_, socket)| socket).collect())
    }
}

impl Default for Pinger {
    fn default() -> Self {
        Self::new(PingConfig::default())
    }
}

#[async_trait]
impl NatPinger for Pinger {
    async fn ping_provider_peer(
        &self,
        local_ip: Option<IpAddr>,
        remote_ip: IpAddr,
        local_ports: &[u16],
        remote_ports: &[u16],
        initial_ttl: u32,
        n: usize,
    ) -> NetworkResult<Vec<UdpSocket>> {
        self.ping_peer(
            Role::Consumer,
            local_ip,
            remote_ip,
            local_ports,
            remote_ports,
            initial_ttl,
            n,
        )
        .await
    }

    async fn ping_consumer_peer(
        &self,
        id: &str,
        remote_ip: IpAddr,
        local_ports: &[u16],
        remote_ports: &[u16],
        initial_ttl: u32,
        n: usize,
    ) -> NetworkResult<Vec<UdpSocket>> {
        let result = self
            .ping_peer(
                Role::Provider,
                None,
                remote_ip,
                local_ports,
                remote_ports,
                initial_ttl,
                n,
            )
            .await;
        match &result {
            Ok(_) => info!("Hole punching for {} succeeded", id),
            Err(e) => warn!("Hole punching for {} failed: {}", id, e),
        }
        result
    }

    fn ping_interval(&self) -> Duration {
        self.config.interval
    }

    fn stop(&self) {
        Pinger::stop(self)
    }
}

/// Pinger for nodes that never punch holes
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPinger;

#[async_trait]
impl NatPinger for NoopPinger {
    async fn ping_provider_peer(
        &self,
        _local_ip: Option<IpAddr>,
        _remote_ip: IpAddr,
        _local_ports: &[u16],
        _remote_ports: &[u16],
        _initial_ttl: u32,
        _n: usize,
    ) -> NetworkResult<Vec<UdpSocket>> {
        Err(NetworkError::TraversalUnavailable("holepunching".into()))
    }

    async fn ping_consumer_peer(
        &self,
        _id: &str,
        _remote_ip: IpAddr,
        _local_ports: &[u16],
        _remote_ports: &[u16],
        _initial_ttl: u32,
        _n: usize,
    ) -> NetworkResult<Vec<UdpSocket>> {
        Err(NetworkError::TraversalUnavailable("holepunching".into()))
    }

    fn ping_interval(&self) -> Duration {
        Duration::ZERO
    }

    fn is_noop(&self) -> bool {
        true
    }
}

/// Initial TTL per socket: climbs by one from `initial` and wraps every
/// `ports / n` sockets so each group of `n` spans the same TTL range.
fn ttl_schedule(initial: u32, ports: usize, n: usize) -> Vec<u32> {
    let reset = initial + (ports / n.max(1)) as u32;
    let mut ttl = initial;
    let mut schedule = Vec::with_capacity(ports);
    for _ in 0..ports {
        schedule.push(ttl);
        if ttl < MAX_TTL {
            ttl += 1;
        }
        if ttl == reset {
            ttl = initial;
        }
    }
    schedule
}

/// Ping `remote` from `local` until anything from the peer arrives, then
/// connect the socket to the address the peer answered from.
async fn single_ping(
    config: &PingConfig,
    local: SocketAddr,
    remote: SocketAddr,
    ttl: u32,
) -> NetworkResult<UdpSocket> {
    let socket = Arc::new(
        UdpSocketBuilder::new(local)
            .reuse_address(true)
            .ttl(ttl)
            .build()?,
    );
    debug!("Local socket: {}", socket.local_addr()?);

    let mut pinging = PingTask(tokio::spawn(ping_loop(
        socket.clone(),
        remote,
        config.interval,
        ttl,
        config.low_ttl_pings,
    )));
    let received = ping_receiver(&socket).await;
    pinging.0.abort();
    // Wait for the aborted task to drop its handle on the socket.
    let _ = (&mut pinging.0).await;
    let peer = received?;

    // Leave the binding open with one packet that is sure to arrive.
    socket.set_ttl(MAX_TTL)?;
    let _ = socket
        .send_to(format!("{}{}", MSG_PING, peer).as_bytes(), peer)
        .await;

    socket.connect(peer).await?;
    Arc::try_unwrap(socket)
        .map_err(|_| NetworkError::Protocol("ping socket still shared".into()))
}

/// Aborts the ping loop when the attempt is dropped, so losing sockets,
/// timeouts and `stop` all release the bound port
struct PingTask(JoinHandle<()>);

impl Drop for PingTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn ping_loop(
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    interval: Duration,
    initial_ttl: u32,
    low_ttl_pings: u32,
) {
    let msg = format!("{}{}", MSG_PING, remote);
    let mut sent: u32 = 0;
    loop {
        sleep(interval).await;
        if initial_ttl < MAX_TTL && sent == low_ttl_pings {
            if let Err(e) = socket.set_ttl(MAX_TTL) {
                warn!("Failed to raise ping TTL: {}", e);
            }
        }
        if let Err(e) = socket.send_to(msg.as_bytes(), remote).await {
            warn!("Pinging {} failed: {}", remote, e);
            return;
        }
        sent = sent.saturating_add(1);
    }
}

/// Wait for the peer's first `OK` or ping and return where it came from
async fn ping_receiver(socket: &UdpSocket) -> NetworkResult<SocketAddr> {
    let mut buf = [0u8; BUFFER_LEN];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                debug!("Failed to read remote peer: {}, attempting to continue", e);
                continue;
            }
        };
        if n == 0 {
            continue;
        }
        let msg = &buf[..n];
        trace!("Remote peer data received, len: {}", n);
        if msg == MSG_OK || msg.starts_with(MSG_PING.as_bytes()) {
            return Ok(from);
        }
        debug!("Unexpected message from {}, attempting to continue", from);
    }
}

/// Wait on a connected socket until exactly `expected` arrives
async fn wait_msg(socket: &UdpSocket, expected: &[u8]) -> NetworkResult<()> {
    let mut buf = [0u8; 1024];
    let mut errors = 0;
    loop {
        match socket.recv(&mut buf).await {
            Ok(n) if &buf[..n] == expected => return Ok(()),
            Ok(_) => {}
            Err(e) => {
                errors += 1;
                // A closed peer port yields a burst of ICMP errors
                if errors > SEND_RETRIES * 10 {
                    return Err(e.into());
                }
                sleep(Duration::from_millis(5)).await;
            }
        }
    }
}

/// Repeat `OK` until the peer answers `OK_ACK`
async fn send_conn_ack(config: &PingConfig, socket: &UdpSocket) -> NetworkResult<()> {
    let ack = wait_msg(socket, MSG_OK_ACK);
    tokio::pin!(ack);
    loop {
        tokio::select! {
            result = &mut ack => return result,
            _ = sleep(config.send_ack_interval) => send_msg(config, socket, MSG_OK).await,
        }
    }
}

async fn send_msg(config: &PingConfig, socket: &UdpSocket, msg: &[u8]) {
    for _ in 0..SEND_RETRIES {
        match socket.send(msg).await {
            Ok(_) => return,
            Err(e) => {
                warn!("Pinger message send failed: {}", e);
                sleep(config.interval).await;
            }
        }
    }
}
