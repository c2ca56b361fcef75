//! P2P Channel
//!
//! Multiplexed request/reply over an encrypted [`Session`]. Each request
//! gets a fresh stream id; the peer answers with a frame carrying the same
//! id and an empty topic. Handlers run in their own task, so topics are
//! served concurrently while each request still gets exactly one reply.
//!
//! Tasks per channel:
//! - read loop: decodes frames, dispatches requests and replies
//! - send loop: drains the bounded send queue into the session
//! - keep-alive loop: pings the peer to hold the NAT binding open
//! - watchdog: closes the channel if the peer never speaks

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::BytesMut;
use dvpn_crypto::PublicKey;
use dvpn_network::PortsRelease;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, error, info, trace, warn};

use crate::config::{P2PConfig, WireFormatKind};
use crate::error::{P2PError, P2PResult};
use crate::message::topic;
use crate::session::Session;
use crate::wireformat::{wire_format, StatusCode, TransportMsg, WireFormat};

/// Error type handlers may return; reported to the peer as an internal error
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of a request handler
pub type HandlerResult = Result<Reply, HandlerError>;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// What a handler sends back
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Success, with an optional payload
    Ok(Vec<u8>),
    /// Rejection the peer may show to its user
    PublicError(String),
}

/// Incoming request as seen by a handler
#[derive(Debug, Clone)]
pub struct Context {
    topic: String,
    request: Vec<u8>,
    peer: SocketAddr,
}

impl Context {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Request payload
    pub fn request(&self) -> &[u8] {
        &self.request
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn ok(self) -> HandlerResult {
        Ok(Reply::Ok(Vec::new()))
    }

    pub fn ok_with_reply(self, data: Vec<u8>) -> HandlerResult {
        Ok(Reply::Ok(data))
    }

    /// Reject the request with a message safe to show the peer
    pub fn error(self, err: impl std::fmt::Display) -> HandlerResult {
        Ok(Reply::PublicError(err.to_string()))
    }
}

/// Request handler for one topic
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, ctx: Context) -> BoxFuture<HandlerResult>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn handle(&self, ctx: Context) -> BoxFuture<HandlerResult> {
        Box::pin(self(ctx))
    }
}

/// Channel timing, taken from [`P2PConfig`]
#[derive(Debug, Clone)]
struct Timing {
    send_timeout: Duration,
    keepalive_interval: Duration,
    initial_traffic_timeout: Duration,
}

/// Secure request/reply channel to one peer. Cheap to clone.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

struct Inner {
    session: Arc<dyn Session>,
    codec: Arc<dyn WireFormat>,
    timing: Timing,
    peer_public_key: Option<PublicKey>,

    handlers: Mutex<HashMap<String, Arc<dyn Handler>>>,
    streams: Mutex<HashMap<u64, mpsc::Sender<TransportMsg>>>,
    next_stream_id: AtomicU64,
    send_tx: mpsc::Sender<TransportMsg>,

    service_conn: Mutex<Option<UdpSocket>>,
    ports_release: Mutex<Option<PortsRelease>>,

    closed: AtomicBool,
    stop_tx: watch::Sender<bool>,
    first_traffic: Notify,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Channel {
    /// Start a channel over `session` and spawn its loops
    pub fn new(session: Arc<dyn Session>, wire: WireFormatKind, config: &P2PConfig) -> Self {
        Self::with_peer_key(session, wire, config, None)
    }

    /// Like [`Channel::new`], remembering the peer's session key
    pub fn with_peer_key(
        session: Arc<dyn Session>,
        wire: WireFormatKind,
        config: &P2PConfig,
        peer_public_key: Option<PublicKey>,
    ) -> Self {
        let (send_tx, send_rx) = mpsc::channel(config.send_queue_len.max(1));
        let (stop_tx, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            session,
            codec: wire_format(wire),
            timing: Timing {
                send_timeout: config.send_timeout,
                keepalive_interval: config.keepalive_interval,
                initial_traffic_timeout: config.initial_traffic_timeout,
            },
            peer_public_key,
            handlers: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            next_stream_id: AtomicU64::new(1),
            send_tx,
            service_conn: Mutex::new(None),
            ports_release: Mutex::new(None),
            closed: AtomicBool::new(false),
            stop_tx,
            first_traffic: Notify::new(),
        });

        tokio::spawn(read_loop(inner.clone()));
        tokio::spawn(send_loop(inner.clone(), send_rx));
        tokio::spawn(keepalive_loop(inner.clone()));
        tokio::spawn(traffic_watchdog(inner.clone()));

        debug!(
            "Channel {:?} -> {} started with {:?} wire format",
            inner.session.local_addr().ok(),
            inner.session.peer_addr(),
            wire
        );
        Self { inner }
    }

    /// Register the handler for `topic`.
    ///
    /// Requests arriving before registration are answered with
    /// `HandlerNotFound`.
    pub fn handle(&self, topic: impl Into<String>, handler: impl Handler) {
        let topic = topic.into();
        debug!("Registering handler for topic {}", topic);
        lock(&self.inner.handlers).insert(topic, Arc::new(handler));
    }

    /// Send a request and wait for the correlated reply
    pub async fn send(&self, topic: &str, data: Vec<u8>) -> P2PResult<Vec<u8>> {
        self.inner.send_request(topic, data).await
    }

    /// Stop all loops, close the session, release mapped ports and drop the
    /// service socket. Safe to call any number of times from anywhere.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the channel is closed
    pub async fn closed(&self) {
        stopped(&mut self.inner.stop_tx.subscribe()).await;
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.session.peer_addr()
    }

    pub fn local_addr(&self) -> P2PResult<SocketAddr> {
        self.inner.session.local_addr()
    }

    pub fn peer_public_key(&self) -> Option<PublicKey> {
        self.inner.peer_public_key
    }

    pub fn wire_format(&self) -> WireFormatKind {
        self.inner.codec.kind()
    }

    /// Attach the socket reserved for the carried VPN service
    pub fn set_service_conn(&self, conn: UdpSocket) {
        *lock(&self.inner.service_conn) = Some(conn);
    }

    /// Hand the service socket to the caller
    pub fn take_service_conn(&self) -> Option<UdpSocket> {
        lock(&self.inner.service_conn).take()
    }

    /// Release these mappings when the channel closes
    pub fn set_ports_release(&self, release: PortsRelease) {
        if self.is_closed() {
            release.release();
            return;
        }
        *lock(&self.inner.ports_release) = Some(release);
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("peer", &self.peer_addr())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Inner {
    async fn send_request(&self, topic: &str, data: Vec<u8>) -> P2PResult<Vec<u8>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(P2PError::ChannelClosed);
        }
        let id = self.next_stream_id.fetch_add(1, Ordering::SeqCst);
        let (tx, mut rx) = mpsc::channel(1);
        lock(&self.streams).insert(id, tx);
        let _stream = StreamGuard { inner: self, id };

        self.send_tx
            .send(TransportMsg::request(id, topic, data))
            .await
            .map_err(|_| P2PError::ChannelClosed)?;

        let reply = match tokio::time::timeout(self.timing.send_timeout, rx.recv()).await {
            Ok(Some(reply)) => reply,
            Ok(None) => return Err(P2PError::ChannelClosed),
            Err(_) => return Err(P2PError::SendTimeout(topic.to_string())),
        };

        match reply.status_code {
            StatusCode::Ok => Ok(reply.data),
            StatusCode::PublicErr => Err(P2PError::PeerPublic(
                String::from_utf8_lossy(&reply.data).into_owned(),
            )),
            StatusCode::HandlerNotFound => Err(P2PError::HandlerNotFound(topic.to_string())),
            StatusCode::InternalErr => Err(P2PError::PeerInternal(reply.msg)),
        }
    }

    fn handle_reply(&self, msg: TransportMsg) {
        let stream = lock(&self.streams).get(&msg.id).cloned();
        match stream {
            Some(tx) => {
                if tx.try_send(msg).is_err() {
                    debug!("Dropping duplicate reply");
                }
            }
            None => warn!("Stream {} not found, message data: {} bytes", msg.id, msg.data.len()),
        }
    }

    async fn enqueue(&self, msg: TransportMsg) {
        if self.send_tx.send(msg).await.is_err() {
            debug!("Send queue closed, dropping frame");
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_tx.send_replace(true);
        self.session.close();

        if let Some(release) = lock(&self.ports_release).take() {
            release.release();
        }
        lock(&self.service_conn).take();
        // Waiting senders see their stream end
        lock(&self.streams).clear();

        info!("Channel to {} closed", self.session.peer_addr());
    }
}

/// Resolves once `close` has run
async fn stopped(stop_rx: &mut watch::Receiver<bool>) {
    let _ = stop_rx.wait_for(|stopped| *stopped).await;
}

/// Removes a stream entry once its sender is done with it
struct StreamGuard<'a> {
    inner: &'a Inner,
    id: u64,
}

impl Drop for StreamGuard<'_> {
    fn drop(&mut self) {
        lock(&self.inner.streams).remove(&self.id);
    }
}

async fn handle_request(inner: Arc<Inner>, msg: TransportMsg) {
    let id = msg.id;
    if msg.topic == topic::KEEPALIVE {
        inner.enqueue(TransportMsg::reply(id, StatusCode::Ok, "", Vec::new())).await;
        return;
    }

    let handler = lock(&inner.handlers).get(&msg.topic).cloned();
    let Some(handler) = handler else {
        warn!("Handler {:?} not found", msg.topic);
        let data = format!("handler {:?} not found", msg.topic).into_bytes();
        inner
            .enqueue(TransportMsg::reply(id, StatusCode::HandlerNotFound, "", data))
            .await;
        return;
    };

    let ctx = Context {
        topic: msg.topic.clone(),
        request: msg.data,
        peer: inner.session.peer_addr(),
    };
    // A panicking handler fails only its own request
    let reply = match tokio::spawn(handler.handle(ctx)).await {
        Ok(Ok(Reply::Ok(data))) => TransportMsg::reply(id, StatusCode::Ok, "", data),
        Ok(Ok(Reply::PublicError(text))) => {
            debug!("Handler {} rejected request: {}", msg.topic, text);
            TransportMsg::reply(id, StatusCode::PublicErr, "", text.into_bytes())
        }
        Ok(Err(e)) => {
            error!("Handler {} failed: {}", msg.topic, e);
            TransportMsg::reply(id, StatusCode::InternalErr, "internal error", Vec::new())
        }
        Err(e) => {
            error!("Handler {} aborted: {}", msg.topic, e);
            TransportMsg::reply(id, StatusCode::InternalErr, "internal error", Vec::new())
        }
    };
    inner.enqueue(reply).await;
}

async fn read_loop(inner: Arc<Inner>) {
    let mut stop_rx = inner.stop_tx.subscribe();
    let mut seen_traffic = false;
    loop {
        let frame = tokio::select! {
            _ = stopped(&mut stop_rx) => break,
            frame = inner.session.recv() => frame,
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                if inner.closed.load(Ordering::SeqCst) {
                    break;
                }
                debug!("Failed to read frame: {}", e);
                continue;
            }
        };
        if !seen_traffic {
            seen_traffic = true;
            inner.first_traffic.notify_one();
        }

        let mut buf = BytesMut::from(&frame[..]);
        loop {
            match inner.codec.decode(&mut buf) {
                Ok(Some(msg)) if msg.is_request() => {
                    tokio::spawn(handle_request(inner.clone(), msg));
                }
                Ok(Some(msg)) => inner.handle_reply(msg),
                Ok(None) => {
                    if !buf.is_empty() {
                        trace!("Dropping {} bytes of a partial frame", buf.len());
                    }
                    break;
                }
                Err(e) => {
                    warn!("Failed to decode frame: {}", e);
                    break;
                }
            }
        }
    }
    trace!("Channel read loop stopped");
}

async fn send_loop(inner: Arc<Inner>, mut send_rx: mpsc::Receiver<TransportMsg>) {
    let mut stop_rx = inner.stop_tx.subscribe();
    let mut buf = BytesMut::new();
    loop {
        let msg = tokio::select! {
            _ = stopped(&mut stop_rx) => break,
            msg = send_rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        buf.clear();
        if let Err(e) = inner.codec.encode(&msg, &mut buf) {
            error!("Failed to encode frame {}: {}", msg.id, e);
            continue;
        }
        if let Err(e) = inner.session.send(&buf).await {
            warn!("Failed to send frame {}: {}", msg.id, e);
        }
    }
    trace!("Channel send loop stopped");
}

async fn keepalive_loop(inner: Arc<Inner>) {
    let mut stop_rx = inner.stop_tx.subscribe();
    let period = inner.timing.keepalive_interval.max(Duration::from_millis(10));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stopped(&mut stop_rx) => break,
            _ = ticker.tick() => {
                match inner.send_request(topic::KEEPALIVE, Vec::new()).await {
                    Ok(_) => trace!("Keep-alive answered"),
                    Err(P2PError::ChannelClosed) => break,
                    Err(e) => debug!("Keep-alive failed: {}", e),
                }
            }
        }
    }
    trace!("Channel keep-alive loop stopped");
}

async fn traffic_watchdog(inner: Arc<Inner>) {
    let mut stop_rx = inner.stop_tx.subscribe();
    tokio::select! {
        _ = stopped(&mut stop_rx) => {}
        _ = inner.first_traffic.notified() => trace!("Channel received first frame"),
        _ = tokio::time::sleep(inner.timing.initial_traffic_timeout) => {
            warn!(
                "No traffic from {} within {:?}, closing channel",
                inner.session.peer_addr(),
                inner.timing.initial_traffic_timeout
            );
            inner.close();
        }
    }
}
