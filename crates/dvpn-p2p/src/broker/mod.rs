//! Broker Transports
//!
//! The config exchange only needs publish, subscribe and request/reply over
//! named subjects. Three transports implement that:
//! - [`MemoryBroker`]: in-process, for tests and single-process setups
//! - [`NatsConnector`]: NATS text protocol over TCP
//! - [`HttpConnector`]: HTTP relay with long-polled subscriptions

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::RngCore;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{P2PError, P2PResult};

pub mod http;
pub mod memory;
pub mod nats;

pub use http::{HttpBroker, HttpConnector};
pub use memory::MemoryBroker;
pub use nats::{NatsConnection, NatsConnector};

/// Message delivered on a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMsg {
    pub subject: String,
    /// Subject the sender waits on for an answer
    pub reply: Option<String>,
    pub data: Vec<u8>,
}

/// Live subscription. Dropping it unsubscribes.
pub struct Subscription {
    subject: String,
    rx: mpsc::UnboundedReceiver<BrokerMsg>,
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(
        subject: impl Into<String>,
        rx: mpsc::UnboundedReceiver<BrokerMsg>,
        unsubscribe: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            subject: subject.into(),
            rx,
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Next message, or `None` once the connection is gone
    pub async fn next(&mut self) -> Option<BrokerMsg> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("subject", &self.subject)
            .finish()
    }
}

/// Open connection to a broker
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn publish(&self, subject: &str, data: &[u8]) -> P2PResult<()>;

    async fn subscribe(&self, subject: &str) -> P2PResult<Subscription>;

    /// Publish with a private reply subject and wait for the first answer
    async fn request(&self, subject: &str, data: &[u8], timeout: Duration) -> P2PResult<BrokerMsg>;

    /// Addresses this connection was made to
    fn servers(&self) -> Vec<String>;

    async fn close(&self);
}

/// Opens broker connections
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self, addresses: &[String]) -> P2PResult<Arc<dyn BrokerConnection>>;
}

/// Connect, retrying `attempts` times with `delay` in between
pub async fn connect_with_retry(
    connector: &dyn BrokerConnector,
    addresses: &[String],
    attempts: usize,
    delay: Duration,
) -> P2PResult<Arc<dyn BrokerConnection>> {
    let attempts = attempts.max(1);
    let mut last_err = None;
    for attempt in 1..=attempts {
        match connector.connect(addresses).await {
            Ok(conn) => {
                debug!("Connected to broker {:?}", conn.servers());
                return Ok(conn);
            }
            Err(e) => {
                warn!("Broker connect attempt {}/{} failed: {}", attempt, attempts, e);
                last_err = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| P2PError::Broker("no broker address".into())))
}

/// Unique reply subject
pub fn new_inbox() -> String {
    let mut id = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut id);
    format!("_INBOX.{}", hex::encode(id))
}
