//! In-process broker

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::trace;

use super::{new_inbox, BrokerConnection, BrokerConnector, BrokerMsg, Subscription};
use crate::error::{P2PError, P2PResult};

type Subscribers = HashMap<String, Vec<(u64, mpsc::UnboundedSender<BrokerMsg>)>>;

/// Broker whose subjects live in this process. Clones share subjects.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    subjects: Arc<Mutex<Subscribers>>,
    next_id: Arc<AtomicU64>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions on `subject`
    pub fn subscriber_count(&self, subject: &str) -> usize {
        self.subjects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(subject)
            .map_or(0, |subs| subs.iter().filter(|(_, tx)| !tx.is_closed()).count())
    }

    fn deliver(&self, msg: BrokerMsg) -> usize {
        let mut subjects = self.subjects.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(subs) = subjects.get_mut(&msg.subject) else {
            return 0;
        };
        subs.retain(|(_, tx)| !tx.is_closed());
        for (_, tx) in subs.iter() {
            let _ = tx.send(msg.clone());
        }
        subs.len()
    }

    fn publish_msg(&self, subject: &str, reply: Option<String>, data: &[u8]) {
        let delivered = self.deliver(BrokerMsg {
            subject: subject.to_string(),
            reply,
            data: data.to_vec(),
        });
        trace!("Published {} bytes to {} ({} subscribers)", data.len(), subject, delivered);
    }
}

#[async_trait]
impl BrokerConnection for MemoryBroker {
    async fn publish(&self, subject: &str, data: &[u8]) -> P2PResult<()> {
        self.publish_msg(subject, None, data);
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> P2PResult<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subjects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(subject.to_string())
            .or_default()
            .push((id, tx));

        let subjects = self.subjects.clone();
        let key = subject.to_string();
        Ok(Subscription::new(subject, rx, move || {
            let mut subjects = subjects.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(subs) = subjects.get_mut(&key) {
                subs.retain(|(sid, _)| *sid != id);
                if subs.is_empty() {
                    subjects.remove(&key);
                }
            }
        }))
    }

    async fn request(&self, subject: &str, data: &[u8], timeout: Duration) -> P2PResult<BrokerMsg> {
        let inbox = new_inbox();
        let mut sub = self.subscribe(&inbox).await?;
        self.publish_msg(subject, Some(inbox), data);
        match tokio::time::timeout(timeout, sub.next()).await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(P2PError::Broker("broker closed".into())),
            Err(_) => Err(P2PError::BrokerTimeout(subject.to_string())),
        }
    }

    fn servers(&self) -> Vec<String> {
        vec!["memory://".to_string()]
    }

    async fn close(&self) {}
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect(&self, _addresses: &[String]) -> P2PResult<Arc<dyn BrokerConnection>> {
        Ok(Arc::new(self.clone()))
    }
}
