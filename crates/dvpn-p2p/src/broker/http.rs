//! HTTP Relay Broker
//!
//! For nodes that cannot hold a NATS connection. The relay exposes:
//! - `POST {base}/publish/{subject}[?reply=..]`, body is the payload
//! - `POST {base}/request/{subject}?timeout_ms=..`, response body is the reply
//! - `GET {base}/events/{subject}?since=..&timeout_ms=..`, long-poll returning
//!   `{"events":[{"timestamp","subject","reply","data"}]}`

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::{BrokerConnection, BrokerConnector, BrokerMsg, Subscription};
use crate::error::{P2PError, P2PResult};

/// Default long-poll duration
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(20);

const RETRY_DELAY: Duration = Duration::from_secs(1);

/// One relayed message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Relay-assigned, increasing per subject
    pub timestamp: u64,
    pub subject: String,
    #[serde(default)]
    pub reply: Option<String>,
    #[serde(default)]
    pub data: Vec<u8>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct EventsResponse {
    #[serde(default)]
    events: Vec<Event>,
}

/// Connects to the first HTTP relay that answers
#[derive(Debug, Clone)]
pub struct HttpConnector {
    client: reqwest::Client,
    poll_timeout: Duration,
}

impl Default for HttpConnector {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_TIMEOUT)
    }
}

impl HttpConnector {
    pub fn new(poll_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            poll_timeout,
        }
    }
}

#[async_trait]
impl BrokerConnector for HttpConnector {
    async fn connect(&self, addresses: &[String]) -> P2PResult<Arc<dyn BrokerConnection>> {
        let mut last_err = P2PError::Broker("no relay address given".into());
        for address in addresses {
            let broker = HttpBroker::with_client(self.client.clone(), address, self.poll_timeout);
            // Any HTTP answer means the relay is up
            match broker
                .client
                .get(&broker.base)
                .timeout(Duration::from_secs(5))
                .send()
                .await
            {
                Ok(_) => return Ok(Arc::new(broker)),
                Err(e) => {
                    debug!("HTTP relay {} unavailable: {}", address, e);
                    last_err = e.into();
                }
            }
        }
        Err(last_err)
    }
}

/// Broker connection over an HTTP relay
#[derive(Debug, Clone)]
pub struct HttpBroker {
    client: reqwest::Client,
    base: String,
    poll_timeout: Duration,
}

impl HttpBroker {
    pub fn new(base: &str) -> Self {
        Self::with_client(reqwest::Client::new(), base, DEFAULT_POLL_TIMEOUT)
    }

    pub fn with_client(client: reqwest::Client, base: &str, poll_timeout: Duration) -> Self {
        Self {
            client,
            base: base.trim_end_matches('/').to_string(),
            poll_timeout,
        }
    }

    fn url(&self, action: &str, subject: &str) -> String {
        format!("{}/{}/{}", self.base, action, subject)
    }

    async fn post_publish(&self, subject: &str, reply: Option<&str>, data: &[u8]) -> P2PResult<()> {
        let mut request = self.client.post(self.url("publish", subject)).body(data.to_vec());
        if let Some(reply) = reply {
            request = request.query(&[("reply", reply)]);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(P2PError::Broker(format!(
                "publish to {} failed: {}",
                subject,
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerConnection for HttpBroker {
    async fn publish(&self, subject: &str, data: &[u8]) -> P2PResult<()> {
        self.post_publish(subject, None, data).await
    }

    async fn subscribe(&self, subject: &str) -> P2PResult<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(poll_events(self.clone(), subject.to_string(), tx));
        let abort = task.abort_handle();
        Ok(Subscription::new(subject, rx, move || abort.abort()))
    }

    async fn request(&self, subject: &str, data: &[u8], timeout: Duration) -> P2PResult<BrokerMsg> {
        let response = self
            .client
            .post(self.url("request", subject))
            .query(&[("timeout_ms", timeout.as_millis().to_string())])
            .body(data.to_vec())
            .timeout(timeout + Duration::from_secs(1))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    P2PError::BrokerTimeout(subject.to_string())
                } else {
                    e.into()
                }
            })?;

        match response.status() {
            status if status.is_success() => Ok(BrokerMsg {
                subject: subject.to_string(),
                reply: None,
                data: response.bytes().await?.to_vec(),
            }),
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
                Err(P2PError::BrokerTimeout(subject.to_string()))
            }
            status => Err(P2PError::Broker(format!("request to {} failed: {}", subject, status))),
        }
    }

    fn servers(&self) -> Vec<String> {
        vec![self.base.clone()]
    }

    async fn close(&self) {}
}

/// Long-poll `subject` until the subscription is dropped
async fn poll_events(broker: HttpBroker, subject: String, tx: mpsc::UnboundedSender<BrokerMsg>) {
    let url = broker.url("events", &subject);
    let mut since = 0u64;
    while !tx.is_closed() {
        let result = broker
            .client
            .get(&url)
            .query(&[
                ("since", since.to_string()),
                ("timeout_ms", broker.poll_timeout.as_millis().to_string()),
            ])
            .timeout(broker.poll_timeout + Duration::from_secs(5))
            .send()
            .await;

        let events = match result {
            Ok(response) if response.status().is_success() => {
                match response.json::<EventsResponse>().await {
                    Ok(body) => body.events,
                    Err(e) => {
                        warn!("Bad events from relay for {}: {}", subject, e);
                        tokio::time::sleep(RETRY_DELAY).await;
                        continue;
                    }
                }
            }
            Ok(response) => {
                debug!("Relay answered {} for {}", response.status(), subject);
                tokio::time::sleep(RETRY_DELAY).await;
                continue;
            }
            Err(e) if e.is_timeout() => continue,
            Err(e) => {
                debug!("Polling {} failed: {}", subject, e);
                tokio::time::sleep(RETRY_DELAY).await;
                continue;
            }
        };

        for event in events {
            if event.timestamp <= since && since != 0 {
                continue;
            }
            since = since.max(event.timestamp);
            trace!("Relay event for {} with {} bytes", event.subject, event.data.len());
            let msg = BrokerMsg {
                subject: event.subject,
                reply: event.reply,
                data: event.data,
            };
            if tx.send(msg).is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        let broker = HttpBroker::new("https://relay.example/api/");
        assert_eq!(
            broker.url("publish", "p.wireguard.p2p-config-exchange"),
            "https://relay.example/api/publish/p.wireguard.p2p-config-exchange"
        );
        assert_eq!(broker.servers(), vec!["https://relay.example/api".to_string()]);
    }

    #[test]
    fn test_events_json() {
        let body = r#"{"events":[{"timestamp":5,"subject":"a","reply":"_INBOX.1","data":[1,2,3]},
                                  {"timestamp":6,"subject":"a"}]}"#;
        let parsed: EventsResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.events.len(), 2);
        assert_eq!(parsed.events[0].reply.as_deref(), Some("_INBOX.1"));
        assert_eq!(parsed.events[0].data, vec![1, 2, 3]);
        assert!(parsed.events[1].data.is_empty());
    }

    #[tokio::test]
    async fn test_connect_unreachable() {
        let connector = HttpConnector::new(Duration::from_secs(1));
        let result = connector.connect(&["http://127.0.0.1:1".to_string()]).await;
        assert!(matches!(result, Err(P2PError::Broker(_))));
    }

    #[tokio::test]
    #[ignore] // Requires a running relay
    async fn test_relay_publish() {
        let broker = HttpBroker::new("http://127.0.0.1:8080");
        let mut sub = broker.subscribe("test.subject").await.unwrap();
        broker.publish("test.subject", b"hello").await.unwrap();
        let msg = sub.next().await.unwrap();
        assert_eq!(msg.data, b"hello");
    }
}
