//! Provider side of the config exchange
//!
//! A listener answers two subjects per service type: the init request,
//! where it prepares ports and replies with its sealed config, and the ack,
//! where it opens the consumer's config and connects. Prepared state lives
//! in a pending table keyed by the consumer's session key until the ack
//! arrives or the entry expires.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use dvpn_crypto::{generate_key, Identity, PrivateKey, PublicKey, SignerFactory, Verifier};
use dvpn_network::pinger::PROVIDER_INITIAL_TTL;
use dvpn_network::{
    acquire_local_ports, dial_pairs, prepare_ports, stun_ports, HolePunchingPreparer, IpResolver,
    ManualPreparer, NatPinger, NatProxy, NetworkError, PortMapper, PortPreparer, PortSupplier,
    PortsRelease, PreparedPorts, StartPorts, TraversalMethod, UpnpPreparer, REQUIRED_CONN_COUNT,
};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::{BrokerConnection, BrokerMsg};
use crate::channel::Channel;
use crate::config::P2PConfig;
use crate::error::{P2PError, P2PResult};
use crate::exchange::{
    compatibility_level, negotiate_wire_format, open_channel, peer_ip, Exchange, ExchangeState,
};
use crate::message::{
    channel_handlers_ready_subject, config_exchange_ack_subject, config_exchange_subject,
    decrypt_conn_config, encrypt_conn_config, pack_signed_msg, unpack_signed_msg,
    ConfigExchangeMsg, ConnectConfig, HandlersReady, ACK_OK,
};

/// Pending configs older than this are dropped and their ports released
pub const PENDING_CONFIG_TTL: Duration = Duration::from_secs(60);

/// Contact type advertised for broker-bootstrapped channels
pub const CONTACT_TYPE: &str = "nats/p2p/v1";

/// How consumers reach this provider's broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    #[serde(rename = "type")]
    pub contact_type: String,
    pub broker_addresses: Vec<String>,
}

/// Called with every channel the listener establishes
pub type ChannelCallback = Arc<dyn Fn(Channel) + Send + Sync>;

struct PendingConfig {
    public_ip: String,
    local_ports: Vec<u16>,
    private_key: PrivateKey,
    release: PortsRelease,
    start: StartPorts,
    created: Instant,
}

struct ListenerInner {
    broker: Arc<dyn BrokerConnection>,
    signers: Arc<dyn SignerFactory>,
    verifier: Arc<dyn Verifier>,
    ip_resolver: Arc<dyn IpResolver>,
    pinger: Arc<dyn NatPinger>,
    ports: Arc<dyn PortSupplier>,
    mapper: Arc<dyn PortMapper>,
    nat_proxy: Option<Arc<NatProxy>>,
    config: P2PConfig,
    pending: Mutex<HashMap<PublicKey, PendingConfig>>,
}

/// Accepts channels on the provider side
#[derive(Clone)]
pub struct Listener {
    inner: Arc<ListenerInner>,
}

/// Stops a running `listen`
pub struct ListenHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl ListenHandle {
    /// Unsubscribe from both exchange subjects. Established channels stay up.
    pub fn stop(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.tasks.iter().all(|task| task.is_finished())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Listener {
    pub fn new(
        broker: Arc<dyn BrokerConnection>,
        signers: Arc<dyn SignerFactory>,
        verifier: Arc<dyn Verifier>,
        ip_resolver: Arc<dyn IpResolver>,
        pinger: Arc<dyn NatPinger>,
        ports: Arc<dyn PortSupplier>,
        mapper: Arc<dyn PortMapper>,
    ) -> Self {
        Self::build(
            broker,
            signers,
            verifier,
            ip_resolver,
            pinger,
            ports,
            mapper,
            None,
            P2PConfig::default(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        broker: Arc<dyn BrokerConnection>,
        signers: Arc<dyn SignerFactory>,
        verifier: Arc<dyn Verifier>,
        ip_resolver: Arc<dyn IpResolver>,
        pinger: Arc<dyn NatPinger>,
        ports: Arc<dyn PortSupplier>,
        mapper: Arc<dyn PortMapper>,
        nat_proxy: Option<Arc<NatProxy>>,
        config: P2PConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ListenerInner {
                broker,
                signers,
                verifier,
                ip_resolver,
                pinger,
                ports,
                mapper,
                nat_proxy,
                config,
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn rebuild(self, nat_proxy: Option<Arc<NatProxy>>, config: P2PConfig) -> Self {
        let inner = &self.inner;
        Self::build(
            inner.broker.clone(),
            inner.signers.clone(),
            inner.verifier.clone(),
            inner.ip_resolver.clone(),
            inner.pinger.clone(),
            inner.ports.clone(),
            inner.mapper.clone(),
            nat_proxy,
            config,
        )
    }

    pub fn with_config(self, config: P2PConfig) -> Self {
        let nat_proxy = self.inner.nat_proxy.clone();
        self.rebuild(nat_proxy, config)
    }

    /// Hand service sockets to `proxy` for service types it serves
    pub fn with_nat_proxy(self, proxy: Arc<NatProxy>) -> Self {
        let config = self.inner.config.clone();
        self.rebuild(Some(proxy), config)
    }

    /// Exchanges waiting for their ack
    pub fn pending_count(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    /// Contact to publish for consumers
    pub fn contact(&self) -> Contact {
        Contact {
            contact_type: CONTACT_TYPE.to_string(),
            broker_addresses: self.inner.broker.servers(),
        }
    }

    /// Serve config exchanges for `provider_id` and `service_type`.
    /// `on_channel` runs for every established channel before the consumer
    /// is told the handlers are ready, so handlers registered there are
    /// never missed.
    pub async fn listen(
        &self,
        provider_id: Identity,
        service_type: &str,
        on_channel: impl Fn(Channel) + Send + Sync + 'static,
    ) -> P2PResult<ListenHandle> {
        let outbound_ip = self.inner.ip_resolver.outbound_ip().await?;
        let broker = &self.inner.broker;
        let mut init_sub = broker
            .subscribe(&config_exchange_subject(&provider_id, service_type))
            .await?;
        let mut ack_sub = broker
            .subscribe(&config_exchange_ack_subject(&provider_id, service_type))
            .await?;
        info!(
            "Provider {} listening for {} channels on {}",
            provider_id,
            service_type,
            init_sub.subject()
        );

        let on_channel: ChannelCallback = Arc::new(on_channel);

        let inner = self.inner.clone();
        let provider = provider_id.clone();
        let init_task = tokio::spawn(async move {
            while let Some(msg) = init_sub.next().await {
                let inner = inner.clone();
                let provider = provider.clone();
                tokio::spawn(async move {
                    if let Err(e) = inner.start_config_exchange(&provider, msg, outbound_ip).await {
                        warn!("Could not handle initial exchange: {}", e);
                    }
                });
            }
        });

        let inner = self.inner.clone();
        let service_type = service_type.to_string();
        let ack_task = tokio::spawn(async move {
            while let Some(msg) = ack_sub.next().await {
                let inner = inner.clone();
                let provider = provider_id.clone();
                let service_type = service_type.clone();
                let on_channel = on_channel.clone();
                tokio::spawn(async move {
                    if let Err(e) = inner
                        .ack_config_exchange(&provider, &service_type, msg, on_channel)
                        .await
                    {
                        warn!("Could not handle exchange ack: {}", e);
                    }
                });
            }
        });

        Ok(ListenHandle {
            tasks: vec![init_task, ack_task],
        })
    }
}

impl ListenerInner {
    async fn start_config_exchange(
        &self,
        provider_id: &Identity,
        msg: BrokerMsg,
        outbound_ip: IpAddr,
    ) -> P2PResult<()> {
        let reply_subject = msg
            .reply
            .ok_or_else(|| P2PError::Broker("init request without reply subject".into()))?;
        let signed = unpack_signed_msg(self.verifier.as_ref(), &msg.data)?;
        let init: ConfigExchangeMsg = signed.payload()?;
        let peer_public_key = PublicKey::from_hex(&init.public_key)?;
        let consumer = signed
            .signer()
            .map_or_else(|| "unknown".to_string(), |id| id.to_string());
        debug!("Received consumer {} public key {}", consumer, init.public_key);

        let mut exchange = Exchange::new(consumer);
        let (public_key, private_key) = generate_key()?;
        exchange.advance(ExchangeState::KeysGenerated);

        let public_ip = self.ip_resolver.public_ip().await?;
        let prepared = self.prepare_local_ports(public_ip, outbound_ip).await?;
        let advertised = match prepared.start {
            StartPorts::Ping => stun_ports(&self.config.stun_servers, &prepared.ports).await,
            StartPorts::Direct => prepared.ports.clone(),
        };

        let config = ConnectConfig {
            public_ip: public_ip.to_string(),
            ports: advertised,
            compatibility: compatibility_level(self.config.wire_format),
        };
        let reply = ConfigExchangeMsg {
            public_key: public_key.to_hex(),
            config_ciphertext: encrypt_conn_config(&config, &private_key, &peer_public_key)?,
        };
        let packed = match pack_signed_msg(self.signers.as_ref(), provider_id, &reply) {
            Ok(packed) => packed,
            Err(e) => {
                prepared.release.release();
                return Err(e);
            }
        };

        self.store_pending(
            peer_public_key,
            PendingConfig {
                public_ip: config.public_ip.clone(),
                local_ports: prepared.ports,
                private_key,
                release: prepared.release,
                start: prepared.start,
                created: Instant::now(),
            },
        );

        debug!("Sending reply with public key {} and encrypted config to consumer", reply.public_key);
        if let Err(e) = self.broker.publish(&reply_subject, &packed).await {
            if let Some(pending) = lock(&self.pending).remove(&peer_public_key) {
                pending.release.release();
            }
            return Err(e);
        }
        exchange.advance(ExchangeState::InitSent);
        Ok(())
    }

    async fn ack_config_exchange(
        &self,
        provider_id: &Identity,
        service_type: &str,
        msg: BrokerMsg,
        on_channel: ChannelCallback,
    ) -> P2PResult<()> {
        let reply_subject = msg
            .reply
            .ok_or_else(|| P2PError::Broker("ack without reply subject".into()))?;
        let signed = unpack_signed_msg(self.verifier.as_ref(), &msg.data)?;
        let ack: ConfigExchangeMsg = signed.payload()?;
        let peer_public_key = PublicKey::from_hex(&ack.public_key)?;
        debug!("Received consumer public key {}", ack.public_key);

        let pending = lock(&self.pending)
            .remove(&peer_public_key)
            .ok_or_else(|| P2PError::PendingConfigNotFound(ack.public_key.clone()))?;

        let mut exchange = Exchange::new(ack.public_key.clone());
        let release = pending.release.clone();
        let result = self
            .establish(
                provider_id,
                service_type,
                &reply_subject,
                &mut exchange,
                pending,
                &ack,
                &peer_public_key,
                on_channel,
            )
            .await;
        if result.is_err() {
            exchange.advance(ExchangeState::Failed);
            release.release();
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn establish(
        &self,
        provider_id: &Identity,
        service_type: &str,
        reply_subject: &str,
        exchange: &mut Exchange,
        pending: PendingConfig,
        ack: &ConfigExchangeMsg,
        peer_public_key: &PublicKey,
        on_channel: ChannelCallback,
    ) -> P2PResult<()> {
        let peer_config =
            decrypt_conn_config(&ack.config_ciphertext, &pending.private_key, peer_public_key)?;
        exchange.advance(ExchangeState::PeerConfigReceived);
        debug!("Decrypted consumer config {:?}", peer_config);

        if peer_config.ports.len() != pending.local_ports.len() {
            return Err(NetworkError::PortCountMismatch {
                local: pending.local_ports.len(),
                remote: peer_config.ports.len(),
            }
            .into());
        }
        let peer_ip = peer_ip(&pending.public_ip, &peer_config.public_ip)?;

        let conns = match pending.start {
            StartPorts::Direct => {
                self.broker.publish(reply_subject, ACK_OK).await?;
                exchange.advance(ExchangeState::AckSent);
                debug!("Skipping consumer ping");
                dial_pairs(peer_ip, &pending.local_ports, &peer_config.ports).await?
            }
            StartPorts::Ping => {
                // Delay the reply so the consumer starts pinging after us
                let delay =
                    self.pinger.ping_interval() * (pending.local_ports.len() / 2) as u32;
                tokio::time::sleep(delay).await;
                self.broker.publish(reply_subject, ACK_OK).await?;
                exchange.advance(ExchangeState::AckSent);

                debug!(
                    "Pinging consumer at {} using ports {:?}:{:?}",
                    peer_ip, pending.local_ports, peer_config.ports
                );
                let id = &ack.public_key[..ack.public_key.len().min(8)];
                self.pinger
                    .ping_consumer_peer(
                        id,
                        peer_ip,
                        &pending.local_ports,
                        &peer_config.ports,
                        PROVIDER_INITIAL_TTL,
                        REQUIRED_CONN_COUNT,
                    )
                    .await?
            }
        };

        let wire = negotiate_wire_format(self.config.wire_format, peer_config.compatibility);
        let (channel, service_conn) =
            open_channel(conns, &pending.private_key, peer_public_key, wire, &self.config)?;
        channel.set_ports_release(pending.release);

        if let Some(conn) = service_conn {
            match &self.nat_proxy {
                Some(proxy) if proxy.is_available(service_type).await => {
                    if let Err(e) = proxy.hand_off(service_type, conn).await {
                        channel.close();
                        return Err(e.into());
                    }
                }
                _ => channel.set_service_conn(conn),
            }
        }

        on_channel(channel.clone());

        let ready = HandlersReady::new(peer_public_key);
        let published = match pack_signed_msg(self.signers.as_ref(), provider_id, &ready) {
            Ok(packed) => {
                self.broker
                    .publish(&channel_handlers_ready_subject(provider_id, service_type), &packed)
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = published {
            channel.close();
            return Err(e);
        }
        exchange.advance(ExchangeState::HandlersReady);

        info!(
            "Channel for {} established with consumer at {}",
            service_type,
            channel.peer_addr()
        );
        exchange.advance(ExchangeState::Established);
        Ok(())
    }

    async fn prepare_local_ports(
        &self,
        public_ip: IpAddr,
        outbound_ip: IpAddr,
    ) -> P2PResult<PreparedPorts> {
        // No NAT between us and the internet
        if public_ip == outbound_ip {
            let ports = acquire_local_ports(self.ports.as_ref(), REQUIRED_CONN_COUNT)?;
            return Ok(PreparedPorts::direct(ports));
        }

        let preparers: Vec<Arc<dyn PortPreparer>> = self
            .config
            .traversal
            .iter()
            .map(|method| -> Arc<dyn PortPreparer> {
                match method {
                    TraversalMethod::Manual => Arc::new(ManualPreparer::new(
                        self.ports.clone(),
                        self.config.manual_port_forwarding,
                    )),
                    TraversalMethod::Upnp => Arc::new(
                        UpnpPreparer::new(self.ports.clone(), self.mapper.clone())
                            .with_echo_servers(
                                self.config.echo_servers.clone(),
                                self.config.send_timeout,
                            ),
                    ),
                    TraversalMethod::HolePunching => Arc::new(HolePunchingPreparer::new(
                        self.ports.clone(),
                        !self.pinger.is_noop(),
                    )),
                }
            })
            .collect();

        Ok(prepare_ports(&preparers).await?)
    }

    fn store_pending(&self, key: PublicKey, config: PendingConfig) {
        let mut pending = lock(&self.pending);
        pending.retain(|_, entry| {
            let alive = entry.created.elapsed() < PENDING_CONFIG_TTL;
            if !alive {
                debug!("Dropping expired pending config for ports {:?}", entry.local_ports);
                entry.release.release();
            }
            alive
        });
        if let Some(previous) = pending.insert(key, config) {
            previous.release.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use dvpn_crypto::{IdentityKey, Keyring, SignedVerifier};
    use dvpn_network::{FixedRangePool, MappingRelease, NoopPinger, NoopPortMapper, StaticResolver};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn listener(broker: &MemoryBroker, keyring: Keyring, first_port: u16) -> Listener {
        let localhost = "127.0.0.1".parse().unwrap();
        Listener::new(
            Arc::new(broker.clone()),
            Arc::new(keyring),
            Arc::new(SignedVerifier),
            Arc::new(StaticResolver::new(localhost, localhost)),
            Arc::new(NoopPinger),
            Arc::new(FixedRangePool::new(first_port, first_port + 99).unwrap()),
            Arc::new(NoopPortMapper),
        )
        .with_config(P2PConfig::local())
    }

    #[tokio::test]
    async fn test_init_creates_pending_config() {
        let mut keyring = Keyring::new();
        let provider = keyring.insert(IdentityKey::generate().unwrap());
        let consumer = keyring.insert(IdentityKey::generate().unwrap());
        let broker = MemoryBroker::new();
        let listener = listener(&broker, keyring.clone(), 47000);
        let handle = listener.listen(provider.clone(), "wireguard", |_| {}).await.unwrap();

        let (public_key, private_key) = generate_key().unwrap();
        let init = ConfigExchangeMsg {
            public_key: public_key.to_hex(),
            config_ciphertext: Vec::new(),
        };
        let packed = pack_signed_msg(&keyring, &consumer, &init).unwrap();
        let reply = broker
            .request(
                &config_exchange_subject(&provider, "wireguard"),
                &packed,
                Duration::from_secs(2),
            )
            .await
            .unwrap();

        let signed = unpack_signed_msg(&SignedVerifier, &reply.data).unwrap();
        assert_eq!(signed.signer(), Some(provider));
        let reply: ConfigExchangeMsg = signed.payload().unwrap();
        let provider_key = PublicKey::from_hex(&reply.public_key).unwrap();
        let config = decrypt_conn_config(&reply.config_ciphertext, &private_key, &provider_key)
            .unwrap();
        assert_eq!(config.public_ip, "127.0.0.1");
        assert_eq!(config.ports.len(), REQUIRED_CONN_COUNT);
        assert_eq!(listener.pending_count(), 1);

        handle.stop();
    }

    #[tokio::test]
    async fn test_ack_without_pending_config_is_ignored() {
        let mut keyring = Keyring::new();
        let provider = keyring.insert(IdentityKey::generate().unwrap());
        let consumer = keyring.insert(IdentityKey::generate().unwrap());
        let broker = MemoryBroker::new();
        let listener = listener(&broker, keyring.clone(), 47100);
        let _handle = listener.listen(provider.clone(), "wireguard", |_| {}).await.unwrap();

        let (public_key, _) = generate_key().unwrap();
        let ack = ConfigExchangeMsg {
            public_key: public_key.to_hex(),
            config_ciphertext: vec![1, 2, 3],
        };
        let packed = pack_signed_msg(&keyring, &consumer, &ack).unwrap();
        let result = broker
            .request(
                &config_exchange_ack_subject(&provider, "wireguard"),
                &packed,
                Duration::from_millis(200),
            )
            .await;
        assert!(matches!(result, Err(P2PError::BrokerTimeout(_))));
        assert_eq!(listener.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_unsubscribes() {
        let mut keyring = Keyring::new();
        let provider = keyring.insert(IdentityKey::generate().unwrap());
        let broker = MemoryBroker::new();
        let listener = listener(&broker, keyring, 47200);
        let handle = listener.listen(provider.clone(), "wireguard", |_| {}).await.unwrap();

        let subject = config_exchange_subject(&provider, "wireguard");
        assert_eq!(broker.subscriber_count(&subject), 1);
        handle.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.is_stopped());
        assert_eq!(broker.subscriber_count(&subject), 0);
    }

    fn counted_pending(released: &Arc<AtomicUsize>, created: Instant) -> PendingConfig {
        let counter = released.clone();
        let (_, private_key) = generate_key().unwrap();
        PendingConfig {
            public_ip: "127.0.0.1".to_string(),
            local_ports: vec![47400, 47401],
            private_key,
            release: PortsRelease::new(vec![MappingRelease::new(47400, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })]),
            start: StartPorts::Direct,
            created,
        }
    }

    #[test]
    fn test_expired_pending_config_is_released() {
        let listener = listener(&MemoryBroker::new(), Keyring::new(), 47400);
        let released = Arc::new(AtomicUsize::new(0));
        let expired = Instant::now()
            .checked_sub(PENDING_CONFIG_TTL + Duration::from_secs(1))
            .unwrap();

        let (stale_key, _) = generate_key().unwrap();
        listener
            .inner
            .store_pending(stale_key, counted_pending(&released, expired));
        assert_eq!(listener.pending_count(), 1);
        assert_eq!(released.load(Ordering::SeqCst), 0);

        let fresh = Arc::new(AtomicUsize::new(0));
        let (fresh_key, _) = generate_key().unwrap();
        listener
            .inner
            .store_pending(fresh_key, counted_pending(&fresh, Instant::now()));
        assert_eq!(listener.pending_count(), 1);
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(fresh.load(Ordering::SeqCst), 0);
        assert!(lock(&listener.inner.pending).contains_key(&fresh_key));
    }

    #[test]
    fn test_repeated_init_replaces_pending_config() {
        let listener = listener(&MemoryBroker::new(), Keyring::new(), 47500);
        let (key, _) = generate_key().unwrap();

        let first = Arc::new(AtomicUsize::new(0));
        listener
            .inner
            .store_pending(key, counted_pending(&first, Instant::now()));
        let second = Arc::new(AtomicUsize::new(0));
        listener
            .inner
            .store_pending(key, counted_pending(&second, Instant::now()));

        assert_eq!(listener.pending_count(), 1);
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_contact() {
        let listener = listener(&MemoryBroker::new(), Keyring::new(), 47300);
        let contact = listener.contact();
        assert_eq!(contact.contact_type, CONTACT_TYPE);
        assert_eq!(contact.broker_addresses, vec!["memory://".to_string()]);
    }
}
