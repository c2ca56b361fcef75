//! Consumer side of the config exchange
//!
//! `dial` sends the consumer's session key to the provider, opens the
//! provider's sealed config, answers with its own, then either dials the
//! provider directly or punches through NAT. The channel is returned once
//! the provider says its handlers are installed, or once that signal is
//! overdue.

use std::sync::Arc;
use std::time::Duration;

use dvpn_crypto::{generate_key, Identity, PublicKey, SignerFactory, Verifier};
use dvpn_network::pinger::CONSUMER_INITIAL_TTL;
use dvpn_network::{
    acquire_local_ports, dial_pairs, stun_ports, IpResolver, NatPinger, NetworkError,
    PortSupplier, PING_MAX_PORTS, REQUIRED_CONN_COUNT,
};
use tracing::{debug, info, trace, warn};

use crate::broker::{connect_with_retry, BrokerConnection, BrokerConnector, Subscription};
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

/// Creates channels on the consumer side
pub struct Dialer {
    broker: Arc<dyn BrokerConnector>,
    broker_addresses: Vec<String>,
    signers: Arc<dyn SignerFactory>,
    verifier: Arc<dyn Verifier>,
    ip_resolver: Arc<dyn IpResolver>,
    pinger: Arc<dyn NatPinger>,
    ports: Arc<dyn PortSupplier>,
    config: P2PConfig,
}

impl Dialer {
    pub fn new(
        broker: Arc<dyn BrokerConnector>,
        signers: Arc<dyn SignerFactory>,
        verifier: Arc<dyn Verifier>,
        ip_resolver: Arc<dyn IpResolver>,
        pinger: Arc<dyn NatPinger>,
        ports: Arc<dyn PortSupplier>,
    ) -> Self {
        Self {
            broker,
            broker_addresses: Vec::new(),
            signers,
            verifier,
            ip_resolver,
            pinger,
            ports,
            config: P2PConfig::default(),
        }
    }

    pub fn with_config(mut self, config: P2PConfig) -> Self {
        self.config = config;
        self
    }

    /// Broker addresses from the provider's contact
    pub fn with_broker_addresses(mut self, addresses: Vec<String>) -> Self {
        self.broker_addresses = addresses;
        self
    }

    /// Exchange configs with `provider_id` for `service_type` and open a
    /// channel. `timeout` bounds each broker round trip.
    pub async fn dial(
        &self,
        consumer_id: &Identity,
        provider_id: &Identity,
        service_type: &str,
        timeout: Duration,
    ) -> P2PResult<Channel> {
        let conn = connect_with_retry(
            self.broker.as_ref(),
            &self.broker_addresses,
            self.config.broker_connect_attempts,
            self.config.broker_connect_retry,
        )
        .await?;

        let mut exchange = Exchange::new(provider_id.address());
        let result = self
            .dial_over(conn.as_ref(), &mut exchange, consumer_id, provider_id, service_type, timeout)
            .await;
        conn.close().await;

        match &result {
            Ok(channel) => info!(
                "Channel to provider {} for {} established at {}",
                provider_id,
                service_type,
                channel.peer_addr()
            ),
            Err(e) => {
                warn!("Dial to provider {} failed in {}: {}", provider_id, exchange.state(), e);
                exchange.advance(ExchangeState::Failed);
            }
        }
        result
    }

    async fn dial_over(
        &self,
        conn: &dyn BrokerConnection,
        exchange: &mut Exchange,
        consumer_id: &Identity,
        provider_id: &Identity,
        service_type: &str,
        timeout: Duration,
    ) -> P2PResult<Channel> {
        // Subscribe first so the signal cannot be missed
        let mut ready = conn
            .subscribe(&channel_handlers_ready_subject(provider_id, service_type))
            .await?;

        let (public_key, private_key) = generate_key()?;
        exchange.advance(ExchangeState::KeysGenerated);

        let init = ConfigExchangeMsg {
            public_key: public_key.to_hex(),
            config_ciphertext: Vec::new(),
        };
        debug!(
            "Consumer {} sending public key {} to provider {}",
            consumer_id, init.public_key, provider_id
        );
        let packed = pack_signed_msg(self.signers.as_ref(), consumer_id, &init)?;
        let subject = config_exchange_subject(provider_id, service_type);
        exchange.advance(ExchangeState::InitSent);
        let reply = send_signed_msg(conn, &subject, &packed, timeout).await?;

        let signed = unpack_signed_msg(self.verifier.as_ref(), &reply)?;
        let reply: ConfigExchangeMsg = signed.payload()?;
        let peer_public_key = PublicKey::from_hex(&reply.public_key)?;
        let peer_config =
            decrypt_conn_config(&reply.config_ciphertext, &private_key, &peer_public_key)?;
        exchange.advance(ExchangeState::PeerConfigReceived);
        debug!("Consumer {} received provider config {:?}", consumer_id, peer_config);

        let peer_ports = peer_config.ports.len();
        if !(REQUIRED_CONN_COUNT..=PING_MAX_PORTS).contains(&peer_ports) {
            return Err(P2PError::Network(NetworkError::ConfigError(format!(
                "provider advertised {} ports",
                peer_ports
            ))));
        }
        let direct = peer_ports == REQUIRED_CONN_COUNT;

        let public_ip = self.ip_resolver.public_ip().await?;
        let local_ports = acquire_local_ports(self.ports.as_ref(), peer_ports)?;
        let advertised = if direct {
            local_ports.clone()
        } else {
            stun_ports(&self.config.stun_servers, &local_ports).await
        };
        let own_config = ConnectConfig {
            public_ip: public_ip.to_string(),
            ports: advertised,
            compatibility: compatibility_level(self.config.wire_format),
        };
        let ack = ConfigExchangeMsg {
            public_key: public_key.to_hex(),
            config_ciphertext: encrypt_conn_config(&own_config, &private_key, &peer_public_key)?,
        };
        debug!("Consumer {} sending ack with encrypted config to provider {}", consumer_id, provider_id);
        let packed = pack_signed_msg(self.signers.as_ref(), consumer_id, &ack)?;
        let ack_subject = config_exchange_ack_subject(provider_id, service_type);
        let ack_reply = send_signed_msg(conn, &ack_subject, &packed, timeout).await?;
        if ack_reply != ACK_OK {
            trace!("Unexpected ack reply {:?}", String::from_utf8_lossy(&ack_reply));
        }
        exchange.advance(ExchangeState::AckSent);

        // The provider publishes its ack reply before it starts pinging
        let peer_ip = peer_ip(&own_config.public_ip, &peer_config.public_ip)?;
        let conns = if direct {
            debug!("Skipping provider ping");
            dial_pairs(peer_ip, &local_ports, &peer_config.ports).await?
        } else {
            // Give the provider's low TTL pings a head start
            tokio::time::sleep(self.pinger.ping_interval() * 2).await;
            debug!(
                "Pinging provider {} at {} using ports {:?}:{:?}",
                provider_id, peer_ip, local_ports, peer_config.ports
            );
            self.pinger
                .ping_provider_peer(
                    None,
                    peer_ip,
                    &local_ports,
                    &peer_config.ports,
                    CONSUMER_INITIAL_TTL,
                    REQUIRED_CONN_COUNT,
                )
                .await?
        };

        if self.wait_handlers_ready(&mut ready, &public_key).await {
            exchange.advance(ExchangeState::HandlersReady);
        }

        let wire = negotiate_wire_format(self.config.wire_format, peer_config.compatibility);
        let (channel, service_conn) =
            open_channel(conns, &private_key, &peer_public_key, wire, &self.config)?;
        if let Some(service_conn) = service_conn {
            channel.set_service_conn(service_conn);
        }
        exchange.advance(ExchangeState::Established);
        Ok(channel)
    }

    /// Wait for the provider's signal meant for `own_key`. Overdue signals
    /// are tolerated; older providers never send one.
    async fn wait_handlers_ready(&self, ready: &mut Subscription, own_key: &PublicKey) -> bool {
        let wait = async {
            while let Some(msg) = ready.next().await {
                let signal = unpack_signed_msg(self.verifier.as_ref(), &msg.data)
                    .and_then(|signed| signed.payload::<HandlersReady>());
                match signal {
                    Ok(signal) if signal.is_for(own_key) => return true,
                    Ok(_) => trace!("Handlers ready signal for another consumer"),
                    Err(e) => warn!("Channel handlers ready message rejected: {}", e),
                }
            }
            false
        };
        match tokio::time::timeout(self.config.handlers_ready_timeout, wait).await {
            Ok(true) => {
                debug!("Received handlers ready message from provider");
                true
            }
            _ => {
                warn!(
                    "No handlers ready message within {:?}, continuing",
                    self.config.handlers_ready_timeout
                );
                false
            }
        }
    }
}

async fn send_signed_msg(
    conn: &dyn BrokerConnection,
    subject: &str,
    msg: &[u8],
    timeout: Duration,
) -> P2PResult<Vec<u8>> {
    match conn.request(subject, msg, timeout).await {
        Ok(reply) => Ok(reply.data),
        Err(P2PError::BrokerTimeout(_)) => Err(P2PError::HandshakeTimeout),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use dvpn_crypto::{IdentityKey, Keyring, SignedVerifier};
    use dvpn_network::{FixedRangePool, NoopPinger, StaticResolver};

    #[tokio::test]
    async fn test_dial_without_provider_times_out() {
        let mut keyring = Keyring::new();
        let consumer = keyring.insert(IdentityKey::generate().unwrap());
        let provider = keyring.insert(IdentityKey::generate().unwrap());
        let broker = MemoryBroker::new();

        let localhost = "127.0.0.1".parse().unwrap();
        let dialer = Dialer::new(
            Arc::new(broker.clone()),
            Arc::new(keyring),
            Arc::new(SignedVerifier),
            Arc::new(StaticResolver::new(localhost, localhost)),
            Arc::new(NoopPinger),
            Arc::new(FixedRangePool::new(46000, 46099).unwrap()),
        )
        .with_config(P2PConfig::local());

        let result = dialer
            .dial(&consumer, &provider, "wireguard", Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(P2PError::HandshakeTimeout)));
        // The handlers ready subscription is gone with the failed dial
        assert_eq!(
            broker.subscriber_count(&channel_handlers_ready_subject(&provider, "wireguard")),
            0
        );
    }
}
