//! Config Exchange Messages
//!
//! Everything the handshake puts on the broker is a [`SignedMsg`]: the
//! bincode of an inner message plus the sender's identity signature over
//! exactly those bytes. Receivers verify before decoding the inner message.
//!
//! Subjects are scoped by provider identity and service type:
//! - `<provider>.<service>.p2p-config-exchange` (init, request/reply)
//! - `<provider>.<service>.p2p-config-exchange-ack` (ack, request/reply)
//! - `<provider>.<service>.p2p-channel-handlers-ready` (publish)

use bincode::Options;
use dvpn_crypto::{Identity, PrivateKey, PublicKey, SignerFactory, Verifier};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{P2PError, P2PResult};

/// Upper bound for any broker payload
pub const MAX_BROKER_MSG_LEN: u64 = 64 * 1024;

/// Value carried by [`HandlersReady`]
pub const HANDLERS_READY: &str = "HANDLERS READY";

/// Reply body of a successful ack
pub const ACK_OK: &[u8] = b"OK";

/// Level advertised by peers able to speak the binary wire format
pub const COMPATIBILITY_BINARY: u32 = 1;

/// Reserved channel topics
pub mod topic {
    pub const KEEPALIVE: &str = "p2p-keepalive";
}

/// Signed envelope for broker messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedMsg {
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

impl SignedMsg {
    /// Identity behind the signature, if it parses
    pub fn signer(&self) -> Option<Identity> {
        dvpn_crypto::Signature::try_from_slice(&self.signature)
            .ok()
            .map(|s| s.signer())
    }

    /// Decode the signed payload
    pub fn payload<T: DeserializeOwned>(&self) -> P2PResult<T> {
        decode(&self.data)
    }
}

/// Init and ack message of the config exchange
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigExchangeMsg {
    /// Hex of the sender's session public key
    pub public_key: String,

    /// Sealed [`ConnectConfig`]; empty on the consumer's init
    #[serde(with = "serde_bytes")]
    pub config_ciphertext: Vec<u8>,
}

/// Where a peer can be reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectConfig {
    pub public_ip: String,
    pub ports: Vec<u16>,
    #[serde(default)]
    pub compatibility: u32,
}

/// Provider's signal that channel handlers are installed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlersReady {
    pub value: String,

    /// Session public key of the consumer this signal is meant for
    pub peer_public_key: String,
}

impl HandlersReady {
    pub fn new(peer: &PublicKey) -> Self {
        Self {
            value: HANDLERS_READY.to_string(),
            peer_public_key: peer.to_hex(),
        }
    }

    /// Whether this is a well-formed signal for `own` session key
    pub fn is_for(&self, own: &PublicKey) -> bool {
        self.value == HANDLERS_READY && self.peer_public_key == own.to_hex()
    }
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_BROKER_MSG_LEN)
}

/// Serialize a broker payload
pub fn encode<T: Serialize>(msg: &T) -> P2PResult<Vec<u8>> {
    Ok(codec().serialize(msg)?)
}

/// Deserialize a broker payload
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> P2PResult<T> {
    Ok(codec().deserialize(data)?)
}

/// Serialize `msg`, sign the bytes as `identity` and wrap both
pub fn pack_signed_msg<T: Serialize>(
    signers: &dyn SignerFactory,
    identity: &Identity,
    msg: &T,
) -> P2PResult<Vec<u8>> {
    let data = encode(msg)?;
    let signature = signers.signer(identity)?.sign(&data)?;
    encode(&SignedMsg {
        data,
        signature: signature.to_bytes(),
    })
}

/// Unwrap a signed message, rejecting it unless the signature verifies.
///
/// The inner payload is left untouched so nothing attacker-controlled is
/// decoded before verification.
pub fn unpack_signed_msg(verifier: &dyn Verifier, data: &[u8]) -> P2PResult<SignedMsg> {
    let signed: SignedMsg = decode(data)?;
    if !verifier.verify(&signed.data, &signed.signature) {
        debug!("Dropping broker message with invalid signature");
        return Err(P2PError::InvalidSignature);
    }
    trace!("Verified message signed by {:?}", signed.signer());
    Ok(signed)
}

/// Seal a [`ConnectConfig`] for `peer`
pub fn encrypt_conn_config(
    config: &ConnectConfig,
    private: &PrivateKey,
    peer: &PublicKey,
) -> P2PResult<Vec<u8>> {
    let plain = encode(config)?;
    Ok(private.encrypt(peer, &plain)?)
}

/// Open a [`ConnectConfig`] sealed by `peer`
pub fn decrypt_conn_config(
    ciphertext: &[u8],
    private: &PrivateKey,
    peer: &PublicKey,
) -> P2PResult<ConnectConfig> {
    let plain = private.decrypt(peer, ciphertext)?;
    decode(&plain)
}

pub fn config_exchange_subject(provider: &Identity, service_type: &str) -> String {
    format!("{}.{}.p2p-config-exchange", provider.address(), service_type)
}

pub fn config_exchange_ack_subject(provider: &Identity, service_type: &str) -> String {
    format!("{}.{}.p2p-config-exchange-ack", provider.address(), service_type)
}

pub fn channel_handlers_ready_subject(provider: &Identity, service_type: &str) -> String {
    format!("{}.{}.p2p-channel-handlers-ready", provider.address(), service_type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dvpn_crypto::{generate_key, IdentityKey, IdentityVerifier, Keyring, SignedVerifier};

    fn keyring() -> (Keyring, Identity) {
        let mut keyring = Keyring::new();
        let id = keyring.insert(IdentityKey::generate().unwrap());
        (keyring, id)
    }

    #[test]
    fn test_pack_unpack_signed_msg() {
        let (keyring, id) = keyring();
        let msg = ConfigExchangeMsg {
            public_key: "abcd".into(),
            config_ciphertext: vec![1, 2, 3],
        };
        let packed = pack_signed_msg(&keyring, &id, &msg).unwrap();

        let signed = unpack_signed_msg(&SignedVerifier, &packed).unwrap();
        assert_eq!(signed.signer(), Some(id));
        let decoded: ConfigExchangeMsg = signed.payload().unwrap();
        assert_eq!(decoded.public_key, "abcd");
        assert_eq!(decoded.config_ciphertext, vec![1, 2, 3]);
    }

    #[test]
    fn test_unpack_rejects_other_identity() {
        let (keyring, id) = keyring();
        let (_, other) = self::keyring();
        let packed = pack_signed_msg(&keyring, &id, &ConfigExchangeMsg::default()).unwrap();

        let result = unpack_signed_msg(&IdentityVerifier::new([other]), &packed);
        assert!(matches!(result, Err(P2PError::InvalidSignature)));
    }

    #[test]
    fn test_unpack_rejects_tampered_data() {
        let (keyring, id) = keyring();
        let packed = pack_signed_msg(&keyring, &id, &ConfigExchangeMsg::default()).unwrap();
        let mut signed: SignedMsg = decode(&packed).unwrap();
        signed.data.push(0);
        let tampered = encode(&signed).unwrap();

        assert!(matches!(
            unpack_signed_msg(&SignedVerifier, &tampered),
            Err(P2PError::InvalidSignature)
        ));
        assert!(unpack_signed_msg(&SignedVerifier, b"garbage").is_err());
    }

    #[test]
    fn test_conn_config_encryption() {
        let (consumer_pub, consumer_priv) = generate_key().unwrap();
        let (provider_pub, provider_priv) = generate_key().unwrap();
        let config = ConnectConfig {
            public_ip: "1.2.3.4".into(),
            ports: vec![40001, 40002],
            compatibility: COMPATIBILITY_BINARY,
        };

        let sealed = encrypt_conn_config(&config, &provider_priv, &consumer_pub).unwrap();
        let opened = decrypt_conn_config(&sealed, &consumer_priv, &provider_pub).unwrap();
        assert_eq!(opened, config);

        let (_, stranger) = generate_key().unwrap();
        assert!(decrypt_conn_config(&sealed, &stranger, &provider_pub).is_err());
    }

    #[test]
    fn test_handlers_ready_is_for() {
        let (own, _) = generate_key().unwrap();
        let (other, _) = generate_key().unwrap();
        let ready = HandlersReady::new(&own);
        assert!(ready.is_for(&own));
        assert!(!ready.is_for(&other));
    }

    #[test]
    fn test_subjects() {
        let (_, id) = keyring();
        assert_eq!(
            config_exchange_subject(&id, "wireguard"),
            format!("{}.wireguard.p2p-config-exchange", id.address())
        );
        assert!(config_exchange_ack_subject(&id, "wireguard").ends_with("p2p-config-exchange-ack"));
        assert!(channel_handlers_ready_subject(&id, "wireguard")
            .ends_with(".wireguard.p2p-channel-handlers-ready"));
    }
}
