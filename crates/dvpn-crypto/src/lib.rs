//! dVPN Cryptographic Primitives
//!
//! This crate provides the cryptography used to bootstrap p2p channels:
//! - Ephemeral session keys (X25519)
//! - Sealed boxes between two session keys (HKDF-SHA256 + XChaCha20-Poly1305)
//! - Identity signatures on broker messages (Ed25519)

pub mod keys;
pub mod symmetric;
pub mod identity;
pub mod error;

pub use keys::{generate_key, PrivateKey, PublicKey, SharedSecret};
pub use symmetric::{open, seal, SymmetricKey};
pub use identity::{
    Identity, IdentityKey, IdentityVerifier, Keyring, Signature, SignedVerifier, Signer,
    SignerFactory, Verifier,
};
pub use error::{CryptoError, CryptoResult};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::keys::*;
    pub use crate::symmetric::*;
    pub use crate::identity::*;
    pub use crate::error::*;
}

/// Protocol constants
pub mod constants {
    /// X25519 key size in bytes
    pub const X25519_KEY_SIZE: usize = 32;

    /// XChaCha20-Poly1305 key size
    pub const SYMMETRIC_KEY_SIZE: usize = 32;

    /// XChaCha20-Poly1305 nonce size
    pub const NONCE_SIZE: usize = 24;

    /// Poly1305 authentication tag size
    pub const AUTH_TAG_SIZE: usize = 16;

    /// Ed25519 public key size
    pub const ED25519_PUBKEY_SIZE: usize = 32;

    /// Ed25519 signature size
    pub const ED25519_SIGNATURE_SIZE: usize = 64;

    /// Wire signature size: signer key followed by the Ed25519 signature
    pub const SIGNATURE_SIZE: usize = ED25519_PUBKEY_SIZE + ED25519_SIGNATURE_SIZE;

    /// HKDF info for config-exchange sealed boxes
    pub const BOX_KEY_INFO: &[u8] = b"dvpn:p2p:box";

    /// HKDF info for channel frame encryption
    pub const CHANNEL_KEY_INFO: &[u8] = b"dvpn:p2p:channel";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_exchange_flow() {
        // Long-lived identities for both sides
        let mut keyring = Keyring::new();
        let consumer = keyring.insert(IdentityKey::generate().unwrap());
        let provider = keyring.insert(IdentityKey::generate().unwrap());

        // Fresh session keys per exchange
        let (consumer_pub, consumer_priv) = generate_key().unwrap();
        let (provider_pub, provider_priv) = generate_key().unwrap();

        // Provider seals its config for the consumer and signs the envelope
        let config = b"ip=1.2.3.4 ports=40001,40002";
        let sealed = provider_priv.encrypt(&consumer_pub, config).unwrap();
        let signature = keyring
            .signer(&provider)
            .unwrap()
            .sign(&sealed)
            .unwrap()
            .to_bytes();

        // Consumer only trusts the provider it dialed
        let verifier = IdentityVerifier::new([provider.clone()]);
        assert!(verifier.verify(&sealed, &signature));
        assert!(!IdentityVerifier::new([consumer]).verify(&sealed, &signature));

        let opened = consumer_priv.decrypt(&provider_pub, &sealed).unwrap();
        assert_eq!(opened, config);
    }
}
