//! X25519 Session Keys
//!
//! Every config exchange generates a fresh keypair on each side. The pair is
//! never persisted: it lives in the pending exchange state and in the channel
//! built from it. Both peers derive the same symmetric keys from
//! `DH(own_private, peer_public)`, so payloads sealed by one side open on the
//! other.

use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::ZeroizeOnDrop;

use crate::constants::{BOX_KEY_INFO, CHANNEL_KEY_INFO, SYMMETRIC_KEY_SIZE, X25519_KEY_SIZE};
use crate::error::{CryptoError, CryptoResult};
use crate::symmetric::{self, SymmetricKey};

/// A X25519 public key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey {
    bytes: [u8; X25519_KEY_SIZE],
}

/// A X25519 private key
#[derive(ZeroizeOnDrop)]
pub struct PrivateKey {
    inner: StaticSecret,
}

/// Raw Diffie-Hellman output, only ever used as HKDF input
#[derive(ZeroizeOnDrop)]
pub struct SharedSecret {
    bytes: [u8; SYMMETRIC_KEY_SIZE],
}

/// Generate a fresh session keypair.
///
/// Fails only when the OS entropy source cannot be read.
pub fn generate_key() -> CryptoResult<(PublicKey, PrivateKey)> {
    let mut seed = [0u8; X25519_KEY_SIZE];
    OsRng
        .try_fill_bytes(&mut seed)
        .map_err(|_| CryptoError::RngError)?;
    let private = PrivateKey::from_bytes(seed);
    Ok((private.public_key(), private))
}

impl PublicKey {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; X25519_KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Try to create from a slice
    pub fn try_from_slice(slice: &[u8]) -> CryptoResult<Self> {
        if slice.len() != X25519_KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: X25519_KEY_SIZE,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; X25519_KEY_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self { bytes })
    }

    /// Decode from the hex form carried in exchange messages
    pub fn from_hex(s: &str) -> CryptoResult<Self> {
        let bytes = hex::decode(s)?;
        Self::try_from_slice(&bytes)
    }

    /// Lowercase hex form
    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; X25519_KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", &self.to_hex()[..8])
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl PrivateKey {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; X25519_KEY_SIZE]) -> Self {
        Self {
            inner: StaticSecret::from(bytes),
        }
    }

    /// Get the corresponding public key
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            bytes: X25519Public::from(&self.inner).to_bytes(),
        }
    }

    /// Perform Diffie-Hellman key exchange
    pub fn diffie_hellman(&self, their_public: &PublicKey) -> SharedSecret {
        let shared = self
            .inner
            .diffie_hellman(&X25519Public::from(their_public.bytes));
        SharedSecret {
            bytes: shared.to_bytes(),
        }
    }

    /// Seal `plaintext` so that only the holder of `peer`'s private key can open it.
    pub fn encrypt(&self, peer: &PublicKey, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        let key = self.diffie_hellman(peer).derive_key(BOX_KEY_INFO)?;
        symmetric::seal(&key, plaintext)
    }

    /// Open a payload sealed by `peer` for this key.
    ///
    /// A mismatched keypair or tampered input yields `DecryptionFailed`.
    pub fn decrypt(&self, peer: &PublicKey, ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
        let key = self.diffie_hellman(peer).derive_key(BOX_KEY_INFO)?;
        symmetric::open(&key, ciphertext)
    }

    /// Key used for channel frames between this key and `peer`
    pub fn channel_key(&self, peer: &PublicKey) -> CryptoResult<SymmetricKey> {
        self.diffie_hellman(peer).derive_key(CHANNEL_KEY_INFO)
    }

    /// Export raw bytes (use with caution!)
    pub fn to_bytes(&self) -> [u8; X25519_KEY_SIZE] {
        self.inner.to_bytes()
    }
}

impl Clone for PrivateKey {
    fn clone(&self) -> Self {
        Self::from_bytes(self.to_bytes())
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}

impl SharedSecret {
    /// Derive a symmetric key bound to `info` with HKDF-SHA256
    pub fn derive_key(&self, info: &[u8]) -> CryptoResult<SymmetricKey> {
        let hkdf = Hkdf::<Sha256>::new(None, &self.bytes);
        let mut okm = [0u8; SYMMETRIC_KEY_SIZE];
        hkdf.expand(info, &mut okm)
            .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;
        Ok(SymmetricKey::from_bytes(okm))
    }

    /// Get the shared secret bytes
    pub fn as_bytes(&self) -> &[u8; SYMMETRIC_KEY_SIZE] {
        &self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_exchange() {
        let (alice_pub, alice) = generate_key().unwrap();
        let (bob_pub, bob) = generate_key().unwrap();

        let alice_shared = alice.diffie_hellman(&bob_pub);
        let bob_shared = bob.diffie_hellman(&alice_pub);

        assert_eq!(alice_shared.as_bytes(), bob_shared.as_bytes());
    }

    #[test]
    fn test_encrypt_decrypt_inverse() {
        for len in [0usize, 1, 65, 1024] {
            let (pub_a, priv_a) = generate_key().unwrap();
            let (pub_b, priv_b) = generate_key().unwrap();
            let msg: Vec<u8> = (0..len).map(|i| (i * 7) as u8).collect();

            let ciphertext = priv_a.encrypt(&pub_b, &msg).unwrap();
            let plaintext = priv_b.decrypt(&pub_a, &ciphertext).unwrap();
            assert_eq!(plaintext, msg);
        }
    }

    #[test]
    fn test_mismatched_keys_fail() {
        let (_, priv_a) = generate_key().unwrap();
        let (pub_b, _) = generate_key().unwrap();
        let (_, priv_c) = generate_key().unwrap();

        let ciphertext = priv_a.encrypt(&pub_b, b"config").unwrap();
        let stranger = priv_c.decrypt(&priv_a.public_key(), &ciphertext);
        assert!(matches!(stranger, Err(CryptoError::DecryptionFailed)));
    }

    #[test]
    fn test_channel_key_differs_from_box_key() {
        let (pub_a, priv_a) = generate_key().unwrap();
        let (pub_b, priv_b) = generate_key().unwrap();

        let k1 = priv_a.channel_key(&pub_b).unwrap();
        let k2 = priv_b.channel_key(&pub_a).unwrap();
        assert_eq!(k1.as_bytes(), k2.as_bytes());

        let boxed = priv_a.encrypt(&pub_b, b"x").unwrap();
        assert!(symmetric::open(&k1, &boxed).is_err());
    }

    #[test]
    fn test_public_key_hex() {
        let (public, _) = generate_key().unwrap();
        let restored = PublicKey::from_hex(&public.to_hex()).unwrap();
        assert_eq!(public, restored);

        assert!(PublicKey::from_hex("abcd").is_err());
        assert!(PublicKey::from_hex("zz").is_err());
    }
}
