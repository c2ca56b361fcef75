//! Symmetric Encryption (XChaCha20-Poly1305)
//!
//! Authenticated encryption for config-exchange payloads and channel frames.
//! Every sealed buffer carries its own random 192-bit nonce in front of the
//! ciphertext, so a key can be reused across any number of messages.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::{AUTH_TAG_SIZE, NONCE_SIZE, SYMMETRIC_KEY_SIZE};
use crate::error::{CryptoError, CryptoResult};

/// A 256-bit symmetric key for XChaCha20-Poly1305
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey {
    bytes: [u8; SYMMETRIC_KEY_SIZE],
}

impl SymmetricKey {
    /// Create a key from raw bytes
    pub fn from_bytes(bytes: [u8; SYMMETRIC_KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Try to create from a slice
    pub fn try_from_slice(slice: &[u8]) -> CryptoResult<Self> {
        if slice.len() != SYMMETRIC_KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: SYMMETRIC_KEY_SIZE,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; SYMMETRIC_KEY_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self { bytes })
    }

    /// Generate a random key
    pub fn generate() -> CryptoResult<Self> {
        let mut bytes = [0u8; SYMMETRIC_KEY_SIZE];
        rand::rngs::OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|_| CryptoError::RngError)?;
        Ok(Self { bytes })
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; SYMMETRIC_KEY_SIZE] {
        &self.bytes
    }
}

/// Seal plaintext under `key`.
///
/// Output layout is `nonce (24) || ciphertext || tag (16)`. A fresh nonce is
/// drawn from the OS RNG on every call.
pub fn seal(key: &SymmetricKey, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new_from_slice(&key.bytes)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng
        .try_fill_bytes(&mut nonce)
        .map_err(|_| CryptoError::RngError)?;

    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed("XChaCha20-Poly1305 encryption failed".into()))?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a buffer produced by [`seal`].
///
/// Tampered input, truncated input and a wrong key all end up as an error,
/// never a panic.
pub fn open(key: &SymmetricKey, sealed: &[u8]) -> CryptoResult<Vec<u8>> {
    if sealed.len() < NONCE_SIZE + AUTH_TAG_SIZE {
        return Err(CryptoError::CiphertextTooShort(sealed.len()));
    }

    let cipher = XChaCha20Poly1305::new_from_slice(&key.bytes)
        .map_err(|_| CryptoError::DecryptionFailed)?;

    let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let key = SymmetricKey::generate().unwrap();
        let plaintext = b"Hello, p2p channel!";

        let sealed = seal(&key, plaintext).unwrap();
        assert_eq!(sealed.len(), NONCE_SIZE + plaintext.len() + AUTH_TAG_SIZE);
        assert_ne!(&sealed[NONCE_SIZE..NONCE_SIZE + plaintext.len()], plaintext);

        let opened = open(&key, &sealed).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_nonce_is_fresh_per_call() {
        let key = SymmetricKey::generate().unwrap();
        let a = seal(&key, b"same").unwrap();
        let b = seal(&key, b"same").unwrap();
        assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
    }

    #[test]
    fn test_wrong_key_fails() {
        let key1 = SymmetricKey::generate().unwrap();
        let key2 = SymmetricKey::generate().unwrap();

        let sealed = seal(&key1, b"Test message").unwrap();
        assert!(matches!(open(&key2, &sealed), Err(CryptoError::DecryptionFailed)));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = SymmetricKey::generate().unwrap();
        let mut sealed = seal(&key, b"Test message").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;

        assert!(open(&key, &sealed).is_err());
    }

    #[test]
    fn test_truncated_input_fails() {
        let key = SymmetricKey::generate().unwrap();
        assert!(matches!(
            open(&key, &[0u8; 10]),
            Err(CryptoError::CiphertextTooShort(10))
        ));
    }
}
