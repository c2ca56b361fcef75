//! Node Identity Signing
//!
//! Long-lived Ed25519 identities sign every config-exchange message that
//! travels through the broker. Each node has:
//! - an [`IdentityKey`] (Ed25519 signing key) kept in a [`Keyring`]
//! - an [`Identity`] address, the hex of the verifying key
//!
//! A [`Signature`] embeds the signer's verifying key next to the Ed25519
//! signature so that a receiver can check both "is this signature valid" and
//! "is it from someone I accept" without a separate key lookup.

use std::collections::HashMap;
use std::sync::Arc;

use ed25519_dalek::{
    Signature as Ed25519Sig, Signer as _, SigningKey, Verifier as _, VerifyingKey,
};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::constants::{ED25519_PUBKEY_SIZE, ED25519_SIGNATURE_SIZE, SIGNATURE_SIZE};
use crate::error::{CryptoError, CryptoResult};

/// Identity address: lowercase hex of the Ed25519 verifying key
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity {
    address: String,
}

/// Signature over a broker message, including the signer's verifying key
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    signer: [u8; ED25519_PUBKEY_SIZE],
    bytes: [u8; ED25519_SIGNATURE_SIZE],
}

/// Anything that can sign on behalf of one identity
pub trait Signer: Send + Sync {
    /// Identity the signatures are attributed to
    fn identity(&self) -> Identity;

    /// Sign `data`
    fn sign(&self, data: &[u8]) -> CryptoResult<Signature>;
}

/// Hands out signers for the identities a node controls
pub trait SignerFactory: Send + Sync {
    /// Signer for `identity`, or `UnknownIdentity` if it is not held locally
    fn signer(&self, identity: &Identity) -> CryptoResult<Arc<dyn Signer>>;
}

/// Checks signatures on incoming broker messages.
///
/// Never fails loudly: callers branch on the returned bool and drop the
/// message when it is `false`.
pub trait Verifier: Send + Sync {
    fn verify(&self, data: &[u8], signature: &[u8]) -> bool;
}

impl Identity {
    /// Parse an address, normalizing to lowercase without `0x`
    pub fn from_address(address: &str) -> CryptoResult<Self> {
        let bytes = hex::decode(address.strip_prefix("0x").unwrap_or(address))?;
        if bytes.len() != ED25519_PUBKEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: ED25519_PUBKEY_SIZE,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            address: hex::encode(&bytes),
        })
    }

    fn from_verifying_key(key: &VerifyingKey) -> Self {
        Self {
            address: hex::encode(key.as_bytes()),
        }
    }

    /// Hex address
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Raw verifying key bytes behind the address
    pub fn key_bytes(&self) -> CryptoResult<[u8; ED25519_PUBKEY_SIZE]> {
        let bytes = hex::decode(&self.address)?;
        bytes.try_into().map_err(|_| CryptoError::InvalidPublicKey)
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({})", &self.address[..self.address.len().min(8)])
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.address)
    }
}

impl Signature {
    /// Parse the wire form produced by [`Signature::to_bytes`]
    pub fn try_from_slice(slice: &[u8]) -> CryptoResult<Self> {
        if slice.len() != SIGNATURE_SIZE {
            return Err(CryptoError::InvalidSignature);
        }
        let mut signer = [0u8; ED25519_PUBKEY_SIZE];
        let mut bytes = [0u8; ED25519_SIGNATURE_SIZE];
        signer.copy_from_slice(&slice[..ED25519_PUBKEY_SIZE]);
        bytes.copy_from_slice(&slice[ED25519_PUBKEY_SIZE..]);
        Ok(Self { signer, bytes })
    }

    /// `signer (32) || ed25519 signature (64)`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SIGNATURE_SIZE);
        out.extend_from_slice(&self.signer);
        out.extend_from_slice(&self.bytes);
        out
    }

    /// Identity that produced this signature
    pub fn signer(&self) -> Identity {
        Identity {
            address: hex::encode(&self.signer),
        }
    }

    /// Check the signature against its embedded signer key
    pub fn is_valid_for(&self, data: &[u8]) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.signer) else {
            return false;
        };
        key.verify(data, &Ed25519Sig::from_bytes(&self.bytes)).is_ok()
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature(by {})", &hex::encode(&self.signer)[..8])
    }
}

/// Ed25519 identity key
pub struct IdentityKey {
    signing_key: SigningKey,
    identity: Identity,
}

impl IdentityKey {
    /// Generate a new random identity key
    pub fn generate() -> CryptoResult<Self> {
        let mut seed = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut seed)
            .map_err(|_| CryptoError::RngError)?;
        Ok(Self::from_bytes(seed))
    }

    /// Restore from the 32-byte secret seed
    pub fn from_bytes(seed: [u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(&seed);
        let identity = Identity::from_verifying_key(&signing_key.verifying_key());
        Self {
            signing_key,
            identity,
        }
    }

    /// Restore from a slice, e.g. a key file
    pub fn try_from_slice(slice: &[u8]) -> CryptoResult<Self> {
        let seed: [u8; 32] = slice.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: 32,
            actual: slice.len(),
        })?;
        Ok(Self::from_bytes(seed))
    }

    /// Export the secret seed for storage
    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

impl Signer for IdentityKey {
    fn identity(&self) -> Identity {
        self.identity.clone()
    }

    fn sign(&self, data: &[u8]) -> CryptoResult<Signature> {
        let sig = self.signing_key.sign(data);
        Ok(Signature {
            signer: self.signing_key.verifying_key().to_bytes(),
            bytes: sig.to_bytes(),
        })
    }
}

/// Registry of identity keys held by this process
#[derive(Default, Clone)]
pub struct Keyring {
    keys: HashMap<Identity, Arc<IdentityKey>>,
}

impl Keyring {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key, returning its identity
    pub fn insert(&mut self, key: IdentityKey) -> Identity {
        let identity = key.identity.clone();
        self.keys.insert(identity.clone(), Arc::new(key));
        identity
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.keys.contains_key(identity)
    }

    pub fn identities(&self) -> impl Iterator<Item = &Identity> {
        self.keys.keys()
    }
}

impl SignerFactory for Keyring {
    fn signer(&self, identity: &Identity) -> CryptoResult<Arc<dyn Signer>> {
        self.keys
            .get(identity)
            .map(|key| key.clone() as Arc<dyn Signer>)
            .ok_or_else(|| CryptoError::UnknownIdentity(identity.to_string()))
    }
}

/// Accepts any well-formed signature whose embedded key verifies the data
#[derive(Debug, Default, Clone, Copy)]
pub struct SignedVerifier;

impl Verifier for SignedVerifier {
    fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        Signature::try_from_slice(signature)
            .map(|sig| sig.is_valid_for(data))
            .unwrap_or(false)
    }
}

/// Accepts signatures only from a fixed set of identities
#[derive(Debug, Clone)]
pub struct IdentityVerifier {
    allowed: Vec<Identity>,
}

impl IdentityVerifier {
    pub fn new(allowed: impl IntoIterator<Item = Identity>) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
        }
    }
}

impl Verifier for IdentityVerifier {
    fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        let Ok(sig) = Signature::try_from_slice(signature) else {
            return false;
        };
        self.allowed.contains(&sig.signer()) && sig.is_valid_for(data)
    }
}
