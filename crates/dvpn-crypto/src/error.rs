//! Cryptographic error types

use thiserror::Error;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Invalid key length provided
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Encryption failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed (authentication failed, wrong key or corrupted data)
    #[error("Decryption failed: authentication or integrity check failed")]
    DecryptionFailed,

    /// Sealed box is shorter than nonce plus tag
    #[error("Ciphertext too short: {0} bytes")]
    CiphertextTooShort(usize),

    /// Invalid signature format
    #[error("Invalid signature format")]
    InvalidSignature,

    /// Key derivation failed
    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    /// Invalid public key
    #[error("Invalid public key")]
    InvalidPublicKey,

    /// No signing key registered for identity
    #[error("Unknown identity: {0}")]
    UnknownIdentity(String),

    /// Hex or byte decoding error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Random number generation failed
    #[error("Random number generation failed")]
    RngError,
}

impl From<hex::FromHexError> for CryptoError {
    fn from(err: hex::FromHexError) -> Self {
        CryptoError::SerializationError(err.to_string())
    }
}

/// Result type for cryptographic operations
pub type CryptoResult<T> = Result<T, CryptoError>;
