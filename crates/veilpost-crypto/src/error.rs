//! Error types for cryptographic operations

use thiserror::Error;

use crate::hierarchy::KdfAlgorithm;

/// Errors from key derivation, encryption and envelope handling.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Identity record was sealed under a different KDF algorithm than the
    /// live master key. Never retried with the other algorithm.
    #[error("key derivation algorithm mismatch: record uses {record}, master key uses {live}")]
    AlgorithmMismatch {
        /// Algorithm recorded next to the ciphertext
        record: KdfAlgorithm,
        /// Algorithm of the master key in hand
        live: KdfAlgorithm,
    },

    /// Identity record could not be opened (wrong secret or tampered record)
    #[error("decryption failed")]
    DecryptionFailed,

    /// Payload MAC or AEAD tag did not verify
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Payload is not a well-formed versioned ciphertext
    #[error("invalid ciphertext: {reason}")]
    InvalidCiphertext {
        /// What was wrong with the payload
        reason: &'static str,
    },

    /// A decoded length prefix is outside its admissible range
    #[error("invalid padding length: {reason}")]
    InvalidPaddingLength {
        /// What was wrong with the length prefix
        reason: &'static str,
    },

    /// Plaintext is empty or longer than the protocol allows
    #[error("invalid plaintext length {length} (must be 1-65535 bytes)")]
    InvalidPlaintextLength {
        /// Offending length in bytes
        length: usize,
    },

    /// Decrypted envelope layer does not match the expected shape
    #[error("schema validation failed: {reason}")]
    SchemaValidationFailed {
        /// Which check rejected the layer
        reason: String,
    },

    /// Salt is shorter than the minimum
    #[error("salt too short: {length} bytes (minimum {minimum})")]
    SaltTooShort {
        /// Provided salt length
        length: usize,
        /// Required minimum
        minimum: usize,
    },

    /// Password hashing failed
    #[error("key derivation failed: {reason}")]
    KeyDerivation {
        /// Error reported by the KDF
        reason: String,
    },

    /// Bytes are not a valid secp256k1 secret key
    #[error("invalid secret key")]
    InvalidSecretKey,

    /// Bytes are not a valid x-only secp256k1 public key
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Duress secret is too close to the normal secret, or too short
    #[error("weak duress password: {reason}")]
    WeakDuressPassword {
        /// Which rule rejected it
        reason: &'static str,
    },

    /// Event to sign names a different author than the signing key
    #[error("event pubkey does not match the signing key")]
    PubkeyMismatch,

    /// JSON encoding of an event failed
    #[error("serialization failed: {reason}")]
    Serialization {
        /// Error reported by the encoder
        reason: String,
    },
}

impl CryptoError {
    pub(crate) fn schema(reason: impl Into<String>) -> Self {
        Self::SchemaValidationFailed { reason: reason.into() }
    }
}
