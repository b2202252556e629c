//! Service-level errors
//!
//! Each service wraps the lower layers with `#[from]` so `?` composes from
//! crypto through storage to the caller.

use std::time::Duration;

use thiserror::Error;
use veilpost_crypto::CryptoError;

use crate::{relay::RelayError, secure_store::SecureStoreError, storage::StorageError};

/// Errors from the session key slot.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// No master key is loaded
    #[error("session is locked")]
    Locked,

    /// No identity record has been created
    #[error("no identity stored")]
    NoIdentity,

    /// Key derivation task panicked or was cancelled
    #[error("key derivation task failed: {0}")]
    Task(String),

    /// Cryptographic failure
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Persistence failure
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Secure-storage failure
    #[error(transparent)]
    SecureStore(#[from] SecureStoreError),
}

/// Errors from the delegated signer protocol.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignerError {
    /// Connection descriptor could not be parsed
    #[error("invalid connection string: {reason}")]
    InvalidConnectionString {
        /// What was missing or malformed
        reason: String,
    },

    /// No response arrived before the request deadline
    #[error("{method} request {id} timed out after {timeout:?}")]
    RequestTimedOut {
        /// Request id
        id: String,
        /// Request method
        method: String,
        /// Deadline that elapsed
        timeout: Duration,
    },

    /// Connection was closed while the request was pending
    #[error("signer disconnected")]
    Disconnected,

    /// Remote signer answered with an error
    #[error("remote signer error: {message}")]
    Remote {
        /// Error text from the remote side
        message: String,
    },

    /// Signed event failed verification or was altered
    #[error("remote signer returned an invalid signature")]
    InvalidSignature,

    /// Response payload could not be interpreted
    #[error("invalid signer response: {0}")]
    InvalidResponse(String),

    /// Operation needs an active connection
    #[error("not connected to a remote signer")]
    NotConnected,

    /// Stored connection has not been approved by the remote signer
    #[error("connection {connection_id} is not approved")]
    NotApproved {
        /// Stored connection id
        connection_id: String,
    },

    /// No stored connection under this id
    #[error("unknown connection {connection_id}")]
    UnknownConnection {
        /// Requested connection id
        connection_id: String,
    },

    /// Bunker refused a method the client was not granted
    #[error("permission denied for {method}")]
    PermissionDenied {
        /// Refused method
        method: String,
    },

    /// Cryptographic failure
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Persistence failure
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Secure-storage failure
    #[error(transparent)]
    SecureStore(#[from] SecureStoreError),

    /// Transport failure
    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl SignerError {
    /// Whether re-issuing the request may succeed.
    ///
    /// Timeouts, disconnects and relay failures are transient. Everything
    /// else will fail the same way again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RequestTimedOut { .. } | Self::Disconnected | Self::Relay(_))
    }
}

/// Errors from the ephemeral message lifecycle manager.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EphemeralError {
    /// Message was never tracked, or has already expired
    #[error("message {message_id} is not tracked")]
    NotTracked {
        /// Requested message id
        message_id: String,
    },

    /// Persistence failure
    #[error(transparent)]
    Storage(#[from] StorageError),
}
