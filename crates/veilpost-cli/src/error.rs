//! CLI error type.

use veilpost_core::{SessionError, SignerError, StorageError};
use veilpost_crypto::CryptoError;

/// Anything a subcommand can fail with.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Bad key, envelope or payload
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Bad connection string
    #[error(transparent)]
    Signer(#[from] SignerError),

    /// Sealed identity could not be created or opened
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Identity store could not be opened
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Input is not the expected JSON
    #[error("invalid JSON input: {0}")]
    Json(String),

    /// `--store` given without a passphrase
    #[error("a passphrase is required to seal or open a stored identity (set VEILPOST_PASSPHRASE)")]
    MissingPassphrase,
}

impl From<serde_json::Error> for CliError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}
