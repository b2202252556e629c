//! Duress secrets
//!
//! A second secret that opens a decoy identity instead of the real one. Its
//! hash is derived through the same password KDF as the master key, then
//! domain-separated with HKDF so it can never equal or reveal a master key.
//!
//! ```text
//! duress secret + salt ──KDF──► key ──HKDF("duress")──► DuressHash
//! ```
//!
//! # Security
//!
//! - Hashes are compared in constant time
//! - A duress secret must not be a trivial variant of the normal secret

use std::fmt;

use hkdf::Hkdf;
use rand::{CryptoRng, RngCore};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::ZeroizeOnDrop;

use crate::{
    envelope,
    error::CryptoError,
    event::Event,
    hierarchy::{KdfAlgorithm, derive_master_key},
    keys::{IdentityKeys, PublicKey},
};

/// Size of a duress hash
pub const DURESS_HASH_SIZE: usize = 32;

/// Shortest accepted duress secret, in bytes
pub const MIN_DURESS_LEN: usize = 4;

/// Text of a duress alert when none is configured
pub const DURESS_ALERT_MESSAGE: &str = "DURESS ACTIVATED";

const DURESS_SALT: &[u8] = b"veilpost-duress-v1";
const DURESS_INFO: &[u8] = b"duress-password-key";

/// Domain-separated hash of a duress secret. Zeroized on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct DuressHash([u8; DURESS_HASH_SIZE]);

impl DuressHash {
    /// Restore a hash previously exported with [`DuressHash::as_bytes`].
    pub fn from_bytes(bytes: [u8; DURESS_HASH_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw hash bytes.
    pub fn as_bytes(&self) -> &[u8; DURESS_HASH_SIZE] {
        &self.0
    }

    /// Constant-time equality.
    pub fn matches(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl fmt::Debug for DuressHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DuressHash(..)")
    }
}

/// Hash a duress secret.
///
/// As slow as [`derive_master_key`] with the same algorithm; async callers
/// should run it on a blocking thread.
///
/// # Errors
///
/// - `SaltTooShort`: salt shorter than the master key minimum
/// - `KeyDerivation`: the password hasher rejected its inputs
pub fn hash_duress_password(
    secret: &[u8],
    salt: &[u8],
    algorithm: KdfAlgorithm,
) -> Result<DuressHash, CryptoError> {
    let key = derive_master_key(secret, salt, algorithm)?;
    let hkdf = Hkdf::<Sha256>::new(Some(DURESS_SALT), key.as_bytes());

    let mut hash = [0u8; DURESS_HASH_SIZE];
    let Ok(()) = hkdf.expand(DURESS_INFO, &mut hash) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };

    Ok(DuressHash(hash))
}

/// Reject duress secrets that are easy to confuse with, or guess from, the
/// normal secret.
///
/// # Errors
///
/// `WeakDuressPassword` when the duress secret equals the normal secret or
/// its reverse, is shorter than [`MIN_DURESS_LEN`], or is the normal
/// secret with one byte added at either end.
pub fn validate_duress_password(duress: &[u8], normal: &[u8]) -> Result<(), CryptoError> {
    let weak = |reason| Err(CryptoError::WeakDuressPassword { reason });

    if duress == normal {
        return weak("same as the normal password");
    }
    if duress.iter().rev().eq(normal.iter()) {
        return weak("normal password reversed");
    }
    if duress.len() < MIN_DURESS_LEN {
        return weak("shorter than 4 bytes");
    }
    if duress.len() == normal.len() + 1 && (duress.starts_with(normal) || duress.ends_with(normal)) {
        return weak("normal password plus one character");
    }

    Ok(())
}

/// Gift-wrapped alerts from `sender` to each trusted contact.
///
/// Each alert is an ordinary private message, indistinguishable on the
/// wire from any other.
///
/// # Errors
///
/// Any envelope failure, e.g. `InvalidPlaintextLength` for an empty message.
pub fn duress_alerts<R: RngCore + CryptoRng>(
    sender: &IdentityKeys,
    contacts: &[PublicKey],
    message: Option<&str>,
    now: i64,
    rng: &mut R,
) -> Result<Vec<Event>, CryptoError> {
    let message = message.unwrap_or(DURESS_ALERT_MESSAGE);
    contacts.iter().map(|contact| envelope::wrap(message, sender, contact, now, rng)).collect()
}
