//! Key hierarchy: user secret -> master key -> identity and database keys
//!
//! ```text
//! User secret + salt
//!        │
//!        ▼
//! Argon2id | PBKDF2-SHA256 → Master Key
//!        │                      │
//!        ▼                      ▼
//! XChaCha20-Poly1305       HKDF → Database Key
//! (sealed identity key)
//! ```
//!
//! The KDF algorithm travels with the sealed identity record and is bound
//! into the AEAD associated data. A record sealed under one algorithm is
//! never opened with a key derived by the other.

use std::fmt;

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};
use hkdf::Hkdf;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::{error::CryptoError, keys::IdentityKeys};

/// Size of master and database keys
pub const KEY_SIZE: usize = 32;

/// Minimum accepted salt length
pub const MIN_SALT_SIZE: usize = 16;

/// Argon2id memory cost in KiB (64 MiB)
pub const ARGON2_MEMORY_KIB: u32 = 64 * 1024;

/// Argon2id passes
pub const ARGON2_ITERATIONS: u32 = 3;

/// Argon2id lanes
pub const ARGON2_PARALLELISM: u32 = 4;

/// PBKDF2-HMAC-SHA256 rounds
pub const PBKDF2_ROUNDS: u32 = 600_000;

/// `XChaCha20` nonce size
const IDENTITY_NONCE_SIZE: usize = 24;

/// Poly1305 tag size
const IDENTITY_TAG_SIZE: usize = 16;

const IDENTITY_AAD_LABEL: &[u8] = b"veilpost-identity-v1|";
const DATABASE_KEY_SALT: &[u8] = b"veilpost-dek-v1";
const DATABASE_KEY_INFO: &[u8] = b"database-encryption";

/// Password hashing algorithm used to derive a [`MasterKey`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KdfAlgorithm {
    /// Argon2id, 64 MiB, 3 passes, 4 lanes
    Argon2id,
    /// PBKDF2-HMAC-SHA256, 600 000 rounds
    Pbkdf2Sha256,
}

impl KdfAlgorithm {
    /// Stable identifier stored in records and bound into AAD.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Argon2id => "argon2id",
            Self::Pbkdf2Sha256 => "pbkdf2-sha256",
        }
    }
}

impl fmt::Display for KdfAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Root symmetric key derived from the user secret.
///
/// Holds the algorithm and salt it was derived with so records sealed under
/// it can carry both. Zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct MasterKey {
    key: [u8; KEY_SIZE],
    #[zeroize(skip)]
    algorithm: KdfAlgorithm,
    #[zeroize(skip)]
    salt: Vec<u8>,
}

impl MasterKey {
    /// KDF that produced this key.
    pub fn algorithm(&self) -> KdfAlgorithm {
        self.algorithm
    }

    /// Salt this key was derived with.
    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKey").field("algorithm", &self.algorithm).finish_non_exhaustive()
    }
}

/// Key for local at-rest encryption, derived deterministically from the
/// master key.
#[derive(Clone, PartialEq, Eq, ZeroizeOnDrop)]
pub struct DatabaseKey([u8; KEY_SIZE]);

impl DatabaseKey {
    /// Restore a key previously exported with [`DatabaseKey::as_bytes`].
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for DatabaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DatabaseKey(..)")
    }
}

/// Identity secret key sealed under a [`MasterKey`].
///
/// `tag` is stored apart from `ciphertext` and `algorithm` is authenticated
/// as associated data, so a record cannot be relabelled to the other KDF.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedIdentity {
    /// Ciphertext without the authentication tag
    #[serde(with = "hex::serde")]
    pub ciphertext: Vec<u8>,
    /// 24-byte `XChaCha20` nonce
    #[serde(with = "hex::serde")]
    pub nonce: Vec<u8>,
    /// 16-byte Poly1305 tag
    #[serde(with = "hex::serde")]
    pub tag: Vec<u8>,
    /// Salt the master key was derived with
    #[serde(with = "hex::serde")]
    pub salt: Vec<u8>,
    /// KDF the master key was derived with
    pub algorithm: KdfAlgorithm,
}

/// Generate a random salt of [`MIN_SALT_SIZE`] bytes.
pub fn generate_salt<R: RngCore + CryptoRng>(rng: &mut R) -> [u8; MIN_SALT_SIZE] {
    let mut salt = [0u8; MIN_SALT_SIZE];
    rng.fill_bytes(&mut salt);
    salt
}

/// Derive a master key from a user secret.
///
/// Deliberately slow. Async callers should run this on a blocking thread.
///
/// # Errors
///
/// - `SaltTooShort`: salt shorter than [`MIN_SALT_SIZE`]
/// - `KeyDerivation`: the password hasher rejected its inputs
pub fn derive_master_key(
    secret: &[u8],
    salt: &[u8],
    algorithm: KdfAlgorithm,
) -> Result<MasterKey, CryptoError> {
    if salt.len() < MIN_SALT_SIZE {
        return Err(CryptoError::SaltTooShort { length: salt.len(), minimum: MIN_SALT_SIZE });
    }

    let mut key = [0u8; KEY_SIZE];
    match algorithm {
        KdfAlgorithm::Argon2id => {
            let params = Params::new(
                ARGON2_MEMORY_KIB,
                ARGON2_ITERATIONS,
                ARGON2_PARALLELISM,
                Some(KEY_SIZE),
            )
            .map_err(|e| CryptoError::KeyDerivation { reason: e.to_string() })?;

            Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
                .hash_password_into(secret, salt, &mut key)
                .map_err(|e| CryptoError::KeyDerivation { reason: e.to_string() })?;
        },
        KdfAlgorithm::Pbkdf2Sha256 => {
            pbkdf2::pbkdf2_hmac::<Sha256>(secret, salt, PBKDF2_ROUNDS, &mut key);
        },
    }

    Ok(MasterKey { key, algorithm, salt: salt.to_vec() })
}

/// Derive the local database key from the master key.
pub fn derive_database_key(master: &MasterKey) -> DatabaseKey {
    let hkdf = Hkdf::<Sha256>::new(Some(DATABASE_KEY_SALT), master.as_bytes());

    let mut key = [0u8; KEY_SIZE];
    let Ok(()) = hkdf.expand(DATABASE_KEY_INFO, &mut key) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };

    DatabaseKey(key)
}

/// Seal an identity secret key under the master key.
pub fn encrypt_identity_key<R: RngCore + CryptoRng>(
    identity: &IdentityKeys,
    master: &MasterKey,
    rng: &mut R,
) -> EncryptedIdentity {
    let mut nonce = [0u8; IDENTITY_NONCE_SIZE];
    rng.fill_bytes(&mut nonce);

    let aad = identity_aad(master.algorithm());
    let cipher = XChaCha20Poly1305::new(master.as_bytes().into());
    let payload = Payload { msg: identity.secret_bytes(), aad: &aad };

    let Ok(mut ciphertext) = cipher.encrypt(XNonce::from_slice(&nonce), payload) else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };
    let tag = ciphertext.split_off(ciphertext.len() - IDENTITY_TAG_SIZE);

    EncryptedIdentity {
        ciphertext,
        nonce: nonce.to_vec(),
        tag,
        salt: master.salt().to_vec(),
        algorithm: master.algorithm(),
    }
}

/// Open a sealed identity record.
///
/// # Errors
///
/// - `AlgorithmMismatch`: record and master key use different KDFs
/// - `DecryptionFailed`: wrong secret, or the record was tampered with
pub fn decrypt_identity_key(
    record: &EncryptedIdentity,
    master: &MasterKey,
) -> Result<IdentityKeys, CryptoError> {
    if record.algorithm != master.algorithm() {
        return Err(CryptoError::AlgorithmMismatch {
            record: record.algorithm,
            live: master.algorithm(),
        });
    }
    if record.nonce.len() != IDENTITY_NONCE_SIZE || record.tag.len() != IDENTITY_TAG_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let mut sealed = Vec::with_capacity(record.ciphertext.len() + IDENTITY_TAG_SIZE);
    sealed.extend_from_slice(&record.ciphertext);
    sealed.extend_from_slice(&record.tag);

    let aad = identity_aad(record.algorithm);
    let cipher = XChaCha20Poly1305::new(master.as_bytes().into());
    let payload = Payload { msg: &sealed, aad: &aad };

    let secret = Zeroizing::new(
        cipher
            .decrypt(XNonce::from_slice(&record.nonce), payload)
            .map_err(|_| CryptoError::DecryptionFailed)?,
    );

    IdentityKeys::from_secret_bytes(&secret).map_err(|_| CryptoError::DecryptionFailed)
}

fn identity_aad(algorithm: KdfAlgorithm) -> Vec<u8> {
    let mut aad = Vec::with_capacity(IDENTITY_AAD_LABEL.len() + 16);
    aad.extend_from_slice(IDENTITY_AAD_LABEL);
    aad.extend_from_slice(algorithm.as_str().as_bytes());
    aad
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;

    const SALT: &[u8; 16] = b"0123456789abcdef";

    #[test]
    fn short_salt_is_rejected() {
        let err = derive_master_key(b"secret", b"short", KdfAlgorithm::Pbkdf2Sha256).unwrap_err();
        assert_eq!(err, CryptoError::SaltTooShort { length: 5, minimum: MIN_SALT_SIZE });
    }

    #[test]
    fn pbkdf2_derivation_is_deterministic() {
        let a = derive_master_key(b"correct horse", SALT, KdfAlgorithm::Pbkdf2Sha256).unwrap();
        let b = derive_master_key(b"correct horse", SALT, KdfAlgorithm::Pbkdf2Sha256).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_eq!(a.algorithm(), KdfAlgorithm::Pbkdf2Sha256);
        assert_eq!(a.salt(), SALT);
    }

    #[test]
    fn algorithms_produce_different_keys() {
        let pbkdf2 = derive_master_key(b"secret", SALT, KdfAlgorithm::Pbkdf2Sha256).unwrap();
        let argon2 = derive_master_key(b"secret", SALT, KdfAlgorithm::Argon2id).unwrap();
        assert_ne!(pbkdf2.as_bytes(), argon2.as_bytes());
    }

    #[test]
    fn database_key_is_deterministic_and_distinct_from_master() {
        let master = derive_master_key(b"secret", SALT, KdfAlgorithm::Pbkdf2Sha256).unwrap();
        let first = derive_database_key(&master);
        let second = derive_database_key(&master);

        assert_eq!(first, second);
        assert_ne!(first.as_bytes(), master.as_bytes());
    }

    #[test]
    fn identity_record_roundtrip() {
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        let master = derive_master_key(b"secret", SALT, KdfAlgorithm::Pbkdf2Sha256).unwrap();
        let identity = IdentityKeys::generate(&mut rng);

        let record = encrypt_identity_key(&identity, &master, &mut rng);
        assert_eq!(record.tag.len(), IDENTITY_TAG_SIZE);
        assert_eq!(record.ciphertext.len(), 32);

        let opened = decrypt_identity_key(&record, &master).unwrap();
        assert_eq!(opened.public_key(), identity.public_key());
    }

    #[test]
    fn relabelled_record_fails_to_decrypt() {
        let mut rng = ChaCha20Rng::seed_from_u64(8);
        let argon2 = derive_master_key(b"secret", SALT, KdfAlgorithm::Argon2id).unwrap();
        let identity = IdentityKeys::generate(&mut rng);
        let mut record = encrypt_identity_key(&identity, &argon2, &mut rng);

        // A PBKDF2 key over a record claiming PBKDF2 but sealed under Argon2id
        record.algorithm = KdfAlgorithm::Pbkdf2Sha256;
        let pbkdf2 = derive_master_key(b"secret", SALT, KdfAlgorithm::Pbkdf2Sha256).unwrap();
        assert_eq!(decrypt_identity_key(&record, &pbkdf2).unwrap_err(), CryptoError::DecryptionFailed);
    }

    #[test]
    fn mismatched_algorithm_is_reported_without_fallback() {
        let mut rng = ChaCha20Rng::seed_from_u64(9);
        let pbkdf2 = derive_master_key(b"secret", SALT, KdfAlgorithm::Pbkdf2Sha256).unwrap();
        let argon2 = derive_master_key(b"secret", SALT, KdfAlgorithm::Argon2id).unwrap();
        let record = encrypt_identity_key(&IdentityKeys::generate(&mut rng), &pbkdf2, &mut rng);

        assert_eq!(
            decrypt_identity_key(&record, &argon2).unwrap_err(),
            CryptoError::AlgorithmMismatch {
                record: KdfAlgorithm::Pbkdf2Sha256,
                live: KdfAlgorithm::Argon2id,
            }
        );
    }

    #[test]
    fn record_serializes_with_hex_fields() {
        let mut rng = ChaCha20Rng::seed_from_u64(10);
        let master = derive_master_key(b"secret", SALT, KdfAlgorithm::Pbkdf2Sha256).unwrap();
        let record = encrypt_identity_key(&IdentityKeys::generate(&mut rng), &master, &mut rng);

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["algorithm"], "pbkdf2-sha256");
        assert_eq!(json["salt"], hex::encode(SALT));

        let back: EncryptedIdentity = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
