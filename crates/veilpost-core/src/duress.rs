//! Duress unlock
//!
//! A user may register a second secret next to the normal one. Entering it
//! at unlock destroys the real identity and everything tied to it, then
//! opens a freshly generated decoy identity as if nothing happened.
//!
//! ```text
//! unlock_guarded(secret)
//!   ├─ matches duress hash ──► shred identity, signer sessions, messages
//!   │                          seal decoy under the same secret ──► Duress
//!   └─ otherwise ─────────────► ordinary unlock ──────────────────► Normal
//! ```
//!
//! # Security
//!
//! - The duress hash is compared in constant time
//! - Both paths log the same line, so logs do not reveal which one ran
//! - After a duress unlock, the decoy record looks like any other identity
//!   and no duress record remains

use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use veilpost_crypto::{
    DuressHash, EncryptedIdentity, IdentityKeys, KdfAlgorithm, decrypt_identity_key, derive_master_key,
    duress::DURESS_HASH_SIZE, encrypt_identity_key, generate_salt, hash_duress_password,
    validate_duress_password,
};
use zeroize::Zeroizing;

use crate::{
    ephemeral::{EPHEMERAL_STATE_TABLE, MESSAGES_TABLE},
    error::SessionError,
    secure_store::SecureStore,
    session::{DATABASE_KEY_LABEL, IDENTITY_TABLE, KeySession, PRIMARY_IDENTITY, StoredIdentity},
    signer::{CONNECTIONS_TABLE, session_key_label},
    storage::{StorageError, Store},
};

/// Key of the duress record in [`IDENTITY_TABLE`]
pub const DURESS_RECORD: &str = "duress";

/// Tables emptied by a duress unlock
pub const SHREDDED_TABLES: [&str; 3] = [CONNECTIONS_TABLE, MESSAGES_TABLE, EPHEMERAL_STATE_TABLE];

/// Persisted duress secret hash with its own salt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDuress {
    /// Domain-separated hash of the duress secret
    #[serde(with = "hex::serde")]
    pub hash: Vec<u8>,
    /// Salt the hash was derived with
    #[serde(with = "hex::serde")]
    pub salt: Vec<u8>,
    /// KDF the hash was derived with
    pub algorithm: KdfAlgorithm,
}

/// Which secret opened the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockOutcome {
    /// The normal secret; nothing was touched
    Normal,
    /// The duress secret; the real identity is gone and a decoy is loaded
    Duress,
}

impl<S: Store> KeySession<S> {
    /// Register a duress secret.
    ///
    /// `normal` must open the stored identity. The duress hash uses the
    /// stored identity's KDF with a fresh salt. Replaces any earlier duress
    /// secret.
    ///
    /// # Errors
    ///
    /// - `NoIdentity`: nothing stored yet
    /// - `Crypto(DecryptionFailed)`: `normal` does not open the identity
    /// - `Crypto(WeakDuressPassword)`: duress secret too close to `normal`
    pub async fn set_duress_password<R: RngCore + CryptoRng>(
        &self,
        duress: Zeroizing<Vec<u8>>,
        normal: Zeroizing<Vec<u8>>,
        rng: &mut R,
    ) -> Result<(), SessionError> {
        let stored = self.stored_identity()?;
        let salt = generate_salt(rng).to_vec();
        let algorithm = stored.sealed.algorithm;

        let duress_salt = salt.clone();
        let hash = tokio::task::spawn_blocking(move || {
            validate_duress_password(&duress, &normal)?;
            let master = derive_master_key(&normal, &stored.sealed.salt, stored.sealed.algorithm)?;
            decrypt_identity_key(&stored.sealed, &master)?;
            hash_duress_password(&duress, &duress_salt, algorithm)
        })
        .await
        .map_err(|e| SessionError::Task(e.to_string()))??;

        let record = StoredDuress { hash: hash.as_bytes().to_vec(), salt, algorithm };
        self.store.save(IDENTITY_TABLE, DURESS_RECORD, &record)?;
        tracing::info!(%algorithm, "duress password set");

        Ok(())
    }

    /// Forget the duress secret. Idempotent.
    pub fn clear_duress_password(&self) -> Result<(), SessionError> {
        self.store.delete(IDENTITY_TABLE, DURESS_RECORD)?;
        Ok(())
    }

    /// Whether a duress secret is registered.
    pub fn has_duress_password(&self) -> Result<bool, SessionError> {
        Ok(self.store.get(IDENTITY_TABLE, DURESS_RECORD)?.is_some())
    }

    /// Unlock with the stored salt, honoring a registered duress secret.
    ///
    /// On a duress match the real identity record is overwritten and
    /// deleted, every signer session secret and the cached database key
    /// leave `secure`, the tables in [`SHREDDED_TABLES`] are emptied, and a
    /// new identity sealed under `secret` takes the primary slot.
    ///
    /// # Errors
    ///
    /// - `NoIdentity`: nothing stored yet
    /// - `Storage(Serialization)`: the duress record is malformed
    /// - `Task`: the blocking task did not complete
    pub async fn unlock_guarded<K: SecureStore, R: RngCore + CryptoRng>(
        &self,
        secret: Zeroizing<Vec<u8>>,
        secure: &K,
        rng: &mut R,
    ) -> Result<UnlockOutcome, SessionError> {
        let stored = self.stored_identity()?;
        let duress = self.store.load::<StoredDuress>(IDENTITY_TABLE, DURESS_RECORD)?;
        let expected = duress
            .as_ref()
            .map(|record| {
                let bytes: [u8; DURESS_HASH_SIZE] = record.hash.as_slice().try_into().map_err(|_| {
                    StorageError::Serialization(format!("duress hash must be {DURESS_HASH_SIZE} bytes"))
                })?;
                Ok::<_, StorageError>(DuressHash::from_bytes(bytes))
            })
            .transpose()?;

        let salt = stored.sealed.salt.clone();
        let algorithm = stored.sealed.algorithm;
        let (master, is_duress) = tokio::task::spawn_blocking(move || {
            let master = derive_master_key(&secret, &salt, algorithm)?;
            let is_duress = match (duress, expected) {
                (Some(record), Some(expected)) => {
                    hash_duress_password(&secret, &record.salt, record.algorithm)?.matches(&expected)
                },
                _ => false,
            };
            Ok::<_, SessionError>((master, is_duress))
        })
        .await
        .map_err(|e| SessionError::Task(e.to_string()))??;

        let outcome = if is_duress {
            self.shred(&stored, secure, rng)?;
            let decoy = IdentityKeys::generate(rng);
            let sealed = encrypt_identity_key(&decoy, &master, rng);
            let public_key = decoy.public_key();
            self.store.save(IDENTITY_TABLE, PRIMARY_IDENTITY, &StoredIdentity { public_key, sealed })?;
            UnlockOutcome::Duress
        } else {
            UnlockOutcome::Normal
        };

        tracing::info!(%algorithm, "session unlocked");
        let previous = self.slot().replace(master);
        drop(previous);
        Ok(outcome)
    }

    fn shred<K: SecureStore, R: RngCore + CryptoRng>(
        &self,
        stored: &StoredIdentity,
        secure: &K,
        rng: &mut R,
    ) -> Result<(), SessionError> {
        let overwrite = StoredIdentity {
            public_key: stored.public_key,
            sealed: EncryptedIdentity {
                ciphertext: random_bytes(stored.sealed.ciphertext.len(), rng),
                nonce: random_bytes(stored.sealed.nonce.len(), rng),
                tag: random_bytes(stored.sealed.tag.len(), rng),
                salt: stored.sealed.salt.clone(),
                algorithm: stored.sealed.algorithm,
            },
        };
        self.store.save(IDENTITY_TABLE, PRIMARY_IDENTITY, &overwrite)?;
        self.store.delete(IDENTITY_TABLE, PRIMARY_IDENTITY)?;
        self.store.delete(IDENTITY_TABLE, DURESS_RECORD)?;

        for (id, _) in self.store.get_all(CONNECTIONS_TABLE)? {
            secure.delete(&session_key_label(&id))?;
        }
        secure.delete(DATABASE_KEY_LABEL)?;

        for table in SHREDDED_TABLES {
            for (key, record) in self.store.get_all(table)? {
                if let Value::Object(mut fields) = record {
                    for value in fields.values_mut() {
                        if let Value::String(text) = value {
                            *text = hex::encode(random_bytes(text.len().div_ceil(2), rng));
                        }
                    }
                    self.store.put(table, &key, &Value::Object(fields))?;
                }
                self.store.delete(table, &key)?;
            }
        }

        Ok(())
    }
}

fn random_bytes<R: RngCore>(len: usize, rng: &mut R) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rng.fill_bytes(&mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;
    use serde_json::json;
    use veilpost_crypto::CryptoError;

    use super::*;
    use crate::{
        secure_store::MemorySecureStore,
        storage::{ChaoticStore, MemoryStore, StoreOp},
    };

    const SALT: [u8; 16] = [5; 16];

    fn secret(text: &str) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(text.as_bytes().to_vec())
    }

    async fn session_with_identity(
        store: ChaoticStore<MemoryStore>,
        rng: &mut ChaCha20Rng,
    ) -> KeySession<ChaoticStore<MemoryStore>> {
        let session = KeySession::new(store);
        session.unlock(secret("normal pw"), SALT.to_vec(), KdfAlgorithm::Pbkdf2Sha256).await.unwrap();
        session.create_identity(rng).unwrap();
        session.lock();
        session
    }

    #[tokio::test]
    async fn normal_secret_unlocks_without_touching_anything() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let store = ChaoticStore::new(MemoryStore::new(), 0.0, 1);
        let secure = MemorySecureStore::new();
        let session = session_with_identity(store.clone(), &mut rng).await;
        let real = session.public_key().unwrap();

        session.set_duress_password(secret("panic now"), secret("normal pw"), &mut rng).await.unwrap();
        assert!(session.has_duress_password().unwrap());
        secure.store(DATABASE_KEY_LABEL, &[1; 32]).unwrap();

        let outcome = session.unlock_guarded(secret("normal pw"), &secure, &mut rng).await.unwrap();
        assert_eq!(outcome, UnlockOutcome::Normal);
        assert_eq!(session.load_identity().unwrap().public_key(), real);
        assert!(session.has_duress_password().unwrap());
        assert!(secure.contains(DATABASE_KEY_LABEL));
    }

    #[tokio::test]
    async fn duress_secret_replaces_identity_with_decoy() {
        let mut rng = ChaCha20Rng::seed_from_u64(2);
        let store = ChaoticStore::new(MemoryStore::new(), 0.0, 2);
        let secure = MemorySecureStore::new();
        let session = session_with_identity(store.clone(), &mut rng).await;
        let real = session.public_key().unwrap();
        let real_record: StoredIdentity = store.load(IDENTITY_TABLE, PRIMARY_IDENTITY).unwrap().unwrap();

        session.set_duress_password(secret("panic now"), secret("normal pw"), &mut rng).await.unwrap();
        store.put(CONNECTIONS_TABLE, "c1", &json!({"id": "c1"})).unwrap();
        store.put(MESSAGES_TABLE, "m1", &json!({"id": "m1", "content": "meet at dawn"})).unwrap();
        secure.store(&session_key_label("c1"), &[2; 32]).unwrap();
        secure.store(DATABASE_KEY_LABEL, &[1; 32]).unwrap();

        let outcome = session.unlock_guarded(secret("panic now"), &secure, &mut rng).await.unwrap();
        assert_eq!(outcome, UnlockOutcome::Duress);

        let decoy = session.load_identity().unwrap().public_key();
        assert_ne!(decoy, real);
        assert_eq!(session.public_key().unwrap(), decoy);
        assert!(!session.has_duress_password().unwrap());
        assert!(!secure.contains(DATABASE_KEY_LABEL));
        assert!(!secure.contains(&session_key_label("c1")));
        for table in SHREDDED_TABLES {
            assert!(store.get_all(table).unwrap().is_empty());
        }

        // The real record was overwritten before it was deleted
        let journal = store.journal();
        let overwrite = journal
            .iter()
            .rev()
            .find_map(|op| match op {
                StoreOp::Write { table, key, record }
                    if table == IDENTITY_TABLE && key == PRIMARY_IDENTITY =>
                {
                    serde_json::from_value::<StoredIdentity>(record.clone())
                        .ok()
                        .filter(|record| record.public_key == real)
                },
                _ => None,
            })
            .unwrap();
        assert_ne!(overwrite.sealed.ciphertext, real_record.sealed.ciphertext);
        assert_eq!(overwrite.sealed.ciphertext.len(), real_record.sealed.ciphertext.len());
        assert!(journal.iter().any(
            |op| matches!(op, StoreOp::Delete { table, key } if table == MESSAGES_TABLE && key == "m1")
        ));

        // The duress secret now opens the decoy like a normal password
        let restarted = KeySession::new(store.clone());
        let outcome = restarted.unlock_guarded(secret("panic now"), &secure, &mut rng).await.unwrap();
        assert_eq!(outcome, UnlockOutcome::Normal);
        assert_eq!(restarted.load_identity().unwrap().public_key(), decoy);

        restarted.unlock_stored(secret("normal pw")).await.unwrap();
        assert_eq!(
            restarted.load_identity().map(|_| ()),
            Err(SessionError::Crypto(CryptoError::DecryptionFailed))
        );
    }

    #[tokio::test]
    async fn setting_duress_needs_the_normal_secret() {
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        let session = session_with_identity(ChaoticStore::new(MemoryStore::new(), 0.0, 3), &mut rng).await;

        assert_eq!(
            session.set_duress_password(secret("panic now"), secret("wrong pw"), &mut rng).await,
            Err(SessionError::Crypto(CryptoError::DecryptionFailed))
        );
        assert_eq!(
            session.set_duress_password(secret("normal pw1"), secret("normal pw"), &mut rng).await,
            Err(SessionError::Crypto(CryptoError::WeakDuressPassword {
                reason: "normal password plus one character"
            }))
        );
        assert!(!session.has_duress_password().unwrap());

        session.set_duress_password(secret("panic now"), secret("normal pw"), &mut rng).await.unwrap();
        session.clear_duress_password().unwrap();
        session.clear_duress_password().unwrap();
        assert!(!session.has_duress_password().unwrap());
    }

    #[tokio::test]
    async fn malformed_duress_record_is_reported() {
        let mut rng = ChaCha20Rng::seed_from_u64(4);
        let store = ChaoticStore::new(MemoryStore::new(), 0.0, 4);
        let session = session_with_identity(store.clone(), &mut rng).await;
        let record =
            StoredDuress { hash: vec![0; 4], salt: SALT.to_vec(), algorithm: KdfAlgorithm::Pbkdf2Sha256 };
        store.save(IDENTITY_TABLE, DURESS_RECORD, &record).unwrap();

        let err = session.unlock_guarded(secret("normal pw"), &MemorySecureStore::new(), &mut rng).await;
        assert!(matches!(err, Err(SessionError::Storage(StorageError::Serialization(_)))));
        assert!(!session.is_unlocked());
    }
}
