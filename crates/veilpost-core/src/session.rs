//! Live master key slot
//!
//! One [`KeySession`] per process holds the only in-memory [`MasterKey`].
//! Derivation runs on a blocking thread; everything else borrows the key
//! under the slot mutex and never across an await.
//!
//! ```text
//!   Locked ──unlock(secret)──► Unlocked(MasterKey) ──lock()──► Locked
//!                                 │
//!          create_identity / load_identity / database_key
//! ```
//!
//! # Security
//!
//! - Replacing or clearing the slot drops the previous key, which zeroizes it
//! - The identity record is stored sealed; its salt and KDF tag travel with it
//! - The database key is cached in the secure store, never the plain store

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use veilpost_crypto::{
    CryptoError, DatabaseKey, EncryptedIdentity, IdentityKeys, KdfAlgorithm, MasterKey, PublicKey,
    decrypt_identity_key, derive_database_key, derive_master_key, encrypt_identity_key,
};
use zeroize::Zeroizing;

use crate::{
    error::SessionError,
    secure_store::{SecureStore, SecureStoreError},
    storage::Store,
};

/// Table holding sealed identity records
pub const IDENTITY_TABLE: &str = "identity";

/// Key of the primary identity record
pub const PRIMARY_IDENTITY: &str = "primary";

/// Secure-storage label of the cached database key
pub const DATABASE_KEY_LABEL: &str = "veilpost.database-key";

/// Persisted identity: public key in clear, secret key sealed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredIdentity {
    /// Public half, readable while locked
    pub public_key: PublicKey,
    /// Secret half sealed under the master key
    #[serde(flatten)]
    pub sealed: EncryptedIdentity,
}

/// Owner of the single live master key.
#[derive(Clone)]
pub struct KeySession<S: Store> {
    pub(crate) store: S,
    slot: Arc<Mutex<Option<MasterKey>>>,
}

impl<S: Store> KeySession<S> {
    /// Locked session over `store`.
    pub fn new(store: S) -> Self {
        Self { store, slot: Arc::new(Mutex::new(None)) }
    }

    /// Derive the master key and load it into the slot.
    ///
    /// Runs the KDF on tokio's blocking pool. Any previously loaded key is
    /// dropped (and zeroized) once the new one is in place.
    ///
    /// # Errors
    ///
    /// - `Crypto(SaltTooShort)`: salt shorter than 16 bytes
    /// - `Task`: the blocking task did not complete
    pub async fn unlock(
        &self,
        secret: Zeroizing<Vec<u8>>,
        salt: Vec<u8>,
        algorithm: KdfAlgorithm,
    ) -> Result<(), SessionError> {
        let master = tokio::task::spawn_blocking(move || derive_master_key(&secret, &salt, algorithm))
            .await
            .map_err(|e| SessionError::Task(e.to_string()))??;

        tracing::info!(%algorithm, "session unlocked");
        let previous = self.slot().replace(master);
        drop(previous);
        Ok(())
    }

    /// Unlock with the salt and algorithm recorded next to the stored
    /// identity.
    ///
    /// # Errors
    ///
    /// - `NoIdentity`: nothing stored yet
    pub async fn unlock_stored(&self, secret: Zeroizing<Vec<u8>>) -> Result<(), SessionError> {
        let stored = self.stored_identity()?;
        self.unlock(secret, stored.sealed.salt, stored.sealed.algorithm).await
    }

    /// Drop the live master key. Idempotent.
    pub fn lock(&self) {
        if self.slot().take().is_some() {
            tracing::info!("session locked");
        }
    }

    /// Whether a master key is loaded.
    pub fn is_unlocked(&self) -> bool {
        self.slot().is_some()
    }

    /// Algorithm of the live master key.
    pub fn algorithm(&self) -> Option<KdfAlgorithm> {
        self.slot().as_ref().map(MasterKey::algorithm)
    }

    /// Generate a fresh identity, seal it under the live key and store it as
    /// the primary identity. Replaces any existing record.
    ///
    /// # Errors
    ///
    /// - `Locked`: no master key loaded
    pub fn create_identity<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
    ) -> Result<PublicKey, SessionError> {
        let identity = IdentityKeys::generate(rng);
        self.store_identity(&identity, rng)
    }

    /// Seal an existing identity (imported from elsewhere) as the primary
    /// identity.
    ///
    /// # Errors
    ///
    /// - `Locked`: no master key loaded
    pub fn store_identity<R: RngCore + CryptoRng>(
        &self,
        identity: &IdentityKeys,
        rng: &mut R,
    ) -> Result<PublicKey, SessionError> {
        let sealed = {
            let slot = self.slot();
            let master = slot.as_ref().ok_or(SessionError::Locked)?;
            encrypt_identity_key(identity, master, rng)
        };

        let public_key = identity.public_key();
        self.store.save(IDENTITY_TABLE, PRIMARY_IDENTITY, &StoredIdentity { public_key, sealed })?;
        tracing::info!(%public_key, "identity stored");

        Ok(public_key)
    }

    /// Public key of the stored identity, readable while locked.
    ///
    /// # Errors
    ///
    /// - `NoIdentity`: nothing stored yet
    pub fn public_key(&self) -> Result<PublicKey, SessionError> {
        Ok(self.stored_identity()?.public_key)
    }

    /// Open the stored identity under the live key.
    ///
    /// # Errors
    ///
    /// - `Locked`: no master key loaded
    /// - `NoIdentity`: nothing stored yet
    /// - `Crypto(AlgorithmMismatch)`: record sealed under the other KDF
    /// - `Crypto(DecryptionFailed)`: wrong secret or tampered record
    pub fn load_identity(&self) -> Result<IdentityKeys, SessionError> {
        let stored = self.stored_identity()?;

        let slot = self.slot();
        let master = slot.as_ref().ok_or(SessionError::Locked)?;
        let identity = decrypt_identity_key(&stored.sealed, master)?;

        if identity.public_key() != stored.public_key {
            return Err(SessionError::Crypto(CryptoError::PubkeyMismatch));
        }
        Ok(identity)
    }

    /// Database key derived from the live master key.
    ///
    /// # Errors
    ///
    /// - `Locked`: no master key loaded
    pub fn database_key(&self) -> Result<DatabaseKey, SessionError> {
        let slot = self.slot();
        let master = slot.as_ref().ok_or(SessionError::Locked)?;
        Ok(derive_database_key(master))
    }

    /// Derive the database key and keep it in secure storage.
    ///
    /// # Errors
    ///
    /// - `Locked`: no master key loaded
    /// - `SecureStore`: backend refused the write
    pub fn cache_database_key<K: SecureStore>(&self, secure: &K) -> Result<(), SessionError> {
        let key = self.database_key()?;
        secure.store(DATABASE_KEY_LABEL, key.as_bytes())?;
        Ok(())
    }

    /// Database key previously cached with [`Self::cache_database_key`].
    ///
    /// Works while locked.
    ///
    /// # Errors
    ///
    /// - `SecureStore(Corrupt)`: cached entry has the wrong length
    pub fn cached_database_key<K: SecureStore>(
        &self,
        secure: &K,
    ) -> Result<Option<DatabaseKey>, SessionError> {
        let Some(bytes) = secure.retrieve(DATABASE_KEY_LABEL)? else {
            return Ok(None);
        };
        let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            SessionError::SecureStore(SecureStoreError::Corrupt { label: DATABASE_KEY_LABEL.into() })
        })?;

        Ok(Some(DatabaseKey::from_bytes(key)))
    }

    pub(crate) fn stored_identity(&self) -> Result<StoredIdentity, SessionError> {
        self.store
            .load::<StoredIdentity>(IDENTITY_TABLE, PRIMARY_IDENTITY)?
            .ok_or(SessionError::NoIdentity)
    }

    pub(crate) fn slot(&self) -> MutexGuard<'_, Option<MasterKey>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;
    use crate::{secure_store::MemorySecureStore, storage::MemoryStore};

    const SALT: [u8; 16] = [9; 16];

    fn secret(text: &str) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(text.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn locked_session_refuses_key_operations() {
        let session = KeySession::new(MemoryStore::new());
        let mut rng = ChaCha20Rng::seed_from_u64(1);

        assert!(!session.is_unlocked());
        assert_eq!(session.create_identity(&mut rng), Err(SessionError::Locked));
        assert_eq!(session.database_key(), Err(SessionError::Locked));
        assert_eq!(session.load_identity().map(|_| ()), Err(SessionError::NoIdentity));
    }

    #[tokio::test]
    async fn create_then_reload_identity() {
        let store = MemoryStore::new();
        let session = KeySession::new(store.clone());
        let mut rng = ChaCha20Rng::seed_from_u64(2);

        session.unlock(secret("hunter2"), SALT.to_vec(), KdfAlgorithm::Pbkdf2Sha256).await.unwrap();
        let public_key = session.create_identity(&mut rng).unwrap();
        session.lock();
        session.lock();
        assert_eq!(session.public_key().unwrap(), public_key);

        let restarted = KeySession::new(store);
        restarted.unlock_stored(secret("hunter2")).await.unwrap();
        assert_eq!(restarted.algorithm(), Some(KdfAlgorithm::Pbkdf2Sha256));
        assert_eq!(restarted.load_identity().unwrap().public_key(), public_key);
    }

    #[tokio::test]
    async fn wrong_secret_fails_to_open_identity() {
        let session = KeySession::new(MemoryStore::new());
        let mut rng = ChaCha20Rng::seed_from_u64(3);

        session.unlock(secret("right"), SALT.to_vec(), KdfAlgorithm::Pbkdf2Sha256).await.unwrap();
        session.create_identity(&mut rng).unwrap();
        session.unlock_stored(secret("wrong")).await.unwrap();

        assert_eq!(
            session.load_identity().map(|_| ()),
            Err(SessionError::Crypto(CryptoError::DecryptionFailed))
        );
    }

    #[tokio::test]
    async fn short_salt_is_rejected() {
        let session = KeySession::new(MemoryStore::new());
        let err = session.unlock(secret("x"), vec![0; 8], KdfAlgorithm::Pbkdf2Sha256).await;

        assert!(matches!(
            err,
            Err(SessionError::Crypto(CryptoError::SaltTooShort { length: 8, .. }))
        ));
        assert!(!session.is_unlocked());
    }

    #[tokio::test]
    async fn database_key_is_cached_in_secure_store() {
        let session = KeySession::new(MemoryStore::new());
        let secure = MemorySecureStore::new();
        assert_eq!(session.cached_database_key(&secure), Ok(None));

        session.unlock(secret("pw"), SALT.to_vec(), KdfAlgorithm::Pbkdf2Sha256).await.unwrap();
        session.cache_database_key(&secure).unwrap();
        let live = session.database_key().unwrap();
        session.lock();

        assert_eq!(session.cached_database_key(&secure), Ok(Some(live)));
    }
}
