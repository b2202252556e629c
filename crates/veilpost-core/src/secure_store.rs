//! Secure-storage collaborator
//!
//! Holds secrets that must not land in the plain [`crate::Store`]: the
//! cached database key and delegated-signer session keys. Labels are
//! namespaced strings such as `veilpost.database-key`.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use thiserror::Error;
use zeroize::Zeroizing;

/// Errors from the secure-storage backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SecureStoreError {
    /// Backend is not reachable (locked keychain, no secret service)
    #[error("secure storage unavailable: {0}")]
    Unavailable(String),

    /// Stored value could not be decoded
    #[error("corrupt secret under {label}")]
    Corrupt {
        /// Label of the unreadable entry
        label: String,
    },
}

/// Label/bytes storage for secrets.
pub trait SecureStore: Clone + Send + Sync + 'static {
    /// Store `secret` under `label`, replacing any previous value.
    fn store(&self, label: &str, secret: &[u8]) -> Result<(), SecureStoreError>;

    /// Retrieve the secret under `label`.
    fn retrieve(&self, label: &str) -> Result<Option<Zeroizing<Vec<u8>>>, SecureStoreError>;

    /// Delete the secret under `label`. Deleting a missing label succeeds.
    fn delete(&self, label: &str) -> Result<(), SecureStoreError>;
}

/// Process-memory secure store for tests and platforms without a keychain.
#[derive(Clone, Default)]
pub struct MemorySecureStore {
    secrets: Arc<Mutex<HashMap<String, Zeroizing<Vec<u8>>>>>,
}

impl MemorySecureStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a label is present.
    pub fn contains(&self, label: &str) -> bool {
        self.lock().contains_key(label)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Zeroizing<Vec<u8>>>> {
        self.secrets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SecureStore for MemorySecureStore {
    fn store(&self, label: &str, secret: &[u8]) -> Result<(), SecureStoreError> {
        self.lock().insert(label.to_owned(), Zeroizing::new(secret.to_vec()));
        Ok(())
    }

    fn retrieve(&self, label: &str) -> Result<Option<Zeroizing<Vec<u8>>>, SecureStoreError> {
        Ok(self.lock().get(label).cloned())
    }

    fn delete(&self, label: &str) -> Result<(), SecureStoreError> {
        self.lock().remove(label);
        Ok(())
    }
}

#[cfg(feature = "os-keychain")]
pub use keychain::KeyringStore;

#[cfg(feature = "os-keychain")]
mod keychain {
    use keyring::Entry;
    use zeroize::Zeroizing;

    use super::{SecureStore, SecureStoreError};

    /// OS keychain (macOS Keychain, Windows Credential Manager, Secret
    /// Service). Secrets are stored hex-encoded as the entry password.
    #[derive(Clone)]
    pub struct KeyringStore {
        service: String,
    }

    impl KeyringStore {
        /// Store entries under the given keychain service name.
        pub fn new(service: impl Into<String>) -> Self {
            Self { service: service.into() }
        }

        fn entry(&self, label: &str) -> Result<Entry, SecureStoreError> {
            Entry::new(&self.service, label).map_err(|e| SecureStoreError::Unavailable(e.to_string()))
        }
    }

    impl SecureStore for KeyringStore {
        fn store(&self, label: &str, secret: &[u8]) -> Result<(), SecureStoreError> {
            let encoded = Zeroizing::new(hex::encode(secret));
            self.entry(label)?
                .set_password(&encoded)
                .map_err(|e| SecureStoreError::Unavailable(e.to_string()))
        }

        fn retrieve(&self, label: &str) -> Result<Option<Zeroizing<Vec<u8>>>, SecureStoreError> {
            match self.entry(label)?.get_password() {
                Ok(encoded) => {
                    let encoded = Zeroizing::new(encoded);
                    hex::decode(encoded.as_str())
                        .map(|bytes| Some(Zeroizing::new(bytes)))
                        .map_err(|_| SecureStoreError::Corrupt { label: label.to_owned() })
                },
                Err(keyring::Error::NoEntry) => Ok(None),
                Err(e) => Err(SecureStoreError::Unavailable(e.to_string())),
            }
        }

        fn delete(&self, label: &str) -> Result<(), SecureStoreError> {
            match self.entry(label)?.delete_password() {
                Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
                Err(e) => Err(SecureStoreError::Unavailable(e.to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_retrieve_delete() {
        let store = MemorySecureStore::new();
        assert_eq!(store.retrieve("veilpost.test").unwrap(), None);

        store.store("veilpost.test", &[1, 2, 3]).unwrap();
        assert_eq!(store.retrieve("veilpost.test").unwrap().as_deref(), Some(&vec![1, 2, 3]));

        store.delete("veilpost.test").unwrap();
        store.delete("veilpost.test").unwrap();
        assert!(!store.contains("veilpost.test"));
    }
}
