//! Veilpost stateful services.
//!
//! Everything here runs over four collaborator traits so the same code works
//! in production and under deterministic tests:
//!
//! - [`Environment`]: time, randomness and sleep ([`SystemEnv`] in production)
//! - [`Store`]: JSON key-value tables ([`MemoryStore`], [`RedbStore`])
//! - [`SecureStore`]: secrets kept out of the plain store
//! - [`Relay`]: event publish/subscribe ([`MemoryRelay`])
//!
//! # Services
//!
//! - [`KeySession`]: the single live master key, the sealed identity, the
//!   database key and the duress unlock
//! - [`SignerClient`] / [`Bunker`]: delegated signing between a secondary
//!   and a primary device
//! - [`EphemeralManager`]: disappearing messages and their secure deletion
//!
//! ```text
//!   KeySession ──identity──► Bunker ◄──relay──► SignerClient
//!        │                                          │
//!        └──────────── Store / SecureStore ◄────────┘
//!                            ▲
//!                   EphemeralManager
//! ```

pub mod duress;
pub mod env;
pub mod ephemeral;
pub mod error;
pub mod relay;
pub mod secure_store;
pub mod session;
pub mod signer;
pub mod storage;
mod system_env;

pub use duress::{StoredDuress, UnlockOutcome};
pub use env::{EnvRng, Environment};
pub use ephemeral::{EphemeralConfig, EphemeralEvent, EphemeralManager, EphemeralState, SweepTasks};
pub use error::{EphemeralError, SessionError, SignerError};
pub use relay::{Filter, MemoryRelay, Relay, RelayError, Subscription};
#[cfg(feature = "os-keychain")]
pub use secure_store::KeyringStore;
pub use secure_store::{MemorySecureStore, SecureStore, SecureStoreError};
pub use session::{KeySession, StoredIdentity};
pub use signer::{
    Bunker, BunkerConfig, ConnectionDescriptor, ConnectionRecord, ConnectionStatus, Method,
    SignerClient, SignerConfig, parse_connection_string,
};
pub use storage::{ChaoticStore, MemoryStore, RedbStore, StorageError, Store};
pub use system_env::SystemEnv;
