//! Veilpost Cryptographic Primitives
//!
//! Pure building blocks for private messaging over untrusted relays. No I/O,
//! no clocks: callers pass the current time and an RNG, which keeps every
//! operation reproducible under a seeded generator in tests.
//!
//! # Key Hierarchy
//!
//! ```text
//! User secret ──Argon2id/PBKDF2──► Master Key ──HKDF──► Database Key
//!                                      │
//!                                      └──AEAD──► sealed Identity Key
//!                                                       │
//!                      peer public key ──ECDH + HKDF────┘
//!                                                       ▼
//!                                               Conversation Key
//! ```
//!
//! # Message Path
//!
//! ```text
//! text → traffic padding → protocol padding → ChaCha20-Poly1305 + HMAC
//!      → Rumor → Seal → Gift wrap → relay
//! ```
//!
//! # Security
//!
//! Confidentiality and integrity:
//! - Payload MAC is verified before any decryption or padding is parsed
//! - Identity records bind their KDF algorithm as associated data
//!
//! Metadata protection:
//! - Traffic padding hides message size within fixed buckets
//! - Gift wraps are signed by one-time keys and carry jittered timestamps
//!
//! Key hygiene:
//! - Master, database, conversation and message keys zeroize on drop
//! - `Debug` output never includes secret material

pub mod cipher;
pub mod conversation;
pub mod duress;
pub mod envelope;
pub mod error;
pub mod event;
pub mod hierarchy;
pub mod keys;
pub mod padding;

pub use conversation::ConversationKey;
pub use duress::{DuressHash, duress_alerts, hash_duress_password, validate_duress_password};
pub use envelope::{Rumor, TIMESTAMP_JITTER_SECS, Unwrapped, randomize_timestamp, unwrap, wrap, wrap_rumor};
pub use error::CryptoError;
pub use event::{Event, KIND_GIFT_WRAP, KIND_RUMOR, KIND_SEAL, KIND_SIGNER_MESSAGE, UnsignedEvent};
pub use hierarchy::{
    DatabaseKey, EncryptedIdentity, KdfAlgorithm, MasterKey, decrypt_identity_key,
    derive_database_key, derive_master_key, encrypt_identity_key, generate_salt,
};
pub use keys::{IdentityKeys, PublicKey};
pub use padding::{
    TRAFFIC_BUCKETS, apply_traffic_padding, calc_padded_len, calculate_padded_size,
    remove_traffic_padding,
};
