//! Three-layer onion envelope for private messages
//!
//! ```text
//! Rumor (kind 14, unsigned, real author and recipient tag)
//!    │  encrypt(sender → recipient)
//!    ▼
//! Seal (kind 13, signed by sender, no tags)
//!    │  encrypt(ephemeral → recipient)
//!    ▼
//! Gift wrap (kind 1059, signed by a one-time key, tagged with recipient)
//! ```
//!
//! Each layer carries its own jittered timestamp so relays cannot correlate
//! events with the send time. Every decrypted layer is parsed against a
//! strict schema before use.

use rand::{CryptoRng, Rng, RngCore};
use serde::{Deserialize, Serialize};

use crate::{
    cipher,
    conversation::ConversationKey,
    error::CryptoError,
    event::{Event, KIND_GIFT_WRAP, KIND_RUMOR, KIND_SEAL, UnsignedEvent, tag_value},
    keys::{IdentityKeys, PublicKey},
};

/// Maximum timestamp jitter in either direction (two days)
pub const TIMESTAMP_JITTER_SECS: i64 = 2 * 24 * 60 * 60;

/// Unsigned inner message. Deniable: nothing binds it to its author except
/// the seal around it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Rumor {
    /// Hex id over the canonical serialization
    pub id: String,
    /// Claimed author
    pub pubkey: PublicKey,
    /// Unix seconds
    pub created_at: i64,
    /// Rumor kind
    pub kind: u16,
    /// Tags, including the recipient `p` tag
    pub tags: Vec<Vec<String>>,
    /// Message text
    pub content: String,
}

impl Rumor {
    /// Build a direct-message rumor addressed to `recipient`.
    pub fn new(
        sender: PublicKey,
        recipient: &PublicKey,
        content: impl Into<String>,
        created_at: i64,
    ) -> Result<Self, CryptoError> {
        Self::with_tags(sender, recipient, content, created_at, Vec::new())
    }

    /// Build a rumor with extra tags after the recipient tag.
    pub fn with_tags(
        sender: PublicKey,
        recipient: &PublicKey,
        content: impl Into<String>,
        created_at: i64,
        extra_tags: Vec<Vec<String>>,
    ) -> Result<Self, CryptoError> {
        let mut tags = vec![vec!["p".to_owned(), recipient.to_hex()]];
        tags.extend(extra_tags);

        let unsigned = UnsignedEvent {
            pubkey: sender,
            created_at,
            kind: KIND_RUMOR,
            tags,
            content: content.into(),
        };
        let id = unsigned.id()?;

        Ok(Self {
            id,
            pubkey: unsigned.pubkey,
            created_at: unsigned.created_at,
            kind: unsigned.kind,
            tags: unsigned.tags,
            content: unsigned.content,
        })
    }

    /// Recipient named in the `p` tag.
    pub fn recipient(&self) -> Option<PublicKey> {
        tag_value(&self.tags, "p").and_then(|hex_str| PublicKey::from_hex(hex_str).ok())
    }

    /// First value of the first tag named `name`.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        tag_value(&self.tags, name)
    }
}

/// Result of opening a gift wrap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unwrapped {
    /// Inner message
    pub rumor: Rumor,
    /// Author according to the seal
    pub sender: PublicKey,
    /// Seal signature verified and seal author matches the rumor author
    pub seal_verified: bool,
}

/// Shift `now` by a uniformly random offset in `[-range, range]`.
pub fn randomize_timestamp<R: RngCore>(now: i64, range: i64, rng: &mut R) -> i64 {
    let range = range.abs();
    now + rng.gen_range(-range..=range)
}

/// Wrap a text message from `sender` to `recipient`.
///
/// Rumor, seal and gift wrap each draw an independent jittered timestamp.
pub fn wrap<R: RngCore + CryptoRng>(
    content: &str,
    sender: &IdentityKeys,
    recipient: &PublicKey,
    now: i64,
    rng: &mut R,
) -> Result<Event, CryptoError> {
    let created_at = randomize_timestamp(now, TIMESTAMP_JITTER_SECS, rng);
    let rumor = Rumor::new(sender.public_key(), recipient, content, created_at)?;
    wrap_rumor(&rumor, sender, recipient, now, rng)
}

/// Wrap an already built rumor. Its timestamp is kept as given.
///
/// # Errors
///
/// - `PubkeyMismatch`: rumor author is not `sender`
pub fn wrap_rumor<R: RngCore + CryptoRng>(
    rumor: &Rumor,
    sender: &IdentityKeys,
    recipient: &PublicKey,
    now: i64,
    rng: &mut R,
) -> Result<Event, CryptoError> {
    if rumor.pubkey != sender.public_key() {
        return Err(CryptoError::PubkeyMismatch);
    }

    let seal = create_seal(rumor, sender, recipient, now, rng)?;
    create_gift_wrap(&seal, sender, recipient, now, rng)
}

fn create_seal<R: RngCore + CryptoRng>(
    rumor: &Rumor,
    sender: &IdentityKeys,
    recipient: &PublicKey,
    now: i64,
    rng: &mut R,
) -> Result<Event, CryptoError> {
    let rumor_json = to_json(rumor)?;
    let key = ConversationKey::derive(sender, recipient);
    let content = cipher::encrypt(&rumor_json, &key, rng)?;

    UnsignedEvent {
        pubkey: sender.public_key(),
        created_at: randomize_timestamp(now, TIMESTAMP_JITTER_SECS, rng),
        kind: KIND_SEAL,
        tags: Vec::new(),
        content,
    }
    .sign(sender, rng)
}

fn create_gift_wrap<R: RngCore + CryptoRng>(
    seal: &Event,
    sender: &IdentityKeys,
    recipient: &PublicKey,
    now: i64,
    rng: &mut R,
) -> Result<Event, CryptoError> {
    let ephemeral = loop {
        let candidate = IdentityKeys::generate(rng);
        let public = candidate.public_key();
        if public != sender.public_key() && public != *recipient {
            break candidate;
        }
    };

    let seal_json = to_json(seal)?;
    let key = ConversationKey::derive(&ephemeral, recipient);
    let content = cipher::encrypt(&seal_json, &key, rng)?;

    UnsignedEvent {
        pubkey: ephemeral.public_key(),
        created_at: randomize_timestamp(now, TIMESTAMP_JITTER_SECS, rng),
        kind: KIND_GIFT_WRAP,
        tags: vec![vec!["p".to_owned(), recipient.to_hex()]],
        content,
    }
    .sign(&ephemeral, rng)
}

/// Open a gift wrap addressed to `recipient`.
///
/// A seal whose signature does not verify, or whose author differs from
/// the rumor author, still yields the rumor with `seal_verified = false`.
///
/// # Errors
///
/// - `SchemaValidationFailed`: a layer has the wrong kind or shape
/// - `AuthenticationFailed`, `InvalidCiphertext`, `InvalidPaddingLength`:
///   a layer failed to decrypt
pub fn unwrap(gift_wrap: &Event, recipient: &IdentityKeys) -> Result<Unwrapped, CryptoError> {
    if gift_wrap.kind != KIND_GIFT_WRAP {
        return Err(CryptoError::schema(format!(
            "expected gift wrap kind {KIND_GIFT_WRAP}, got {}",
            gift_wrap.kind
        )));
    }

    let wrap_key = ConversationKey::derive(recipient, &gift_wrap.pubkey);
    let seal_json = cipher::decrypt(&gift_wrap.content, &wrap_key)?;
    let seal = parse_seal(&seal_json)?;

    let mut seal_verified = seal.verify();
    if !seal_verified {
        tracing::warn!(seal_id = %seal.id, "seal signature verification failed");
    }

    let seal_key = ConversationKey::derive(recipient, &seal.pubkey);
    let rumor_json = cipher::decrypt(&seal.content, &seal_key)?;
    let rumor = parse_rumor(&rumor_json)?;

    if rumor.pubkey != seal.pubkey {
        tracing::warn!(
            rumor_author = %rumor.pubkey,
            seal_author = %seal.pubkey,
            "rumor author does not match seal author"
        );
        seal_verified = false;
    }

    Ok(Unwrapped { rumor, sender: seal.pubkey, seal_verified })
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SealSchema {
    id: String,
    pubkey: PublicKey,
    created_at: i64,
    kind: u16,
    tags: Vec<Vec<String>>,
    content: String,
    sig: String,
}

fn parse_seal(json: &str) -> Result<Event, CryptoError> {
    let seal: SealSchema = serde_json::from_str(json)
        .map_err(|e| CryptoError::schema(format!("seal: {e}")))?;

    if seal.kind != KIND_SEAL {
        return Err(CryptoError::schema(format!("seal: expected kind {KIND_SEAL}, got {}", seal.kind)));
    }
    if !seal.tags.is_empty() {
        return Err(CryptoError::schema("seal: tags must be empty"));
    }
    if !is_hex_of_len(&seal.id, 64) {
        return Err(CryptoError::schema("seal: malformed id"));
    }
    if !is_hex_of_len(&seal.sig, 128) {
        return Err(CryptoError::schema("seal: malformed signature"));
    }
    if seal.content.is_empty() {
        return Err(CryptoError::schema("seal: empty content"));
    }

    Ok(Event {
        id: seal.id,
        pubkey: seal.pubkey,
        created_at: seal.created_at,
        kind: seal.kind,
        tags: seal.tags,
        content: seal.content,
        sig: seal.sig,
    })
}

fn parse_rumor(json: &str) -> Result<Rumor, CryptoError> {
    let rumor: Rumor =
        serde_json::from_str(json).map_err(|e| CryptoError::schema(format!("rumor: {e}")))?;

    if rumor.kind != KIND_RUMOR {
        return Err(CryptoError::schema(format!(
            "rumor: expected kind {KIND_RUMOR}, got {}",
            rumor.kind
        )));
    }
    if !is_hex_of_len(&rumor.id, 64) {
        return Err(CryptoError::schema("rumor: malformed id"));
    }
    if rumor.tags.iter().any(Vec::is_empty) {
        return Err(CryptoError::schema("rumor: empty tag"));
    }

    Ok(rumor)
}

fn is_hex_of_len(value: &str, len: usize) -> bool {
    value.len() == len && value.bytes().all(|b| b.is_ascii_hexdigit())
}

fn to_json<T: Serialize>(value: &T) -> Result<String, CryptoError> {
    serde_json::to_string(value).map_err(|e| CryptoError::Serialization { reason: e.to_string() })
}
