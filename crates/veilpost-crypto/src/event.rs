//! Signed relay events
//!
//! An event id is the SHA-256 of the canonical JSON array
//! `[0, pubkey, created_at, kind, tags, content]`. Signatures are BIP-340
//! Schnorr over the id.

use rand::{CryptoRng, RngCore};
use secp256k1::{Message, Secp256k1, schnorr::Signature};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    error::CryptoError,
    keys::{IdentityKeys, PublicKey},
};

/// Seal layer of an envelope
pub const KIND_SEAL: u16 = 13;

/// Innermost, unsigned message of an envelope
pub const KIND_RUMOR: u16 = 14;

/// Outer layer of an envelope, published to relays
pub const KIND_GIFT_WRAP: u16 = 1059;

/// Delegated signer request/response transport
pub const KIND_SIGNER_MESSAGE: u16 = 24133;

/// Event fields covered by the id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedEvent {
    /// Author
    pub pubkey: PublicKey,
    /// Unix seconds
    pub created_at: i64,
    /// Event kind
    pub kind: u16,
    /// Tag lists, first element is the tag name
    pub tags: Vec<Vec<String>>,
    /// Content, often ciphertext
    pub content: String,
}

impl UnsignedEvent {
    /// Hex-encoded event id.
    pub fn id(&self) -> Result<String, CryptoError> {
        self.id_bytes().map(hex::encode)
    }

    fn id_bytes(&self) -> Result<[u8; 32], CryptoError> {
        let canonical =
            serde_json::to_string(&(0, &self.pubkey, self.created_at, self.kind, &self.tags, &self.content))
                .map_err(|e| CryptoError::Serialization { reason: e.to_string() })?;
        Ok(Sha256::digest(canonical.as_bytes()).into())
    }

    /// Sign with `keys`, which must belong to `pubkey`.
    ///
    /// # Errors
    ///
    /// - `PubkeyMismatch`: `keys` is not the author
    pub fn sign<R: RngCore + CryptoRng>(
        self,
        keys: &IdentityKeys,
        rng: &mut R,
    ) -> Result<Event, CryptoError> {
        if keys.public_key() != self.pubkey {
            return Err(CryptoError::PubkeyMismatch);
        }

        let id = self.id_bytes()?;
        let mut aux = [0u8; 32];
        rng.fill_bytes(&mut aux);

        let secp = Secp256k1::signing_only();
        let sig = secp.sign_schnorr_with_aux_rand(&Message::from_digest(id), &keys.keypair(), &aux);

        Ok(Event {
            id: hex::encode(id),
            pubkey: self.pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig: hex::encode(sig.serialize()),
        })
    }
}

/// A signed event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Hex SHA-256 of the canonical serialization
    pub id: String,
    /// Author
    pub pubkey: PublicKey,
    /// Unix seconds
    pub created_at: i64,
    /// Event kind
    pub kind: u16,
    /// Tag lists, first element is the tag name
    pub tags: Vec<Vec<String>>,
    /// Content, often ciphertext
    pub content: String,
    /// Hex Schnorr signature over the id
    pub sig: String,
}

impl Event {
    /// Fields covered by the id.
    pub fn unsigned(&self) -> UnsignedEvent {
        UnsignedEvent {
            pubkey: self.pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags.clone(),
            content: self.content.clone(),
        }
    }

    /// Check that the id matches the fields and the signature matches the id.
    pub fn verify(&self) -> bool {
        let Ok(id) = self.unsigned().id_bytes() else {
            return false;
        };
        if hex::encode(id) != self.id {
            return false;
        }

        let Ok(sig_bytes) = hex::decode(&self.sig) else {
            return false;
        };
        let Ok(sig) = Signature::from_slice(&sig_bytes) else {
            return false;
        };

        Secp256k1::verification_only()
            .verify_schnorr(&sig, &Message::from_digest(id), &self.pubkey.to_x_only())
            .is_ok()
    }

    /// First value of the first tag named `name`.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        tag_value(&self.tags, name)
    }
}

pub(crate) fn tag_value<'a>(tags: &'a [Vec<String>], name: &str) -> Option<&'a str> {
    tags.iter()
        .find(|tag| tag.first().is_some_and(|tag_name| tag_name == name))
        .and_then(|tag| tag.get(1))
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;

    fn sample(keys: &IdentityKeys) -> UnsignedEvent {
        UnsignedEvent {
            pubkey: keys.public_key(),
            created_at: 1_700_000_000,
            kind: 1,
            tags: vec![vec!["p".into(), "abc".into()]],
            content: "hello".into(),
        }
    }

    #[test]
    fn id_matches_canonical_serialization() {
        let mut rng = ChaCha20Rng::seed_from_u64(40);
        let keys = IdentityKeys::generate(&mut rng);
        let unsigned = sample(&keys);

        let canonical = format!(
            "[0,\"{}\",1700000000,1,[[\"p\",\"abc\"]],\"hello\"]",
            keys.public_key().to_hex()
        );
        assert_eq!(unsigned.id().unwrap(), hex::encode(Sha256::digest(canonical.as_bytes())));
    }

    #[test]
    fn signed_event_verifies() {
        let mut rng = ChaCha20Rng::seed_from_u64(41);
        let keys = IdentityKeys::generate(&mut rng);
        let event = sample(&keys).sign(&keys, &mut rng).unwrap();

        assert!(event.verify());
        assert_eq!(event.sig.len(), 128);
    }

    #[test]
    fn tampered_content_fails_verification() {
        let mut rng = ChaCha20Rng::seed_from_u64(42);
        let keys = IdentityKeys::generate(&mut rng);
        let mut event = sample(&keys).sign(&keys, &mut rng).unwrap();
        event.content.push('!');

        assert!(!event.verify());
    }

    #[test]
    fn foreign_signature_fails_verification() {
        let mut rng = ChaCha20Rng::seed_from_u64(43);
        let alice = IdentityKeys::generate(&mut rng);
        let mallory = IdentityKeys::generate(&mut rng);

        let mut forged = sample(&mallory).sign(&mallory, &mut rng).unwrap();
        forged.pubkey = alice.public_key();
        forged.id = forged.unsigned().id().unwrap();

        assert!(!forged.verify());
    }

    #[test]
    fn signing_as_someone_else_is_rejected() {
        let mut rng = ChaCha20Rng::seed_from_u64(44);
        let alice = IdentityKeys::generate(&mut rng);
        let bob = IdentityKeys::generate(&mut rng);

        assert_eq!(sample(&alice).sign(&bob, &mut rng).unwrap_err(), CryptoError::PubkeyMismatch);
    }

    #[test]
    fn tag_lookup() {
        let mut rng = ChaCha20Rng::seed_from_u64(45);
        let keys = IdentityKeys::generate(&mut rng);
        let event = sample(&keys).sign(&keys, &mut rng).unwrap();

        assert_eq!(event.tag_value("p"), Some("abc"));
        assert_eq!(event.tag_value("e"), None);
    }
}
