//! Pairwise conversation keys
//!
//! Both parties derive the same key: ECDH over secp256k1 (x-only peer key
//! lifted to even parity), then HKDF-extract of the shared x-coordinate.

use std::fmt;

use hkdf::Hkdf;
use secp256k1::{Parity, PublicKey as CurvePoint, ecdh};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::keys::{IdentityKeys, PublicKey};

/// Salt for conversation key extraction
const CONVERSATION_KEY_SALT: &[u8] = b"nip44-v2";

/// Symmetric key shared by two identities.
#[derive(Clone, PartialEq, Eq, ZeroizeOnDrop)]
pub struct ConversationKey([u8; 32]);

impl ConversationKey {
    /// Derive the key shared between `ours` and `peer`.
    ///
    /// Symmetric: `derive(a, B) == derive(b, A)`.
    pub fn derive(ours: &IdentityKeys, peer: &PublicKey) -> Self {
        let point = CurvePoint::from_x_only_public_key(peer.to_x_only(), Parity::Even);
        let mut shared = ecdh::shared_secret_point(&point, &ours.secret_key());

        let (prk, _) = Hkdf::<Sha256>::extract(Some(CONVERSATION_KEY_SALT), &shared[..32]);
        shared.zeroize();

        let mut key = [0u8; 32];
        key.copy_from_slice(&prk);
        Self(key)
    }

    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConversationKey(..)")
    }
}
