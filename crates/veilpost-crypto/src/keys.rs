//! secp256k1 identity keys
//!
//! Public keys travel as 32-byte x-only points encoded in lowercase hex.
//! Secret keys never leave [`IdentityKeys`] except through
//! [`IdentityKeys::secret_bytes`], which the key hierarchy uses to seal them.

use std::{fmt, str::FromStr};

use rand::{CryptoRng, RngCore};
use secp256k1::{Keypair, Secp256k1, SecretKey, XOnlyPublicKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Size of a serialized x-only public key
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of a serialized secret key
pub const SECRET_KEY_SIZE: usize = 32;

/// x-only secp256k1 public key.
///
/// Always holds a point that is on the curve; construction validates.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    /// Parse and validate 32 raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let point = XOnlyPublicKey::from_slice(bytes).map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self(point.serialize()))
    }

    /// Parse and validate a 64-character hex string.
    pub fn from_hex(hex_str: &str) -> Result<Self, CryptoError> {
        if hex_str.len() != PUBLIC_KEY_SIZE * 2 {
            return Err(CryptoError::InvalidPublicKey);
        }
        let bytes = hex::decode(hex_str).map_err(|_| CryptoError::InvalidPublicKey)?;
        Self::from_bytes(&bytes)
    }

    /// Raw x-only bytes.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    /// Lowercase hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub(crate) fn to_x_only(self) -> XOnlyPublicKey {
        let Ok(point) = XOnlyPublicKey::from_slice(&self.0) else {
            unreachable!("PublicKey is validated on construction");
        };
        point
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

impl FromStr for PublicKey {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Self::from_hex(&encoded).map_err(serde::de::Error::custom)
    }
}

/// A secp256k1 identity: secret scalar plus its x-only public key.
///
/// The secret is zeroized on drop. `Debug` never prints it.
#[derive(Clone, ZeroizeOnDrop)]
pub struct IdentityKeys {
    secret: [u8; SECRET_KEY_SIZE],
    #[zeroize(skip)]
    public: PublicKey,
}

impl IdentityKeys {
    /// Generate a fresh identity from the provided RNG.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        loop {
            let mut candidate = [0u8; SECRET_KEY_SIZE];
            rng.fill_bytes(&mut candidate);
            let parsed = Self::from_secret_bytes(&candidate);
            candidate.zeroize();
            // Out-of-range scalars occur with probability ~2^-128
            if let Ok(keys) = parsed {
                return keys;
            }
        }
    }

    /// Rebuild an identity from its 32-byte secret.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let secret_key = SecretKey::from_slice(bytes).map_err(|_| CryptoError::InvalidSecretKey)?;
        let secp = Secp256k1::signing_only();
        let keypair = Keypair::from_secret_key(&secp, &secret_key);
        let (x_only, _parity) = keypair.x_only_public_key();

        Ok(Self { secret: secret_key.secret_bytes(), public: PublicKey(x_only.serialize()) })
    }

    /// Parse a 64-character hex secret.
    pub fn from_secret_hex(hex_str: &str) -> Result<Self, CryptoError> {
        let mut bytes = hex::decode(hex_str).map_err(|_| CryptoError::InvalidSecretKey)?;
        let keys = Self::from_secret_bytes(&bytes);
        bytes.zeroize();
        keys
    }

    /// Public half of the identity.
    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// Raw secret scalar.
    ///
    /// Only for sealing the key under a master key or for handing it to a
    /// platform secure store. Never log or persist this in the clear.
    pub fn secret_bytes(&self) -> &[u8; SECRET_KEY_SIZE] {
        &self.secret
    }

    pub(crate) fn secret_key(&self) -> SecretKey {
        let Ok(secret_key) = SecretKey::from_slice(&self.secret) else {
            unreachable!("IdentityKeys holds a validated secret");
        };
        secret_key
    }

    pub(crate) fn keypair(&self) -> Keypair {
        Keypair::from_secret_key(&Secp256k1::signing_only(), &self.secret_key())
    }
}

impl fmt::Debug for IdentityKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeys").field("public", &self.public).finish_non_exhaustive()
    }
}
