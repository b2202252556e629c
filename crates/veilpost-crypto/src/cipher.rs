//! Versioned symmetric message cipher
//!
//! Payload layout, base64 encoded:
//!
//! ```text
//! version (1) | nonce (32) | ChaCha20-Poly1305 ciphertext | HMAC-SHA256 (32)
//! ```
//!
//! Per-message keys come from HKDF over the conversation key, with the
//! payload nonce as salt. The HMAC covers `nonce | ciphertext` and is
//! checked in constant time before the cipher runs.

use base64::{Engine, engine::general_purpose::STANDARD};
use chacha20poly1305::{
    ChaCha20Poly1305, Nonce,
    aead::{Aead, KeyInit},
};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::{CryptoRng, RngCore};
use sha2::Sha256;
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::{
    conversation::ConversationKey,
    error::CryptoError,
    padding::{apply_traffic_padding, pad, remove_traffic_padding, unpad},
};

type HmacSha256 = Hmac<Sha256>;

/// Payload format version
pub const VERSION: u8 = 2;

/// Payload nonce size
pub const NONCE_SIZE: usize = 32;

const MAC_SIZE: usize = 32;

/// version + nonce + smallest padded block (2 + 32) + Poly1305 tag + MAC
const MIN_PAYLOAD_SIZE: usize = 1 + NONCE_SIZE + 34 + 16 + MAC_SIZE;

/// version + nonce + largest padded block (2 + 65536) + Poly1305 tag + MAC
const MAX_PAYLOAD_SIZE: usize = 1 + NONCE_SIZE + 65_538 + 16 + MAC_SIZE;

const MESSAGE_KEYS_INFO: &[u8] = b"nip44-v2";

#[derive(ZeroizeOnDrop)]
struct MessageKeys {
    cipher_key: [u8; 32],
    cipher_nonce: [u8; 12],
    mac_key: [u8; 32],
}

impl MessageKeys {
    fn derive(conversation_key: &ConversationKey, nonce: &[u8; NONCE_SIZE]) -> Self {
        let hkdf = Hkdf::<Sha256>::new(Some(nonce.as_slice()), conversation_key.as_bytes());

        let mut okm = Zeroizing::new([0u8; 76]);
        let Ok(()) = hkdf.expand(MESSAGE_KEYS_INFO, okm.as_mut_slice()) else {
            unreachable!("76 bytes is a valid HKDF-SHA256 output length");
        };

        let mut keys = Self { cipher_key: [0; 32], cipher_nonce: [0; 12], mac_key: [0; 32] };
        keys.cipher_key.copy_from_slice(&okm[..32]);
        keys.cipher_nonce.copy_from_slice(&okm[32..44]);
        keys.mac_key.copy_from_slice(&okm[44..76]);
        keys
    }

    fn mac(&self) -> HmacSha256 {
        let Ok(mac) = <HmacSha256 as Mac>::new_from_slice(&self.mac_key) else {
            unreachable!("HMAC accepts keys of any length");
        };
        mac
    }
}

/// Encrypt a message with both padding layers.
///
/// Traffic padding is applied first, then the payload is sealed under a
/// fresh random nonce.
///
/// # Errors
///
/// - `InvalidPlaintextLength`: text too large to fit the payload format
pub fn encrypt<R: RngCore + CryptoRng>(
    plaintext: &str,
    key: &ConversationKey,
    rng: &mut R,
) -> Result<String, CryptoError> {
    let padded = Zeroizing::new(apply_traffic_padding(plaintext, rng));

    let mut nonce = [0u8; NONCE_SIZE];
    rng.fill_bytes(&mut nonce);

    encrypt_payload(padded.as_bytes(), key, &nonce)
}

/// Decrypt a message and strip both padding layers.
///
/// Malformed traffic padding is logged and the decrypted text returned as
/// it is. Authentication and protocol padding failures are errors.
///
/// # Errors
///
/// - `InvalidCiphertext`: not base64, wrong version or size
/// - `AuthenticationFailed`: MAC or AEAD tag mismatch
/// - `InvalidPaddingLength`: protocol padding is malformed
pub fn decrypt(payload: &str, key: &ConversationKey) -> Result<String, CryptoError> {
    let bytes = decrypt_payload(payload, key)?;
    let text = String::from_utf8(bytes)
        .map_err(|_| CryptoError::InvalidCiphertext { reason: "plaintext is not UTF-8" })?;

    match remove_traffic_padding(&text).map(ToOwned::to_owned) {
        Ok(content) => Ok(content),
        Err(err) => {
            tracing::warn!(error = %err, "malformed traffic padding, returning text as decrypted");
            Ok(text)
        },
    }
}

/// Seal raw bytes with protocol padding only, under a caller-chosen nonce.
///
/// Deterministic. Callers must never reuse a nonce under the same key.
pub fn encrypt_payload(
    plaintext: &[u8],
    key: &ConversationKey,
    nonce: &[u8; NONCE_SIZE],
) -> Result<String, CryptoError> {
    let padded = Zeroizing::new(pad(plaintext)?);
    let keys = MessageKeys::derive(key, nonce);

    let cipher = ChaCha20Poly1305::new((&keys.cipher_key).into());
    let Ok(ciphertext) = cipher.encrypt(Nonce::from_slice(&keys.cipher_nonce), padded.as_slice())
    else {
        unreachable!("ChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };

    let mut mac = keys.mac();
    mac.update(nonce);
    mac.update(&ciphertext);
    let tag = mac.finalize().into_bytes();

    let mut out = Vec::with_capacity(1 + NONCE_SIZE + ciphertext.len() + MAC_SIZE);
    out.push(VERSION);
    out.extend_from_slice(nonce);
    out.extend_from_slice(&ciphertext);
    out.extend_from_slice(&tag);

    Ok(STANDARD.encode(out))
}

/// Open a payload and remove protocol padding only.
pub fn decrypt_payload(payload: &str, key: &ConversationKey) -> Result<Vec<u8>, CryptoError> {
    let data = STANDARD
        .decode(payload)
        .map_err(|_| CryptoError::InvalidCiphertext { reason: "invalid base64" })?;

    if data.len() < MIN_PAYLOAD_SIZE {
        return Err(CryptoError::InvalidCiphertext { reason: "payload too short" });
    }
    if data.len() > MAX_PAYLOAD_SIZE {
        return Err(CryptoError::InvalidCiphertext { reason: "payload too long" });
    }
    if data[0] != VERSION {
        return Err(CryptoError::InvalidCiphertext { reason: "unsupported version" });
    }

    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&data[1..=NONCE_SIZE]);
    let (ciphertext, tag) = data[1 + NONCE_SIZE..].split_at(data.len() - 1 - NONCE_SIZE - MAC_SIZE);

    let keys = MessageKeys::derive(key, &nonce);
    let mut mac = keys.mac();
    mac.update(&nonce);
    mac.update(ciphertext);
    mac.verify_slice(tag).map_err(|_| CryptoError::AuthenticationFailed)?;

    let cipher = ChaCha20Poly1305::new((&keys.cipher_key).into());
    let padded = Zeroizing::new(
        cipher
            .decrypt(Nonce::from_slice(&keys.cipher_nonce), ciphertext)
            .map_err(|_| CryptoError::AuthenticationFailed)?,
    );

    Ok(unpad(&padded)?.to_vec())
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;
    use crate::padding::PADDING_MARKER;

    fn key() -> ConversationKey {
        ConversationKey::from_bytes([0x42; 32])
    }

    #[test]
    fn roundtrip() {
        let mut rng = ChaCha20Rng::seed_from_u64(30);
        let payload = encrypt("hello", &key(), &mut rng).unwrap();
        assert_eq!(decrypt(&payload, &key()).unwrap(), "hello");
    }

    #[test]
    fn empty_message_roundtrips_through_traffic_padding() {
        let mut rng = ChaCha20Rng::seed_from_u64(31);
        let payload = encrypt("", &key(), &mut rng).unwrap();
        assert_eq!(decrypt(&payload, &key()).unwrap(), "");
    }

    #[test]
    fn payload_starts_with_version() {
        let mut rng = ChaCha20Rng::seed_from_u64(32);
        let payload = encrypt("x", &key(), &mut rng).unwrap();
        let bytes = STANDARD.decode(payload).unwrap();
        assert_eq!(bytes[0], VERSION);
    }

    #[test]
    fn same_message_encrypts_differently() {
        let mut rng = ChaCha20Rng::seed_from_u64(33);
        let a = encrypt("same", &key(), &mut rng).unwrap();
        let b = encrypt("same", &key(), &mut rng).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn fixed_nonce_is_deterministic() {
        let a = encrypt_payload(b"abc", &key(), &[1; NONCE_SIZE]).unwrap();
        let b = encrypt_payload(b"abc", &key(), &[1; NONCE_SIZE]).unwrap();
        assert_eq!(a, b);
        assert_eq!(decrypt_payload(&a, &key()).unwrap(), b"abc");
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let mut rng = ChaCha20Rng::seed_from_u64(34);
        let payload = encrypt("secret", &key(), &mut rng).unwrap();
        let other = ConversationKey::from_bytes([0x43; 32]);
        assert_eq!(decrypt(&payload, &other).unwrap_err(), CryptoError::AuthenticationFailed);
    }

    #[test]
    fn any_flipped_byte_is_rejected() {
        let payload = encrypt_payload(b"tamper me", &key(), &[9; NONCE_SIZE]).unwrap();
        let bytes = STANDARD.decode(&payload).unwrap();

        for index in 1..bytes.len() {
            let mut tampered = bytes.clone();
            tampered[index] ^= 0x01;
            let result = decrypt_payload(&STANDARD.encode(&tampered), &key());
            assert_eq!(result.unwrap_err(), CryptoError::AuthenticationFailed, "byte {index}");
        }
    }

    #[test]
    fn unknown_version_is_rejected() {
        let payload = encrypt_payload(b"v", &key(), &[3; NONCE_SIZE]).unwrap();
        let mut bytes = STANDARD.decode(&payload).unwrap();
        bytes[0] = 1;
        assert_eq!(
            decrypt_payload(&STANDARD.encode(&bytes), &key()).unwrap_err(),
            CryptoError::InvalidCiphertext { reason: "unsupported version" }
        );
    }

    #[test]
    fn short_and_garbage_payloads_are_rejected() {
        assert!(matches!(
            decrypt_payload("not base64!!", &key()),
            Err(CryptoError::InvalidCiphertext { .. })
        ));
        assert!(matches!(
            decrypt_payload(&STANDARD.encode([2u8; 40]), &key()),
            Err(CryptoError::InvalidCiphertext { .. })
        ));
    }

    #[test]
    fn malformed_traffic_padding_returns_text_as_decrypted() {
        let text = format!("{PADDING_MARKER}99999short");
        let payload = encrypt_payload(text.as_bytes(), &key(), &[5; NONCE_SIZE]).unwrap();
        assert_eq!(decrypt(&payload, &key()).unwrap(), text);
    }

    #[test]
    fn plaintext_beyond_largest_bucket_is_sent_unpadded() {
        let mut rng = ChaCha20Rng::seed_from_u64(35);
        let text = "y".repeat(65_100);
        let payload = encrypt(&text, &key(), &mut rng).unwrap();
        assert_eq!(decrypt(&payload, &key()).unwrap(), text);
    }

    #[test]
    fn oversized_plaintext_is_rejected() {
        let mut rng = ChaCha20Rng::seed_from_u64(36);
        let text = "z".repeat(70_000);
        assert_eq!(
            encrypt(&text, &key(), &mut rng).unwrap_err(),
            CryptoError::InvalidPlaintextLength { length: 70_000 }
        );
    }
}
