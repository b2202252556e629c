//! Property-based tests for the message cipher and padding layers
//!
//! 1. **Round-trip**: decrypt(encrypt(m)) == m for every message
//! 2. **Size hiding**: ciphertext length depends only on the traffic bucket
//! 3. **Integrity**: any modified byte is rejected before decryption
//! 4. **Symmetry**: both parties derive the same conversation key

use base64::{Engine, engine::general_purpose::STANDARD};
use proptest::prelude::*;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use veilpost_crypto::{
    ConversationKey, CryptoError, IdentityKeys, TRAFFIC_BUCKETS, apply_traffic_padding,
    calc_padded_len, calculate_padded_size,
    cipher::{NONCE_SIZE, decrypt, decrypt_payload, encrypt, encrypt_payload},
    padding::{TRAFFIC_HEADER_SIZE, pad, unpad},
    remove_traffic_padding,
};

fn key_from(bytes: [u8; 32]) -> ConversationKey {
    ConversationKey::from_bytes(bytes)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// INVARIANT: decrypt(encrypt(m)) == m for all text up to the largest bucket.
    #[test]
    fn prop_encrypt_decrypt_roundtrip(
        text in ".{0,600}",
        key in any::<[u8; 32]>(),
        seed in any::<u64>(),
    ) {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let key = key_from(key);

        let payload = encrypt(&text, &key, &mut rng).unwrap();
        prop_assert_eq!(decrypt(&payload, &key).unwrap(), text);
    }

    /// INVARIANT: messages in the same traffic bucket produce ciphertexts of
    /// identical length.
    #[test]
    fn prop_same_bucket_same_ciphertext_length(
        a in 0usize..240,
        b in 0usize..240,
        seed in any::<u64>(),
    ) {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let key = key_from([7; 32]);

        let first = encrypt(&"a".repeat(a), &key, &mut rng).unwrap();
        let second = encrypt(&"b".repeat(b), &key, &mut rng).unwrap();
        prop_assert_eq!(first.len(), second.len());
    }

    /// INVARIANT: protocol unpad(pad(m)) == m and the padded size follows
    /// `calc_padded_len`.
    #[test]
    fn prop_protocol_padding_roundtrip(
        plaintext in prop::collection::vec(any::<u8>(), 1..3000),
    ) {
        let padded = pad(&plaintext).unwrap();
        prop_assert_eq!(padded.len(), 2 + calc_padded_len(plaintext.len()));
        prop_assert_eq!(unpad(&padded).unwrap(), plaintext.as_slice());
    }

    /// INVARIANT: padded length is monotonic and never smaller than the input.
    #[test]
    fn prop_padded_len_is_monotonic(len in 1usize..65535) {
        let padded = calc_padded_len(len);
        prop_assert!(padded >= len);
        prop_assert!(calc_padded_len(len + 1) >= padded);
    }

    /// INVARIANT: the chosen bucket is the smallest one that holds the
    /// content plus its header; nothing is chosen past the largest bucket.
    #[test]
    fn prop_bucket_is_smallest_fit(len in 0usize..70_000) {
        let needed = len + TRAFFIC_HEADER_SIZE;
        match calculate_padded_size(len) {
            Some(bucket) => {
                prop_assert!(TRAFFIC_BUCKETS.contains(&bucket));
                prop_assert!(bucket >= needed);
                prop_assert!(TRAFFIC_BUCKETS.iter().filter(|&&b| b < bucket).all(|&b| b < needed));
            },
            None => prop_assert!(needed > TRAFFIC_BUCKETS[TRAFFIC_BUCKETS.len() - 1]),
        }
    }

    /// INVARIANT: traffic padding lands exactly on a bucket and strips back
    /// to the original text.
    #[test]
    fn prop_traffic_padding_roundtrip(text in ".{0,300}", seed in any::<u64>()) {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let padded = apply_traffic_padding(&text, &mut rng);

        prop_assert_eq!(Some(padded.len()), calculate_padded_size(text.len()));
        prop_assert_eq!(remove_traffic_padding(&padded).unwrap(), text.as_str());
    }

    /// INVARIANT: flipping any bit after the version byte fails authentication.
    #[test]
    fn prop_tampering_is_detected(
        plaintext in prop::collection::vec(any::<u8>(), 1..200),
        nonce in any::<[u8; 32]>(),
        position in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let key = key_from([9; 32]);
        let payload = encrypt_payload(&plaintext, &key, &nonce).unwrap();
        let mut bytes = STANDARD.decode(payload).unwrap();

        let index = 1 + position.index(bytes.len() - 1);
        bytes[index] ^= 1 << bit;

        prop_assert_eq!(
            decrypt_payload(&STANDARD.encode(&bytes), &key).unwrap_err(),
            CryptoError::AuthenticationFailed
        );
    }

    /// INVARIANT: `ConversationKey(a, B) == ConversationKey(b, A)`.
    #[test]
    fn prop_conversation_key_symmetry(seed in any::<u64>()) {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let a = IdentityKeys::generate(&mut rng);
        let b = IdentityKeys::generate(&mut rng);

        prop_assert_eq!(
            ConversationKey::derive(&a, &b.public_key()),
            ConversationKey::derive(&b, &a.public_key())
        );
    }
}

#[test]
fn nonce_size_matches_payload_layout() {
    let key = key_from([1; 32]);
    let payload = encrypt_payload(b"x", &key, &[0; NONCE_SIZE]).unwrap();
    let bytes = STANDARD.decode(payload).unwrap();

    // version + nonce + (2 + 32 padded) + tag + mac
    assert_eq!(bytes.len(), 1 + NONCE_SIZE + 34 + 16 + 32);
}
