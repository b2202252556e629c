//! Fuzz target for both padding layers
//!
//! # Invariants
//!
//! - `unpad` and `remove_traffic_padding` NEVER panic on arbitrary input
//! - Padding then unpadding returns the original bytes, and the original
//!   text whenever it fit a bucket
//! - Padded lengths match `calc_padded_len` and `calculate_padded_size`

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use veilpost_crypto::padding::{
    apply_traffic_padding, calc_padded_len, calculate_padded_size, pad, remove_traffic_padding,
    unpad,
};

#[derive(Debug, Clone, Arbitrary)]
enum PaddingInput {
    RawPadded { bytes: Vec<u8> },
    RawTraffic { text: String },
    RoundTrip { seed: u64, text: String },
}

fuzz_target!(|input: PaddingInput| {
    match input {
        PaddingInput::RawPadded { bytes } => {
            let _ = unpad(&bytes);
        },

        PaddingInput::RawTraffic { text } => {
            let _ = remove_traffic_padding(&text);
        },

        PaddingInput::RoundTrip { seed, text } => {
            let mut rng = ChaCha20Rng::seed_from_u64(seed);
            let padded_text = apply_traffic_padding(&text, &mut rng);
            match calculate_padded_size(text.len()) {
                Some(bucket) => {
                    assert_eq!(padded_text.len(), bucket);
                    assert_eq!(remove_traffic_padding(&padded_text).ok(), Some(text.as_str()));
                },
                // Oversized text is sent as is, marker-like prefixes included
                None => assert_eq!(padded_text, text),
            }

            if let Ok(padded) = pad(text.as_bytes()) {
                assert_eq!(padded.len(), 2 + calc_padded_len(text.len()));
                assert_eq!(unpad(&padded).ok(), Some(text.as_bytes()));
            }
        },
    }
});
