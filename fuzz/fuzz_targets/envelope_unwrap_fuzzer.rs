//! Fuzz target for gift wrap unwrapping
//!
//! # Strategy
//!
//! - Random events: arbitrary JSON shaped like an event
//! - Mutated wraps: a valid gift wrap with one field or content byte altered
//! - Random payloads: arbitrary strings fed straight to the message cipher
//!
//! # Invariants
//!
//! - Unwrap returns a result, NEVER panics
//! - A mutated content or signature never yields the original message with
//!   `seal_verified = true` from a different sender

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use veilpost_crypto::{ConversationKey, Event, IdentityKeys, cipher, envelope};

#[derive(Debug, Clone, Arbitrary)]
enum UnwrapAttack {
    RandomEvent { json: String },
    MutatedWrap { seed: u64, text: String, mutation: Mutation },
    RandomPayload { payload: String },
}

#[derive(Debug, Clone, Arbitrary)]
enum Mutation {
    FlipContentByte { index: u16, mask: u8 },
    TruncateContent { keep: u16 },
    ReplaceContent { content: String },
    ReplaceKind { kind: u16 },
    ReplaceSig { sig: String },
}

fuzz_target!(|attack: UnwrapAttack| {
    let recipient = keys(7);

    match attack {
        UnwrapAttack::RandomEvent { json } => {
            if let Ok(event) = serde_json::from_str::<Event>(&json) {
                let _ = envelope::unwrap(&event, &recipient);
            }
        },

        UnwrapAttack::MutatedWrap { seed, text, mutation } => {
            let sender = keys(3);
            let mut rng = ChaCha20Rng::seed_from_u64(seed);
            let Ok(mut gift_wrap) =
                envelope::wrap(&text, &sender, &recipient.public_key(), 1_700_000_000, &mut rng)
            else {
                return;
            };

            let original = gift_wrap.clone();
            match mutation {
                Mutation::FlipContentByte { index, mask } => {
                    let mut bytes = gift_wrap.content.into_bytes();
                    if !bytes.is_empty() {
                        let index = index as usize % bytes.len();
                        bytes[index] ^= mask;
                    }
                    gift_wrap.content = String::from_utf8_lossy(&bytes).into_owned();
                },
                Mutation::TruncateContent { keep } => {
                    let keep = (keep as usize).min(gift_wrap.content.len());
                    gift_wrap.content = gift_wrap.content.chars().take(keep).collect();
                },
                Mutation::ReplaceContent { content } => gift_wrap.content = content,
                Mutation::ReplaceKind { kind } => gift_wrap.kind = kind,
                Mutation::ReplaceSig { sig } => gift_wrap.sig = sig,
            }

            if let Ok(opened) = envelope::unwrap(&gift_wrap, &recipient) {
                if gift_wrap.content != original.content && opened.seal_verified {
                    assert_eq!(opened.sender, sender.public_key());
                }
            }
        },

        UnwrapAttack::RandomPayload { payload } => {
            let key = ConversationKey::derive(&recipient, &keys(3).public_key());
            let _ = cipher::decrypt(&payload, &key);
        },
    }
});

fn keys(byte: u8) -> IdentityKeys {
    let Ok(keys) = IdentityKeys::from_secret_bytes(&[byte; 32]) else {
        unreachable!("small repeated byte is a valid secret key")
    };
    keys
}
