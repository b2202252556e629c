//! Fuzz target for `bunker://` connection string parsing
//!
//! # Invariants
//!
//! - Parsing NEVER panics
//! - Every accepted descriptor has at least one relay and no duplicates
//! - Re-parsing the displayed form yields the same descriptor

#![no_main]

use libfuzzer_sys::fuzz_target;
use veilpost_core::parse_connection_string;

fuzz_target!(|input: &str| {
    let Ok(descriptor) = parse_connection_string(input) else {
        return;
    };

    assert!(!descriptor.relays.is_empty());
    for (i, relay) in descriptor.relays.iter().enumerate() {
        assert!(!descriptor.relays[i + 1..].contains(relay));
    }

    let reparsed = parse_connection_string(&descriptor.to_string());
    assert_eq!(reparsed.ok(), Some(descriptor));
});
