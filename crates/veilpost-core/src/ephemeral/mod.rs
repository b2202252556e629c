//! Ephemeral message lifecycle manager
//!
//! Disappearing messages start counting down on first read and are
//! securely destroyed by a periodic sweep once their TTL has passed.

mod manager;
mod state;

pub use manager::{EphemeralManager, SweepTasks};
pub use state::{
    DEFAULT_EXPIRATION_INTERVAL, DEFAULT_ORPHAN_INTERVAL, EPHEMERAL_STATE_TABLE, EphemeralConfig,
    EphemeralEvent, EphemeralState, MESSAGES_TABLE, MIN_OVERWRITE_LEN,
};
