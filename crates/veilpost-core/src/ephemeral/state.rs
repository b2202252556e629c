use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Table of persisted [`EphemeralState`] records
pub const EPHEMERAL_STATE_TABLE: &str = "ephemeral_state";

/// Table of message records the states refer to
pub const MESSAGES_TABLE: &str = "messages";

/// Default period of the expiration sweep
pub const DEFAULT_EXPIRATION_INTERVAL: Duration = Duration::from_secs(30);

/// Default period of the orphan sweep
pub const DEFAULT_ORPHAN_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Shortest overwrite written over expiring content
pub const MIN_OVERWRITE_LEN: usize = 32;

/// Lifecycle of one disappearing message.
///
/// `expires_at` is set exactly once, on the first read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EphemeralState {
    /// Message record key
    pub message_id: String,
    /// Conversation the message belongs to
    pub conversation_id: String,
    /// Seconds the message survives after being read
    pub ttl_secs: u64,
    /// Unix seconds of the first read
    pub read_at: Option<u64>,
    /// Unix seconds after which the message is destroyed
    pub expires_at: Option<u64>,
    /// Unix seconds tracking started
    pub tracked_at: u64,
}

impl EphemeralState {
    /// Whether the message is due for destruction at `now`.
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }
}

/// Notifications for subscribers (UI, caches).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EphemeralEvent {
    /// Message content was overwritten and the record deleted
    Expired {
        /// Deleted message
        message_id: String,
        /// Its conversation
        conversation_id: String,
    },
}

/// Sweep periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EphemeralConfig {
    /// Period of the expiration sweep
    pub expiration_interval: Duration,
    /// Period of the orphan sweep
    pub orphan_interval: Duration,
}

impl Default for EphemeralConfig {
    fn default() -> Self {
        Self {
            expiration_interval: DEFAULT_EXPIRATION_INTERVAL,
            orphan_interval: DEFAULT_ORPHAN_INTERVAL,
        }
    }
}
