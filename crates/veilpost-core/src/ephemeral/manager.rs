//! Ephemeral message lifecycle
//!
//! ```text
//!   track_message ──► Tracked ──mark_as_read──► Counting(expires_at)
//!                        │                            │ sweep_expired
//!                        │ sweep_orphans              ▼
//!                        └──────────────► gone ◄── overwrite, delete, notify
//! ```
//!
//! Every state change is written to the store before it is applied in
//! memory, so a restart resumes pending expirations. Sweeps are explicit
//! calls; [`EphemeralManager::start`] drives them on the environment clock.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use rand::Rng;
use serde_json::Value;
use tokio::{sync::broadcast, task::JoinHandle};

use super::state::{
    EPHEMERAL_STATE_TABLE, EphemeralConfig, EphemeralEvent, EphemeralState, MESSAGES_TABLE,
    MIN_OVERWRITE_LEN,
};
use crate::{
    env::{EnvRng, Environment},
    error::EphemeralError,
    storage::{StorageError, Store},
};

/// Undelivered notifications kept per subscriber
const EVENT_BUFFER: usize = 256;

/// Tracks disappearing messages and destroys them once expired.
pub struct EphemeralManager<S: Store, E: Environment> {
    inner: Arc<Inner<S, E>>,
}

struct Inner<S, E> {
    store: S,
    env: E,
    config: EphemeralConfig,
    states: Mutex<HashMap<String, EphemeralState>>,
    events: broadcast::Sender<EphemeralEvent>,
}

impl<S: Store, E: Environment> Clone for EphemeralManager<S, E> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<S: Store, E: Environment> EphemeralManager<S, E> {
    /// Manager with nothing tracked. Persisted state is ignored; use
    /// [`Self::load`] to resume.
    pub fn new(store: S, env: E, config: EphemeralConfig) -> Self {
        Self::with_states(store, env, config, HashMap::new())
    }

    /// Manager resuming every persisted state.
    ///
    /// Undecodable records are logged and skipped.
    pub fn load(store: S, env: E, config: EphemeralConfig) -> Result<Self, EphemeralError> {
        let mut states = HashMap::new();
        for (key, value) in store.get_all(EPHEMERAL_STATE_TABLE)? {
            match serde_json::from_value::<EphemeralState>(value) {
                Ok(state) => {
                    states.insert(state.message_id.clone(), state);
                },
                Err(err) => tracing::warn!(%key, error = %err, "skipping undecodable ephemeral state"),
            }
        }
        tracing::info!(tracked = states.len(), "ephemeral states loaded");

        Ok(Self::with_states(store, env, config, states))
    }

    fn with_states(
        store: S,
        env: E,
        config: EphemeralConfig,
        states: HashMap<String, EphemeralState>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self { inner: Arc::new(Inner { store, env, config, states: Mutex::new(states), events }) }
    }

    /// Start tracking a message. Tracking an already tracked id returns the
    /// existing state unchanged.
    pub fn track_message(
        &self,
        message_id: &str,
        conversation_id: &str,
        ttl: Duration,
    ) -> Result<EphemeralState, EphemeralError> {
        let mut states = self.states();
        if let Some(existing) = states.get(message_id) {
            return Ok(existing.clone());
        }

        let state = EphemeralState {
            message_id: message_id.to_owned(),
            conversation_id: conversation_id.to_owned(),
            ttl_secs: ttl.as_secs(),
            read_at: None,
            expires_at: None,
            tracked_at: self.inner.env.wall_clock_secs(),
        };
        self.inner.store.save(EPHEMERAL_STATE_TABLE, message_id, &state)?;
        states.insert(message_id.to_owned(), state.clone());

        Ok(state)
    }

    /// Record the first read and start the countdown.
    ///
    /// Compare-and-set on `read_at`: later calls, concurrent or not, return
    /// the expiry computed by the first.
    ///
    /// # Errors
    ///
    /// - `NotTracked`: unknown or already destroyed message
    pub fn mark_as_read(&self, message_id: &str) -> Result<u64, EphemeralError> {
        let mut states = self.states();
        let state = states
            .get_mut(message_id)
            .ok_or_else(|| EphemeralError::NotTracked { message_id: message_id.to_owned() })?;
        if let Some(expires_at) = state.expires_at {
            return Ok(expires_at);
        }

        let now = self.inner.env.wall_clock_secs();
        let expires_at = now.saturating_add(state.ttl_secs);
        let updated = EphemeralState { read_at: Some(now), expires_at: Some(expires_at), ..state.clone() };
        self.inner.store.save(EPHEMERAL_STATE_TABLE, message_id, &updated)?;
        *state = updated;

        Ok(expires_at)
    }

    /// Current state of a tracked message.
    pub fn state(&self, message_id: &str) -> Option<EphemeralState> {
        self.states().get(message_id).cloned()
    }

    /// Number of tracked messages.
    pub fn tracked_count(&self) -> usize {
        self.states().len()
    }

    /// Receive a notification for every destroyed message.
    pub fn subscribe(&self) -> broadcast::Receiver<EphemeralEvent> {
        self.inner.events.subscribe()
    }

    /// Destroy every message whose expiry has passed.
    ///
    /// A message is overwritten with random printable characters, the
    /// overwrite persisted, and only then deleted. Failures are logged and
    /// retried on the next sweep. Returns the destroyed ids.
    pub fn sweep_expired(&self) -> Vec<String> {
        let now = self.inner.env.wall_clock_secs();
        let due: Vec<EphemeralState> =
            self.states().values().filter(|state| state.is_expired(now)).cloned().collect();

        let mut destroyed = Vec::with_capacity(due.len());
        for state in due {
            if let Err(err) = self.destroy(&state) {
                tracing::warn!(message_id = %state.message_id, error = %err, "secure deletion failed, will retry");
                continue;
            }
            self.states().remove(&state.message_id);

            // No subscribers is fine
            let _ = self.inner.events.send(EphemeralEvent::Expired {
                message_id: state.message_id.clone(),
                conversation_id: state.conversation_id,
            });
            destroyed.push(state.message_id);
        }

        if !destroyed.is_empty() {
            tracing::info!(count = destroyed.len(), "expired messages destroyed");
        }
        destroyed
    }

    /// Drop tracking for messages whose record no longer exists.
    ///
    /// Returns the removed ids.
    pub fn sweep_orphans(&self) -> Vec<String> {
        let tracked: Vec<String> = self.states().keys().cloned().collect();

        let mut removed = Vec::new();
        for message_id in tracked {
            match self.inner.store.get(MESSAGES_TABLE, &message_id) {
                Ok(Some(_)) => continue,
                Ok(None) => {},
                Err(err) => {
                    tracing::warn!(%message_id, error = %err, "orphan check failed");
                    continue;
                },
            }

            if let Err(err) = self.inner.store.delete(EPHEMERAL_STATE_TABLE, &message_id) {
                tracing::warn!(%message_id, error = %err, "orphan removal failed");
                continue;
            }
            self.states().remove(&message_id);
            removed.push(message_id);
        }

        if !removed.is_empty() {
            tracing::info!(count = removed.len(), "orphaned ephemeral states removed");
        }
        removed
    }

    /// Run both sweeps on their intervals until the returned handle is
    /// stopped or dropped. The expiration sweep runs once immediately to
    /// catch messages that expired while offline.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> SweepTasks {
        let manager = self.clone();
        let interval = self.inner.config.expiration_interval;
        let expiration = tokio::spawn(async move {
            loop {
                manager.sweep_expired();
                manager.inner.env.sleep(interval).await;
            }
        });

        let manager = self.clone();
        let interval = self.inner.config.orphan_interval;
        let orphans = tokio::spawn(async move {
            loop {
                manager.inner.env.sleep(interval).await;
                manager.sweep_orphans();
            }
        });

        SweepTasks { expiration, orphans }
    }

    fn destroy(&self, state: &EphemeralState) -> Result<(), StorageError> {
        let store = &self.inner.store;
        if let Some(mut record) = store.get(MESSAGES_TABLE, &state.message_id)? {
            if let Value::Object(fields) = &mut record {
                let length = fields
                    .get("content")
                    .and_then(Value::as_str)
                    .map_or(0, str::len)
                    .max(MIN_OVERWRITE_LEN);
                fields.insert("content".to_owned(), Value::String(self.random_printable(length)));
            }
            store.put(MESSAGES_TABLE, &state.message_id, &record)?;
            store.delete(MESSAGES_TABLE, &state.message_id)?;
        }
        store.delete(EPHEMERAL_STATE_TABLE, &state.message_id)
    }

    fn random_printable(&self, length: usize) -> String {
        let mut rng = EnvRng(&self.inner.env);
        (0..length).map(|_| char::from(rng.gen_range(0x21u8..=0x7e))).collect()
    }

    fn states(&self) -> MutexGuard<'_, HashMap<String, EphemeralState>> {
        self.inner.states.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle owning the periodic sweep tasks. Dropping it stops them.
pub struct SweepTasks {
    expiration: JoinHandle<()>,
    orphans: JoinHandle<()>,
}

impl SweepTasks {
    /// Stop both sweeps.
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for SweepTasks {
    fn drop(&mut self) {
        self.expiration.abort();
        self.orphans.abort();
    }
}
