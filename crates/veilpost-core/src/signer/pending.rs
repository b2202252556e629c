//! Pending-request table
//!
//! Single authority for request completion. A response, the request's
//! timeout, and a disconnect all race to remove the same entry; whichever
//! removes it completes the caller's future, so each request resolves
//! exactly once.
//!
//! ```text
//!           register
//!   Idle ─────────────► Sent ──resolve───► Fulfilled
//!                         │ ───expire────► TimedOut
//!                         └───cancel*────► Cancelled (Disconnected)
//! ```

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::{sync::oneshot, task::JoinHandle};

use super::message::Method;
use crate::{env::Environment, error::SignerError};

/// Future side of a pending request.
pub type PendingReply = oneshot::Receiver<Result<String, SignerError>>;

struct PendingRequest {
    method: Method,
    timeout: Duration,
    reply: oneshot::Sender<Result<String, SignerError>>,
    timer: Option<JoinHandle<()>>,
}

/// Table of in-flight requests keyed by request id. Clones share the table.
#[derive(Clone, Default)]
pub struct PendingRequests {
    entries: Arc<Mutex<HashMap<String, PendingRequest>>>,
}

impl PendingRequests {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sent request and arm its timeout.
    ///
    /// Must be called from within a tokio runtime. Re-registering a live id
    /// cancels the older entry.
    pub fn register<E: Environment>(
        &self,
        id: &str,
        method: Method,
        timeout: Duration,
        env: &E,
    ) -> PendingReply {
        let (reply, receiver) = oneshot::channel();
        let previous = self
            .lock()
            .insert(id.to_owned(), PendingRequest { method, timeout, reply, timer: None });
        if let Some(previous) = previous {
            Self::complete(previous, Err(SignerError::Disconnected));
        }

        let table = self.clone();
        let timer_env = env.clone();
        let timer_id = id.to_owned();
        let timer = tokio::spawn(async move {
            timer_env.sleep(timeout).await;
            table.expire(&timer_id);
        });

        match self.lock().get_mut(id) {
            Some(entry) => entry.timer = Some(timer),
            // Already resolved before the timer was attached
            None => timer.abort(),
        }

        receiver
    }

    /// Complete a request with the response outcome.
    ///
    /// Returns false, and changes nothing, when no request is pending under
    /// `id` (stale, duplicate or foreign response).
    pub fn resolve(&self, id: &str, outcome: Result<String, SignerError>) -> bool {
        let Some(entry) = self.lock().remove(id) else {
            tracing::debug!(id, "dropping response for unknown request");
            return false;
        };
        Self::complete(entry, outcome);
        true
    }

    /// Fail a request with `RequestTimedOut`. No-op if already completed.
    pub fn expire(&self, id: &str) -> bool {
        let Some(entry) = self.lock().remove(id) else {
            return false;
        };
        tracing::warn!(id, method = %entry.method, "signer request timed out");

        let err = SignerError::RequestTimedOut {
            id: id.to_owned(),
            method: entry.method.to_string(),
            timeout: entry.timeout,
        };
        Self::complete(entry, Err(err));
        true
    }

    /// Fail one request with `Disconnected`.
    pub fn cancel(&self, id: &str) -> bool {
        let Some(entry) = self.lock().remove(id) else {
            return false;
        };
        Self::complete(entry, Err(SignerError::Disconnected));
        true
    }

    /// Fail every pending request with `Disconnected` and clear the table.
    ///
    /// Returns the number of requests cancelled.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<PendingRequest> = self.lock().drain().map(|(_, entry)| entry).collect();
        let count = drained.len();
        for entry in drained {
            Self::complete(entry, Err(SignerError::Disconnected));
        }
        count
    }

    /// Number of requests awaiting completion.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Whether `id` is pending.
    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Method of the pending request `id`.
    pub fn method(&self, id: &str) -> Option<Method> {
        self.lock().get(id).map(|entry| entry.method)
    }

    fn complete(entry: PendingRequest, outcome: Result<String, SignerError>) {
        if let Some(timer) = entry.timer {
            timer.abort();
        }
        // Caller may have stopped waiting
        let _ = entry.reply.send(outcome);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Await a pending reply. A dropped sender counts as a disconnect.
pub async fn wait(reply: PendingReply) -> Result<String, SignerError> {
    reply.await.unwrap_or(Err(SignerError::Disconnected))
}
