//! Relay/transport collaborator
//!
//! Services hand signed events to a [`Relay`] and consume matching events as
//! a stream. Connection management lives behind the trait.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::{
    StreamExt,
    stream::{self, BoxStream},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use veilpost_crypto::{Event, PublicKey};

/// Live events buffered per subscriber before the slowest one lags
const SUBSCRIBER_BUFFER: usize = 1024;

/// Errors from the relay collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Relay refused the event
    #[error("relay rejected event: {0}")]
    Rejected(String),

    /// Relay connection is gone
    #[error("relay connection closed")]
    Closed,
}

/// Stream of events matching a subscription filter.
pub type Subscription = BoxStream<'static, Event>;

/// Subscription filter. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Event ids
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<String>,
    /// Event authors
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<PublicKey>,
    /// Event kinds
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kinds: Vec<u16>,
    /// Values of `p` tags
    #[serde(rename = "#p", default, skip_serializing_if = "Vec::is_empty")]
    pub pubkey_tags: Vec<PublicKey>,
    /// Oldest `created_at` to include
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,
    /// Newest `created_at` to include
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<i64>,
}

impl Filter {
    /// Filter matching everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Also match `kind`.
    #[must_use]
    pub fn kind(mut self, kind: u16) -> Self {
        self.kinds.push(kind);
        self
    }

    /// Also match events by `author`.
    #[must_use]
    pub fn author(mut self, author: PublicKey) -> Self {
        self.authors.push(author);
        self
    }

    /// Also match events tagging `pubkey`.
    #[must_use]
    pub fn pubkey_tag(mut self, pubkey: PublicKey) -> Self {
        self.pubkey_tags.push(pubkey);
        self
    }

    /// Only events at or after `since`.
    #[must_use]
    pub fn since(mut self, since: i64) -> Self {
        self.since = Some(since);
        self
    }

    /// Whether `event` passes every populated field.
    pub fn matches(&self, event: &Event) -> bool {
        if !self.ids.is_empty() && !self.ids.contains(&event.id) {
            return false;
        }
        if !self.authors.is_empty() && !self.authors.contains(&event.pubkey) {
            return false;
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind) {
            return false;
        }
        if !self.pubkey_tags.is_empty() {
            let tagged = event.tags.iter().any(|tag| {
                tag.first().is_some_and(|name| name == "p")
                    && tag.get(1).is_some_and(|value| {
                        self.pubkey_tags.iter().any(|pubkey| pubkey.to_hex() == *value)
                    })
            });
            if !tagged {
                return false;
            }
        }
        if self.since.is_some_and(|since| event.created_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| event.created_at > until) {
            return false;
        }
        true
    }
}

/// Publish/subscribe transport for signed events.
#[async_trait]
pub trait Relay: Clone + Send + Sync + 'static {
    /// Publish an event.
    async fn publish(&self, event: Event) -> Result<(), RelayError>;

    /// Stored events matching `filter`, followed by live ones.
    async fn subscribe(&self, filter: Filter) -> Result<Subscription, RelayError>;
}

/// In-process relay. Keeps every published event and fans new ones out to
/// live subscribers.
#[derive(Clone)]
pub struct MemoryRelay {
    inner: Arc<Mutex<MemoryRelayInner>>,
}

struct MemoryRelayInner {
    events: Vec<Event>,
    live: broadcast::Sender<Event>,
}

impl MemoryRelay {
    /// Create an empty relay.
    pub fn new() -> Self {
        let (live, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        Self { inner: Arc::new(Mutex::new(MemoryRelayInner { events: Vec::new(), live })) }
    }

    /// Every event published so far.
    pub fn events(&self) -> Vec<Event> {
        self.lock().events.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryRelayInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Relay for MemoryRelay {
    async fn publish(&self, event: Event) -> Result<(), RelayError> {
        let mut inner = self.lock();
        inner.events.push(event.clone());
        // No live subscribers is not an error
        let _ = inner.live.send(event);
        Ok(())
    }

    async fn subscribe(&self, filter: Filter) -> Result<Subscription, RelayError> {
        // Snapshot and receiver are taken under one lock: nothing is missed
        // or delivered twice.
        let (backlog, receiver) = {
            let inner = self.lock();
            let backlog: Vec<Event> =
                inner.events.iter().filter(|event| filter.matches(event)).cloned().collect();
            (backlog, inner.live.subscribe())
        };

        let live = stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => return Some((event, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "relay subscriber lagged");
                    },
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .filter(move |event| std::future::ready(filter.matches(event)));

        Ok(stream::iter(backlog).chain(live).boxed())
    }
}
