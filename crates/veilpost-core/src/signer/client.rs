//! Delegated signer client
//!
//! Each [`SignerClient`] owns at most one live connection to a remote signer.
//! Requests travel as encrypted kind-24133 events signed by a per-connection
//! session key; a background listener feeds responses into the
//! [`PendingRequests`] table, which completes each caller's future.
//!
//! ```text
//!   caller ──request──► PendingRequests::register ──publish──► relay
//!      ▲                        │                               │
//!      └──── oneshot ◄── resolve/expire/cancel ◄── listener ◄───┘
//! ```
//!
//! # Security
//!
//! - The session secret lives in the secure store, never in the plain store
//! - Only events authored by the remote key and tagged to the session key are
//!   decrypted
//! - Signed events are verified before they are returned

use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use veilpost_crypto::{
    ConversationKey, CryptoError, Event, IdentityKeys, KIND_SIGNER_MESSAGE, PublicKey, UnsignedEvent, cipher,
};

use super::{
    message::{Message, Method, PERMISSION_DENIED, Request, Response},
    pending::{self, PendingRequests},
    uri::ConnectionDescriptor,
};
use crate::{
    env::{EnvRng, Environment},
    error::SignerError,
    relay::{Filter, Relay, Subscription},
    secure_store::SecureStore,
    storage::{StorageError, Store},
};

/// Table of persisted signer connections
pub const CONNECTIONS_TABLE: &str = "signer_connections";

/// Default deadline for a signer response
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Result text of an accepted `connect`
pub const CONNECT_ACK: &str = "ack";

/// Secure-storage label of a connection's session secret.
pub fn session_key_label(connection_id: &str) -> String {
    format!("veilpost.signer-session.{connection_id}")
}

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignerConfig {
    /// Deadline for each request
    pub request_timeout: Duration,
    /// Methods requested from the remote signer on connect
    pub permissions: Vec<Method>,
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self { request_timeout: DEFAULT_REQUEST_TIMEOUT, permissions: Method::ALL.to_vec() }
    }
}

/// Approval state of a stored connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Connect request sent, not yet acknowledged
    Pending,
    /// Remote signer accepted the connection
    Approved,
    /// Remote signer refused, or the user removed the grant
    Revoked,
}

/// Persisted connection, enough to reconnect without a new handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    /// Connection id
    pub id: String,
    /// Remote signer key
    pub remote_pubkey: PublicKey,
    /// Relays the remote signer listens on
    pub relays: Vec<String>,
    /// Methods requested on connect
    pub permissions: Vec<Method>,
    /// Approval state
    pub status: ConnectionStatus,
    /// Unix seconds
    pub created_at: u64,
}

struct ActiveSession {
    connection_id: String,
    keys: IdentityKeys,
    remote: PublicKey,
    conversation: ConversationKey,
    listener: JoinHandle<()>,
}

/// Copy of the session secrets taken for one request, so no lock is held
/// across an await.
struct SessionKeys {
    connection_id: String,
    keys: IdentityKeys,
    remote: PublicKey,
    conversation: ConversationKey,
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

/// Client side of the delegated signer protocol.
///
/// Every method takes `&self`; share the client behind an `Arc` to issue
/// requests and disconnect from different tasks.
pub struct SignerClient<E, R, S, K>
where
    E: Environment,
    R: Relay,
    S: Store,
    K: SecureStore,
{
    env: E,
    relay: R,
    store: S,
    secure: K,
    config: SignerConfig,
    pending: PendingRequests,
    session: Mutex<Option<ActiveSession>>,
}

impl<E, R, S, K> SignerClient<E, R, S, K>
where
    E: Environment,
    R: Relay,
    S: Store,
    K: SecureStore,
{
    /// Disconnected client.
    pub fn new(env: E, relay: R, store: S, secure: K, config: SignerConfig) -> Self {
        Self {
            env,
            relay,
            store,
            secure,
            config,
            pending: PendingRequests::new(),
            session: Mutex::new(None),
        }
    }

    /// Open a new connection: fresh session key, `connect` handshake, and a
    /// persisted record on success.
    ///
    /// Any existing connection is closed first.
    ///
    /// # Errors
    ///
    /// - `Remote`: signer refused (record marked revoked)
    /// - `RequestTimedOut`, `Relay`: handshake did not complete (record left
    ///   pending)
    pub async fn connect(&self, descriptor: &ConnectionDescriptor) -> Result<String, SignerError> {
        self.disconnect();

        let keys = IdentityKeys::generate(&mut EnvRng(&self.env));
        let connection_id = self.env.random_id();

        self.secure.store(&session_key_label(&connection_id), keys.secret_bytes())?;
        let record = ConnectionRecord {
            id: connection_id.clone(),
            remote_pubkey: descriptor.remote_pubkey,
            relays: descriptor.relays.clone(),
            permissions: self.config.permissions.clone(),
            status: ConnectionStatus::Pending,
            created_at: self.env.wall_clock_secs(),
        };
        self.store.save(CONNECTIONS_TABLE, &connection_id, &record)?;

        self.open_session(connection_id.clone(), keys, descriptor.remote_pubkey).await?;
        tracing::info!(%connection_id, remote = %descriptor.remote_pubkey, "connecting to remote signer");

        let permissions =
            self.config.permissions.iter().map(|method| method.as_str()).collect::<Vec<_>>().join(",");
        let params = vec![
            descriptor.remote_pubkey.to_hex(),
            descriptor.secret.clone().unwrap_or_default(),
            permissions,
        ];

        match self.request(Method::Connect, params).await {
            Ok(result) if result == CONNECT_ACK || descriptor.secret.as_ref() == Some(&result) => {
                self.set_status(&connection_id, ConnectionStatus::Approved)?;
                tracing::info!(%connection_id, "remote signer approved connection");
                Ok(connection_id)
            },
            Ok(other) => {
                self.disconnect();
                Err(SignerError::InvalidResponse(format!("unexpected connect result {other:?}")))
            },
            Err(err) => {
                if matches!(err, SignerError::Remote { .. } | SignerError::PermissionDenied { .. }) {
                    self.set_status(&connection_id, ConnectionStatus::Revoked)?;
                }
                self.disconnect();
                Err(err)
            },
        }
    }

    /// Restore a stored, approved connection without a handshake.
    ///
    /// # Errors
    ///
    /// - `UnknownConnection`: no record or no stored session secret
    /// - `NotApproved`: record is pending or revoked
    pub async fn reconnect(&self, connection_id: &str) -> Result<(), SignerError> {
        let unknown = || SignerError::UnknownConnection { connection_id: connection_id.to_owned() };

        let record: ConnectionRecord =
            self.store.load(CONNECTIONS_TABLE, connection_id)?.ok_or_else(unknown)?;
        if record.status != ConnectionStatus::Approved {
            return Err(SignerError::NotApproved { connection_id: connection_id.to_owned() });
        }

        let secret = self.secure.retrieve(&session_key_label(connection_id))?.ok_or_else(unknown)?;
        let keys = IdentityKeys::from_secret_bytes(&secret)?;

        self.disconnect();
        self.open_session(connection_id.to_owned(), keys, record.remote_pubkey).await?;
        tracing::info!(connection_id, "reconnected to remote signer");

        Ok(())
    }

    /// Have the remote signer sign `unsigned` with its identity key.
    ///
    /// The author is replaced by the remote key. The returned event must
    /// verify, be authored by the remote key, and carry the requested kind,
    /// tags and content.
    ///
    /// # Errors
    ///
    /// - `InvalidSignature`: returned event fails any of the above
    pub async fn sign_event(&self, mut unsigned: UnsignedEvent) -> Result<Event, SignerError> {
        unsigned.pubkey = self.active()?.remote;

        let params = vec![serde_json::to_string(&unsigned)
            .map_err(|e| CryptoError::Serialization { reason: e.to_string() })?];
        let result = self.request(Method::SignEvent, params).await?;

        let event: Event = serde_json::from_str(&result)
            .map_err(|e| SignerError::InvalidResponse(format!("signed event: {e}")))?;
        if !event.verify() || event.unsigned() != unsigned {
            return Err(SignerError::InvalidSignature);
        }

        Ok(event)
    }

    /// Public key of the remote identity.
    pub async fn get_public_key(&self) -> Result<PublicKey, SignerError> {
        let result = self.request(Method::GetPublicKey, Vec::new()).await?;
        PublicKey::from_hex(&result)
            .map_err(|_| SignerError::InvalidResponse("public key is not valid hex".into()))
    }

    /// Encrypt `plaintext` for `peer` with the remote identity key.
    pub async fn encrypt(&self, peer: &PublicKey, plaintext: &str) -> Result<String, SignerError> {
        self.request(Method::Nip44Encrypt, vec![peer.to_hex(), plaintext.to_owned()]).await
    }

    /// Decrypt `ciphertext` from `peer` with the remote identity key.
    pub async fn decrypt(&self, peer: &PublicKey, ciphertext: &str) -> Result<String, SignerError> {
        self.request(Method::Nip44Decrypt, vec![peer.to_hex(), ciphertext.to_owned()]).await
    }

    /// Round-trip a `ping`.
    pub async fn ping(&self) -> Result<(), SignerError> {
        match self.request(Method::Ping, Vec::new()).await?.as_str() {
            "pong" => Ok(()),
            other => Err(SignerError::InvalidResponse(format!("unexpected ping result {other:?}"))),
        }
    }

    /// Deliver a response. Returns false when no request was waiting for it.
    pub fn handle_response(&self, response: Response) -> bool {
        deliver(&self.pending, response)
    }

    /// Close the live connection, failing every pending request with
    /// `Disconnected`. Stored records are kept for [`Self::reconnect`].
    pub fn disconnect(&self) {
        let Some(session) = self.session().take() else {
            return;
        };
        drop(session);

        let cancelled = self.pending.cancel_all();
        tracing::info!(cancelled, "disconnected from remote signer");
    }

    /// Forget a stored connection and its session secret.
    pub fn remove_connection(&self, connection_id: &str) -> Result<(), SignerError> {
        if self.connection_id().as_deref() == Some(connection_id) {
            self.disconnect();
        }
        self.store.delete(CONNECTIONS_TABLE, connection_id)?;
        self.secure.delete(&session_key_label(connection_id))?;
        Ok(())
    }

    /// Every stored connection.
    pub fn connections(&self) -> Result<Vec<ConnectionRecord>, SignerError> {
        self.store
            .get_all(CONNECTIONS_TABLE)?
            .into_iter()
            .map(|(_, value)| {
                serde_json::from_value(value)
                    .map_err(|e| SignerError::Storage(StorageError::Serialization(e.to_string())))
            })
            .collect()
    }

    /// Id of the live connection.
    pub fn connection_id(&self) -> Option<String> {
        self.session().as_ref().map(|session| session.connection_id.clone())
    }

    /// Requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    async fn open_session(
        &self,
        connection_id: String,
        keys: IdentityKeys,
        remote: PublicKey,
    ) -> Result<(), SignerError> {
        let conversation = ConversationKey::derive(&keys, &remote);
        let filter = Filter::new().kind(KIND_SIGNER_MESSAGE).author(remote).pubkey_tag(keys.public_key());
        let subscription = self.relay.subscribe(filter).await?;

        let listener = tokio::spawn(listen(subscription, conversation.clone(), self.pending.clone()));
        let previous = self.session().replace(ActiveSession {
            connection_id,
            keys,
            remote,
            conversation,
            listener,
        });
        drop(previous);
        Ok(())
    }

    async fn request(&self, method: Method, params: Vec<String>) -> Result<String, SignerError> {
        let session = self.active()?;
        let id = self.env.random_id();

        let request = Message::Request(Request { id: id.clone(), method, params });
        let Ok(json) = serde_json::to_string(&request) else {
            unreachable!("signer requests always serialize");
        };

        let event = {
            let mut rng = EnvRng(&self.env);
            let content = cipher::encrypt(&json, &session.conversation, &mut rng)?;
            UnsignedEvent {
                pubkey: session.keys.public_key(),
                created_at: i64::try_from(self.env.wall_clock_secs()).unwrap_or(i64::MAX),
                kind: KIND_SIGNER_MESSAGE,
                tags: vec![vec!["p".to_owned(), session.remote.to_hex()]],
                content,
            }
            .sign(&session.keys, &mut rng)?
        };

        let reply = self.register(&session.connection_id, &id, method)?;
        if let Err(err) = self.relay.publish(event).await {
            self.pending.cancel(&id);
            return Err(err.into());
        }
        tracing::debug!(%id, %method, "signer request sent");

        pending::wait(reply).await
    }

    /// Register `id` only while `connection_id` is still the live session.
    ///
    /// The session lock is held across the insert, so a concurrent
    /// [`Self::disconnect`] either sees the entry in `cancel_all` or has
    /// already cleared the session and the request fails here.
    fn register(
        &self,
        connection_id: &str,
        id: &str,
        method: Method,
    ) -> Result<pending::PendingReply, SignerError> {
        let session = self.session();
        if session.as_ref().map(|session| session.connection_id.as_str()) != Some(connection_id) {
            return Err(SignerError::Disconnected);
        }
        Ok(self.pending.register(id, method, self.config.request_timeout, &self.env))
    }

    fn active(&self) -> Result<SessionKeys, SignerError> {
        let session = self.session();
        let session = session.as_ref().ok_or(SignerError::NotConnected)?;
        Ok(SessionKeys {
            connection_id: session.connection_id.clone(),
            keys: session.keys.clone(),
            remote: session.remote,
            conversation: session.conversation.clone(),
        })
    }

    fn session(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, connection_id: &str, status: ConnectionStatus) -> Result<(), SignerError> {
        let patch = serde_json::json!({ "status": status });
        self.store.update(CONNECTIONS_TABLE, connection_id, &patch)?;
        Ok(())
    }
}

fn deliver(pending: &PendingRequests, response: Response) -> bool {
    let outcome = response.outcome.map_err(remote_error);
    pending.resolve(&response.id, outcome)
}

fn remote_error(message: String) -> SignerError {
    match message.strip_prefix(PERMISSION_DENIED) {
        Some(method) => SignerError::PermissionDenied { method: method.to_owned() },
        None => SignerError::Remote { message },
    }
}

async fn listen(mut subscription: Subscription, conversation: ConversationKey, pending: PendingRequests) {
    while let Some(event) = subscription.next().await {
        if !event.verify() {
            tracing::debug!(id = %event.id, "ignoring signer event with bad signature");
            continue;
        }

        let plaintext = match cipher::decrypt(&event.content, &conversation) {
            Ok(plaintext) => plaintext,
            Err(err) => {
                tracing::warn!(id = %event.id, error = %err, "undecryptable signer event");
                continue;
            },
        };

        match serde_json::from_str::<Message>(&plaintext) {
            Ok(Message::Response(response)) => {
                deliver(&pending, response);
            },
            Ok(Message::Request(request)) => {
                tracing::debug!(id = %request.id, "ignoring request addressed to client");
            },
            Err(err) => tracing::warn!(id = %event.id, error = %err, "malformed signer message"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        env::test_utils::MockEnv, relay::MemoryRelay, secure_store::MemorySecureStore,
        storage::MemoryStore, signer::uri::parse_connection_string,
    };

    type TestClient = SignerClient<MockEnv, MemoryRelay, MemoryStore, MemorySecureStore>;

    fn client(seed: u64) -> (TestClient, MemoryRelay, MemoryStore, MemorySecureStore) {
        let relay = MemoryRelay::new();
        let store = MemoryStore::new();
        let secure = MemorySecureStore::new();
        let client = SignerClient::new(
            MockEnv::new(seed),
            relay.clone(),
            store.clone(),
            secure.clone(),
            SignerConfig::default(),
        );
        (client, relay, store, secure)
    }

    fn descriptor(seed: u64) -> ConnectionDescriptor {
        let env = MockEnv::new(seed);
        let remote = IdentityKeys::generate(&mut EnvRng(&env));
        parse_connection_string(&format!("bunker://{}?relay=wss://relay.test", remote.public_key()))
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn operations_need_a_connection() {
        let (client, ..) = client(1);

        assert_eq!(client.ping().await, Err(SignerError::NotConnected));
        assert_eq!(client.connection_id(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_connect_times_out_and_stays_pending() {
        let (client, relay, store, secure) = client(2);

        let err = client.connect(&descriptor(20)).await.unwrap_err();
        assert!(matches!(err, SignerError::RequestTimedOut { ref method, .. } if method == "connect"));
        assert!(err.is_transient());
        assert_eq!(client.pending_count(), 0);
        assert_eq!(client.connection_id(), None);

        let records = client.connections().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, ConnectionStatus::Pending);
        assert!(secure.contains(&session_key_label(&records[0].id)));
        assert_eq!(relay.events().len(), 1);
        assert_eq!(store.len(CONNECTIONS_TABLE), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_requires_approved_record() {
        let (client, ..) = client(3);
        assert_eq!(
            client.reconnect("missing").await,
            Err(SignerError::UnknownConnection { connection_id: "missing".into() })
        );

        let _ = client.connect(&descriptor(30)).await;
        let id = client.connections().unwrap()[0].id.clone();
        assert_eq!(client.reconnect(&id).await, Err(SignerError::NotApproved { connection_id: id }));
    }

    #[tokio::test(start_paused = true)]
    async fn remove_connection_forgets_secret() {
        let (client, _, store, secure) = client(4);
        let _ = client.connect(&descriptor(40)).await;
        let id = client.connections().unwrap()[0].id.clone();

        client.remove_connection(&id).unwrap();
        assert!(store.is_empty(CONNECTIONS_TABLE));
        assert!(!secure.contains(&session_key_label(&id)));
    }

    #[tokio::test(start_paused = true)]
    async fn requests_only_register_against_the_live_session() {
        let (client, ..) = client(6);
        let env = MockEnv::new(60);
        let keys = IdentityKeys::generate(&mut EnvRng(&env));
        let remote = IdentityKeys::generate(&mut EnvRng(&env)).public_key();
        client.open_session("c1".into(), keys, remote).await.unwrap();

        assert_eq!(client.register("c0", "r0", Method::Ping).unwrap_err(), SignerError::Disconnected);
        assert_eq!(client.pending_count(), 0);

        let reply = client.register("c1", "r1", Method::Ping).unwrap();
        client.disconnect();
        assert_eq!(pending::wait(reply).await, Err(SignerError::Disconnected));

        // Built for c1 before the disconnect, registered after it
        assert_eq!(client.register("c1", "r2", Method::Ping).unwrap_err(), SignerError::Disconnected);
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn refusals_surface_as_permission_denied() {
        let (client, ..) = client(7);
        let env = MockEnv::new(70);

        let refused = client.pending.register("r1", Method::SignEvent, DEFAULT_REQUEST_TIMEOUT, &env);
        let failed = client.pending.register("r2", Method::Ping, DEFAULT_REQUEST_TIMEOUT, &env);
        assert!(client.handle_response(Response::error("r1", "permission denied for sign_event")));
        assert!(client.handle_response(Response::error("r2", "unauthorized")));

        assert_eq!(
            pending::wait(refused).await,
            Err(SignerError::PermissionDenied { method: "sign_event".into() })
        );
        assert_eq!(pending::wait(failed).await, Err(SignerError::Remote { message: "unauthorized".into() }));
    }

    #[test]
    fn unknown_response_is_ignored() {
        let (client, ..) = client(5);
        assert!(!client.handle_response(Response::ok("nobody", "x")));
    }
}
