//! Primary-device responder
//!
//! The [`Bunker`] holds the identity key and answers signer requests from
//! client session keys it has approved. Key material never leaves it; only
//! signatures, ciphertexts, plaintexts and the public key do.

use std::collections::HashMap;

use futures::StreamExt;
use rand::{CryptoRng, RngCore};
use tokio::task::JoinHandle;
use veilpost_crypto::{
    ConversationKey, Event, IdentityKeys, KIND_SIGNER_MESSAGE, PublicKey, UnsignedEvent, cipher,
};

use super::{
    client::CONNECT_ACK,
    message::{Message, Method, PERMISSION_DENIED, Request, Response},
    uri::ConnectionDescriptor,
};
use crate::{
    env::{EnvRng, Environment},
    error::SignerError,
    relay::{Filter, Relay},
};

/// Responder policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BunkerConfig {
    /// Secret a client must present on `connect`
    pub secret: Option<String>,
    /// Methods any client may be granted
    pub permissions: Vec<Method>,
}

impl Default for BunkerConfig {
    fn default() -> Self {
        Self { secret: None, permissions: Method::ALL.to_vec() }
    }
}

/// Signer holding the identity key.
pub struct Bunker<R: Relay> {
    identity: IdentityKeys,
    relay: R,
    config: BunkerConfig,
    clients: HashMap<PublicKey, Vec<Method>>,
}

impl<R: Relay> Bunker<R> {
    /// Responder for `identity` on `relay`.
    pub fn new(identity: IdentityKeys, relay: R, config: BunkerConfig) -> Self {
        Self { identity, relay, config, clients: HashMap::new() }
    }

    /// Public key clients sign for.
    pub fn public_key(&self) -> PublicKey {
        self.identity.public_key()
    }

    /// Descriptor a client connects with.
    pub fn descriptor(&self, relays: Vec<String>) -> ConnectionDescriptor {
        ConnectionDescriptor {
            remote_pubkey: self.public_key(),
            relays,
            secret: self.config.secret.clone(),
        }
    }

    /// Methods granted to `client`, if it has connected.
    pub fn granted(&self, client: &PublicKey) -> Option<&[Method]> {
        self.clients.get(client).map(Vec::as_slice)
    }

    /// Withdraw a client's grant. Later requests are refused.
    pub fn revoke(&mut self, client: &PublicKey) -> bool {
        self.clients.remove(client).is_some()
    }

    /// Answer one signer event.
    ///
    /// Returns `None` for events not addressed to this signer, failing
    /// verification, or not carrying a request.
    ///
    /// # Errors
    ///
    /// - `Crypto`: the request could not be decrypted, or the response could
    ///   not be sealed
    pub fn handle_event<G: RngCore + CryptoRng>(
        &mut self,
        event: &Event,
        now: i64,
        rng: &mut G,
    ) -> Result<Option<Event>, SignerError> {
        let own_key = self.identity.public_key().to_hex();
        if event.kind != KIND_SIGNER_MESSAGE || event.tag_value("p") != Some(own_key.as_str()) {
            return Ok(None);
        }
        if !event.verify() {
            tracing::debug!(id = %event.id, "ignoring signer request with bad signature");
            return Ok(None);
        }

        let conversation = ConversationKey::derive(&self.identity, &event.pubkey);
        let plaintext = cipher::decrypt(&event.content, &conversation)?;
        let request = match serde_json::from_str::<Message>(&plaintext) {
            Ok(Message::Request(request)) => request,
            Ok(Message::Response(_)) => return Ok(None),
            Err(err) => {
                tracing::warn!(id = %event.id, error = %err, "malformed signer request");
                return Ok(None);
            },
        };

        let response = self.respond(&event.pubkey, request, rng);
        let Ok(json) = serde_json::to_string(&Message::Response(response)) else {
            unreachable!("signer responses always serialize");
        };

        let reply = UnsignedEvent {
            pubkey: self.identity.public_key(),
            created_at: now,
            kind: KIND_SIGNER_MESSAGE,
            tags: vec![vec!["p".to_owned(), event.pubkey.to_hex()]],
            content: cipher::encrypt(&json, &conversation, rng)?,
        }
        .sign(&self.identity, rng)?;

        Ok(Some(reply))
    }

    /// Subscribe to requests and answer them until the relay closes.
    ///
    /// # Errors
    ///
    /// - `Relay`: subscription refused
    pub async fn run<E: Environment>(mut self, env: E) -> Result<JoinHandle<()>, SignerError> {
        let filter = Filter::new().kind(KIND_SIGNER_MESSAGE).pubkey_tag(self.public_key());
        let mut requests = self.relay.subscribe(filter).await?;
        tracing::info!(pubkey = %self.public_key(), "bunker listening");

        Ok(tokio::spawn(async move {
            while let Some(event) = requests.next().await {
                let now = i64::try_from(env.wall_clock_secs()).unwrap_or(i64::MAX);
                let reply = self.handle_event(&event, now, &mut EnvRng(&env));
                match reply {
                    Ok(Some(reply)) => {
                        if let Err(err) = self.relay.publish(reply).await {
                            tracing::warn!(error = %err, "failed to publish signer response");
                        }
                    },
                    Ok(None) => {},
                    Err(err) => tracing::warn!(id = %event.id, error = %err, "signer request dropped"),
                }
            }
        }))
    }

    fn respond<G: RngCore + CryptoRng>(
        &mut self,
        client: &PublicKey,
        request: Request,
        rng: &mut G,
    ) -> Response {
        let Request { id, method, params } = request;

        if method == Method::Connect {
            return self.connect(client, id, &params);
        }

        let Some(granted) = self.clients.get(client) else {
            return Response::error(id, "unauthorized");
        };
        if !granted.contains(&method) {
            return Response::error(id, format!("{PERMISSION_DENIED}{method}"));
        }

        match self.execute(method, &params, rng) {
            Ok(result) => Response::ok(id, result),
            Err(message) => Response::error(id, message),
        }
    }

    fn connect(&mut self, client: &PublicKey, id: String, params: &[String]) -> Response {
        let own_key = self.identity.public_key().to_hex();
        if params.first().is_some_and(|target| !target.is_empty() && *target != own_key) {
            return Response::error(id, "connect addressed to another signer");
        }
        if let Some(secret) = &self.config.secret
            && params.get(1) != Some(secret)
        {
            tracing::warn!(%client, "connect with wrong secret");
            return Response::error(id, "invalid secret");
        }

        let requested: Vec<Method> = match params.get(2).filter(|perms| !perms.is_empty()) {
            Some(perms) => perms
                .split(',')
                .filter_map(|name| serde_json::from_value(serde_json::Value::from(name.trim())).ok())
                .collect(),
            None => Method::ALL.to_vec(),
        };
        let granted: Vec<Method> =
            requested.into_iter().filter(|method| self.config.permissions.contains(method)).collect();

        tracing::info!(%client, ?granted, "client connected");
        self.clients.insert(*client, granted);
        Response::ok(id, CONNECT_ACK)
    }

    fn execute<G: RngCore + CryptoRng>(
        &self,
        method: Method,
        params: &[String],
        rng: &mut G,
    ) -> Result<String, String> {
        let param = |index: usize| params.get(index).ok_or_else(|| format!("missing parameter {index}"));
        let peer = |index: usize| {
            PublicKey::from_hex(param(index)?).map_err(|_| "invalid peer public key".to_owned())
        };

        match method {
            Method::Ping => Ok("pong".to_owned()),
            Method::GetPublicKey => Ok(self.identity.public_key().to_hex()),
            Method::SignEvent => {
                let unsigned: UnsignedEvent =
                    serde_json::from_str(param(0)?).map_err(|e| format!("invalid event: {e}"))?;
                if unsigned.pubkey != self.identity.public_key() {
                    return Err("event author is not this signer".to_owned());
                }
                let event = unsigned.sign(&self.identity, rng).map_err(|e| e.to_string())?;
                serde_json::to_string(&event).map_err(|e| e.to_string())
            },
            Method::Nip44Encrypt => {
                let key = ConversationKey::derive(&self.identity, &peer(0)?);
                cipher::encrypt(param(1)?, &key, rng).map_err(|e| e.to_string())
            },
            Method::Nip44Decrypt => {
                let key = ConversationKey::derive(&self.identity, &peer(0)?);
                cipher::decrypt(param(1)?, &key).map_err(|e| e.to_string())
            },
            Method::Connect => Err("already connected".to_owned()),
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;
    use crate::relay::MemoryRelay;

    struct Harness {
        bunker: Bunker<MemoryRelay>,
        client: IdentityKeys,
        conversation: ConversationKey,
        rng: ChaCha20Rng,
    }

    impl Harness {
        fn new(config: BunkerConfig) -> Self {
            let mut rng = ChaCha20Rng::seed_from_u64(11);
            let identity = IdentityKeys::generate(&mut rng);
            let client = IdentityKeys::generate(&mut rng);
            let conversation = ConversationKey::derive(&client, &identity.public_key());
            let bunker = Bunker::new(identity, MemoryRelay::new(), config);
            Self { bunker, client, conversation, rng }
        }

        fn ask(&mut self, method: Method, params: Vec<String>) -> Response {
            let json = serde_json::to_string(&Message::Request(Request {
                id: "r1".into(),
                method,
                params,
            }))
            .unwrap();
            let event = UnsignedEvent {
                pubkey: self.client.public_key(),
                created_at: 10,
                kind: KIND_SIGNER_MESSAGE,
                tags: vec![vec!["p".into(), self.bunker.public_key().to_hex()]],
                content: cipher::encrypt(&json, &self.conversation, &mut self.rng).unwrap(),
            }
            .sign(&self.client, &mut self.rng)
            .unwrap();

            let reply = self.bunker.handle_event(&event, 11, &mut self.rng).unwrap().unwrap();
            assert!(reply.verify());
            assert_eq!(reply.pubkey, self.bunker.public_key());
            let plaintext = cipher::decrypt(&reply.content, &self.conversation).unwrap();
            match serde_json::from_str::<Message>(&plaintext).unwrap() {
                Message::Response(response) => response,
                Message::Request(_) => panic!("bunker answered with a request"),
            }
        }
    }

    #[test]
    fn requests_before_connect_are_unauthorized() {
        let mut harness = Harness::new(BunkerConfig::default());

        assert_eq!(harness.ask(Method::Ping, Vec::new()), Response::error("r1", "unauthorized"));
    }

    #[test]
    fn connect_checks_secret() {
        let config = BunkerConfig { secret: Some("s3cret".into()), ..BunkerConfig::default() };
        let mut harness = Harness::new(config);
        let target = harness.bunker.public_key().to_hex();

        let wrong = harness.ask(Method::Connect, vec![target.clone(), "guess".into()]);
        assert_eq!(wrong, Response::error("r1", "invalid secret"));

        let right = harness.ask(Method::Connect, vec![target, "s3cret".into()]);
        assert_eq!(right, Response::ok("r1", CONNECT_ACK));
        assert_eq!(harness.ask(Method::Ping, Vec::new()), Response::ok("r1", "pong"));
    }

    #[test]
    fn grants_are_intersected_with_policy() {
        let config = BunkerConfig {
            secret: None,
            permissions: vec![Method::Connect, Method::Ping, Method::GetPublicKey],
        };
        let mut harness = Harness::new(config);
        harness.ask(Method::Connect, vec![String::new(), String::new(), "ping,sign_event".into()]);

        let client = harness.client.public_key();
        assert_eq!(harness.bunker.granted(&client), Some(&[Method::Ping][..]));
        assert_eq!(
            harness.ask(Method::SignEvent, vec!["{}".into()]),
            Response::error("r1", "permission denied for sign_event")
        );
        assert_eq!(
            harness.ask(Method::GetPublicKey, Vec::new()),
            Response::error("r1", "permission denied for get_public_key")
        );

        assert!(harness.bunker.revoke(&client));
        assert_eq!(harness.ask(Method::Ping, Vec::new()), Response::error("r1", "unauthorized"));
    }

    #[test]
    fn signs_only_its_own_events() {
        let mut harness = Harness::new(BunkerConfig::default());
        harness.ask(Method::Connect, Vec::new());

        let foreign = UnsignedEvent {
            pubkey: harness.client.public_key(),
            created_at: 1,
            kind: 1,
            tags: Vec::new(),
            content: "hi".into(),
        };
        let refused = harness.ask(Method::SignEvent, vec![serde_json::to_string(&foreign).unwrap()]);
        assert_eq!(refused, Response::error("r1", "event author is not this signer"));

        let own = UnsignedEvent { pubkey: harness.bunker.public_key(), ..foreign };
        let signed = harness.ask(Method::SignEvent, vec![serde_json::to_string(&own).unwrap()]);
        let event: Event = serde_json::from_str(&signed.outcome.unwrap()).unwrap();
        assert!(event.verify());
        assert_eq!(event.unsigned(), own);
    }

    #[test]
    fn events_for_other_signers_are_ignored() {
        let mut harness = Harness::new(BunkerConfig::default());
        let mut rng = ChaCha20Rng::seed_from_u64(12);
        let event = UnsignedEvent {
            pubkey: harness.client.public_key(),
            created_at: 1,
            kind: KIND_SIGNER_MESSAGE,
            tags: vec![vec!["p".into(), harness.client.public_key().to_hex()]],
            content: "x".into(),
        }
        .sign(&harness.client, &mut rng)
        .unwrap();

        assert_eq!(harness.bunker.handle_event(&event, 2, &mut rng), Ok(None));
    }
}
