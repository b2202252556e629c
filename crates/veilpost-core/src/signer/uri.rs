//! Connection descriptor parsing
//!
//! ```text
//! bunker://<remote pubkey hex>?relay=wss%3A%2F%2Frelay.one&relay=wss://two&secret=abc
//! ```

use std::{fmt, str::FromStr};

use url::{Url, form_urlencoded};
use veilpost_crypto::PublicKey;

use crate::error::SignerError;

/// URI scheme of a connection descriptor
pub const BUNKER_SCHEME: &str = "bunker://";

/// Remote signer address: its public key, the relays it listens on and an
/// optional one-time connect secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    /// Public key of the remote signer
    pub remote_pubkey: PublicKey,
    /// Relay endpoints as written (decoded), deduplicated, in descriptor
    /// order. Never empty.
    pub relays: Vec<String>,
    /// Connect secret, if the signer requires one
    pub secret: Option<String>,
}

/// Parse a `bunker://` connection string.
///
/// # Errors
///
/// `InvalidConnectionString` when the input is not a URL, the scheme or the
/// public key is wrong, no relay is given, or a relay is not a `ws://`/`wss://`
/// URL with a host.
pub fn parse_connection_string(input: &str) -> Result<ConnectionDescriptor, SignerError> {
    let invalid = |reason: &str| SignerError::InvalidConnectionString { reason: reason.to_owned() };

    let url = Url::parse(input.trim()).map_err(|_| invalid("not a valid URL"))?;
    if url.scheme() != "bunker" {
        return Err(invalid("missing bunker:// prefix"));
    }
    let host = url
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| invalid("missing remote public key"))?;
    let remote_pubkey =
        PublicKey::from_hex(host).map_err(|_| invalid("remote public key is not a valid key"))?;

    let mut relays: Vec<String> = Vec::new();
    let mut secret = None;
    for (name, value) in url.query_pairs() {
        match name.as_ref() {
            "relay" => {
                let relay = value.trim();
                if !is_relay_url(relay) {
                    return Err(invalid("relay must be a ws:// or wss:// URL"));
                }
                if !relays.iter().any(|known| known == relay) {
                    relays.push(relay.to_owned());
                }
            },
            "secret" if !value.is_empty() => secret = Some(value.into_owned()),
            _ => {},
        }
    }

    if relays.is_empty() {
        return Err(invalid("no relay given"));
    }

    Ok(ConnectionDescriptor { remote_pubkey, relays, secret })
}

impl FromStr for ConnectionDescriptor {
    type Err = SignerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_connection_string(s)
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut query = form_urlencoded::Serializer::new(String::new());
        for relay in &self.relays {
            query.append_pair("relay", relay);
        }
        if let Some(secret) = &self.secret {
            query.append_pair("secret", secret);
        }
        write!(f, "{BUNKER_SCHEME}{}?{}", self.remote_pubkey, query.finish())
    }
}

fn is_relay_url(value: &str) -> bool {
    Url::parse(value).is_ok_and(|url| {
        matches!(url.scheme(), "ws" | "wss") && url.host_str().is_some_and(|host| !host.is_empty())
    })
}
