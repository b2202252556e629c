//! Request/response payloads carried inside signer events
//!
//! Requests and responses are JSON objects encrypted with the message cipher.
//! Decoding is strict: unknown fields, and responses carrying both or
//! neither of `result`/`error`, are rejected.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Error text of a refused method, followed by its wire name
pub const PERMISSION_DENIED: &str = "permission denied for ";

/// Operations a remote signer answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    /// Open a session; params `[client pubkey, secret?]`
    Connect,
    /// Sign an unsigned event; params `[event json]`
    SignEvent,
    /// Public key of the signing identity
    GetPublicKey,
    /// Encrypt for a peer; params `[peer pubkey, plaintext]`
    Nip44Encrypt,
    /// Decrypt from a peer; params `[peer pubkey, ciphertext]`
    Nip44Decrypt,
    /// Liveness check, answered with `pong`
    Ping,
}

impl Method {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::SignEvent => "sign_event",
            Self::GetPublicKey => "get_public_key",
            Self::Nip44Encrypt => "nip44_encrypt",
            Self::Nip44Decrypt => "nip44_decrypt",
            Self::Ping => "ping",
        }
    }

    /// Methods granted unless configured otherwise.
    pub const ALL: [Self; 6] = [
        Self::Connect,
        Self::SignEvent,
        Self::GetPublicKey,
        Self::Nip44Encrypt,
        Self::Nip44Decrypt,
        Self::Ping,
    ];
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Correlated request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    /// Correlation id, echoed by the response
    pub id: String,
    /// Requested operation
    pub method: Method,
    /// Positional string parameters
    pub params: Vec<String>,
}

/// Response to a [`Request`]: exactly one of a result or an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawResponse", into = "RawResponse")]
pub struct Response {
    /// Id of the request being answered
    pub id: String,
    /// Result text or error message
    pub outcome: Result<String, String>,
}

impl Response {
    /// Successful response.
    pub fn ok(id: impl Into<String>, result: impl Into<String>) -> Self {
        Self { id: id.into(), outcome: Ok(result.into()) }
    }

    /// Error response.
    pub fn error(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self { id: id.into(), outcome: Err(message.into()) }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawResponse {
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl TryFrom<RawResponse> for Response {
    type Error = String;

    fn try_from(raw: RawResponse) -> Result<Self, Self::Error> {
        let outcome = match (raw.result, raw.error) {
            (Some(result), None) => Ok(result),
            (None, Some(error)) => Err(error),
            (Some(_), Some(_)) => return Err("response has both result and error".into()),
            (None, None) => return Err("response has neither result nor error".into()),
        };
        Ok(Self { id: raw.id, outcome })
    }
}

impl From<Response> for RawResponse {
    fn from(response: Response) -> Self {
        let (result, error) = match response.outcome {
            Ok(result) => (Some(result), None),
            Err(error) => (None, Some(error)),
        };
        Self { id: response.id, result, error }
    }
}

/// Any decrypted signer payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    /// Client to signer
    Request(Request),
    /// Signer to client
    Response(Response),
}
