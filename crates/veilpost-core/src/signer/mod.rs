//! Delegated signer protocol
//!
//! A secondary device ([`SignerClient`]) asks a primary device ([`Bunker`])
//! to sign, encrypt and decrypt with an identity key it never sees. Both
//! sides exchange encrypted request/response events over a [`crate::Relay`].

mod bunker;
mod client;
mod message;
mod pending;
mod uri;

pub use bunker::{Bunker, BunkerConfig};
pub use client::{
    CONNECT_ACK, CONNECTIONS_TABLE, ConnectionRecord, ConnectionStatus, DEFAULT_REQUEST_TIMEOUT,
    SignerClient, SignerConfig, session_key_label,
};
pub use message::{Message, Method, PERMISSION_DENIED, Request, Response};
pub use pending::{PendingReply, PendingRequests, wait};
pub use uri::{BUNKER_SCHEME, ConnectionDescriptor, parse_connection_string};
