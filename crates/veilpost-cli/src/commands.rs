//! Subcommand implementations. Each returns the text to print.

use std::path::Path;

use serde_json::json;
use veilpost_core::{EnvRng, Environment, KeySession, RedbStore, parse_connection_string};
use veilpost_crypto::{
    Event, IdentityKeys, KdfAlgorithm, PublicKey, calculate_padded_size, envelope, generate_salt,
};
use zeroize::Zeroizing;

use crate::error::CliError;

/// Fresh identity, secret included.
pub fn keygen<E: Environment>(env: &E) -> Result<String, CliError> {
    let identity = IdentityKeys::generate(&mut EnvRng(env));
    let secret = Zeroizing::new(hex::encode(identity.secret_bytes()));

    Ok(serde_json::to_string_pretty(&json!({
        "public_key": identity.public_key(),
        "secret_key": secret.as_str(),
    }))?)
}

/// Fresh identity sealed under `passphrase` in the store at `path`.
/// Only the public key is printed.
pub async fn keygen_sealed<E: Environment>(
    env: &E,
    path: &Path,
    passphrase: &str,
    algorithm: KdfAlgorithm,
) -> Result<String, CliError> {
    let session = KeySession::new(RedbStore::open(path)?);
    let salt = generate_salt(&mut EnvRng(env)).to_vec();
    session.unlock(Zeroizing::new(passphrase.as_bytes().to_vec()), salt, algorithm).await?;

    let public_key = session.create_identity(&mut EnvRng(env))?;
    session.lock();

    Ok(serde_json::to_string_pretty(&json!({
        "public_key": public_key,
        "algorithm": algorithm,
        "store": path.display().to_string(),
    }))?)
}

/// Open the sealed identity in `path` to prove the passphrase.
pub async fn identity(path: &Path, passphrase: &str) -> Result<String, CliError> {
    let session = KeySession::new(RedbStore::open(path)?);
    session.unlock_stored(Zeroizing::new(passphrase.as_bytes().to_vec())).await?;

    let identity = session.load_identity();
    let algorithm = session.algorithm();
    session.lock();

    Ok(serde_json::to_string_pretty(&json!({
        "public_key": identity?.public_key(),
        "algorithm": algorithm,
    }))?)
}

/// Gift-wrap `text` from `secret` to `recipient`.
pub fn wrap<E: Environment>(
    env: &E,
    secret: &str,
    recipient: &str,
    text: &str,
) -> Result<String, CliError> {
    let sender = IdentityKeys::from_secret_hex(secret)?;
    let recipient = PublicKey::from_hex(recipient)?;
    let now = env.wall_clock_secs() as i64;

    let gift_wrap = envelope::wrap(text, &sender, &recipient, now, &mut EnvRng(env))?;
    Ok(serde_json::to_string(&gift_wrap)?)
}

/// Open a gift wrap with `secret`.
pub fn unwrap(secret: &str, event_json: &str) -> Result<String, CliError> {
    let recipient = IdentityKeys::from_secret_hex(secret)?;
    let gift_wrap: Event = serde_json::from_str(event_json)?;

    let opened = envelope::unwrap(&gift_wrap, &recipient)?;
    if !opened.seal_verified {
        tracing::warn!(sender = %opened.sender, "sender could not be confirmed");
    }

    Ok(serde_json::to_string_pretty(&json!({
        "sender": opened.sender,
        "seal_verified": opened.seal_verified,
        "kind": opened.rumor.kind,
        "created_at": opened.rumor.created_at,
        "content": opened.rumor.content,
    }))?)
}

/// Parsed `bunker://` descriptor.
pub fn parse_bunker(uri: &str) -> Result<String, CliError> {
    let descriptor = parse_connection_string(uri)?;

    Ok(serde_json::to_string_pretty(&json!({
        "remote_pubkey": descriptor.remote_pubkey,
        "relays": descriptor.relays,
        "secret": descriptor.secret.is_some(),
        "normalized": descriptor.to_string(),
    }))?)
}

/// Bucket size for a text of `length` bytes.
pub fn pad_size(length: usize) -> String {
    calculate_padded_size(length).map_or_else(|| "unpadded".to_owned(), |bucket| bucket.to_string())
}

#[cfg(test)]
mod tests {
    use serde_json::Value;
    use veilpost_core::{SessionError, env::test_utils::MockEnv};
    use veilpost_crypto::CryptoError;

    use super::*;

    fn identity_pair(env: &MockEnv) -> (String, String) {
        let keys: Value = serde_json::from_str(&keygen(env).unwrap()).unwrap();
        (keys["secret_key"].as_str().unwrap().to_owned(), keys["public_key"].as_str().unwrap().to_owned())
    }

    #[test]
    fn wrapped_message_opens_for_the_recipient_only() {
        let env = MockEnv::new(1);
        let (alice_secret, alice_public) = identity_pair(&env);
        let (bob_secret, bob_public) = identity_pair(&env);
        let (eve_secret, _) = identity_pair(&env);

        let gift_wrap = wrap(&env, &alice_secret, &bob_public, "see you at noon").unwrap();
        let opened: Value = serde_json::from_str(&unwrap(&bob_secret, &gift_wrap).unwrap()).unwrap();
        assert_eq!(opened["sender"], alice_public.as_str());
        assert_eq!(opened["seal_verified"], true);
        assert_eq!(opened["content"], "see you at noon");
        assert_eq!(opened["kind"], 14);

        assert!(matches!(unwrap(&eve_secret, &gift_wrap), Err(CliError::Crypto(_))));
    }

    #[test]
    fn garbage_input_is_reported() {
        let env = MockEnv::new(2);
        let (secret, _) = identity_pair(&env);

        assert!(matches!(unwrap(&secret, "{not json"), Err(CliError::Json(_))));
        assert!(matches!(wrap(&env, "zz", &"ab".repeat(32), "hi"), Err(CliError::Crypto(_))));
    }

    #[test]
    fn bunker_descriptor_is_normalized() {
        let pubkey = "ab".repeat(32);
        let uri = format!("bunker://{pubkey}?relay=wss%3A%2F%2Frelay.one&relay=wss://relay.one&secret=s3");
        let parsed: Value = serde_json::from_str(&parse_bunker(&uri).unwrap()).unwrap();

        assert_eq!(parsed["relays"], json!(["wss://relay.one"]));
        assert_eq!(parsed["secret"], true);
        assert!(matches!(parse_bunker("nostr://x"), Err(CliError::Signer(_))));
    }

    #[test]
    fn pad_size_reports_buckets() {
        assert_eq!(pad_size(1), "256");
        assert_eq!(pad_size(300), "512");
        assert_eq!(pad_size(70_000), "unpadded");
    }

    #[tokio::test]
    async fn sealed_identity_opens_with_the_same_passphrase() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.redb");
        let env = MockEnv::new(3);

        let created: Value = serde_json::from_str(
            &keygen_sealed(&env, &path, "hunter2", KdfAlgorithm::Pbkdf2Sha256).await.unwrap(),
        )
        .unwrap();
        assert_eq!(created["algorithm"], "pbkdf2-sha256");

        let opened: Value = serde_json::from_str(&identity(&path, "hunter2").await.unwrap()).unwrap();
        assert_eq!(opened["public_key"], created["public_key"]);

        let err = identity(&path, "hunter3").await.unwrap_err();
        assert!(matches!(err, CliError::Session(SessionError::Crypto(CryptoError::DecryptionFailed))));
    }
}
