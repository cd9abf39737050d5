//! SSH-key challenge/response auth, per spec §4.M: a short-lived
//! single-use nonce, verified against a declared public key via an
//! `ssh-key` namespaced signature, exchanged for a bearer token.
//!
//! Grounded on `materialize`'s `ssh-util` crate, the one pack example
//! that depends on `ssh-key` for real key handling (it doesn't do
//! namespace-signature auth itself, but it's the only evidence in the
//! corpus that this crate — rather than a raw `ring`/`rsa` combo — is
//! how this ecosystem reaches for SSH key material).

use std::time::Duration;

use base64::Engine as _;
use chrono::{Duration as ChronoDuration, Utc};
use rand::RngCore;
use ssh_key::{PublicKey, SshSig};

use crate::state::{AppState, IssuedToken, PendingChallenge};

/// Namespace tag mixed into the signature per the `ssh-keygen -Y
/// sign`-style scheme `ssh-key`'s `SshSig` implements; binds a
/// signature to cilo's auth protocol so it can't be replayed against
/// an unrelated signing request the same key might satisfy.
const SIGNATURE_NAMESPACE: &str = "cilo-auth";
const CHALLENGE_TTL: Duration = Duration::from_secs(5 * 60);
const TOKEN_TTL: ChronoDuration = ChronoDuration::hours(24);

/// Issue a new nonce for `public_key`, overwriting any prior pending
/// challenge for that key (a second `/auth/challenge` call simply
/// restarts the clock rather than erroring).
pub async fn issue_challenge(state: &AppState, public_key: &str) -> String {
  let mut bytes = [0u8; 32];
  rand::rng().fill_bytes(&mut bytes);
  let nonce = base64::engine::general_purpose::STANDARD.encode(bytes);
  state
    .pending_challenges
    .insert(
      public_key.to_string(),
      PendingChallenge { nonce: nonce.clone(), issued_at: Utc::now() },
    )
    .await;
  nonce
}

/// Verify `signature` (base64, `signature_format` declared by the
/// caller) over the pending challenge for `public_key`, consuming it
/// on success or failure alike — a challenge is used at most once.
pub async fn verify_and_issue_token(
  state: &AppState,
  public_key: &str,
  challenge: &str,
  signature: &str,
  signature_format: &str,
) -> anyhow::Result<String> {
  let Some(pending) =
    state.pending_challenges.remove(&public_key.to_string()).await
  else {
    anyhow::bail!("auth-failed: no pending challenge for this key");
  };
  if pending.nonce != challenge {
    anyhow::bail!("auth-failed: challenge does not match the issued nonce");
  }
  let age = Utc::now().signed_duration_since(pending.issued_at);
  if age > ChronoDuration::from_std(CHALLENGE_TTL).unwrap() {
    anyhow::bail!("auth-failed: challenge expired");
  }

  let key = PublicKey::from_openssh(public_key)
    .map_err(|e| anyhow::anyhow!("auth-failed: invalid public key: {e}"))?;
  let sig_bytes = base64::engine::general_purpose::STANDARD
    .decode(signature)
    .map_err(|e| anyhow::anyhow!("auth-failed: invalid signature encoding: {e}"))?;
  let sig = SshSig::from_pem(&sig_bytes)
    .or_else(|_| SshSig::decode(&sig_bytes))
    .map_err(|e| anyhow::anyhow!("auth-failed: malformed {signature_format} signature: {e}"))?;

  key
    .verify(SIGNATURE_NAMESPACE, challenge.as_bytes(), &sig)
    .map_err(|e| anyhow::anyhow!("auth-failed: signature verification failed: {e}"))?;

  let token = {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
  };
  let now = Utc::now();
  state
    .tokens
    .insert(
      token.clone(),
      IssuedToken {
        public_key: public_key.to_string(),
        issued_at: now,
        expires_at: now + TOKEN_TTL,
      },
    )
    .await;
  Ok(token)
}

/// Resolve a bearer token to the public key it was issued for, or
/// `None` if it's unknown or past its 24h expiry — the latter is not
/// distinguished from an unknown token to callers, per spec §4.M's
/// "token format is opaque to clients".
pub async fn authenticate(state: &AppState, token: &str) -> Option<String> {
  let issued = state.tokens.get(&token.to_string()).await?;
  if issued.expires_at < Utc::now() {
    state.tokens.remove(&token.to_string()).await;
    return None;
  }
  Some(issued.public_key)
}

#[cfg(test)]
mod test {
  use std::sync::Arc;

  use runtime::mock::MockDriver;

  use super::*;
  use crate::config::CilodConfig;

  fn app() -> (AppState, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = CilodConfig { data_dir: dir.path().to_path_buf(), ..Default::default() };
    (AppState::new(config, Arc::new(MockDriver::new())), dir)
  }

  #[tokio::test]
  async fn challenge_is_consumed_on_verification_attempt() {
    let (app, _dir) = app();
    let nonce = issue_challenge(&app, "ssh-ed25519 AAAA fake").await;
    assert!(
      app
        .pending_challenges
        .get(&"ssh-ed25519 AAAA fake".to_string())
        .await
        .is_some()
    );
    let _ = verify_and_issue_token(
      &app,
      "ssh-ed25519 AAAA fake",
      &nonce,
      "not-base64!!",
      "ssh-ed25519",
    )
    .await;
    assert!(
      app
        .pending_challenges
        .get(&"ssh-ed25519 AAAA fake".to_string())
        .await
        .is_none()
    );
  }

  #[tokio::test]
  async fn unknown_token_does_not_authenticate() {
    let (app, _dir) = app();
    assert!(authenticate(&app, "nonexistent").await.is_none());
  }

  #[tokio::test]
  async fn expired_token_is_removed_on_lookup() {
    let (app, _dir) = app();
    app
      .tokens
      .insert(
        "tok".into(),
        IssuedToken {
          public_key: "key".into(),
          issued_at: Utc::now() - ChronoDuration::hours(48),
          expires_at: Utc::now() - ChronoDuration::hours(24),
        },
      )
      .await;
    assert!(authenticate(&app, "tok").await.is_none());
    assert!(app.tokens.get(&"tok".to_string()).await.is_none());
  }
}
