//! Client-side half of the §4.M challenge/response handshake: load a
//! local SSH identity, sign whatever nonce a `cilod` hands back, trade
//! the signature for a bearer token. Mirrors `bin/cilod`'s own
//! initiator-side tunnel auth (they can't share the module, being
//! separate binaries), down to the namespace tag.

use std::path::PathBuf;

use base64::Engine as _;
use cilo_client::{CiloClient, api::ConnectRequest};
use ssh_key::{HashAlg, PrivateKey};

const SIGNATURE_NAMESPACE: &str = "cilo-auth";

fn load_local_signer() -> anyhow::Result<PrivateKey> {
  let home = std::env::var_os("HOME")
    .map(PathBuf::from)
    .ok_or_else(|| anyhow::anyhow!("auth-failed: HOME is not set, cannot locate an SSH key"))?;
  for name in ["id_ed25519", "id_rsa", "id_ecdsa"] {
    let path = home.join(".ssh").join(name);
    if let Ok(key) = PrivateKey::read_openssh_file(&path) {
      return Ok(key);
    }
  }
  anyhow::bail!("auth-failed: no usable SSH key found under ~/.ssh")
}

/// Whether `init` can find a signer at all, without loading the full
/// key (parse errors from a malformed key count as "not found" here,
/// matching `load_local_signer`'s own fallback-through-files behavior).
pub fn load_local_signer_exists() -> bool {
  load_local_signer().is_ok()
}

/// Run the challenge/response exchange against `client` and set the
/// resulting bearer token on it. Every environment-scoped endpoint
/// requires this, whether `client` points at the local `cilod` or a
/// `--on` peer.
pub async fn authenticate(client: &CiloClient) -> anyhow::Result<()> {
  let identity = load_local_signer()?;
  let public_key = identity
    .public_key()
    .to_openssh()
    .map_err(|e| anyhow::anyhow!("failed to encode local public key: {e}"))?;

  let challenge = client.auth_challenge(&public_key).await?;

  let signature = identity
    .sign(SIGNATURE_NAMESPACE, HashAlg::Sha512, challenge.challenge.as_bytes())
    .map_err(|e| anyhow::anyhow!("failed to sign auth challenge: {e}"))?;
  let signature_bytes = signature
    .to_pem(Default::default())
    .map_err(|e| anyhow::anyhow!("failed to encode signature: {e}"))?;

  let response = client
    .auth_connect(&ConnectRequest {
      challenge: challenge.challenge,
      signature: base64::engine::general_purpose::STANDARD.encode(signature_bytes),
      signature_format: identity.algorithm().to_string(),
      public_key,
    })
    .await?;

  client.set_token(response.token);
  Ok(())
}
