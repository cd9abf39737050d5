//! `connect`/`disconnect` against a peer, per spec §4.K. This is the
//! half of the WireGuard exchange a connecting host drives: generate a
//! keypair, authenticate to the peer, POST the exchange request, then
//! bring up the local interface with the response. The receiving
//! half — allocating the peer an IP and answering the exchange — lives
//! in `api::wireguard`.

use std::{net::SocketAddr, path::PathBuf, str::FromStr};

use base64::Engine as _;
use chrono::Utc;
use cilo_client::{CiloClient, api::ConnectRequest, entities::Machine};
use ssh_key::{HashAlg, PrivateKey, SshSig};
use wireguard_control::InterfaceName;

use crate::{peers, state::AppState};

/// Namespace tag cilo's challenge signature is scoped under; must
/// match `auth::SIGNATURE_NAMESPACE` on the verifying side.
const SIGNATURE_NAMESPACE: &str = "cilo-auth";

/// Deterministic interface name so `disconnect` can find it again
/// without consulting the Machine record. `wg-<first 8 of sanitized
/// host>` keeps it inside the 15-character limit most backends enforce.
pub(crate) fn interface_name(host: &str) -> anyhow::Result<InterfaceName> {
  let sanitized = peers::sanitize_host(host);
  let short: String = sanitized.chars().take(8).collect();
  InterfaceName::from_str(&format!("cilo-{short}"))
    .map_err(|e| anyhow::anyhow!("invalid interface name for {host}: {e}"))
}

/// Authenticate and register a new tunnel to `host` (`host[:port]`,
/// default port 8081). Fails `already-connected` if a Machine record
/// already exists, per spec §4.K.
pub async fn connect(app: &AppState, host_input: &str) -> anyhow::Result<Machine> {
  let host = host_input.split(':').next().unwrap_or(host_input).to_string();
  if peers::exists(&app.config, &host).await {
    anyhow::bail!("already-connected: {host} already has a tunnel");
  }

  let address = if host_input.contains(':') {
    format!("http://{host_input}")
  } else {
    format!("http://{host_input}:8081")
  };
  let client = CiloClient::new(&address)?;

  let identity = load_local_signer()?;
  let token = authenticate_to_peer(&client, &identity).await?;
  client.set_token(token.clone());

  let local_pair = keys::KeyPair::generate();
  let exchange = client.wireguard_exchange(&local_pair.public_base64()).await?;

  let peer_endpoint: SocketAddr = exchange
    .endpoint
    .parse()
    .map_err(|e| anyhow::anyhow!("peer returned an unparseable endpoint: {e}"))?;
  let peer_public_key = wireguard_control::Key::from_base64(&exchange.peer_public_key)
    .map_err(|e| anyhow::anyhow!("peer returned an invalid public key: {e}"))?;

  let allowed_ips = parse_cidrs(&exchange.allowed_ips)?;
  let interface = interface_name(&host)?;

  keys::bring_up(&keys::TunnelConfig {
    interface: interface.clone(),
    local_private_key: local_pair.private_key.clone(),
    local_address_cidr: exchange.assigned_ip.clone(),
    peer_public_key,
    peer_endpoint,
    allowed_ips,
  })
  .await?;

  let machine = Machine {
    host: host.clone(),
    token,
    local_private_key: local_pair.private_base64(),
    local_public_key: local_pair.public_base64(),
    peer_public_key: exchange.peer_public_key,
    tunnel_ip: exchange.assigned_ip,
    peer_endpoint: exchange.endpoint,
    allowed_ips: exchange.allowed_ips,
    local_interface: Some(interface.to_string()),
    peer_subnet: exchange
      .advertised_subnet
      .as_deref()
      .and_then(|s| s.parse().ok()),
    connected_at: Utc::now(),
    status: cilo_client::entities::MachineStatus::Connected,
    schema_version: cilo_client::entities::MACHINE_SCHEMA_VERSION,
  };

  peers::save(&app.config, &machine, &local_pair.private_base64()).await?;
  Ok(machine)
}

/// Tear down the tunnel and forget `host`. Safe to call on a host with
/// no tunnel — it's a no-op, matching `lib/keys::tear_down`'s own
/// idempotence.
pub async fn disconnect(app: &AppState, host: &str) -> anyhow::Result<()> {
  let Ok(machine) = peers::load(&app.config, host).await else {
    return Ok(());
  };
  if let Some(name) = &machine.local_interface
    && let Ok(interface) = InterfaceName::from_str(name)
  {
    keys::tear_down(&interface).await?;
  }
  peers::remove(&app.config, host).await?;
  Ok(())
}

fn parse_cidrs(values: &[String]) -> anyhow::Result<Vec<(std::net::IpAddr, u8)>> {
  values
    .iter()
    .map(|v| {
      let network: ipnetwork::IpNetwork = v
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid allowed-ip {v}: {e}"))?;
      Ok((network.ip(), network.prefix()))
    })
    .collect()
}

/// Load the first available SSH signer: an `ed25519`/`rsa` key under
/// `~/.ssh`, tried in the order `ssh` itself prefers. Agent-based
/// signing (the spec's other "first available signer" source) is left
/// for a follow-up — it needs an agent protocol client this crate
/// doesn't otherwise have a use for.
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

/// Run the §4.M challenge/response exchange against a peer: request a
/// nonce for this host's public key, sign it with the declared
/// algorithm, and trade the signature for a bearer token.
async fn authenticate_to_peer(
  client: &CiloClient,
  identity: &PrivateKey,
) -> anyhow::Result<String> {
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
  Ok(response.token)
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn interface_names_are_deterministic_and_short() {
    let a = interface_name("laptop-1.local").unwrap();
    let b = interface_name("laptop-1.local").unwrap();
    assert_eq!(a.to_string(), b.to_string());
    assert!(a.to_string().len() <= 15);
  }

  #[test]
  fn parse_cidrs_splits_ip_and_prefix() {
    let parsed = parse_cidrs(&["10.225.0.0/24".to_string()]).unwrap();
    assert_eq!(parsed[0].1, 24);
  }
}
