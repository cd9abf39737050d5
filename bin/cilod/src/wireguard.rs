//! Responder side of the spec §4.K handshake, answering
//! `POST /wireguard/exchange` and `DELETE /wireguard/peers/{key}`. The
//! initiating half lives in `tunnel::connect`; this module is its
//! mirror — it allocates a tunnel address pair, brings up this host's
//! end of the same interface, and persists a `Machine` record of its
//! own so `load_machines` (and therefore `dns::render`) sees the peer
//! from both directions.

use std::net::{IpAddr, SocketAddr};

use chrono::Utc;
use cilo_client::{
  api::WireguardExchangeResponse,
  entities::{MACHINE_SCHEMA_VERSION, Machine, MachineStatus},
};
use sha2::{Digest, Sha256};
use wireguard_control::Key;

use crate::{peers, state::AppState, tunnel};

/// `/16` reserved for peer-to-peer tunnels, distinct from the `/16`
/// `cilod` carves environment subnets from.
const TUNNEL_BASE: &str = "10.200.";

/// Stable label for a connecting identity: every exchange from the
/// same SSH public key lands on the same peer directory and tunnel
/// slot, so repeated `connect`/`disconnect` cycles from one peer don't
/// leak slots.
fn peer_host_id(ssh_public_key: &str) -> String {
  let digest = Sha256::digest(ssh_public_key.as_bytes());
  format!("peer-{}", hex::encode(&digest[..6]))
}

fn slot_from_tunnel_ip(tunnel_ip: &str) -> Option<u8> {
  let rest = tunnel_ip.strip_prefix(TUNNEL_BASE)?;
  let octets: Vec<&str> = rest.split('.').collect();
  octets.first()?.parse().ok()
}

async fn allocate_slot(app: &AppState, exclude_host: &str) -> anyhow::Result<u8> {
  let taken: std::collections::HashSet<u8> = peers::list(&app.config)
    .await
    .into_iter()
    .filter(|m| m.host != exclude_host)
    .filter_map(|m| slot_from_tunnel_ip(&m.tunnel_ip))
    .collect();
  (1u8..=254)
    .find(|slot| !taken.contains(slot))
    .ok_or_else(|| anyhow::anyhow!("wireguard-pool-exhausted: no tunnel slots remain in {TUNNEL_BASE}0.0/16"))
}

/// Handle one `/wireguard/exchange` call: `authenticated_ssh_key` is
/// the identity the bearer token resolved to, `requester_wg_public_key`
/// is the key the peer wants us to trust, and `request_host` is the
/// `Host` header the peer dialed us on — reused (with the WireGuard
/// port swapped in) so the peer doesn't have to guess our address.
pub async fn exchange(
  app: &AppState,
  authenticated_ssh_key: &str,
  issued_token: &str,
  requester_wg_public_key: &str,
  request_host: &str,
) -> anyhow::Result<WireguardExchangeResponse> {
  let host = peer_host_id(authenticated_ssh_key);
  let peer_key = Key::from_base64(requester_wg_public_key)
    .map_err(|e| anyhow::anyhow!("invalid wireguard public key: {e}"))?;

  let slot = allocate_slot(app, &host).await?;
  let my_ip = format!("{TUNNEL_BASE}{slot}.1/30");
  let their_ip = format!("{TUNNEL_BASE}{slot}.2/30");

  let local_pair = keys::KeyPair::generate();
  let interface = tunnel::interface_name(&host)?;
  let request_ip: IpAddr = request_host
    .rsplit_once(':')
    .map(|(ip, _)| ip)
    .unwrap_or(request_host)
    .parse()
    .map_err(|e| anyhow::anyhow!("could not parse requester host {request_host}: {e}"))?;
  let peer_endpoint = SocketAddr::new(request_ip, keys::LISTEN_PORT);

  keys::bring_up(&keys::TunnelConfig {
    interface: interface.clone(),
    local_private_key: local_pair.private_key.clone(),
    local_address_cidr: my_ip.clone(),
    peer_public_key: peer_key,
    peer_endpoint,
    allowed_ips: vec![(format!("{TUNNEL_BASE}{slot}.2").parse()?, 32)],
  })
  .await?;

  let advertised_subnet = format!("{}0.0/16", app.config.base_subnet);

  let machine = Machine {
    host: host.clone(),
    token: issued_token.to_string(),
    local_private_key: local_pair.private_base64(),
    local_public_key: local_pair.public_base64(),
    peer_public_key: requester_wg_public_key.to_string(),
    tunnel_ip: my_ip.clone(),
    peer_endpoint: peer_endpoint.to_string(),
    allowed_ips: vec![their_ip.clone()],
    local_interface: Some(interface.to_string()),
    peer_subnet: Some(advertised_subnet.parse()?),
    connected_at: Utc::now(),
    status: MachineStatus::Connected,
    schema_version: MACHINE_SCHEMA_VERSION,
  };
  peers::save(&app.config, &machine, &local_pair.private_base64()).await?;

  Ok(WireguardExchangeResponse {
    peer_public_key: local_pair.public_base64(),
    assigned_ip: their_ip,
    endpoint: format!("{}:{}", request_ip, keys::LISTEN_PORT),
    allowed_ips: vec![format!("{TUNNEL_BASE}{slot}.1/32"), advertised_subnet.clone()],
    advertised_subnet: Some(advertised_subnet),
  })
}

/// `DELETE /wireguard/peers/{key}`: tear down whichever of our peer
/// records was issued this WireGuard public key. A key we don't
/// recognize is not an error — the peer may have already been
/// reconciled away.
pub async fn remove_peer(app: &AppState, wg_public_key: &str) -> anyhow::Result<()> {
  let Some(machine) = peers::list(&app.config)
    .await
    .into_iter()
    .find(|m| m.peer_public_key == wg_public_key)
  else {
    return Ok(());
  };
  tunnel::disconnect(app, &machine.host).await
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn peer_host_id_is_stable_for_the_same_key() {
    assert_eq!(peer_host_id("ssh-ed25519 AAAA x"), peer_host_id("ssh-ed25519 AAAA x"));
  }

  #[test]
  fn slot_from_tunnel_ip_reads_the_third_octet() {
    assert_eq!(slot_from_tunnel_ip("10.200.7.1/30"), Some(7));
    assert_eq!(slot_from_tunnel_ip("10.224.0.0/16"), None);
  }
}
