//! WireGuard keypair generation and the tunnel-interface lifecycle
//! behind `connect`/`disconnect` (spec §4.K), grounded on
//! `tonarino/innernet`'s use of `wireguard-control`'s
//! `Device`/`DeviceUpdate`/`PeerConfigBuilder` API.
//!
//! `wireguard-control` owns the WireGuard device's own state (keys,
//! listen port, peers) but not the interface's IP address — innernet
//! shells out for that too, so `bring_up`/`tear_down` do the same via
//! `lib/command`.

use std::net::SocketAddr;

use wireguard_control::{
  Backend, Device, DeviceUpdate, InterfaceName, Key, PeerConfigBuilder,
};

/// Keepalive interval mandated by spec §4.K's `connect` description.
pub const PERSISTENT_KEEPALIVE_SECS: u16 = 25;

/// UDP port every cilod listens for WireGuard traffic on, set
/// explicitly (rather than left to the backend's default) so a peer
/// can compute the other side's endpoint from its address alone.
pub const LISTEN_PORT: u16 = 51820;

pub struct KeyPair {
  pub private_key: Key,
  pub public_key: Key,
}

impl KeyPair {
  pub fn generate() -> Self {
    let private_key = Key::generate_private();
    let public_key = private_key.get_public();
    Self { private_key, public_key }
  }

  pub fn private_base64(&self) -> String {
    self.private_key.to_base64()
  }

  pub fn public_base64(&self) -> String {
    self.public_key.to_base64()
  }
}

/// Everything needed to bring a peer-to-peer tunnel interface up, one
/// per connected `Machine`.
pub struct TunnelConfig {
  pub interface: InterfaceName,
  pub local_private_key: Key,
  pub local_address_cidr: String,
  pub peer_public_key: Key,
  pub peer_endpoint: SocketAddr,
  pub allowed_ips: Vec<(std::net::IpAddr, u8)>,
}

/// Create the WireGuard device, configure its peer, and assign the
/// local tunnel address. Idempotent: re-running against an interface
/// that already exists just updates its peer list.
pub async fn bring_up(config: &TunnelConfig) -> anyhow::Result<()> {
  let backend = default_backend();

  let mut peer = PeerConfigBuilder::new(&config.peer_public_key);
  for (ip, cidr) in &config.allowed_ips {
    peer = peer.add_allowed_ip(*ip, *cidr);
  }
  peer = peer
    .set_endpoint(config.peer_endpoint)
    .set_persistent_keepalive_interval(PERSISTENT_KEEPALIVE_SECS);

  DeviceUpdate::new()
    .set_private_key(config.local_private_key.clone())
    .set_listen_port(LISTEN_PORT)
    .add_peer(peer)
    .apply(&config.interface, backend)
    .map_err(|e| {
      anyhow::anyhow!("failed to apply wireguard device update: {e}")
    })?;

  assign_address(&config.interface, &config.local_address_cidr).await?;
  link_up(&config.interface).await?;

  Ok(())
}

/// Remove the tunnel interface entirely. Not an error if it's already
/// gone — `disconnect` is expected to be safe to call twice.
pub async fn tear_down(interface: &InterfaceName) -> anyhow::Result<()> {
  if Device::get(interface, default_backend()).is_err() {
    return Ok(());
  }
  let output =
    command::run_shell_command(&format!("ip link delete {interface}"), None)
      .await;
  if !output.success() {
    tracing::warn!(
      "failed to delete wireguard interface {interface}: {}",
      output.stderr
    );
  }
  Ok(())
}

async fn assign_address(
  interface: &InterfaceName,
  address_cidr: &str,
) -> anyhow::Result<()> {
  let output = command::run_shell_command(
    &format!("ip address add {address_cidr} dev {interface}"),
    None,
  )
  .await;
  if !output.success() {
    anyhow::bail!(
      "failed to assign {address_cidr} to {interface}: {}",
      output.stderr
    );
  }
  Ok(())
}

async fn link_up(interface: &InterfaceName) -> anyhow::Result<()> {
  let output =
    command::run_shell_command(&format!("ip link set up dev {interface}"), None)
      .await;
  if !output.success() {
    anyhow::bail!("failed to bring up {interface}: {}", output.stderr);
  }
  Ok(())
}

#[cfg(target_os = "linux")]
fn default_backend() -> Backend {
  Backend::Kernel
}

#[cfg(not(target_os = "linux"))]
fn default_backend() -> Backend {
  Backend::Userspace
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn generated_keypair_round_trips_through_base64() {
    let pair = KeyPair::generate();
    let decoded = Key::from_base64(&pair.public_base64()).unwrap();
    assert_eq!(decoded.as_bytes(), pair.public_key.as_bytes());
  }

  #[test]
  fn generated_keys_are_distinct() {
    let a = KeyPair::generate();
    let b = KeyPair::generate();
    assert_ne!(a.private_base64(), b.private_base64());
  }
}
