//! Resolves a `CiloClient` pointed at either the local `cilod` or a
//! `--on <host>` peer, authenticating it for environment-scoped calls.

use cilo_client::CiloClient;

use crate::{auth, settings};

/// `machines`/`doctor`/`connect`/`disconnect` are [SUPPLEMENT]
/// local-control calls, never bearer-gated, and never routed through
/// `--on` — they always mean "this operator's own `cilod`".
pub fn local() -> anyhow::Result<CiloClient> {
  CiloClient::new(settings::local_cilod_address())
}

/// Resolve and authenticate a client for an environment-scoped
/// command. `on` names a connected peer (by the host label `cilo
/// machines` prints); `None` means the local daemon.
pub async fn resolve(on: Option<&str>) -> anyhow::Result<CiloClient> {
  let address = match on {
    None => settings::local_cilod_address(),
    Some(host) => peer_address(host).await?,
  };
  let client = CiloClient::new(address)?;
  auth::authenticate(&client).await?;
  Ok(client)
}

/// A peer's tunnel carries its own `cilod` reachable at the tunnel IP
/// the exchange assigned it, port `keys::LISTEN_PORT`'s HTTP sibling —
/// cilod always listens on 8081 regardless of which interface, so we
/// only need the tunnel address, not the port.
async fn peer_address(host: &str) -> anyhow::Result<String> {
  let machines = local()?.list_machines().await?;
  let machine = machines
    .into_iter()
    .find(|m| m.host == host)
    .ok_or_else(|| anyhow::anyhow!("not-connected: no tunnel to {host}, run `cilo connect {host}` first"))?;

  let peer_ip = machine
    .allowed_ips
    .iter()
    .find_map(|cidr| cidr.split('/').next())
    .ok_or_else(|| anyhow::anyhow!("machine record for {host} has no allowed IPs"))?;

  Ok(format!("http://{peer_ip}:8081"))
}
