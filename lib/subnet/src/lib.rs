//! Per-environment subnet allocation, per spec §4.C.
//!
//! Carves a `/24` out of a fixed `/16` base prefix using a monotonic
//! counter persisted in `State::subnet_counter`, probing the runtime
//! for collisions (another process or a leftover network cilo lost
//! track of) before handing the candidate back to the caller.

use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use runtime::RuntimeDriver;

/// Octets 1..=254 are usable /24s off the base /16; 0 is the base
/// network itself and 255 is reserved the same way network 0 is.
const MIN_THIRD_OCTET: u8 = 1;
const MAX_THIRD_OCTET: u8 = 255;

/// Derive the `k`-th `/24` off `base`, e.g. base `10.224.0.0/16`,
/// `k = 5` -> `10.224.5.0/24`.
pub fn nth_subnet(base: Ipv4Network, k: u8) -> anyhow::Result<Ipv4Network> {
  let octets = base.network().octets();
  let candidate = Ipv4Addr::new(octets[0], octets[1], k, 0);
  Ipv4Network::new(candidate, 24)
    .map_err(|e| anyhow::anyhow!("invalid subnet for counter {k}: {e}"))
}

/// Allocate the next unused `/24`, advancing `counter` in place.
///
/// Tries `counter + 1` first; if the runtime reports a colliding
/// network already in use, retries once at `counter + 2` before
/// giving up with `subnet-exhausted`. Callers are expected to hold
/// the state lock across this call and the `State` mutation that
/// commits the new `counter` value, so the probe and the commit are
/// atomic with respect to other `cilod` processes.
pub async fn allocate(
  driver: &dyn RuntimeDriver,
  base: Ipv4Network,
  counter: &mut u8,
) -> anyhow::Result<Ipv4Network> {
  let existing = driver.list_networks().await?;
  let mut attempts = 0;
  loop {
    if *counter >= MAX_THIRD_OCTET {
      anyhow::bail!("subnet-exhausted: no /24 left under {base}");
    }
    *counter += 1;
    let candidate = nth_subnet(base, *counter)?;
    let collides =
      existing.iter().any(|n| n.subnet == Some(candidate));
    if !collides {
      return Ok(candidate);
    }
    attempts += 1;
    if attempts > 1 {
      anyhow::bail!(
        "subnet-exhausted: candidates {} and {} both collide",
        *counter - 1,
        *counter
      );
    }
  }
}

#[cfg(test)]
mod test {
  use std::collections::HashMap;

  use runtime::{ContainerState, ExecOptions, ExecSession, LogOptions, LogStream, NetworkInfo, NetworkSpec, ServiceInspect, ComposeContext};
  use tokio::sync::mpsc;

  use super::*;

  struct FakeDriver {
    networks: Vec<NetworkInfo>,
  }

  #[async_trait::async_trait]
  impl RuntimeDriver for FakeDriver {
    async fn create_network(&self, _spec: &NetworkSpec) -> anyhow::Result<()> {
      Ok(())
    }
    async fn remove_network(&self, _name: &str) -> anyhow::Result<()> {
      Ok(())
    }
    async fn list_networks(&self) -> anyhow::Result<Vec<NetworkInfo>> {
      Ok(self.networks.clone())
    }
    async fn compose_up(&self, _ctx: &ComposeContext) -> anyhow::Result<()> {
      Ok(())
    }
    async fn compose_down(&self, _ctx: &ComposeContext) -> anyhow::Result<()> {
      Ok(())
    }
    async fn compose_destroy(
      &self,
      _ctx: &ComposeContext,
    ) -> anyhow::Result<()> {
      Ok(())
    }
    async fn run_container(
      &self,
      _name: &str,
      _image: &str,
      _network: &str,
      _labels: HashMap<String, String>,
    ) -> anyhow::Result<()> {
      Ok(())
    }
    async fn remove_container(&self, _name: &str) -> anyhow::Result<()> {
      Ok(())
    }
    async fn inspect_services(
      &self,
      _project_name: &str,
    ) -> anyhow::Result<HashMap<String, ServiceInspect>> {
      Ok(HashMap::new())
    }
    async fn stream_logs(
      &self,
      _container: &str,
      _options: LogOptions,
    ) -> anyhow::Result<LogStream> {
      let (_tx, rx) = mpsc::channel(1);
      Ok(LogStream { lines: rx })
    }
    async fn exec(
      &self,
      _container: &str,
      _options: ExecOptions,
    ) -> anyhow::Result<ExecSession> {
      let (stdin, _) = mpsc::channel(1);
      let (_tx, output) = mpsc::channel(1);
      Ok(ExecSession { stdin, output })
    }
    async fn attach_network(
      &self,
      _container: &str,
      _network: &str,
      _alias: Option<&str>,
    ) -> anyhow::Result<()> {
      Ok(())
    }
    async fn detach_network(
      &self,
      _container: &str,
      _network: &str,
    ) -> anyhow::Result<()> {
      Ok(())
    }
    async fn list_containers_with_label(
      &self,
      _label: &str,
    ) -> anyhow::Result<Vec<String>> {
      Ok(Vec::new())
    }
  }

  fn base() -> Ipv4Network {
    "10.224.0.0/16".parse().unwrap()
  }

  #[tokio::test]
  async fn allocates_sequential_subnets() {
    let driver = FakeDriver { networks: Vec::new() };
    let mut counter = 0u8;
    let a = allocate(&driver, base(), &mut counter).await.unwrap();
    let b = allocate(&driver, base(), &mut counter).await.unwrap();
    assert_eq!(a.to_string(), "10.224.1.0/24");
    assert_eq!(b.to_string(), "10.224.2.0/24");
  }

  #[tokio::test]
  async fn skips_a_single_colliding_candidate() {
    let colliding = nth_subnet(base(), 253).unwrap();
    let driver = FakeDriver {
      networks: vec![NetworkInfo {
        name: "other".into(),
        subnet: Some(colliding),
      }],
    };
    let mut counter = 252u8;
    let allocated = allocate(&driver, base(), &mut counter).await.unwrap();
    assert_eq!(allocated.to_string(), "10.224.254.0/24");
    assert_eq!(counter, 254);
  }

  #[tokio::test]
  async fn fails_when_two_consecutive_candidates_collide() {
    let a = nth_subnet(base(), 253).unwrap();
    let b = nth_subnet(base(), 254).unwrap();
    let driver = FakeDriver {
      networks: vec![
        NetworkInfo { name: "a".into(), subnet: Some(a) },
        NetworkInfo { name: "b".into(), subnet: Some(b) },
      ],
    };
    let mut counter = 252u8;
    let result = allocate(&driver, base(), &mut counter).await;
    assert!(result.is_err());
  }

  #[tokio::test]
  async fn reports_exhaustion_at_upper_bound() {
    let driver = FakeDriver { networks: Vec::new() };
    let mut counter = MAX_THIRD_OCTET;
    let result = allocate(&driver, base(), &mut counter).await;
    assert!(result.is_err());
  }
}
