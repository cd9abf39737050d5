//! An in-memory [`RuntimeDriver`] for unit tests that exercise the
//! lifecycle engine, subnet allocator, and reconciler without a real
//! container runtime.

use std::{
  collections::HashMap,
  net::Ipv4Addr,
  sync::{Arc, Mutex},
};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
  ComposeContext, ContainerState, ExecOptions, ExecOutput, ExecSession,
  LogOptions, LogStream, NetworkInfo, NetworkSpec, RuntimeDriver,
  ServiceInspect,
};

#[derive(Default)]
struct Inner {
  networks: HashMap<String, NetworkInfo>,
  services: HashMap<String, HashMap<String, ServiceInspect>>,
  containers: std::collections::HashSet<String>,
  next_ip: u8,
}

/// A fake runtime that tracks created networks and lets tests seed
/// the service inspection results a real `docker compose up` would
/// eventually produce.
#[derive(Clone, Default)]
pub struct MockDriver {
  inner: Arc<Mutex<Inner>>,
}

impl MockDriver {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register the services a compose project would report running,
  /// as if `docker compose up` + `inspect` had just completed.
  pub fn seed_running(&self, project: &str, services: &[&str]) {
    let mut inner = self.inner.lock().unwrap();
    inner.next_ip += 1;
    let next_ip = inner.next_ip;
    let entry = inner.services.entry(project.to_string()).or_default();
    for (i, service) in services.iter().enumerate() {
      entry.insert(
        service.to_string(),
        ServiceInspect {
          container_id: format!("{project}_{service}"),
          state: ContainerState::Running,
          health: None,
          ip: Some(Ipv4Addr::new(10, 224, next_ip, 2 + i as u8)),
          ports: Vec::new(),
          started_at: None,
        },
      );
    }
  }
}

#[async_trait]
impl RuntimeDriver for MockDriver {
  async fn create_network(&self, spec: &NetworkSpec) -> anyhow::Result<()> {
    let mut inner = self.inner.lock().unwrap();
    if inner.networks.values().any(|n| n.subnet == Some(spec.subnet)) {
      anyhow::bail!("network with subnet {} already exists", spec.subnet);
    }
    inner.networks.insert(
      spec.name.clone(),
      NetworkInfo { name: spec.name.clone(), subnet: Some(spec.subnet) },
    );
    Ok(())
  }

  async fn remove_network(&self, name: &str) -> anyhow::Result<()> {
    self.inner.lock().unwrap().networks.remove(name);
    Ok(())
  }

  async fn list_networks(&self) -> anyhow::Result<Vec<NetworkInfo>> {
    Ok(self.inner.lock().unwrap().networks.values().cloned().collect())
  }

  async fn compose_up(&self, _ctx: &ComposeContext) -> anyhow::Result<()> {
    Ok(())
  }

  async fn compose_down(&self, _ctx: &ComposeContext) -> anyhow::Result<()> {
    Ok(())
  }

  async fn compose_destroy(
    &self,
    ctx: &ComposeContext,
  ) -> anyhow::Result<()> {
    self.inner.lock().unwrap().services.remove(&ctx.project_name);
    Ok(())
  }

  async fn run_container(
    &self,
    name: &str,
    _image: &str,
    _network: &str,
    _labels: HashMap<String, String>,
  ) -> anyhow::Result<()> {
    self.inner.lock().unwrap().containers.insert(name.to_string());
    Ok(())
  }

  async fn remove_container(&self, name: &str) -> anyhow::Result<()> {
    self.inner.lock().unwrap().containers.remove(name);
    Ok(())
  }

  async fn inspect_services(
    &self,
    project_name: &str,
  ) -> anyhow::Result<HashMap<String, ServiceInspect>> {
    Ok(
      self
        .inner
        .lock()
        .unwrap()
        .services
        .get(project_name)
        .cloned()
        .unwrap_or_default(),
    )
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
    let (out_tx, output) = mpsc::channel(1);
    let _ = out_tx.send(ExecOutput::Exit(0)).await;
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

#[cfg(test)]
mod test {
  use ipnetwork::Ipv4Network;

  use super::*;

  #[tokio::test]
  async fn rejects_colliding_subnets() {
    let driver = MockDriver::new();
    let subnet: Ipv4Network = "10.224.1.0/24".parse().unwrap();
    driver
      .create_network(&NetworkSpec {
        name: "cilo_p_dev".into(),
        subnet,
        labels: HashMap::new(),
      })
      .await
      .unwrap();

    let result = driver
      .create_network(&NetworkSpec {
        name: "cilo_p_other".into(),
        subnet,
        labels: HashMap::new(),
      })
      .await;
    assert!(result.is_err());
  }

  #[tokio::test]
  async fn seed_running_is_visible_to_inspect() {
    let driver = MockDriver::new();
    driver.seed_running("p_dev", &["web", "db"]);
    let services = driver.inspect_services("p_dev").await.unwrap();
    assert_eq!(services.len(), 2);
    assert!(services["web"].ip.is_some());
  }

  #[tokio::test]
  async fn run_and_remove_container_round_trip() {
    let driver = MockDriver::new();
    driver
      .run_container("cilo_shared_p_redis", "redis:7", "cilo_p_dev", HashMap::new())
      .await
      .unwrap();
    assert!(driver.inner.lock().unwrap().containers.contains("cilo_shared_p_redis"));
    driver.remove_container("cilo_shared_p_redis").await.unwrap();
    assert!(!driver.inner.lock().unwrap().containers.contains("cilo_shared_p_redis"));
  }
}
