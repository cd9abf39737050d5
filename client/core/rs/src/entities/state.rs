use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

/// The single persisted document that is the sole source of truth for
/// a host's environments, shared services, and shared networks. Never
/// cached in memory beyond the lifetime of one `with_lock` call; see
/// `state_store`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct State {
  pub schema_version: u32,
  /// Dotted `/16` prefix, eg `10.224.`
  pub base_subnet: String,
  pub dns_port: u16,
  pub subnet_counter: u32,
  #[serde(default)]
  pub hosts: BTreeMap<String, Host>,
  #[serde(default)]
  pub shared_networks: BTreeMap<String, SharedNetwork>,
  #[serde(default)]
  pub shared_services: BTreeMap<String, SharedService>,
}

pub const LOCAL_HOST_ID: &str = "local";
pub const CURRENT_SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_DNS_PORT: u16 = 5354;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Host {
  pub id: String,
  pub provider: String,
  #[serde(default)]
  pub environments: BTreeMap<String, Environment>,
}

impl Host {
  pub fn local() -> Self {
    Self {
      id: LOCAL_HOST_ID.to_string(),
      provider: "local".to_string(),
      environments: BTreeMap::new(),
    }
  }
}

/// Composes `"<project>/<name>"`, the key under which an environment
/// is stored in `Host.environments`.
pub fn environment_key(project: &str, name: &str) -> String {
  format!("{project}/{name}")
}

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentStatus {
  #[default]
  Created,
  Starting,
  Running,
  Stopping,
  Stopped,
  Destroying,
  Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
  pub name: String,
  pub project: String,
  pub created_at: DateTime<Utc>,
  pub subnet: Ipv4Network,
  #[serde(default = "default_dns_suffix")]
  pub dns_suffix: String,
  pub status: EnvironmentStatus,
  pub workspace_path: String,
  #[serde(default)]
  pub services: BTreeMap<String, Service>,
  #[serde(default)]
  pub shared_services: Vec<String>,
  /// Populated when `status == Error`. [SUPPLEMENT] field, not named
  /// directly in the data model but required to implement the
  /// lifecycle engine's error-record behavior.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

pub fn default_dns_suffix() -> String {
  ".test".to_string()
}

impl Environment {
  pub fn key(&self) -> String {
    environment_key(&self.project, &self.name)
  }

  /// The first service flagged `ingress`, by lexicographic name, per
  /// spec §4.G's tie-break rule.
  pub fn ingress_service(&self) -> Option<&Service> {
    self
      .services
      .values()
      .filter(|s| s.ingress)
      .min_by(|a, b| a.name.cmp(&b.name))
  }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Service {
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub ip: Option<std::net::Ipv4Addr>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub container_id: Option<String>,
  #[serde(default)]
  pub hostnames: Vec<String>,
  #[serde(default)]
  pub ingress: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedService {
  pub service: String,
  pub container_name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub ip: Option<std::net::Ipv4Addr>,
  pub project: String,
  /// [SUPPLEMENT] image reference, used for conflict diagnostics.
  pub image: String,
  pub config_hash: String,
  pub created_at: DateTime<Utc>,
  #[serde(default)]
  pub used_by: Vec<String>,
  /// `None` is the "zero value": either in use, or just emptied and
  /// pending a grace-period assignment.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub disconnect_timeout: Option<DateTime<Utc>>,
}

impl SharedService {
  /// Deterministic container name per spec §3.
  pub fn container_name_for(project: &str, service: &str) -> String {
    format!("cilo_shared_{project}_{service}")
  }

  pub fn key(&self) -> String {
    format!("{}/{}", self.project, self.service)
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedNetwork {
  pub created_at: DateTime<Utc>,
  pub origin_env: String,
  #[serde(default)]
  pub referencing_envs: Vec<String>,
}

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum MachineStatus {
  #[default]
  Connected,
  Disconnected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Machine {
  pub host: String,
  pub token: String,
  pub local_private_key: String,
  pub local_public_key: String,
  pub peer_public_key: String,
  /// eg `10.225.0.4/32`
  pub tunnel_ip: String,
  pub peer_endpoint: String,
  #[serde(default)]
  pub allowed_ips: Vec<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub local_interface: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub peer_subnet: Option<Ipv4Network>,
  pub connected_at: DateTime<Utc>,
  pub status: MachineStatus,
  /// Gates `machines`' tolerance of corrupt per-peer records the same
  /// way `State.schema_version` gates store loads. [SUPPLEMENT].
  pub schema_version: u32,
}

pub const MACHINE_SCHEMA_VERSION: u32 = 1;

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn environment_key_is_project_slash_name() {
    assert_eq!(environment_key("storefront", "dev"), "storefront/dev");
  }

  #[test]
  fn ingress_service_breaks_ties_lexicographically() {
    let mut env = Environment {
      name: "dev".into(),
      project: "p".into(),
      created_at: Utc::now(),
      subnet: "10.224.1.0/24".parse().unwrap(),
      dns_suffix: default_dns_suffix(),
      status: EnvironmentStatus::Running,
      workspace_path: "/tmp/p-dev".into(),
      services: BTreeMap::new(),
      shared_services: Vec::new(),
      error: None,
    };
    env.services.insert(
      "web".into(),
      Service { name: "web".into(), ingress: true, ..Default::default() },
    );
    env.services.insert(
      "api".into(),
      Service { name: "api".into(), ingress: true, ..Default::default() },
    );
    assert_eq!(env.ingress_service().unwrap().name, "api");
  }
}
