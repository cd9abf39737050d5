use std::{collections::HashMap, net::Ipv4Addr, path::PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

mod docker;
pub mod mock;

pub use docker::DockerDriver;

/// A bridged network to create for one environment, carved from the
/// allocated /24 by `subnet`.
#[derive(Debug, Clone)]
pub struct NetworkSpec {
  pub name: String,
  pub subnet: Ipv4Network,
  pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct NetworkInfo {
  pub name: String,
  pub subnet: Option<Ipv4Network>,
}

/// Everything the runtime needs to drive a `docker compose` project:
/// the user's compose files plus the override cilo generated, and the
/// directory they should be resolved relative to.
#[derive(Debug, Clone)]
pub struct ComposeContext {
  pub project_name: String,
  pub working_dir: PathBuf,
  pub compose_files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
  Created,
  Running,
  Restarting,
  Exited,
  Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
  pub container_port: u16,
  pub host_port: Option<u16>,
  pub protocol: String,
}

#[derive(Debug, Clone)]
pub struct ServiceInspect {
  pub container_id: String,
  pub state: ContainerState,
  pub health: Option<String>,
  pub ip: Option<Ipv4Addr>,
  pub ports: Vec<PortMapping>,
  pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
  pub follow: bool,
  pub tail: Option<u64>,
  pub since: Option<DateTime<Utc>>,
  pub until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub enum LogLine {
  Stdout(String),
  Stderr(String),
}

pub struct LogStream {
  pub lines: mpsc::Receiver<LogLine>,
}

#[derive(Debug, Clone)]
pub struct ExecOptions {
  pub command: Vec<String>,
  pub tty: bool,
}

pub enum ExecOutput {
  Stdout(Bytes),
  Stderr(Bytes),
  Exit(i64),
}

/// A running exec session: callers push raw bytes typed by the remote
/// user into `stdin` and drain `output` until an `Exit` frame arrives.
pub struct ExecSession {
  pub stdin: mpsc::Sender<Bytes>,
  pub output: mpsc::Receiver<ExecOutput>,
}

/// Capability interface over "a container runtime", per spec §4.F.
/// Implementations fail fast with an error whose message identifies
/// runtime unavailability; the driver itself holds no state beyond a
/// client handle — all persistence lives in `state_store`.
#[async_trait]
pub trait RuntimeDriver: Send + Sync {
  async fn create_network(&self, spec: &NetworkSpec) -> anyhow::Result<()>;
  async fn remove_network(&self, name: &str) -> anyhow::Result<()>;
  async fn list_networks(&self) -> anyhow::Result<Vec<NetworkInfo>>;

  async fn compose_up(&self, ctx: &ComposeContext) -> anyhow::Result<()>;
  async fn compose_down(&self, ctx: &ComposeContext) -> anyhow::Result<()>;
  async fn compose_destroy(
    &self,
    ctx: &ComposeContext,
  ) -> anyhow::Result<()>;

  /// Start a single standalone container attached to `network`,
  /// outside of any compose project — used by the shared-service
  /// coordinator, whose singletons are not owned by one environment's
  /// compose file.
  async fn run_container(
    &self,
    name: &str,
    image: &str,
    network: &str,
    labels: HashMap<String, String>,
  ) -> anyhow::Result<()>;

  async fn remove_container(&self, name: &str) -> anyhow::Result<()>;

  /// Inspect every container belonging to `project_name`, keyed by
  /// the compose service name (the `com.docker.compose.service` label).
  async fn inspect_services(
    &self,
    project_name: &str,
  ) -> anyhow::Result<HashMap<String, ServiceInspect>>;

  async fn stream_logs(
    &self,
    container: &str,
    options: LogOptions,
  ) -> anyhow::Result<LogStream>;

  async fn exec(
    &self,
    container: &str,
    options: ExecOptions,
  ) -> anyhow::Result<ExecSession>;

  async fn attach_network(
    &self,
    container: &str,
    network: &str,
    alias: Option<&str>,
  ) -> anyhow::Result<()>;

  async fn detach_network(
    &self,
    container: &str,
    network: &str,
  ) -> anyhow::Result<()>;

  /// Containers carrying the `label` key (value ignored), used by the
  /// reconciler to find Cilo-managed containers state doesn't know
  /// about.
  async fn list_containers_with_label(
    &self,
    label: &str,
  ) -> anyhow::Result<Vec<String>>;
}

pub const CILO_LABEL: &str = "dev.cilo.managed";
pub const PROJECT_LABEL: &str = "com.docker.compose.project";
pub const SERVICE_LABEL: &str = "com.docker.compose.service";
