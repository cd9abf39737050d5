use std::collections::HashMap;

use async_trait::async_trait;
use bollard::{
  Docker,
  container::{InspectContainerOptions, LogOutput, LogsOptions},
  exec::{CreateExecOptions, StartExecOptions, StartExecResults},
  network::{
    ConnectNetworkOptions, CreateNetworkOptions, DisconnectNetworkOptions,
    ListNetworksOptions,
  },
  query_parameters::ListContainersOptionsBuilder,
  secret::{EndpointSettings, Ipam, IpamConfig},
};
use bytes::Bytes;
use command::{run_standard_command, run_shell_command};
use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::{
  CILO_LABEL, ComposeContext, ContainerState, ExecOptions, ExecOutput,
  ExecSession, LogLine, LogOptions, LogStream, NetworkInfo, NetworkSpec,
  PortMapping, RuntimeDriver, SERVICE_LABEL, ServiceInspect,
};

/// Shells out to `docker compose` for project orchestration, and talks
/// to the daemon socket directly via `bollard` for network management
/// and container inspection — the same split periphery draws between
/// CLI-driven compose and typed-API inspection.
pub struct DockerDriver {
  docker: Docker,
}

impl DockerDriver {
  pub fn connect() -> anyhow::Result<Self> {
    let docker = Docker::connect_with_local_defaults().map_err(|e| {
      anyhow::anyhow!("runtime-unavailable: failed to connect to docker: {e}")
    })?;
    Ok(Self { docker })
  }

  fn compose_command(ctx: &ComposeContext, args: &str) -> String {
    let files = ctx
      .compose_files
      .iter()
      .map(|f| format!("-f {}", f.display()))
      .collect::<Vec<_>>()
      .join(" ");
    format!("docker compose -p {} {files} {args}", ctx.project_name)
  }
}

#[async_trait]
impl RuntimeDriver for DockerDriver {
  async fn create_network(&self, spec: &NetworkSpec) -> anyhow::Result<()> {
    let mut labels = spec.labels.clone();
    labels.insert(CILO_LABEL.to_string(), "true".to_string());

    self
      .docker
      .create_network(CreateNetworkOptions {
        name: spec.name.clone(),
        driver: "bridge".to_string(),
        ipam: Ipam {
          config: Some(vec![IpamConfig {
            subnet: Some(spec.subnet.to_string()),
            ..Default::default()
          }]),
          ..Default::default()
        },
        labels,
        ..Default::default()
      })
      .await
      .map_err(|e| {
        anyhow::anyhow!("runtime-unavailable: create network {}: {e}", spec.name)
      })?;
    Ok(())
  }

  async fn remove_network(&self, name: &str) -> anyhow::Result<()> {
    self.docker.remove_network(name).await.map_err(|e| {
      anyhow::anyhow!("runtime-unavailable: remove network {name}: {e}")
    })?;
    Ok(())
  }

  async fn list_networks(&self) -> anyhow::Result<Vec<NetworkInfo>> {
    let networks = self
      .docker
      .list_networks(None::<ListNetworksOptions<String>>)
      .await
      .map_err(|e| {
        anyhow::anyhow!("runtime-unavailable: list networks: {e}")
      })?;

    Ok(
      networks
        .into_iter()
        .map(|n| {
          let subnet = n
            .ipam
            .and_then(|ipam| ipam.config)
            .and_then(|configs| configs.into_iter().next())
            .and_then(|c| c.subnet)
            .and_then(|s| s.parse().ok());
          NetworkInfo { name: n.name.unwrap_or_default(), subnet }
        })
        .collect(),
    )
  }

  async fn compose_up(&self, ctx: &ComposeContext) -> anyhow::Result<()> {
    let out =
      run_shell_command(&Self::compose_command(ctx, "up -d"), ctx.working_dir.as_path())
        .await;
    if !out.success() {
      anyhow::bail!("runtime-unavailable: compose up failed: {}", out.combined());
    }
    Ok(())
  }

  async fn compose_down(&self, ctx: &ComposeContext) -> anyhow::Result<()> {
    let out =
      run_shell_command(&Self::compose_command(ctx, "stop"), ctx.working_dir.as_path())
        .await;
    if !out.success() {
      anyhow::bail!("runtime-unavailable: compose stop failed: {}", out.combined());
    }
    Ok(())
  }

  async fn compose_destroy(&self, ctx: &ComposeContext) -> anyhow::Result<()> {
    let out = run_shell_command(
      &Self::compose_command(ctx, "down -v --remove-orphans"),
      ctx.working_dir.as_path(),
    )
    .await;
    if !out.success() {
      anyhow::bail!("runtime-unavailable: compose down failed: {}", out.combined());
    }
    Ok(())
  }

  async fn run_container(
    &self,
    name: &str,
    image: &str,
    network: &str,
    labels: HashMap<String, String>,
  ) -> anyhow::Result<()> {
    let mut labels = labels;
    labels.insert(CILO_LABEL.to_string(), "true".to_string());

    self
      .docker
      .create_container(
        Some(bollard::query_parameters::CreateContainerOptionsBuilder::new().name(name).build()),
        bollard::container::Config {
          image: Some(image.to_string()),
          labels: Some(labels),
          host_config: Some(bollard::secret::HostConfig {
            network_mode: Some(network.to_string()),
            ..Default::default()
          }),
          ..Default::default()
        },
      )
      .await
      .map_err(|e| {
        anyhow::anyhow!("runtime-unavailable: create container {name}: {e}")
      })?;

    self
      .docker
      .start_container(name, None::<bollard::query_parameters::StartContainerOptions>)
      .await
      .map_err(|e| {
        anyhow::anyhow!("runtime-unavailable: start container {name}: {e}")
      })?;

    Ok(())
  }

  async fn remove_container(&self, name: &str) -> anyhow::Result<()> {
    self
      .docker
      .remove_container(
        name,
        Some(
          bollard::query_parameters::RemoveContainerOptionsBuilder::new()
            .force(true)
            .build(),
        ),
      )
      .await
      .map_err(|e| {
        anyhow::anyhow!("runtime-unavailable: remove container {name}: {e}")
      })?;
    Ok(())
  }

  async fn inspect_services(
    &self,
    project_name: &str,
  ) -> anyhow::Result<HashMap<String, ServiceInspect>> {
    let containers = self.list_containers_with_label(project_name).await?;
    let mut out = HashMap::new();

    for container_id in containers {
      let inspect = self
        .docker
        .inspect_container(&container_id, None::<InspectContainerOptions>)
        .await
        .map_err(|e| {
          anyhow::anyhow!("runtime-unavailable: inspect {container_id}: {e}")
        })?;

      let service = inspect
        .config
        .as_ref()
        .and_then(|c| c.labels.as_ref())
        .and_then(|labels| labels.get(SERVICE_LABEL))
        .cloned()
        .unwrap_or_else(|| container_id.clone());

      let state = match inspect
        .state
        .as_ref()
        .and_then(|s| s.status.as_ref())
        .map(|s| s.as_ref())
      {
        Some("running") => ContainerState::Running,
        Some("restarting") => ContainerState::Restarting,
        Some("exited") | Some("dead") => ContainerState::Exited,
        Some("created") => ContainerState::Created,
        _ => ContainerState::Unknown,
      };

      let health = inspect
        .state
        .as_ref()
        .and_then(|s| s.health.as_ref())
        .and_then(|h| h.status.as_ref())
        .map(|s| format!("{s:?}"));

      let ip = inspect
        .network_settings
        .as_ref()
        .and_then(|n| n.networks.as_ref())
        .and_then(|nets| nets.values().next())
        .and_then(|ep| ep.ip_address.as_ref())
        .and_then(|ip| ip.parse().ok());

      let ports = inspect
        .network_settings
        .as_ref()
        .and_then(|n| n.ports.as_ref())
        .map(|ports| {
          ports
            .iter()
            .filter_map(|(spec, bindings)| {
              let (port_str, proto) = spec.split_once('/')?;
              let container_port = port_str.parse().ok()?;
              let host_port = bindings
                .as_ref()
                .and_then(|b| b.first())
                .and_then(|b| b.host_port.as_ref())
                .and_then(|p| p.parse().ok());
              Some(PortMapping {
                container_port,
                host_port,
                protocol: proto.to_string(),
              })
            })
            .collect()
        })
        .unwrap_or_default();

      let started_at = inspect
        .state
        .as_ref()
        .and_then(|s| s.started_at.as_ref())
        .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&chrono::Utc));

      out.insert(
        service,
        ServiceInspect {
          container_id,
          state,
          health,
          ip,
          ports,
          started_at,
        },
      );
    }

    Ok(out)
  }

  async fn stream_logs(
    &self,
    container: &str,
    options: LogOptions,
  ) -> anyhow::Result<LogStream> {
    let (tx, rx) = mpsc::channel(256);

    let mut stream = self.docker.logs(
      container,
      Some(LogsOptions::<String> {
        follow: options.follow,
        stdout: true,
        stderr: true,
        tail: options
          .tail
          .map(|t| t.to_string())
          .unwrap_or_else(|| "all".to_string()),
        since: options.since.map(|t| t.timestamp()).unwrap_or(0),
        until: options.until.map(|t| t.timestamp()).unwrap_or(0),
        timestamps: false,
        ..Default::default()
      }),
    );

    tokio::spawn(async move {
      while let Some(chunk) = stream.next().await {
        let line = match chunk {
          Ok(LogOutput::StdOut { message }) => {
            LogLine::Stdout(String::from_utf8_lossy(&message).into_owned())
          }
          Ok(LogOutput::StdErr { message }) => {
            LogLine::Stderr(String::from_utf8_lossy(&message).into_owned())
          }
          Ok(_) => continue,
          Err(e) => {
            tracing::warn!("log stream error: {e:#}");
            break;
          }
        };
        if tx.send(line).await.is_err() {
          break;
        }
      }
    });

    Ok(LogStream { lines: rx })
  }

  async fn exec(
    &self,
    container: &str,
    options: ExecOptions,
  ) -> anyhow::Result<ExecSession> {
    let exec = self
      .docker
      .create_exec(
        container,
        CreateExecOptions {
          cmd: Some(options.command.clone()),
          attach_stdout: Some(true),
          attach_stderr: Some(true),
          attach_stdin: Some(true),
          tty: Some(options.tty),
          ..Default::default()
        },
      )
      .await
      .map_err(|e| anyhow::anyhow!("runtime-unavailable: create exec: {e}"))?;

    let started = self
      .docker
      .start_exec(&exec.id, None::<StartExecOptions>)
      .await
      .map_err(|e| anyhow::anyhow!("runtime-unavailable: start exec: {e}"))?;

    let StartExecResults::Attached { mut output, mut input } = started else {
      anyhow::bail!("runtime-unavailable: exec session started detached");
    };

    let (stdin_tx, mut stdin_rx) = mpsc::channel::<Bytes>(256);
    let (out_tx, out_rx) = mpsc::channel(256);

    tokio::spawn(async move {
      use tokio::io::AsyncWriteExt;
      while let Some(bytes) = stdin_rx.recv().await {
        if input.write_all(&bytes).await.is_err() {
          break;
        }
      }
    });

    let docker = self.docker.clone();
    let exec_id = exec.id.clone();
    tokio::spawn(async move {
      while let Some(chunk) = output.next().await {
        let frame = match chunk {
          Ok(LogOutput::StdOut { message }) => ExecOutput::Stdout(message),
          Ok(LogOutput::StdErr { message }) => ExecOutput::Stderr(message),
          Ok(_) => continue,
          Err(e) => {
            tracing::warn!("exec stream error: {e:#}");
            break;
          }
        };
        if out_tx.send(frame).await.is_err() {
          return;
        }
      }
      let exit_code = docker
        .inspect_exec(&exec_id)
        .await
        .ok()
        .and_then(|i| i.exit_code)
        .unwrap_or(0);
      let _ = out_tx.send(ExecOutput::Exit(exit_code)).await;
    });

    Ok(ExecSession { stdin: stdin_tx, output: out_rx })
  }

  async fn attach_network(
    &self,
    container: &str,
    network: &str,
    alias: Option<&str>,
  ) -> anyhow::Result<()> {
    self
      .docker
      .connect_network(
        network,
        ConnectNetworkOptions {
          container: container.to_string(),
          endpoint_config: EndpointSettings {
            aliases: alias.map(|a| vec![a.to_string()]),
            ..Default::default()
          },
        },
      )
      .await
      .map_err(|e| {
        anyhow::anyhow!(
          "runtime-unavailable: attach {container} to {network}: {e}"
        )
      })?;
    Ok(())
  }

  async fn detach_network(
    &self,
    container: &str,
    network: &str,
  ) -> anyhow::Result<()> {
    self
      .docker
      .disconnect_network(
        network,
        DisconnectNetworkOptions {
          container: container.to_string(),
          force: false,
        },
      )
      .await
      .map_err(|e| {
        anyhow::anyhow!(
          "runtime-unavailable: detach {container} from {network}: {e}"
        )
      })?;
    Ok(())
  }

  async fn list_containers_with_label(
    &self,
    label: &str,
  ) -> anyhow::Result<Vec<String>> {
    let mut filters = HashMap::new();
    filters.insert("label".to_string(), vec![label.to_string()]);

    let containers = self
      .docker
      .list_containers(Some(
        ListContainersOptionsBuilder::new()
          .all(true)
          .filters(&filters)
          .build(),
      ))
      .await
      .map_err(|e| anyhow::anyhow!("runtime-unavailable: list containers: {e}"))?;

    Ok(
      containers
        .into_iter()
        .filter_map(|c| c.id)
        .collect(),
    )
  }
}

/// Fallback used when no compose CLI resolves `docker` directly; kept
/// separate so a future `podman` driver can reuse the probe.
pub async fn docker_cli_available() -> bool {
  run_standard_command("docker version --format {{.Server.Version}}", None)
    .await
    .success()
}
