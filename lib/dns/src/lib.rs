//! Pure dnsmasq-config renderer plus the atomic-write/reload
//! machinery around it, per spec §4.E.
//!
//! `render` never touches the filesystem: the determinism requirement
//! ("identical state in, byte-identical text out") is easiest to keep
//! honest by making it a plain function and testing it directly.
//! `apply` is the effectful half — temp-write, rename, `SIGHUP` — and
//! follows the same write discipline as `bin/periphery/src/api/
//! compose.rs` (`secret_file::write_async` followed by the caller
//! reloading affected services).

use std::{
  collections::BTreeMap,
  fmt::Write as _,
  path::Path,
};

use cilo_client::entities::{Machine, State};

pub const DEFAULT_DNS_PORT: u16 = 5354;

/// Render the full dnsmasq configuration text for `state`. `State`'s
/// maps are `BTreeMap`s, so iteration is already key-sorted; bindings
/// are additionally collected into a `BTreeMap` before emission so the
/// hostname namespace itself (spanning environments, shared services,
/// and peers) comes out sorted too.
pub fn render(state: &State, machines: &[Machine]) -> String {
  let mut out = String::new();
  writeln!(out, "# generated by cilo, do not edit").unwrap();
  writeln!(out, "port={}", state.dns_port).unwrap();
  writeln!(out).unwrap();

  let mut bindings: BTreeMap<String, String> = BTreeMap::new();

  for host in state.hosts.values() {
    for env in host.environments.values() {
      if !matches!(
        env.status,
        cilo_client::entities::EnvironmentStatus::Created
          | cilo_client::entities::EnvironmentStatus::Running
      ) {
        continue;
      }
      emit_environment_bindings(env, &mut bindings);
    }
  }

  for shared in state.shared_services.values() {
    if shared.used_by.is_empty() {
      continue;
    }
    let Some(ip) = shared.ip else { continue };
    for env_key in &shared.used_by {
      let Some((_, env_name)) = env_key.split_once('/') else {
        continue;
      };
      // A shared service must be indistinguishable from an isolated
      // one, so it resolves under the using environment's own suffix
      // rather than a fixed one.
      let suffix = dns_suffix_for_environment(state, env_key);
      let fqdn = format!("{}.{env_name}{suffix}", shared.service);
      bindings.insert(fqdn, ip.to_string());
    }
  }

  for machine in machines {
    if machine.status != cilo_client::entities::MachineStatus::Connected {
      continue;
    }
    let tunnel_ip = machine.tunnel_ip.split('/').next().unwrap_or(&machine.tunnel_ip);
    bindings.insert(format!("{}.peer.test", machine.host), tunnel_ip.to_string());
  }

  for (name, ip) in &bindings {
    writeln!(out, "address=/{name}/{ip}").unwrap();
  }

  out
}

fn emit_environment_bindings(
  env: &cilo_client::entities::Environment,
  bindings: &mut BTreeMap<String, String>,
) {
  let suffix = &env.dns_suffix;
  for (service_name, service) in &env.services {
    let Some(ip) = service.ip else { continue };
    bindings
      .insert(format!("{service_name}.{}{suffix}", env.name), ip.to_string());
    for hostname in &service.hostnames {
      bindings.insert(hostname.clone(), ip.to_string());
    }
  }

  if !env.project.is_empty()
    && let Some(ingress) = env.ingress_service()
    && let Some(ip) = ingress.ip
  {
    bindings.insert(
      format!(".{}.{}{suffix}", env.project, env.name),
      ip.to_string(),
    );
    bindings.insert(
      format!("{}.{}{suffix}", env.project, env.name),
      ip.to_string(),
    );
  }
}

/// The DNS suffix of the environment keyed by `env_key` ("project/name"),
/// or the default suffix if no such environment is found.
fn dns_suffix_for_environment(state: &State, env_key: &str) -> String {
  state
    .hosts
    .values()
    .find_map(|host| host.environments.get(env_key))
    .map(|env| env.dns_suffix.clone())
    .unwrap_or_else(cilo_client::entities::default_dns_suffix)
}

/// Write `config_text` to `config_path` via temp-file-plus-rename,
/// then signal the daemon at `pid_path` with `SIGHUP`. If no PID file
/// exists, or the recorded process is gone, starts the daemon fresh
/// with `start_command` instead of signalling.
pub async fn apply(
  config_path: &Path,
  pid_path: &Path,
  config_text: &str,
  start_command: &str,
) -> anyhow::Result<()> {
  let dir = config_path.parent().unwrap_or_else(|| Path::new("."));
  tokio::fs::create_dir_all(dir).await?;
  let tmp = tempfile::NamedTempFile::new_in(dir)?;
  tokio::fs::write(tmp.path(), config_text).await?;
  tmp.persist(config_path)?;

  match running_pid(pid_path).await {
    Some(pid) => reload(pid).inspect_err(|e| {
      tracing::warn!("dns daemon reload failed, pid {pid}: {e:#}");
    }),
    None => {
      command::run_shell_command(start_command, None).await.success();
      Ok(())
    }
  }
}

#[cfg(unix)]
fn reload(pid: i32) -> anyhow::Result<()> {
  let result = unsafe { libc_kill(pid, SIGHUP) };
  if result != 0 {
    anyhow::bail!("failed to signal dnsmasq pid {pid} with SIGHUP");
  }
  Ok(())
}

#[cfg(not(unix))]
fn reload(_pid: i32) -> anyhow::Result<()> {
  anyhow::bail!("dns daemon reload is only supported on unix hosts")
}

#[cfg(unix)]
const SIGHUP: i32 = 1;

#[cfg(unix)]
unsafe extern "C" {
  #[link_name = "kill"]
  fn libc_kill(pid: i32, sig: i32) -> i32;
}

async fn running_pid(pid_path: &Path) -> Option<i32> {
  let contents = tokio::fs::read_to_string(pid_path).await.ok()?;
  let pid: i32 = contents.trim().parse().ok()?;
  process_is_alive(pid).then_some(pid)
}

#[cfg(unix)]
fn process_is_alive(pid: i32) -> bool {
  unsafe { libc_kill(pid, 0) == 0 }
}

#[cfg(not(unix))]
fn process_is_alive(_pid: i32) -> bool {
  false
}

#[cfg(test)]
mod test {
  use std::net::Ipv4Addr;

  use cilo_client::entities::{
    Environment, EnvironmentStatus, Host, Service, State,
  };

  use super::*;

  fn sample_state() -> State {
    let mut state = State::default();
    state.dns_port = DEFAULT_DNS_PORT;
    let mut host = Host::local();
    let mut env = Environment {
      name: "dev".into(),
      project: "storefront".into(),
      created_at: chrono::Utc::now(),
      subnet: "10.224.1.0/24".parse().unwrap(),
      dns_suffix: ".test".into(),
      status: EnvironmentStatus::Running,
      workspace_path: "/tmp/storefront-dev".into(),
      services: Default::default(),
      shared_services: Vec::new(),
      error: None,
    };
    env.services.insert(
      "web".into(),
      Service {
        name: "web".into(),
        ip: Some(Ipv4Addr::new(10, 224, 1, 2)),
        ingress: true,
        ..Default::default()
      },
    );
    env.services.insert(
      "db".into(),
      Service {
        name: "db".into(),
        ip: Some(Ipv4Addr::new(10, 224, 1, 3)),
        ..Default::default()
      },
    );
    host.environments.insert(env.key(), env);
    state.hosts.insert(host.id.clone(), host);
    state
  }

  #[test]
  fn renders_service_and_ingress_bindings() {
    let text = render(&sample_state(), &[]);
    assert!(text.contains("address=/web.dev.test/10.224.1.2"));
    assert!(text.contains("address=/db.dev.test/10.224.1.3"));
    assert!(text.contains("address=/.storefront.dev.test/10.224.1.2"));
    assert!(text.contains("address=/storefront.dev.test/10.224.1.2"));
  }

  #[test]
  fn output_is_deterministic_across_calls() {
    let state = sample_state();
    assert_eq!(render(&state, &[]), render(&state, &[]));
  }

  #[test]
  fn stopped_environment_is_skipped() {
    let mut state = sample_state();
    for host in state.hosts.values_mut() {
      for env in host.environments.values_mut() {
        env.status = EnvironmentStatus::Destroying;
      }
    }
    let text = render(&state, &[]);
    assert!(!text.contains("web.dev.test"));
  }

  #[test]
  fn shared_service_binding_uses_the_using_environments_suffix() {
    use cilo_client::entities::SharedService;

    let mut state = sample_state();
    for host in state.hosts.values_mut() {
      for env in host.environments.values_mut() {
        env.dns_suffix = ".storefront.internal".into();
      }
    }
    state.shared_services.insert(
      "storefront/redis".into(),
      SharedService {
        service: "redis".into(),
        container_name: "cilo_shared_storefront_redis".into(),
        ip: Some(Ipv4Addr::new(10, 224, 1, 9)),
        project: "storefront".into(),
        image: "redis:7".into(),
        config_hash: "abc".into(),
        created_at: chrono::Utc::now(),
        used_by: vec!["storefront/dev".into()],
        disconnect_timeout: None,
      },
    );

    let text = render(&state, &[]);
    assert!(text.contains("address=/redis.dev.storefront.internal/10.224.1.9"));
    assert!(!text.contains("redis.dev.test"));
  }
}
