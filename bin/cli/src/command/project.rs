//! The administrative verbs: `init`, `setup`, `dns`, `network`,
//! `hostnames`, `clean-slate`, `uninstall`, `run`. Per the thin-CLI
//! scope, these are real but minimal — enough to exercise the
//! corresponding daemon/state behavior from a terminal, without a
//! dedicated daemon endpoint for every one of them.

use colored::Colorize;
use comfy_table::Table;

use crate::{client, settings, settings::ProjectConfig};

/// One-shot host bootstrap: confirm a local `cilod` is reachable and
/// this operator has an SSH identity it can authenticate with.
pub async fn init() -> anyhow::Result<()> {
  match client::local()?.doctor(false).await {
    Ok(_) => println!("{} cilod is reachable", "ok".green().bold()),
    Err(e) => {
      println!("{} cilod is not reachable: {e:#}", "warning:".yellow().bold());
      println!("  start it with `cilod` (see the installation docs) before running lifecycle commands");
    }
  }
  if crate::auth::load_local_signer_exists() {
    println!("{} found an SSH identity under ~/.ssh", "ok".green().bold());
  } else {
    println!("{} no SSH identity found under ~/.ssh; generate one before connecting to peers", "warning:".yellow().bold());
  }
  Ok(())
}

/// Per-project config: writes `.cilo/config.yml` in the current
/// directory if one doesn't already exist.
pub async fn setup() -> anyhow::Result<()> {
  let root = crate::settings::workspace_root()?;
  if settings::exists(&root).await {
    println!("{} {}/.cilo/config.yml already exists", "skipped:".yellow().bold(), root.display());
    return Ok(());
  }
  let mut project_config = ProjectConfig::load(&root)?;
  let name = project_config.project_name(&root)?;
  project_config.name = Some(name.clone());
  settings::save(&project_config, &root).await?;
  println!("{} {}/.cilo/config.yml (project: {name})", "wrote".green().bold(), root.display());
  Ok(())
}

pub async fn dns_status() -> anyhow::Result<()> {
  let client = client::resolve(None).await?;
  let summaries = client.list_environments().await?;
  let mut table = Table::new();
  table.set_header(vec!["PROJECT", "NAME", "STATUS"]);
  for env in &summaries {
    table.add_row(vec![env.project.clone(), env.name.clone(), env.status.clone()]);
  }
  println!("{table}");
  println!("\ndns records are regenerated automatically on every up/down transition");
  Ok(())
}

pub async fn dns_setup() -> anyhow::Result<()> {
  println!("cilod renders and reloads dnsmasq config on every environment transition; nothing to set up manually");
  Ok(())
}

pub async fn network_status() -> anyhow::Result<()> {
  let client = client::resolve(None).await?;
  let summaries = client.list_environments().await?;
  let mut table = Table::new();
  table.set_header(vec!["PROJECT", "NAME", "SUBNET"]);
  for env in &summaries {
    table.add_row(vec![env.project.clone(), env.name.clone(), env.subnet.clone()]);
  }
  println!("{table}");
  Ok(())
}

pub async fn network_migrate() -> anyhow::Result<()> {
  anyhow::bail!("not-supported: subnets are assigned once at `create` and never reassigned for the life of a state file")
}

pub async fn hostnames_list() -> anyhow::Result<()> {
  let project_config = ProjectConfig::load(&crate::settings::workspace_root()?)?;
  let mut table = Table::new();
  table.set_header(vec!["HOSTNAME"]);
  for hostname in &project_config.hostnames {
    table.add_row(vec![hostname.clone()]);
  }
  println!("{table}");
  Ok(())
}

pub async fn hostnames_add(hostname: &str) -> anyhow::Result<()> {
  let root = crate::settings::workspace_root()?;
  let mut project_config = ProjectConfig::load(&root)?;
  if !project_config.hostnames.iter().any(|h| h == hostname) {
    project_config.hostnames.push(hostname.to_string());
  }
  settings::save(&project_config, &root).await?;
  println!("{} {hostname} (takes effect next `up`)", "declared".green().bold());
  Ok(())
}

pub async fn hostnames_remove(hostname: &str) -> anyhow::Result<()> {
  let root = crate::settings::workspace_root()?;
  let mut project_config = ProjectConfig::load(&root)?;
  project_config.hostnames.retain(|h| h != hostname);
  settings::save(&project_config, &root).await?;
  println!("{} {hostname}", "removed".yellow().bold());
  Ok(())
}

pub async fn hostnames_set(hostnames: Vec<String>) -> anyhow::Result<()> {
  let root = crate::settings::workspace_root()?;
  let mut project_config = ProjectConfig::load(&root)?;
  project_config.hostnames = hostnames;
  settings::save(&project_config, &root).await?;
  println!("{} declared hostnames (takes effect next `up`)", "set".green().bold());
  Ok(())
}

/// Tear down every environment under the current project and drop all
/// tunnels — the closest real analogue to "blow everything away and
/// start over" without touching other projects' state.
pub async fn clean_slate() -> anyhow::Result<()> {
  let root = crate::settings::workspace_root()?;
  let project = ProjectConfig::load(&root)?.project_name(&root)?;
  let client = client::resolve(None).await?;
  let summaries = client.list_environments().await?;
  for env in summaries.iter().filter(|e| e.project == project) {
    client.environment_destroy(&env.project, &env.name).await?;
    println!("{} {}/{}", "destroyed".red().bold(), env.project, env.name);
  }

  let local = client::local()?;
  for machine in local.list_machines().await? {
    local.machines_disconnect(&machine.host).await?;
    println!("{} {}", "disconnected".yellow().bold(), machine.host);
  }
  Ok(())
}

/// Disconnects every tunnel and removes the current project's local
/// `.cilo` directory. Stopping and removing the `cilod` service itself
/// is left to the operator — this process has no privilege to do that.
pub async fn uninstall() -> anyhow::Result<()> {
  let local = client::local()?;
  for machine in local.list_machines().await.unwrap_or_default() {
    local.machines_disconnect(&machine.host).await.ok();
  }
  let root = crate::settings::workspace_root()?;
  let dir = root.join(settings::CONFIG_DIR);
  if tokio::fs::try_exists(&dir).await.unwrap_or(false) {
    tokio::fs::remove_dir_all(&dir).await?;
    println!("{} {}", "removed".yellow().bold(), dir.display());
  }
  println!("cilod itself is still installed; stop and remove its service manually");
  Ok(())
}

/// `run <cmd> <env>`: execs `cmd` against `env`'s ingress service.
pub async fn run(on: Option<&str>, env: &str, command: Vec<String>) -> anyhow::Result<()> {
  let root = crate::settings::workspace_root()?;
  let project = ProjectConfig::load(&root)?.project_name(&root)?;
  let status = client::resolve(on).await?.environment_status(&project, env).await?;
  let service = status
    .ingress_service()
    .ok_or_else(|| anyhow::anyhow!("run-error: {env} has no ingress service configured"))?
    .name
    .clone();
  super::exec::run(on, env, &service, command).await
}
