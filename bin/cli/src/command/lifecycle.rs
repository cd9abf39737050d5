//! `create`/`up`/`down`/`destroy`/`list`/`status`: thin wrappers over
//! `cilo_client`'s environment endpoints plus the table rendering
//! `km`'s CLI uses `comfy-table` for.

use colored::Colorize;
use comfy_table::Table;

use crate::{client, settings::ProjectConfig, workspace};

async fn project_name() -> anyhow::Result<String> {
  let root = crate::settings::workspace_root()?;
  ProjectConfig::load(&root)?.project_name(&root)
}

pub async fn create(on: Option<&str>, env: &str) -> anyhow::Result<()> {
  validations::validate_environment_name(env)?;
  let root = crate::settings::workspace_root()?;
  let config = ProjectConfig::load(&root)?;
  let project = config.project_name(&root)?;
  let dns_suffix = config.dns_suffix.clone().unwrap_or_default();

  let staged = workspace::stage(&root, &project, env, &dns_suffix, &config).await?;
  let workspace_path = staged.to_string_lossy().to_string();

  let client = client::resolve(on).await?;
  let result = client
    .environment_create(&project, env, &workspace_path, config.dns_suffix.as_deref())
    .await?;
  println!("{} {}/{} ({})", "created".green().bold(), result.project, result.name, result.subnet);
  Ok(())
}

pub async fn up(
  on: Option<&str>,
  env: &str,
  share: Vec<String>,
  isolate: Vec<String>,
) -> anyhow::Result<()> {
  let project = project_name().await?;
  let client = client::resolve(on).await?;
  let result = client
    .environment_up(&project, env, cilo_client::api::UpRequest { share, isolate })
    .await?;
  println!("{} {}/{} is {:?}", "up".green().bold(), result.project, result.name, result.status);
  Ok(())
}

pub async fn down(on: Option<&str>, env: &str) -> anyhow::Result<()> {
  let project = project_name().await?;
  let client = client::resolve(on).await?;
  let result = client.environment_down(&project, env).await?;
  println!("{} {}/{} is {:?}", "down".yellow().bold(), result.project, result.name, result.status);
  Ok(())
}

pub async fn destroy(on: Option<&str>, env: &str) -> anyhow::Result<()> {
  let project = project_name().await?;
  let client = client::resolve(on).await?;
  client.environment_destroy(&project, env).await?;
  println!("{} {}/{}", "destroyed".red().bold(), project, env);
  Ok(())
}

pub async fn list(on: Option<&str>) -> anyhow::Result<()> {
  let client = client::resolve(on).await?;
  let summaries = client.list_environments().await?;

  let mut table = Table::new();
  table.set_header(vec!["PROJECT", "NAME", "STATUS", "SUBNET", "SERVICES"]);
  for env in &summaries {
    table.add_row(vec![
      env.project.clone(),
      env.name.clone(),
      env.status.clone(),
      env.subnet.clone(),
      env.service_count.to_string(),
    ]);
  }
  println!("{table}");
  Ok(())
}

pub async fn status(on: Option<&str>, env: &str) -> anyhow::Result<()> {
  let project = project_name().await?;
  let client = client::resolve(on).await?;
  let environment = client.environment_status(&project, env).await?;

  println!("{} {}/{}", "environment".bold(), environment.project, environment.name);
  println!("  status:     {:?}", environment.status);
  println!("  subnet:     {}", environment.subnet);
  println!("  dns suffix: {}", environment.dns_suffix);
  println!("  workspace:  {}", environment.workspace_path);
  if let Some(error) = &environment.error {
    println!("  {} {error}", "error:".red().bold());
  }

  let mut table = Table::new();
  table.set_header(vec!["SERVICE", "IP", "INGRESS", "HOSTNAMES", "URL"]);
  for service in environment.services.values() {
    table.add_row(vec![
      service.name.clone(),
      service.ip.map(|ip| ip.to_string()).unwrap_or_default(),
      service.ingress.to_string(),
      service.hostnames.join(", "),
      service.url.clone().unwrap_or_default(),
    ]);
  }
  println!("{table}");
  Ok(())
}
