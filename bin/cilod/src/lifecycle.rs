//! Environment lifecycle engine, per spec §4.G: `create`/`up`/`down`/
//! `destroy`, each a single state-lock-guarded transition plus the
//! runtime/compose/dns side effects the transition implies.

use std::{collections::HashSet, path::PathBuf, time::Duration};

use anyhow::Context as _;
use chrono::Utc;
use cilo_client::entities::{
  Environment, EnvironmentStatus, Host, LOCAL_HOST_ID, environment_key,
};
use compose::OverrideInput;
use runtime::{ComposeContext, NetworkSpec};

use crate::state::AppState;

/// Read a project's declared compose files, in order, and return both
/// their absolute paths (for `ComposeContext`) and their parsed
/// contents (for `compose::merge_documents`).
async fn load_compose_files(
  workspace: &std::path::Path,
) -> anyhow::Result<(Vec<PathBuf>, Vec<serde_yaml_ng::Value>)> {
  let project_config = project_config::ProjectConfig::load(workspace)
    .context("compose-parse-error: loading project config")?;
  let mut paths = Vec::new();
  let mut documents = Vec::new();
  for relative in &project_config.compose_files {
    let path = workspace.join(relative);
    let text = tokio::fs::read_to_string(&path).await.with_context(|| {
      format!("compose-parse-error: reading {}", path.display())
    })?;
    let document = serde_yaml_ng::from_str(&text).with_context(|| {
      format!("compose-parse-error: parsing {}", path.display())
    })?;
    paths.push(path);
    documents.push(document);
  }
  Ok((paths, documents))
}

pub struct CreateOptions {
  pub project: String,
  pub name: String,
  pub workspace_path: PathBuf,
  pub dns_suffix: Option<String>,
}

/// Copy the workspace (left to the caller, via `lib/config`'s render
/// rules, before this is invoked) and record a brand-new environment
/// with a freshly allocated subnet.
pub async fn create(
  app: &AppState,
  options: CreateOptions,
) -> anyhow::Result<Environment> {
  validations::validate_environment_name(&options.name)?;
  if !tokio::fs::try_exists(&options.workspace_path).await.unwrap_or(false) {
    anyhow::bail!("workspace-error: {} does not exist", options.workspace_path.display());
  }

  let base_subnet = app.config.base_subnet.clone();
  let workspace_path = options.workspace_path.to_string_lossy().to_string();
  let dns_suffix = options
    .dns_suffix
    .unwrap_or_else(cilo_client::entities::default_dns_suffix);

  let runtime = app.runtime.clone();
  let project = options.project.clone();
  let name = options.name.clone();

  let env = app
    .store
    .with_lock(move |doc| {
      let key = environment_key(&project, &name);
      let host = doc
        .hosts
        .entry(LOCAL_HOST_ID.to_string())
        .or_insert_with(Host::local);
      if host.environments.contains_key(&key) {
        anyhow::bail!("name-invalid: environment {key} already exists");
      }

      let base: ipnetwork::Ipv4Network =
        format!("{base_subnet}0.0/16").parse()?;
      let mut counter = doc.subnet_counter as u8;

      // `list_networks` is a network call; we're inside a blocking
      // closure under `with_lock`, so block on it rather than taking
      // an `async fn` here — this is the one place the subnet
      // allocator's collision probe and the state commit must be
      // under the same lock, per spec §4.C.
      let subnet = tokio::runtime::Handle::current().block_on(
        subnet::allocate(runtime.as_ref(), base, &mut counter),
      )?;
      doc.subnet_counter = counter as u32;

      let env = Environment {
        name: name.clone(),
        project: project.clone(),
        created_at: Utc::now(),
        subnet,
        dns_suffix,
        status: EnvironmentStatus::Created,
        workspace_path,
        services: Default::default(),
        shared_services: Vec::new(),
        error: None,
      };
      host.environments.insert(key, env.clone());
      Ok(env)
    })
    .await?;

  Ok(env)
}

#[cfg(test)]
mod create_test {
  use std::sync::Arc;

  use runtime::mock::MockDriver;

  use super::*;
  use crate::config::CilodConfig;

  fn app_with(dir: &tempfile::TempDir) -> AppState {
    let config = CilodConfig { data_dir: dir.path().to_path_buf(), ..Default::default() };
    AppState::new(config, Arc::new(MockDriver::new()))
  }

  #[tokio::test]
  async fn rejects_invalid_environment_names() {
    let dir = tempfile::tempdir().unwrap();
    let app = app_with(&dir);
    let workspace = tempfile::tempdir().unwrap();
    let err = create(
      &app,
      CreateOptions {
        project: "storefront".into(),
        name: "-bad".into(),
        workspace_path: workspace.path().to_path_buf(),
        dns_suffix: None,
      },
    )
    .await
    .unwrap_err();
    assert!(err.to_string().to_lowercase().contains("invalid environment name"));
  }

  #[tokio::test]
  async fn rejects_a_missing_workspace() {
    let dir = tempfile::tempdir().unwrap();
    let app = app_with(&dir);
    let err = create(
      &app,
      CreateOptions {
        project: "storefront".into(),
        name: "dev".into(),
        workspace_path: dir.path().join("nonexistent"),
        dns_suffix: None,
      },
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("workspace-error"));
  }

  #[tokio::test]
  async fn refuses_to_recreate_an_existing_environment() {
    let dir = tempfile::tempdir().unwrap();
    let app = app_with(&dir);
    let workspace = tempfile::tempdir().unwrap();
    let options = || CreateOptions {
      project: "storefront".into(),
      name: "dev".into(),
      workspace_path: workspace.path().to_path_buf(),
      dns_suffix: None,
    };
    create(&app, options()).await.unwrap();
    let err = create(&app, options()).await.unwrap_err();
    assert!(err.to_string().contains("already exists"));
  }
}

pub struct UpOptions {
  pub project: String,
  pub name: String,
  /// Services to force into the shared set beyond whatever the
  /// compose files already label `cilo.share`, per spec §9.
  pub share: HashSet<String>,
  /// Services to force out of the shared set even if labelled or
  /// passed in `share`.
  pub isolate: HashSet<String>,
  /// Poll bound for "all non-shared services report a state".
  pub ready_timeout: Duration,
}

/// Bring an environment's containers up: load and merge the project's
/// compose files, ensure the network and shared services exist, start
/// the project on the merged files plus the generated override, and
/// wait for service IPs to appear before committing `running`.
pub async fn up(
  app: &AppState,
  options: UpOptions,
) -> anyhow::Result<Environment> {
  let key = environment_key(&options.project, &options.name);
  let env = load_environment(app, &key).await?;
  let workspace = PathBuf::from(&env.workspace_path);

  let (compose_paths, compose_documents) =
    load_compose_files(&workspace).await?;
  let merged = compose::merge_documents(&compose_documents);

  let mut shared_services = compose::labelled_shared_services(&merged);
  shared_services.extend(options.share.iter().cloned());
  for isolated in &options.isolate {
    shared_services.remove(isolated);
  }

  let network_name = format!("cilo_{}_{}", options.project, options.name);

  if let Err(e) = app
    .runtime
    .create_network(&NetworkSpec {
      name: network_name.clone(),
      subnet: env.subnet,
      labels: Default::default(),
    })
    .await
  {
    mark_error(app, &key, &format!("{e:#}")).await?;
    return Err(e.context("runtime-unavailable: create environment network"));
  }

  for shared in &shared_services {
    let spec = match crate::shared_service::spec_from_compose(&merged, shared)
    {
      Ok(spec) => spec,
      Err(e) => {
        mark_error(app, &key, &format!("{e:#}")).await?;
        return Err(e);
      }
    };
    let record =
      match crate::shared_service::ensure(app, &options.project, shared, &spec)
        .await
      {
        Ok(record) => record,
        Err(e) => {
          mark_error(app, &key, &format!("{e:#}")).await?;
          return Err(e.context("runtime-unavailable: ensure shared service"));
        }
      };
    if let Err(e) = app
      .runtime
      .attach_network(&record.container_name, &network_name, Some(shared.as_str()))
      .await
    {
      mark_error(app, &key, &format!("{e:#}")).await?;
      return Err(e.context("runtime-unavailable: attach shared service network"));
    }
    if let Err(e) =
      crate::shared_service::attach(app, &options.project, shared, &key).await
    {
      tracing::warn!("failed to record shared service {shared} usage: {e:#}");
    }
  }

  let subnet_text = env.subnet.to_string();
  let override_input = OverrideInput {
    environment_name: &options.name,
    network_name: &network_name,
    subnet: &subnet_text,
    shared_services: &shared_services,
  };
  let override_doc = compose::build_override(&merged, &override_input);

  let override_path = workspace.join(".cilo").join("override.yml");
  tokio::fs::create_dir_all(override_path.parent().unwrap()).await?;
  tokio::fs::write(
    &override_path,
    serde_yaml_ng::to_string(&override_doc)?,
  )
  .await?;

  let mut compose_files = compose_paths;
  compose_files.push(override_path);

  let ctx = ComposeContext {
    project_name: format!("{}_{}", options.project, options.name),
    working_dir: workspace,
    compose_files,
  };

  if let Err(e) = app.runtime.compose_up(&ctx).await {
    mark_error(app, &key, &format!("{e:#}")).await?;
    return Err(e.context("runtime-unavailable: compose up"));
  }

  let services = poll_until_ready(
    app,
    &ctx.project_name,
    options.ready_timeout,
  )
  .await?;

  let mut shared_list: Vec<String> = shared_services.into_iter().collect();
  shared_list.sort();

  let key2 = key.clone();
  let env = app
    .store
    .with_lock(move |doc| {
      let host = doc
        .hosts
        .get_mut(LOCAL_HOST_ID)
        .ok_or_else(|| anyhow::anyhow!("not-found: host"))?;
      let env = host
        .environments
        .get_mut(&key2)
        .ok_or_else(|| anyhow::anyhow!("not-found: environment {key2}"))?;
      for (name, inspect) in services {
        let entry = env.services.entry(name.clone()).or_default();
        entry.name = name;
        entry.ip = inspect.ip;
        entry.container_id = Some(inspect.container_id);
      }
      env.status = EnvironmentStatus::Running;
      env.error = None;
      env.shared_services = shared_list;
      Ok(env.clone())
    })
    .await?;

  regenerate_dns(app).await;

  Ok(env)
}

#[cfg(test)]
mod up_test {
  use std::sync::Arc;

  use runtime::mock::MockDriver;

  use super::*;
  use crate::config::CilodConfig;

  fn app_with(dir: &tempfile::TempDir, runtime: MockDriver) -> AppState {
    let config = CilodConfig { data_dir: dir.path().to_path_buf(), ..Default::default() };
    AppState::new(config, Arc::new(runtime))
  }

  async fn created_environment(
    app: &AppState,
    workspace: &std::path::Path,
    compose: &str,
  ) -> Environment {
    tokio::fs::write(workspace.join("docker-compose.yml"), compose)
      .await
      .unwrap();
    create(
      app,
      CreateOptions {
        project: "storefront".into(),
        name: "dev".into(),
        workspace_path: workspace.to_path_buf(),
        dns_suffix: None,
      },
    )
    .await
    .unwrap()
  }

  #[tokio::test]
  async fn up_starts_the_projects_declared_compose_files() {
    let dir = tempfile::tempdir().unwrap();
    let workspace = tempfile::tempdir().unwrap();
    let runtime = MockDriver::new();
    let app = app_with(&dir, runtime.clone());
    created_environment(&app, workspace.path(), "services:\n  web:\n    image: app\n").await;

    runtime.seed_running("storefront_dev", &["web"]);

    let env = up(
      &app,
      UpOptions {
        project: "storefront".into(),
        name: "dev".into(),
        share: HashSet::new(),
        isolate: HashSet::new(),
        ready_timeout: Duration::from_millis(50),
      },
    )
    .await
    .unwrap();

    assert_eq!(env.status, EnvironmentStatus::Running);
    assert!(env.services["web"].ip.is_some());
  }

  #[tokio::test]
  async fn up_ensures_and_attaches_a_labelled_shared_service() {
    let dir = tempfile::tempdir().unwrap();
    let workspace = tempfile::tempdir().unwrap();
    let runtime = MockDriver::new();
    let app = app_with(&dir, runtime.clone());
    created_environment(
      &app,
      workspace.path(),
      "services:\n  web:\n    image: app\n  redis:\n    image: redis:7\n    labels:\n      - cilo.share\n",
    )
    .await;

    runtime.seed_running("storefront_dev", &["web"]);

    let env = up(
      &app,
      UpOptions {
        project: "storefront".into(),
        name: "dev".into(),
        share: HashSet::new(),
        isolate: HashSet::new(),
        ready_timeout: Duration::from_millis(50),
      },
    )
    .await
    .unwrap();

    assert_eq!(env.shared_services, vec!["redis".to_string()]);

    let state = app.store.load().await.unwrap();
    let shared = state.shared_services.get("storefront/redis").unwrap();
    assert!(shared.used_by.contains(&"storefront/dev".to_string()));
  }

  #[tokio::test]
  async fn isolate_overrides_a_cilo_share_label() {
    let dir = tempfile::tempdir().unwrap();
    let workspace = tempfile::tempdir().unwrap();
    let runtime = MockDriver::new();
    let app = app_with(&dir, runtime.clone());
    created_environment(
      &app,
      workspace.path(),
      "services:\n  web:\n    image: app\n  redis:\n    image: redis:7\n    labels:\n      - cilo.share\n",
    )
    .await;

    runtime.seed_running("storefront_dev", &["web", "redis"]);

    let env = up(
      &app,
      UpOptions {
        project: "storefront".into(),
        name: "dev".into(),
        share: HashSet::new(),
        isolate: ["redis".to_string()].into_iter().collect(),
        ready_timeout: Duration::from_millis(50),
      },
    )
    .await
    .unwrap();

    assert!(env.shared_services.is_empty());
    let state = app.store.load().await.unwrap();
    assert!(!state.shared_services.contains_key("storefront/redis"));
  }
}

/// Stop an environment's containers without destroying its record.
pub async fn down(app: &AppState, project: &str, name: &str) -> anyhow::Result<Environment> {
  let key = environment_key(project, name);
  let env = load_environment(app, &key).await?;
  let workspace = PathBuf::from(&env.workspace_path);

  let (mut compose_files, _) = load_compose_files(&workspace).await?;
  compose_files.push(workspace.join(".cilo").join("override.yml"));
  let ctx = ComposeContext {
    project_name: format!("{project}_{name}"),
    working_dir: workspace,
    compose_files,
  };
  app.runtime.compose_down(&ctx).await?;

  for shared in &env.shared_services {
    if let Err(e) =
      crate::shared_service::detach(app, project, shared, &key).await
    {
      tracing::warn!("failed to detach shared service {shared}: {e:#}");
    }
  }

  let key2 = key.clone();
  let env = app
    .store
    .with_lock(move |doc| {
      let env = doc
        .hosts
        .get_mut(LOCAL_HOST_ID)
        .and_then(|h| h.environments.get_mut(&key2))
        .ok_or_else(|| anyhow::anyhow!("not-found: environment {key2}"))?;
      env.status = EnvironmentStatus::Stopped;
      Ok(env.clone())
    })
    .await?;

  regenerate_dns(app).await;
  Ok(env)
}

pub struct DestroyOptions {
  pub keep_workspace: bool,
}

/// Best-effort teardown: stop containers, remove the network, drop
/// the workspace (unless asked not to), delete the record. The
/// subnet is never returned to the allocator, per spec §4.C/§4.G.
pub async fn destroy(
  app: &AppState,
  project: &str,
  name: &str,
  options: DestroyOptions,
) -> anyhow::Result<()> {
  let key = environment_key(project, name);
  let env = load_environment(app, &key).await?;
  let workspace = PathBuf::from(&env.workspace_path);

  let (mut compose_files, _) = load_compose_files(&workspace).await.unwrap_or_default();
  compose_files.push(workspace.join(".cilo").join("override.yml"));
  let ctx = ComposeContext {
    project_name: format!("{project}_{name}"),
    working_dir: workspace,
    compose_files,
  };
  if let Err(e) = app.runtime.compose_destroy(&ctx).await {
    tracing::warn!("compose destroy failed for {key}: {e:#}");
  }
  let network_name = format!("cilo_{project}_{name}");
  if let Err(e) = app.runtime.remove_network(&network_name).await {
    tracing::warn!("remove network failed for {network_name}: {e:#}");
  }

  if !options.keep_workspace
    && let Err(e) = tokio::fs::remove_dir_all(&env.workspace_path).await
  {
    tracing::warn!("failed to remove workspace {}: {e:#}", env.workspace_path);
  }

  for shared in &env.shared_services {
    if let Err(e) =
      crate::shared_service::detach(app, project, shared, &key).await
    {
      tracing::warn!("failed to detach shared service {shared}: {e:#}");
    }
  }

  app
    .store
    .with_lock(move |doc| {
      if let Some(host) = doc.hosts.get_mut(LOCAL_HOST_ID) {
        host.environments.remove(&key);
      }
      Ok(())
    })
    .await?;

  regenerate_dns(app).await;
  Ok(())
}

async fn load_environment(
  app: &AppState,
  key: &str,
) -> anyhow::Result<Environment> {
  let state = app.store.load().await?;
  state
    .hosts
    .get(LOCAL_HOST_ID)
    .and_then(|h| h.environments.get(key))
    .cloned()
    .ok_or_else(|| anyhow::anyhow!("not-found: environment {key}"))
}

async fn mark_error(
  app: &AppState,
  key: &str,
  message: &str,
) -> anyhow::Result<()> {
  let key = key.to_string();
  let message = message.to_string();
  app
    .store
    .with_lock(move |doc| {
      if let Some(env) = doc
        .hosts
        .get_mut(LOCAL_HOST_ID)
        .and_then(|h| h.environments.get_mut(&key))
      {
        env.status = EnvironmentStatus::Error;
        env.error = Some(message);
      }
      Ok(())
    })
    .await?;
  Ok(())
}

/// Poll `inspect_services` until every reported service has settled
/// into a terminal state or `timeout` elapses — whichever is first.
/// Spec §4.G only requires a bounded wait, not that every service
/// actually reach `running`; that distinction is the reconciler's job.
async fn poll_until_ready(
  app: &AppState,
  project_name: &str,
  timeout: Duration,
) -> anyhow::Result<std::collections::HashMap<String, runtime::ServiceInspect>> {
  let deadline = tokio::time::Instant::now() + timeout;
  loop {
    let services = app.runtime.inspect_services(project_name).await?;
    let all_settled = !services.is_empty()
      && services.values().all(|s| {
        !matches!(s.state, runtime::ContainerState::Created)
      });
    if all_settled || tokio::time::Instant::now() >= deadline {
      return Ok(services);
    }
    tokio::time::sleep(Duration::from_millis(250)).await;
  }
}

async fn regenerate_dns(app: &AppState) {
  let state = match app.store.load().await {
    Ok(state) => state,
    Err(e) => {
      tracing::warn!("dns-reload-failed: could not reload state: {e:#}");
      return;
    }
  };
  let machines =
    crate::state::load_machines(&app.config).await.unwrap_or_default();
  let text = dns::render(&state, &machines.into_values().collect::<Vec<_>>());
  if let Err(e) = dns::apply(
    &app.config.dns_config_path(),
    &app.config.dns_pid_path(),
    &text,
    "dnsmasq --conf-file={} --pid-file={}",
  )
  .await
  {
    tracing::warn!("dns-reload-failed: {e:#}");
  }
}
