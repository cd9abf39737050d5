//! Doctor / reconciler, per spec §4.I: compares persisted `State`
//! against what the runtime driver actually reports and, in `fix`
//! mode, repairs the four drift categories under the state lock.
//! Safe to call on a timer or on demand — every fix is idempotent, so
//! calling `reconcile` twice in a row with no intervening change is a
//! no-op the second time.

use std::collections::{HashMap, HashSet};

use cilo_client::entities::{EnvironmentStatus, LOCAL_HOST_ID};
use runtime::CILO_LABEL;

use crate::state::AppState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Drift {
  /// A Cilo-labelled container no environment record claims.
  Orphaned { container_name: String },
  /// An environment expects `service` running but no container was found.
  Missing { environment: String, service: String },
  /// A shared service is unreferenced and its grace period has elapsed.
  StaleGrace { key: String, container_name: String },
  /// A shared service has references but its container isn't running.
  Stopped { key: String, container_name: String },
}

#[derive(Debug, Default)]
pub struct Report {
  pub drift: Vec<Drift>,
}

/// Read-only pass: enumerate every drift category without touching
/// anything. Callers that only want to report status (`cilo doctor`
/// without `--fix`) stop here.
pub async fn inspect(app: &AppState) -> anyhow::Result<Report> {
  let state = app.store.load().await?;
  let mut report = Report::default();

  let labelled = app
    .runtime
    .list_containers_with_label(CILO_LABEL)
    .await
    .unwrap_or_default();
  let labelled: HashSet<String> = labelled.into_iter().collect();

  let mut claimed: HashSet<String> = HashSet::new();
  let mut expected: HashMap<(String, String), bool> = HashMap::new();

  if let Some(host) = state.hosts.get(LOCAL_HOST_ID) {
    for (env_key, env) in &host.environments {
      if !matches!(env.status, EnvironmentStatus::Running) {
        continue;
      }
      for (service_name, service) in &env.services {
        if let Some(id) = &service.container_id {
          claimed.insert(id.clone());
        }
        expected.insert(
          (env_key.clone(), service_name.clone()),
          service.container_id.is_some(),
        );
      }
    }
  }

  for (key, shared) in &state.shared_services {
    claimed.insert(shared.container_name.clone());
    if shared.used_by.is_empty() {
      if shared
        .disconnect_timeout
        .is_some_and(|t| t <= chrono::Utc::now())
      {
        report.drift.push(Drift::StaleGrace {
          key: key.clone(),
          container_name: shared.container_name.clone(),
        });
      }
    } else if !labelled.contains(&shared.container_name) {
      report.drift.push(Drift::Stopped {
        key: key.clone(),
        container_name: shared.container_name.clone(),
      });
    }
  }

  for container in &labelled {
    if !claimed.contains(container) {
      report.drift.push(Drift::Orphaned { container_name: container.clone() });
    }
  }

  for ((env_key, service_name), has_container) in expected {
    if !has_container {
      report.drift.push(Drift::Missing {
        environment: env_key,
        service: service_name,
      });
    }
  }

  Ok(report)
}

/// Run `inspect`, then apply every fix the spec defines: remove
/// orphans, stop+delete stale-grace shared services, attempt to
/// restart stopped-shared containers, and drop `missing` entries from
/// state. Returns the drift that was found (and acted on).
pub async fn reconcile(app: &AppState) -> anyhow::Result<Report> {
  let report = inspect(app).await?;

  for item in &report.drift {
    match item {
      Drift::Orphaned { container_name } => {
        if let Err(e) = app.runtime.remove_container(container_name).await {
          tracing::warn!("failed to remove orphaned container {container_name}: {e:#}");
        }
      }
      Drift::StaleGrace { key, container_name } => {
        if let Err(e) = app.runtime.remove_container(container_name).await {
          tracing::warn!("failed to remove stale-grace container {container_name}: {e:#}");
        }
        let key = key.clone();
        app
          .store
          .with_lock(move |doc| {
            doc.shared_services.remove(&key);
            Ok(())
          })
          .await?;
      }
      Drift::Stopped { key, container_name } => {
        let Some(shared) = app.store.load().await?.shared_services.get(key).cloned() else {
          continue;
        };
        if let Err(e) = app
          .runtime
          .run_container(container_name, &shared.image, "bridge", HashMap::new())
          .await
        {
          tracing::warn!("failed to restart shared container {container_name}: {e:#}");
        }
      }
      Drift::Missing { environment, service } => {
        let env_key = environment.clone();
        let service = service.clone();
        app
          .store
          .with_lock(move |doc| {
            if let Some(env) = doc
              .hosts
              .get_mut(LOCAL_HOST_ID)
              .and_then(|h| h.environments.get_mut(&env_key))
            {
              env.services.remove(&service);
            }
            Ok(())
          })
          .await?;
      }
    }
  }

  Ok(report)
}

#[cfg(test)]
mod test {
  use std::sync::Arc;

  use runtime::mock::MockDriver;

  use super::*;
  use crate::config::CilodConfig;

  fn app_with(dir: &tempfile::TempDir, runtime: MockDriver) -> AppState {
    let config = CilodConfig { data_dir: dir.path().to_path_buf(), ..Default::default() };
    AppState::new(config, Arc::new(runtime))
  }

  #[tokio::test]
  async fn reconcile_is_idempotent_on_a_clean_state() {
    let dir = tempfile::tempdir().unwrap();
    let app = app_with(&dir, MockDriver::new());
    let first = reconcile(&app).await.unwrap();
    let second = reconcile(&app).await.unwrap();
    assert!(first.drift.is_empty());
    assert!(second.drift.is_empty());
  }

  #[tokio::test]
  async fn stale_grace_shared_service_is_removed() {
    let dir = tempfile::tempdir().unwrap();
    let app = app_with(&dir, MockDriver::new());
    app
      .store
      .with_lock(|doc| {
        doc.shared_services.insert(
          "p/redis".into(),
          cilo_client::entities::SharedService {
            service: "redis".into(),
            container_name: "cilo_shared_p_redis".into(),
            ip: None,
            project: "p".into(),
            image: "redis:7".into(),
            config_hash: "abc".into(),
            created_at: chrono::Utc::now(),
            used_by: Vec::new(),
            disconnect_timeout: Some(
              chrono::Utc::now() - chrono::Duration::seconds(1),
            ),
          },
        );
        Ok(())
      })
      .await
      .unwrap();

    let report = reconcile(&app).await.unwrap();
    assert!(matches!(report.drift[0], Drift::StaleGrace { .. }));

    let state = app.store.load().await.unwrap();
    assert!(!state.shared_services.contains_key("p/redis"));
  }
}
