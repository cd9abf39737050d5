//! Shared-service coordinator, per spec §4.H: singleton containers
//! keyed by `(project, service)`, reference-counted across
//! environments via `used_by`, torn down after a 60s grace period
//! once nothing references them.

use std::time::Duration;

use chrono::Utc;
use cilo_client::entities::SharedService;
use sha2::{Digest, Sha256};

use crate::state::AppState;

/// Window described in spec §4.H — not user-configurable.
pub const GRACE_PERIOD: Duration = Duration::from_secs(60);

/// What a caller asks the coordinator to ensure exists.
pub struct ServiceSpec {
  pub image: String,
  pub volumes: Vec<String>,
  pub ports: Vec<String>,
  pub command: Vec<String>,
}

/// Extract the image/volumes/ports/command `ensure` needs from the
/// named service in a merged compose document, per spec §4.H: "the
/// service's compose definition extracted from the user's files."
pub fn spec_from_compose(
  merged: &serde_yaml_ng::Value,
  name: &str,
) -> anyhow::Result<ServiceSpec> {
  let service = merged
    .get("services")
    .and_then(|services| services.get(name))
    .ok_or_else(|| {
      anyhow::anyhow!("compose-parse-error: shared service {name} has no compose definition")
    })?;
  let image = service
    .get("image")
    .and_then(|v| v.as_str())
    .ok_or_else(|| {
      anyhow::anyhow!("compose-parse-error: shared service {name} has no image")
    })?
    .to_string();
  Ok(ServiceSpec {
    image,
    volumes: string_list(service.get("volumes")),
    ports: string_list(service.get("ports")),
    command: string_list(service.get("command")),
  })
}

fn string_list(value: Option<&serde_yaml_ng::Value>) -> Vec<String> {
  use serde_yaml_ng::Value;
  match value {
    Some(Value::Sequence(seq)) => seq
      .iter()
      .filter_map(|v| match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
      })
      .collect(),
    Some(Value::String(s)) => vec![s.clone()],
    _ => Vec::new(),
  }
}

/// Digest over image/volumes/ports/command, deliberately excluding
/// environment variables (spec §4.H: a shared service runs under one
/// configuration regardless of which environment consumes it).
pub fn config_hash(spec: &ServiceSpec) -> String {
  let mut hasher = Sha256::new();
  hasher.update(spec.image.as_bytes());
  for v in &spec.volumes {
    hasher.update(b"\0vol:");
    hasher.update(v.as_bytes());
  }
  for p in &spec.ports {
    hasher.update(b"\0port:");
    hasher.update(p.as_bytes());
  }
  for c in &spec.command {
    hasher.update(b"\0cmd:");
    hasher.update(c.as_bytes());
  }
  hex::encode(hasher.finalize())
}

/// Ensure the `(project, service)` singleton exists, starting it if
/// necessary. A mismatched config hash never fails the call — it
/// surfaces as a warning for the reconciler to report, per spec
/// §4.H's "warn and use existing" policy.
pub async fn ensure(
  state: &AppState,
  project: &str,
  service: &str,
  spec: &ServiceSpec,
) -> anyhow::Result<SharedService> {
  let key = format!("{project}/{service}");
  let new_hash = config_hash(spec);
  let service = service.to_string();
  let project = project.to_string();
  let image = spec.image.clone();

  let (record, is_new) = state
    .store
    .with_lock(move |doc| {
      if let Some(existing) = doc.shared_services.get_mut(&key) {
        if existing.config_hash != new_hash {
          tracing::warn!(
            "shared-service-conflict: {key} is running with a \
             different configuration than requested; using the \
             existing container"
          );
        }
        existing.disconnect_timeout = None;
        return Ok((existing.clone(), false));
      }

      let record = SharedService {
        service: service.clone(),
        container_name: SharedService::container_name_for(
          &project, &service,
        ),
        ip: None,
        project: project.clone(),
        image,
        config_hash: new_hash,
        created_at: Utc::now(),
        used_by: Vec::new(),
        disconnect_timeout: None,
      };
      doc.shared_services.insert(key, record.clone());
      Ok((record, true))
    })
    .await?;

  if is_new {
    state
      .runtime
      .run_container(
        &record.container_name,
        &record.image,
        "bridge",
        std::collections::HashMap::new(),
      )
      .await?;
  }

  Ok(record)
}

/// Attach the shared container to `env_key`'s network, per spec
/// §4.H: appends `env_key` to `used_by` and clears any pending
/// disconnect timeout. The actual network attach (with `--alias
/// <service>`) is the caller's responsibility via `RuntimeDriver`,
/// since it needs the container id and network name this module
/// doesn't otherwise need to know.
pub async fn attach(
  state: &AppState,
  project: &str,
  service: &str,
  env_key: &str,
) -> anyhow::Result<()> {
  let key = format!("{project}/{service}");
  let env_key = env_key.to_string();
  state
    .store
    .with_lock(move |doc| {
      let Some(shared) = doc.shared_services.get_mut(&key) else {
        anyhow::bail!("shared-service-missing: {key}");
      };
      if !shared.used_by.contains(&env_key) {
        shared.used_by.push(env_key);
      }
      shared.disconnect_timeout = None;
      Ok(())
    })
    .await
    .map_err(Into::into)
}

/// Detach from `env_key`; if this was the last reference, start the
/// 60s grace period instead of tearing the container down inline.
pub async fn detach(
  state: &AppState,
  project: &str,
  service: &str,
  env_key: &str,
) -> anyhow::Result<()> {
  let key = format!("{project}/{service}");
  let env_key = env_key.to_string();
  state
    .store
    .with_lock(move |doc| {
      let Some(shared) = doc.shared_services.get_mut(&key) else {
        return Ok(());
      };
      shared.used_by.retain(|k| k != &env_key);
      if shared.used_by.is_empty() {
        shared.disconnect_timeout =
          Some(Utc::now() + chrono::Duration::seconds(GRACE_PERIOD.as_secs() as i64));
      }
      Ok(())
    })
    .await
    .map_err(Into::into)
}

/// Stop and remove every shared container whose grace period has
/// elapsed with no new reference. Safe to call on a timer or from the
/// reconciler's `fix` pass; idempotent either way.
pub async fn sweep(state: &AppState) -> anyhow::Result<Vec<String>> {
  let now = Utc::now();
  let expired: Vec<(String, String, String)> = state
    .store
    .load()
    .await?
    .shared_services
    .iter()
    .filter(|(_, s)| {
      s.used_by.is_empty()
        && s.disconnect_timeout.is_some_and(|t| t <= now)
    })
    .map(|(key, s)| (key.clone(), s.container_name.clone(), s.project.clone()))
    .collect();

  let mut removed = Vec::new();
  for (key, container_name, _project) in expired {
    if let Err(e) = state.runtime.remove_container(&container_name).await {
      tracing::warn!("failed to remove {container_name} during sweep: {e:#}");
    }
    state
      .store
      .with_lock({
        let key = key.clone();
        move |doc| {
          doc.shared_services.remove(&key);
          Ok(())
        }
      })
      .await?;
    removed.push(key);
  }
  Ok(removed)
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn config_hash_ignores_order_sensitive_fields_consistently() {
    let a = ServiceSpec {
      image: "redis:7".into(),
      volumes: vec!["redis-data:/data".into()],
      ports: vec!["6379".into()],
      command: vec![],
    };
    let b = ServiceSpec {
      image: "redis:7".into(),
      volumes: vec!["redis-data:/data".into()],
      ports: vec!["6379".into()],
      command: vec![],
    };
    assert_eq!(config_hash(&a), config_hash(&b));
  }

  #[test]
  fn config_hash_excludes_env_vars_by_construction() {
    // ServiceSpec has no env field at all - the type system enforces
    // the exclusion rather than a runtime check.
    let spec = ServiceSpec {
      image: "redis:7".into(),
      volumes: vec![],
      ports: vec![],
      command: vec![],
    };
    assert_eq!(config_hash(&spec).len(), 64);
  }

  #[test]
  fn spec_from_compose_reads_image_volumes_ports_command() {
    let merged: serde_yaml_ng::Value = serde_yaml_ng::from_str(
      "services:\n  redis:\n    image: redis:7\n    volumes:\n      - redis-data:/data\n    ports:\n      - '6379:6379'\n    command: [redis-server, --appendonly, 'yes']\n",
    )
    .unwrap();
    let spec = spec_from_compose(&merged, "redis").unwrap();
    assert_eq!(spec.image, "redis:7");
    assert_eq!(spec.volumes, vec!["redis-data:/data".to_string()]);
    assert_eq!(spec.ports, vec!["6379:6379".to_string()]);
    assert_eq!(spec.command, vec!["redis-server", "--appendonly", "yes"]);
  }

  #[test]
  fn spec_from_compose_rejects_an_undeclared_service() {
    let merged: serde_yaml_ng::Value =
      serde_yaml_ng::from_str("services:\n  web:\n    image: app\n").unwrap();
    assert!(spec_from_compose(&merged, "redis").is_err());
  }

  #[test]
  fn differing_images_produce_differing_hashes() {
    let a = ServiceSpec {
      image: "redis:7".into(),
      volumes: vec![],
      ports: vec![],
      command: vec![],
    };
    let b = ServiceSpec {
      image: "redis:6".into(),
      volumes: vec![],
      ports: vec![],
      command: vec![],
    };
    assert_ne!(config_hash(&a), config_hash(&b));
  }
}
