use std::{collections::HashMap, sync::Arc};

use cache::CloneCache;
use rate_limit::RateLimiter;
use runtime::RuntimeDriver;
use state_store::StateStore;

use crate::config::CilodConfig;

/// In-memory, non-authoritative globals held alongside the on-disk
/// `State` document: auth challenges awaiting a response, issued
/// bearer tokens, and the failure-rate limiter guarding the auth
/// endpoints. None of this survives a restart, and none of it needs
/// to — a restarted `cilod` just asks connecting peers to
/// re-authenticate.
pub struct AppState {
  pub config: CilodConfig,
  pub store: StateStore,
  pub runtime: Arc<dyn RuntimeDriver>,
  pub pending_challenges: CloneCache<String, PendingChallenge>,
  pub tokens: CloneCache<String, IssuedToken>,
  pub auth_limiter: Arc<RateLimiter>,
}

#[derive(Clone)]
pub struct PendingChallenge {
  pub nonce: String,
  pub issued_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Clone)]
pub struct IssuedToken {
  pub public_key: String,
  pub issued_at: chrono::DateTime<chrono::Utc>,
  pub expires_at: chrono::DateTime<chrono::Utc>,
}

impl AppState {
  pub fn new(config: CilodConfig, runtime: Arc<dyn RuntimeDriver>) -> Self {
    let store = StateStore::new(config.state_path());
    Self {
      config,
      store,
      runtime,
      pending_challenges: CloneCache::default(),
      tokens: CloneCache::default(),
      auth_limiter: RateLimiter::new(false, 5, 60),
    }
  }
}

pub type SharedState = Arc<AppState>;

/// `machines.rs`'s view of the peer registry: one directory per host
/// under `<data_dir>/peers/<host>/`, each file `0600`. Loaded lazily
/// on every call rather than cached, because peer count is small and
/// correctness (always reading the freshest tunnel state) matters
/// more than avoiding a few directory reads.
pub fn peer_machine_path(
  config: &CilodConfig,
  host: &str,
) -> std::path::PathBuf {
  config.peers_dir().join(host).join("machine.json")
}

pub async fn load_machines(
  config: &CilodConfig,
) -> anyhow::Result<HashMap<String, cilo_client::entities::Machine>> {
  let mut machines = HashMap::new();
  let dir = config.peers_dir();
  let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
    return Ok(machines);
  };
  while let Some(entry) = entries.next_entry().await? {
    let host = entry.file_name().to_string_lossy().to_string();
    let path = entry.path().join("machine.json");
    let Ok(contents) = tokio::fs::read_to_string(&path).await else {
      continue;
    };
    match serde_json::from_str(&contents) {
      Ok(machine) => {
        machines.insert(host, machine);
      }
      Err(e) => {
        tracing::warn!("corrupt machine record for {host}: {e:#}");
      }
    }
  }
  Ok(machines)
}
