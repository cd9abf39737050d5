//! The locked JSON document store described in spec §4.B / §5.
//!
//! All of cilo's mutable truth — hosts, environments, shared services,
//! the subnet counter — lives in one file. Every write goes through
//! [`StateStore::with_lock`], which takes an exclusive advisory lock,
//! reloads the file fresh (never trusts an in-memory copy across
//! calls), lets the caller mutate it, and commits the result with a
//! temp-file-then-rename so a crash mid-write can never leave a
//! half-written document behind.

use std::{
  fs::File,
  io::{Read as _, Write as _},
  path::{Path, PathBuf},
  time::Duration,
};

use cilo_client::entities::State;
use fs4::fs_std::FileExt;
use thiserror::Error;

/// How long `with_lock` waits for the advisory lock before giving up.
/// Matches spec §5's 30s ceiling.
const LOCK_TIMEOUT: Duration = Duration::from_secs(30);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum StateStoreError {
  #[error("lock-timeout: state file {0} still locked after 30s")]
  LockTimeout(PathBuf),
  #[error("corrupt-state: {0} failed to parse: {1}")]
  CorruptState(PathBuf, serde_json::Error),
  #[error(transparent)]
  Io(#[from] std::io::Error),
  #[error(transparent)]
  Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, StateStoreError>;

#[derive(Clone)]
pub struct StateStore {
  path: PathBuf,
}

impl StateStore {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }

  /// Read the current document without taking the lock. Used for
  /// read-only commands (`list`, `status`) that tolerate a result
  /// that's stale by the time it's printed.
  pub async fn load(&self) -> Result<State> {
    let path = self.path.clone();
    tokio::task::spawn_blocking(move || load_from_disk(&path))
      .await
      .map_err(|e| StateStoreError::Other(anyhow::anyhow!(e)))?
  }

  /// Take the exclusive lock, load the freshest document, run `f` over
  /// a mutable copy, and commit it atomically before releasing the
  /// lock. `f`'s return value is passed back to the caller unchanged.
  pub async fn with_lock<F, T>(&self, f: F) -> Result<T>
  where
    F: FnOnce(&mut State) -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
  {
    let path = self.path.clone();
    tokio::task::spawn_blocking(move || {
      let lock_path = path.with_extension("lock");
      let lock_file = File::options()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)?;

      let deadline = std::time::Instant::now() + LOCK_TIMEOUT;
      loop {
        match FileExt::try_lock_exclusive(&lock_file) {
          Ok(()) => break,
          Err(_) if std::time::Instant::now() < deadline => {
            std::thread::sleep(LOCK_POLL_INTERVAL);
          }
          Err(_) => {
            return Err(StateStoreError::LockTimeout(path.clone()));
          }
        }
      }

      let result = (|| -> Result<T> {
        let mut state = load_from_disk(&path)?;
        let value = f(&mut state).map_err(StateStoreError::Other)?;
        save_to_disk(&path, &state)?;
        Ok(value)
      })();

      let _ = FileExt::unlock(&lock_file);
      result
    })
    .await
    .map_err(|e| StateStoreError::Other(anyhow::anyhow!(e)))?
  }
}

fn load_from_disk(path: &Path) -> Result<State> {
  if !path.exists() {
    return Ok(State::default());
  }
  let mut contents = String::new();
  File::open(path)?.read_to_string(&mut contents)?;
  if contents.trim().is_empty() {
    return Ok(State::default());
  }
  serde_json::from_str(&contents)
    .map_err(|e| StateStoreError::CorruptState(path.to_path_buf(), e))
}

/// Write `state` to `path` via a sibling temp file plus `rename`, so
/// readers never observe a partially-written document. No automatic
/// repair is attempted on a corrupt file found by `load_from_disk` —
/// per spec §4.B that's an operator-visible failure, not something
/// cilo papers over.
fn save_to_disk(path: &Path, state: &State) -> Result<()> {
  let dir = path.parent().unwrap_or_else(|| Path::new("."));
  std::fs::create_dir_all(dir)?;
  let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
  let serialized = serde_json::to_vec_pretty(state)
    .map_err(|e| StateStoreError::Other(anyhow::anyhow!(e)))?;
  tmp.write_all(&serialized)?;
  tmp.flush()?;
  tmp.persist(path).map_err(|e| StateStoreError::Io(e.error))?;
  Ok(())
}

#[cfg(test)]
mod test {
  use cilo_client::entities::Host;

  use super::*;

  #[tokio::test]
  async fn load_of_missing_file_yields_default_state() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::new(dir.path().join("state.json"));
    let state = store.load().await.unwrap();
    assert_eq!(state.schema_version, 0);
    assert!(state.hosts.is_empty());
  }

  #[tokio::test]
  async fn with_lock_round_trips_mutations() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::new(dir.path().join("state.json"));

    store
      .with_lock(|state| {
        state.hosts.insert("local".into(), Host::local());
        Ok(())
      })
      .await
      .unwrap();

    let reloaded = store.load().await.unwrap();
    assert!(reloaded.hosts.contains_key("local"));
  }

  #[tokio::test]
  async fn corrupt_state_file_surfaces_as_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    std::fs::write(&path, b"{ not json").unwrap();
    let store = StateStore::new(path);
    let err = store.load().await.unwrap_err();
    assert!(matches!(err, StateStoreError::CorruptState(_, _)));
  }

  #[tokio::test]
  async fn saved_state_has_stable_key_ordering() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::new(dir.path().join("state.json"));

    store
      .with_lock(|state| {
        for host in ["zeta", "alpha", "mike"] {
          state.hosts.insert(host.into(), Host::local());
        }
        Ok(())
      })
      .await
      .unwrap();

    let bytes = std::fs::read(dir.path().join("state.json")).unwrap();
    let text = String::from_utf8(bytes).unwrap();
    let alpha = text.find("alpha").unwrap();
    let mike = text.find("mike").unwrap();
    let zeta = text.find("zeta").unwrap();
    assert!(alpha < mike && mike < zeta, "keys should serialize sorted");
  }

  #[tokio::test]
  async fn concurrent_with_lock_calls_serialize() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::new(dir.path().join("state.json"));

    let mut handles = Vec::new();
    for i in 0..8 {
      let store = store.clone();
      handles.push(tokio::spawn(async move {
        store
          .with_lock(move |state| {
            state.hosts.insert(format!("host-{i}"), Host::local());
            Ok(())
          })
          .await
          .unwrap();
      }));
    }
    for h in handles {
      h.await.unwrap();
    }

    let state = store.load().await.unwrap();
    assert_eq!(state.hosts.len(), 8);
  }
}
