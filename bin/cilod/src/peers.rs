//! Peer registry, per spec §4.J: one directory per connected peer,
//! keyed by a sanitized host string, holding a readable state record
//! and a `0600` key file. `list` tolerates corrupt entries by skipping
//! them rather than failing the whole walk — the same posture
//! `state.rs`'s `load_machines` already takes.

use std::path::{Path, PathBuf};

use cilo_client::entities::Machine;

use crate::config::CilodConfig;

/// Replace every character a filesystem might reject or mishandle
/// with `_`, matching spec §4.J's "non-filesystem characters" rule.
pub fn sanitize_host(host: &str) -> String {
  host
    .chars()
    .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
    .collect()
}

fn peer_dir(config: &CilodConfig, host: &str) -> PathBuf {
  config.peers_dir().join(sanitize_host(host))
}

fn machine_path(dir: &Path) -> PathBuf {
  dir.join("machine.json")
}

fn key_path(dir: &Path) -> PathBuf {
  dir.join("wg.key")
}

pub async fn exists(config: &CilodConfig, host: &str) -> bool {
  tokio::fs::try_exists(machine_path(&peer_dir(config, host)))
    .await
    .unwrap_or(false)
}

pub async fn load(config: &CilodConfig, host: &str) -> anyhow::Result<Machine> {
  let path = machine_path(&peer_dir(config, host));
  let contents = tokio::fs::read_to_string(&path).await?;
  Ok(serde_json::from_str(&contents)?)
}

/// Persist `machine`'s state record (world-readable is fine, it has
/// no secrets) and `private_key` as a separate `0600` file. Both
/// writes are best-effort-atomic via a sibling temp file, matching
/// `state_store`'s write discipline.
pub async fn save(
  config: &CilodConfig,
  machine: &Machine,
  private_key: &str,
) -> anyhow::Result<()> {
  let dir = peer_dir(config, &machine.host);
  tokio::fs::create_dir_all(&dir).await?;

  let record = serde_json::to_vec_pretty(machine)?;
  write_atomic(&machine_path(&dir), &record, 0o600).await?;
  write_atomic(&key_path(&dir), private_key.as_bytes(), 0o600).await?;
  Ok(())
}

pub async fn remove(config: &CilodConfig, host: &str) -> anyhow::Result<()> {
  let dir = peer_dir(config, host);
  match tokio::fs::remove_dir_all(&dir).await {
    Ok(()) => Ok(()),
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
    Err(e) => Err(e.into()),
  }
}

pub async fn list(config: &CilodConfig) -> Vec<Machine> {
  crate::state::load_machines(config).await.unwrap_or_default().into_values().collect()
}

#[cfg(unix)]
async fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> anyhow::Result<()> {
  use std::os::unix::fs::PermissionsExt;
  let dir = path.parent().unwrap_or_else(|| Path::new("."));
  let tmp = tempfile::NamedTempFile::new_in(dir)?;
  tokio::fs::write(tmp.path(), contents).await?;
  std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(mode))?;
  tmp.persist(path)?;
  Ok(())
}

#[cfg(not(unix))]
async fn write_atomic(path: &Path, contents: &[u8], _mode: u32) -> anyhow::Result<()> {
  let dir = path.parent().unwrap_or_else(|| Path::new("."));
  let tmp = tempfile::NamedTempFile::new_in(dir)?;
  tokio::fs::write(tmp.path(), contents).await?;
  tmp.persist(path)?;
  Ok(())
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn sanitize_replaces_non_filesystem_characters() {
    assert_eq!(sanitize_host("host/with:colons"), "host_with_colons");
    assert_eq!(sanitize_host("laptop-1.local"), "laptop-1.local");
  }

  #[tokio::test]
  async fn save_then_load_round_trips_and_restricts_key_permissions() {
    let dir = tempfile::tempdir().unwrap();
    let config = CilodConfig { data_dir: dir.path().to_path_buf(), ..Default::default() };

    let machine = Machine {
      host: "peer-1".into(),
      token: "tok".into(),
      local_private_key: "priv".into(),
      local_public_key: "pub".into(),
      peer_public_key: "peer-pub".into(),
      tunnel_ip: "10.225.0.2/32".into(),
      peer_endpoint: "1.2.3.4:8081".into(),
      allowed_ips: vec!["10.225.0.0/24".into()],
      local_interface: Some("cilo0".into()),
      peer_subnet: None,
      connected_at: chrono::Utc::now(),
      status: cilo_client::entities::MachineStatus::Connected,
      schema_version: cilo_client::entities::MACHINE_SCHEMA_VERSION,
    };

    save(&config, &machine, "super-secret-key").await.unwrap();
    let loaded = load(&config, "peer-1").await.unwrap();
    assert_eq!(loaded.host, "peer-1");

    #[cfg(unix)]
    {
      use std::os::unix::fs::PermissionsExt;
      let meta = std::fs::metadata(key_path(&peer_dir(&config, "peer-1"))).unwrap();
      assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    remove(&config, "peer-1").await.unwrap();
    assert!(!exists(&config, "peer-1").await);
  }
}
