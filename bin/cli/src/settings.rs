//! The handful of env vars that locate a `cilod` to talk to, plus a
//! thin save path for the real `config::ProjectConfig` (which loads
//! but doesn't persist itself — the CLI is the only writer).

use std::path::PathBuf;

pub use config::{CONFIG_DIR, CONFIG_FILE, ProjectConfig};

pub async fn exists(dir: &std::path::Path) -> bool {
  tokio::fs::try_exists(dir.join(CONFIG_DIR).join(CONFIG_FILE)).await.unwrap_or(false)
}

pub async fn save(config: &ProjectConfig, dir: &std::path::Path) -> anyhow::Result<()> {
  let path = dir.join(CONFIG_DIR).join(CONFIG_FILE);
  tokio::fs::create_dir_all(path.parent().unwrap()).await?;
  let contents = serde_yaml_ng::to_string(config)?;
  tokio::fs::write(&path, contents).await?;
  Ok(())
}

/// The local `cilod` this operator's machine runs, per `CILO_ADDRESS`
/// or the daemon's own default bind port.
pub fn local_cilod_address() -> String {
  std::env::var("CILO_ADDRESS")
    .unwrap_or_else(|_| "http://127.0.0.1:8081".to_string())
}

pub fn workspace_root() -> anyhow::Result<PathBuf> {
  std::env::current_dir().map_err(Into::into)
}

#[cfg(test)]
mod test {
  use super::*;

  #[tokio::test]
  async fn save_then_load_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = ProjectConfig::load(dir.path()).unwrap();
    cfg.name = Some("storefront".to_string());
    cfg.hostnames.push("app.test".to_string());
    save(&cfg, dir.path()).await.unwrap();

    assert!(exists(dir.path()).await);
    let reloaded = ProjectConfig::load(dir.path()).unwrap();
    assert_eq!(reloaded.name.as_deref(), Some("storefront"));
    assert_eq!(reloaded.hostnames, vec!["app.test".to_string()]);
  }
}
