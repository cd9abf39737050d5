//! `create`'s workspace staging step (spec §4.G: "copy the source
//! directory into a dedicated workspace under the per-user home"),
//! driven by the project's `env_render` section (`lib/config`).

use std::path::{Path, PathBuf};

use config::{CopyMode, ProjectConfig};

/// Copy `project_root` into `~/.cilo/workspaces/<project>/<env>`,
/// honoring `copy_dot_dirs`/`ignore_dot_dirs` and the `env_render`
/// copy mode, then apply every render rule's token expansion and
/// literal replacements. Returns the staged workspace path.
pub async fn stage(
  project_root: &Path,
  project: &str,
  env: &str,
  dns_suffix: &str,
  config: &ProjectConfig,
) -> anyhow::Result<PathBuf> {
  let dest = workspaces_root()?.join(project).join(env);
  if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
    tokio::fs::remove_dir_all(&dest).await?;
  }
  tokio::fs::create_dir_all(&dest).await?;

  if let Err(e) = copy_tree(project_root, &dest, config).await {
    tokio::fs::remove_dir_all(&dest).await.ok();
    anyhow::bail!("workspace-error: failed to stage workspace: {e:#}");
  }

  let tokens = TokenSet { project, env, dns_suffix };
  for rule in &config.env_render.rules {
    if let Err(e) = render_file(&dest.join(&rule.file), &rule.replacements, rule.expand_tokens, &tokens).await {
      tokio::fs::remove_dir_all(&dest).await.ok();
      anyhow::bail!("workspace-error: render rule for {} failed: {e:#}", rule.file.display());
    }
  }

  if let Some(hook) = &config.env_render.init_hook {
    let status = tokio::process::Command::new("sh")
      .arg("-c")
      .arg(hook)
      .current_dir(&dest)
      .status()
      .await;
    match status {
      Ok(status) if !status.success() => {
        tokio::fs::remove_dir_all(&dest).await.ok();
        anyhow::bail!("workspace-error: init hook exited with {status}");
      }
      Err(e) => {
        tokio::fs::remove_dir_all(&dest).await.ok();
        anyhow::bail!("workspace-error: failed to run init hook: {e}");
      }
      Ok(_) => {}
    }
  }

  Ok(dest)
}

fn workspaces_root() -> anyhow::Result<PathBuf> {
  let home = std::env::var_os("HOME")
    .map(PathBuf::from)
    .ok_or_else(|| anyhow::anyhow!("workspace-error: HOME is not set"))?;
  Ok(home.join(".cilo").join("workspaces"))
}

async fn copy_tree(src: &Path, dst: &Path, config: &ProjectConfig) -> anyhow::Result<()> {
  let mut entries = tokio::fs::read_dir(src).await?;
  while let Some(entry) = entries.next_entry().await? {
    let name = entry.file_name().to_string_lossy().to_string();
    let file_type = entry.file_type().await?;
    let is_dot = name.starts_with('.');

    if is_dot {
      if config.ignore_dot_dirs.iter().any(|d| d == &name) {
        continue;
      }
      if !config.copy_dot_dirs.iter().any(|d| d == &name) {
        continue;
      }
    } else if !should_copy(&name, config) {
      continue;
    }

    let src_path = entry.path();
    let dst_path = dst.join(&name);
    if file_type.is_dir() {
      tokio::fs::create_dir_all(&dst_path).await?;
      Box::pin(copy_tree(&src_path, &dst_path, config)).await?;
    } else if file_type.is_file() {
      tokio::fs::copy(&src_path, &dst_path).await?;
    }
  }
  Ok(())
}

fn should_copy(name: &str, config: &ProjectConfig) -> bool {
  match config.env_render.copy_mode {
    CopyMode::All => true,
    CopyMode::None => false,
    CopyMode::Allowlist => {
      let allowed = config.env_render.copy_globs.iter().any(|g| glob_match(g, name));
      let ignored = config.env_render.ignore_globs.iter().any(|g| glob_match(g, name));
      allowed && !ignored
    }
  }
}

/// `*` matches any run of characters; every other byte is literal.
/// Enough for the `copy_globs`/`ignore_globs` shape (filename patterns,
/// not full path globbing).
fn glob_match(pattern: &str, name: &str) -> bool {
  fn recurse(pattern: &[u8], name: &[u8]) -> bool {
    match pattern.first() {
      None => name.is_empty(),
      Some(b'*') => {
        (0..=name.len()).any(|i| recurse(&pattern[1..], &name[i..]))
      }
      Some(&c) => name.first() == Some(&c) && recurse(&pattern[1..], &name[1..]),
    }
  }
  recurse(pattern.as_bytes(), name.as_bytes())
}

struct TokenSet<'a> {
  project: &'a str,
  env: &'a str,
  dns_suffix: &'a str,
}

impl TokenSet<'_> {
  fn expand(&self, text: &str) -> String {
    let base_url = format!("http://{}.{}{}", self.project, self.env, self.dns_suffix);
    text
      .replace("${CILO_PROJECT}", self.project)
      .replace("${CILO_ENV}", self.env)
      .replace("${CILO_DNS_SUFFIX}", self.dns_suffix)
      .replace("${CILO_BASE_URL}", &base_url)
  }
}

async fn render_file(
  path: &Path,
  replacements: &[config::Replacement],
  expand_tokens: bool,
  tokens: &TokenSet<'_>,
) -> anyhow::Result<()> {
  let mut contents = tokio::fs::read_to_string(path).await?;
  if expand_tokens {
    contents = tokens.expand(&contents);
  }
  for replacement in replacements {
    contents = contents.replace(&replacement.from, &replacement.to);
  }
  tokio::fs::write(path, contents).await?;
  Ok(())
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn glob_matches_star_patterns() {
    assert!(glob_match("*.env", ".env"));
    assert!(glob_match("*.env", "production.env"));
    assert!(!glob_match("*.env", "production.yml"));
    assert!(glob_match("docker-compose*.yml", "docker-compose.override.yml"));
  }

  #[test]
  fn expands_declared_tokens() {
    let tokens = TokenSet { project: "storefront", env: "dev", dns_suffix: ".cilo.local" };
    let expanded = tokens.expand("${CILO_BASE_URL} for ${CILO_PROJECT}/${CILO_ENV}");
    assert_eq!(expanded, "http://storefront.dev.cilo.local for storefront/dev");
  }

  #[tokio::test]
  async fn stages_allowlisted_files_and_skips_undeclared_dot_dirs() {
    let src = tempfile::tempdir().unwrap();
    tokio::fs::write(src.path().join("docker-compose.yml"), "web:").await.unwrap();
    tokio::fs::write(src.path().join("README.md"), "ignored").await.unwrap();
    tokio::fs::create_dir(src.path().join(".git")).await.unwrap();

    let mut config = ProjectConfig::default();
    config.env_render.copy_mode = CopyMode::Allowlist;
    config.env_render.copy_globs = vec!["*.yml".to_string()];

    unsafe { std::env::set_var("HOME", src.path()) };
    let dest = stage(src.path(), "storefront", "dev", ".cilo.local", &config).await.unwrap();

    assert!(tokio::fs::try_exists(dest.join("docker-compose.yml")).await.unwrap());
    assert!(!tokio::fs::try_exists(dest.join("README.md")).await.unwrap());
    assert!(!tokio::fs::try_exists(dest.join(".git")).await.unwrap());
  }
}
