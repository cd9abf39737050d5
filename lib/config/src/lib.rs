//! Loader for the per-project configuration file at `.cilo/config.yml`.
//!
//! This is the single source of project-level settings: which compose
//! files make up the project, what the environment's DNS suffix and
//! default ingress look like, and how the workspace copy that cilo
//! stages for each environment should be rendered from the source
//! checkout.

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use validations::{StringValidator, StringValidatorMatches};

pub const CONFIG_DIR: &str = ".cilo";
pub const CONFIG_FILE: &str = "config.yml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProjectConfig {
  /// The project name. Defaults to the checkout directory name when
  /// unset in the file; callers that need that fallback should use
  /// [`ProjectConfig::project_name`].
  pub name: Option<String>,
  /// Identifier of the build tool cilo should defer to for image
  /// builds (eg `docker`, `nixpacks`). Opaque to cilo itself.
  pub build_tool: Option<String>,
  /// Compose files, relative to the project root, in merge order.
  pub compose_files: Vec<PathBuf>,
  /// `.env`-style files to load before rendering compose variables.
  pub env_files: Vec<PathBuf>,
  /// Overrides the daemon's configured DNS suffix for this project's
  /// environments, eg `.dev.local`.
  pub dns_suffix: Option<String>,
  /// Environment name used when the CLI is invoked without one.
  pub default_environment: Option<String>,
  /// Service that receives the environment's primary hostname.
  pub default_ingress_service: Option<String>,
  /// Additional hostnames to register against the ingress service.
  pub hostnames: Vec<String>,
  /// Dot-directories from the checkout to copy into the per-environment
  /// workspace (eg `.ssh`, `.aws`).
  pub copy_dot_dirs: Vec<String>,
  /// Dot-directories to leave out even if matched elsewhere.
  pub ignore_dot_dirs: Vec<String>,
  pub env_render: EnvRender,
}

impl Default for ProjectConfig {
  fn default() -> Self {
    Self {
      name: None,
      build_tool: None,
      compose_files: vec![PathBuf::from("docker-compose.yml")],
      env_files: Vec::new(),
      dns_suffix: None,
      default_environment: None,
      default_ingress_service: None,
      hostnames: Vec::new(),
      copy_dot_dirs: Vec::new(),
      ignore_dot_dirs: Vec::new(),
      env_render: EnvRender::default(),
    }
  }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnvRender {
  pub copy_mode: CopyMode,
  /// Glob patterns to copy when `copy_mode` is `allowlist`.
  pub copy_globs: Vec<String>,
  /// Glob patterns excluded regardless of `copy_mode`.
  pub ignore_globs: Vec<String>,
  /// Shell command run once after the workspace is staged.
  pub init_hook: Option<String>,
  pub rules: Vec<RenderRule>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CopyMode {
  All,
  None,
  #[default]
  Allowlist,
}

/// A single file-level render rule: expand `${TOKEN}` placeholders and
/// apply literal find/replace pairs, in that order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RenderRule {
  pub file: PathBuf,
  #[serde(default)]
  pub expand_tokens: bool,
  #[serde(default)]
  pub replacements: Vec<Replacement>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Replacement {
  pub from: String,
  pub to: String,
}

impl ProjectConfig {
  /// Read `<project_root>/.cilo/config.yml`. Missing file is not an
  /// error, it just yields [`ProjectConfig::default`].
  pub fn load(project_root: &Path) -> anyhow::Result<Self> {
    let path = project_root.join(CONFIG_DIR).join(CONFIG_FILE);
    let config = match std::fs::read_to_string(&path) {
      Ok(contents) => serde_yaml_ng::from_str::<ProjectConfig>(
        &contents,
      )
      .with_context(|| {
        format!("failed to parse {}", path.display())
      })?,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        ProjectConfig::default()
      }
      Err(e) => {
        return Err(e).with_context(|| {
          format!("failed to read {}", path.display())
        });
      }
    };
    config.validate()?;
    Ok(config)
  }

  /// Resolve the project name, falling back to the root directory's
  /// file name when the config does not set one explicitly.
  pub fn project_name(&self, project_root: &Path) -> anyhow::Result<String> {
    let name = match &self.name {
      Some(name) => name.clone(),
      None => project_root
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .context("project root has no usable directory name")?,
    };
    validations::validate_environment_name(&name)?;
    Ok(name)
  }

  fn validate(&self) -> anyhow::Result<()> {
    if self.compose_files.is_empty() {
      bail!("compose_files must list at least one compose file");
    }
    if let Some(suffix) = &self.dns_suffix {
      StringValidator::default()
        .matches(StringValidatorMatches::DnsSuffix)
        .validate(suffix)
        .with_context(|| {
          format!("invalid dns_suffix '{suffix}'")
        })?;
    }
    if let Some(env) = &self.default_environment {
      validations::validate_environment_name(env)?;
    }
    if self.env_render.copy_mode == CopyMode::Allowlist
      && self.env_render.copy_globs.is_empty()
    {
      bail!(
        "env_render.copy_mode is 'allowlist' but copy_globs is empty"
      );
    }
    Ok(())
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn missing_file_yields_default() {
    let dir = tempfile::tempdir().unwrap();
    let config = ProjectConfig::load(dir.path()).unwrap();
    assert_eq!(config.compose_files, vec![PathBuf::from("docker-compose.yml")]);
  }

  #[test]
  fn parses_full_config() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join(CONFIG_DIR)).unwrap();
    std::fs::write(
      dir.path().join(CONFIG_DIR).join(CONFIG_FILE),
      r#"
name: storefront
compose_files:
  - docker-compose.yml
  - docker-compose.override.yml
dns_suffix: .storefront.test
default_environment: dev
default_ingress_service: web
hostnames:
  - admin
env_render:
  copy_mode: allowlist
  copy_globs: ["*.env.example"]
  rules:
    - file: .env
      expand_tokens: true
      replacements:
        - from: "__HOST__"
          to: "web.storefront.test"
"#,
    )
    .unwrap();

    let config = ProjectConfig::load(dir.path()).unwrap();
    assert_eq!(config.name.as_deref(), Some("storefront"));
    assert_eq!(config.compose_files.len(), 2);
    assert_eq!(config.env_render.rules.len(), 1);
    assert!(config.env_render.rules[0].expand_tokens);
  }

  #[test]
  fn rejects_empty_allowlist_globs() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join(CONFIG_DIR)).unwrap();
    std::fs::write(
      dir.path().join(CONFIG_DIR).join(CONFIG_FILE),
      "env_render:\n  copy_mode: allowlist\n",
    )
    .unwrap();
    assert!(ProjectConfig::load(dir.path()).is_err());
  }

  #[test]
  fn rejects_invalid_dns_suffix() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join(CONFIG_DIR)).unwrap();
    std::fs::write(
      dir.path().join(CONFIG_DIR).join(CONFIG_FILE),
      "dns_suffix: nodot\n",
    )
    .unwrap();
    assert!(ProjectConfig::load(dir.path()).is_err());
  }
}
