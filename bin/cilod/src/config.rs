use std::{net::IpAddr, path::PathBuf, sync::OnceLock};

use clap::Parser;
use logger::{LogConfig, LogLevel};
use serde::Deserialize;

/// `cilod` runs once per host; its flags and environment variables
/// layer the way periphery's config does (CLI > env > default),
/// without the multi-file `ConfigLoader` periphery uses — cilod has
/// exactly one config surface, not a merge of `.toml`s.
#[derive(Parser, Debug, Default)]
#[command(name = "cilod", version)]
pub struct CliArgs {
  #[arg(long)]
  pub bind_ip: Option<IpAddr>,
  #[arg(long)]
  pub port: Option<u16>,
  #[arg(long)]
  pub data_dir: Option<PathBuf>,
  #[arg(long)]
  pub base_subnet: Option<String>,
  #[arg(long)]
  pub dns_port: Option<u16>,
  #[arg(long)]
  pub log_level: Option<tracing::Level>,
}

#[derive(Deserialize, Debug, Default)]
struct Env {
  cilod_bind_ip: Option<IpAddr>,
  cilod_port: Option<u16>,
  cilod_data_dir: Option<PathBuf>,
  cilod_base_subnet: Option<String>,
  cilod_dns_port: Option<u16>,
  cilod_logging_level: Option<LogLevel>,
}

#[derive(Debug, Clone)]
pub struct CilodConfig {
  pub bind_ip: IpAddr,
  pub port: u16,
  pub data_dir: PathBuf,
  /// Dotted `/16` prefix, eg `10.224.`.
  pub base_subnet: String,
  pub dns_port: u16,
  pub logging: LogConfig,
}

impl Default for CilodConfig {
  fn default() -> Self {
    Self {
      bind_ip: IpAddr::from([0, 0, 0, 0]),
      port: 8081,
      data_dir: PathBuf::from("/var/lib/cilo"),
      base_subnet: "10.224.".to_string(),
      dns_port: cilo_client::entities::DEFAULT_DNS_PORT,
      logging: LogConfig::default(),
    }
  }
}

impl CilodConfig {
  pub fn state_path(&self) -> PathBuf {
    self.data_dir.join("state.json")
  }

  pub fn peers_dir(&self) -> PathBuf {
    self.data_dir.join("peers")
  }

  pub fn dns_config_path(&self) -> PathBuf {
    self.data_dir.join("dnsmasq.conf")
  }

  pub fn dns_pid_path(&self) -> PathBuf {
    self.data_dir.join("dnsmasq.pid")
  }
}

pub fn cilod_args() -> &'static CliArgs {
  static ARGS: OnceLock<CliArgs> = OnceLock::new();
  ARGS.get_or_init(CliArgs::parse)
}

pub fn cilod_config() -> &'static CilodConfig {
  static CONFIG: OnceLock<CilodConfig> = OnceLock::new();
  CONFIG.get_or_init(|| {
    let env: Env = envy::from_env().unwrap_or_default();
    let args = cilod_args();
    let default = CilodConfig::default();

    CilodConfig {
      bind_ip: args
        .bind_ip
        .or(env.cilod_bind_ip)
        .unwrap_or(default.bind_ip),
      port: args.port.or(env.cilod_port).unwrap_or(default.port),
      data_dir: args
        .data_dir
        .clone()
        .or(env.cilod_data_dir)
        .unwrap_or(default.data_dir),
      base_subnet: args
        .base_subnet
        .clone()
        .or(env.cilod_base_subnet)
        .unwrap_or(default.base_subnet),
      dns_port: args.dns_port.or(env.cilod_dns_port).unwrap_or(default.dns_port),
      logging: LogConfig {
        level: args
          .log_level
          .map(LogLevel::from)
          .or(env.cilod_logging_level)
          .unwrap_or(default.logging.level),
        ..default.logging
      },
    }
  })
}
