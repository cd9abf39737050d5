use clap::{Parser, Subcommand};

mod auth;
mod client;
mod command;
mod settings;
mod workspace;

/// A `--on <host>` peer name routes lifecycle/logs/exec/run to a
/// connected machine instead of the local daemon; `machines`, `doctor`,
/// `connect`, and `disconnect` always target the local daemon.
#[derive(Parser)]
#[command(name = "cilo", version, about = "Cilo development environment orchestrator")]
struct Cli {
  #[arg(long, global = true)]
  on: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// One-shot host bootstrap: confirm cilod and an SSH identity are available.
  Init,
  /// Write this directory's `.cilo/config.yml`.
  Setup,
  /// Register a brand-new environment.
  Create { env: String },
  /// Bring an environment's containers up.
  Up {
    env: String,
    /// Force a service into the shared set for this `up`, even if its
    /// compose file doesn't label it `cilo.share`.
    #[arg(long = "share")]
    share: Vec<String>,
    /// Force a service out of the shared set for this `up`, even if
    /// labelled `cilo.share`.
    #[arg(long = "isolate")]
    isolate: Vec<String>,
  },
  /// Stop an environment's containers without deleting its record.
  Down { env: String },
  /// Tear down an environment and its workspace.
  Destroy { env: String },
  /// List every environment cilod knows about.
  List,
  /// Show one environment's status and services.
  Status { env: String },
  /// Stream a service's logs.
  Logs {
    env: String,
    service: Option<String>,
    #[arg(long)]
    follow: bool,
    #[arg(long)]
    tail: Option<u64>,
  },
  /// Open an interactive shell in a service's container.
  Exec {
    env: String,
    service: String,
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,
  },
  /// Run a command against an environment's ingress service.
  Run {
    env: String,
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,
  },
  /// Authenticate to a peer and bring up a WireGuard tunnel to it.
  Connect {
    host: String,
    #[arg(long)]
    address: Option<String>,
  },
  /// Tear down a tunnel (or every tunnel, if no host is given).
  Disconnect { host: Option<String> },
  /// List connected peers.
  Machines,
  /// Report (and optionally repair) drift between state and the runtime.
  Doctor {
    #[arg(long)]
    fix: bool,
  },
  /// DNS diagnostics.
  Dns {
    #[command(subcommand)]
    action: DnsAction,
  },
  /// Subnet diagnostics.
  Network {
    #[command(subcommand)]
    action: NetworkAction,
  },
  /// Declare extra hostnames on the project's ingress, applied on the next `up`.
  Hostnames {
    #[command(subcommand)]
    action: HostnamesAction,
  },
  /// Destroy every environment in the current project and disconnect every tunnel.
  CleanSlate,
  /// Disconnect every tunnel and remove this project's local config.
  Uninstall,
}

#[derive(Subcommand)]
enum DnsAction {
  Setup,
  Status,
}

#[derive(Subcommand)]
enum NetworkAction {
  Status,
  Migrate,
}

#[derive(Subcommand)]
enum HostnamesAction {
  Add { hostname: String },
  Remove { hostname: String },
  List,
  Set {
    #[arg(trailing_var_arg = true)]
    hostnames: Vec<String>,
  },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  dotenvy::dotenv().ok();
  let cli = Cli::parse();
  let on = cli.on.as_deref();

  let result = match cli.command {
    Command::Init => command::project::init().await,
    Command::Setup => command::project::setup().await,
    Command::Create { env } => command::lifecycle::create(on, &env).await,
    Command::Up { env, share, isolate } => {
      command::lifecycle::up(on, &env, share, isolate).await
    }
    Command::Down { env } => command::lifecycle::down(on, &env).await,
    Command::Destroy { env } => command::lifecycle::destroy(on, &env).await,
    Command::List => command::lifecycle::list(on).await,
    Command::Status { env } => command::lifecycle::status(on, &env).await,
    Command::Logs { env, service, follow, tail } => {
      command::logs::run(on, &env, service.as_deref(), follow, tail).await
    }
    Command::Exec { env, service, command: cmd } => {
      command::exec::run(on, &env, &service, cmd).await
    }
    Command::Run { env, command: cmd } => command::project::run(on, &env, cmd).await,
    Command::Connect { host, address } => command::machines::connect(&host, address.as_deref()).await,
    Command::Disconnect { host } => command::machines::disconnect(host.as_deref()).await,
    Command::Machines => command::machines::list().await,
    Command::Doctor { fix } => command::machines::doctor(fix).await,
    Command::Dns { action: DnsAction::Setup } => command::project::dns_setup().await,
    Command::Dns { action: DnsAction::Status } => command::project::dns_status().await,
    Command::Network { action: NetworkAction::Status } => command::project::network_status().await,
    Command::Network { action: NetworkAction::Migrate } => command::project::network_migrate().await,
    Command::Hostnames { action: HostnamesAction::Add { hostname } } => {
      command::project::hostnames_add(&hostname).await
    }
    Command::Hostnames { action: HostnamesAction::Remove { hostname } } => {
      command::project::hostnames_remove(&hostname).await
    }
    Command::Hostnames { action: HostnamesAction::List } => command::project::hostnames_list().await,
    Command::Hostnames { action: HostnamesAction::Set { hostnames } } => {
      command::project::hostnames_set(hostnames).await
    }
    Command::CleanSlate => command::project::clean_slate().await,
    Command::Uninstall => command::project::uninstall().await,
  };

  if let Err(e) = result {
    eprintln!("{e:#}");
    std::process::exit(1);
  }
  Ok(())
}
