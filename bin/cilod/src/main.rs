use std::sync::Arc;

use runtime::DockerDriver;
use tracing::Instrument;

use crate::{config::cilod_config, state::AppState};

#[macro_use]
extern crate tracing;

mod api;
mod auth;
mod config;
mod lifecycle;
mod peers;
mod reconciler;
mod shared_service;
mod state;
mod tunnel;
mod wireguard;

/// Periodic background sweep: clears expired shared services and
/// re-runs the reconciler's fix pass, per spec §4.H/§4.I's "no inline
/// wait" posture — nothing blocks a request on this.
fn spawn_maintenance_loop(state: state::SharedState) {
  tokio::spawn(async move {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
    loop {
      interval.tick().await;
      if let Err(e) = shared_service::sweep(&state).await {
        warn!("shared-service sweep failed: {e:#}");
      }
      if let Err(e) = reconciler::reconcile(&state).await {
        warn!("reconcile failed: {e:#}");
      }
    }
  });
}

async fn app() -> anyhow::Result<()> {
  let config = cilod_config().clone();
  logger::init(&config.logging)?;

  let startup_span = info_span!("CilodStartup");
  async {
    info!("cilod version: v{}", env!("CARGO_PKG_VERSION"));
    tokio::fs::create_dir_all(&config.data_dir).await?;
    tokio::fs::create_dir_all(config.peers_dir()).await?;

    let runtime: Arc<dyn runtime::RuntimeDriver> = match DockerDriver::connect() {
      Ok(driver) => Arc::new(driver),
      Err(e) => {
        error!("failed to connect to the container runtime: {e:#}");
        return Err(e);
      }
    };

    let state = Arc::new(AppState::new(config.clone(), runtime));
    spawn_maintenance_loop(state.clone());

    let router = api::router(state);
    let listener = tokio::net::TcpListener::bind((config.bind_ip, config.port)).await?;
    info!("listening on {}:{}", config.bind_ip, config.port);
    axum::serve(listener, router).await?;

    Ok(())
  }
  .instrument(startup_span)
  .await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  dotenvy::dotenv().ok();

  let mut term_signal = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
  let handle = tokio::spawn(app());

  tokio::select! {
    res = handle => return res?,
    _ = term_signal.recv() => {
      info!("received SIGTERM, shutting down");
    }
  }

  Ok(())
}
