//! `logs <env> [service]`: opens the §4.L log-stream websocket and
//! prints `Frame::{Stdout,Stderr}` lines until `Eof`/`Error`/Ctrl-C.

use cilo_client::ws::{Frame, FrameType};
use colored::Colorize;
use futures_util::StreamExt;
use tokio_tungstenite::tungstenite::Message;

use crate::client;

pub async fn run(
  on: Option<&str>,
  env: &str,
  service: Option<&str>,
  follow: bool,
  tail: Option<u64>,
) -> anyhow::Result<()> {
  let root = crate::settings::workspace_root()?;
  let project = crate::settings::ProjectConfig::load(&root)?.project_name(&root)?;
  let client = client::resolve(on).await?;
  let socket = client.environment_logs_websocket(&project, env, service, follow, tail).await?;
  let (_, mut read) = socket.split();

  while let Some(message) = read.next().await {
    let text = match message? {
      Message::Text(text) => text.to_string(),
      Message::Close(_) => break,
      _ => continue,
    };
    let Ok(frame) = Frame::from_json_str(&text) else { continue };
    match frame.kind {
      FrameType::Stdout => print!("{}", frame.data),
      FrameType::Stderr => eprint!("{}", frame.data.red()),
      FrameType::Error => {
        eprintln!("{} {}", "log stream error:".red().bold(), frame.data);
        break;
      }
      FrameType::Eof => break,
      _ => {}
    }
  }
  Ok(())
}
