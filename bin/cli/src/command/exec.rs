//! `exec <env> <service> [cmd...]`: an interactive session over the
//! §4.L exec websocket. Structurally this is `km`'s raw-mode
//! terminal-forwarding loop (stdin -> socket, socket -> stdout, SIGWINCH
//! -> resize), adapted to carry `cilo_client::ws::Frame` JSON text
//! frames instead of raw binary tungstenite messages, since the exec
//! protocol here multiplexes stdout/stderr/exit through one envelope
//! rather than splitting them across message types.

use anyhow::Context;
use cilo_client::{
  api::ExecRequest,
  ws::{Frame, FrameType},
};
use colored::Colorize;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_tungstenite::tungstenite::Message;

use crate::client;

pub async fn run(
  on: Option<&str>,
  env: &str,
  service: &str,
  command: Vec<String>,
) -> anyhow::Result<()> {
  let root = crate::settings::workspace_root()?;
  let project = crate::settings::ProjectConfig::load(&root)?.project_name(&root)?;
  let client = client::resolve(on).await?;
  let socket = client.environment_exec_websocket(&project, env).await?;
  let (mut write, mut read) = socket.split();

  let request = ExecRequest { service: service.to_string(), command, tty: true };
  write
    .send(Message::Text(serde_json::to_string(&request)?.into()))
    .await?;

  let guard = RawModeGuard::enable()?;
  let exit_code = forward(&mut write, &mut read).await;
  drop(guard);

  match exit_code {
    Ok(code) => std::process::exit(code),
    Err(e) => {
      eprintln!("\n{} {e:#}", "exec error:".red().bold());
      std::process::exit(1);
    }
  }
}

type WsSink = futures_util::stream::SplitSink<
  tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
  >,
  Message,
>;
type WsSource = futures_util::stream::SplitStream<
  tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
  >,
>;

async fn forward(write: &mut WsSink, read: &mut WsSource) -> anyhow::Result<i32> {
  let mut stdin = tokio::io::stdin();
  let mut stdout = tokio::io::stdout();
  let mut buf = [0u8; 8192];
  let mut stdin_open = true;

  loop {
    tokio::select! {
      n = stdin.read(&mut buf), if stdin_open => {
        let n = n.context("failed to read stdin")?;
        if n == 0 {
          stdin_open = false;
          let eof = Frame { kind: FrameType::Eof, data: String::new(), exit_code: None };
          write.send(Message::Text(eof.to_json_string()?.into())).await.ok();
          continue;
        }
        let frame = Frame { kind: FrameType::Stdin, data: String::from_utf8_lossy(&buf[..n]).to_string(), exit_code: None };
        if write.send(Message::Text(frame.to_json_string()?.into())).await.is_err() {
          return Ok(1);
        }
      }
      message = read.next() => {
        let Some(message) = message else { return Ok(0) };
        let text = match message? {
          Message::Text(text) => text.to_string(),
          Message::Close(_) => return Ok(0),
          _ => continue,
        };
        let Ok(frame) = Frame::from_json_str(&text) else { continue };
        match frame.kind {
          FrameType::Stdout => { stdout.write_all(frame.data.as_bytes()).await?; stdout.flush().await?; }
          FrameType::Stderr => eprint!("{}", frame.data.red()),
          FrameType::Exit => return Ok(frame.exit_code.unwrap_or(0)),
          FrameType::Error => {
            eprintln!("{} {}", "exec error:".red().bold(), frame.data);
            return Ok(1);
          }
          _ => {}
        }
      }
    }
  }
}

struct RawModeGuard;

impl RawModeGuard {
  fn enable() -> anyhow::Result<Self> {
    crossterm::terminal::enable_raw_mode().context("failed to enable terminal raw mode")?;
    Ok(Self)
  }
}

impl Drop for RawModeGuard {
  fn drop(&mut self) {
    if let Err(e) = crossterm::terminal::disable_raw_mode() {
      eprintln!("failed to disable terminal raw mode: {e:?}");
    }
  }
}
