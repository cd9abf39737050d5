use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::{
  MaybeTlsStream, WebSocketStream, tungstenite,
};

use crate::CiloClient;

/// The single envelope type multiplexing both the log-stream and
/// exec websockets, per spec §4.L.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
  Stdin,
  Stdout,
  Stderr,
  Signal,
  Exit,
  Error,
  Eof,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
  #[serde(rename = "type")]
  pub kind: FrameType,
  pub data: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub exit_code: Option<i32>,
}

impl Frame {
  pub fn stdout(data: impl Into<String>) -> Self {
    Self { kind: FrameType::Stdout, data: data.into(), exit_code: None }
  }

  pub fn stderr(data: impl Into<String>) -> Self {
    Self { kind: FrameType::Stderr, data: data.into(), exit_code: None }
  }

  pub fn exit(code: i32) -> Self {
    Self { kind: FrameType::Exit, data: String::new(), exit_code: Some(code) }
  }

  pub fn eof() -> Self {
    Self { kind: FrameType::Eof, data: String::new(), exit_code: None }
  }

  pub fn error(message: impl Into<String>) -> Self {
    Self { kind: FrameType::Error, data: message.into(), exit_code: None }
  }

  pub fn to_json_string(&self) -> anyhow::Result<String> {
    serde_json::to_string(self)
      .context("failed to serialize websocket frame")
  }

  pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
    serde_json::from_str(json)
      .context("failed to parse websocket frame")
  }
}

impl CiloClient {
  /// Open an authenticated websocket against a cilod path such as
  /// `/environments/{name}/logs` or `/environments/{name}/exec`.
  pub async fn connect_websocket(
    &self,
    path: &str,
    query: Option<&str>,
  ) -> anyhow::Result<WebSocketStream<MaybeTlsStream<TcpStream>>> {
    let mut endpoint =
      format!("{}{path}", self.address.replacen("http", "ws", 1));
    if let Some(query) = query {
      endpoint.push('?');
      endpoint.push_str(query);
    }

    let token = self
      .token
      .read()
      .expect("token lock poisoned")
      .clone();
    let mut request = tungstenite::http::Request::builder()
      .uri(&endpoint)
      .header("Host", self.host_header()?)
      .header("Connection", "Upgrade")
      .header("Upgrade", "websocket")
      .header("Sec-WebSocket-Version", "13")
      .header(
        "Sec-WebSocket-Key",
        tungstenite::handshake::client::generate_key(),
      );
    if let Some(token) = token {
      request = request.header("Authorization", format!("Bearer {token}"));
    }
    let request = request
      .body(())
      .context("failed to build websocket upgrade request")?;

    let (ws, _) = tokio_tungstenite::connect_async(request)
      .await
      .with_context(|| {
        format!("failed to connect to cilod websocket at {endpoint}")
      })?;
    Ok(ws)
  }
}
