//! Log-stream and exec websockets, per spec §4.L. Both multiplex
//! through `cilo_client::ws::Frame` JSON text frames rather than raw
//! bytes, so the same envelope the client already parses works for
//! stdout/stderr, exit codes, and mid-stream errors alike.

use axum::{
  extract::{
    Path, Query, State,
    ws::{Message, WebSocket, WebSocketUpgrade},
  },
  http::{HeaderMap, StatusCode},
  response::IntoResponse,
};
use bytes::Bytes;
use cilo_client::{
  api::{ExecRequest, LogsQuery},
  entities::{LOCAL_HOST_ID, environment_key},
  ws::Frame,
};
use error::{AddStatusCode, Result};
use runtime::{ExecOptions, ExecOutput, LogLine, LogOptions};

use crate::state::SharedState;

async fn resolve_container(
  state: &SharedState,
  project: &str,
  name: &str,
  service: Option<&str>,
) -> Result<String> {
  let key = environment_key(project, name);
  let doc = state.store.load().await?;
  let env = doc
    .hosts
    .get(LOCAL_HOST_ID)
    .and_then(|h| h.environments.get(&key))
    .ok_or_else(|| anyhow::anyhow!("not-found: environment {key}"))
    .status_code(StatusCode::NOT_FOUND)?;

  let service_name = service
    .map(str::to_string)
    .or_else(|| env.ingress_service().map(|s| s.name.clone()))
    .ok_or_else(|| anyhow::anyhow!("logs-error: no service given and no ingress service configured"))
    .status_code(StatusCode::BAD_REQUEST)?;

  env
    .services
    .get(&service_name)
    .and_then(|s| s.container_id.clone())
    .ok_or_else(|| anyhow::anyhow!("not-found: service {service_name} has no running container"))
    .status_code(StatusCode::NOT_FOUND)
}

pub async fn logs(
  State(state): State<SharedState>,
  Path((project, name)): Path<(String, String)>,
  Query(query): Query<LogsQuery>,
  headers: HeaderMap,
  upgrade: WebSocketUpgrade,
) -> Result<impl IntoResponse> {
  super::authenticated_key(&state, &headers).await?;
  let container_id = resolve_container(&state, &project, &name, query.service.as_deref()).await?;
  let options = LogOptions { follow: query.follow, tail: query.tail, since: None, until: None };
  Ok(upgrade.on_upgrade(move |socket| stream_logs(socket, state, container_id, options)))
}

async fn stream_logs(mut socket: WebSocket, state: SharedState, container_id: String, options: LogOptions) {
  let mut stream = match state.runtime.stream_logs(&container_id, options).await {
    Ok(stream) => stream,
    Err(e) => {
      let _ = send_frame(&mut socket, &Frame::error(format!("{e:#}"))).await;
      return;
    }
  };
  while let Some(line) = stream.lines.recv().await {
    let frame = match line {
      LogLine::Stdout(text) => Frame::stdout(text),
      LogLine::Stderr(text) => Frame::stderr(text),
    };
    if send_frame(&mut socket, &frame).await.is_err() {
      return;
    }
  }
  let _ = send_frame(&mut socket, &Frame::eof()).await;
}

pub async fn exec(
  State(state): State<SharedState>,
  Path((project, name)): Path<(String, String)>,
  headers: HeaderMap,
  upgrade: WebSocketUpgrade,
) -> Result<impl IntoResponse> {
  super::authenticated_key(&state, &headers).await?;
  Ok(upgrade.on_upgrade(move |socket| run_exec(socket, state, project, name)))
}

/// The client's first text frame is a JSON `ExecRequest`; everything
/// after that is `Frame::Stdin`/`Signal`/`Eof` relayed to the
/// container, with `Stdout`/`Stderr`/`Exit` relayed back.
async fn run_exec(mut socket: WebSocket, state: SharedState, project: String, name: String) {
  let Some(Ok(Message::Text(text))) = socket.recv().await else {
    let _ = send_frame(&mut socket, &Frame::error("expected an exec request as the first frame")).await;
    return;
  };
  let request: ExecRequest = match serde_json::from_str(&text) {
    Ok(request) => request,
    Err(e) => {
      let _ = send_frame(&mut socket, &Frame::error(format!("malformed exec request: {e}"))).await;
      return;
    }
  };

  let container_id = match resolve_container(&state, &project, &name, Some(&request.service)).await {
    Ok(id) => id,
    Err(e) => {
      let _ = send_frame(&mut socket, &Frame::error(format!("{e}"))).await;
      return;
    }
  };

  let mut session = match state
    .runtime
    .exec(&container_id, ExecOptions { command: request.command, tty: request.tty })
    .await
  {
    Ok(session) => session,
    Err(e) => {
      let _ = send_frame(&mut socket, &Frame::error(format!("{e:#}"))).await;
      return;
    }
  };

  loop {
    tokio::select! {
      incoming = socket.recv() => {
        match incoming {
          Some(Ok(Message::Text(text))) => {
            let Ok(frame) = Frame::from_json_str(&text) else { continue };
            if session.stdin.send(Bytes::from(frame.data.into_bytes())).await.is_err() {
              break;
            }
          }
          Some(Ok(Message::Close(_))) | None => break,
          Some(Err(_)) => break,
          _ => {}
        }
      }
      output = session.output.recv() => {
        match output {
          Some(ExecOutput::Stdout(bytes)) => {
            if send_frame(&mut socket, &Frame::stdout(String::from_utf8_lossy(&bytes))).await.is_err() {
              break;
            }
          }
          Some(ExecOutput::Stderr(bytes)) => {
            if send_frame(&mut socket, &Frame::stderr(String::from_utf8_lossy(&bytes))).await.is_err() {
              break;
            }
          }
          Some(ExecOutput::Exit(code)) => {
            let _ = send_frame(&mut socket, &Frame::exit(code as i32)).await;
            break;
          }
          None => break,
        }
      }
    }
  }
}

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> anyhow::Result<()> {
  let text = frame.to_json_string()?;
  socket.send(Message::Text(text.into())).await.map_err(Into::into)
}
