//! HTTP surface, per spec §4.L: peer-facing endpoints authenticated by
//! the §4.M challenge/response, plus a handful of [SUPPLEMENT]
//! local-control endpoints (`/machines/*`, `/doctor`) that let
//! `bin/cli` drive this host's own `tunnel`/`reconciler` modules
//! without duplicating their logic in the CLI binary.
//!
//! Grounded in `axum`'s router/extractor idiom rather than any one
//! pack example — the corpus's networked binaries (`periphery`) speak
//! a custom noise-encrypted socket protocol, not REST, so there's no
//! existing router of this shape to adapt here. The dependency choice
//! (`axum` + `tower-http`) carries over regardless.

mod ws;

use axum::{
  Json, Router,
  extract::{Path, Query, State},
  http::{HeaderMap, StatusCode, header::AUTHORIZATION},
  response::IntoResponse,
  routing::{delete, get, post},
};
use cilo_client::{
  api::{
    ChallengeRequest, ChallengeResponse, ConnectRequest, ConnectResponse,
    EnvironmentSummary, UpRequest, WireguardExchangeRequest,
    WireguardExchangeResponse,
  },
  entities::{LOCAL_HOST_ID, Machine},
};
use error::{AddStatusCode, AddStatusCodeError, CiloError, Result};
use rate_limit::WithFailureRateLimit;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{auth, lifecycle, reconciler, state::SharedState, tunnel, wireguard};

pub fn router(state: SharedState) -> Router {
  Router::new()
    .route("/auth/challenge", post(challenge))
    .route("/auth/connect", post(connect))
    .route("/environments", get(list_environments))
    .route("/environments/{project}/{name}", post(environment_create).delete(environment_destroy))
    .route("/environments/{project}/{name}/status", get(environment_status))
    .route("/environments/{project}/{name}/up", post(environment_up))
    .route("/environments/{project}/{name}/down", post(environment_down))
    .route("/environments/{project}/{name}/logs", get(ws::logs))
    .route("/environments/{project}/{name}/exec", get(ws::exec))
    .route("/wireguard/exchange", post(wireguard_exchange))
    .route("/wireguard/peers/{key}", delete(wireguard_remove_peer))
    .route("/machines", get(list_machines))
    .route("/machines/{host}/connect", post(machines_connect))
    .route("/machines/{host}", delete(machines_disconnect))
    .route("/doctor", get(doctor))
    .layer(TraceLayer::new_for_http())
    .layer(CorsLayer::permissive())
    .with_state(state)
}

/// Bearer token already resolved to the SSH public key it was issued
/// for; built by hand rather than as a `FromRequestParts` extractor so
/// call sites can thread it into `WithFailureRateLimit` explicitly —
/// auth failures are exactly what the rate limiter should be counting.
async fn authenticated_key(
  state: &SharedState,
  headers: &HeaderMap,
) -> Result<(String, String)> {
  let token = headers
    .get(AUTHORIZATION)
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.strip_prefix("Bearer "))
    .ok_or_else(|| anyhow::anyhow!("auth-failed: missing bearer token").status_code(StatusCode::UNAUTHORIZED))?;
  let public_key = auth::authenticate(state, token)
    .await
    .ok_or_else(|| anyhow::anyhow!("auth-failed: invalid or expired token").status_code(StatusCode::UNAUTHORIZED))?;
  Ok((public_key, token.to_string()))
}

async fn challenge(
  State(state): State<SharedState>,
  headers: HeaderMap,
  Json(request): Json<ChallengeRequest>,
) -> Result<Json<ChallengeResponse>> {
  async {
    let challenge = auth::issue_challenge(&state, &request.public_key).await;
    Ok(Json(ChallengeResponse { challenge }))
  }
  .with_failure_rate_limit_using_headers(&state.auth_limiter, &headers)
  .await
}

async fn connect(
  State(state): State<SharedState>,
  headers: HeaderMap,
  Json(request): Json<ConnectRequest>,
) -> Result<Json<ConnectResponse>> {
  async {
    let token = auth::verify_and_issue_token(
      &state,
      &request.public_key,
      &request.challenge,
      &request.signature,
      &request.signature_format,
    )
    .await
    .status_code(StatusCode::UNAUTHORIZED)?;
    Ok(Json(ConnectResponse { token }))
  }
  .with_failure_rate_limit_using_headers(&state.auth_limiter, &headers)
  .await
}

async fn list_environments(
  State(state): State<SharedState>,
  headers: HeaderMap,
) -> Result<Json<Vec<EnvironmentSummary>>> {
  authenticated_key(&state, &headers).await?;
  let doc = state.store.load().await?;
  let summaries = doc
    .hosts
    .get(LOCAL_HOST_ID)
    .map(|host| host.environments.values().map(EnvironmentSummary::from).collect())
    .unwrap_or_default();
  Ok(Json(summaries))
}

#[derive(serde::Deserialize)]
struct CreateBody {
  workspace_path: String,
  #[serde(default)]
  dns_suffix: Option<String>,
}

async fn environment_create(
  State(state): State<SharedState>,
  headers: HeaderMap,
  Path((project, name)): Path<(String, String)>,
  Json(body): Json<CreateBody>,
) -> Result<impl IntoResponse> {
  authenticated_key(&state, &headers).await?;
  let env = lifecycle::create(
    &state,
    lifecycle::CreateOptions {
      project,
      name,
      workspace_path: body.workspace_path.into(),
      dns_suffix: body.dns_suffix,
    },
  )
  .await?;
  Ok(Json(env))
}

async fn environment_status(
  State(state): State<SharedState>,
  headers: HeaderMap,
  Path((project, name)): Path<(String, String)>,
) -> Result<impl IntoResponse> {
  authenticated_key(&state, &headers).await?;
  let key = cilo_client::entities::environment_key(&project, &name);
  let doc = state.store.load().await?;
  let env = doc
    .hosts
    .get(LOCAL_HOST_ID)
    .and_then(|h| h.environments.get(&key))
    .cloned()
    .ok_or_else(|| anyhow::anyhow!("not-found: environment {key}"))
    .status_code(StatusCode::NOT_FOUND)?;
  Ok(Json(env))
}

async fn environment_up(
  State(state): State<SharedState>,
  headers: HeaderMap,
  Path((project, name)): Path<(String, String)>,
  body: Option<Json<UpRequest>>,
) -> Result<impl IntoResponse> {
  authenticated_key(&state, &headers).await?;
  let UpRequest { share, isolate } = body.map(|Json(b)| b).unwrap_or_default();
  let env = lifecycle::up(
    &state,
    lifecycle::UpOptions {
      project,
      name,
      share: share.into_iter().collect(),
      isolate: isolate.into_iter().collect(),
      ready_timeout: std::time::Duration::from_secs(60),
    },
  )
  .await?;
  Ok(Json(env))
}

async fn environment_down(
  State(state): State<SharedState>,
  headers: HeaderMap,
  Path((project, name)): Path<(String, String)>,
) -> Result<impl IntoResponse> {
  authenticated_key(&state, &headers).await?;
  let env = lifecycle::down(&state, &project, &name).await?;
  Ok(Json(env))
}

async fn environment_destroy(
  State(state): State<SharedState>,
  headers: HeaderMap,
  Path((project, name)): Path<(String, String)>,
) -> Result<impl IntoResponse> {
  authenticated_key(&state, &headers).await?;
  lifecycle::destroy(&state, &project, &name, lifecycle::DestroyOptions { keep_workspace: false }).await?;
  Ok(StatusCode::NO_CONTENT)
}

async fn wireguard_exchange(
  State(state): State<SharedState>,
  headers: HeaderMap,
  Json(request): Json<WireguardExchangeRequest>,
) -> Result<Json<WireguardExchangeResponse>> {
  let (public_key, token) = authenticated_key(&state, &headers).await?;
  let host_header = headers
    .get(axum::http::header::HOST)
    .and_then(|v| v.to_str().ok())
    .ok_or_else(|| anyhow::anyhow!("request has no Host header").status_code(StatusCode::BAD_REQUEST))?
    .to_string();
  let response = wireguard::exchange(&state, &public_key, &token, &request.public_key, &host_header).await?;
  Ok(Json(response))
}

async fn wireguard_remove_peer(
  State(state): State<SharedState>,
  headers: HeaderMap,
  Path(key): Path<String>,
) -> Result<impl IntoResponse> {
  authenticated_key(&state, &headers).await?;
  wireguard::remove_peer(&state, &key).await?;
  Ok(StatusCode::NO_CONTENT)
}

/// [SUPPLEMENT] local-control surface: not part of spec §4.L's
/// peer-facing list, but `bin/cli`'s `connect`/`disconnect`/`machines`
/// commands need some way to reach the daemon that owns the tunnel
/// state. Not bearer-gated — these are meant to be reachable only by
/// the CLI running as the same operator, on the same host.
async fn list_machines(State(state): State<SharedState>) -> Json<Vec<Machine>> {
  Json(crate::peers::list(&state.config).await)
}

#[derive(serde::Deserialize)]
struct ConnectBody {
  #[serde(default)]
  address: Option<String>,
}

async fn machines_connect(
  State(state): State<SharedState>,
  Path(host): Path<String>,
  body: Option<Json<ConnectBody>>,
) -> Result<Json<Machine>> {
  let target = body.and_then(|b| b.0.address).unwrap_or_else(|| host.clone());
  let machine = tunnel::connect(&state, &target).await?;
  Ok(Json(machine))
}

async fn machines_disconnect(
  State(state): State<SharedState>,
  Path(host): Path<String>,
) -> Result<impl IntoResponse> {
  tunnel::disconnect(&state, &host).await?;
  Ok(StatusCode::NO_CONTENT)
}

#[derive(serde::Deserialize, Default)]
struct DoctorQuery {
  #[serde(default)]
  fix: bool,
}

async fn doctor(
  State(state): State<SharedState>,
  Query(query): Query<DoctorQuery>,
) -> Result<Json<Vec<String>>> {
  let report = if query.fix {
    reconciler::reconcile(&state).await?
  } else {
    reconciler::inspect(&state).await?
  };
  Ok(Json(report.drift.into_iter().map(|d| format!("{d:?}")).collect()))
}
