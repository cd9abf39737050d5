use serde::{Deserialize, Serialize};

use crate::entities::Environment;

/// `POST /auth/challenge`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeRequest {
  pub public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeResponse {
  pub challenge: String,
}

/// `POST /auth/connect`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectRequest {
  pub challenge: String,
  pub signature: String,
  pub signature_format: String,
  pub public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectResponse {
  pub token: String,
}

/// `GET /environments` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentSummary {
  pub project: String,
  pub name: String,
  pub status: String,
  pub subnet: String,
  pub service_count: usize,
}

impl From<&Environment> for EnvironmentSummary {
  fn from(env: &Environment) -> Self {
    Self {
      project: env.project.clone(),
      name: env.name.clone(),
      status: format!("{:?}", env.status).to_lowercase(),
      subnet: env.subnet.to_string(),
      service_count: env.services.len(),
    }
  }
}

/// `GET /environments/{name}/logs` query params.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogsQuery {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub service: Option<String>,
  #[serde(default)]
  pub follow: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub tail: Option<u64>,
}

/// `POST /environments/{project}/{name}/up`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpRequest {
  /// Services to force into the shared set beyond whatever the
  /// project's compose files already label `cilo.share`.
  #[serde(default)]
  pub share: Vec<String>,
  /// Services to force out of the shared set even if labelled or
  /// passed in `share`.
  #[serde(default)]
  pub isolate: Vec<String>,
}

/// First text frame sent by the client over `/environments/{name}/exec`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRequest {
  pub service: String,
  pub command: Vec<String>,
  #[serde(default)]
  pub tty: bool,
}

/// `POST /wireguard/exchange`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireguardExchangeRequest {
  pub public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireguardExchangeResponse {
  pub peer_public_key: String,
  pub assigned_ip: String,
  pub endpoint: String,
  pub allowed_ips: Vec<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub advertised_subnet: Option<String>,
}

/// JSON error envelope returned for every non-2xx response, per spec §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
  pub error: String,
}
