use std::{sync::RwLock, time::Duration};

use anyhow::{Context, anyhow};
use reqwest::{Method, StatusCode};
use serde::{Serialize, de::DeserializeOwned};

pub mod api;
pub mod entities;
pub mod ws;

use api::{
  ChallengeRequest, ChallengeResponse, ConnectRequest, ConnectResponse,
  EnvironmentSummary, ErrorResponse, WireguardExchangeRequest,
  WireguardExchangeResponse,
};
use entities::Environment;

/// Thin HTTP(+WS) client for a single `cilod`, bound to one peer's
/// tunnel address. `bin/cli` constructs one of these per `--on <host>`
/// invocation; `bin/cilod` itself uses it to call out to other peers
/// it has not yet authenticated with.
pub struct CiloClient {
  pub address: String,
  http: reqwest::Client,
  token: RwLock<Option<String>>,
  request_timeout: Duration,
  max_retries: u32,
}

const USER_AGENT: &str = concat!("cilo-cli/", env!("CARGO_PKG_VERSION"));
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_RETRIES: u32 = 3;

impl CiloClient {
  pub fn new(address: impl Into<String>) -> anyhow::Result<Self> {
    let address = address.into().trim_end_matches('/').to_string();
    let http = reqwest::Client::builder()
      .user_agent(USER_AGENT)
      .timeout(DEFAULT_TIMEOUT)
      .build()
      .context("failed to build http client")?;
    Ok(Self {
      address,
      http,
      token: RwLock::new(None),
      request_timeout: DEFAULT_TIMEOUT,
      max_retries: DEFAULT_MAX_RETRIES,
    })
  }

  pub fn with_token(self, token: impl Into<String>) -> Self {
    *self.token.write().expect("token lock poisoned") = Some(token.into());
    self
  }

  pub fn set_token(&self, token: impl Into<String>) {
    *self.token.write().expect("token lock poisoned") = Some(token.into());
  }

  pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
    self.request_timeout = timeout;
    self
  }

  pub fn with_max_retries(mut self, max_retries: u32) -> Self {
    self.max_retries = max_retries;
    self
  }

  fn host_header(&self) -> anyhow::Result<String> {
    reqwest::Url::parse(&self.address)
      .ok()
      .and_then(|u| u.host_str().map(str::to_string))
      .context("cilod address has no host component")
  }

  /// GET/POST/DELETE with retry-on-5xx-and-network-error, linear
  /// backoff, bounded retry count. Client errors (4xx) are surfaced
  /// immediately and never retried, per spec §5/§7.
  async fn request<Req: Serialize, Res: DeserializeOwned>(
    &self,
    method: Method,
    path: &str,
    body: Option<&Req>,
  ) -> anyhow::Result<Res> {
    let url = format!("{}{path}", self.address);
    let mut attempt = 0;

    loop {
      let mut req = self.http.request(method.clone(), &url);
      let token = self.token.read().expect("token lock poisoned").clone();
      if let Some(token) = &token {
        req = req.bearer_auth(token);
      }
      if let Some(body) = body {
        req = req.json(body);
      }

      let result =
        req.timeout(self.request_timeout).send().await;

      let response = match result {
        Ok(response) => response,
        Err(e) if attempt < self.max_retries && !e.is_timeout() => {
          attempt += 1;
          tokio::time::sleep(Duration::from_millis(
            200 * attempt as u64,
          ))
          .await;
          continue;
        }
        Err(e) => {
          return Err(e).context("request to cilod failed");
        }
      };

      let status = response.status();
      if status.is_success() {
        return response
          .json::<Res>()
          .await
          .context("failed to parse cilod response body");
      }

      if status.is_server_error() && attempt < self.max_retries {
        attempt += 1;
        tokio::time::sleep(Duration::from_millis(200 * attempt as u64))
          .await;
        continue;
      }

      let error = response
        .json::<ErrorResponse>()
        .await
        .map(|e| e.error)
        .unwrap_or_else(|_| status.to_string());
      return Err(error_for_status(status, error));
    }
  }

  pub async fn auth_challenge(
    &self,
    public_key: &str,
  ) -> anyhow::Result<ChallengeResponse> {
    self
      .request(
        Method::POST,
        "/auth/challenge",
        Some(&ChallengeRequest { public_key: public_key.to_string() }),
      )
      .await
  }

  pub async fn auth_connect(
    &self,
    request: &ConnectRequest,
  ) -> anyhow::Result<ConnectResponse> {
    self.request(Method::POST, "/auth/connect", Some(request)).await
  }

  pub async fn list_environments(
    &self,
  ) -> anyhow::Result<Vec<EnvironmentSummary>> {
    self
      .request::<(), _>(Method::GET, "/environments", None)
      .await
  }

  pub async fn environment_create(
    &self,
    project: &str,
    name: &str,
    workspace_path: &str,
    dns_suffix: Option<&str>,
  ) -> anyhow::Result<Environment> {
    #[derive(Serialize)]
    struct Body<'a> {
      workspace_path: &'a str,
      dns_suffix: Option<&'a str>,
    }
    self
      .request(
        Method::POST,
        &format!("/environments/{project}/{name}"),
        Some(&Body { workspace_path, dns_suffix }),
      )
      .await
  }

  pub async fn environment_status(
    &self,
    project: &str,
    name: &str,
  ) -> anyhow::Result<Environment> {
    self
      .request::<(), _>(
        Method::GET,
        &format!("/environments/{project}/{name}/status"),
        None,
      )
      .await
  }

  pub async fn environment_up(
    &self,
    project: &str,
    name: &str,
    request: crate::api::UpRequest,
  ) -> anyhow::Result<Environment> {
    self
      .request(
        Method::POST,
        &format!("/environments/{project}/{name}/up"),
        Some(&request),
      )
      .await
  }

  pub async fn environment_down(
    &self,
    project: &str,
    name: &str,
  ) -> anyhow::Result<Environment> {
    self
      .request::<(), _>(
        Method::POST,
        &format!("/environments/{project}/{name}/down"),
        None,
      )
      .await
  }

  pub async fn environment_destroy(
    &self,
    project: &str,
    name: &str,
  ) -> anyhow::Result<()> {
    self
      .request::<(), serde_json::Value>(
        Method::DELETE,
        &format!("/environments/{project}/{name}"),
        None,
      )
      .await
      .map(|_| ())
  }

  pub async fn wireguard_exchange(
    &self,
    public_key: &str,
  ) -> anyhow::Result<WireguardExchangeResponse> {
    self
      .request(
        Method::POST,
        "/wireguard/exchange",
        Some(&WireguardExchangeRequest {
          public_key: public_key.to_string(),
        }),
      )
      .await
  }

  pub async fn wireguard_remove_peer(
    &self,
    public_key: &str,
  ) -> anyhow::Result<()> {
    self
      .request::<(), serde_json::Value>(
        Method::DELETE,
        &format!("/wireguard/peers/{public_key}"),
        None,
      )
      .await
      .map(|_| ())
  }

  /// [SUPPLEMENT] local-control calls: `bin/cli` always points these
  /// at its own host's cilod, never a `--on` peer.
  pub async fn list_machines(&self) -> anyhow::Result<Vec<entities::Machine>> {
    self.request::<(), _>(Method::GET, "/machines", None).await
  }

  pub async fn machines_connect(
    &self,
    host: &str,
    address: Option<&str>,
  ) -> anyhow::Result<entities::Machine> {
    #[derive(Serialize)]
    struct Body<'a> {
      address: Option<&'a str>,
    }
    self
      .request(
        Method::POST,
        &format!("/machines/{host}/connect"),
        Some(&Body { address }),
      )
      .await
  }

  pub async fn machines_disconnect(&self, host: &str) -> anyhow::Result<()> {
    self
      .request::<(), serde_json::Value>(
        Method::DELETE,
        &format!("/machines/{host}"),
        None,
      )
      .await
      .map(|_| ())
  }

  pub async fn doctor(&self, fix: bool) -> anyhow::Result<Vec<String>> {
    let path = if fix { "/doctor?fix=true" } else { "/doctor" };
    self.request::<(), _>(Method::GET, path, None).await
  }

  pub async fn environment_logs_websocket(
    &self,
    project: &str,
    name: &str,
    service: Option<&str>,
    follow: bool,
    tail: Option<u64>,
  ) -> anyhow::Result<
    tokio_tungstenite::WebSocketStream<
      tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
  > {
    let mut params = Vec::new();
    if let Some(service) = service {
      params.push(format!("service={service}"));
    }
    if follow {
      params.push("follow=true".to_string());
    }
    if let Some(tail) = tail {
      params.push(format!("tail={tail}"));
    }
    let query = (!params.is_empty()).then(|| params.join("&"));
    self
      .connect_websocket(
        &format!("/environments/{project}/{name}/logs"),
        query.as_deref(),
      )
      .await
  }

  pub async fn environment_exec_websocket(
    &self,
    project: &str,
    name: &str,
  ) -> anyhow::Result<
    tokio_tungstenite::WebSocketStream<
      tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
  > {
    self
      .connect_websocket(&format!("/environments/{project}/{name}/exec"), None)
      .await
  }
}

fn error_for_status(status: StatusCode, message: String) -> anyhow::Error {
  anyhow!("cilod returned {status}: {message}")
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn strips_trailing_slash_from_address() {
    let client = CiloClient::new("http://10.225.0.4:8081/").unwrap();
    assert_eq!(client.address, "http://10.225.0.4:8081");
  }

  #[test]
  fn with_token_is_readable_immediately() {
    let client =
      CiloClient::new("http://10.225.0.4:8081").unwrap().with_token("abc");
    assert_eq!(
      client.token.read().unwrap().as_deref(),
      Some("abc")
    );
  }

  #[test]
  fn host_header_extracts_hostname() {
    let client = CiloClient::new("http://10.225.0.4:8081").unwrap();
    assert_eq!(client.host_header().unwrap(), "10.225.0.4");
  }
}
