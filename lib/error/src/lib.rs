use axum::{
  Json,
  http::StatusCode,
  response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// JSON error envelope returned for every non-2xx cilod response, per
/// spec §6 — so clients (the CLI, peer `cilod`s) get a machine-parsable
/// `error` field instead of scraping response text.
#[derive(Serialize)]
struct ErrorBody {
  error: String,
}

/// The error type threaded through cilod's request handlers and the
/// lifecycle engine. Carries an HTTP status code so the axum boundary
/// can turn any internal failure into the right response without a
/// per-handler match.
#[derive(Error, Debug)]
#[error("{error:#}")]
pub struct CiloError {
  pub error: anyhow::Error,
  pub status_code: StatusCode,
}

pub type Result<T> = std::result::Result<T, CiloError>;

impl<E> From<E> for CiloError
where
  E: Into<anyhow::Error>,
{
  fn from(error: E) -> Self {
    Self {
      error: error.into(),
      status_code: StatusCode::INTERNAL_SERVER_ERROR,
    }
  }
}

/// Attach a status code to an error that doesn't already carry one.
pub trait AddStatusCode {
  fn status_code(self, code: StatusCode) -> CiloError;
}

impl AddStatusCode for anyhow::Error {
  fn status_code(self, code: StatusCode) -> CiloError {
    CiloError { error: self, status_code: code }
  }
}

/// Same as [`AddStatusCode`], but for a `Result` whose error converts
/// into `anyhow::Error`. Lets call sites write
/// `some_fallible_call().status_code(StatusCode::NOT_FOUND)?`.
pub trait AddStatusCodeError<T> {
  fn status_code(self, code: StatusCode) -> Result<T>;
}

impl<T, E> AddStatusCodeError<T> for std::result::Result<T, E>
where
  E: Into<anyhow::Error>,
{
  fn status_code(self, code: StatusCode) -> Result<T> {
    self.map_err(|e| e.into().status_code(code))
  }
}

impl IntoResponse for CiloError {
  fn into_response(self) -> Response {
    tracing::warn!("{:#}", self.error);
    (self.status_code, Json(ErrorBody { error: format!("{:#}", self.error) }))
      .into_response()
  }
}
