//! Administrative HTTP API over the stored traffic.
//!
//! | route                | result                                   |
//! |----------------------|------------------------------------------|
//! | `GET /requests`      | every stored request record              |
//! | `GET /requests/{id}` | one request record                       |
//! | `GET /repeat/{id}`   | replays the request, returns the response |
//! | `GET /scan/{id}`     | scans the request, returns the finding   |
//!
//! Errors are a JSON string with a 4xx or 5xx status.
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::oneshot;

use crate::errors::{Error, Result};
use crate::record::{RequestRecord, ResponseRecord};
use crate::replay::Replayer;
use crate::repo::Repo;
use crate::scan::Scanner;
use crate::server::ServerHandle;

/// Answer of a scan that flagged nothing.
pub const NO_FINDING: &str = "no sql injections found";

/// Shared state of the API handlers.
#[derive(Clone)]
pub struct ApiState {
  repo: Arc<dyn Repo>,
  replayer: Replayer,
  scanner: Scanner,
}

impl ApiState {
  /// Serve records of the scanner's repository.
  pub fn new(scanner: Scanner) -> Self {
    let replayer = scanner.replayer().clone();
    ApiState {
      repo: replayer.repo().clone(),
      replayer,
      scanner,
    }
  }
}

/// The API routes.
pub fn router(state: ApiState) -> Router {
  Router::new()
    .route("/requests", get(list_requests))
    .route("/requests/{id}", get(get_request))
    .route("/repeat/{id}", get(repeat))
    .route("/scan/{id}", get(scan))
    .with_state(state)
}

struct ApiError {
  status: StatusCode,
  message: String,
}

impl From<Error> for ApiError {
  fn from(error: Error) -> Self {
    let status = match &error {
      Error::NotFound { .. } => StatusCode::NOT_FOUND,
      e if e.is_transport() => StatusCode::BAD_GATEWAY,
      _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    ApiError {
      status,
      message: error.to_string(),
    }
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    (self.status, Json(self.message)).into_response()
  }
}

fn parse_id(raw: &str) -> std::result::Result<i64, ApiError> {
  raw.parse::<i64>().map_err(|_| ApiError {
    status: StatusCode::BAD_REQUEST,
    message: format!("invalid id {:?}", raw),
  })
}

async fn list_requests(
  State(state): State<ApiState>,
) -> std::result::Result<Json<Vec<RequestRecord>>, ApiError> {
  Ok(Json(state.repo.all_requests().await?))
}

async fn get_request(
  State(state): State<ApiState>,
  Path(id): Path<String>,
) -> std::result::Result<Json<RequestRecord>, ApiError> {
  let id = parse_id(&id)?;
  Ok(Json(state.repo.get_request(id).await?))
}

async fn repeat(
  State(state): State<ApiState>,
  Path(id): Path<String>,
) -> std::result::Result<Json<ResponseRecord>, ApiError> {
  let id = parse_id(&id)?;
  Ok(Json(state.replayer.repeat(id).await?))
}

async fn scan(
  State(state): State<ApiState>,
  Path(id): Path<String>,
) -> std::result::Result<Json<String>, ApiError> {
  let id = parse_id(&id)?;
  let answer = match state.scanner.scan(id).await? {
    Some(finding) => finding.to_string(),
    None => NO_FINDING.to_string(),
  };
  Ok(Json(answer))
}

/// A bound API listener, with the same lifecycle as the proxy.
pub struct ApiServer {
  listener: TcpListener,
  local_addr: SocketAddr,
  router: Router,
}

impl ApiServer {
  /// Bind the API listener. Port `0` picks an ephemeral port.
  pub async fn bind<A: ToSocketAddrs>(addr: A, state: ApiState) -> Result<ApiServer> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!("api listening on {}", local_addr);
    Ok(ApiServer {
      listener,
      local_addr,
      router: router(state),
    })
  }

  /// The bound address.
  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  /// Serve until `signal` completes, finishing requests in flight.
  pub async fn run_until<F>(self, signal: F) -> Result<()>
  where
    F: Future<Output = ()> + Send + 'static,
  {
    axum::serve(self.listener, self.router)
      .with_graceful_shutdown(signal)
      .await?;
    tracing::info!("api on {} stopped", self.local_addr);
    Ok(())
  }

  /// Serve in the background until [`ServerHandle::shutdown`].
  pub fn start(self) -> ServerHandle {
    let (tx, rx) = oneshot::channel::<()>();
    let local_addr = self.local_addr;
    let task = tokio::spawn(async move {
      if let Err(e) = self
        .run_until(async {
          let _ = rx.await;
        })
        .await
      {
        tracing::error!("api on {} failed: {}", local_addr, e);
      }
    });
    ServerHandle::new(local_addr, tx, task)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::repo::MemoryRepo;
  use axum::body::Body;
  use http_body_util::BodyExt;
  use tower::ServiceExt;

  async fn call(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
      .oneshot(
        axum::http::Request::builder()
          .uri(uri)
          .body(Body::empty())
          .unwrap(),
      )
      .await
      .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&body).unwrap())
  }

  async fn app() -> (Router, Arc<MemoryRepo>) {
    let repo = Arc::new(MemoryRepo::new());
    let record = RequestRecord {
      method: "GET".into(),
      scheme: "http".into(),
      host: "example.test".into(),
      path: "/".into(),
      ..Default::default()
    };
    repo.save_request(&record).await.unwrap();
    let state = ApiState::new(Scanner::new(Replayer::new(repo.clone())));
    (router(state), repo)
  }

  #[tokio::test]
  async fn lists_and_fetches_requests() {
    let (app, _) = app().await;
    let (status, body) = call(app.clone(), "/requests").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
    let (status, body) = call(app, "/requests/1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["host"], "example.test");
  }

  #[tokio::test]
  async fn errors_are_json_strings() {
    let (app, _) = app().await;
    let (status, body) = call(app.clone(), "/requests/abc").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.is_string());
    let (status, body) = call(app.clone(), "/requests/9").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, "request 9 not found");
    let (status, _) = call(app.clone(), "/scan/9").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = call(app, "/repeat/x").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
  }
}
