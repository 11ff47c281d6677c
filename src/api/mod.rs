//! HTTP transport over the orchestrator.
//!
//! - `POST /api/run` executes one submission
//! - `GET /api/status` reports slot usage
//! - `/static/*` serves files from the configured static directory

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use uuid::Uuid;

use crate::error::ExecError;
use crate::orchestrator::{
    AdmissionStats, ExecutionRequest, ExecutionResult, ExecutionStatus, Orchestrator,
    ResourceLimits,
};

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Orchestrator,
}

#[derive(Debug, Deserialize)]
pub struct RunRequest {
    pub image: String,
    pub source: String,
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub memory_bytes: Option<i64>,
    #[serde(default)]
    pub cpu_shares: Option<i64>,
}

impl RunRequest {
    fn into_execution_request(self) -> ExecutionRequest {
        let limits = ResourceLimits {
            cpu_shares: self.cpu_shares,
            memory_bytes: self.memory_bytes,
            pids_limit: None,
            timeout: self.timeout_ms.map(Duration::from_millis),
        };
        let mut request = ExecutionRequest::new(self.image, self.source).with_limits(limits);
        if let Some(command) = self.command {
            request = request.with_command(command);
        }
        request
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunResponse {
    pub submission_id: Uuid,
    pub status: ExecutionStatus,
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stdout_truncated: bool,
    pub stderr: String,
    pub stderr_truncated: bool,
    pub truncated: bool,
    pub duration_ms: u64,
}

impl From<ExecutionResult> for RunResponse {
    fn from(result: ExecutionResult) -> Self {
        Self {
            submission_id: result.submission_id,
            status: result.status,
            exit_code: result.exit_code,
            stdout: result.stdout.text().into_owned(),
            stdout_truncated: result.stdout.truncated(),
            stderr: result.stderr.text().into_owned(),
            stderr_truncated: result.stderr.truncated(),
            truncated: result.partial_output_truncated(),
            duration_ms: result.duration.as_millis() as u64,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: String,
}

fn error_status(err: &ExecError) -> StatusCode {
    match err {
        ExecError::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
        ExecError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        ExecError::ImageNotFound(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ExecError::RuntimeUnavailable(_) | ExecError::ContainerOperationFailed(_) => {
            StatusCode::BAD_GATEWAY
        }
        ExecError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ExecError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.to_string(),
            kind: self.kind().to_string(),
        };
        (error_status(&self), Json(body)).into_response()
    }
}

pub fn router(state: ApiState, static_dir: &Path) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/run", post(run_handler))
        .route("/api/status", get(status_handler))
        .nest_service("/static", ServeDir::new(static_dir))
        .layer(cors)
        .with_state(state)
}

/// Serve the API until `shutdown` is cancelled.
pub async fn serve(
    addr: SocketAddr,
    state: ApiState,
    static_dir: &Path,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, static_dir = %static_dir.display(), "Starting HTTP server");

    axum::serve(listener, router(state, static_dir))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn run_handler(
    State(state): State<ApiState>,
    payload: Result<Json<RunRequest>, JsonRejection>,
) -> Result<Json<RunResponse>, ExecError> {
    let Json(payload) = payload.map_err(|rejection| {
        tracing::debug!(error = %rejection.body_text(), "Rejected malformed run request");
        ExecError::InvalidRequest(rejection.body_text())
    })?;
    let result = state
        .orchestrator
        .submit(payload.into_execution_request())
        .await?;
    Ok(Json(result.into()))
}

async fn status_handler(State(state): State<ApiState>) -> Json<AdmissionStats> {
    Json(state.orchestrator.stats())
}
