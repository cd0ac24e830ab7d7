//! HTTP and WebSocket transport over [`JobService`].

use std::borrow::Cow;
use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::error::OrchestratorError;
use crate::request::JobRequest;
use crate::results::JobResults;
use crate::service::{JobService, JobSummary, DEFAULT_LIST_LIMIT};

#[derive(Clone)]
pub struct ApiState {
    pub service: JobService,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobActionResponse {
    pub status: String,
    pub job_id: String,
}

#[derive(Debug, Deserialize)]
struct ListParams {
    limit: Option<usize>,
}

/// Error body: `{"detail": "..."}`.
#[derive(Debug, Serialize)]
struct ErrorBody {
    detail: String,
}

/// [`OrchestratorError`] rendered as an HTTP response.
pub struct ApiError(OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            OrchestratorError::Validation(_) => StatusCode::BAD_REQUEST,
            OrchestratorError::JobNotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::JobRunning(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let detail = match &self.0 {
            OrchestratorError::JobNotFound(_) => "Job not found".to_string(),
            other => other.to_string(),
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }
        (status, Json(ErrorBody { detail })).into_response()
    }
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/jobs", post(submit_job).get(list_jobs))
        .route("/jobs/:id", axum::routing::delete(delete_job))
        .route("/jobs/:id/status", get(job_status))
        .route("/jobs/:id/results", get(job_results))
        .route("/jobs/:id/stop", post(stop_job))
        .route("/jobs/:id/stream", get(stream_job_log))
        .layer(cors)
        .with_state(state)
}

/// Serve the API until `shutdown` is cancelled.
pub async fn run_api(
    addr: SocketAddr,
    service: JobService,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let app = router(ApiState { service });
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "Starting API server");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    tracing::info!("API server stopped");
    Ok(())
}

async fn submit_job(
    State(state): State<ApiState>,
    Json(request): Json<JobRequest>,
) -> Result<Json<SubmitResponse>, ApiError> {
    let id = state.service.submit(&request).await?;
    Ok(Json(SubmitResponse { id }))
}

async fn list_jobs(
    State(state): State<ApiState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<JobSummary>>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    Ok(Json(state.service.list_async(limit).await?))
}

async fn job_status(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<JobSummary>, ApiError> {
    Ok(Json(state.service.status_async(&id).await?))
}

async fn job_results(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<JobResults>, ApiError> {
    Ok(Json(state.service.results_async(&id).await?))
}

async fn delete_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<JobActionResponse>, ApiError> {
    state.service.delete_async(&id).await?;
    Ok(Json(JobActionResponse {
        status: "deleted".to_string(),
        job_id: id,
    }))
}

async fn stop_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<JobActionResponse>, ApiError> {
    let outcome = state.service.stop_async(&id).await?;
    Ok(Json(JobActionResponse {
        status: outcome.as_str().to_string(),
        job_id: id,
    }))
}

async fn stream_job_log(
    ws: WebSocketUpgrade,
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| forward_log(socket, state.service, id))
}

async fn forward_log(mut socket: WebSocket, service: JobService, job_id: String) {
    let mut chunks = match service.subscribe_log_async(&job_id).await {
        Ok(chunks) => chunks,
        Err(e) => {
            let detail = if e.is_not_found() {
                "Job not found".to_string()
            } else {
                tracing::warn!(job_id = %job_id, error = %e, "Cannot stream job log");
                e.to_string()
            };
            let _ = socket.send(Message::Text(detail)).await;
            close(&mut socket, close_code::POLICY, "").await;
            return;
        }
    };

    while let Some(chunk) = chunks.next().await {
        if socket.send(Message::Text(chunk)).await.is_err() {
            tracing::debug!(job_id = %job_id, "Log observer disconnected");
            return;
        }
    }
    close(&mut socket, close_code::NORMAL, "job finished").await;
}

async fn close(socket: &mut WebSocket, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: Cow::Borrowed(reason),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}
