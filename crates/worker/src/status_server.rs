//! Read-only HTTP status endpoint
//!
//! Exposes job records and worker stats for dashboards and polling clients.
//! Nothing here can create or modify jobs.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::job::{JobDescriptor, JobStatus};
use crate::stats::{SharedStats, WorkerStats};
use crate::store::{JobStore, StoreError};

/// Errors that can occur when running the status server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid bind address '{0}'")]
    InvalidAddress(String),

    #[error("Failed to bind to address {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// State shared with every handler.
#[derive(Clone)]
pub struct StatusState {
    pub store: JobStore,
    pub stats: SharedStats,
}

/// JSON error body with the given status.
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.to_string(),
        }
    }

    fn bad_request(message: &str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.to_string(),
        }
    }

    fn internal(message: String) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(_) => ApiError::not_found("Job not found"),
            other => ApiError::internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

async fn health() -> &'static str {
    "ok"
}

/// Handler for GET /stats
async fn get_stats(State(state): State<StatusState>) -> Json<WorkerStats> {
    let snapshot = state.stats.read().await.clone();
    Json(snapshot)
}

/// Runs a store read on the blocking pool.
async fn read_store<T, F>(read: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(read)
        .await
        .map_err(|e| ApiError::internal(format!("Store read task failed: {}", e)))?
        .map_err(ApiError::from)
}

/// Ids name files; anything path-like cannot be a job.
fn is_valid_job_id(id: &str) -> bool {
    !id.is_empty() && !id.contains(['/', '\\']) && !id.starts_with('.')
}

async fn load_job(state: &StatusState, id: String) -> Result<JobDescriptor, ApiError> {
    if !is_valid_job_id(&id) {
        return Err(ApiError::not_found("Job not found"));
    }
    let store = state.store.clone();
    read_store(move || store.load(&id)).await
}

/// Handler for GET /jobs/:id
async fn get_job(
    State(state): State<StatusState>,
    Path(id): Path<String>,
) -> Result<Json<JobDescriptor>, ApiError> {
    Ok(Json(load_job(&state, id).await?))
}

/// Handler for GET /jobs/:id/output
///
/// Streams the finished video. Only completed jobs have an output to serve.
async fn get_job_output(
    State(state): State<StatusState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let job = load_job(&state, id).await?;
    if job.status != JobStatus::Completed {
        return Err(ApiError::bad_request("Output not ready"));
    }

    let path = state.store.layout().resolve(&job.output_path);
    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            debug!(job_id = %job.id, path = %path.display(), error = %e, "Output file unavailable");
            return Err(ApiError::not_found("Output not found"));
        }
    };
    let size = file
        .metadata()
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?
        .len();

    let headers = [
        (header::CONTENT_TYPE, "video/mp4".to_string()),
        (header::CONTENT_LENGTH, size.to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"upscaled-{}.mp4\"", job.id),
        ),
    ];
    Ok((headers, Body::from_stream(ReaderStream::new(file))).into_response())
}

/// Handler for GET /latest
async fn get_latest(State(state): State<StatusState>) -> Result<Json<JobDescriptor>, ApiError> {
    let store = state.store.clone();
    read_store(move || store.latest())
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("No jobs found"))
}

/// Creates the axum Router with the status endpoints
pub fn create_status_router(state: StatusState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(get_stats))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/output", get(get_job_output))
        .route("/latest", get(get_latest))
        .with_state(state)
}

/// Serves the status endpoints on `bind` until `shutdown` changes.
///
/// # Arguments
/// * `bind` - Socket address such as `127.0.0.1:7879`
/// * `state` - Job store and stats to serve
/// * `shutdown` - Stops the server when it fires
pub async fn run_status_server(
    bind: &str,
    state: StatusState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ServerError> {
    let addr: SocketAddr = bind
        .parse()
        .map_err(|_| ServerError::InvalidAddress(bind.to_string()))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    info!(%addr, "Status server listening");

    axum::serve(listener, create_status_router(state))
        .with_graceful_shutdown(async move {
            if shutdown.changed().await.is_err() {
                warn!("Shutdown channel closed, stopping status server");
            }
        })
        .await?;

    Ok(())
}
