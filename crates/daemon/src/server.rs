//! HTTP front end for vidrelay
//!
//! Routes:
//! - `POST /` multipart upload (field `file`, `video/*` only)
//! - `PUT /callback/:job_id` finished artifact from the remote worker
//! - `POST /link` chat-side request for the upload link; rebinds the destination
//! - `GET /metrics` JSON [`MetricsSnapshot`]
//! - `GET /health`

use crate::delivery::DeliveryService;
use crate::dispatch::PendingRemote;
use crate::intake::{DestinationBinding, Intake, IntakeError};
use crate::jobs::Destination;
use crate::metrics::{timestamp_ms, MetricsSnapshot, SharedMetrics};
use crate::report::FailureReporter;
use crate::workspace::WorkspaceManager;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, FromRequest, Multipart, Path, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

/// Errors that can occur when running the HTTP server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

/// Request-level failures, rendered as `{"detail": ...}`
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Delivery failed: {0}")]
    BadGateway(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<IntakeError> for ApiError {
    fn from(e: IntakeError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<axum::extract::multipart::MultipartError> for ApiError {
    fn from(e: axum::extract::multipart::MultipartError) -> Self {
        ApiError::BadRequest(e.body_text())
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    detail: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(ErrorResponse { detail: self.to_string() })).into_response()
    }
}

/// Everything the handlers share
pub struct AppState {
    pub intake: Intake,
    pub binding: Arc<DestinationBinding>,
    pub pending: PendingRemote,
    pub delivery: DeliveryService,
    pub reporter: FailureReporter,
    pub workspaces: WorkspaceManager,
    pub metrics: SharedMetrics,
    /// Upload URL handed out by `/link`
    pub public_url: Option<String>,
    pub max_upload_bytes: usize,
}

pub type SharedState = Arc<AppState>;

/// Creates the axum Router with all endpoints
pub fn create_router(state: SharedState) -> Router {
    let body_limit = state.max_upload_bytes;
    Router::new()
        .route("/", post(upload))
        .route("/callback/:job_id", put(callback))
        .route("/link", post(link))
        .route("/metrics", get(get_metrics))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Serve `router` on `listener` until the process exits
pub async fn serve(listener: tokio::net::TcpListener, router: Router) -> Result<(), ServerError> {
    axum::serve(listener, router).await?;
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

/// Handler for POST /
async fn upload(State(state): State<SharedState>, mut multipart: Multipart) -> Result<Response, ApiError> {
    while let Some(mut field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }

        let is_video = field
            .content_type()
            .map(|ct| ct.starts_with("video/"))
            .unwrap_or(false);
        if !is_video {
            return Err(ApiError::BadRequest("only video uploads are accepted".into()));
        }

        let file_name = field.file_name().map(str::to_string);
        let job = state.intake.begin(file_name.as_deref()).await?;
        {
            let mut file = tokio::fs::File::create(job.source_path())
                .await
                .map_err(IntakeError::from)?;
            while let Some(chunk) = field.chunk().await? {
                file.write_all(&chunk).await.map_err(IntakeError::from)?;
            }
            file.flush().await.map_err(IntakeError::from)?;
        }

        let admission = state.intake.finish(job).await;
        tracing::info!(
            job_id = %admission.job_id,
            dispatched = ?admission.dispatched,
            queue_depth = admission.queue_depth,
            "upload accepted"
        );
        let body = format!(
            "Accepted (queue depth: {}). The result will be posted to chat when ready.",
            admission.queue_depth
        );
        return Ok((StatusCode::ACCEPTED, body).into_response());
    }

    Err(ApiError::BadRequest("missing multipart field `file`".into()))
}

/// Handler for PUT /callback/:job_id
///
/// Accepts either a raw body or a multipart body with a `file` field.
async fn callback(
    State(state): State<SharedState>,
    Path(job_id): Path<String>,
    request: Request,
) -> Result<&'static str, ApiError> {
    let Some(pending) = state.pending.take(&job_id).await else {
        return Err(ApiError::NotFound(format!("unknown job {}", job_id)));
    };

    let artifact = match read_artifact(request, state.max_upload_bytes).await {
        Ok(bytes) => bytes,
        Err(e) => {
            // Keep the entry so the worker can retry its callback
            state.pending.insert(job_id, pending.destination).await;
            return Err(e);
        }
    };
    tracing::info!(
        job_id = %job_id,
        bytes = artifact.len(),
        waited_ms = pending.dispatched_at.elapsed().as_millis() as u64,
        "remote artifact received"
    );

    let result = match state.workspaces.acquire(&job_id) {
        Err(e) => Err(ApiError::Internal(format!("workspace unavailable: {}", e))),
        Ok(mut workspace) => {
            let path = workspace.output_path();
            let result = match tokio::fs::write(&path, &artifact).await {
                Err(e) => Err(ApiError::Internal(format!("failed to store artifact: {}", e))),
                Ok(()) => state
                    .delivery
                    .deliver(pending.destination.as_ref(), &path)
                    .await
                    .map_err(|e| ApiError::BadGateway(e.to_string())),
            };
            state.workspaces.release(&mut workspace);
            result
        }
    };

    match result {
        Ok(_) => {
            let mut metrics = state.metrics.write().await;
            metrics.completed_jobs += 1;
            metrics.total_bytes_delivered += artifact.len() as u64;
            Ok("ok")
        }
        Err(e) => {
            state.reporter.report(&job_id, &e, None).await;
            state.metrics.write().await.failed_jobs += 1;
            Err(e)
        }
    }
}

async fn read_artifact(request: Request, limit: usize) -> Result<Bytes, ApiError> {
    let is_multipart = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with("multipart/form-data"))
        .unwrap_or(false);

    if !is_multipart {
        return axum::body::to_bytes(request.into_body(), limit)
            .await
            .map_err(|e| ApiError::BadRequest(format!("failed to read body: {}", e)));
    }

    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|e| ApiError::BadRequest(e.body_text()))?;
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some("file") {
            return Ok(field.bytes().await?);
        }
    }
    Err(ApiError::BadRequest("missing multipart field `file`".into()))
}

/// Chat channel ids arrive as JSON numbers or, from JavaScript clients, as strings
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ChannelId {
    Number(u64),
    Text(String),
}

#[derive(Debug, Deserialize)]
pub struct LinkRequest {
    channel_id: ChannelId,
    #[serde(default)]
    user_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct LinkResponse {
    pub upload_url: Option<String>,
    pub queue_depth: usize,
}

/// Handler for POST /link
async fn link(
    State(state): State<SharedState>,
    Json(request): Json<LinkRequest>,
) -> Result<Json<LinkResponse>, ApiError> {
    let channel_id = match request.channel_id {
        ChannelId::Number(id) => id,
        ChannelId::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| ApiError::BadRequest(format!("invalid channel id `{}`", text)))?,
    };

    state
        .binding
        .bind(Destination {
            channel_id,
            user_label: request.user_name.filter(|name| !name.trim().is_empty()),
        })
        .await;

    Ok(Json(LinkResponse {
        upload_url: state.public_url.clone(),
        queue_depth: state.intake.arbiter().queue().depth(),
    }))
}

/// Handler for GET /metrics endpoint
/// Returns the current MetricsSnapshot as JSON
async fn get_metrics(State(state): State<SharedState>) -> Json<MetricsSnapshot> {
    let mut snapshot = state.metrics.read().await.clone();
    snapshot.queue_len = state.intake.arbiter().queue().depth();
    if snapshot.timestamp_unix_ms == 0 {
        snapshot.timestamp_unix_ms = timestamp_ms();
    }
    Json(snapshot)
}
