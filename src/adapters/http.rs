//! HTTP inbound adapter.
//!
//! | Method | Path | |
//! |--------|------|-|
//! | POST | `/api/videos/:video_id/transcode` | start a run, 202 |
//! | GET | `/api/videos/:video_id/manifest` | manifest URL or source fallback |
//! | GET | `/api/videos/:video_id/status` | job row |
//! | GET | `/api/videos/:video_id/events` | job transitions |
//! | GET | `/api/videos/:video_id/segments/:quality/:index` | segment bytes |
//! | DELETE | `/api/videos/:video_id` | purge |
//! | GET | `/chunks/...`, `/uploads/...` | static files, dot-prefixed entries hidden |

use crate::application::delivery::{DeliveryService, ManifestInfo};
use crate::application::orchestrator::OrchestratorService;
use crate::domain::jobs::{JobEvent, JobStatus, TranscodeJob};
use crate::error::Error;
use crate::ports::encoder::Encoder;
use crate::ports::repository::TranscodeRepository;
use crate::ports::source::SourceLocator;
use axum::{
    body::Bytes,
    extract::{Path, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

pub const SEGMENT_CONTENT_TYPE: &str = "video/mp2t";

#[derive(Debug, Serialize)]
pub struct ApiErrorResponse {
    pub code: String,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorResponse {
            code: self.code.to_string(),
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match &err {
            e if e.is_not_found() => ApiError::new(StatusCode::NOT_FOUND, "NOT_FOUND", err.to_string()),
            Error::InvalidVideoId(_) | Error::UnknownQuality(_) => {
                ApiError::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", err.to_string())
            }
            Error::Database(_) | Error::Migration(_) | Error::CorruptRecord(_) => {
                tracing::error!(error = %err, "database error");
                ApiError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "Database error occurred",
                )
            }
            _ => {
                tracing::error!(error = %err, "request failed");
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", err.to_string())
            }
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

pub struct AppState<E, R, L> {
    pub orchestrator: Arc<OrchestratorService<E, R>>,
    pub delivery: Arc<DeliveryService<R, L>>,
}

impl<E, R, L> Clone for AppState<E, R, L> {
    fn clone(&self) -> Self {
        Self {
            orchestrator: Arc::clone(&self.orchestrator),
            delivery: Arc::clone(&self.delivery),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct TranscodeRequest {
    /// Overrides the locator's default source.
    pub source_path: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TranscodeAccepted {
    pub video_id: String,
    pub run_token: i64,
    pub status: JobStatus,
}

/// Build the full application router. `chunks_root` and `upload_dir` are
/// served statically under `/chunks` and `/uploads`.
pub fn router<E, R, L>(
    state: AppState<E, R, L>,
    chunks_root: impl Into<PathBuf>,
    upload_dir: impl Into<PathBuf>,
) -> Router
where
    E: Encoder + 'static,
    R: TranscodeRepository + 'static,
    L: SourceLocator + 'static,
{
    let api = Router::new()
        .route("/videos/:video_id", delete(purge_video::<E, R, L>))
        .route("/videos/:video_id/transcode", post(request_transcode::<E, R, L>))
        .route("/videos/:video_id/manifest", get(get_manifest::<E, R, L>))
        .route("/videos/:video_id/status", get(get_status::<E, R, L>))
        .route("/videos/:video_id/events", get(list_events::<E, R, L>))
        .route(
            "/videos/:video_id/segments/:quality/:index",
            get(get_segment::<E, R, L>),
        );

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .nest("/api", api)
        .nest_service("/chunks", ServeDir::new(chunks_root.into()))
        .nest_service("/uploads", ServeDir::new(upload_dir.into()))
        .layer(middleware::from_fn(hide_dot_entries))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

const STATIC_PREFIXES: [&str; 2] = ["/chunks/", "/uploads/"];

/// 404 for static paths with a dot-prefixed segment, which covers the
/// in-progress `.staging` tree under the chunks root.
async fn hide_dot_entries(request: Request, next: Next) -> Response {
    let path = request.uri().path();
    let hidden = STATIC_PREFIXES.iter().any(|p| path.starts_with(p))
        && path.split('/').any(|segment| {
            segment.starts_with('.')
                || segment
                    .get(..3)
                    .is_some_and(|s| s.eq_ignore_ascii_case("%2e"))
        });
    if hidden {
        return StatusCode::NOT_FOUND.into_response();
    }
    next.run(request).await
}

/// An empty body means "use the default source"; anything else must be a
/// valid [`TranscodeRequest`].
fn parse_transcode_request(body: &[u8]) -> Result<TranscodeRequest, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(TranscodeRequest::default());
    }
    serde_json::from_slice(body).map_err(|e| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            "BAD_REQUEST",
            format!("invalid transcode request: {e}"),
        )
    })
}

async fn request_transcode<E, R, L>(
    State(state): State<AppState<E, R, L>>,
    Path(video_id): Path<String>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<TranscodeAccepted>)>
where
    E: Encoder + 'static,
    R: TranscodeRepository + 'static,
    L: SourceLocator + 'static,
{
    let request = parse_transcode_request(&body)?;
    let source = request
        .source_path
        .unwrap_or_else(|| state.delivery.locator().source_path(&video_id));

    let run_token = state
        .orchestrator
        .request_transcode(&video_id, &source)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(TranscodeAccepted {
            video_id,
            run_token,
            status: JobStatus::Pending,
        }),
    ))
}

async fn get_manifest<E, R, L>(
    State(state): State<AppState<E, R, L>>,
    Path(video_id): Path<String>,
) -> ApiResult<Json<ManifestInfo>>
where
    E: Encoder + 'static,
    R: TranscodeRepository + 'static,
    L: SourceLocator + 'static,
{
    Ok(Json(state.delivery.get_manifest(&video_id).await?))
}

async fn get_status<E, R, L>(
    State(state): State<AppState<E, R, L>>,
    Path(video_id): Path<String>,
) -> ApiResult<Json<TranscodeJob>>
where
    E: Encoder + 'static,
    R: TranscodeRepository + 'static,
    L: SourceLocator + 'static,
{
    Ok(Json(state.delivery.get_processing_status(&video_id).await?))
}

async fn list_events<E, R, L>(
    State(state): State<AppState<E, R, L>>,
    Path(video_id): Path<String>,
) -> ApiResult<Json<Vec<JobEvent>>>
where
    E: Encoder + 'static,
    R: TranscodeRepository + 'static,
    L: SourceLocator + 'static,
{
    Ok(Json(state.delivery.list_job_events(&video_id).await?))
}

async fn get_segment<E, R, L>(
    State(state): State<AppState<E, R, L>>,
    Path((video_id, quality, index)): Path<(String, String, u32)>,
) -> ApiResult<impl IntoResponse>
where
    E: Encoder + 'static,
    R: TranscodeRepository + 'static,
    L: SourceLocator + 'static,
{
    let data = state.delivery.get_segment(&video_id, &quality, index).await?;
    Ok(([(header::CONTENT_TYPE, SEGMENT_CONTENT_TYPE)], data))
}

async fn purge_video<E, R, L>(
    State(state): State<AppState<E, R, L>>,
    Path(video_id): Path<String>,
) -> ApiResult<StatusCode>
where
    E: Encoder + 'static,
    R: TranscodeRepository + 'static,
    L: SourceLocator + 'static,
{
    state.orchestrator.purge(&video_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
