//! HTTP boundary: a thin axum layer over the engine. Handlers never touch
//! the media toolchain directly; they submit work and read snapshots, with
//! the few blocking probes pushed onto the blocking pool.

mod download;
mod folder;
mod library;
mod separate;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::nomusic_core::{PipelineError, SeparationEngine};

pub fn router(engine: SeparationEngine) -> axum::Router {
    axum::Router::new()
        .route("/separate", post(separate::separate_upload))
        .route("/separate-file", post(separate::separate_file))
        .route("/status/{job_id}", get(separate::job_status))
        .route("/jobs", get(separate::list_jobs))
        .route("/folder/scan", post(folder::scan))
        .route("/folder-queue/process", post(folder::process))
        .route("/folder-queue/remove", post(folder::remove))
        .route("/batch-status/{batch_id}", get(folder::batch_status))
        .route("/download", post(download::start_download))
        .route("/download/cancel", post(download::cancel_download))
        .route("/yt-formats", post(download::yt_formats))
        .route("/queue/add", post(download::queue_add))
        .route("/queue/add-batch", post(download::queue_add_batch))
        .route("/queue/remove", post(download::queue_remove))
        .route("/queue/clear", post(download::queue_clear))
        .route("/queue/start", post(download::queue_start))
        .route("/queue/stop", post(download::queue_stop))
        .route("/queue", get(download::queue_snapshot))
        .route("/library", get(library::list_library))
        .route("/presets", get(library::get_presets))
        .route("/presets/select", post(library::select_preset))
        .route("/tools", get(library::tool_statuses))
        .layer(CorsLayer::permissive())
        // Media uploads dwarf the default body limit.
        .layer(axum::extract::DefaultBodyLimit::max(2 * 1024 * 1024 * 1024))
        .with_state(engine)
}

/// JSON error envelope. The UI keys off `error` and `kind`; the HTTP status
/// is advisory.
#[derive(Debug)]
pub(crate) struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    pub(crate) fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            kind: "not_found",
            message: message.into(),
        }
    }

    pub(crate) fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "invalid_input",
            message: message.into(),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        let status = match &err {
            PipelineError::InvalidInput(_) | PipelineError::QueueStateError(_) => {
                StatusCode::BAD_REQUEST
            }
            PipelineError::MissingDependency { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "kind": self.kind,
        }));
        (self.status, body).into_response()
    }
}

pub(crate) type ApiResult<T> = Result<T, ApiError>;

/// Run a blocking engine call on the blocking pool so the HTTP workers stay
/// responsive.
pub(crate) async fn blocking<T, F>(f: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, PipelineError> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(ApiError::from),
        Err(join_err) => Err(ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: "internal",
            message: format!("blocking task failed: {join_err}"),
        }),
    }
}
