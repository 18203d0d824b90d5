//! Download and download-queue endpoints.

use axum::Json;
use axum::extract::State;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{ApiError, ApiResult, blocking};
use crate::nomusic_core::engine::{DownloadQueueSnapshot, RemoteProbe};
use crate::nomusic_core::{DownloadRequest, FormatKind, SeparationEngine};

/// `POST /download`: start a download immediately.
pub(crate) async fn start_download(
    State(engine): State<SeparationEngine>,
    Json(request): Json<DownloadRequest>,
) -> ApiResult<Json<Value>> {
    let job_id = engine.submit_download(request)?;
    Ok(Json(json!({ "job_id": job_id })))
}

#[derive(Debug, Deserialize)]
pub(crate) struct CancelRequest {
    job_id: String,
}

/// `POST /download/cancel`, which doubles as the cancel path for separation
/// jobs.
pub(crate) async fn cancel_download(
    State(engine): State<SeparationEngine>,
    Json(request): Json<CancelRequest>,
) -> ApiResult<Json<Value>> {
    use crate::nomusic_core::CancelOutcome;
    let status = match engine.cancel(&request.job_id) {
        CancelOutcome::Accepted => "accepted",
        CancelOutcome::AlreadyTerminal => "already_terminal",
        CancelOutcome::NotFound => {
            return Err(ApiError::not_found(format!("no job {}", request.job_id)));
        }
    };
    Ok(Json(json!({ "status": status })))
}

#[derive(Debug, Deserialize)]
pub(crate) struct YtFormatsRequest {
    url: String,
    #[serde(default)]
    check_playlist: bool,
}

/// `POST /yt-formats`: probe a remote URL (single video or playlist).
pub(crate) async fn yt_formats(
    State(engine): State<SeparationEngine>,
    Json(request): Json<YtFormatsRequest>,
) -> ApiResult<Json<RemoteProbe>> {
    blocking(move || engine.yt_formats(&request.url, request.check_playlist).map(Json)).await
}

/// `POST /queue/add`.
pub(crate) async fn queue_add(
    State(engine): State<SeparationEngine>,
    Json(request): Json<DownloadRequest>,
) -> ApiResult<Json<Value>> {
    let queue_id = engine.queue_add(request)?;
    Ok(Json(json!({ "queue_id": queue_id })))
}

#[derive(Debug, Deserialize)]
pub(crate) struct QueueAddBatchRequest {
    videos: Vec<BatchVideo>,
    #[serde(default, alias = "format")]
    format_kind: Option<FormatKind>,
    #[serde(default)]
    subtitles: Option<String>,
    #[serde(default)]
    auto_separate: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct BatchVideo {
    url: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    format_id: Option<String>,
}

/// `POST /queue/add-batch`: enqueue several videos (typically a playlist)
/// with shared options.
pub(crate) async fn queue_add_batch(
    State(engine): State<SeparationEngine>,
    Json(request): Json<QueueAddBatchRequest>,
) -> ApiResult<Json<Value>> {
    let format_kind = request.format_kind.unwrap_or(FormatKind::Video);
    let requests: Vec<DownloadRequest> = request
        .videos
        .into_iter()
        .map(|video| DownloadRequest {
            url: video.url,
            title: video.title,
            format_id: video.format_id,
            format_kind,
            subtitles: request.subtitles.clone(),
            auto_separate: request.auto_separate,
        })
        .collect();
    let added = engine.queue_add_batch(requests)?;
    Ok(Json(json!({ "added": added })))
}

#[derive(Debug, Deserialize)]
pub(crate) struct QueueRemoveRequest {
    queue_id: String,
}

/// `POST /queue/remove`.
pub(crate) async fn queue_remove(
    State(engine): State<SeparationEngine>,
    Json(request): Json<QueueRemoveRequest>,
) -> ApiResult<Json<DownloadQueueSnapshot>> {
    engine
        .queue_remove(&request.queue_id)
        .map(Json)
        .map_err(ApiError::from)
}

/// `POST /queue/clear`: drop completed and failed items.
pub(crate) async fn queue_clear(State(engine): State<SeparationEngine>) -> Json<DownloadQueueSnapshot> {
    Json(engine.queue_clear_done())
}

/// `POST /queue/start`.
pub(crate) async fn queue_start(State(engine): State<SeparationEngine>) -> Json<DownloadQueueSnapshot> {
    Json(engine.queue_start())
}

/// `POST /queue/stop`: stop picking new items; the in-flight download is
/// not cancelled.
pub(crate) async fn queue_stop(State(engine): State<SeparationEngine>) -> Json<DownloadQueueSnapshot> {
    Json(engine.queue_stop())
}

/// `GET /queue`.
pub(crate) async fn queue_snapshot(
    State(engine): State<SeparationEngine>,
) -> Json<DownloadQueueSnapshot> {
    Json(engine.queue_snapshot())
}
