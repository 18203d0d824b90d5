//! Folder batch endpoints.

use axum::Json;
use axum::extract::{Path, State};
use serde::Deserialize;
use serde_json::{Value, json};

use super::{ApiError, ApiResult, blocking};
use crate::nomusic_core::{BatchSnapshot, SeparationEngine, SeparatorChoice};

#[derive(Debug, Deserialize)]
pub(crate) struct ScanRequest {
    folder_path: String,
}

/// `POST /folder/scan`: list processable files in a folder (non-recursive).
/// Probing every file is subprocess work, so this runs on the blocking pool.
pub(crate) async fn scan(
    State(engine): State<SeparationEngine>,
    Json(request): Json<ScanRequest>,
) -> ApiResult<Json<Value>> {
    blocking(move || {
        let (queue_id, files) = engine.folder_scan(&request.folder_path)?;
        Ok(Json(json!({ "queue_id": queue_id, "files": files })))
    })
    .await
}

#[derive(Debug, Deserialize)]
pub(crate) struct ProcessRequest {
    queue_id: String,
    #[serde(default)]
    model: SeparatorChoice,
}

/// `POST /folder-queue/process`: launch one separation job per selected
/// file.
pub(crate) async fn process(
    State(engine): State<SeparationEngine>,
    Json(request): Json<ProcessRequest>,
) -> ApiResult<Json<Value>> {
    let files = engine.folder_process(&request.queue_id, request.model)?;
    Ok(Json(json!({ "batch_id": request.queue_id, "files": files })))
}

#[derive(Debug, Deserialize)]
pub(crate) struct RemoveRequest {
    queue_id: String,
    file_id: String,
}

/// `POST /folder-queue/remove`: drop an unprocessed item.
pub(crate) async fn remove(
    State(engine): State<SeparationEngine>,
    Json(request): Json<RemoveRequest>,
) -> ApiResult<Json<Value>> {
    let files = engine.folder_remove(&request.queue_id, &request.file_id)?;
    Ok(Json(json!({ "files": files })))
}

/// `GET /batch-status/{batch_id}`.
pub(crate) async fn batch_status(
    State(engine): State<SeparationEngine>,
    Path(batch_id): Path<String>,
) -> ApiResult<Json<BatchSnapshot>> {
    engine
        .batch_status(&batch_id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("no batch {batch_id}")))
}
