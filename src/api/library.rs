//! Library, preset and tool-status endpoints.

use axum::Json;
use axum::extract::State;
use serde::Deserialize;
use serde_json::{Value, json};

use super::ApiResult;
use crate::nomusic_core::{LibraryEntry, SeparationEngine, ToolStatus};

/// `GET /library`: completed separations, persisted across restarts.
pub(crate) async fn list_library(State(engine): State<SeparationEngine>) -> Json<Vec<LibraryEntry>> {
    Json(engine.library())
}

/// `GET /presets`.
pub(crate) async fn get_presets(State(engine): State<SeparationEngine>) -> Json<Value> {
    let settings = engine.settings();
    Json(json!({
        "presets": settings.presets,
        "current_preset": settings.current_preset,
    }))
}

#[derive(Debug, Deserialize)]
pub(crate) struct SelectPresetRequest {
    name: String,
}

/// `POST /presets/select`.
pub(crate) async fn select_preset(
    State(engine): State<SeparationEngine>,
    Json(request): Json<SelectPresetRequest>,
) -> ApiResult<Json<Value>> {
    let settings = engine.select_preset(&request.name)?;
    Ok(Json(json!({
        "presets": settings.presets,
        "current_preset": settings.current_preset,
    })))
}

/// `GET /tools`: resolved paths of the external toolchain, for diagnostics.
pub(crate) async fn tool_statuses(State(engine): State<SeparationEngine>) -> Json<Vec<ToolStatus>> {
    Json(engine.tool_statuses())
}
