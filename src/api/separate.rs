//! Separation submission and job polling endpoints.

use axum::Json;
use axum::extract::{Multipart, Path, State};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{ApiError, ApiResult, blocking};
use crate::nomusic_core::{
    JobSnapshot, MediaProbe, SeparationEngine, SeparationOptions, SeparatorChoice,
};

#[derive(Debug, Deserialize)]
pub(crate) struct SeparateFileRequest {
    file_path: String,
    #[serde(default)]
    model: SeparatorChoice,
    #[serde(default)]
    keep_temp: bool,
    #[serde(default)]
    language: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct SubmitResponse {
    job_id: String,
    metadata: Option<MediaProbe>,
}

/// `POST /separate`: multipart upload (`file` + `model`). The upload is
/// stored next to the downloads and queued like any local file.
pub(crate) async fn separate_upload(
    State(engine): State<SeparationEngine>,
    mut multipart: Multipart,
) -> ApiResult<Json<SubmitResponse>> {
    let mut file_name: Option<String> = None;
    let mut file_bytes: Option<Vec<u8>> = None;
    let mut model = SeparatorChoice::Both;
    let mut keep_temp = false;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(format!("malformed multipart body: {err}")))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                file_name = field.file_name().map(sanitize_file_name);
                let bytes = field.bytes().await.map_err(|err| {
                    ApiError::bad_request(format!("failed to read upload: {err}"))
                })?;
                file_bytes = Some(bytes.to_vec());
            }
            Some("model") => {
                let text = field.text().await.unwrap_or_default();
                model = parse_model(&text)?;
            }
            Some("keep_temp") => {
                let text = field.text().await.unwrap_or_default();
                keep_temp = text == "true" || text == "1";
            }
            _ => {}
        }
    }

    let bytes = file_bytes.ok_or_else(|| ApiError::bad_request("missing `file` field"))?;
    if bytes.is_empty() {
        return Err(ApiError::bad_request("uploaded file is empty"));
    }
    let name = file_name.unwrap_or_else(|| "upload.bin".to_string());
    let target = engine.data_dirs().download_dir().join(&name);
    tokio::fs::write(&target, &bytes)
        .await
        .map_err(|err| ApiError::bad_request(format!("failed to store upload: {err}")))?;

    submit(engine, target.to_string_lossy().into_owned(), model, SeparationOptions {
        language: None,
        keep_temp,
    })
    .await
}

/// `POST /separate-file`: separate a file already on disk.
pub(crate) async fn separate_file(
    State(engine): State<SeparationEngine>,
    Json(request): Json<SeparateFileRequest>,
) -> ApiResult<Json<SubmitResponse>> {
    submit(
        engine,
        request.file_path,
        request.model,
        SeparationOptions {
            language: request.language,
            keep_temp: request.keep_temp,
        },
    )
    .await
}

async fn submit(
    engine: SeparationEngine,
    path: String,
    model: SeparatorChoice,
    options: SeparationOptions,
) -> ApiResult<Json<SubmitResponse>> {
    blocking(move || {
        let job_id = engine.submit_separation(&path, model, options)?;
        // Best-effort immediate metadata; the job re-probes authoritatively.
        let metadata = engine.probe_media(&path).ok();
        Ok(Json(SubmitResponse { job_id, metadata }))
    })
    .await
}

/// `GET /status/{job_id}`.
pub(crate) async fn job_status(
    State(engine): State<SeparationEngine>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobSnapshot>> {
    engine
        .status(&job_id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("no job {job_id}")))
}

/// `GET /jobs`: all job snapshots, oldest first.
pub(crate) async fn list_jobs(State(engine): State<SeparationEngine>) -> Json<Value> {
    Json(json!({ "jobs": engine.list(None) }))
}

fn parse_model(text: &str) -> ApiResult<SeparatorChoice> {
    match text {
        "" | "both" => Ok(SeparatorChoice::Both),
        "spleeter" => Ok(SeparatorChoice::Spleeter),
        "demucs" => Ok(SeparatorChoice::Demucs),
        other => Err(ApiError::bad_request(format!("unknown model {other:?}"))),
    }
}

/// Uploads keep only their terminal file name; anything path-like is
/// stripped.
fn sanitize_file_name(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(name)
        .trim()
        .to_string();
    if base.is_empty() || base == "." || base == ".." {
        "upload.bin".to_string()
    } else {
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_strings_map_to_separator_choices() {
        assert_eq!(parse_model("").unwrap(), SeparatorChoice::Both);
        assert_eq!(parse_model("both").unwrap(), SeparatorChoice::Both);
        assert_eq!(parse_model("spleeter").unwrap(), SeparatorChoice::Spleeter);
        assert_eq!(parse_model("demucs").unwrap(), SeparatorChoice::Demucs);
        assert!(parse_model("vocalsplit-9000").is_err());
    }

    #[test]
    fn upload_names_are_sanitized() {
        assert_eq!(sanitize_file_name("clip.mp4"), "clip.mp4");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\Videos\\song.mp4"), "song.mp4");
        assert_eq!(sanitize_file_name(""), "upload.bin");
        assert_eq!(sanitize_file_name(".."), "upload.bin");
    }
}
