use serde::{Deserialize, Serialize};

/// One external separator tool.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SeparatorKind {
    Spleeter,
    Demucs,
}

impl SeparatorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Spleeter => "spleeter",
            Self::Demucs => "demucs",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Spleeter => "Spleeter",
            Self::Demucs => "Demucs",
        }
    }
}

impl std::fmt::Display for SeparatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which separators a submission asked for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SeparatorChoice {
    Spleeter,
    Demucs,
    Both,
}

impl Default for SeparatorChoice {
    fn default() -> Self {
        Self::Both
    }
}

impl SeparatorChoice {
    pub fn kinds(self) -> Vec<SeparatorKind> {
        match self {
            Self::Spleeter => vec![SeparatorKind::Spleeter],
            Self::Demucs => vec![SeparatorKind::Demucs],
            Self::Both => vec![SeparatorKind::Spleeter, SeparatorKind::Demucs],
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Separate,
    Download,
}

/// One audio stream advertised by the container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioTrack {
    pub index: u32,
    pub language: Option<String>,
    pub codec: Option<String>,
}

/// Compact ffprobe snapshot cached on the job and echoed to the UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaProbe {
    pub duration_seconds: f64,
    pub is_video: bool,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    /// "WxH" when a video stream exists, otherwise None.
    pub resolution: Option<String>,
    pub audio_tracks: Vec<AudioTrack>,
}

/// Structured last error surfaced through job snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    pub kind: String,
    pub message: String,
}

/// Per-submission options for a separation job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SeparationOptions {
    /// Preferred audio track language (ISO code); first match wins, else the
    /// first audio stream.
    pub language: Option<String>,
    /// Keep the job temp directory after a terminal transition.
    pub keep_temp: bool,
}

/// One end-to-end unit of work tracked by id.
///
/// Mutated only by the worker that owns it or the cancel path; snapshots are
/// cloned out under the engine lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    /// Source path for separation jobs, URL for download jobs.
    pub input: String,
    pub model: SeparatorChoice,
    pub status: JobStatus,
    pub progress: f64,
    pub current_step: String,
    /// Milliseconds since the UNIX epoch.
    pub created_at: u64,
    pub result_files: Vec<String>,
    pub metadata: Option<MediaProbe>,
    pub error: Option<JobError>,
    #[serde(default)]
    pub options: SeparationOptions,
    /// Rolling window of step transitions and warnings, oldest first. The UI
    /// renders this as the job timeline.
    #[serde(default)]
    pub step_history: Vec<String>,
}

impl Job {
    pub fn new(
        id: String,
        kind: JobKind,
        input: String,
        model: SeparatorChoice,
        options: SeparationOptions,
        created_at: u64,
    ) -> Self {
        Self {
            id,
            kind,
            input,
            model,
            status: JobStatus::Queued,
            progress: 0.0,
            current_step: "Queued".to_string(),
            created_at,
            result_files: Vec::new(),
            metadata: None,
            error: None,
            options,
            step_history: Vec::new(),
        }
    }
}

/// Immutable view of a job, shaped for the polling UI. Field names are part
/// of the API contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: u8,
    pub current_step: String,
    pub result_files: Vec<String>,
    pub metadata: Option<MediaProbe>,
    pub error: Option<String>,
}

impl From<&Job> for JobSnapshot {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            status: job.status,
            progress: job.progress.clamp(0.0, 100.0).floor() as u8,
            current_step: job.current_step.clone(),
            result_files: job.result_files.clone(),
            metadata: job.metadata.clone(),
            error: job.error.as_ref().map(|e| e.message.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FormatKind {
    Audio,
    Video,
}

/// Parameters for a download submission, shared by `POST /download` and the
/// queue endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadRequest {
    pub url: String,
    /// The UI sends this as `format`.
    #[serde(alias = "format")]
    pub format_kind: FormatKind,
    pub format_id: Option<String>,
    pub subtitles: Option<String>,
    pub auto_separate: bool,
    pub title: Option<String>,
}

impl Default for DownloadRequest {
    fn default() -> Self {
        Self {
            url: String::new(),
            format_kind: FormatKind::Video,
            format_id: None,
            subtitles: None,
            auto_separate: false,
            title: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueueItemStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
}

/// One entry of the persistent download queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub queue_id: String,
    pub url: String,
    pub title: Option<String>,
    pub format_kind: FormatKind,
    /// Opaque yt-dlp format selector; passed through verbatim.
    pub format_id: Option<String>,
    /// Subtitle language code, "all", or None for no subtitles.
    pub subtitles: Option<String>,
    pub auto_separate: bool,
    pub status: QueueItemStatus,
    pub progress: f64,
    pub attempt_count: u32,
    /// Id of the download job once the dispatcher picked this item up.
    pub job_id: Option<String>,
    pub error: Option<String>,
    /// Direct `POST /download` submissions are dispatched even while the
    /// queue is stopped.
    #[serde(default)]
    pub immediate: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BatchItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// One scanned file inside a folder batch. Lives in memory for the batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub file_id: String,
    pub path: String,
    pub file_name: String,
    pub selected: bool,
    pub status: BatchItemStatus,
    pub progress: f64,
    pub child_job_id: Option<String>,
    pub metadata: Option<MediaProbe>,
}

/// Aggregate view of a folder batch for `GET /batch-status/{batch_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSnapshot {
    pub batch_id: String,
    pub total_files: usize,
    pub processed: usize,
    pub success: usize,
    pub failed: usize,
    pub files: Vec<BatchItem>,
}

/// One completed separation recorded in `library.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryEntry {
    pub task_id: String,
    pub result_files: Vec<String>,
    pub metadata: Option<MediaProbe>,
    pub created_at: u64,
}
