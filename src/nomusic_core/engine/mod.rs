//! The separation engine: job orchestration, the two queues, folder batches
//! and persistent state, all behind a cloneable facade.

mod align;
mod batch;
mod download;
mod extract;
mod ffmpeg;
mod job_runner;
mod mix;
mod normalize;
mod remux;
mod separator;
mod state;
mod state_persist;
#[cfg(test)]
mod tests;
mod wav;
mod worker;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use uuid::Uuid;

pub use download::{PlaylistEntry, RemoteFormat, RemoteProbe, RemoteVideoInfo};
pub use state::DownloadQueueSnapshot;
pub use worker::CancelOutcome;

use crate::nomusic_core::domain::{
    BatchItem, BatchSnapshot, DownloadRequest, JobKind, JobSnapshot, LibraryEntry, QueueItem,
    QueueItemStatus, SeparationOptions, SeparatorChoice,
};
use crate::nomusic_core::error::{PipelineError, PipelineResult};
use crate::nomusic_core::paths::DataDirs;
use crate::nomusic_core::settings::{self, AppSettings, Preset};
use crate::nomusic_core::tools::{ToolKind, ToolLocator, ToolStatus};
use crate::sync_ext::MutexExt;
use state::Inner;

/// The engine facade. Cheap to clone; all state lives behind the shared
/// inner mutex.
#[derive(Clone)]
pub struct SeparationEngine {
    pub(crate) inner: Arc<Inner>,
}

impl SeparationEngine {
    /// Create an engine rooted at the given data directory: loads settings
    /// and the library, rehydrates the persistent download queue, and spawns
    /// the worker pools.
    pub fn new(dirs: DataDirs) -> Result<Self> {
        dirs.ensure_layout()?;
        let settings = settings::load_settings(&dirs.presets_path());
        let auto_download = std::env::var_os("NOMUSIC_NO_TOOL_DOWNLOAD").is_none();
        let tools = ToolLocator::new(dirs.tools_dir(), auto_download);

        let inner = Arc::new(Inner::new(settings, dirs, tools));
        state_persist::load_library(&inner);
        state_persist::rehydrate_download_queue(&inner);
        worker::spawn_workers(&inner);
        Ok(Self { inner })
    }

    #[cfg(test)]
    pub(crate) fn new_for_tests(root: &Path) -> Self {
        let dirs = DataDirs::new(root);
        dirs.ensure_layout().expect("test data layout");
        let tools = ToolLocator::new(dirs.tools_dir(), false);
        let inner = Arc::new(Inner::new(AppSettings::default(), dirs, tools));
        state_persist::load_library(&inner);
        state_persist::rehydrate_download_queue(&inner);
        worker::spawn_workers(&inner);
        Self { inner }
    }

    // ---- separation jobs ----------------------------------------------

    /// Queue a separation job for an existing file. Non-blocking; the job id
    /// is immediately pollable via `status`.
    pub fn submit_separation(
        &self,
        input_path: &str,
        model: SeparatorChoice,
        options: SeparationOptions,
    ) -> PipelineResult<String> {
        let path = Path::new(input_path);
        if !path.is_file() {
            return Err(PipelineError::InvalidInput(format!(
                "{input_path} is not a readable file"
            )));
        }
        let job = worker::enqueue_separation(&self.inner, input_path.to_string(), model, options);
        Ok(job.id)
    }

    pub fn status(&self, job_id: &str) -> Option<JobSnapshot> {
        state::job_snapshot(&self.inner, job_id)
    }

    /// Probe a local file. Used by the submission endpoints to echo metadata
    /// back immediately; the pipeline re-probes as its first phase.
    pub fn probe_media(&self, path: &str) -> PipelineResult<crate::nomusic_core::MediaProbe> {
        let ffprobe = self.inner.tools.locate(ToolKind::Ffprobe)?;
        crate::nomusic_core::probe::probe(&ffprobe, Path::new(path))
    }

    pub fn list(&self, kind: Option<JobKind>) -> Vec<JobSnapshot> {
        state::list_job_snapshots(&self.inner, kind)
    }

    pub fn cancel(&self, job_id: &str) -> CancelOutcome {
        worker::cancel_job(&self.inner, job_id)
    }

    // ---- direct downloads ---------------------------------------------

    /// Start a download right away (bypasses the queue start/stop toggle but
    /// shares the single download worker). Returns the job id.
    pub fn submit_download(&self, request: DownloadRequest) -> PipelineResult<String> {
        let item = self.queue_item_from_request(request, true)?;
        Ok(worker::enqueue_download_item(&self.inner, item))
    }

    pub fn yt_formats(&self, url: &str, check_playlist: bool) -> PipelineResult<RemoteProbe> {
        let ytdlp = self.inner.tools.locate(ToolKind::YtDlp)?;
        download::probe_remote(&ytdlp, url, check_playlist)
    }

    // ---- download queue -----------------------------------------------

    pub fn queue_add(&self, request: DownloadRequest) -> PipelineResult<String> {
        let item = self.queue_item_from_request(request, false)?;
        let queue_id = item.queue_id.clone();
        worker::enqueue_download_item(&self.inner, item);
        Ok(queue_id)
    }

    pub fn queue_add_batch(&self, requests: Vec<DownloadRequest>) -> PipelineResult<usize> {
        let mut added = 0usize;
        for request in requests {
            self.queue_add(request)?;
            added += 1;
        }
        Ok(added)
    }

    fn queue_item_from_request(
        &self,
        request: DownloadRequest,
        immediate: bool,
    ) -> PipelineResult<QueueItem> {
        let url = request.url.trim().to_string();
        if url.is_empty() {
            return Err(PipelineError::InvalidInput("url must not be empty".into()));
        }
        Ok(QueueItem {
            queue_id: Uuid::new_v4().to_string(),
            url,
            title: request.title,
            format_kind: request.format_kind,
            format_id: request.format_id,
            subtitles: request.subtitles,
            auto_separate: request.auto_separate,
            status: QueueItemStatus::Pending,
            progress: 0.0,
            attempt_count: 0,
            job_id: None,
            error: None,
            immediate,
        })
    }

    /// Only Pending items are removable.
    pub fn queue_remove(&self, queue_id: &str) -> PipelineResult<DownloadQueueSnapshot> {
        {
            let mut state = self.inner.state.lock_unpoisoned();
            let Some(index) = state
                .download_queue
                .iter()
                .position(|i| i.queue_id == queue_id)
            else {
                return Err(PipelineError::QueueStateError(format!(
                    "no queue item {queue_id}"
                )));
            };
            if state.download_queue[index].status != QueueItemStatus::Pending {
                return Err(PipelineError::QueueStateError(format!(
                    "queue item {queue_id} is not pending"
                )));
            }
            state.download_queue.remove(index);
        }
        state_persist::persist_download_queue(&self.inner);
        Ok(self.queue_snapshot())
    }

    /// Drop Completed and Failed items.
    pub fn queue_clear_done(&self) -> DownloadQueueSnapshot {
        {
            let mut state = self.inner.state.lock_unpoisoned();
            state.download_queue.retain(|i| {
                !matches!(
                    i.status,
                    QueueItemStatus::Completed | QueueItemStatus::Failed
                )
            });
        }
        state_persist::persist_download_queue(&self.inner);
        self.queue_snapshot()
    }

    pub fn queue_start(&self) -> DownloadQueueSnapshot {
        {
            let mut state = self.inner.state.lock_unpoisoned();
            state.download_running = true;
        }
        state_persist::persist_download_queue(&self.inner);
        self.inner.cv.notify_all();
        self.queue_snapshot()
    }

    /// Stop does not cancel the in-flight item; it only prevents the next
    /// pick.
    pub fn queue_stop(&self) -> DownloadQueueSnapshot {
        {
            let mut state = self.inner.state.lock_unpoisoned();
            state.download_running = false;
        }
        state_persist::persist_download_queue(&self.inner);
        self.queue_snapshot()
    }

    pub fn queue_snapshot(&self) -> DownloadQueueSnapshot {
        state::download_queue_snapshot(&self.inner)
    }

    // ---- folder batches -----------------------------------------------

    pub fn folder_scan(&self, folder: &str) -> PipelineResult<(String, Vec<BatchItem>)> {
        batch::scan_folder(&self.inner, Path::new(folder))
    }

    pub fn folder_process(
        &self,
        batch_id: &str,
        model: SeparatorChoice,
    ) -> PipelineResult<Vec<BatchItem>> {
        batch::process_batch(&self.inner, batch_id, model)
    }

    pub fn folder_remove(&self, batch_id: &str, file_id: &str) -> PipelineResult<Vec<BatchItem>> {
        batch::remove_batch_item(&self.inner, batch_id, file_id)
    }

    pub fn batch_status(&self, batch_id: &str) -> Option<BatchSnapshot> {
        state::batch_snapshot(&self.inner, batch_id)
    }

    // ---- library, presets, tools --------------------------------------

    pub fn library(&self) -> Vec<LibraryEntry> {
        let state = self.inner.state.lock_unpoisoned();
        state.library.clone()
    }

    pub fn settings(&self) -> AppSettings {
        let state = self.inner.state.lock_unpoisoned();
        state.settings.clone()
    }

    pub fn active_preset(&self) -> Preset {
        let state = self.inner.state.lock_unpoisoned();
        state.settings.active_preset()
    }

    /// Select a preset by name and persist the choice. The single-writer
    /// path for process-wide config.
    pub fn select_preset(&self, name: &str) -> PipelineResult<AppSettings> {
        let snapshot = {
            let mut state = self.inner.state.lock_unpoisoned();
            if !state.settings.presets.contains_key(name) {
                return Err(PipelineError::QueueStateError(format!(
                    "unknown preset {name}"
                )));
            }
            state.settings.current_preset = name.to_string();
            state.settings.clone()
        };
        if let Err(err) = settings::save_settings(&self.inner.dirs.presets_path(), &snapshot) {
            tracing::warn!("failed to persist preset selection: {err:#}");
        }
        Ok(snapshot)
    }

    pub fn tool_statuses(&self) -> Vec<ToolStatus> {
        self.inner.tools.statuses()
    }

    pub fn data_dirs(&self) -> &DataDirs {
        &self.inner.dirs
    }

    /// Flush the download queue file; used by graceful shutdown.
    pub fn persist_queue_now(&self) {
        state_persist::persist_download_queue(&self.inner);
    }
}
