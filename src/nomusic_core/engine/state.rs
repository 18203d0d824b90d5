//! Shared engine state: the job table, the two queues, folder batches and
//! the library, all behind one mutex with a condvar for worker wakeups.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Condvar, Mutex};

use serde::{Deserialize, Serialize};

use crate::nomusic_core::domain::{
    BatchItem, BatchItemStatus, BatchSnapshot, Job, JobError, JobKind, JobSnapshot, JobStatus,
    LibraryEntry, QueueItem,
};
use crate::nomusic_core::error::PipelineError;
use crate::nomusic_core::paths::DataDirs;
use crate::nomusic_core::settings::AppSettings;
use crate::nomusic_core::tools::ToolLocator;
use crate::sync_ext::MutexExt;

/// Keep job timelines bounded; the UI only shows the tail anyway.
const MAX_STEP_HISTORY: usize = 200;

/// One scanned folder; becomes a running batch once processed.
#[derive(Debug, Clone)]
pub(crate) struct Batch {
    pub batch_id: String,
    pub items: Vec<BatchItem>,
    pub started: bool,
}

/// Snapshot shape for `GET /queue`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadQueueSnapshot {
    pub queue: Vec<QueueItem>,
    /// True while the dispatcher has an item in flight.
    pub processing: bool,
    /// True when the dispatcher is started.
    pub running: bool,
}

pub(crate) struct EngineState {
    pub settings: AppSettings,
    pub jobs: HashMap<String, Job>,
    /// Separation jobs waiting for a worker, FIFO.
    pub sep_queue: VecDeque<String>,
    pub active_jobs: HashSet<String>,
    pub cancelled_jobs: HashSet<String>,
    /// Download queue in FIFO order, including terminal items until cleared.
    pub download_queue: Vec<QueueItem>,
    pub download_running: bool,
    /// queue_id of the item currently being downloaded.
    pub download_active: Option<String>,
    pub batches: HashMap<String, Batch>,
    pub library: Vec<LibraryEntry>,
    pub spawned_sep_workers: usize,
    pub download_dispatcher_spawned: bool,
}

impl EngineState {
    pub(crate) fn new(settings: AppSettings) -> Self {
        Self {
            settings,
            jobs: HashMap::new(),
            sep_queue: VecDeque::new(),
            active_jobs: HashSet::new(),
            cancelled_jobs: HashSet::new(),
            download_queue: Vec::new(),
            download_running: false,
            download_active: None,
            batches: HashMap::new(),
            library: Vec::new(),
            spawned_sep_workers: 0,
            download_dispatcher_spawned: false,
        }
    }
}

pub(crate) struct Inner {
    pub state: Mutex<EngineState>,
    pub cv: Condvar,
    pub dirs: DataDirs,
    pub tools: ToolLocator,
}

impl Inner {
    pub(crate) fn new(settings: AppSettings, dirs: DataDirs, tools: ToolLocator) -> Self {
        Self {
            state: Mutex::new(EngineState::new(settings)),
            cv: Condvar::new(),
            dirs,
            tools,
        }
    }
}

pub(crate) fn append_history(job: &mut Job, line: &str) {
    if job.step_history.len() >= MAX_STEP_HISTORY {
        job.step_history.remove(0);
    }
    job.step_history.push(line.to_string());
}

/// Monotonic progress/step update. Progress never regresses and step
/// transitions are recorded on the job timeline.
pub(crate) fn update_job_progress(
    inner: &Inner,
    job_id: &str,
    percent: Option<f64>,
    step: Option<&str>,
) {
    let mut state = inner.state.lock_unpoisoned();
    let Some(job) = state.jobs.get_mut(job_id) else {
        return;
    };
    if job.status != JobStatus::Processing {
        return;
    }
    if let Some(p) = percent {
        // 100 is reserved for the Completed transition.
        let clamped = p.clamp(0.0, 100.0).min(99.9);
        if clamped > job.progress {
            job.progress = clamped;
        }
    }
    if let Some(step) = step
        && job.current_step != step
    {
        job.current_step = step.to_string();
        append_history(job, step);
    }
}

pub(crate) fn is_job_cancelled(inner: &Inner, job_id: &str) -> bool {
    let state = inner.state.lock_unpoisoned();
    state.cancelled_jobs.contains(job_id)
}

pub(crate) fn mark_job_failed(inner: &Inner, job_id: &str, error: &PipelineError) {
    let mut state = inner.state.lock_unpoisoned();
    if let Some(job) = state.jobs.get_mut(job_id)
        && !job.status.is_terminal()
    {
        job.status = JobStatus::Failed;
        job.error = Some(JobError {
            kind: error.kind().to_string(),
            message: error.to_string(),
        });
        job.current_step = "Failed".to_string();
        let line = format!("Failed: {error}");
        append_history(job, &line);
    }
    update_batch_item_for_job_locked(&mut state, job_id);
}

pub(crate) fn mark_job_cancelled(inner: &Inner, job_id: &str) {
    let mut state = inner.state.lock_unpoisoned();
    state.cancelled_jobs.remove(job_id);
    if let Some(job) = state.jobs.get_mut(job_id)
        && !job.status.is_terminal()
    {
        job.status = JobStatus::Cancelled;
        job.current_step = "Cancelled".to_string();
        append_history(job, "Cancelled");
    }
    update_batch_item_for_job_locked(&mut state, job_id);
}

pub(crate) fn mark_job_completed(inner: &Inner, job_id: &str, result_files: Vec<String>) {
    let mut state = inner.state.lock_unpoisoned();
    if let Some(job) = state.jobs.get_mut(job_id)
        && !job.status.is_terminal()
    {
        job.status = JobStatus::Completed;
        job.progress = 100.0;
        job.result_files = result_files;
        job.current_step = "Completed".to_string();
        append_history(job, "Completed");
    }
    update_batch_item_for_job_locked(&mut state, job_id);
}

/// Mirror a child job's terminal state onto its folder-batch item, if any.
fn update_batch_item_for_job_locked(state: &mut EngineState, job_id: &str) {
    let (status, progress) = match state.jobs.get(job_id) {
        Some(job) => (job.status, job.progress),
        None => return,
    };
    let mapped = match status {
        JobStatus::Completed => BatchItemStatus::Completed,
        JobStatus::Failed | JobStatus::Cancelled => BatchItemStatus::Failed,
        JobStatus::Processing => BatchItemStatus::Processing,
        JobStatus::Queued => return,
    };
    for batch in state.batches.values_mut() {
        for item in &mut batch.items {
            if item.child_job_id.as_deref() == Some(job_id) {
                item.status = mapped;
                item.progress = if mapped == BatchItemStatus::Completed {
                    100.0
                } else {
                    progress
                };
            }
        }
    }
}

/// Refresh the live progress of batch items whose child jobs are running.
pub(crate) fn refresh_batch_progress_locked(state: &mut EngineState, batch_id: &str) {
    let job_progress: HashMap<String, (JobStatus, f64)> = state
        .jobs
        .iter()
        .map(|(id, job)| (id.clone(), (job.status, job.progress)))
        .collect();
    let Some(batch) = state.batches.get_mut(batch_id) else {
        return;
    };
    for item in &mut batch.items {
        let Some(job_id) = item.child_job_id.as_deref() else {
            continue;
        };
        if let Some((status, progress)) = job_progress.get(job_id) {
            item.status = match status {
                JobStatus::Completed => BatchItemStatus::Completed,
                JobStatus::Failed | JobStatus::Cancelled => BatchItemStatus::Failed,
                JobStatus::Processing => BatchItemStatus::Processing,
                JobStatus::Queued => BatchItemStatus::Pending,
            };
            item.progress = if item.status == BatchItemStatus::Completed {
                100.0
            } else {
                *progress
            };
        }
    }
}

pub(crate) fn job_snapshot(inner: &Inner, job_id: &str) -> Option<JobSnapshot> {
    let state = inner.state.lock_unpoisoned();
    state.jobs.get(job_id).map(JobSnapshot::from)
}

pub(crate) fn list_job_snapshots(inner: &Inner, kind: Option<JobKind>) -> Vec<JobSnapshot> {
    let state = inner.state.lock_unpoisoned();
    let mut jobs: Vec<&Job> = state
        .jobs
        .values()
        .filter(|job| kind.is_none_or(|k| job.kind == k))
        .collect();
    jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    jobs.into_iter().map(JobSnapshot::from).collect()
}

pub(crate) fn download_queue_snapshot(inner: &Inner) -> DownloadQueueSnapshot {
    let state = inner.state.lock_unpoisoned();
    DownloadQueueSnapshot {
        queue: state.download_queue.clone(),
        processing: state.download_active.is_some(),
        running: state.download_running,
    }
}

pub(crate) fn batch_snapshot(inner: &Inner, batch_id: &str) -> Option<BatchSnapshot> {
    let mut state = inner.state.lock_unpoisoned();
    refresh_batch_progress_locked(&mut state, batch_id);
    let batch = state.batches.get(batch_id)?;
    let selected: Vec<&BatchItem> = batch.items.iter().filter(|i| i.selected).collect();
    let success = selected
        .iter()
        .filter(|i| i.status == BatchItemStatus::Completed)
        .count();
    let failed = selected
        .iter()
        .filter(|i| i.status == BatchItemStatus::Failed)
        .count();
    Some(BatchSnapshot {
        batch_id: batch.batch_id.clone(),
        total_files: batch.items.len(),
        processed: success + failed,
        success,
        failed,
        files: batch.items.clone(),
    })
}

pub(crate) fn current_time_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
