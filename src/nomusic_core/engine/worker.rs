//! Worker pools: separation workers (bounded, RAM-conscious) and the
//! single-consumer download dispatcher. Both sleep on the engine condvar and
//! cooperate with cancellation.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use super::state::{
    Inner, append_history, current_time_millis, is_job_cancelled, mark_job_cancelled,
    mark_job_completed, mark_job_failed, update_job_progress,
};
use super::{download, job_runner, state_persist};
use crate::nomusic_core::domain::{
    Job, JobKind, JobStatus, QueueItem, QueueItemStatus, SeparationOptions, SeparatorChoice,
};
use crate::nomusic_core::error::PipelineError;
use crate::nomusic_core::tools::ToolKind;
use crate::sync_ext::{CondvarExt, MutexExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Accepted,
    AlreadyTerminal,
    NotFound,
}

/// Spawn (or extend) worker threads to satisfy the configured pool sizes.
pub(crate) fn spawn_workers(inner: &Arc<Inner>) {
    #[cfg(test)]
    {
        if std::env::var_os("NOMUSIC_ENABLE_WORKERS_IN_TESTS").is_none() {
            return;
        }
    }

    let (start_index, desired, spawn_dispatcher) = {
        let mut state = inner.state.lock_unpoisoned();
        let desired = state.settings.processing.workers.max(1);
        let spawn_dispatcher = !state.download_dispatcher_spawned;
        state.download_dispatcher_spawned = true;
        (state.spawned_sep_workers, desired, spawn_dispatcher)
    };

    let mut spawned = 0usize;
    for index in start_index..desired {
        let inner_clone = inner.clone();
        let result = std::thread::Builder::new()
            .name(format!("nomusic-separation-worker-{index}"))
            .spawn(move || separation_worker_loop(&inner_clone))
            .map(|_| ());
        if let Err(err) = result {
            tracing::error!("failed to spawn separation worker: {err}");
            break;
        }
        spawned += 1;
    }
    if spawned > 0 {
        let mut state = inner.state.lock_unpoisoned();
        state.spawned_sep_workers = state.spawned_sep_workers.max(start_index + spawned);
    }

    if spawn_dispatcher {
        let inner_clone = inner.clone();
        let result = std::thread::Builder::new()
            .name("nomusic-download-dispatcher".to_string())
            .spawn(move || download_dispatcher_loop(&inner_clone))
            .map(|_| ());
        if let Err(err) = result {
            tracing::error!("failed to spawn download dispatcher: {err}");
            let mut state = inner.state.lock_unpoisoned();
            state.download_dispatcher_spawned = false;
        }
    }
}

/// Create a separation job and queue it for the worker pool. Non-blocking.
pub(crate) fn enqueue_separation(
    inner: &Arc<Inner>,
    input: String,
    model: SeparatorChoice,
    options: SeparationOptions,
) -> Job {
    let job = Job::new(
        Uuid::new_v4().to_string(),
        JobKind::Separate,
        input,
        model,
        options,
        current_time_millis(),
    );
    {
        let mut state = inner.state.lock_unpoisoned();
        state.jobs.insert(job.id.clone(), job.clone());
        state.sep_queue.push_back(job.id.clone());
    }
    inner.cv.notify_all();
    tracing::info!(job_id = %job.id, input = %job.input, "separation job queued");
    job
}

/// Append a download item to the queue (persisting it) and wake the
/// dispatcher. A Queued download job is created up front so the item is
/// pollable via `GET /status/{job_id}` before the dispatcher reaches it.
pub(crate) fn enqueue_download_item(inner: &Arc<Inner>, mut item: QueueItem) -> String {
    let job = Job::new(
        Uuid::new_v4().to_string(),
        JobKind::Download,
        item.url.clone(),
        SeparatorChoice::Both,
        SeparationOptions::default(),
        current_time_millis(),
    );
    let job_id = job.id.clone();
    item.job_id = Some(job_id.clone());
    {
        let mut state = inner.state.lock_unpoisoned();
        state.jobs.insert(job_id.clone(), job);
        state.download_queue.push(item);
    }
    state_persist::persist_download_queue(inner);
    inner.cv.notify_all();
    job_id
}

/// Request cancellation. The owning worker observes the flag at the next
/// phase boundary or progress callback.
pub(crate) fn cancel_job(inner: &Inner, job_id: &str) -> CancelOutcome {
    let mut state = inner.state.lock_unpoisoned();
    let Some(job) = state.jobs.get(job_id) else {
        return CancelOutcome::NotFound;
    };
    if job.status.is_terminal() {
        return CancelOutcome::AlreadyTerminal;
    }
    state.cancelled_jobs.insert(job_id.to_string());
    drop(state);
    inner.cv.notify_all();
    CancelOutcome::Accepted
}

fn separation_worker_loop(inner: &Arc<Inner>) {
    loop {
        let job_id = {
            let mut state = inner.state.lock_unpoisoned();
            loop {
                if let Some(id) = state.sep_queue.pop_front() {
                    // Jobs cancelled while still queued never reach a worker.
                    if state.cancelled_jobs.remove(&id) {
                        if let Some(job) = state.jobs.get_mut(&id) {
                            job.status = JobStatus::Cancelled;
                            job.current_step = "Cancelled".to_string();
                            append_history(job, "Cancelled before start");
                        }
                        continue;
                    }
                    if let Some(job) = state.jobs.get_mut(&id) {
                        job.status = JobStatus::Processing;
                        job.current_step = "Starting".to_string();
                        append_history(job, "Starting");
                        state.active_jobs.insert(id.clone());
                        break id;
                    }
                    continue;
                }
                state = inner.cv.wait_unpoisoned(state);
            }
        };

        let result = guarded(|| job_runner::run_separation_job(inner, &job_id));
        match result {
            Ok(()) => {}
            Err(reason) => {
                mark_job_failed(
                    inner,
                    &job_id,
                    &PipelineError::InvalidInput(format!("worker crashed: {reason}")),
                );
            }
        }

        {
            let mut state = inner.state.lock_unpoisoned();
            state.active_jobs.remove(&job_id);
            state.cancelled_jobs.remove(&job_id);
        }
        inner.cv.notify_all();
    }
}

fn guarded<F>(f: F) -> Result<(), String>
where
    F: FnOnce(),
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => Ok(()),
        Err(payload) => Err(panic_payload_to_string(&*payload)),
    }
}

fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "unknown panic payload".to_string()
}

fn download_dispatcher_loop(inner: &Arc<Inner>) {
    loop {
        // Claim the first eligible item: FIFO, Pending, queue running or the
        // item was submitted for immediate dispatch.
        let claimed = {
            let mut state = inner.state.lock_unpoisoned();
            loop {
                let eligible = state.download_queue.iter().position(|item| {
                    item.status == QueueItemStatus::Pending
                        && (state.download_running || item.immediate)
                });
                let Some(index) = eligible else {
                    // Timed wait: a missed wakeup must not stall the queue
                    // forever.
                    let (next, _timeout) =
                        inner.cv.wait_timeout_unpoisoned(state, Duration::from_secs(1));
                    state = next;
                    continue;
                };

                // Resolve the job created at enqueue time; rehydrated items
                // reference jobs from a previous process and get a new one.
                let existing = state.download_queue[index]
                    .job_id
                    .clone()
                    .filter(|id| state.jobs.contains_key(id));
                let job_id = existing.unwrap_or_else(|| {
                    let job = Job::new(
                        Uuid::new_v4().to_string(),
                        JobKind::Download,
                        state.download_queue[index].url.clone(),
                        SeparatorChoice::Both,
                        SeparationOptions::default(),
                        current_time_millis(),
                    );
                    let id = job.id.clone();
                    state.jobs.insert(id.clone(), job);
                    id
                });

                // A download cancelled while still pending never starts.
                if state.cancelled_jobs.remove(&job_id) {
                    if let Some(job) = state.jobs.get_mut(&job_id) {
                        job.status = JobStatus::Cancelled;
                        job.current_step = "Cancelled".to_string();
                        append_history(job, "Cancelled before start");
                    }
                    let item = &mut state.download_queue[index];
                    item.status = QueueItemStatus::Failed;
                    item.error = Some("cancelled".to_string());
                    continue;
                }

                let item = &mut state.download_queue[index];
                item.status = QueueItemStatus::Downloading;
                item.job_id = Some(job_id.clone());
                if let Some(job) = state.jobs.get_mut(&job_id) {
                    job.status = JobStatus::Processing;
                    job.current_step = "Downloading".to_string();
                    append_history(job, "Downloading");
                }
                let item = state.download_queue[index].clone();
                state.download_active = Some(item.queue_id.clone());
                break (item, job_id);
            }
        };
        state_persist::persist_download_queue(inner);

        let (item, job_id) = claimed;
        run_download_item(inner, &item, &job_id);

        {
            let mut state = inner.state.lock_unpoisoned();
            state.download_active = None;
            state.cancelled_jobs.remove(&job_id);
        }
        state_persist::persist_download_queue(inner);
        inner.cv.notify_all();
    }
}

fn run_download_item(inner: &Arc<Inner>, item: &QueueItem, job_id: &str) {
    let timeout = {
        let state = inner.state.lock_unpoisoned();
        Duration::from_secs(state.settings.processing.download_timeout_minutes * 60)
    };

    let ytdlp = match inner.tools.locate(ToolKind::YtDlp) {
        Ok(path) => path,
        Err(err) => {
            finish_download_item(inner, &item.queue_id, job_id, Err(err));
            return;
        }
    };

    let cancel = || is_job_cancelled(inner, job_id);
    let progress = |pct: f64| {
        update_job_progress(inner, job_id, Some(pct), None);
        // Persist only on whole-percent movement to keep disk churn sane.
        let should_persist = {
            let mut state = inner.state.lock_unpoisoned();
            match state
                .download_queue
                .iter_mut()
                .find(|i| i.queue_id == item.queue_id)
            {
                Some(entry) if pct > entry.progress => {
                    let crossed = pct.floor() > entry.progress.floor();
                    entry.progress = pct;
                    crossed
                }
                _ => false,
            }
        };
        if should_persist {
            state_persist::persist_download_queue(inner);
        }
    };
    let on_attempt = |attempt: u32| {
        tracing::debug!(queue_id = %item.queue_id, attempt, "download attempt");
        {
            let mut state = inner.state.lock_unpoisoned();
            if let Some(entry) = state
                .download_queue
                .iter_mut()
                .find(|i| i.queue_id == item.queue_id)
            {
                entry.attempt_count = entry.attempt_count.saturating_add(1);
            }
        }
        state_persist::persist_download_queue(inner);
    };

    let result = download::download_with_retries(
        &ytdlp,
        item,
        &inner.dirs.download_dir(),
        timeout,
        &cancel,
        &progress,
        &on_attempt,
    );
    finish_download_item(inner, &item.queue_id, job_id, result);
}

fn finish_download_item(
    inner: &Arc<Inner>,
    queue_id: &str,
    job_id: &str,
    result: Result<std::path::PathBuf, PipelineError>,
) {
    match result {
        Ok(path) => {
            let auto_separate = {
                let mut state = inner.state.lock_unpoisoned();
                let mut auto = false;
                if let Some(entry) = state
                    .download_queue
                    .iter_mut()
                    .find(|i| i.queue_id == queue_id)
                {
                    entry.status = QueueItemStatus::Completed;
                    entry.progress = 100.0;
                    entry.error = None;
                    auto = entry.auto_separate;
                }
                auto
            };
            mark_job_completed(inner, job_id, vec![inner.dirs.display_path(&path)]);
            tracing::info!(job_id, path = %path.display(), "download complete");
            if auto_separate {
                enqueue_separation(
                    inner,
                    path.to_string_lossy().into_owned(),
                    SeparatorChoice::Both,
                    SeparationOptions::default(),
                );
            }
        }
        Err(PipelineError::Cancelled) => {
            {
                let mut state = inner.state.lock_unpoisoned();
                if let Some(entry) = state
                    .download_queue
                    .iter_mut()
                    .find(|i| i.queue_id == queue_id)
                {
                    entry.status = QueueItemStatus::Failed;
                    entry.error = Some("cancelled".to_string());
                }
            }
            mark_job_cancelled(inner, job_id);
            tracing::info!(job_id, "download cancelled");
        }
        Err(err) => {
            {
                let mut state = inner.state.lock_unpoisoned();
                if let Some(entry) = state
                    .download_queue
                    .iter_mut()
                    .find(|i| i.queue_id == queue_id)
                {
                    entry.status = QueueItemStatus::Failed;
                    entry.error = Some(err.to_string());
                }
            }
            mark_job_failed(inner, job_id, &err);
            tracing::warn!(job_id, "download failed: {err}");
        }
    }
}
