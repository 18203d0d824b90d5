use std::fs;
use std::path::Path;

use super::state;
use super::state_persist::{PersistedQueue, load_download_queue};
use super::worker::CancelOutcome;
use crate::nomusic_core::domain::{
    DownloadRequest, FormatKind, JobKind, JobStatus, QueueItemStatus, SeparationOptions,
    SeparatorChoice,
};
use crate::nomusic_core::engine::SeparationEngine;
use crate::nomusic_core::error::PipelineError;
use crate::sync_ext::MutexExt;

fn engine_in(dir: &Path) -> SeparationEngine {
    SeparationEngine::new_for_tests(dir)
}

fn touch(path: &Path) {
    fs::write(path, b"not really media, but present").expect("write fixture");
}

fn download_request(url: &str) -> DownloadRequest {
    DownloadRequest {
        url: url.to_string(),
        format_kind: FormatKind::Video,
        ..DownloadRequest::default()
    }
}

#[test]
fn submitting_a_missing_file_is_invalid_input() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_in(dir.path());

    let err = engine
        .submit_separation("/no/such/file.mp4", SeparatorChoice::Both, SeparationOptions::default())
        .expect_err("missing input must be rejected");
    assert!(matches!(err, PipelineError::InvalidInput(_)));
}

#[test]
fn separation_jobs_queue_in_fifo_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_in(dir.path());

    let mut ids = Vec::new();
    for name in ["a.mp4", "b.mp4", "c.mp4"] {
        let input = dir.path().join(name);
        touch(&input);
        let id = engine
            .submit_separation(
                &input.to_string_lossy(),
                SeparatorChoice::Both,
                SeparationOptions::default(),
            )
            .expect("submit");
        ids.push(id);
    }

    let state = engine.inner.state.lock_unpoisoned();
    let queued: Vec<String> = state.sep_queue.iter().cloned().collect();
    assert_eq!(queued, ids, "workers must receive jobs in submission order");
    for id in &ids {
        assert_eq!(state.jobs[id].status, JobStatus::Queued);
        assert_eq!(state.jobs[id].progress, 0.0);
    }
}

#[test]
fn cancel_is_accepted_once_then_already_terminal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_in(dir.path());
    let input = dir.path().join("song.mp4");
    touch(&input);

    let id = engine
        .submit_separation(
            &input.to_string_lossy(),
            SeparatorChoice::Both,
            SeparationOptions::default(),
        )
        .expect("submit");

    assert_eq!(engine.cancel(&id), CancelOutcome::Accepted);
    {
        let state = engine.inner.state.lock_unpoisoned();
        assert!(state.cancelled_jobs.contains(&id));
    }

    // Simulate the cooperative cancellation path a worker would take once it
    // observes the flag.
    state::mark_job_cancelled(&engine.inner, &id);

    assert_eq!(engine.cancel(&id), CancelOutcome::AlreadyTerminal);
    let snapshot = engine.status(&id).expect("snapshot");
    assert_eq!(snapshot.status, JobStatus::Cancelled);
}

#[test]
fn cancel_of_unknown_job_is_not_found() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_in(dir.path());
    assert_eq!(engine.cancel("nope"), CancelOutcome::NotFound);
}

#[test]
fn progress_is_monotonic_within_a_processing_job() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_in(dir.path());
    let input = dir.path().join("clip.mp4");
    touch(&input);

    let id = engine
        .submit_separation(
            &input.to_string_lossy(),
            SeparatorChoice::Spleeter,
            SeparationOptions::default(),
        )
        .expect("submit");
    {
        let mut state = engine.inner.state.lock_unpoisoned();
        state.jobs.get_mut(&id).unwrap().status = JobStatus::Processing;
    }

    state::update_job_progress(&engine.inner, &id, Some(50.0), Some("Separating"));
    state::update_job_progress(&engine.inner, &id, Some(30.0), None);
    let snapshot = engine.status(&id).expect("snapshot");
    assert_eq!(snapshot.progress, 50, "progress never regresses");

    // Overshoot is clamped below 100; only the Completed transition may
    // report a full bar.
    state::update_job_progress(&engine.inner, &id, Some(150.0), None);
    let snapshot = engine.status(&id).expect("snapshot");
    assert_eq!(snapshot.progress, 99);

    state::mark_job_completed(&engine.inner, &id, vec!["nomusic/clip.mp4".into()]);
    assert_eq!(engine.status(&id).expect("snapshot").progress, 100);
}

#[test]
fn queue_add_persists_exactly_the_in_memory_state() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_in(dir.path());

    engine
        .queue_add(download_request("https://example.com/watch?v=1"))
        .expect("queue_add");
    engine
        .queue_add(download_request("https://example.com/watch?v=2"))
        .expect("queue_add");

    let snapshot = engine.queue_snapshot();
    assert_eq!(snapshot.queue.len(), 2);
    assert!(!snapshot.running);

    let persisted: PersistedQueue =
        load_download_queue(&engine.inner).expect("queue file exists");
    assert_eq!(persisted.items.len(), snapshot.queue.len());
    for (disk, mem) in persisted.items.iter().zip(&snapshot.queue) {
        assert_eq!(disk.queue_id, mem.queue_id);
        assert_eq!(disk.url, mem.url);
        assert_eq!(disk.status, mem.status);
    }
}

#[test]
fn queue_remove_only_touches_pending_items() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_in(dir.path());

    let first = engine
        .queue_add(download_request("https://example.com/a"))
        .expect("queue_add");
    let second = engine
        .queue_add(download_request("https://example.com/b"))
        .expect("queue_add");

    // add → remove on a Pending item leaves the queue as if it was never
    // there.
    let snapshot = engine.queue_remove(&second).expect("remove pending");
    assert_eq!(snapshot.queue.len(), 1);
    assert_eq!(snapshot.queue[0].queue_id, first);

    // A non-pending item is protected.
    {
        let mut state = engine.inner.state.lock_unpoisoned();
        state.download_queue[0].status = QueueItemStatus::Completed;
    }
    let err = engine.queue_remove(&first).expect_err("remove completed");
    assert!(matches!(err, PipelineError::QueueStateError(_)));

    let err = engine.queue_remove("ghost").expect_err("remove unknown");
    assert!(matches!(err, PipelineError::QueueStateError(_)));
}

#[test]
fn queue_clear_done_drops_terminal_items_only() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_in(dir.path());

    for i in 0..3 {
        engine
            .queue_add(download_request(&format!("https://example.com/{i}")))
            .expect("queue_add");
    }
    {
        let mut state = engine.inner.state.lock_unpoisoned();
        state.download_queue[0].status = QueueItemStatus::Completed;
        state.download_queue[1].status = QueueItemStatus::Failed;
    }

    let snapshot = engine.queue_clear_done();
    assert_eq!(snapshot.queue.len(), 1);
    assert_eq!(snapshot.queue[0].status, QueueItemStatus::Pending);
}

#[test]
fn download_queue_survives_a_restart_in_order() {
    let dir = tempfile::tempdir().expect("tempdir");

    let urls: Vec<String> = (0..3).map(|i| format!("https://example.com/v{i}")).collect();
    {
        let engine = engine_in(dir.path());
        for url in &urls {
            engine.queue_add(download_request(url)).expect("queue_add");
        }
        engine.queue_start();
        // First item completed before the "crash"; attempts recorded.
        {
            let mut state = engine.inner.state.lock_unpoisoned();
            state.download_queue[0].status = QueueItemStatus::Completed;
            state.download_queue[1].attempt_count = 2;
        }
        engine.persist_queue_now();
    }

    let engine = engine_in(dir.path());
    let snapshot = engine.queue_snapshot();
    assert!(snapshot.running, "queue resumes if it was running");
    assert_eq!(snapshot.queue.len(), 3);

    let pending: Vec<&str> = snapshot
        .queue
        .iter()
        .filter(|i| i.status == QueueItemStatus::Pending)
        .map(|i| i.url.as_str())
        .collect();
    assert_eq!(pending, vec![urls[1].as_str(), urls[2].as_str()]);
    assert_eq!(snapshot.queue[1].attempt_count, 2, "attempt_count preserved");
}

#[test]
fn interrupted_downloads_rehydrate_as_pending() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let engine = engine_in(dir.path());
        engine
            .queue_add(download_request("https://example.com/mid-flight"))
            .expect("queue_add");
        {
            let mut state = engine.inner.state.lock_unpoisoned();
            state.download_queue[0].status = QueueItemStatus::Downloading;
            state.download_queue[0].progress = 55.0;
        }
        engine.persist_queue_now();
    }

    let engine = engine_in(dir.path());
    let snapshot = engine.queue_snapshot();
    assert_eq!(snapshot.queue[0].status, QueueItemStatus::Pending);
    assert_eq!(snapshot.queue[0].progress, 0.0);
    assert!(snapshot.queue[0].job_id.is_none());
}

#[test]
fn direct_download_submission_creates_a_pollable_job() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_in(dir.path());

    let job_id = engine
        .submit_download(download_request("https://example.com/direct"))
        .expect("submit_download");
    let snapshot = engine.status(&job_id).expect("job exists immediately");
    assert_eq!(snapshot.status, JobStatus::Queued);

    let queue = engine.queue_snapshot();
    assert_eq!(queue.queue.len(), 1);
    assert!(queue.queue[0].immediate);
    assert_eq!(queue.queue[0].job_id.as_deref(), Some(job_id.as_str()));
}

#[test]
fn empty_url_submissions_are_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_in(dir.path());
    let err = engine
        .queue_add(download_request("   "))
        .expect_err("blank url");
    assert!(matches!(err, PipelineError::InvalidInput(_)));
}

#[test]
fn folder_scan_filters_media_and_preserves_name_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_in(dir.path());

    let media_dir = dir.path().join("media");
    fs::create_dir_all(&media_dir).expect("media dir");
    touch(&media_dir.join("b.mp4"));
    touch(&media_dir.join("a.mp3"));
    touch(&media_dir.join("notes.txt"));
    let nested = media_dir.join("nested");
    fs::create_dir_all(&nested).expect("nested dir");
    touch(&nested.join("deep.mp4"));

    let (batch_id, items) = engine
        .folder_scan(&media_dir.to_string_lossy())
        .expect("scan");
    let names: Vec<&str> = items.iter().map(|i| i.file_name.as_str()).collect();
    // Non-recursive: the nested file is not picked up.
    assert_eq!(names, vec!["a.mp3", "b.mp4"]);
    assert!(items.iter().all(|i| i.selected));

    let status = engine.batch_status(&batch_id).expect("batch snapshot");
    assert_eq!(status.total_files, 2);
    assert_eq!(status.processed, 0);
}

#[test]
fn folder_process_launches_one_job_per_selected_item() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_in(dir.path());

    let media_dir = dir.path().join("media");
    fs::create_dir_all(&media_dir).expect("media dir");
    touch(&media_dir.join("one.mp4"));
    touch(&media_dir.join("two.mp4"));

    let (batch_id, items) = engine
        .folder_scan(&media_dir.to_string_lossy())
        .expect("scan");

    // Deselect the second file before processing.
    {
        let mut state = engine.inner.state.lock_unpoisoned();
        let batch = state.batches.get_mut(&batch_id).expect("batch");
        batch.items[1].selected = false;
    }

    let processed = engine
        .folder_process(&batch_id, SeparatorChoice::Both)
        .expect("process");
    assert!(processed[0].child_job_id.is_some());
    assert!(processed[1].child_job_id.is_none());

    let jobs = engine.list(Some(JobKind::Separate));
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Queued);

    // Re-processing a started batch is an error.
    let err = engine
        .folder_process(&batch_id, SeparatorChoice::Both)
        .expect_err("double process");
    assert!(matches!(err, PipelineError::QueueStateError(_)));

    // Items handed to the pool are no longer removable.
    let err = engine
        .folder_remove(&batch_id, &items[0].file_id)
        .expect_err("remove processed");
    assert!(matches!(err, PipelineError::QueueStateError(_)));
}

#[test]
fn folder_remove_drops_a_pending_item() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_in(dir.path());

    let media_dir = dir.path().join("media");
    fs::create_dir_all(&media_dir).expect("media dir");
    touch(&media_dir.join("one.mp4"));
    touch(&media_dir.join("two.mp4"));

    let (batch_id, items) = engine
        .folder_scan(&media_dir.to_string_lossy())
        .expect("scan");
    let remaining = engine
        .folder_remove(&batch_id, &items[0].file_id)
        .expect("remove");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].file_id, items[1].file_id);
}

#[test]
fn batch_status_mirrors_child_job_outcomes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_in(dir.path());

    let media_dir = dir.path().join("media");
    fs::create_dir_all(&media_dir).expect("media dir");
    touch(&media_dir.join("one.mp4"));
    touch(&media_dir.join("two.mp4"));

    let (batch_id, _) = engine
        .folder_scan(&media_dir.to_string_lossy())
        .expect("scan");
    let processed = engine
        .folder_process(&batch_id, SeparatorChoice::Both)
        .expect("process");

    let first_job = processed[0].child_job_id.clone().expect("child job");
    let second_job = processed[1].child_job_id.clone().expect("child job");
    state::mark_job_completed(&engine.inner, &first_job, vec!["nomusic/one.mp4".into()]);
    state::mark_job_failed(
        &engine.inner,
        &second_job,
        &PipelineError::InvalidInput("broken".into()),
    );

    let status = engine.batch_status(&batch_id).expect("batch snapshot");
    assert_eq!(status.total_files, 2);
    assert_eq!(status.processed, 2);
    assert_eq!(status.success, 1);
    assert_eq!(status.failed, 1);
}

#[test]
fn library_entries_survive_a_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let engine = engine_in(dir.path());
        {
            let mut state = engine.inner.state.lock_unpoisoned();
            state.library.push(crate::nomusic_core::domain::LibraryEntry {
                task_id: "job-1".into(),
                result_files: vec!["nomusic/nomusic-clip.mp4".into()],
                metadata: None,
                created_at: 42,
            });
        }
        super::state_persist::persist_library(&engine.inner);
    }

    let engine = engine_in(dir.path());
    let library = engine.library();
    assert_eq!(library.len(), 1);
    assert_eq!(library[0].task_id, "job-1");
    assert_eq!(library[0].result_files[0], "nomusic/nomusic-clip.mp4");
}

#[test]
fn preset_selection_is_validated_and_persisted() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_in(dir.path());

    let err = engine.select_preset("nope").expect_err("unknown preset");
    assert!(matches!(err, PipelineError::QueueStateError(_)));

    let settings = engine.select_preset("compat").expect("select compat");
    assert_eq!(settings.current_preset, "compat");
    assert_eq!(
        engine.active_preset().video.codec.as_deref(),
        Some("libx264")
    );

    let reloaded =
        crate::nomusic_core::settings::load_settings(&engine.data_dirs().presets_path());
    assert_eq!(reloaded.current_preset, "compat");
}

#[test]
fn cancelled_queued_separation_never_reaches_a_worker() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_in(dir.path());
    let input = dir.path().join("clip.mp4");
    touch(&input);

    let id = engine
        .submit_separation(
            &input.to_string_lossy(),
            SeparatorChoice::Both,
            SeparationOptions::default(),
        )
        .expect("submit");
    assert_eq!(engine.cancel(&id), CancelOutcome::Accepted);

    // Drive the worker's claim path by hand (workers are disabled in tests).
    {
        let mut state = engine.inner.state.lock_unpoisoned();
        let popped = state.sep_queue.pop_front().expect("queued id");
        assert_eq!(popped, id);
        assert!(state.cancelled_jobs.remove(&popped));
        let job = state.jobs.get_mut(&popped).unwrap();
        job.status = JobStatus::Cancelled;
    }
    assert_eq!(engine.cancel(&id), CancelOutcome::AlreadyTerminal);
}

#[test]
fn worker_pool_sizes_come_from_processing_settings() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_in(dir.path());
    let state = engine.inner.state.lock_unpoisoned();
    assert_eq!(state.settings.processing.workers, 1);
    assert_eq!(state.settings.processing.segment_workers, 2);
    assert_eq!(state.settings.processing.download_workers, 1);
    assert_eq!(state.settings.processing.download_timeout_minutes, 30);
}
