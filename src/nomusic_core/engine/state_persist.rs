//! Durable state: the download queue and the completed-work library. Both
//! are rewritten atomically after every mutation so the on-disk file always
//! equals the last in-memory snapshot.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use super::state::Inner;
use crate::nomusic_core::domain::{LibraryEntry, QueueItem, QueueItemStatus};
use crate::nomusic_core::settings::{read_json_file, write_json_file};
use crate::sync_ext::MutexExt;

/// Serializes snapshot+write pairs so concurrent persist calls cannot land
/// an older snapshot on top of a newer one.
static PERSIST_LOCK: Mutex<()> = Mutex::new(());

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PersistedQueue {
    pub items: Vec<QueueItem>,
    pub running: bool,
}

/// Accept either the current `{items, running}` shape or a bare item array
/// from older builds.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PersistedQueueCompat {
    Current(PersistedQueue),
    Legacy(Vec<QueueItem>),
}

pub(crate) fn load_download_queue(inner: &Inner) -> Option<PersistedQueue> {
    let path = inner.dirs.queue_state_path();
    if !path.exists() {
        return None;
    }
    match read_json_file::<PersistedQueueCompat>(&path) {
        Ok(PersistedQueueCompat::Current(queue)) => Some(queue),
        Ok(PersistedQueueCompat::Legacy(items)) => Some(PersistedQueue {
            items,
            running: false,
        }),
        Err(err) => {
            tracing::warn!("failed to load {}: {err:#}", path.display());
            None
        }
    }
}

/// Snapshot the queue under the lock and write it out. Persistence failures
/// are logged, never fatal: the queue keeps working from memory.
pub(crate) fn persist_download_queue(inner: &Inner) {
    let _guard = PERSIST_LOCK.lock_unpoisoned();
    let snapshot = {
        let state = inner.state.lock_unpoisoned();
        PersistedQueue {
            items: state.download_queue.clone(),
            running: state.download_running,
        }
    };
    let path = inner.dirs.queue_state_path();
    if let Err(err) = write_json_file(&path, &snapshot) {
        tracing::warn!("failed to persist {}: {err:#}", path.display());
    }
}

/// Rehydrate persisted items at startup: pending items come back verbatim
/// (attempt counts preserved); items that died mid-download return to
/// Pending so the dispatcher retries them.
pub(crate) fn rehydrate_download_queue(inner: &Inner) {
    let Some(persisted) = load_download_queue(inner) else {
        return;
    };
    let mut state = inner.state.lock_unpoisoned();
    state.download_queue = persisted
        .items
        .into_iter()
        .map(|mut item| {
            if item.status == QueueItemStatus::Downloading {
                item.status = QueueItemStatus::Pending;
                item.progress = 0.0;
                item.job_id = None;
            }
            item
        })
        .collect();
    state.download_running = persisted.running;
    let pending = state
        .download_queue
        .iter()
        .filter(|i| i.status == QueueItemStatus::Pending)
        .count();
    tracing::info!(
        pending,
        running = state.download_running,
        "download queue restored"
    );
}

pub(crate) fn load_library(inner: &Inner) {
    let path = inner.dirs.library_path();
    if !path.exists() {
        return;
    }
    match read_json_file::<Vec<LibraryEntry>>(&path) {
        Ok(entries) => {
            let mut state = inner.state.lock_unpoisoned();
            state.library = entries;
        }
        Err(err) => {
            tracing::warn!("failed to load {}: {err:#}", path.display());
        }
    }
}

pub(crate) fn persist_library(inner: &Inner) {
    let _guard = PERSIST_LOCK.lock_unpoisoned();
    let snapshot = {
        let state = inner.state.lock_unpoisoned();
        state.library.clone()
    };
    let path = inner.dirs.library_path();
    if let Err(err) = write_json_file(&path, &snapshot) {
        tracing::warn!("failed to persist {}: {err:#}", path.display());
    }
}
