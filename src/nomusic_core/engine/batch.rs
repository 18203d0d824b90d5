//! Folder batch queue: scan a directory for media files, then fan the
//! selected ones out as separation jobs on the shared worker pool.
//!
//! The scan is non-recursive: direct children only, filtered by extension.

use std::path::Path;
use std::sync::Arc;

use uuid::Uuid;

use super::state::{Batch, Inner};
use super::worker;
use crate::nomusic_core::domain::{
    BatchItem, BatchItemStatus, SeparationOptions, SeparatorChoice,
};
use crate::nomusic_core::error::{PipelineError, PipelineResult};
use crate::nomusic_core::probe;
use crate::sync_ext::MutexExt;

const MEDIA_EXTENSIONS: [&str; 13] = [
    "mp4", "mkv", "avi", "mov", "webm", "m4v", "mp3", "wav", "flac", "m4a", "aac", "ogg", "opus",
];

pub(crate) fn is_media_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| {
            let lower = ext.to_ascii_lowercase();
            MEDIA_EXTENSIONS.contains(&lower.as_str())
        })
        .unwrap_or(false)
}

/// Scan a folder and register the result as a fresh (unstarted) batch.
/// Returns `(batch_id, items)`. Files that ffprobe cannot read are kept with
/// empty metadata; the separation job itself will fail them properly.
pub(crate) fn scan_folder(inner: &Inner, folder: &Path) -> PipelineResult<(String, Vec<BatchItem>)> {
    if !folder.is_dir() {
        return Err(PipelineError::InvalidInput(format!(
            "{} is not a readable directory",
            folder.display()
        )));
    }

    let mut media_paths: Vec<_> = std::fs::read_dir(folder)
        .map_err(|err| {
            PipelineError::InvalidInput(format!("cannot read {}: {err}", folder.display()))
        })?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_media_file(path))
        .collect();
    media_paths.sort();

    let ffprobe = inner.tools.locate(crate::nomusic_core::tools::ToolKind::Ffprobe).ok();

    let items: Vec<BatchItem> = media_paths
        .into_iter()
        .map(|path| {
            let metadata = ffprobe
                .as_deref()
                .and_then(|ffprobe| match probe::probe(ffprobe, &path) {
                    Ok(probe) => Some(probe),
                    Err(err) => {
                        tracing::debug!("probe failed for {}: {err}", path.display());
                        None
                    }
                });
            BatchItem {
                file_id: Uuid::new_v4().to_string(),
                file_name: path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                path: path.to_string_lossy().into_owned(),
                selected: true,
                status: BatchItemStatus::Pending,
                progress: 0.0,
                child_job_id: None,
                metadata,
            }
        })
        .collect();

    let batch_id = Uuid::new_v4().to_string();
    {
        let mut state = inner.state.lock_unpoisoned();
        state.batches.insert(
            batch_id.clone(),
            Batch {
                batch_id: batch_id.clone(),
                items: items.clone(),
                started: false,
            },
        );
    }
    tracing::info!(batch_id, files = items.len(), "folder scanned");
    Ok((batch_id, items))
}

/// Launch one separation job per selected item, in scan order.
pub(crate) fn process_batch(
    inner: &Arc<Inner>,
    batch_id: &str,
    model: SeparatorChoice,
) -> PipelineResult<Vec<BatchItem>> {
    let to_process: Vec<(String, String)> = {
        let state = inner.state.lock_unpoisoned();
        let batch = state.batches.get(batch_id).ok_or_else(|| {
            PipelineError::QueueStateError(format!("unknown batch {batch_id}"))
        })?;
        if batch.started {
            return Err(PipelineError::QueueStateError(format!(
                "batch {batch_id} is already processing"
            )));
        }
        batch
            .items
            .iter()
            .filter(|item| item.selected && item.status == BatchItemStatus::Pending)
            .map(|item| (item.file_id.clone(), item.path.clone()))
            .collect()
    };

    for (file_id, path) in &to_process {
        let job = worker::enqueue_separation(inner, path.clone(), model, SeparationOptions::default());
        let mut state = inner.state.lock_unpoisoned();
        if let Some(batch) = state.batches.get_mut(batch_id)
            && let Some(item) = batch.items.iter_mut().find(|i| &i.file_id == file_id)
        {
            item.child_job_id = Some(job.id.clone());
        }
    }

    let mut state = inner.state.lock_unpoisoned();
    let batch = state
        .batches
        .get_mut(batch_id)
        .ok_or_else(|| PipelineError::QueueStateError(format!("unknown batch {batch_id}")))?;
    batch.started = true;
    Ok(batch.items.clone())
}

/// Drop an unprocessed item from a batch. Items already handed to the
/// worker pool are not removable.
pub(crate) fn remove_batch_item(
    inner: &Inner,
    batch_id: &str,
    file_id: &str,
) -> PipelineResult<Vec<BatchItem>> {
    let mut state = inner.state.lock_unpoisoned();
    let batch = state
        .batches
        .get_mut(batch_id)
        .ok_or_else(|| PipelineError::QueueStateError(format!("unknown batch {batch_id}")))?;
    let Some(index) = batch.items.iter().position(|i| i.file_id == file_id) else {
        return Err(PipelineError::QueueStateError(format!(
            "no file {file_id} in batch {batch_id}"
        )));
    };
    let item = &batch.items[index];
    if item.status != BatchItemStatus::Pending || item.child_job_id.is_some() {
        return Err(PipelineError::QueueStateError(format!(
            "file {file_id} is no longer pending"
        )));
    }
    batch.items.remove(index);
    Ok(batch.items.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_extension_filter_is_case_insensitive() {
        assert!(is_media_file(Path::new("/x/a.MP4")));
        assert!(is_media_file(Path::new("/x/b.flac")));
        assert!(!is_media_file(Path::new("/x/notes.txt")));
        assert!(!is_media_file(Path::new("/x/noext")));
    }
}
