//! The separation pipeline: probe → extract → separate (parallel) → align →
//! mix → normalize → remux → verify, with a fixed progress band per phase
//! and a cancellation check at every boundary and subprocess callback.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::nomusic_core::domain::{LibraryEntry, SeparatorChoice, SeparatorKind};
use crate::nomusic_core::error::{PipelineError, PipelineResult};
use crate::nomusic_core::probe;
use crate::nomusic_core::tools::ToolKind;
use crate::sync_ext::MutexExt;

use super::ffmpeg::RunOutcome;
use super::separator::{
    SeparatorContext, SeparatorDriver, demucs::DemucsDriver, spleeter::SpleeterDriver,
};
use super::state::{
    Inner, append_history, current_time_millis, is_job_cancelled, mark_job_cancelled,
    mark_job_completed, mark_job_failed, update_job_progress,
};
use super::{align, extract, mix, normalize, remux, state_persist};

// Progress band boundaries (upper edge of each phase).
const P_PROBE: f64 = 3.0;
const P_EXTRACT: f64 = 10.0;
const P_SEPARATE: f64 = 75.0;
const P_ALIGN: f64 = 80.0;
const P_MIX: f64 = 85.0;
const P_NORMALIZE: f64 = 92.0;
const P_REMUX: f64 = 99.0;

const ERROR_TAIL_BYTES: usize = 2048;

/// Deletes the job temp dir on drop unless told to keep it. Runs on every
/// exit path, including worker panics.
struct TempDirGuard {
    path: PathBuf,
    keep: bool,
}

impl Drop for TempDirGuard {
    fn drop(&mut self) {
        if self.keep || !self.path.exists() {
            return;
        }
        if let Err(err) = std::fs::remove_dir_all(&self.path) {
            // Cleanup failures are logged, never fatal: the job already
            // reached its terminal state.
            tracing::warn!("failed to remove temp dir {}: {err}", self.path.display());
        }
    }
}

pub(crate) fn run_separation_job(inner: &Arc<Inner>, job_id: &str) {
    match run_pipeline(inner, job_id) {
        Ok(()) => {}
        Err(PipelineError::Cancelled) => mark_job_cancelled(inner, job_id),
        Err(err) => {
            tracing::warn!(job_id, "separation failed: {err}");
            mark_job_failed(inner, job_id, &err);
        }
    }
}

fn run_pipeline(inner: &Arc<Inner>, job_id: &str) -> PipelineResult<()> {
    let (input, model, options) = {
        let state = inner.state.lock_unpoisoned();
        let Some(job) = state.jobs.get(job_id) else {
            return Ok(());
        };
        (
            PathBuf::from(job.input.clone()),
            job.model,
            job.options.clone(),
        )
    };

    if !input.is_file() {
        return Err(PipelineError::InvalidInput(format!(
            "input file {} does not exist",
            input.display()
        )));
    }

    let ffmpeg = inner.tools.locate(ToolKind::Ffmpeg)?;
    let ffprobe = inner.tools.locate(ToolKind::Ffprobe)?;

    let temp_dir = inner.dirs.job_temp_dir(job_id);
    for sub in ["extract", "spleeter", "demucs", "mix"] {
        std::fs::create_dir_all(temp_dir.join(sub)).map_err(|err| {
            PipelineError::InvalidInput(format!(
                "cannot create temp dir {}: {err}",
                temp_dir.display()
            ))
        })?;
    }
    let _temp_guard = TempDirGuard {
        path: temp_dir.clone(),
        keep: options.keep_temp,
    };

    let cancelled = || is_job_cancelled(inner, job_id);
    let check_cancel = || -> PipelineResult<()> {
        if cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    };

    // Phase: probe.
    update_job_progress(inner, job_id, Some(0.0), Some("Probing input"));
    let media = probe::probe(&ffprobe, &input)?;
    if media.audio_tracks.is_empty() {
        return Err(PipelineError::InvalidInput(format!(
            "{} has no audio tracks",
            input.display()
        )));
    }
    let total_duration = (media.duration_seconds > 0.0).then_some(media.duration_seconds);
    {
        let mut state = inner.state.lock_unpoisoned();
        if let Some(job) = state.jobs.get_mut(job_id) {
            job.metadata = Some(media.clone());
        }
    }
    update_job_progress(inner, job_id, Some(P_PROBE), None);
    check_cancel()?;

    // Phase: extract 44.1 kHz stereo PCM.
    update_job_progress(inner, job_id, None, Some("Extracting audio"));
    let track = probe::select_audio_track(&media, options.language.as_deref()).unwrap_or(0);
    let extracted = temp_dir.join("extract").join("input.wav");
    let outcome = extract::extract_wav(
        &ffmpeg,
        &input,
        &extracted,
        track,
        total_duration,
        &cancelled,
        &|pct| {
            update_job_progress(
                inner,
                job_id,
                Some(P_PROBE + (P_EXTRACT - P_PROBE) * pct / 100.0),
                None,
            );
        },
    )
    .map_err(|err| PipelineError::ExtractFailed {
        stderr_tail: error_tail(&err),
    })?;
    if matches!(outcome, RunOutcome::Cancelled) {
        return Err(PipelineError::Cancelled);
    }
    update_job_progress(inner, job_id, Some(P_EXTRACT), None);

    // Phase: run the separators concurrently.
    let vocals = run_separators(inner, job_id, model, &ffmpeg, &ffprobe, &extracted, &temp_dir)?;
    update_job_progress(inner, job_id, Some(P_SEPARATE), Some("Separation complete"));
    check_cancel()?;

    // Phases: align + mix, skipped on the single-driver path.
    let mix_dir = temp_dir.join("mix");
    let mixed = if vocals.len() == 2 {
        update_job_progress(inner, job_id, None, Some("Aligning stems"));
        let alignment = align::align_pair(&vocals[0].1, &vocals[1].1, &mix_dir)
            .map_err(|err| PipelineError::MixFailed(format!("alignment failed: {err:#}")))?;
        {
            let mut state = inner.state.lock_unpoisoned();
            if let Some(job) = state.jobs.get_mut(job_id) {
                let line = if alignment.forced_zero {
                    "Alignment low confidence, streams left unshifted".to_string()
                } else {
                    format!(
                        "Aligned streams (lag {:.1} ms, confidence {:.2})",
                        alignment.lag_seconds * 1000.0,
                        alignment.confidence
                    )
                };
                append_history(job, &line);
            }
        }
        update_job_progress(inner, job_id, Some(P_ALIGN), None);
        check_cancel()?;

        update_job_progress(inner, job_id, None, Some("Mixing stems"));
        let mixed = mix_dir.join("mixed.wav");
        mix::mix_pair(&alignment.aligned_a, &alignment.aligned_b, &mixed)
            .map_err(|err| PipelineError::MixFailed(format!("{err:#}")))?;
        update_job_progress(inner, job_id, Some(P_MIX), None);
        mixed
    } else {
        update_job_progress(inner, job_id, Some(P_MIX), None);
        vocals[0].1.clone()
    };
    check_cancel()?;

    // Phase: two-pass loudness normalization.
    update_job_progress(inner, job_id, None, Some("Normalizing loudness"));
    let normalized = mix_dir.join("normalized.wav");
    let outcome = normalize::normalize_two_pass(
        &ffmpeg,
        &mixed,
        &normalized,
        total_duration,
        &cancelled,
        &|pct| {
            update_job_progress(
                inner,
                job_id,
                Some(P_MIX + (P_NORMALIZE - P_MIX) * pct / 100.0),
                None,
            );
        },
    )
    .map_err(|err| PipelineError::NormalizeFailed {
        stderr_tail: error_tail(&err),
    })?;
    if matches!(outcome, RunOutcome::Cancelled) {
        return Err(PipelineError::Cancelled);
    }
    update_job_progress(inner, job_id, Some(P_NORMALIZE), None);

    // Phase: remux with the original video under the active preset.
    update_job_progress(inner, job_id, None, Some("Remuxing"));
    let preset = {
        let state = inner.state.lock_unpoisoned();
        state.settings.active_preset()
    };
    let ext = remux::output_extension(&preset).to_string();
    let final_path = inner
        .dirs
        .output_dir()
        .join(crate::nomusic_core::paths::output_file_name(&input, &ext));
    let outcome = remux::remux(
        &ffmpeg,
        &input,
        &normalized,
        &final_path,
        &preset,
        media.is_video,
        total_duration,
        &cancelled,
        &|pct| {
            update_job_progress(
                inner,
                job_id,
                Some(P_NORMALIZE + (P_REMUX - P_NORMALIZE) * pct / 100.0),
                None,
            );
        },
    )
    .map_err(|err| PipelineError::RemuxFailed {
        stderr_tail: error_tail(&err),
    })?;
    if matches!(outcome, RunOutcome::Cancelled) {
        let _ = std::fs::remove_file(&final_path);
        return Err(PipelineError::Cancelled);
    }
    update_job_progress(inner, job_id, Some(P_REMUX), None);

    // Phase: verify and publish.
    let size = std::fs::metadata(&final_path).map(|m| m.len()).unwrap_or(0);
    if size == 0 {
        return Err(PipelineError::RemuxFailed {
            stderr_tail: format!("output file {} is empty", final_path.display()),
        });
    }
    let result = inner.dirs.display_path(&final_path);
    {
        let mut state = inner.state.lock_unpoisoned();
        state.library.push(LibraryEntry {
            task_id: job_id.to_string(),
            result_files: vec![result.clone()],
            metadata: Some(media),
            created_at: current_time_millis(),
        });
    }
    state_persist::persist_library(inner);
    mark_job_completed(inner, job_id, vec![result]);
    tracing::info!(job_id, path = %final_path.display(), "separation complete");
    Ok(())
}

/// Run the requested separator drivers concurrently, each mapped onto its
/// share of the 10-75 progress band. Returns the surviving vocal stems in
/// driver order; exactly one failure degrades to a warning, two is fatal.
fn run_separators(
    inner: &Arc<Inner>,
    job_id: &str,
    model: SeparatorChoice,
    ffmpeg: &Path,
    ffprobe: &Path,
    extracted: &Path,
    temp_dir: &Path,
) -> PipelineResult<Vec<(SeparatorKind, PathBuf)>> {
    let kinds = model.kinds();
    let drivers: Vec<Box<dyn SeparatorDriver>> = kinds
        .iter()
        .map(|kind| match kind {
            SeparatorKind::Spleeter => Box::new(SpleeterDriver::from_env()) as Box<dyn SeparatorDriver>,
            SeparatorKind::Demucs => Box::new(DemucsDriver::from_env()) as Box<dyn SeparatorDriver>,
        })
        .collect();

    let segment_workers = {
        let state = inner.state.lock_unpoisoned();
        state.settings.processing.segment_workers
    };
    let ctx = SeparatorContext {
        ffmpeg: ffmpeg.to_path_buf(),
        ffprobe: ffprobe.to_path_buf(),
        segment_workers,
    };

    let band_width = (P_SEPARATE - P_EXTRACT) / drivers.len() as f64;
    let cancelled = || is_job_cancelled(inner, job_id);

    let results: Vec<anyhow::Result<PathBuf>> = std::thread::scope(|scope| {
        let handles: Vec<_> = drivers
            .iter()
            .enumerate()
            .map(|(index, driver)| {
                let ctx = &ctx;
                let cancelled = &cancelled;
                let band_lo = P_EXTRACT + band_width * index as f64;
                let out_dir = temp_dir.join(driver.kind().as_str());
                scope.spawn(move || {
                    let progress = |local_pct: f64, step: &str| {
                        update_job_progress(
                            inner,
                            job_id,
                            Some(band_lo + band_width * local_pct.clamp(0.0, 100.0) / 100.0),
                            Some(step),
                        );
                    };
                    super::separator::separate(
                        driver.as_ref(),
                        ctx,
                        extracted,
                        &out_dir,
                        &progress,
                        cancelled,
                    )
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(anyhow::anyhow!("separator thread panicked")))
            })
            .collect()
    });

    if cancelled() {
        return Err(PipelineError::Cancelled);
    }

    let mut survivors: Vec<(SeparatorKind, PathBuf)> = Vec::new();
    let mut failures: Vec<(SeparatorKind, anyhow::Error)> = Vec::new();
    for (kind, result) in kinds.iter().zip(results) {
        match result {
            Ok(path) => survivors.push((*kind, path)),
            Err(err) => failures.push((*kind, err)),
        }
    }

    if survivors.is_empty() {
        let (kind, err) = failures
            .into_iter()
            .next()
            .expect("no survivors implies at least one failure");
        return Err(PipelineError::SeparatorFailed {
            which: kind,
            stderr_tail: error_tail(&err),
        });
    }

    for (failed, err) in &failures {
        let survivor = survivors[0].0;
        tracing::warn!(
            job_id,
            "{} failed, continuing with {}: {err:#}",
            failed.display_name(),
            survivor.display_name()
        );
        let mut state = inner.state.lock_unpoisoned();
        if let Some(job) = state.jobs.get_mut(job_id) {
            let line = format!(
                "{} failed, continuing with {}",
                failed.display_name(),
                survivor.display_name()
            );
            job.current_step = line.clone();
            append_history(job, &line);
        }
    }

    Ok(survivors)
}

fn error_tail(err: &dyn std::fmt::Display) -> String {
    let text = format!("{err:#}");
    if text.len() <= ERROR_TAIL_BYTES {
        return text;
    }
    let mut start = text.len() - ERROR_TAIL_BYTES;
    while start < text.len() && !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}
