//! Separator drivers: wrap the external Spleeter and Demucs tools behind a
//! common contract, with automatic segmentation for long inputs.
//!
//! Each driver separates one chunk of audio of at most 600 s; this module
//! owns the surrounding machinery: splitting oversize inputs into contiguous
//! zero-overlap segments, processing them on a bounded worker pool, and
//! concatenating the per-segment vocal stems back together in start-time
//! order via ffmpeg's demuxer concat.

pub(crate) mod demucs;
pub(crate) mod spleeter;

use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow, bail};
use once_cell::sync::Lazy;
use regex::Regex;

use super::ffmpeg::{RunOutcome, run_streaming};
use crate::nomusic_core::domain::SeparatorKind;
use crate::nomusic_core::probe;
use crate::sync_ext::MutexExt;

/// Inputs longer than this are processed in segments.
pub(crate) const SEGMENT_THRESHOLD_SECONDS: f64 = 600.0;
/// Maximum segment length. Segments are contiguous with zero overlap.
pub(crate) const SEGMENT_LENGTH_SECONDS: f64 = 600.0;

/// `(local_percent, step_label)` progress sink.
pub(crate) type ProgressFn<'a> = &'a (dyn Fn(f64, &str) + Sync);
pub(crate) type CancelFn<'a> = &'a (dyn Fn() -> bool + Sync);

/// Toolchain context shared by both drivers.
pub(crate) struct SeparatorContext {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    /// Bounded parallelism for per-segment separator runs.
    pub segment_workers: usize,
}

pub(crate) trait SeparatorDriver: Send + Sync {
    fn kind(&self) -> SeparatorKind;

    /// Separate one chunk of audio, writing only inside `out_dir`. Returns
    /// the vocal stem path.
    fn separate_chunk(
        &self,
        wav_in: &Path,
        out_dir: &Path,
        progress: ProgressFn,
        cancel: CancelFn,
    ) -> Result<PathBuf>;
}

/// Run a driver over the whole input, segmenting when necessary. The
/// returned path is the complete vocal stem inside `out_dir`.
pub(crate) fn separate(
    driver: &dyn SeparatorDriver,
    ctx: &SeparatorContext,
    wav_in: &Path,
    out_dir: &Path,
    progress: ProgressFn,
    cancel: CancelFn,
) -> Result<PathBuf> {
    let duration = probe::duration_seconds(&ctx.ffprobe, wav_in)
        .map_err(|err| anyhow!("failed to measure input duration: {err}"))?;

    if duration <= SEGMENT_THRESHOLD_SECONDS {
        let chunk_dir = out_dir.join("full");
        std::fs::create_dir_all(&chunk_dir)
            .with_context(|| format!("failed to create {}", chunk_dir.display()))?;
        return driver.separate_chunk(wav_in, &chunk_dir, progress, cancel);
    }

    let segment_count = (duration / SEGMENT_LENGTH_SECONDS).ceil().max(1.0) as usize;
    let name = driver.kind().display_name();
    progress(0.0, &format!("{name}: splitting into {segment_count} segments"));

    let segments = split_into_segments(ctx, wav_in, out_dir, duration, segment_count, cancel)?;
    progress(5.0, &format!("{name}: {segment_count} segments ready"));

    let vocals = process_segments(driver, ctx, &segments, out_dir, progress, cancel)?;

    progress(95.0, &format!("{name}: concatenating segments"));
    let concatenated = concat_segments(ctx, &vocals, out_dir, cancel)?;
    progress(100.0, &format!("{name}: done"));
    Ok(concatenated)
}

/// Cut the input into contiguous `[i * len, (i + 1) * len)` slices. PCM in,
/// PCM out, so the cuts are sample-exact and the pieces re-concatenate to
/// the original duration.
fn split_into_segments(
    ctx: &SeparatorContext,
    wav_in: &Path,
    out_dir: &Path,
    duration: f64,
    segment_count: usize,
    cancel: CancelFn,
) -> Result<Vec<PathBuf>> {
    let seg_dir = out_dir.join("segments");
    std::fs::create_dir_all(&seg_dir)
        .with_context(|| format!("failed to create {}", seg_dir.display()))?;

    let mut segments = Vec::with_capacity(segment_count);
    for index in 0..segment_count {
        if cancel() {
            bail!("cancelled during segmentation");
        }
        let start = index as f64 * SEGMENT_LENGTH_SECONDS;
        let length = (duration - start).min(SEGMENT_LENGTH_SECONDS);
        let segment = seg_dir.join(format!("seg_{index:03}.wav"));

        let mut cmd = Command::new(&ctx.ffmpeg);
        cmd.arg("-y")
            .arg("-hide_banner")
            .arg("-ss")
            .arg(format!("{start:.6}"))
            .arg("-t")
            .arg(format!("{length:.6}"))
            .arg("-i")
            .arg(wav_in.as_os_str())
            .arg("-c:a")
            .arg("pcm_s16le")
            .arg(segment.as_os_str());
        match run_streaming(cmd, cancel, &mut |_| {})? {
            RunOutcome::Success => {}
            RunOutcome::Cancelled => bail!("cancelled during segmentation"),
        }
        segments.push(segment);
    }
    Ok(segments)
}

/// Run the driver over every segment with bounded parallelism, reporting a
/// progress tick per completed segment.
fn process_segments(
    driver: &dyn SeparatorDriver,
    ctx: &SeparatorContext,
    segments: &[PathBuf],
    out_dir: &Path,
    progress: ProgressFn,
    cancel: CancelFn,
) -> Result<Vec<PathBuf>> {
    let total = segments.len();
    let pending: Mutex<VecDeque<usize>> = Mutex::new((0..total).collect());
    let done = Mutex::new(0usize);
    let results: Mutex<Vec<Option<PathBuf>>> = Mutex::new(vec![None; total]);
    let failure: Mutex<Option<anyhow::Error>> = Mutex::new(None);

    let workers = ctx.segment_workers.max(1).min(total);
    let name = driver.kind().display_name();

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                loop {
                    if cancel() || failure.lock_unpoisoned().is_some() {
                        return;
                    }
                    let Some(index) = pending.lock_unpoisoned().pop_front() else {
                        return;
                    };
                    let chunk_dir = out_dir.join(format!("chunk_{index:03}"));
                    // Chunk-internal percentages are muted so one finished
                    // chunk cannot leap the whole band; completion ticks own
                    // the percentage. Labels (GPU fallback warnings etc.)
                    // still pass through at the current segment position.
                    let chunk_progress = |_pct: f64, step: &str| {
                        let completed = *done.lock_unpoisoned();
                        let pct = 5.0 + 90.0 * (completed as f64 / total as f64);
                        progress(pct, step);
                    };
                    let outcome = std::fs::create_dir_all(&chunk_dir)
                        .map_err(anyhow::Error::from)
                        .and_then(|()| {
                            driver.separate_chunk(
                                &segments[index],
                                &chunk_dir,
                                &chunk_progress,
                                cancel,
                            )
                        });
                    match outcome {
                        Ok(vocal) => {
                            results.lock_unpoisoned()[index] = Some(vocal);
                            let mut done = done.lock_unpoisoned();
                            *done += 1;
                            let pct = 5.0 + 90.0 * (*done as f64 / total as f64);
                            progress(
                                pct,
                                &format!("{name}: segment {done}/{total} complete", done = *done),
                            );
                        }
                        Err(err) => {
                            let mut slot = failure.lock_unpoisoned();
                            if slot.is_none() {
                                *slot = Some(err);
                            }
                            return;
                        }
                    }
                }
            });
        }
    });

    if cancel() {
        bail!("cancelled during separation");
    }
    if let Some(err) = failure.lock_unpoisoned().take() {
        return Err(err);
    }

    let results = results.lock_unpoisoned();
    results
        .iter()
        .enumerate()
        .map(|(index, slot)| {
            slot.clone()
                .ok_or_else(|| anyhow!("segment {index} produced no vocal stem"))
        })
        .collect()
}

/// Demuxer-concat the per-segment stems in start-time order.
fn concat_segments(
    ctx: &SeparatorContext,
    vocals: &[PathBuf],
    out_dir: &Path,
    cancel: CancelFn,
) -> Result<PathBuf> {
    let list_path = out_dir.join("concat.txt");
    let mut list = std::fs::File::create(&list_path)
        .with_context(|| format!("failed to create {}", list_path.display()))?;
    for vocal in vocals {
        // The concat demuxer's quoting rule: single quotes, embedded quotes
        // closed-escaped-reopened.
        let escaped = vocal.to_string_lossy().replace('\'', "'\\''");
        writeln!(list, "file '{escaped}'")
            .with_context(|| format!("failed to write {}", list_path.display()))?;
    }
    drop(list);

    let output = out_dir.join("vocals.wav");
    let mut cmd = Command::new(&ctx.ffmpeg);
    cmd.arg("-y")
        .arg("-hide_banner")
        .arg("-f")
        .arg("concat")
        .arg("-safe")
        .arg("0")
        .arg("-i")
        .arg(list_path.as_os_str())
        .arg("-c")
        .arg("copy")
        .arg(output.as_os_str());
    match run_streaming(cmd, cancel, &mut |_| {})? {
        RunOutcome::Success => Ok(output),
        RunOutcome::Cancelled => bail!("cancelled during concatenation"),
    }
}

/// True when NVML reports at least one CUDA device. Probed once per process.
pub(crate) fn cuda_available() -> bool {
    static AVAILABLE: Lazy<bool> = Lazy::new(|| {
        match nvml_wrapper::Nvml::init() {
            Ok(nvml) => match nvml.device_count() {
                Ok(count) => count > 0,
                Err(_) => false,
            },
            Err(_) => false,
        }
    });
    *AVAILABLE
}

static PERCENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|[\s|])(\d{1,3})(?:\.\d+)?%").expect("valid percent regex"));

/// Pull a `NN%` token out of a separator progress line.
pub(crate) fn parse_percent(line: &str) -> Option<f64> {
    let caps = PERCENT_RE.captures(line)?;
    let pct: f64 = caps.get(1)?.as_str().parse().ok()?;
    (pct <= 100.0).then_some(pct)
}

/// Heuristic for "the GPU path itself is broken, retry on CPU".
pub(crate) fn looks_like_gpu_failure(error_text: &str) -> bool {
    ["CUDA", "cuda", "cuDNN", "GPU out of memory", "device-side"]
        .iter()
        .any(|needle| error_text.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_parsing_handles_tqdm_and_plain_styles() {
        assert_eq!(parse_percent(" 42%|####      | 12/28"), Some(42.0));
        assert_eq!(parse_percent("progress: 7% done"), Some(7.0));
        assert_eq!(parse_percent("100%|##########|"), Some(100.0));
        assert_eq!(parse_percent("no percentage here"), None);
        assert_eq!(parse_percent("999% bogus"), None);
    }

    #[test]
    fn gpu_failure_heuristic_matches_common_messages() {
        assert!(looks_like_gpu_failure(
            "RuntimeError: CUDA error: no kernel image is available"
        ));
        assert!(looks_like_gpu_failure("Could not load cuDNN library"));
        assert!(!looks_like_gpu_failure("No such file or directory"));
    }

    #[test]
    fn segment_math_matches_the_contract() {
        // 1830 s splits into 600/600/600/30.
        let duration = 1830.0f64;
        let count = (duration / SEGMENT_LENGTH_SECONDS).ceil() as usize;
        assert_eq!(count, 4);
        let last_start = (count - 1) as f64 * SEGMENT_LENGTH_SECONDS;
        assert!((duration - last_start - 30.0).abs() < 1e-9);

        // Just over the threshold: exactly two segments.
        let duration = 600.5f64;
        let count = (duration / SEGMENT_LENGTH_SECONDS).ceil() as usize;
        assert_eq!(count, 2);
    }
}
