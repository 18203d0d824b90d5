//! Audio extraction: decode the selected track to 44.1 kHz stereo PCM, the
//! format both separators require. Mono sources are upmixed here so the
//! drivers never see anything but stereo.

use std::path::Path;
use std::process::Command;

use anyhow::Result;

use super::ffmpeg::{RunOutcome, parse_time_seconds, percent_of, run_streaming};

pub(crate) const TARGET_SAMPLE_RATE: u32 = 44_100;

pub(crate) fn extract_wav(
    ffmpeg: &Path,
    input: &Path,
    out_wav: &Path,
    audio_track_ordinal: usize,
    total_duration: Option<f64>,
    cancel: &(dyn Fn() -> bool + Sync),
    progress: &(dyn Fn(f64) + Sync),
) -> Result<RunOutcome> {
    let mut cmd = Command::new(ffmpeg);
    cmd.arg("-y")
        .arg("-hide_banner")
        .arg("-i")
        .arg(input.as_os_str())
        .arg("-map")
        .arg(format!("0:a:{audio_track_ordinal}"))
        .arg("-vn")
        .arg("-ac")
        .arg("2")
        .arg("-ar")
        .arg(TARGET_SAMPLE_RATE.to_string())
        .arg("-c:a")
        .arg("pcm_s16le")
        .arg(out_wav.as_os_str());

    run_streaming(cmd, cancel, &mut |line| {
        if let Some(elapsed) = parse_time_seconds(line)
            && let Some(pct) = percent_of(elapsed, total_duration)
        {
            progress(pct);
        }
    })
}
