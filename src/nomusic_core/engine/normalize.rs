//! Two-pass EBU R128 loudness normalization via ffmpeg's loudnorm filter.
//!
//! Pass one measures the program loudness and prints a JSON summary on
//! stderr; pass two re-runs the filter in linear mode with the measured
//! values plugged in.

use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result};
use serde::Deserialize;

use super::extract::TARGET_SAMPLE_RATE;
use super::ffmpeg::{RunOutcome, parse_time_seconds, percent_of, run_streaming};

const TARGET_I: f64 = -16.0;
const TARGET_LRA: f64 = 11.0;
const TARGET_TP: f64 = -1.5;

/// Measurement block loudnorm prints after the first pass. ffmpeg encodes
/// every number as a JSON string.
#[derive(Debug, Deserialize)]
struct LoudnormMeasurement {
    input_i: String,
    input_lra: String,
    input_tp: String,
    input_thresh: String,
    target_offset: String,
}

pub(crate) fn normalize_two_pass(
    ffmpeg: &Path,
    input_wav: &Path,
    out_wav: &Path,
    total_duration: Option<f64>,
    cancel: &(dyn Fn() -> bool + Sync),
    progress: &(dyn Fn(f64) + Sync),
) -> Result<RunOutcome> {
    let measurement = match measure_pass(ffmpeg, input_wav, cancel)? {
        Some(m) => m,
        None => return Ok(RunOutcome::Cancelled),
    };

    let filter = format!(
        "loudnorm=I={TARGET_I}:LRA={TARGET_LRA}:TP={TARGET_TP}:\
         measured_I={}:measured_LRA={}:measured_TP={}:measured_thresh={}:offset={}:linear=true",
        measurement.input_i,
        measurement.input_lra,
        measurement.input_tp,
        measurement.input_thresh,
        measurement.target_offset,
    );

    let mut cmd = Command::new(ffmpeg);
    cmd.arg("-y")
        .arg("-hide_banner")
        .arg("-i")
        .arg(input_wav.as_os_str())
        .arg("-af")
        .arg(&filter)
        // loudnorm internally resamples; pin the output rate back down.
        .arg("-ar")
        .arg(TARGET_SAMPLE_RATE.to_string())
        .arg("-c:a")
        .arg("pcm_s16le")
        .arg(out_wav.as_os_str());

    run_streaming(cmd, cancel, &mut |line| {
        if let Some(elapsed) = parse_time_seconds(line)
            && let Some(pct) = percent_of(elapsed, total_duration)
        {
            // The measuring pass was the first half of this phase's range.
            progress(50.0 + pct / 2.0);
        }
    })
}

fn measure_pass(
    ffmpeg: &Path,
    input_wav: &Path,
    cancel: &(dyn Fn() -> bool + Sync),
) -> Result<Option<LoudnormMeasurement>> {
    let mut cmd = Command::new(ffmpeg);
    cmd.arg("-hide_banner")
        .arg("-i")
        .arg(input_wav.as_os_str())
        .arg("-af")
        .arg(format!(
            "loudnorm=I={TARGET_I}:LRA={TARGET_LRA}:TP={TARGET_TP}:print_format=json"
        ))
        .arg("-f")
        .arg("null")
        .arg("-");

    let mut captured = Vec::new();
    let outcome = run_streaming(cmd, cancel, &mut |line| {
        captured.push(line.to_string());
    })?;
    if matches!(outcome, RunOutcome::Cancelled) {
        return Ok(None);
    }

    let json = extract_trailing_json(&captured)
        .context("loudnorm measuring pass printed no JSON summary")?;
    let measurement: LoudnormMeasurement =
        serde_json::from_str(&json).context("failed to parse loudnorm measurement JSON")?;
    Ok(Some(measurement))
}

/// The JSON block is the last `{ ... }` region of stderr, after the regular
/// transcode log lines.
fn extract_trailing_json(lines: &[String]) -> Option<String> {
    let start = lines.iter().rposition(|l| l.trim() == "{")?;
    let mut block = String::new();
    for line in &lines[start..] {
        block.push_str(line);
        block.push('\n');
        if line.trim() == "}" {
            return Some(block);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_json_block_is_extracted_from_noisy_stderr() {
        let lines: Vec<String> = [
            "size=N/A time=00:00:12.30 bitrate=N/A speed= 412x",
            "[Parsed_loudnorm_0 @ 0x55d] ",
            "{",
            "\t\"input_i\" : \"-27.61\",",
            "\t\"input_tp\" : \"-8.78\",",
            "\t\"input_lra\" : \"5.60\",",
            "\t\"input_thresh\" : \"-38.13\",",
            "\t\"output_i\" : \"-16.58\",",
            "\t\"output_tp\" : \"-1.50\",",
            "\t\"output_lra\" : \"4.70\",",
            "\t\"output_thresh\" : \"-27.01\",",
            "\t\"normalization_type\" : \"dynamic\",",
            "\t\"target_offset\" : \"0.58\"",
            "}",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let json = extract_trailing_json(&lines).expect("json block");
        let parsed: LoudnormMeasurement = serde_json::from_str(&json).expect("parse measurement");
        assert_eq!(parsed.input_i, "-27.61");
        assert_eq!(parsed.target_offset, "0.58");
    }

    #[test]
    fn missing_json_block_is_none() {
        let lines = vec!["just logs".to_string(), "no json".to_string()];
        assert!(extract_trailing_json(&lines).is_none());
    }
}
