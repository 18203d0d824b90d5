//! Final remux: combine the normalized vocal track with the original video
//! stream (or package it alone for audio-only sources), driven by the
//! active preset.

use std::path::Path;
use std::process::Command;

use anyhow::Result;

use super::ffmpeg::{RunOutcome, parse_time_seconds, percent_of, run_streaming};
use crate::nomusic_core::settings::Preset;

pub(crate) fn remux(
    ffmpeg: &Path,
    original_input: &Path,
    normalized_wav: &Path,
    out_path: &Path,
    preset: &Preset,
    source_is_video: bool,
    total_duration: Option<f64>,
    cancel: &(dyn Fn() -> bool + Sync),
    progress: &(dyn Fn(f64) + Sync),
) -> Result<RunOutcome> {
    let mut cmd = Command::new(ffmpeg);
    cmd.arg("-y").arg("-hide_banner");

    if source_is_video {
        cmd.arg("-i")
            .arg(original_input.as_os_str())
            .arg("-i")
            .arg(normalized_wav.as_os_str())
            .arg("-map")
            .arg("0:v:0")
            .arg("-map")
            .arg("1:a:0");
        apply_video_args(&mut cmd, preset);
    } else {
        cmd.arg("-i").arg(normalized_wav.as_os_str());
    }
    apply_audio_args(&mut cmd, preset);

    cmd.arg(out_path.as_os_str());

    run_streaming(cmd, cancel, &mut |line| {
        if let Some(elapsed) = parse_time_seconds(line)
            && let Some(pct) = percent_of(elapsed, total_duration)
        {
            progress(pct);
        }
    })
}

fn apply_video_args(cmd: &mut Command, preset: &Preset) {
    match preset.video.codec.as_deref() {
        None | Some("copy") => {
            cmd.arg("-c:v").arg("copy");
        }
        Some(codec) => {
            cmd.arg("-c:v").arg(codec);
            if let Some(bitrate) = &preset.video.bitrate {
                cmd.arg("-b:v").arg(bitrate);
            }
        }
    }
}

fn apply_audio_args(cmd: &mut Command, preset: &Preset) {
    cmd.arg("-c:a").arg(&preset.audio.codec);
    cmd.arg("-b:a").arg(&preset.audio.bitrate);
}

/// Container extension for the final file, from the active preset.
pub(crate) fn output_extension(preset: &Preset) -> &str {
    let format = preset.output.format.trim();
    if format.is_empty() { "mp4" } else { format }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nomusic_core::settings::{AudioSettings, OutputSettings, VideoSettings};

    fn args_of(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn copy_preset_copies_the_video_stream() {
        let preset = Preset {
            video: VideoSettings {
                codec: Some("copy".into()),
                bitrate: Some("ignored".into()),
            },
            audio: AudioSettings::default(),
            output: OutputSettings::default(),
        };
        let mut cmd = Command::new("ffmpeg");
        apply_video_args(&mut cmd, &preset);
        let args = args_of(&cmd);
        assert_eq!(args, vec!["-c:v", "copy"]);
    }

    #[test]
    fn encode_preset_sets_codec_and_bitrate() {
        let preset = Preset {
            video: VideoSettings {
                codec: Some("libx264".into()),
                bitrate: Some("5000k".into()),
            },
            audio: AudioSettings {
                codec: "aac".into(),
                bitrate: "192k".into(),
            },
            output: OutputSettings { format: "mkv".into() },
        };
        let mut cmd = Command::new("ffmpeg");
        apply_video_args(&mut cmd, &preset);
        apply_audio_args(&mut cmd, &preset);
        let args = args_of(&cmd);
        assert_eq!(
            args,
            vec!["-c:v", "libx264", "-b:v", "5000k", "-c:a", "aac", "-b:a", "192k"]
        );
        assert_eq!(output_extension(&preset), "mkv");
    }

    #[test]
    fn empty_output_format_falls_back_to_mp4() {
        let preset = Preset {
            video: VideoSettings::default(),
            audio: AudioSettings::default(),
            output: OutputSettings { format: "".into() },
        };
        assert_eq!(output_extension(&preset), "mp4");
    }
}
