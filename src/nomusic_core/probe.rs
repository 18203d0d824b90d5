//! ffprobe wrapper: all container/stream metadata comes from here.

use std::path::Path;
use std::process::Command;

use serde::Deserialize;

use crate::nomusic_core::domain::{AudioTrack, MediaProbe};
use crate::nomusic_core::error::{PipelineError, PipelineResult};
use crate::process_ext::stderr_tail;

const STDERR_TAIL_BYTES: usize = 2048;

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    format: Option<FfprobeFormat>,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    index: u32,
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    #[serde(default)]
    disposition: FfprobeDisposition,
    #[serde(default)]
    tags: FfprobeTags,
}

#[derive(Debug, Default, Deserialize)]
struct FfprobeDisposition {
    #[serde(default)]
    attached_pic: u8,
}

#[derive(Debug, Default, Deserialize)]
struct FfprobeTags {
    language: Option<String>,
}

/// Probe a media file. Any non-zero exit or malformed output is fatal for
/// the calling job.
pub fn probe(ffprobe: &Path, source: &Path) -> PipelineResult<MediaProbe> {
    let output = Command::new(ffprobe)
        .arg("-v")
        .arg("error")
        .arg("-print_format")
        .arg("json")
        .arg("-show_format")
        .arg("-show_streams")
        .arg(source.as_os_str())
        .output()
        .map_err(|err| PipelineError::ProbeFailed {
            path: source.display().to_string(),
            stderr_tail: format!("failed to run ffprobe: {err}"),
        })?;

    if !output.status.success() {
        return Err(PipelineError::ProbeFailed {
            path: source.display().to_string(),
            stderr_tail: stderr_tail(&output.stderr, STDERR_TAIL_BYTES),
        });
    }

    let parsed: FfprobeOutput =
        serde_json::from_slice(&output.stdout).map_err(|err| PipelineError::ProbeFailed {
            path: source.display().to_string(),
            stderr_tail: format!("malformed ffprobe JSON: {err}"),
        })?;

    Ok(media_probe_from_ffprobe(parsed))
}

/// Cheap duration-only variant for intermediate WAVs.
pub fn duration_seconds(ffprobe: &Path, source: &Path) -> PipelineResult<f64> {
    let output = Command::new(ffprobe)
        .arg("-v")
        .arg("error")
        .arg("-show_entries")
        .arg("format=duration")
        .arg("-of")
        .arg("default=nw=1:nk=1")
        .arg(source.as_os_str())
        .output()
        .map_err(|err| PipelineError::ProbeFailed {
            path: source.display().to_string(),
            stderr_tail: format!("failed to run ffprobe: {err}"),
        })?;

    if !output.status.success() {
        return Err(PipelineError::ProbeFailed {
            path: source.display().to_string(),
            stderr_tail: stderr_tail(&output.stderr, STDERR_TAIL_BYTES),
        });
    }

    let text = String::from_utf8_lossy(&output.stdout);
    let first = text.lines().next().unwrap_or_default().trim();
    first.parse().map_err(|_| PipelineError::ProbeFailed {
        path: source.display().to_string(),
        stderr_tail: format!("unparseable duration {first:?}"),
    })
}

fn media_probe_from_ffprobe(parsed: FfprobeOutput) -> MediaProbe {
    let duration_seconds = parsed
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);

    // Cover art in audio files shows up as a video stream with the
    // attached_pic disposition; it does not make the input a video.
    let video = parsed.streams.iter().find(|s| {
        s.codec_type.as_deref() == Some("video") && s.disposition.attached_pic == 0
    });

    let audio_tracks: Vec<AudioTrack> = parsed
        .streams
        .iter()
        .filter(|s| s.codec_type.as_deref() == Some("audio"))
        .map(|s| AudioTrack {
            index: s.index,
            language: s.tags.language.clone(),
            codec: s.codec_name.clone(),
        })
        .collect();

    MediaProbe {
        duration_seconds,
        is_video: video.is_some(),
        video_codec: video.and_then(|s| s.codec_name.clone()),
        audio_codec: audio_tracks.first().and_then(|t| t.codec.clone()),
        resolution: video.and_then(|s| match (s.width, s.height) {
            (Some(w), Some(h)) => Some(format!("{w}x{h}")),
            _ => None,
        }),
        audio_tracks,
    }
}

/// Pick the audio track ordinal (`0:a:<n>`) to extract: first track matching
/// the preferred language, else the first audio track.
pub fn select_audio_track(probe: &MediaProbe, language: Option<&str>) -> Option<usize> {
    if probe.audio_tracks.is_empty() {
        return None;
    }
    if let Some(wanted) = language {
        for (ordinal, track) in probe.audio_tracks.iter().enumerate() {
            if track.language.as_deref() == Some(wanted) {
                return Some(ordinal);
            }
        }
    }
    Some(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: serde_json::Value) -> MediaProbe {
        media_probe_from_ffprobe(serde_json::from_value(value).expect("ffprobe JSON"))
    }

    #[test]
    fn video_file_probe_extracts_codecs_and_resolution() {
        let probe = parse(json!({
            "format": {"duration": "12.300000"},
            "streams": [
                {"index": 0, "codec_type": "video", "codec_name": "h264",
                 "width": 1920, "height": 1080},
                {"index": 1, "codec_type": "audio", "codec_name": "aac",
                 "tags": {"language": "eng"}},
            ]
        }));
        assert!(probe.is_video);
        assert_eq!(probe.video_codec.as_deref(), Some("h264"));
        assert_eq!(probe.resolution.as_deref(), Some("1920x1080"));
        assert_eq!(probe.audio_codec.as_deref(), Some("aac"));
        assert!((probe.duration_seconds - 12.3).abs() < 1e-9);
    }

    #[test]
    fn cover_art_does_not_make_audio_a_video() {
        let probe = parse(json!({
            "format": {"duration": "1830.0"},
            "streams": [
                {"index": 0, "codec_type": "audio", "codec_name": "flac"},
                {"index": 1, "codec_type": "video", "codec_name": "mjpeg",
                 "width": 500, "height": 500, "disposition": {"attached_pic": 1}},
            ]
        }));
        assert!(!probe.is_video);
        assert!(probe.video_codec.is_none());
        assert!(probe.resolution.is_none());
    }

    #[test]
    fn audio_track_selection_prefers_language_then_first() {
        let probe = parse(json!({
            "format": {"duration": "10.0"},
            "streams": [
                {"index": 1, "codec_type": "audio", "codec_name": "aac",
                 "tags": {"language": "eng"}},
                {"index": 2, "codec_type": "audio", "codec_name": "aac",
                 "tags": {"language": "jpn"}},
            ]
        }));
        assert_eq!(select_audio_track(&probe, Some("jpn")), Some(1));
        assert_eq!(select_audio_track(&probe, Some("deu")), Some(0));
        assert_eq!(select_audio_track(&probe, None), Some(0));
    }

    #[test]
    fn no_audio_tracks_yields_none() {
        let probe = parse(json!({
            "format": {"duration": "5.0"},
            "streams": [
                {"index": 0, "codec_type": "video", "codec_name": "h264",
                 "width": 640, "height": 480},
            ]
        }));
        assert_eq!(select_audio_track(&probe, None), None);
    }
}
