//! yt-dlp driver: remote format probing and queue-item downloads.
//!
//! All parsing of yt-dlp's output lives here so version drift in the tool
//! stays contained to this adapter.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use anyhow::Context;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::nomusic_core::domain::{FormatKind, QueueItem};
use crate::nomusic_core::error::{PipelineError, PipelineResult};
use crate::process_ext::{stderr_tail, terminate_child_two_stage};

const STDERR_TAIL_BYTES: usize = 4096;
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Backoff schedule between retries of a transient failure.
const RETRY_BACKOFF: [Duration; 3] = [
    Duration::from_secs(2),
    Duration::from_secs(4),
    Duration::from_secs(8),
];

static DOWNLOAD_PERCENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[download\]\s+(\d+(?:\.\d+)?)%").expect("valid percent regex"));

/// stderr fragments that mean retrying is pointless.
const PERMANENT_MARKERS: [&str; 6] = [
    "Unsupported URL",
    "is not a valid URL",
    "Video unavailable",
    "Private video",
    "Requested format is not available",
    "This live event",
];

#[derive(Debug, Clone, Serialize)]
pub struct RemoteFormat {
    pub format_id: String,
    pub ext: Option<String>,
    pub resolution: Option<String>,
    pub note: Option<String>,
    pub filesize: Option<u64>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemoteVideoInfo {
    pub id: String,
    pub title: String,
    pub thumbnail: Option<String>,
    pub subtitles: Vec<String>,
    pub formats: Vec<RemoteFormat>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlaylistEntry {
    pub id: String,
    pub title: String,
    pub url: String,
    pub duration: Option<f64>,
}

/// Either a single video description or a playlist listing.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum RemoteProbe {
    Playlist {
        is_playlist: bool,
        videos: Vec<PlaylistEntry>,
        video_count: usize,
    },
    Single(RemoteVideoInfo),
}

/// Probe a remote URL with `yt-dlp -J`.
pub(crate) fn probe_remote(
    ytdlp: &Path,
    url: &str,
    check_playlist: bool,
) -> PipelineResult<RemoteProbe> {
    let mut cmd = Command::new(ytdlp);
    cmd.arg("-J").arg("--no-warnings");
    if check_playlist {
        cmd.arg("--flat-playlist");
    } else {
        cmd.arg("--no-playlist");
    }
    cmd.arg(url);

    let output = cmd.output().map_err(|err| PipelineError::DownloadFailed {
        transient: false,
        message: format!("failed to run yt-dlp: {err}"),
    })?;
    if !output.status.success() {
        let tail = stderr_tail(&output.stderr, STDERR_TAIL_BYTES);
        return Err(PipelineError::DownloadFailed {
            transient: !is_permanent_failure(&tail),
            message: tail,
        });
    }

    let value: serde_json::Value =
        serde_json::from_slice(&output.stdout).map_err(|err| PipelineError::DownloadFailed {
            transient: false,
            message: format!("malformed yt-dlp JSON: {err}"),
        })?;

    Ok(parse_remote_probe(&value))
}

fn parse_remote_probe(value: &serde_json::Value) -> RemoteProbe {
    if value.get("_type").and_then(|t| t.as_str()) == Some("playlist") {
        let videos: Vec<PlaylistEntry> = value
            .get("entries")
            .and_then(|e| e.as_array())
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| {
                        let id = entry.get("id")?.as_str()?.to_string();
                        Some(PlaylistEntry {
                            url: entry
                                .get("url")
                                .and_then(|u| u.as_str())
                                .map(str::to_string)
                                .unwrap_or_else(|| {
                                    format!("https://www.youtube.com/watch?v={id}")
                                }),
                            title: entry
                                .get("title")
                                .and_then(|t| t.as_str())
                                .unwrap_or("(untitled)")
                                .to_string(),
                            duration: entry.get("duration").and_then(|d| d.as_f64()),
                            id,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        return RemoteProbe::Playlist {
            is_playlist: true,
            video_count: videos.len(),
            videos,
        };
    }

    let formats = value
        .get("formats")
        .and_then(|f| f.as_array())
        .map(|formats| {
            formats
                .iter()
                .filter_map(|f| {
                    Some(RemoteFormat {
                        format_id: f.get("format_id")?.as_str()?.to_string(),
                        ext: f.get("ext").and_then(|v| v.as_str()).map(str::to_string),
                        resolution: f
                            .get("resolution")
                            .and_then(|v| v.as_str())
                            .map(str::to_string),
                        note: f
                            .get("format_note")
                            .and_then(|v| v.as_str())
                            .map(str::to_string),
                        filesize: f.get("filesize").and_then(|v| v.as_u64()),
                        vcodec: f.get("vcodec").and_then(|v| v.as_str()).map(str::to_string),
                        acodec: f.get("acodec").and_then(|v| v.as_str()).map(str::to_string),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    RemoteProbe::Single(RemoteVideoInfo {
        id: value
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        title: value
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or("(untitled)")
            .to_string(),
        thumbnail: value
            .get("thumbnail")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        subtitles: value
            .get("subtitles")
            .and_then(|s| s.as_object())
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default(),
        formats,
    })
}

/// Download one queue item with the retry/backoff policy. Returns the final
/// media file path. `on_attempt` fires before each attempt with the 1-based
/// attempt number.
pub(crate) fn download_with_retries(
    ytdlp: &Path,
    item: &QueueItem,
    download_dir: &Path,
    attempt_timeout: Duration,
    cancel: &(dyn Fn() -> bool + Sync),
    progress: &(dyn Fn(f64) + Sync),
    on_attempt: &(dyn Fn(u32) + Sync),
) -> PipelineResult<PathBuf> {
    let mut last_error = None;
    for attempt in 0..=RETRY_BACKOFF.len() {
        if cancel() {
            return Err(PipelineError::Cancelled);
        }
        on_attempt(attempt as u32 + 1);

        match run_single_download(ytdlp, item, download_dir, attempt_timeout, cancel, progress) {
            Ok(path) => return Ok(path),
            Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
            Err(PipelineError::DownloadFailed { transient, message }) => {
                if !transient {
                    return Err(PipelineError::DownloadFailed { transient, message });
                }
                tracing::warn!(
                    url = %item.url,
                    attempt = attempt + 1,
                    "transient download failure: {message}"
                );
                last_error = Some(message);
                if attempt < RETRY_BACKOFF.len() {
                    sleep_cancellable(RETRY_BACKOFF[attempt], cancel);
                }
            }
            Err(other) => return Err(other),
        }
    }
    Err(PipelineError::DownloadFailed {
        transient: true,
        message: last_error.unwrap_or_else(|| "download failed after retries".to_string()),
    })
}

fn sleep_cancellable(total: Duration, cancel: &(dyn Fn() -> bool + Sync)) {
    let start = Instant::now();
    while start.elapsed() < total {
        if cancel() {
            return;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

fn build_download_args(item: &QueueItem, download_dir: &Path) -> Vec<String> {
    // An explicit title becomes the output stem; otherwise the remote title.
    let template = match item.title.as_deref() {
        Some(title) if !title.trim().is_empty() => format!("{}.%(ext)s", title.trim()),
        _ => "%(title)s.%(ext)s".to_string(),
    };
    let mut args: Vec<String> = vec![
        "--newline".into(),
        "--no-playlist".into(),
        "--no-warnings".into(),
        "--no-simulate".into(),
        "--print".into(),
        "after_move:filepath".into(),
        "-o".into(),
        download_dir.join(template).to_string_lossy().into_owned(),
    ];

    match &item.format_id {
        Some(format_id) if !format_id.is_empty() => {
            args.push("-f".into());
            args.push(format_id.clone());
        }
        _ => match item.format_kind {
            FormatKind::Audio => {
                args.push("-f".into());
                args.push("bestaudio/best".into());
            }
            FormatKind::Video => {
                args.push("-f".into());
                args.push("bestvideo+bestaudio/best".into());
            }
        },
    }
    if item.format_kind == FormatKind::Video {
        args.push("--merge-output-format".into());
        args.push("mp4".into());
    }

    match item.subtitles.as_deref() {
        None | Some("") | Some("none") => {}
        Some("all") => {
            args.push("--write-subs".into());
            args.push("--sub-langs".into());
            args.push("all".into());
        }
        Some(lang) => {
            args.push("--write-subs".into());
            args.push("--sub-langs".into());
            args.push(lang.to_string());
        }
    }

    args.push(item.url.clone());
    args
}

/// One yt-dlp invocation. Progress percentages stream on stdout; the final
/// file path is the last plain line (`--print after_move:filepath`).
fn run_single_download(
    ytdlp: &Path,
    item: &QueueItem,
    download_dir: &Path,
    timeout: Duration,
    cancel: &(dyn Fn() -> bool + Sync),
    progress: &(dyn Fn(f64) + Sync),
) -> PipelineResult<PathBuf> {
    let args = build_download_args(item, download_dir);
    let mut child = Command::new(ytdlp)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| PipelineError::DownloadFailed {
            transient: false,
            message: format!("failed to spawn yt-dlp: {err}"),
        })?;

    enum Line {
        Out(String),
        Err(String),
    }

    let (tx, rx) = mpsc::channel::<Line>();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let tx_out = tx.clone();
    let out_pump = std::thread::spawn(move || {
        let Some(stdout) = stdout else { return };
        for line in BufReader::new(stdout).lines() {
            let Ok(line) = line else { break };
            if tx_out.send(Line::Out(line)).is_err() {
                break;
            }
        }
    });
    let err_pump = std::thread::spawn(move || {
        let Some(stderr) = stderr else { return };
        for line in BufReader::new(stderr).lines() {
            let Ok(line) = line else { break };
            if tx.send(Line::Err(line)).is_err() {
                break;
            }
        }
    });

    let started = Instant::now();
    let mut final_path: Option<PathBuf> = None;
    let mut stderr_lines: Vec<String> = Vec::new();

    let mut handle_line = |line: Line, final_path: &mut Option<PathBuf>| match line {
        Line::Out(text) => {
            if let Some(pct) = parse_download_percent(&text) {
                progress(pct);
            } else if !text.trim().is_empty() && !text.starts_with('[') {
                // Candidate for the printed final path.
                *final_path = Some(PathBuf::from(text.trim()));
            }
        }
        Line::Err(text) => {
            if stderr_lines.len() >= 50 {
                stderr_lines.remove(0);
            }
            stderr_lines.push(text);
        }
    };

    let status = loop {
        if cancel() {
            terminate_child_two_stage(&mut child, KILL_GRACE);
            while rx.try_recv().is_ok() {}
            let _ = out_pump.join();
            let _ = err_pump.join();
            return Err(PipelineError::Cancelled);
        }
        if started.elapsed() > timeout {
            terminate_child_two_stage(&mut child, KILL_GRACE);
            while rx.try_recv().is_ok() {}
            let _ = out_pump.join();
            let _ = err_pump.join();
            return Err(PipelineError::DownloadFailed {
                transient: true,
                message: format!("attempt timed out after {}s", timeout.as_secs()),
            });
        }

        if let Ok(line) = rx.recv_timeout(Duration::from_millis(50)) {
            handle_line(line, &mut final_path);
        }

        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(err) => {
                let _ = child.kill();
                return Err(PipelineError::DownloadFailed {
                    transient: true,
                    message: format!("failed to poll yt-dlp: {err}"),
                });
            }
        }
    };
    // Join the pumps first so the final printed file path cannot be lost to
    // a drain/exit race.
    let _ = out_pump.join();
    let _ = err_pump.join();
    while let Ok(line) = rx.try_recv() {
        handle_line(line, &mut final_path);
    }

    if !status.success() {
        let tail = stderr_lines.join("\n");
        return Err(PipelineError::DownloadFailed {
            transient: !is_permanent_failure(&tail),
            message: tail,
        });
    }

    let path = final_path
        .context("yt-dlp exited successfully but printed no file path")
        .map_err(|err| PipelineError::DownloadFailed {
            transient: false,
            message: format!("{err:#}"),
        })?;
    if !path.is_file() {
        return Err(PipelineError::DownloadFailed {
            transient: false,
            message: format!("downloaded file {} does not exist", path.display()),
        });
    }
    progress(100.0);
    Ok(path)
}

pub(crate) fn parse_download_percent(line: &str) -> Option<f64> {
    let caps = DOWNLOAD_PERCENT_RE.captures(line)?;
    caps.get(1)?.as_str().parse().ok()
}

fn is_permanent_failure(stderr_text: &str) -> bool {
    PERMANENT_MARKERS
        .iter()
        .any(|marker| stderr_text.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn download_percent_lines_are_parsed() {
        assert_eq!(
            parse_download_percent("[download]  42.3% of 10.00MiB at 1.00MiB/s"),
            Some(42.3)
        );
        assert_eq!(
            parse_download_percent("[download] 100% of 10.00MiB in 00:10"),
            Some(100.0)
        );
        assert_eq!(parse_download_percent("[ExtractAudio] Destination: x"), None);
        assert_eq!(parse_download_percent("/data/download/file.mp4"), None);
    }

    #[test]
    fn permanent_failures_are_classified() {
        assert!(is_permanent_failure("ERROR: Unsupported URL: http://x"));
        assert!(is_permanent_failure("ERROR: Video unavailable"));
        assert!(!is_permanent_failure("ERROR: HTTP Error 503: Service Unavailable"));
    }

    #[test]
    fn single_video_probe_is_mapped() {
        let value = json!({
            "id": "abc123",
            "title": "A Song",
            "thumbnail": "https://i.example/t.jpg",
            "subtitles": {"en": [], "de": []},
            "formats": [
                {"format_id": "140", "ext": "m4a", "vcodec": "none", "acodec": "mp4a.40.2"},
                {"format_id": "137", "ext": "mp4", "resolution": "1920x1080",
                 "format_note": "1080p", "filesize": 123, "vcodec": "avc1", "acodec": "none"},
            ],
        });
        match parse_remote_probe(&value) {
            RemoteProbe::Single(info) => {
                assert_eq!(info.id, "abc123");
                assert_eq!(info.title, "A Song");
                assert_eq!(info.formats.len(), 2);
                let mut subs = info.subtitles.clone();
                subs.sort();
                assert_eq!(subs, vec!["de".to_string(), "en".to_string()]);
            }
            RemoteProbe::Playlist { .. } => panic!("expected single video"),
        }
    }

    #[test]
    fn playlist_probe_is_mapped_with_count() {
        let value = json!({
            "_type": "playlist",
            "entries": [
                {"id": "a", "title": "First", "url": "https://y/watch?v=a", "duration": 61.0},
                {"id": "b", "title": "Second"},
            ],
        });
        match parse_remote_probe(&value) {
            RemoteProbe::Playlist {
                is_playlist,
                videos,
                video_count,
            } => {
                assert!(is_playlist);
                assert_eq!(video_count, 2);
                assert_eq!(videos[0].url, "https://y/watch?v=a");
                // Entries without an explicit URL get one synthesized.
                assert!(videos[1].url.contains("watch?v=b"));
            }
            RemoteProbe::Single(_) => panic!("expected playlist"),
        }
    }

    #[test]
    fn download_args_respect_format_and_subtitles() {
        let item = QueueItem {
            queue_id: "q".into(),
            url: "https://example/v".into(),
            title: None,
            format_kind: FormatKind::Video,
            format_id: None,
            subtitles: Some("en".into()),
            auto_separate: false,
            status: crate::nomusic_core::domain::QueueItemStatus::Pending,
            progress: 0.0,
            attempt_count: 0,
            job_id: None,
            error: None,
            immediate: false,
        };
        let args = build_download_args(&item, Path::new("/data/download"));
        let joined = args.join(" ");
        assert!(joined.contains("-f bestvideo+bestaudio/best"));
        assert!(joined.contains("--merge-output-format mp4"));
        assert!(joined.contains("--write-subs"));
        assert!(joined.contains("--sub-langs en"));
        assert!(joined.ends_with("https://example/v"));

        let audio = QueueItem {
            format_kind: FormatKind::Audio,
            format_id: Some("140".into()),
            subtitles: None,
            ..item
        };
        let args = build_download_args(&audio, Path::new("/data/download"));
        let joined = args.join(" ");
        assert!(joined.contains("-f 140"));
        assert!(!joined.contains("--write-subs"));
    }
}
