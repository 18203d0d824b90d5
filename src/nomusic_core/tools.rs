//! External tool location and acquisition.
//!
//! Guarantees ffmpeg / ffprobe / yt-dlp are available and hands out absolute
//! paths. Resolution order: explicit env override, system PATH, previously
//! downloaded copy, then (when the policy allows) a fresh download into the
//! data root. Downloads are serialized per tool so concurrent callers share
//! one fetch, and successful resolutions are cached for the process lifetime.

use std::collections::HashMap;
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::nomusic_core::error::{PipelineError, PipelineResult};
use crate::process_ext::{run_command_with_timeout_capture_stderr, stderr_tail};
use crate::sync_ext::MutexExt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    Ffmpeg,
    Ffprobe,
    #[serde(rename = "yt-dlp")]
    YtDlp,
}

impl ToolKind {
    pub fn all() -> [ToolKind; 3] {
        [Self::Ffmpeg, Self::Ffprobe, Self::YtDlp]
    }

    pub fn binary_name(self) -> &'static str {
        match self {
            Self::Ffmpeg => "ffmpeg",
            Self::Ffprobe => "ffprobe",
            Self::YtDlp => "yt-dlp",
        }
    }

    fn env_override(self) -> &'static str {
        match self {
            Self::Ffmpeg => "NOMUSIC_FFMPEG",
            Self::Ffprobe => "NOMUSIC_FFPROBE",
            Self::YtDlp => "NOMUSIC_YTDLP",
        }
    }

    fn remediation_hint(self) -> &'static str {
        match self {
            Self::Ffmpeg | Self::Ffprobe => {
                "install ffmpeg and make sure it is on PATH, or set NOMUSIC_FFMPEG / NOMUSIC_FFPROBE"
            }
            Self::YtDlp => "install yt-dlp and make sure it is on PATH, or set NOMUSIC_YTDLP",
        }
    }
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.binary_name())
    }
}

/// Diagnostic view of one tool for `GET /tools`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolStatus {
    pub kind: ToolKind,
    pub resolved_path: Option<String>,
    /// "env", "path" or "download".
    pub source: Option<String>,
    pub auto_download_enabled: bool,
}

pub struct ToolLocator {
    tools_dir: PathBuf,
    auto_download: bool,
    cache: Mutex<HashMap<ToolKind, (PathBuf, &'static str)>>,
    fetch_locks: HashMap<ToolKind, Mutex<()>>,
}

impl ToolLocator {
    pub fn new(tools_dir: PathBuf, auto_download: bool) -> Self {
        let fetch_locks = ToolKind::all()
            .into_iter()
            .map(|kind| (kind, Mutex::new(())))
            .collect();
        Self {
            tools_dir,
            auto_download,
            cache: Mutex::new(HashMap::new()),
            fetch_locks,
        }
    }

    /// Resolve the absolute path of an external tool, downloading it when the
    /// policy allows. A partial toolchain is never returned: the caller gets
    /// a path that exists or a `MissingDependency`.
    pub fn locate(&self, kind: ToolKind) -> PipelineResult<PathBuf> {
        if let Some((path, _)) = self.cache.lock_unpoisoned().get(&kind) {
            return Ok(path.clone());
        }

        let (path, source) = match self.resolve_uncached(kind) {
            Some(found) => found,
            None if self.auto_download => {
                // Serialize fetches per tool so concurrent startup requests
                // share one download.
                let _guard = self.fetch_locks[&kind].lock_unpoisoned();
                if let Some(path) = self.downloaded_path_if_present(kind) {
                    (path, "download")
                } else {
                    let path = self.download(kind).map_err(|err| {
                        PipelineError::MissingDependency {
                            tool: kind.binary_name().to_string(),
                            hint: format!("{}; download failed: {err:#}", kind.remediation_hint()),
                        }
                    })?;
                    (path, "download")
                }
            }
            None => {
                return Err(PipelineError::MissingDependency {
                    tool: kind.binary_name().to_string(),
                    hint: kind.remediation_hint().to_string(),
                });
            }
        };

        self.cache
            .lock_unpoisoned()
            .insert(kind, (path.clone(), source));
        Ok(path)
    }

    pub fn statuses(&self) -> Vec<ToolStatus> {
        ToolKind::all()
            .into_iter()
            .map(|kind| {
                let cached = self.cache.lock_unpoisoned().get(&kind).cloned();
                let (resolved_path, source) = match cached {
                    Some((path, source)) => (
                        Some(path.to_string_lossy().into_owned()),
                        Some(source.to_string()),
                    ),
                    None => match self.resolve_uncached(kind) {
                        Some((path, source)) => (
                            Some(path.to_string_lossy().into_owned()),
                            Some(source.to_string()),
                        ),
                        None => (None, None),
                    },
                };
                ToolStatus {
                    kind,
                    resolved_path,
                    source,
                    auto_download_enabled: self.auto_download,
                }
            })
            .collect()
    }

    fn resolve_uncached(&self, kind: ToolKind) -> Option<(PathBuf, &'static str)> {
        if let Some(custom) = std::env::var_os(kind.env_override()) {
            let path = PathBuf::from(custom);
            if path.exists() {
                return Some((path, "env"));
            }
        }
        if let Ok(path) = which::which(kind.binary_name()) {
            return Some((path, "path"));
        }
        self.downloaded_path_if_present(kind)
            .map(|path| (path, "download"))
    }

    fn downloaded_path_if_present(&self, kind: ToolKind) -> Option<PathBuf> {
        let path = self.downloaded_path(kind);
        path.is_file().then_some(path)
    }

    fn downloaded_path(&self, kind: ToolKind) -> PathBuf {
        let name = if cfg!(windows) {
            format!("{}.exe", kind.binary_name())
        } else {
            kind.binary_name().to_string()
        };
        self.tools_dir.join(name)
    }

    fn download(&self, kind: ToolKind) -> Result<PathBuf> {
        fs::create_dir_all(&self.tools_dir).with_context(|| {
            format!("failed to create tools dir {}", self.tools_dir.display())
        })?;

        let url = download_url(kind)?;
        tracing::info!(tool = %kind, %url, "downloading external tool");

        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(600))
            .build()
            .context("failed to build download client")?;
        let response = client
            .get(&url)
            .send()
            .with_context(|| format!("request to {url} failed"))?;
        if !response.status().is_success() {
            bail!("HTTP {} fetching {url}", response.status());
        }
        let bytes = response
            .bytes()
            .with_context(|| format!("failed to read body of {url}"))?;

        let target = self.downloaded_path(kind);
        if url.ends_with(".zip") {
            extract_binary_from_zip(&bytes, kind.binary_name(), &target)?;
        } else {
            // yt-dlp ships as a bare executable, no archive.
            let mut file = fs::File::create(&target)
                .with_context(|| format!("failed to create {}", target.display()))?;
            file.write_all(&bytes)
                .with_context(|| format!("failed to write {}", target.display()))?;
        }
        mark_executable(&target)?;
        verify_tool_runs(&target, kind)?;

        tracing::info!(tool = %kind, path = %target.display(), "tool ready");
        Ok(target)
    }
}

/// A freshly downloaded binary that cannot even print its version is not a
/// usable toolchain member (wrong architecture, truncated download).
fn verify_tool_runs(path: &Path, kind: ToolKind) -> Result<()> {
    let mut cmd = std::process::Command::new(path);
    cmd.arg(match kind {
        ToolKind::YtDlp => "--version",
        ToolKind::Ffmpeg | ToolKind::Ffprobe => "-version",
    });
    let (status, timed_out, stderr) =
        run_command_with_timeout_capture_stderr(cmd, Duration::from_secs(15), 2048)
            .with_context(|| format!("downloaded {} is not executable", path.display()))?;
    if timed_out {
        bail!("{} hung during version check", path.display());
    }
    if !status.success() {
        bail!(
            "{} failed its version check: {}",
            path.display(),
            stderr_tail(&stderr, 512)
        );
    }
    Ok(())
}

/// Platform-appropriate archive or binary for one tool.
fn download_url(kind: ToolKind) -> Result<String> {
    match kind {
        ToolKind::YtDlp => {
            let asset = if cfg!(windows) {
                "yt-dlp.exe"
            } else if cfg!(target_os = "macos") {
                "yt-dlp_macos"
            } else {
                "yt-dlp"
            };
            Ok(format!(
                "https://github.com/yt-dlp/yt-dlp/releases/latest/download/{asset}"
            ))
        }
        ToolKind::Ffmpeg | ToolKind::Ffprobe => {
            let platform = if cfg!(windows) {
                "windows-64"
            } else if cfg!(target_os = "macos") {
                "macos-64"
            } else if cfg!(target_os = "linux") {
                "linux-64"
            } else {
                bail!("no prebuilt {} for this platform", kind.binary_name());
            };
            Ok(format!(
                "https://github.com/ffbinaries/ffbinaries-prebuilt/releases/download/v6.1/{}-6.1-{platform}.zip",
                kind.binary_name()
            ))
        }
    }
}

/// Pull the single named binary out of a zip archive, ignoring any
/// directory prefixes the packager added.
fn extract_binary_from_zip(bytes: &[u8], binary_name: &str, target: &Path) -> Result<()> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(bytes)).context("failed to open tool archive")?;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).context("failed to read archive entry")?;
        let Some(name) = entry.enclosed_name() else {
            continue;
        };
        let stem = name
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        if stem != binary_name {
            continue;
        }
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut data)
            .context("failed to decompress archive entry")?;
        let mut file = fs::File::create(target)
            .with_context(|| format!("failed to create {}", target.display()))?;
        file.write_all(&data)
            .with_context(|| format!("failed to write {}", target.display()))?;
        return Ok(());
    }
    bail!("archive did not contain a {binary_name} binary")
}

#[cfg(unix)]
fn mark_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)
        .with_context(|| format!("failed to stat {}", path.display()))?
        .permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms)
        .with_context(|| format!("failed to chmod {}", path.display()))?;
    Ok(())
}

#[cfg(not(unix))]
fn mark_executable(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_override_wins_over_everything() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fake = dir.path().join("fake-ffmpeg");
        fs::write(&fake, b"#!/bin/sh\n").expect("write fake tool");

        // SAFETY: tests in this module are the only writers of this variable.
        unsafe { std::env::set_var("NOMUSIC_FFMPEG", &fake) };
        let locator = ToolLocator::new(dir.path().join("tools"), false);
        let resolved = locator.locate(ToolKind::Ffmpeg).expect("locate ffmpeg");
        assert_eq!(resolved, fake);
        unsafe { std::env::remove_var("NOMUSIC_FFMPEG") };
    }

    #[test]
    fn missing_tool_without_download_policy_is_a_structured_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        // yt-dlp is unlikely to exist inside the test sandbox PATH; if it
        // does, the locate call legitimately succeeds and we skip.
        let locator = ToolLocator::new(dir.path().join("tools"), false);
        match locator.locate(ToolKind::YtDlp) {
            Ok(_) => {}
            Err(PipelineError::MissingDependency { tool, hint }) => {
                assert_eq!(tool, "yt-dlp");
                assert!(hint.contains("PATH"));
            }
            Err(other) => panic!("unexpected error kind: {other}"),
        }
    }

    #[test]
    fn cached_resolution_is_reused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fake = dir.path().join("yt-dlp");
        fs::write(&fake, b"").expect("write fake tool");

        unsafe { std::env::set_var("NOMUSIC_YTDLP", &fake) };
        let locator = ToolLocator::new(dir.path().join("tools"), false);
        let first = locator.locate(ToolKind::YtDlp).expect("first locate");
        unsafe { std::env::remove_var("NOMUSIC_YTDLP") };

        // Second lookup must hit the cache even though the env var is gone.
        let second = locator.locate(ToolKind::YtDlp).expect("second locate");
        assert_eq!(first, second);
    }

    #[test]
    fn download_urls_are_platform_shaped() {
        let url = download_url(ToolKind::Ffmpeg).expect("ffmpeg url");
        assert!(url.ends_with(".zip"));
        let url = download_url(ToolKind::YtDlp).expect("yt-dlp url");
        assert!(url.contains("yt-dlp/yt-dlp/releases"));
    }
}
