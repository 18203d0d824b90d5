//! Process-wide configuration: output presets (`video.json`) and the
//! processing knobs for the worker pools.

pub(crate) mod io;

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

pub(crate) use io::{read_json_file, write_json_file};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoSettings {
    /// Output video codec; "copy" keeps the source stream untouched.
    pub codec: Option<String>,
    /// e.g. "5000k"; None lets the encoder pick.
    pub bitrate: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSettings {
    pub codec: String,
    pub bitrate: String,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            codec: "aac".to_string(),
            bitrate: "192k".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSettings {
    pub format: String,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            format: "mp4".to_string(),
        }
    }
}

/// A named bundle of codec/bitrate/container settings applied at remux time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Preset {
    pub video: VideoSettings,
    pub audio: AudioSettings,
    pub output: OutputSettings,
}

/// Worker-pool bounds. The separators hold ~8 GB each, so the defaults are
/// deliberately conservative.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingSettings {
    /// Concurrent separation jobs.
    pub workers: usize,
    /// Concurrent segments inside one separator run.
    pub segment_workers: usize,
    /// Concurrent downloads.
    pub download_workers: usize,
    /// Per-attempt downloader timeout.
    pub download_timeout_minutes: u64,
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            workers: 1,
            segment_workers: 2,
            download_workers: 1,
            download_timeout_minutes: 30,
        }
    }
}

/// On-disk schema of `video.json`: a preset map plus optional top-level
/// overrides that win over the selected preset's sections.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub presets: BTreeMap<String, Preset>,
    pub current_preset: String,
    pub video: Option<VideoSettings>,
    pub audio: Option<AudioSettings>,
    pub output: Option<OutputSettings>,
    pub processing: ProcessingSettings,
}

impl Default for AppSettings {
    fn default() -> Self {
        let mut presets = BTreeMap::new();
        presets.insert(
            "copy".to_string(),
            Preset {
                video: VideoSettings {
                    codec: Some("copy".to_string()),
                    bitrate: None,
                },
                audio: AudioSettings::default(),
                output: OutputSettings::default(),
            },
        );
        presets.insert(
            "compat".to_string(),
            Preset {
                video: VideoSettings {
                    codec: Some("libx264".to_string()),
                    bitrate: Some("5000k".to_string()),
                },
                audio: AudioSettings::default(),
                output: OutputSettings::default(),
            },
        );
        Self {
            presets,
            current_preset: "copy".to_string(),
            video: None,
            audio: None,
            output: None,
            processing: ProcessingSettings::default(),
        }
    }
}

impl AppSettings {
    /// The preset the remux phase should use: the selected entry with any
    /// top-level overrides applied. Falls back to defaults when the selector
    /// names a preset that no longer exists.
    pub fn active_preset(&self) -> Preset {
        let mut preset = self
            .presets
            .get(&self.current_preset)
            .cloned()
            .unwrap_or_default();
        if let Some(video) = &self.video {
            preset.video = video.clone();
        }
        if let Some(audio) = &self.audio {
            preset.audio = audio.clone();
        }
        if let Some(output) = &self.output {
            preset.output = output.clone();
        }
        preset
    }
}

/// Load settings, falling back to defaults when the file is missing or
/// unreadable. A corrupt config should never prevent startup.
pub fn load_settings(path: &Path) -> AppSettings {
    if !path.exists() {
        return AppSettings::default();
    }
    match read_json_file::<AppSettings>(path) {
        Ok(settings) => settings,
        Err(err) => {
            tracing::warn!("failed to load {}: {err:#}; using defaults", path.display());
            AppSettings::default()
        }
    }
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> Result<()> {
    write_json_file(path, settings)
}
