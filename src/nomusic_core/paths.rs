use std::io;
use std::path::{Path, PathBuf};

/// All on-disk locations the service touches, rooted in one data directory.
///
/// The root comes from `NOMUSIC_DATA_DIR` (default `./data`) and is injected
/// into the engine so tests can point it at a scratch directory.
#[derive(Debug, Clone)]
pub struct DataDirs {
    root: PathBuf,
}

impl DataDirs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_env() -> Self {
        let root = std::env::var_os("NOMUSIC_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("data"));
        Self { root }
    }

    /// Create the fixed directory layout. Called once at startup.
    pub fn ensure_layout(&self) -> io::Result<()> {
        for dir in [
            self.root.clone(),
            self.download_dir(),
            self.output_dir(),
            self.tmp_root(),
            self.tools_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Raw downloads land here.
    pub fn download_dir(&self) -> PathBuf {
        self.root.join("download")
    }

    /// Final separated files land here, named `nomusic-<stem>.<ext>`.
    pub fn output_dir(&self) -> PathBuf {
        self.root.join("nomusic")
    }

    /// Auto-downloaded external tools.
    pub fn tools_dir(&self) -> PathBuf {
        self.root.join("tools")
    }

    pub fn tmp_root(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Per-job scratch space; the job owns this directory exclusively.
    pub fn job_temp_dir(&self, job_id: &str) -> PathBuf {
        self.tmp_root().join(job_id)
    }

    pub fn queue_state_path(&self) -> PathBuf {
        self.root.join("download_queue.json")
    }

    pub fn library_path(&self) -> PathBuf {
        self.root.join("library.json")
    }

    pub fn presets_path(&self) -> PathBuf {
        self.root.join("video.json")
    }

    /// UI-facing rendering of a result path: relative to the data root when
    /// it lives inside it (`nomusic/nomusic-clip.mp4`), absolute otherwise.
    pub fn display_path(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned()
    }
}

/// Output name for a separated file: `nomusic-<original stem>.<ext>`.
pub fn output_file_name(input: &Path, ext: &str) -> String {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    format!("nomusic-{stem}.{ext}")
}
