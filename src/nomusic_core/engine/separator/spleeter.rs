//! Spleeter adapter. Invokes the `spleeter` CLI with the 2-stems model and
//! collects `<out>/<input stem>/vocals.wav`.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Result, anyhow, bail};

use super::{
    CancelFn, ProgressFn, SeparatorDriver, cuda_available, looks_like_gpu_failure, parse_percent,
};
use crate::nomusic_core::domain::SeparatorKind;
use crate::nomusic_core::engine::ffmpeg::{RunOutcome, run_streaming};

pub(crate) struct SpleeterDriver {
    binary: PathBuf,
}

impl SpleeterDriver {
    pub fn from_env() -> Self {
        let binary = std::env::var_os("NOMUSIC_SPLEETER")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("spleeter"));
        Self { binary }
    }

    fn build_command(&self, wav_in: &Path, out_dir: &Path, use_gpu: bool) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("separate")
            .arg("-p")
            .arg("spleeter:2stems")
            .arg("-o")
            .arg(out_dir.as_os_str())
            .arg(wav_in.as_os_str());
        if !use_gpu {
            // TensorFlow grabs any visible CUDA device on its own; hiding
            // them is how CPU mode is requested.
            cmd.env("CUDA_VISIBLE_DEVICES", "-1");
        }
        cmd
    }
}

impl SeparatorDriver for SpleeterDriver {
    fn kind(&self) -> SeparatorKind {
        SeparatorKind::Spleeter
    }

    fn separate_chunk(
        &self,
        wav_in: &Path,
        out_dir: &Path,
        progress: ProgressFn,
        cancel: CancelFn,
    ) -> Result<PathBuf> {
        let mut use_gpu = cuda_available();
        progress(
            1.0,
            &format!(
                "Spleeter: starting ({})",
                if use_gpu { "GPU" } else { "CPU" }
            ),
        );

        for attempt in 0..2 {
            let cmd = self.build_command(wav_in, out_dir, use_gpu);
            let mut on_line = |line: &str| {
                if let Some(pct) = parse_percent(line) {
                    progress(pct, "Spleeter: separating");
                }
            };
            match run_streaming(cmd, cancel, &mut on_line) {
                Ok(RunOutcome::Success) => break,
                Ok(RunOutcome::Cancelled) => bail!("cancelled during Spleeter run"),
                Err(err) => {
                    let text = format!("{err:#}");
                    if attempt == 0 && use_gpu && looks_like_gpu_failure(&text) {
                        progress(1.0, "Spleeter: GPU initialization failed, retrying on CPU");
                        use_gpu = false;
                        continue;
                    }
                    return Err(err);
                }
            }
        }

        let stem = wav_in
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow!("input {} has no file stem", wav_in.display()))?;
        let vocal = out_dir.join(&stem).join("vocals.wav");
        if !vocal.is_file() {
            bail!(
                "Spleeter finished but produced no vocal stem at {}",
                vocal.display()
            );
        }
        progress(100.0, "Spleeter: vocal stem ready");
        Ok(vocal)
    }
}
