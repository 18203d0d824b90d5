use thiserror::Error;

use crate::nomusic_core::domain::SeparatorKind;

/// Structured failure kinds for the separation pipeline and queues.
///
/// Every subprocess failure carries a bounded stderr tail so `status` can
/// always surface something actionable without re-running the tool.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("missing dependency: {tool} ({hint})")]
    MissingDependency { tool: String, hint: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("ffprobe failed for {path}: {stderr_tail}")]
    ProbeFailed { path: String, stderr_tail: String },

    #[error("audio extraction failed: {stderr_tail}")]
    ExtractFailed { stderr_tail: String },

    #[error("{which} separator failed: {stderr_tail}")]
    SeparatorFailed {
        which: SeparatorKind,
        stderr_tail: String,
    },

    #[error("mixing failed: {0}")]
    MixFailed(String),

    #[error("loudness normalization failed: {stderr_tail}")]
    NormalizeFailed { stderr_tail: String },

    #[error("remux failed: {stderr_tail}")]
    RemuxFailed { stderr_tail: String },

    #[error("download failed ({}): {message}", transience(.transient))]
    DownloadFailed { transient: bool, message: String },

    #[error("cancelled")]
    Cancelled,

    #[error("queue state error: {0}")]
    QueueStateError(String),
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

fn transience(transient: &bool) -> &'static str {
    if *transient { "transient" } else { "permanent" }
}

impl PipelineError {
    /// Stable machine-readable kind, used as the error code in job snapshots.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingDependency { .. } => "missing_dependency",
            Self::InvalidInput(_) => "invalid_input",
            Self::ProbeFailed { .. } => "probe_failed",
            Self::ExtractFailed { .. } => "extract_failed",
            Self::SeparatorFailed { .. } => "separator_failed",
            Self::MixFailed(_) => "mix_failed",
            Self::NormalizeFailed { .. } => "normalize_failed",
            Self::RemuxFailed { .. } => "remux_failed",
            Self::DownloadFailed { .. } => "download_failed",
            Self::Cancelled => "cancelled",
            Self::QueueStateError(_) => "queue_state_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_error_message_distinguishes_transient_from_permanent() {
        let transient = PipelineError::DownloadFailed {
            transient: true,
            message: "timed out".into(),
        };
        assert!(transient.to_string().contains("transient"));

        let permanent = PipelineError::DownloadFailed {
            transient: false,
            message: "404".into(),
        };
        assert!(permanent.to_string().contains("permanent"));
    }

    #[test]
    fn separator_failure_names_the_driver() {
        let err = PipelineError::SeparatorFailed {
            which: SeparatorKind::Demucs,
            stderr_tail: "CUDA out of memory".into(),
        };
        let text = err.to_string();
        assert!(text.contains("demucs"), "got: {text}");
        assert!(text.contains("CUDA out of memory"));
    }
}
