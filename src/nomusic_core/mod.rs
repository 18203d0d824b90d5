pub mod domain;
pub mod engine;
pub mod error;
pub mod paths;
pub mod probe;
pub mod settings;
pub mod tools;

pub use domain::{
    AudioTrack, BatchItem, BatchItemStatus, BatchSnapshot, DownloadRequest, FormatKind, Job,
    JobError, JobKind, JobSnapshot, JobStatus, LibraryEntry, MediaProbe, QueueItem,
    QueueItemStatus, SeparationOptions, SeparatorChoice, SeparatorKind,
};
pub use engine::{
    CancelOutcome, DownloadQueueSnapshot, RemoteProbe, RemoteVideoInfo, SeparationEngine,
};
pub use error::{PipelineError, PipelineResult};
pub use paths::DataDirs;
pub use settings::{AppSettings, Preset};
pub use tools::{ToolKind, ToolLocator, ToolStatus};
