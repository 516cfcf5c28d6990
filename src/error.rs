//! Error taxonomy for the servicing core.
//!
//! Item-level problems (one driver, one package) never surface here; they are
//! recorded as [`crate::report::ItemFailure`] values. These errors describe
//! conditions that stop an operation outright.

use std::path::PathBuf;

use thiserror::Error;

use crate::engine::EngineError;
use crate::pipeline::Stage;

/// Convenience alias used across the library.
pub type Result<T, E = ServicingError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum ServicingError {
    /// The working directory already has a live mount claim.
    #[error("mount resource busy: working directory '{}' is claimed by another session", .working_dir.display())]
    ResourceBusy { working_dir: PathBuf },

    /// The native engine refused to mount the image.
    #[error("mounting '{}' (index {index}) at '{}' failed: {diagnostic}", .image.display(), .mount_point.display())]
    MountFailed {
        image: PathBuf,
        index: u32,
        mount_point: PathBuf,
        diagnostic: String,
    },

    /// An update package was applied under the wrong container assumption.
    #[error("package '{package}' rejected as a format mismatch: {diagnostic}")]
    FormatMismatch { package: String, diagnostic: String },

    /// The source image build is outside every supported release range.
    #[error("unsupported image build '{raw}': {reason}")]
    UnsupportedVersion { raw: String, reason: String },

    /// An `AbortPipeline` stage failed and halted the run.
    #[error("stage {stage} failed fatally: {reason}")]
    FatalStageFailure { stage: Stage, reason: String },

    /// The run was cancelled by the operator.
    #[error("run cancelled during stage {stage}")]
    Cancelled { stage: Stage },

    /// Interactive repair was declined, so the stale mount remains.
    #[error("repair of '{}' declined by operator", .mount_point.display())]
    RepairDeclined { mount_point: PathBuf },

    /// Two release ranges overlap or a range is empty.
    #[error("invalid release table: {0}")]
    InvalidReleaseTable(String),

    /// A stage tried to record a second outcome.
    #[error("stage {0} already recorded an outcome")]
    DuplicateOutcome(Stage),

    /// Commit or discard did not complete cleanly.
    #[error("releasing mount at '{}' failed: {diagnostic}", .mount_point.display())]
    ReleaseFailed {
        mount_point: PathBuf,
        diagnostic: String,
    },

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("I/O error on '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("session record error: {0}")]
    Record(#[from] serde_json::Error),
}

impl ServicingError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ServicingError::Io {
            path: path.into(),
            source,
        }
    }
}
