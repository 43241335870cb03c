//! Fatal outcomes of an update run.
//!
//! Soft failures (cleanup left the source behind, launch not confirmed) are not
//! errors; they are reported in `UpdateReport` and logged as warnings.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for the update orchestrator.
pub type UpdateResult<T> = Result<T, UpdateError>;

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("no update source folder was given")]
    MissingSource,

    #[error("update source folder does not exist: {}", .0.display())]
    SourceNotFound(PathBuf),

    #[error("invalid update source {}: {reason}", .path.display())]
    InvalidSource { path: PathBuf, reason: &'static str },

    #[error("{} not found in update source", .0.display())]
    ExecutableMissingInSource(PathBuf),

    #[error("copying update files failed with mirror code {code}")]
    MirrorFailed { code: u8 },

    #[error("copying update files from {} failed", .source_dir.display())]
    Mirror {
        source_dir: PathBuf,
        source: std::io::Error,
    },

    #[error("{} missing after copy", .0.display())]
    ExecutableMissingAfterCopy(PathBuf),
}

impl UpdateError {
    /// Process exit code for this failure. Every fatal outcome maps to 1.
    pub fn exit_code(&self) -> i32 {
        1
    }
}
