//! # Run Configuration
//!
//! Everything an update run needs to know, resolved once from the command line.
//! There is no config file: the updater is launched by the application itself with
//! positional arguments, and the timing knobs below only exist for tests and for
//! slow machines.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::mirror::MirrorOptions;

/// Name of the application this updater replaces.
pub const APP_NAME: &str = "RimSort";

/// The executable expected at the root of both the update and the install folder.
pub fn default_executable() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(format!("{APP_NAME}.exe"))
    } else {
        PathBuf::from(APP_NAME)
    }
}

/// Bounded retry/poll counts for the steps that wait on the OS.
///
/// None of these are timers. Each loop runs a fixed number of times with a fixed
/// sleep in between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Polls for the old instance to exit after it was told to terminate.
    pub terminate_polls: u32,
    pub terminate_delay: Duration,
    /// Attempts at deleting the update source folder.
    pub cleanup_attempts: u32,
    pub cleanup_delay: Duration,
    /// Polls for the relaunched process to show up in the process list.
    pub launch_polls: u32,
    pub launch_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            terminate_polls: 5,
            terminate_delay: Duration::from_secs(1),
            cleanup_attempts: 3,
            cleanup_delay: Duration::from_secs(2),
            launch_polls: 5,
            launch_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// A policy with every delay set to zero. Loop counts are kept.
    pub fn immediate() -> Self {
        Self {
            terminate_delay: Duration::ZERO,
            cleanup_delay: Duration::ZERO,
            launch_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Overrides all three poll/retry delays at once.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.terminate_delay = delay;
        self.cleanup_delay = delay;
        self.launch_delay = delay;
        self
    }
}

/// A fully resolved update run.
#[derive(Debug, Clone)]
pub struct UpdatePlan {
    /// Temporary folder holding the new build.
    pub source: PathBuf,
    /// Installed application folder that gets overwritten.
    pub target: PathBuf,
    /// Executable path relative to both `source` and `target`.
    pub executable: PathBuf,
    /// Validate and count, but touch nothing.
    pub dry_run: bool,
    pub retry: RetryPolicy,
    pub mirror: MirrorOptions,
}

impl UpdatePlan {
    pub fn new(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            executable: default_executable(),
            dry_run: false,
            retry: RetryPolicy::default(),
            mirror: MirrorOptions::default(),
        }
    }

    pub fn executable_in(&self, dir: &Path) -> PathBuf {
        dir.join(&self.executable)
    }

    /// Name the running application shows up under in the process list.
    pub fn process_name(&self) -> String {
        self.executable
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.executable.to_string_lossy().into_owned())
    }
}
