//! # RimSort Updater
//!
//! Applies a downloaded RimSort build to an installed copy: stop the running app,
//! mirror the new files over it, clean up and relaunch. The same crate ships the
//! `smoke_test` tool that release CI runs against every packaged build.
//!
//! The `update` binary is started by RimSort itself with positional arguments:
//!
//! ```text
//! update <temp_update_path> [log_path] [app_folder]
//! ```

pub mod archive;
pub mod config;
#[cfg(windows)]
pub mod elevation;
pub mod error;
pub mod logfile;
pub mod mirror;
pub mod process;
pub mod smoke;
pub mod system;
pub mod updater;

pub use config::{RetryPolicy, UpdatePlan};
pub use error::{UpdateError, UpdateResult};
pub use updater::{CleanupOutcome, LaunchOutcome, UpdateReport, run_update};
