//! # `update`: the RimSort Updater Entry Point
//!
//! RimSort downloads a new build into a temporary folder, then starts this binary
//! and quits. We parse the positional arguments, set up logging (console, plus the
//! caller's log file when given), and hand over to [`rimsort_updater::run_update`].
//!
//! Exit codes: `0` when the new build is in place (even if cleanup or relaunch only
//! produced warnings), `1` for any validation, copy or verification failure.

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use clap::{CommandFactory, Parser};
use log::{error, info, warn};

use rimsort_updater::config::{self, RetryPolicy, UpdatePlan};
use rimsort_updater::logfile;
use rimsort_updater::mirror::MirrorOptions;
use rimsort_updater::system::{self, HostSystem};
use rimsort_updater::run_update;

/// Command line for the updater.
///
/// Positionals are raw `OsString`s: the launcher may pass `""` for "no log file",
/// which clap's path parser would reject.
#[derive(Parser)]
#[command(name = "update")]
#[command(about = "Applies a downloaded RimSort update and relaunches the app", long_about = None)]
struct Cli {
    /// Temporary folder holding the new build.
    temp_update_path: Option<OsString>,

    /// Log file to append to. Empty or absent: console only.
    log_path: Option<OsString>,

    /// Installed application folder. Defaults to the current directory.
    app_folder: Option<OsString>,

    /// Executable to stop, verify and relaunch, relative to the app folder.
    #[arg(long, value_name = "PATH")]
    exe_name: Option<PathBuf>,

    /// Validate and report what would be copied without changing anything.
    #[arg(long)]
    dry_run: bool,

    /// Never ask for administrator rights (Windows).
    #[arg(long)]
    no_elevate: bool,

    /// Process-list checks while waiting for the old instance to exit.
    #[arg(long, default_value_t = 5)]
    terminate_polls: u32,

    /// Attempts at deleting the update folder.
    #[arg(long, default_value_t = 3)]
    cleanup_attempts: u32,

    /// Process-list checks after relaunching.
    #[arg(long, default_value_t = 5)]
    launch_polls: u32,

    /// Delay between polls and retries, in milliseconds.
    #[arg(long, value_name = "MS")]
    poll_delay_ms: Option<u64>,

    /// Retries per file when a copy fails.
    #[arg(long, default_value_t = 3)]
    copy_retries: u32,

    /// Turn on verbose logging.
    ///
    /// - `-v`: Debug
    /// - `-vv`: Trace
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn non_empty(arg: &Option<OsString>) -> Option<PathBuf> {
    arg.as_ref().filter(|a| !a.is_empty()).map(PathBuf::from)
}

fn main() {
    let cli = Cli::parse();

    // Nothing may touch the filesystem before the source argument is known,
    // so the missing-source path logs to the console only.
    let Some(source) = non_empty(&cli.temp_update_path) else {
        let _ = logfile::init(cli.verbose, None);
        error!("No update folder specified");
        let _ = Cli::command().print_help();
        std::process::exit(1);
    };

    let log_path = non_empty(&cli.log_path);
    // Logging failure shouldn't stop the update.
    let _ = logfile::init(cli.verbose, log_path.as_deref());
    info!("RimSort updater {} starting", env!("CARGO_PKG_VERSION"));

    let target = match non_empty(&cli.app_folder) {
        Some(dir) => dir,
        None => match std::env::current_dir() {
            Ok(dir) => dir,
            Err(e) => {
                error!("Cannot determine the current directory: {}", e);
                std::process::exit(1);
            }
        },
    };

    let mut retry = RetryPolicy {
        terminate_polls: cli.terminate_polls,
        cleanup_attempts: cli.cleanup_attempts,
        launch_polls: cli.launch_polls,
        ..RetryPolicy::default()
    };
    let mut mirror = MirrorOptions {
        retries: cli.copy_retries,
        ..MirrorOptions::default()
    };
    if let Some(ms) = cli.poll_delay_ms {
        let delay = Duration::from_millis(ms);
        retry = retry.with_delay(delay);
        mirror.wait = delay;
    }

    let plan = UpdatePlan {
        executable: cli.exe_name.clone().unwrap_or_else(config::default_executable),
        dry_run: cli.dry_run,
        retry,
        mirror,
        ..UpdatePlan::new(source, target)
    };

    // Only probe once the source looks real; a bad invocation must leave the disk alone.
    if !plan.dry_run && plan.source.is_dir() && !system::probe_writable(&plan.target) {
        request_write_access(&plan, cli.no_elevate);
    }

    match run_update(&plan, &HostSystem) {
        Ok(report) => {
            if report.has_warnings() {
                warn!("Update finished with warnings");
            }
        }
        Err(e) => {
            error!("Update aborted: {}", e);
            std::process::exit(e.exit_code());
        }
    }
}

/// The install folder is read-only for us. On Windows, retry the whole run elevated.
#[cfg(windows)]
fn request_write_access(plan: &UpdatePlan, no_elevate: bool) {
    use rimsort_updater::elevation;

    if no_elevate || elevation::is_elevated() {
        warn!("No write access to {}; the copy will likely fail", plan.target.display());
        return;
    }

    warn!("No write access to {}. Requesting administrator rights...", plan.target.display());
    let mut args: Vec<OsString> = std::env::args_os().skip(1).collect();
    args.push("--no-elevate".into());
    let workdir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));

    if let Some(code) = elevation::relaunch_elevated(&args, &workdir) {
        // The elevated process did the update; report its outcome as ours.
        info!("Elevated updater finished with exit code {}", code);
        std::process::exit(code);
    }
    error!("Elevation failed. Continuing with current privileges (this might fail)...");
}

#[cfg(not(windows))]
fn request_write_access(plan: &UpdatePlan, _no_elevate: bool) {
    warn!("No write access to {}; the copy will likely fail", plan.target.display());
}
