//! # Update Orchestrator
//!
//! Replaces an installed application folder with a freshly downloaded build:
//!
//! 1. Validate the update folder.
//! 2. Stop any running instance of the application.
//! 3. Check the update actually contains the executable.
//! 4. Mirror the update folder over the install folder.
//! 5. Verify the executable landed.
//! 6. Delete the update folder (best effort).
//! 7. Relaunch and wait for the process to show up (best effort).
//!
//! Steps 1-5 are fatal on failure; nothing after a successful copy can turn the
//! run into a failure, because by then the new build is in place.

use std::path::Path;

use log::{debug, error, info, warn};

use crate::config::UpdatePlan;
use crate::error::{UpdateError, UpdateResult};
use crate::mirror::{MirrorOptions, MirrorReport, MirrorStatus};
use crate::process::LaunchMethod;
use crate::system::SystemOps;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    Removed { attempts: u32 },
    /// The update folder is still on disk after every attempt.
    Left,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// The process showed up on poll number `polls`.
    Confirmed { method: LaunchMethod, polls: u32 },
    /// Started, but never seen in the process list. It may still be loading.
    Unconfirmed { method: LaunchMethod },
    /// Neither launcher could start it.
    Failed,
    Skipped,
}

/// What a completed (exit code 0) run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateReport {
    pub terminated: usize,
    pub mirror: MirrorReport,
    pub cleanup: CleanupOutcome,
    pub launch: LaunchOutcome,
}

impl UpdateReport {
    pub fn has_warnings(&self) -> bool {
        matches!(self.cleanup, CleanupOutcome::Left)
            || matches!(self.launch, LaunchOutcome::Unconfirmed { .. } | LaunchOutcome::Failed)
    }
}

/// Runs the whole update sequence against `system`.
pub fn run_update(plan: &UpdatePlan, system: &impl SystemOps) -> UpdateResult<UpdateReport> {
    validate_source(plan, system)?;
    let process_name = plan.process_name();

    let terminated = if plan.dry_run {
        let running = system.is_process_running(&process_name);
        info!("Dry run: {} is {}running", process_name, if running { "" } else { "not " });
        0
    } else {
        stop_running_instances(plan, system, &process_name)
    };

    let source_exe = plan.executable_in(&plan.source);
    if !system.is_file(&source_exe) {
        error!("{} not found in update folder {}", plan.executable.display(), plan.source.display());
        return Err(UpdateError::ExecutableMissingInSource(source_exe));
    }

    let mirror = copy_update(plan, system)?;

    if plan.dry_run {
        info!("Dry run complete: {}", mirror.summary());
        return Ok(UpdateReport {
            terminated,
            mirror,
            cleanup: CleanupOutcome::Skipped,
            launch: LaunchOutcome::Skipped,
        });
    }

    let target_exe = plan.executable_in(&plan.target);
    if !system.is_file(&target_exe) {
        error!("{} missing after copy", target_exe.display());
        return Err(UpdateError::ExecutableMissingAfterCopy(target_exe));
    }

    let cleanup = remove_source(plan, system);
    let launch = relaunch(plan, system, &target_exe, &process_name);

    info!("Update complete");
    Ok(UpdateReport {
        terminated,
        mirror,
        cleanup,
        launch,
    })
}

fn validate_source(plan: &UpdatePlan, system: &impl SystemOps) -> UpdateResult<()> {
    if plan.source.as_os_str().is_empty() {
        error!("No update folder specified");
        return Err(UpdateError::MissingSource);
    }
    if !system.path_exists(&plan.source) {
        error!("Update folder does not exist: {}", plan.source.display());
        return Err(UpdateError::SourceNotFound(plan.source.clone()));
    }
    if system.is_file(&plan.source) {
        error!("Update source is a file, not a folder: {}", plan.source.display());
        return Err(UpdateError::InvalidSource {
            path: plan.source.clone(),
            reason: "not a folder",
        });
    }
    if same_or_inside(&plan.target, &plan.source) {
        error!(
            "Install folder {} is inside the update folder {}",
            plan.target.display(),
            plan.source.display()
        );
        return Err(UpdateError::InvalidSource {
            path: plan.source.clone(),
            reason: "contains the install folder",
        });
    }
    debug!("Update folder: {}", plan.source.display());
    debug!("Install folder: {}", plan.target.display());
    Ok(())
}

/// `inner` equals `outer` or lies below it, compared component-wise.
fn same_or_inside(inner: &Path, outer: &Path) -> bool {
    let canon = |p: &Path| std::fs::canonicalize(p).unwrap_or_else(|_| p.to_path_buf());
    canon(inner).starts_with(canon(outer))
}

fn stop_running_instances(plan: &UpdatePlan, system: &impl SystemOps, name: &str) -> usize {
    info!("Stopping {}...", name);
    let terminated = match system.terminate_processes(name) {
        Ok(0) => {
            info!("{} was not running", name);
            return 0;
        }
        Ok(n) => n,
        Err(e) => {
            warn!("Failed to stop {}: {:#}", name, e);
            0
        }
    };

    for poll in 1..=plan.retry.terminate_polls {
        system.sleep(plan.retry.terminate_delay);
        if !system.is_process_running(name) {
            info!("Stopped {} instance(s) of {}", terminated, name);
            return terminated;
        }
        debug!("{} still running (check {}/{})", name, poll, plan.retry.terminate_polls);
    }
    warn!("{} is still running; files in use may fail to copy", name);
    terminated
}

fn copy_update(plan: &UpdatePlan, system: &impl SystemOps) -> UpdateResult<MirrorReport> {
    info!("Copying update files from {} to {}", plan.source.display(), plan.target.display());
    let options = MirrorOptions {
        dry_run: plan.dry_run,
        ..plan.mirror.clone()
    };

    let report = system
        .mirror_tree(&plan.source, &plan.target, &options)
        .map_err(|source| {
            error!("Copy failed: {}", source);
            UpdateError::Mirror {
                source_dir: plan.source.clone(),
                source,
            }
        })?;

    let code = report.exit_code();
    match MirrorStatus::from_code(code) {
        MirrorStatus::Success => {
            info!("Update files copied successfully (code {}: {})", code, report.summary());
            Ok(report)
        }
        MirrorStatus::Fatal => {
            error!("Failed to copy update files (code {}: {})", code, report.summary());
            Err(UpdateError::MirrorFailed { code })
        }
    }
}

fn remove_source(plan: &UpdatePlan, system: &impl SystemOps) -> CleanupOutcome {
    let attempts = plan.retry.cleanup_attempts;
    for attempt in 1..=attempts {
        match system.remove_dir_all(&plan.source) {
            Ok(()) => {
                info!("Removed temporary update folder");
                return CleanupOutcome::Removed { attempts: attempt };
            }
            Err(e) => {
                debug!("Removing {} failed ({}), attempt {}/{}", plan.source.display(), e, attempt, attempts);
            }
        }
        if attempt < attempts {
            system.sleep(plan.retry.cleanup_delay);
        }
    }

    if system.path_exists(&plan.source) {
        warn!("Could not remove temporary update folder {}", plan.source.display());
        CleanupOutcome::Left
    } else {
        CleanupOutcome::Removed { attempts }
    }
}

fn relaunch(plan: &UpdatePlan, system: &impl SystemOps, executable: &Path, name: &str) -> LaunchOutcome {
    info!("Launching {}...", executable.display());

    let mut method = None;
    for candidate in [LaunchMethod::Shell, LaunchMethod::Direct] {
        match system.launch(executable, candidate) {
            Ok(()) => {
                method = Some(candidate);
                break;
            }
            Err(e) => warn!("Launch via {} failed: {:#}", candidate.label(), e),
        }
    }
    let Some(method) = method else {
        error!("Failed to launch {}. Please start it manually.", executable.display());
        return LaunchOutcome::Failed;
    };

    for poll in 1..=plan.retry.launch_polls {
        system.sleep(plan.retry.launch_delay);
        if system.is_process_running(name) {
            info!("{} started successfully", name);
            return LaunchOutcome::Confirmed { method, polls: poll };
        }
        debug!("Waiting for {} to start ({}/{})", name, poll, plan.retry.launch_polls);
    }
    warn!("{} may not have started. Please check manually.", name);
    LaunchOutcome::Unconfirmed { method }
}
