//! Process lookup, termination and launching.
//!
//! Lookup is by exact process name (`RimSort.exe` on Windows, `RimSort` elsewhere),
//! never by PID: the updater is started by the very process it has to stop and
//! has no handle on it.

use std::ffi::OsStr;
use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{Context, Result, bail};
use log::{debug, warn};
use sysinfo::{ProcessesToUpdate, System};

/// How the updated application gets started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LaunchMethod {
    /// The platform launcher, which detaches the app from the updater:
    /// `cmd /C start` on Windows, `open` on macOS, `setsid -f` elsewhere.
    Shell,
    /// Spawn the executable directly.
    Direct,
}

impl LaunchMethod {
    pub fn label(self) -> &'static str {
        match self {
            LaunchMethod::Shell => "shell launcher",
            LaunchMethod::Direct => "direct start",
        }
    }
}

fn snapshot() -> System {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);
    sys
}

/// Number of running processes called `name`, excluding this one.
pub fn count_running(name: &str) -> usize {
    let own = sysinfo::get_current_pid().ok();
    snapshot()
        .processes_by_exact_name(OsStr::new(name))
        .filter(|p| Some(p.pid()) != own)
        .count()
}

/// Kills every process called `name`. Returns how many were signalled.
pub fn terminate_by_name(name: &str) -> usize {
    let own = sysinfo::get_current_pid().ok();
    let sys = snapshot();
    let mut killed = 0;
    for process in sys.processes_by_exact_name(OsStr::new(name)) {
        if Some(process.pid()) == own {
            continue;
        }
        if process.kill() {
            debug!("Sent kill to {} (pid {})", name, process.pid());
            killed += 1;
        } else {
            warn!("Could not kill {} (pid {})", name, process.pid());
        }
    }
    killed
}

/// Starts `executable` from its own folder with no inherited stdio.
pub fn launch(executable: &Path, method: LaunchMethod) -> Result<()> {
    let workdir = executable
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    match method {
        LaunchMethod::Shell => {
            let mut cmd = shell_command(executable, workdir);
            let status = cmd
                .current_dir(workdir)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .with_context(|| format!("failed to run launcher for {}", executable.display()))?;
            if !status.success() {
                bail!("launcher exited with {:?}", status.code());
            }
        }
        LaunchMethod::Direct => {
            Command::new(executable)
                .current_dir(workdir)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .with_context(|| format!("failed to start {}", executable.display()))?;
        }
    }
    Ok(())
}

#[cfg(windows)]
fn shell_command(executable: &Path, workdir: &Path) -> Command {
    use std::os::windows::process::CommandExt;

    // `start` takes the first quoted argument as the window title, hence the empty "".
    let mut cmd = Command::new("cmd");
    cmd.raw_arg(format!(
        "/C start \"\" /D \"{}\" \"{}\"",
        workdir.display(),
        executable.display()
    ));
    cmd
}

#[cfg(target_os = "macos")]
fn shell_command(executable: &Path, _workdir: &Path) -> Command {
    // Opening the bundle keeps LaunchServices happy; a bare binary would open in Terminal.
    let bundle = executable
        .ancestors()
        .find(|p| p.extension().is_some_and(|ext| ext == "app"))
        .unwrap_or(executable);
    let mut cmd = Command::new("open");
    cmd.arg(bundle);
    cmd
}

#[cfg(all(unix, not(target_os = "macos")))]
fn shell_command(executable: &Path, _workdir: &Path) -> Command {
    let mut cmd = Command::new("setsid");
    cmd.arg("-f").arg(executable);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nothing_runs_under_an_unlikely_name() {
        let name = "rimsort-updater-test-no-such-process";
        assert_eq!(count_running(name), 0);
        assert_eq!(terminate_by_name(name), 0);
    }

    #[test]
    fn direct_launch_of_missing_binary_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = launch(&dir.path().join("missing-binary"), LaunchMethod::Direct);
        assert!(result.is_err());
    }

    #[test]
    fn labels_are_distinct() {
        assert_ne!(LaunchMethod::Shell.label(), LaunchMethod::Direct.label());
    }
}
