//! # Release Smoke Test
//!
//! Launches a packaged build headlessly and checks it survives startup:
//!
//! - still running when the timeout expires: killed, **pass** (a GUI app is expected
//!   to keep running);
//! - exited with status 0 before the timeout: **pass**;
//! - any other exit: **fail**.
//!
//! The artifact can be a release archive, an already extracted folder, or the
//! executable itself.

use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use log::{debug, info, warn};
use serde::Serialize;
use tempfile::TempDir;
use walkdir::WalkDir;

use crate::archive::{self, ArchiveKind};
use crate::config;

/// Qt reads this to pick a platform plugin; `offscreen` needs no display.
const QT_PLATFORM_VAR: &str = "QT_QPA_PLATFORM";

#[derive(Debug, Clone)]
pub struct SmokeOptions {
    /// File name of the executable to look for inside an archive or folder.
    pub executable: PathBuf,
    pub timeout: Duration,
    pub poll_interval: Duration,
    /// Where archives are extracted and left for inspection. Without it they go to a
    /// scratch folder in the temp dir that is deleted after the run.
    pub work_dir: Option<PathBuf>,
    pub headless: bool,
    /// Extra arguments passed to the executable.
    pub args: Vec<String>,
}

impl Default for SmokeOptions {
    fn default() -> Self {
        Self {
            executable: config::default_executable(),
            timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
            work_dir: None,
            headless: true,
            args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum SmokeVerdict {
    /// Still running at the deadline and killed.
    TimedOut,
    CleanExit,
    /// `code` is `None` when the process died from a signal.
    Failed { code: Option<i32> },
}

impl SmokeVerdict {
    pub fn passed(&self) -> bool {
        matches!(self, SmokeVerdict::TimedOut | SmokeVerdict::CleanExit)
    }

    fn from_status(status: ExitStatus) -> Self {
        if status.success() {
            SmokeVerdict::CleanExit
        } else {
            SmokeVerdict::Failed { code: status.code() }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SmokeReport {
    pub artifact: PathBuf,
    pub executable: PathBuf,
    #[serde(flatten)]
    pub verdict: SmokeVerdict,
    pub elapsed_ms: u64,
}

/// The executable to run, and the scratch folder holding it if one was needed.
#[derive(Debug)]
pub struct Prepared {
    pub executable: PathBuf,
    /// Removed from disk when dropped.
    scratch: Option<TempDir>,
}

impl Prepared {
    pub fn scratch_dir(&self) -> Option<&Path> {
        self.scratch.as_ref().map(|dir| dir.path())
    }
}

/// Resolves the executable to run for `artifact`, extracting it first if needed.
pub fn prepare(artifact: &Path, options: &SmokeOptions) -> Result<Prepared> {
    if !artifact.exists() {
        bail!("artifact not found: {}", artifact.display());
    }

    let mut scratch = None;
    let root = if artifact.is_dir() {
        artifact.to_path_buf()
    } else if ArchiveKind::detect(artifact).is_some() {
        let work_dir = match &options.work_dir {
            Some(dir) => dir.clone(),
            None => {
                let dir = scratch_dir(artifact)?;
                let path = dir.path().to_path_buf();
                scratch = Some(dir);
                path
            }
        };
        info!("Extracting {} to {}", artifact.display(), work_dir.display());
        archive::extract(artifact, &work_dir)?;
        work_dir
    } else {
        return Ok(Prepared {
            executable: artifact.to_path_buf(),
            scratch: None,
        });
    };

    let executable = locate_executable(&root, &options.executable).with_context(|| {
        format!("{} not found in {}", options.executable.display(), root.display())
    })?;
    Ok(Prepared { executable, scratch })
}

fn scratch_dir(artifact: &Path) -> Result<TempDir> {
    let stem = artifact
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());
    tempfile::Builder::new()
        .prefix(&format!("{stem}-smoke-"))
        .tempdir()
        .context("failed to create extraction folder")
}

/// Finds the shallowest file under `root` whose path ends with `executable`.
pub fn locate_executable(root: &Path, executable: &Path) -> Option<PathBuf> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && e.path().ends_with(executable))
        .min_by_key(|e| e.depth())
        .map(|e| e.into_path())
}

/// Starts `executable` and waits for a verdict.
pub fn run_binary(executable: &Path, options: &SmokeOptions) -> Result<SmokeVerdict> {
    let mut cmd = Command::new(executable);
    cmd.args(&options.args).stdin(Stdio::null());
    if let Some(dir) = executable.parent().filter(|p| !p.as_os_str().is_empty()) {
        cmd.current_dir(dir);
    }
    if options.headless && std::env::var_os(QT_PLATFORM_VAR).is_none() {
        cmd.env(QT_PLATFORM_VAR, "offscreen");
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to start {}", executable.display()))?;
    debug!("Started {} (pid {})", executable.display(), child.id());

    // A timeout too large to represent means waiting for the app to exit.
    let deadline = Instant::now().checked_add(options.timeout);
    loop {
        if let Some(status) = child.try_wait().context("failed to poll child process")? {
            return Ok(SmokeVerdict::from_status(status));
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            info!("Still running after {:?}, stopping it", options.timeout);
            if let Err(e) = child.kill() {
                // It may have exited between the poll and the kill.
                warn!("Kill failed: {}", e);
            }
            let _ = child.wait();
            return Ok(SmokeVerdict::TimedOut);
        }
        std::thread::sleep(options.poll_interval);
    }
}

/// Runs the full smoke test for one artifact.
pub fn run(artifact: &Path, options: &SmokeOptions) -> Result<SmokeReport> {
    let prepared = prepare(artifact, options)?;
    info!("Launching {}", prepared.executable.display());

    let started = Instant::now();
    let verdict = run_binary(&prepared.executable, options)?;
    if let Some(dir) = prepared.scratch_dir() {
        debug!("Removing {}", dir.display());
    }
    let report = SmokeReport {
        artifact: artifact.to_path_buf(),
        executable: prepared.executable.clone(),
        verdict,
        elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
    };

    match &report.verdict {
        SmokeVerdict::TimedOut => info!("PASS: still running at timeout (expected for a GUI app)"),
        SmokeVerdict::CleanExit => info!("PASS: exited cleanly"),
        SmokeVerdict::Failed { code } => warn!("FAIL: exited with {:?}", code),
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn quick() -> SmokeOptions {
        SmokeOptions {
            timeout: Duration::from_millis(1500),
            poll_interval: Duration::from_millis(10),
            ..SmokeOptions::default()
        }
    }

    #[cfg(unix)]
    fn sh(script: &str) -> SmokeOptions {
        SmokeOptions {
            args: vec!["-c".to_string(), script.to_string()],
            ..quick()
        }
    }

    #[cfg(unix)]
    #[test]
    fn long_running_binary_times_out_and_passes() {
        let verdict = run_binary(Path::new("/bin/sh"), &sh("sleep 5")).unwrap();
        assert_eq!(verdict, SmokeVerdict::TimedOut);
        assert!(verdict.passed());
    }

    #[cfg(unix)]
    #[test]
    fn clean_exit_passes() {
        let verdict = run_binary(Path::new("/bin/sh"), &sh("exit 0")).unwrap();
        assert_eq!(verdict, SmokeVerdict::CleanExit);
        assert!(verdict.passed());
    }

    #[cfg(unix)]
    #[test]
    fn other_exit_codes_fail() {
        let verdict = run_binary(Path::new("/bin/sh"), &sh("exit 3")).unwrap();
        assert_eq!(verdict, SmokeVerdict::Failed { code: Some(3) });
        assert!(!verdict.passed());
    }

    #[cfg(unix)]
    #[test]
    fn headless_variable_is_exported() {
        let verdict = run_binary(Path::new("/bin/sh"), &sh(r#"[ -n "$QT_QPA_PLATFORM" ]"#)).unwrap();
        assert!(verdict.passed());
    }

    #[cfg(unix)]
    #[test]
    fn huge_timeout_waits_for_exit() {
        let options = SmokeOptions {
            timeout: Duration::from_secs(u64::MAX),
            ..sh("exit 0")
        };
        let verdict = run_binary(Path::new("/bin/sh"), &options).unwrap();
        assert_eq!(verdict, SmokeVerdict::CleanExit);
    }

    fn write_zip(path: &Path, name: &str) {
        use std::io::Write;
        let mut writer = zip::ZipWriter::new(fs::File::create(path).unwrap());
        writer.start_file(name, zip::write::FileOptions::default()).unwrap();
        writer.write_all(b"bin").unwrap();
        writer.finish().unwrap();
    }

    #[test]
    fn default_extraction_is_removed_after_use() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("RimSort-Ubuntu.zip");
        write_zip(&archive, "RimSort/RimSort");

        let prepared = prepare(&archive, &quick()).unwrap();
        let scratch = prepared.scratch_dir().unwrap().to_path_buf();
        assert!(prepared.executable.is_file());
        assert!(prepared.executable.starts_with(&scratch));

        drop(prepared);
        assert!(!scratch.exists());
    }

    #[test]
    fn explicit_work_dir_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("RimSort-Ubuntu.zip");
        write_zip(&archive, "RimSort/RimSort");
        let options = SmokeOptions {
            work_dir: Some(dir.path().join("work")),
            ..quick()
        };

        let prepared = prepare(&archive, &options).unwrap();
        assert!(prepared.scratch_dir().is_none());
        drop(prepared);
        assert!(dir.path().join("work/RimSort/RimSort").is_file());
    }

    #[test]
    fn missing_binary_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(run_binary(&dir.path().join("nope"), &quick()).is_err());
    }

    #[test]
    fn locates_shallowest_match() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("RimSort/deep")).unwrap();
        fs::write(dir.path().join("RimSort/RimSort"), "").unwrap();
        fs::write(dir.path().join("RimSort/deep/RimSort"), "").unwrap();

        let found = locate_executable(dir.path(), Path::new("RimSort")).unwrap();
        assert_eq!(found, dir.path().join("RimSort/RimSort"));
        assert!(locate_executable(dir.path(), Path::new("Other")).is_none());
    }

    #[test]
    fn plain_file_artifact_is_the_executable() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("RimSort-custom");
        fs::write(&exe, "").unwrap();
        assert_eq!(prepare(&exe, &quick()).unwrap().executable, exe);
        assert!(prepare(&dir.path().join("missing.zip"), &quick()).is_err());
    }

    #[test]
    fn verdict_serializes_with_tag() {
        let report = SmokeReport {
            artifact: PathBuf::from("a.zip"),
            executable: PathBuf::from("RimSort"),
            verdict: SmokeVerdict::Failed { code: Some(2) },
            elapsed_ms: 5,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["verdict"], "failed");
        assert_eq!(json["code"], 2);
        assert_eq!(json["elapsed_ms"], 5);
    }
}
