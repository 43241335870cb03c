use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Result, bail};

use crate::mirror::{self, MirrorOptions, MirrorReport};
use crate::process::{self, LaunchMethod};

/// Abstraction for System interactions (processes, file system, clock).
/// This lets the update sequence run against a mock in tests.
pub trait SystemOps {
    /// Check if a file or directory exists.
    fn path_exists(&self, path: &Path) -> bool;

    /// Check if a regular file exists.
    fn is_file(&self, path: &Path) -> bool;

    /// Kill every process with this exact name. Finding none is `Ok(0)`.
    fn terminate_processes(&self, name: &str) -> Result<usize>;

    /// Check whether a process with this exact name is running.
    fn is_process_running(&self, name: &str) -> bool;

    /// Copy `source` over `target`, see [`mirror::mirror_tree`].
    fn mirror_tree(&self, source: &Path, target: &Path, options: &MirrorOptions) -> io::Result<MirrorReport>;

    /// Delete a directory and everything below it.
    fn remove_dir_all(&self, path: &Path) -> io::Result<()>;

    /// Start the application.
    fn launch(&self, executable: &Path, method: LaunchMethod) -> Result<()>;

    fn sleep(&self, duration: Duration);
}

/// The real system.
pub struct HostSystem;

impl SystemOps for HostSystem {
    fn path_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_file(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn terminate_processes(&self, name: &str) -> Result<usize> {
        Ok(process::terminate_by_name(name))
    }

    fn is_process_running(&self, name: &str) -> bool {
        process::count_running(name) > 0
    }

    fn mirror_tree(&self, source: &Path, target: &Path, options: &MirrorOptions) -> io::Result<MirrorReport> {
        mirror::mirror_tree(source, target, options)
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_dir_all(path)
    }

    fn launch(&self, executable: &Path, method: LaunchMethod) -> Result<()> {
        process::launch(executable, method)
    }

    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

/// Whether the current user can create files in `dir`.
///
/// A folder that does not exist yet is judged by its nearest existing ancestor.
pub fn probe_writable(dir: &Path) -> bool {
    let Some(existing) = dir.ancestors().find(|p| p.is_dir()) else {
        return false;
    };
    let probe = existing.join(format!(".rimsort-updater-probe-{}", std::process::id()));
    match std::fs::OpenOptions::new().write(true).create_new(true).open(&probe) {
        Ok(_) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

/// A Mock System for Testing.
///
/// Paths live in two in-memory sets; processes are names in a list. Every side
/// effect is appended to `events` so tests can assert on ordering.
#[derive(Debug, Default)]
pub struct MockSystem {
    pub files: Mutex<HashSet<PathBuf>>,
    pub dirs: Mutex<HashSet<PathBuf>>,
    pub running: Mutex<Vec<String>>,
    pub events: Mutex<Vec<String>>,
    pub sleeps: Mutex<Vec<Duration>>,
    /// Code the next mirror reports. `None` means "files copied" (1).
    pub mirror_code: Mutex<Option<u8>>,
    /// Make the mirror fail outright, like an unreadable source root.
    pub mirror_io_error: Mutex<bool>,
    /// Report success from the mirror without actually placing the files.
    pub mirror_drops_files: Mutex<bool>,
    /// Number of upcoming `remove_dir_all` calls that fail.
    pub remove_failures: Mutex<u32>,
    /// Processes that ignore the kill signal.
    pub unkillable: Mutex<bool>,
    pub failing_launchers: Mutex<Vec<LaunchMethod>>,
    /// Polls until a launched app shows up. `None`: it never does.
    pub start_after_polls: Mutex<Option<u32>>,
    pub launched: Mutex<Option<String>>,
}

impl MockSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        {
            let mut dirs = self.dirs.lock().unwrap();
            for ancestor in path.ancestors().skip(1) {
                dirs.insert(ancestor.to_path_buf());
            }
        }
        self.files.lock().unwrap().insert(path);
        self
    }

    pub fn with_dir(self, path: impl Into<PathBuf>) -> Self {
        self.dirs.lock().unwrap().insert(path.into());
        self
    }

    pub fn with_running(self, name: &str) -> Self {
        self.running.lock().unwrap().push(name.to_string());
        self
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }
}

impl SystemOps for MockSystem {
    fn path_exists(&self, path: &Path) -> bool {
        self.files.lock().unwrap().contains(path) || self.dirs.lock().unwrap().contains(path)
    }

    fn is_file(&self, path: &Path) -> bool {
        self.files.lock().unwrap().contains(path)
    }

    fn terminate_processes(&self, name: &str) -> Result<usize> {
        self.record(format!("terminate {name}"));
        let mut running = self.running.lock().unwrap();
        let count = running.iter().filter(|p| *p == name).count();
        if !*self.unkillable.lock().unwrap() {
            running.retain(|p| p != name);
        }
        Ok(count)
    }

    fn is_process_running(&self, name: &str) -> bool {
        if self.running.lock().unwrap().iter().any(|p| p == name) {
            return true;
        }
        if self.launched.lock().unwrap().as_deref() != Some(name) {
            return false;
        }
        let mut pending = self.start_after_polls.lock().unwrap();
        match pending.as_mut() {
            Some(0) => {
                self.running.lock().unwrap().push(name.to_string());
                true
            }
            Some(n) => {
                *n -= 1;
                false
            }
            None => false,
        }
    }

    fn mirror_tree(&self, source: &Path, target: &Path, options: &MirrorOptions) -> io::Result<MirrorReport> {
        self.record("mirror");
        if *self.mirror_io_error.lock().unwrap() {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "mock mirror failure"));
        }
        let code = self.mirror_code.lock().unwrap().unwrap_or(mirror::CODE_COPIED);
        if !options.dry_run && !*self.mirror_drops_files.lock().unwrap() {
            let copies: Vec<PathBuf> = self
                .files
                .lock()
                .unwrap()
                .iter()
                .filter_map(|f| f.strip_prefix(source).ok())
                .map(|rel| target.join(rel))
                .collect();
            self.dirs.lock().unwrap().insert(target.to_path_buf());
            self.files.lock().unwrap().extend(copies);
        }
        Ok(MirrorReport::from_code(code))
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        self.record("remove");
        {
            let mut failures = self.remove_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "mock folder in use"));
            }
        }
        self.files.lock().unwrap().retain(|f| !f.starts_with(path));
        self.dirs.lock().unwrap().retain(|d| !d.starts_with(path));
        Ok(())
    }

    fn launch(&self, executable: &Path, method: LaunchMethod) -> Result<()> {
        self.record(format!("launch {}", method.label()));
        if self.failing_launchers.lock().unwrap().contains(&method) {
            bail!("mock {} failure", method.label());
        }
        let name = executable
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        *self.launched.lock().unwrap() = Some(name);
        Ok(())
    }

    fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
    }
}
