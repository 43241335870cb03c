//! # Logging
//!
//! Console output goes through `simplelog`'s `TermLogger`. When the caller passes a
//! log path, records are also appended to that file in the format the
//! application's own log viewer expects:
//!
//! ```text
//! [2026-10-16 14:03:11] INFO: Update files copied successfully
//! [2026-10-16 14:03:12] WARNING: Could not remove temporary update folder
//! ```
//!
//! Only `INFO`, `WARNING` and `ERROR` reach the file; debug and trace output stays
//! on the console.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime};
use log::{Level, LevelFilter, Log, Metadata, Record, warn};
use simplelog::{ColorChoice, CombinedLogger, Config, SharedLogger, TermLogger, TerminalMode};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Maps the `-v` count to a console level.
///
/// - `0`: Info
/// - `1`: Debug
/// - `2+`: Trace
pub fn level_for(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Label written to the log file, or `None` for levels the file never records.
pub fn level_label(level: Level) -> Option<&'static str> {
    match level {
        Level::Error => Some("ERROR"),
        Level::Warn => Some("WARNING"),
        Level::Info => Some("INFO"),
        Level::Debug | Level::Trace => None,
    }
}

pub fn format_line(timestamp: &NaiveDateTime, label: &str, message: &str) -> String {
    format!("[{}] {}: {}", timestamp.format(TIMESTAMP_FORMAT), label, message)
}

/// Append-only log file sink.
pub struct UpdateLogFile {
    path: PathBuf,
    file: Mutex<File>,
}

impl UpdateLogFile {
    /// Opens `path` for appending, creating it and its parent folder if needed.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log folder {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Log for UpdateLogFile {
    fn enabled(&self, metadata: &Metadata) -> bool {
        level_label(metadata.level()).is_some()
    }

    fn log(&self, record: &Record) {
        let Some(label) = level_label(record.level()) else {
            return;
        };
        let line = format_line(&Local::now().naive_local(), label, &record.args().to_string());
        if let Ok(mut file) = self.file.lock() {
            // A full disk must not abort the update; the console still has the record.
            let _ = writeln!(file, "{line}");
        }
    }

    fn flush(&self) {
        if let Ok(mut file) = self.file.lock() {
            let _ = file.flush();
        }
    }
}

impl SharedLogger for UpdateLogFile {
    fn level(&self) -> LevelFilter {
        LevelFilter::Info
    }

    fn config(&self) -> Option<&Config> {
        None
    }

    fn as_log(self: Box<Self>) -> Box<dyn Log> {
        self
    }
}

/// Installs the global logger, console records split across stdout and stderr.
///
/// A log file that cannot be opened degrades to console-only logging with a
/// warning; it never fails the run.
pub fn init(verbose: u8, log_path: Option<&Path>) -> Result<()> {
    init_with(verbose, log_path, TerminalMode::Mixed)
}

/// Like [`init`], with an explicit console mode. Tools that print machine-readable
/// output on stdout pass `TerminalMode::Stderr`.
pub fn init_with(verbose: u8, log_path: Option<&Path>, mode: TerminalMode) -> Result<()> {
    let mut loggers: Vec<Box<dyn SharedLogger>> =
        vec![TermLogger::new(level_for(verbose), Config::default(), mode, ColorChoice::Auto)];

    let mut open_error = None;
    if let Some(path) = log_path {
        match UpdateLogFile::open(path) {
            Ok(sink) => loggers.push(Box::new(sink)),
            Err(e) => open_error = Some(e),
        }
    }

    CombinedLogger::init(loggers).context("logger already installed")?;

    if let Some(e) = open_error {
        warn!("{:#}. Logging to console only.", e);
    }
    Ok(())
}
