//! # Mirror
//!
//! Copies an update folder over the installed application folder.
//!
//! The outcome is reported with robocopy's exit-code bits so the updater keeps the
//! same success rules the Windows scripts always used:
//!
//! | bit | meaning                                   |
//! |-----|-------------------------------------------|
//! | `1` | one or more files were copied             |
//! | `2` | extra files exist in the target (kept)    |
//! | `4` | mismatched entries (file vs. directory)   |
//! | `8` | some files could not be copied            |
//!
//! A source root that cannot be read at all is returned as `Err`, the equivalent of
//! robocopy's `16`.
//!
//! Files in the target that the update does not contain (user settings, logs,
//! instance data) are counted but never deleted.
//!
//! Symbolic links are recreated as links on unix, so shared-library version links
//! and `.app` framework layouts survive the copy.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use log::{debug, trace, warn};
use walkdir::WalkDir;

pub const CODE_COPIED: u8 = 1;
pub const CODE_EXTRA: u8 = 2;
pub const CODE_MISMATCHED: u8 = 4;
pub const CODE_FAILED: u8 = 8;

/// Highest exit code the updater still treats as a successful copy.
pub const MAX_SUCCESS_CODE: u8 = 4;

/// Per-file retry behaviour, the counterpart of robocopy's `/R` and `/W`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorOptions {
    pub retries: u32,
    pub wait: Duration,
    /// Count what would change without writing anything.
    pub dry_run: bool,
}

impl Default for MirrorOptions {
    fn default() -> Self {
        Self {
            retries: 3,
            wait: Duration::from_secs(1),
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MirrorReport {
    pub copied: usize,
    pub skipped: usize,
    pub extra: usize,
    pub mismatched: usize,
    pub failed: usize,
    pub dirs_created: usize,
}

impl MirrorReport {
    /// A report that produces exactly `code`. Bits above `8` are ignored.
    pub fn from_code(code: u8) -> Self {
        let bit = |b: u8| usize::from(code & b != 0);
        Self {
            copied: bit(CODE_COPIED),
            extra: bit(CODE_EXTRA),
            mismatched: bit(CODE_MISMATCHED),
            failed: bit(CODE_FAILED),
            ..Self::default()
        }
    }

    pub fn exit_code(&self) -> u8 {
        let mut code = 0;
        if self.copied > 0 {
            code |= CODE_COPIED;
        }
        if self.extra > 0 {
            code |= CODE_EXTRA;
        }
        if self.mismatched > 0 {
            code |= CODE_MISMATCHED;
        }
        if self.failed > 0 {
            code |= CODE_FAILED;
        }
        code
    }

    /// Adds the counts of a nested mirror into this one.
    #[cfg_attr(unix, allow(dead_code))]
    fn absorb(&mut self, other: &MirrorReport) {
        self.copied += other.copied;
        self.skipped += other.skipped;
        self.extra += other.extra;
        self.mismatched += other.mismatched;
        self.failed += other.failed;
        self.dirs_created += other.dirs_created;
    }

    pub fn summary(&self) -> String {
        format!(
            "{} copied, {} unchanged, {} extra, {} mismatched, {} failed, {} folders created",
            self.copied, self.skipped, self.extra, self.mismatched, self.failed, self.dirs_created
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorStatus {
    Success,
    Fatal,
}

impl MirrorStatus {
    /// `0..=4` (nothing to do, files copied, extras present, mismatches) succeed.
    pub fn from_code(code: u8) -> Self {
        if code <= MAX_SUCCESS_CODE {
            MirrorStatus::Success
        } else {
            MirrorStatus::Fatal
        }
    }
}

/// Mirrors `source` onto `target`.
pub fn mirror_tree(source: &Path, target: &Path, options: &MirrorOptions) -> io::Result<MirrorReport> {
    let root = fs::metadata(source)?;
    if !root.is_dir() {
        return Err(io::Error::other(format!("{} is not a directory", source.display())));
    }

    let mut report = MirrorReport::default();
    if !target.exists() {
        if !options.dry_run {
            fs::create_dir_all(target)?;
        }
        report.dirs_created += 1;
    } else if !target.is_dir() {
        return Err(io::Error::other(format!("{} is not a directory", target.display())));
    }

    let own_exe = std::env::current_exe().and_then(fs::canonicalize).ok();
    let mut seen: HashSet<PathBuf> = HashSet::new();
    let mut walker = WalkDir::new(source).min_depth(1).into_iter();

    while let Some(entry) = walker.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Cannot read update entry: {}", e);
                report.failed += 1;
                continue;
            }
        };
        let Ok(relative) = entry.path().strip_prefix(source) else {
            continue;
        };
        let dest = target.join(relative);
        seen.insert(relative.to_path_buf());

        if entry.file_type().is_dir() {
            if !mirror_dir(&dest, options, &mut report) {
                walker.skip_current_dir();
            }
        } else if entry.file_type().is_symlink() {
            mirror_symlink(entry.path(), &dest, own_exe.as_deref(), options, &mut report);
        } else {
            mirror_file(entry.path(), &dest, own_exe.as_deref(), options, &mut report);
        }
    }

    count_extras(target, &seen, &mut report);
    debug!("Mirror {} -> {}: {}", source.display(), target.display(), report.summary());
    Ok(report)
}

/// Returns false when the subtree below `dest` must be skipped.
fn mirror_dir(dest: &Path, options: &MirrorOptions, report: &mut MirrorReport) -> bool {
    if dest.is_dir() {
        return true;
    }
    if dest.exists() {
        warn!("Mismatch: {} is a file in the install folder, a folder in the update", dest.display());
        report.mismatched += 1;
        return false;
    }
    if !options.dry_run
        && let Err(e) = fs::create_dir_all(dest)
    {
        warn!("Failed to create {}: {}", dest.display(), e);
        report.failed += 1;
        return false;
    }
    report.dirs_created += 1;
    true
}

fn mirror_file(src: &Path, dest: &Path, own_exe: Option<&Path>, options: &MirrorOptions, report: &mut MirrorReport) {
    let dest_is_link = fs::symlink_metadata(dest).is_ok_and(|m| m.file_type().is_symlink());
    if !dest_is_link && dest.is_dir() {
        warn!("Mismatch: {} is a folder in the install folder, a file in the update", dest.display());
        report.mismatched += 1;
        return;
    }

    let src_meta = match fs::metadata(src) {
        Ok(meta) => meta,
        Err(e) => {
            warn!("Cannot read {}: {}", src.display(), e);
            report.failed += 1;
            return;
        }
    };
    let mtime = src_meta.modified().ok();

    if !dest_is_link
        && let Ok(dest_meta) = fs::metadata(dest)
        && dest_meta.len() == src_meta.len()
        && mtime.is_some()
        && dest_meta.modified().ok() == mtime
    {
        trace!("Unchanged: {}", dest.display());
        report.skipped += 1;
        return;
    }

    if options.dry_run {
        debug!("Would copy {}", dest.display());
        report.copied += 1;
        return;
    }

    if dest_is_link {
        // Copying through the link would overwrite whatever it points at.
        if let Err(e) = fs::remove_file(dest) {
            warn!("Failed to replace link {}: {}", dest.display(), e);
            report.failed += 1;
            return;
        }
    } else if own_exe.is_some() && fs::canonicalize(dest).ok().as_deref() == own_exe {
        move_aside(dest);
    }

    if copy_with_retries(src, dest, mtime, options) {
        report.copied += 1;
    } else {
        report.failed += 1;
    }
}

/// Recreates the link itself, pointing at the same (possibly relative or dangling)
/// target. An identical link already in place counts as unchanged.
#[cfg(unix)]
fn mirror_symlink(src: &Path, dest: &Path, _own_exe: Option<&Path>, options: &MirrorOptions, report: &mut MirrorReport) {
    let link = match fs::read_link(src) {
        Ok(link) => link,
        Err(e) => {
            warn!("Cannot read link {}: {}", src.display(), e);
            report.failed += 1;
            return;
        }
    };

    match fs::symlink_metadata(dest) {
        Ok(meta) if meta.file_type().is_symlink() => {
            if fs::read_link(dest).ok().as_deref() == Some(link.as_path()) {
                trace!("Unchanged link: {}", dest.display());
                report.skipped += 1;
                return;
            }
        }
        Ok(meta) if meta.is_dir() => {
            warn!("Mismatch: {} is a folder in the install folder, a link in the update", dest.display());
            report.mismatched += 1;
            return;
        }
        _ => {}
    }

    if options.dry_run {
        debug!("Would link {} -> {}", dest.display(), link.display());
        report.copied += 1;
        return;
    }

    let replaced = match fs::remove_file(dest) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => std::os::unix::fs::symlink(&link, dest),
    };
    match replaced {
        Ok(()) => {
            trace!("Linked {} -> {}", dest.display(), link.display());
            report.copied += 1;
        }
        Err(e) => {
            warn!("Failed to link {}: {}", dest.display(), e);
            report.failed += 1;
        }
    }
}

/// Creating links needs extra privileges on Windows, so the link target is copied
/// instead: a file as a file, a folder as a nested mirror.
#[cfg(not(unix))]
fn mirror_symlink(src: &Path, dest: &Path, own_exe: Option<&Path>, options: &MirrorOptions, report: &mut MirrorReport) {
    if src.is_dir() {
        match mirror_tree(src, dest, options) {
            Ok(nested) => report.absorb(&nested),
            Err(e) => {
                warn!("Cannot copy linked folder {}: {}", src.display(), e);
                report.failed += 1;
            }
        }
    } else {
        mirror_file(src, dest, own_exe, options, report);
    }
}

/// A running executable cannot be overwritten (Windows locks it, Linux reports
/// `ETXTBSY`) but it can be renamed. The `.old` file shows up as an extra next run.
fn move_aside(dest: &Path) {
    let mut aside = dest.as_os_str().to_owned();
    aside.push(".old");
    let aside = PathBuf::from(aside);
    let _ = fs::remove_file(&aside);
    match fs::rename(dest, &aside) {
        Ok(()) => debug!("Moved running {} aside to {}", dest.display(), aside.display()),
        Err(e) => warn!("Could not move running {} aside: {}", dest.display(), e),
    }
}

fn copy_with_retries(src: &Path, dest: &Path, mtime: Option<SystemTime>, options: &MirrorOptions) -> bool {
    for attempt in 0..=options.retries {
        match copy_file(src, dest, mtime) {
            Ok(()) => {
                trace!("Copied {}", dest.display());
                return true;
            }
            Err(e) if attempt < options.retries => {
                debug!(
                    "Copy of {} failed ({}), retry {}/{}",
                    dest.display(),
                    e,
                    attempt + 1,
                    options.retries
                );
                std::thread::sleep(options.wait);
            }
            Err(e) => warn!("Failed to copy {}: {}", dest.display(), e),
        }
    }
    false
}

fn copy_file(src: &Path, dest: &Path, mtime: Option<SystemTime>) -> io::Result<()> {
    // Overwriting a read-only file fails on Windows.
    if let Ok(meta) = fs::metadata(dest) {
        let mut perms = meta.permissions();
        if perms.readonly() {
            perms.set_readonly(false);
            fs::set_permissions(dest, perms)?;
        }
    }
    fs::copy(src, dest)?;
    if let Some(mtime) = mtime {
        set_modified(dest, mtime)?;
    }
    Ok(())
}

/// Sets the modification time, lifting a read-only flag for the duration.
fn set_modified(path: &Path, mtime: SystemTime) -> io::Result<()> {
    let perms = fs::metadata(path)?.permissions();
    let readonly = perms.readonly();
    if readonly {
        let mut writable = perms.clone();
        writable.set_readonly(false);
        fs::set_permissions(path, writable)?;
    }
    let result = File::options().write(true).open(path).and_then(|f| f.set_modified(mtime));
    if readonly {
        fs::set_permissions(path, perms)?;
    }
    result
}

fn count_extras(target: &Path, seen: &HashSet<PathBuf>, report: &mut MirrorReport) {
    let mut walker = WalkDir::new(target).min_depth(1).into_iter();
    while let Some(entry) = walker.next() {
        let Ok(entry) = entry else { continue };
        let Ok(relative) = entry.path().strip_prefix(target) else {
            continue;
        };
        if seen.contains(relative) {
            continue;
        }
        trace!("Extra: {}", entry.path().display());
        report.extra += 1;
        if entry.file_type().is_dir() {
            walker.skip_current_dir();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fast() -> MirrorOptions {
        MirrorOptions {
            retries: 0,
            wait: Duration::ZERO,
            dry_run: false,
        }
    }

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn layout() -> (tempfile::TempDir, PathBuf, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("update");
        let target = dir.path().join("app");
        write(&source.join("RimSort"), "new binary");
        write(&source.join("lib").join("core.so"), "core");
        write(&source.join("data").join("db").join("steam.json"), "{}");
        (dir, source, target)
    }

    #[test]
    fn copies_every_source_file() {
        let (_dir, source, target) = layout();
        let report = mirror_tree(&source, &target, &fast()).unwrap();

        assert_eq!(report.copied, 3);
        assert_eq!(report.exit_code(), CODE_COPIED);
        assert_eq!(fs::read_to_string(target.join("RimSort")).unwrap(), "new binary");
        assert_eq!(fs::read_to_string(target.join("lib/core.so")).unwrap(), "core");
        assert!(target.join("data/db/steam.json").is_file());
    }

    #[test]
    fn second_run_is_a_no_op() {
        let (_dir, source, target) = layout();
        mirror_tree(&source, &target, &fast()).unwrap();
        let again = mirror_tree(&source, &target, &fast()).unwrap();

        assert_eq!(again.copied, 0);
        assert_eq!(again.skipped, 3);
        assert_eq!(again.exit_code(), 0);
        assert_eq!(fs::read_to_string(target.join("RimSort")).unwrap(), "new binary");
    }

    #[test]
    fn preserves_modification_time() {
        let (_dir, source, target) = layout();
        mirror_tree(&source, &target, &fast()).unwrap();
        let src = fs::metadata(source.join("lib/core.so")).unwrap().modified().unwrap();
        let dst = fs::metadata(target.join("lib/core.so")).unwrap().modified().unwrap();
        assert_eq!(src, dst);
    }

    #[test]
    fn overwrites_stale_files() {
        let (_dir, source, target) = layout();
        write(&target.join("RimSort"), "old binary, longer than the new one");
        let report = mirror_tree(&source, &target, &fast()).unwrap();
        assert_eq!(report.copied, 3);
        assert_eq!(fs::read_to_string(target.join("RimSort")).unwrap(), "new binary");
    }

    #[test]
    fn keeps_and_counts_extra_files() {
        let (_dir, source, target) = layout();
        write(&target.join("settings.json"), "user settings");
        write(&target.join("logs").join("a.log"), "");
        write(&target.join("logs").join("b.log"), "");

        let report = mirror_tree(&source, &target, &fast()).unwrap();
        // One extra file plus one extra folder; its contents are not walked.
        assert_eq!(report.extra, 2);
        assert_eq!(report.exit_code(), CODE_COPIED | CODE_EXTRA);
        assert!(target.join("settings.json").is_file());
        assert!(target.join("logs/b.log").is_file());
    }

    #[test]
    fn file_over_folder_is_mismatched_and_untouched() {
        let (_dir, source, target) = layout();
        fs::create_dir_all(target.join("RimSort")).unwrap();
        write(&target.join("lib"), "a file where a folder should be");

        let report = mirror_tree(&source, &target, &fast()).unwrap();
        assert_eq!(report.mismatched, 2);
        assert_eq!(report.exit_code() & CODE_MISMATCHED, CODE_MISMATCHED);
        assert!(target.join("RimSort").is_dir());
        assert_eq!(fs::read_to_string(target.join("lib")).unwrap(), "a file where a folder should be");
    }

    #[test]
    fn dry_run_writes_nothing() {
        let (_dir, source, target) = layout();
        let options = MirrorOptions { dry_run: true, ..fast() };
        let report = mirror_tree(&source, &target, &options).unwrap();
        assert_eq!(report.copied, 3);
        assert!(!target.exists());
    }

    #[test]
    fn running_executable_is_moved_aside() {
        let (_dir, source, target) = layout();
        write(&target.join("RimSort"), "old");
        move_aside(&target.join("RimSort"));
        assert!(!target.join("RimSort").exists());
        assert_eq!(fs::read_to_string(target.join("RimSort.old")).unwrap(), "old");

        let report = mirror_tree(&source, &target, &fast()).unwrap();
        assert_eq!(report.extra, 1);
    }

    #[cfg(unix)]
    #[test]
    fn library_links_stay_links() {
        let (_dir, source, target) = layout();
        write(&source.join("lib").join("libQt6Core.so.6.5.0"), "qt");
        std::os::unix::fs::symlink("libQt6Core.so.6.5.0", source.join("lib").join("libQt6Core.so.6")).unwrap();

        let report = mirror_tree(&source, &target, &fast()).unwrap();
        assert_eq!(report.copied, 5);
        assert_eq!(report.exit_code(), CODE_COPIED);

        let link = target.join("lib").join("libQt6Core.so.6");
        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("libQt6Core.so.6.5.0"));
        assert_eq!(fs::read_to_string(&link).unwrap(), "qt");

        let again = mirror_tree(&source, &target, &fast()).unwrap();
        assert_eq!(again.exit_code(), 0);
        assert_eq!(again.skipped, 5);
    }

    #[cfg(unix)]
    #[test]
    fn dangling_link_is_copied_not_failed() {
        let (_dir, source, target) = layout();
        std::os::unix::fs::symlink("libgone.so.1", source.join("lib").join("libgone.so")).unwrap();

        let report = mirror_tree(&source, &target, &fast()).unwrap();
        assert_eq!(report.failed, 0);
        assert_eq!(report.copied, 4);
        assert_eq!(MirrorStatus::from_code(report.exit_code()), MirrorStatus::Success);
        assert_eq!(
            fs::read_link(target.join("lib").join("libgone.so")).unwrap(),
            PathBuf::from("libgone.so.1")
        );
    }

    #[cfg(unix)]
    #[test]
    fn file_replaces_old_link_without_writing_through_it() {
        let (dir, source, target) = layout();
        let outside = dir.path().join("outside.so");
        write(&outside, "untouched");
        fs::create_dir_all(target.join("lib")).unwrap();
        std::os::unix::fs::symlink(&outside, target.join("lib").join("core.so")).unwrap();

        let report = mirror_tree(&source, &target, &fast()).unwrap();
        assert_eq!(report.copied, 3);
        let dest = target.join("lib").join("core.so");
        assert!(!fs::symlink_metadata(&dest).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_to_string(&dest).unwrap(), "core");
        assert_eq!(fs::read_to_string(&outside).unwrap(), "untouched");
    }

    #[cfg(unix)]
    #[test]
    fn linked_folder_is_not_descended() {
        let (_dir, source, target) = layout();
        write(&source.join("Frameworks").join("Versions").join("A").join("Qt"), "framework");
        std::os::unix::fs::symlink("A", source.join("Frameworks").join("Versions").join("Current")).unwrap();

        let report = mirror_tree(&source, &target, &fast()).unwrap();
        assert_eq!(report.exit_code(), CODE_COPIED);
        let current = target.join("Frameworks").join("Versions").join("Current");
        assert!(fs::symlink_metadata(&current).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_to_string(current.join("Qt")).unwrap(), "framework");
    }

    #[test]
    fn missing_source_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let result = mirror_tree(&dir.path().join("nope"), &dir.path().join("app"), &fast());
        assert!(result.is_err());
    }

    #[test]
    fn classification_follows_success_ceiling() {
        assert_eq!(MirrorStatus::from_code(0), MirrorStatus::Success);
        assert_eq!(MirrorStatus::from_code(4), MirrorStatus::Success);
        assert_eq!(MirrorStatus::from_code(5), MirrorStatus::Fatal);
        assert_eq!(MirrorStatus::from_code(8), MirrorStatus::Fatal);
    }

    proptest! {
        #[test]
        fn exit_code_bits_track_counts(
            copied in 0usize..3,
            extra in 0usize..3,
            mismatched in 0usize..3,
            failed in 0usize..3,
            skipped in 0usize..5,
        ) {
            let report = MirrorReport { copied, skipped, extra, mismatched, failed, dirs_created: 0 };
            let code = report.exit_code();
            prop_assert!(code <= 15);
            prop_assert_eq!(code & CODE_COPIED != 0, copied > 0);
            prop_assert_eq!(code & CODE_EXTRA != 0, extra > 0);
            prop_assert_eq!(code & CODE_MISMATCHED != 0, mismatched > 0);
            prop_assert_eq!(code & CODE_FAILED != 0, failed > 0);
            prop_assert_eq!(MirrorReport::from_code(code).exit_code(), code);
        }
    }
}
