//! Release archive extraction for the smoke tester.
//!
//! Release builds ship as `.zip` on Windows and macOS and as `.tar.gz` on Linux.

use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail, ensure};
use flate2::read::GzDecoder;
use log::debug;
use zip::ZipArchive;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    TarGz,
    Tar,
}

impl ArchiveKind {
    /// Detects the format from the file name.
    pub fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_lowercase();
        if name.ends_with(".zip") {
            Some(ArchiveKind::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveKind::TarGz)
        } else if name.ends_with(".tar") {
            Some(ArchiveKind::Tar)
        } else {
            None
        }
    }
}

/// Extracts `archive` into `dest`, creating `dest` if needed.
pub fn extract(archive: &Path, dest: &Path) -> Result<()> {
    let Some(kind) = ArchiveKind::detect(archive) else {
        bail!("unsupported archive format: {}", archive.display());
    };
    fs::create_dir_all(dest).with_context(|| format!("failed to create {}", dest.display()))?;
    debug!("Extracting {} ({:?}) into {}", archive.display(), kind, dest.display());

    let file = File::open(archive).with_context(|| format!("failed to open archive {}", archive.display()))?;
    match kind {
        ArchiveKind::Zip => extract_zip(file, archive, dest),
        ArchiveKind::TarGz => tar::Archive::new(GzDecoder::new(file))
            .unpack(dest)
            .with_context(|| format!("failed to unpack {}", archive.display())),
        ArchiveKind::Tar => tar::Archive::new(file)
            .unpack(dest)
            .with_context(|| format!("failed to unpack {}", archive.display())),
    }
}

fn extract_zip(file: File, archive: &Path, dest: &Path) -> Result<()> {
    let mut zip =
        ZipArchive::new(file).with_context(|| format!("failed to decode zip archive {}", archive.display()))?;

    for index in 0..zip.len() {
        let mut entry = zip
            .by_index(index)
            .with_context(|| format!("failed to read entry {index} from {}", archive.display()))?;
        let destination = dest.join(sanitize_entry(entry.name())?);

        if entry.is_dir() {
            fs::create_dir_all(&destination)
                .with_context(|| format!("failed to create {}", destination.display()))?;
            continue;
        }
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let mut output =
            File::create(&destination).with_context(|| format!("failed to create {}", destination.display()))?;
        io::copy(&mut entry, &mut output).with_context(|| format!("failed to extract {}", destination.display()))?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&destination, fs::Permissions::from_mode(mode))
                .with_context(|| format!("failed to set permissions on {}", destination.display()))?;
        }
    }
    Ok(())
}

/// Rejects entries that would land outside the extraction folder.
fn sanitize_entry(name: &str) -> Result<PathBuf> {
    let path = Path::new(name);
    ensure!(!path.is_absolute(), "archive entry {name} is absolute");

    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                bail!("archive entry {name} escapes the extraction folder")
            }
        }
    }
    ensure!(!clean.as_os_str().is_empty(), "archive entry {name:?} is empty");
    Ok(clean)
}
