//! Archive expansion into the staging area.
//!
//! ZIP payloads are expanded into `processing/` so each entry re-enters the
//! pipeline as an individual file. Entry names are validated before
//! anything is written: an entry whose path would escape the destination
//! directory (absolute paths, `..` components, prefix components) aborts
//! the whole expansion.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::debug;

/// Errors produced while expanding an archive.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// IO error reading the archive or writing an entry.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The archive is corrupt or not a ZIP.
    #[error("invalid archive: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// An entry path would escape the destination directory.
    #[error("illegal entry path: {0}")]
    IllegalPath(String),
}

/// Returns true when the path has a `.zip` extension (case-insensitive).
pub fn is_zip_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"))
}

/// Expands `zip_path` into `dest_dir`, returning the extracted file paths.
///
/// All entry names are validated up front, so a traversal attempt anywhere
/// in the archive aborts before a single byte is written.
pub fn extract_zip(zip_path: &Path, dest_dir: &Path) -> Result<Vec<PathBuf>, ArchiveError> {
    let file = std::fs::File::open(zip_path)?;
    let mut archive = zip::ZipArchive::new(file)?;

    // Validation pass: every destination must stay under dest_dir.
    let names: Vec<String> = archive.file_names().map(str::to_string).collect();
    for name in &names {
        entry_destination(dest_dir, name)?;
    }

    std::fs::create_dir_all(dest_dir)?;

    let mut extracted = Vec::new();

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let name = entry.name().to_string();
        let dest = entry_destination(dest_dir, &name)?;

        if entry.is_dir() {
            create_dir_with_mode(&dest, entry.unix_mode())?;
            continue;
        }

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut out = std::fs::File::create(&dest)?;
        std::io::copy(&mut entry, &mut out)?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(mode))?;
        }

        debug!(entry = %name, dest = %dest.display(), "Extracted archive entry");
        extracted.push(dest);
    }

    Ok(extracted)
}

/// Resolves an entry name under `dest_dir`, rejecting any component that
/// could climb out of it. Equivalent to requiring the cleaned destination
/// to keep the cleaned destination directory as its prefix.
fn entry_destination(dest_dir: &Path, name: &str) -> Result<PathBuf, ArchiveError> {
    let relative = Path::new(name);
    for component in relative.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ArchiveError::IllegalPath(name.to_string()));
            }
        }
    }
    Ok(dest_dir.join(relative))
}

fn create_dir_with_mode(dir: &Path, mode: Option<u32>) -> std::io::Result<()> {
    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::DirBuilderExt;
        return std::fs::DirBuilder::new()
            .recursive(true)
            .mode(mode)
            .create(dir);
    }
    let _ = mode;
    std::fs::create_dir_all(dir)
}
