//! Staging-directory layout and crash-safe file moves.
//!
//! The working directory holds five sibling subdirectories that act as an
//! on-disk state machine: `processing/`, `processed/`, `failed/`,
//! `ignored/`, and `tmp/`. Files move between them atomically when source
//! and destination share a filesystem; across devices the move degrades to
//! copy + fsync + unlink so a crash can never leave a half-written
//! destination that is also missing its source.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// The five staging subdirectory names, in a fixed order.
pub const STAGING_SUBDIRS: [&str; 5] = ["processing", "processed", "failed", "ignored", "tmp"];

/// Locations of the staging subdirectories under one working directory.
#[derive(Debug, Clone)]
pub struct StagingLayout {
    working_dir: PathBuf,
}

impl StagingLayout {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        StagingLayout {
            working_dir: working_dir.into(),
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn processing(&self) -> PathBuf {
        self.working_dir.join("processing")
    }

    pub fn processed(&self) -> PathBuf {
        self.working_dir.join("processed")
    }

    pub fn failed(&self) -> PathBuf {
        self.working_dir.join("failed")
    }

    pub fn ignored(&self) -> PathBuf {
        self.working_dir.join("ignored")
    }

    pub fn tmp(&self) -> PathBuf {
        self.working_dir.join("tmp")
    }

    /// All five staging subdirectories.
    pub fn staging_dirs(&self) -> [PathBuf; 5] {
        [
            self.processing(),
            self.processed(),
            self.failed(),
            self.ignored(),
            self.tmp(),
        ]
    }

    /// Creates the working directory and every staging subdirectory with
    /// mode `0755`.
    pub fn ensure(&self) -> io::Result<()> {
        ensure_dir(&self.working_dir)?;
        for dir in self.staging_dirs() {
            ensure_dir(&dir)?;
        }
        Ok(())
    }
}

/// Creates a directory (and parents) with mode `0755`.
pub fn ensure_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(dir)
    }
    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(dir)
    }
}

/// Moves a file, falling back to copy + fsync + unlink when the rename
/// crosses a device boundary.
pub fn move_file(src: &Path, dst: &Path) -> io::Result<()> {
    match std::fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => copy_and_unlink(src, dst),
        Err(e) => Err(e),
    }
}

/// Copies `src` to `dst`, fsyncs the destination, then removes the source.
///
/// The fsync before unlink is what keeps the move crash-safe: the source is
/// only deleted once the destination bytes are durable.
fn copy_and_unlink(src: &Path, dst: &Path) -> io::Result<()> {
    let mut src_file = File::open(src)?;
    let mut dst_file = File::create(dst)?;
    io::copy(&mut src_file, &mut dst_file)?;
    dst_file.flush()?;
    dst_file.sync_all()?;
    drop(dst_file);
    std::fs::remove_file(src)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn layout_paths_are_siblings() {
        let layout = StagingLayout::new("/work");
        assert_eq!(layout.processing(), PathBuf::from("/work/processing"));
        assert_eq!(layout.tmp(), PathBuf::from("/work/tmp"));
        assert_eq!(layout.staging_dirs().len(), 5);
    }

    #[test]
    fn ensure_creates_all_directories() {
        let dir = tempdir().unwrap();
        let layout = StagingLayout::new(dir.path().join("work"));

        layout.ensure().unwrap();

        for sub in layout.staging_dirs() {
            assert!(sub.is_dir(), "{} should exist", sub.display());
        }
    }

    #[test]
    fn ensure_is_idempotent() {
        let dir = tempdir().unwrap();
        let layout = StagingLayout::new(dir.path().join("work"));
        layout.ensure().unwrap();
        layout.ensure().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn ensure_uses_0755() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let layout = StagingLayout::new(dir.path().join("work"));
        layout.ensure().unwrap();

        let mode = std::fs::metadata(layout.processing())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn move_file_renames_within_device() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("a.xml");
        let dst = dir.path().join("b.xml");
        std::fs::write(&src, b"<r/>").unwrap();

        move_file(&src, &dst).unwrap();

        assert!(!src.exists());
        assert_eq!(std::fs::read(&dst).unwrap(), b"<r/>");
    }

    #[test]
    fn copy_and_unlink_preserves_content() {
        // Exercises the cross-device fallback path directly; the content
        // digest of the destination must equal the source's.
        let dir = tempdir().unwrap();
        let src = dir.path().join("a.xml");
        let dst = dir.path().join("b.xml");
        let body = vec![7u8; 64 * 1024 + 13];
        std::fs::write(&src, &body).unwrap();

        copy_and_unlink(&src, &dst).unwrap();

        assert!(!src.exists());
        assert_eq!(std::fs::read(&dst).unwrap(), body);
    }

    #[test]
    fn move_missing_source_is_an_error() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("missing.xml");
        let dst = dir.path().join("b.xml");
        assert!(move_file(&src, &dst).is_err());
    }
}
