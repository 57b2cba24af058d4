//! Orphan reconciliation at startup.
//!
//! A file sitting in `processing/` when the daemon starts is a crash
//! remnant: the previous process staged it but died before the downstream
//! consumer took over. Each one is renamed back into the first watched root
//! so the normal pipeline re-runs it; the fingerprint, lock, and
//! idempotency checks guarantee a file that downstream already observed is
//! not redelivered.

use std::path::Path;

use tracing::{error, info};

use super::fsops::{self, StagingLayout};

/// Moves every regular file in `processing/` back into `incoming`.
///
/// Returns the number of files moved. Individual move failures are logged
/// and skipped; only an unreadable `processing/` directory is an error.
pub fn reconcile_orphans(layout: &StagingLayout, incoming: &Path) -> std::io::Result<usize> {
    let processing = layout.processing();
    if !processing.exists() {
        return Ok(0);
    }

    let mut moved = 0;

    for entry in std::fs::read_dir(&processing)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                error!(error = %e, "Failed to read processing entry");
                continue;
            }
        };

        let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
        if !is_file {
            continue;
        }

        let src = entry.path();
        let dest = incoming.join(entry.file_name());

        info!(file = %entry.file_name().to_string_lossy(), "Reconciling orphan file");

        match fsops::move_file(&src, &dest) {
            Ok(()) => moved += 1,
            Err(e) => {
                error!(
                    file = %entry.file_name().to_string_lossy(),
                    error = %e,
                    "Failed to move orphan back to incoming"
                );
            }
        }
    }

    if moved > 0 {
        info!(count = moved, "Orphan reconciliation complete");
    }

    Ok(moved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn orphans_return_to_the_incoming_root() {
        let dir = tempdir().unwrap();
        let layout = StagingLayout::new(dir.path().join("work"));
        layout.ensure().unwrap();
        let incoming = dir.path().join("incoming");
        std::fs::create_dir_all(&incoming).unwrap();

        std::fs::write(layout.processing().join("orphan.xml"), b"<r/>").unwrap();
        std::fs::write(layout.processing().join("second.xml"), b"<s/>").unwrap();

        let moved = reconcile_orphans(&layout, &incoming).unwrap();

        assert_eq!(moved, 2);
        assert!(incoming.join("orphan.xml").exists());
        assert!(incoming.join("second.xml").exists());
        assert!(!layout.processing().join("orphan.xml").exists());
    }

    #[test]
    fn directories_in_processing_are_left_alone() {
        let dir = tempdir().unwrap();
        let layout = StagingLayout::new(dir.path().join("work"));
        layout.ensure().unwrap();
        let incoming = dir.path().join("incoming");
        std::fs::create_dir_all(&incoming).unwrap();

        std::fs::create_dir_all(layout.processing().join("subdir")).unwrap();

        let moved = reconcile_orphans(&layout, &incoming).unwrap();

        assert_eq!(moved, 0);
        assert!(layout.processing().join("subdir").exists());
    }

    #[test]
    fn missing_processing_directory_is_a_clean_noop() {
        let dir = tempdir().unwrap();
        let layout = StagingLayout::new(dir.path().join("never-created"));
        let incoming = dir.path().join("incoming");

        assert_eq!(reconcile_orphans(&layout, &incoming).unwrap(), 0);
    }

    #[test]
    fn empty_processing_directory_moves_nothing() {
        let dir = tempdir().unwrap();
        let layout = StagingLayout::new(dir.path().join("work"));
        layout.ensure().unwrap();
        let incoming = dir.path().join("incoming");
        std::fs::create_dir_all(&incoming).unwrap();

        assert_eq!(reconcile_orphans(&layout, &incoming).unwrap(), 0);
    }
}
