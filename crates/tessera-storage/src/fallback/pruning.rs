//! Pruning of old rotation files
//!
//! The fallback directory is bounded by file count. Pruning removes the
//! oldest files first and never touches the file currently being written.
//! Records in pruned files are gone for good, so every prune is logged.

use std::path::PathBuf;

use tracing::warn;

use super::store::{FallbackStore, WriterState};

/// Files to delete so that at most `max_files` remain
///
/// `files` must be sorted oldest first.
pub fn files_to_prune(files: &[PathBuf], max_files: usize) -> &[PathBuf] {
    let excess = files.len().saturating_sub(max_files.max(1));
    &files[..excess]
}

impl FallbackStore {
    /// Remove the oldest files beyond `max_files`
    ///
    /// Returns the number of files removed.
    pub fn prune(&self) -> usize {
        let state = self.state.lock();
        self.prune_locked(&state)
    }

    pub(super) fn prune_locked(&self, state: &WriterState) -> usize {
        let files = match self.rotation_files() {
            Ok(files) => files,
            Err(e) => {
                warn!(error = %e, "Failed to list fallback files for pruning");
                return 0;
            }
        };

        let current = state.current.as_ref().map(|c| c.path.as_path());
        let mut removed = 0;
        for path in files_to_prune(&files, self.config().max_files) {
            if current == Some(path.as_path()) {
                continue;
            }
            match std::fs::remove_file(path) {
                Ok(()) => {
                    removed += 1;
                    warn!(path = %path.display(), "Pruned fallback file with undelivered records");
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to prune fallback file"),
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_files_to_prune() {
        let files: Vec<PathBuf> = (0..5).map(|i| PathBuf::from(format!("f-{i}"))).collect();
        assert_eq!(files_to_prune(&files, 3), &files[..2]);
        assert!(files_to_prune(&files, 5).is_empty());
        assert!(files_to_prune(&files, 10).is_empty());
        // Zero is treated as one so the current file survives
        assert_eq!(files_to_prune(&files, 0).len(), 4);
    }
}
