//! Advisory per-user exclusivity lock
//!
//! One lock file per user under the data directory. Acquisition is
//! non-blocking: the file is created with `create_new`, so exactly one
//! worker wins; everyone else sees the file and backs off. The lock is
//! advisory: only workers honor it, and an out-of-band status write (e.g.
//! flipping the pause flag) does not take it.

use mailforge_common::types::OwnerId;
use mailforge_common::{Error, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Held exclusivity lock for one user; released on drop
#[derive(Debug)]
pub struct UserLock {
    path: PathBuf,
}

impl UserLock {
    /// Try to acquire the lock for `owner`.
    ///
    /// Returns `Ok(None)` when another worker already holds it - callers
    /// treat that as a silent no-op, not an error.
    pub fn try_acquire(data_dir: &Path, owner: OwnerId) -> Result<Option<Self>> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| Error::Persistence(format!("Failed to create lock directory: {}", e)))?;

        let path = data_dir.join(format!("{}.lock", owner));
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                if let Err(e) = writeln!(file, "{}", std::process::id()) {
                    warn!(owner, error = %e, "Failed to record pid in lock file");
                }
                debug!(owner, path = %path.display(), "Acquired user lock");
                Ok(Some(Self { path }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                debug!(owner, "User lock already held");
                Ok(None)
            }
            Err(e) => Err(Error::Concurrency(format!(
                "Failed to acquire lock for user {}: {}",
                owner, e
            ))),
        }
    }
}

impl Drop for UserLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to release user lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_exclusive_acquisition() {
        let dir = TempDir::new().unwrap();

        let first = UserLock::try_acquire(dir.path(), 7).unwrap();
        assert!(first.is_some());

        // Second acquisition for the same user is refused, not an error
        let second = UserLock::try_acquire(dir.path(), 7).unwrap();
        assert!(second.is_none());

        // A different user is unaffected
        let other = UserLock::try_acquire(dir.path(), 8).unwrap();
        assert!(other.is_some());
    }

    #[test]
    fn test_release_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("7.lock");

        {
            let _lock = UserLock::try_acquire(dir.path(), 7).unwrap().unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());

        // Reacquirable after release
        assert!(UserLock::try_acquire(dir.path(), 7).unwrap().is_some());
    }
}
