//! Scoped advisory locking for cross-process read-modify-write sections.
//!
//! Two shared documents in this system — the job-id counter and the usage
//! ledger — require exclusive access while being read, mutated, and written
//! back. [`LockedFile`] creates (or opens) a named lock file and holds an
//! OS-level advisory exclusive lock on it for as long as the guard is alive,
//! releasing it on every exit path including an early return or a panic
//! unwinding through the caller.
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;

use fs2::FileExt;

/// Holds an exclusive advisory lock on a file for the lifetime of the guard.
pub struct LockedFile {
    file: File,
}

impl LockedFile {
    /// Create (if absent) and exclusively lock `path`, blocking until the
    /// lock is available. Re-entrant acquisition from the same process on the
    /// same lock is not supported.
    pub fn acquire(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        file.lock_exclusive()?;

        Ok(Self { file })
    }

    /// Acquire the lock and run `f` against the open file, releasing the lock
    /// once `f` returns (successfully or not).
    pub fn with_lock<T>(
        path: &Path,
        f: impl FnOnce(&mut File) -> io::Result<T>,
    ) -> io::Result<T> {
        let mut guard = Self::acquire(path)?;
        f(&mut guard.file)
    }
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        // Best-effort: if the unlock fails there is nothing more we can do,
        // and the OS releases the lock anyway once the fd is closed.
        let _ = FileExt::unlock(&self.file);
    }
}
