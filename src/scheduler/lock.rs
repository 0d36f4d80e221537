//! Single-instance file lock for the scheduler daemon (spec 4.5).

use std::io;
use std::path::{Path, PathBuf};

/// Holds an exclusively-created lock file for the lifetime of the daemon.
/// Dropping it removes the file so a later run can acquire it again.
pub struct SchedulerLock {
    path: PathBuf,
}

impl SchedulerLock {
    /// Attempt to acquire the lock at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`io::ErrorKind::AlreadyExists`] if another daemon instance
    /// already holds the lock.
    pub fn acquire(path: &Path) -> io::Result<Self> {
        std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        Ok(Self { path: path.to_path_buf() })
    }
}

impl Drop for SchedulerLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
