//! Cross-process advisory file locks.
//!
//! Exclusive and blocking, released on [`FileLock::release`] or when the
//! guard drops (closing the descriptor releases the lock). That makes
//! every early-return path release the lock as well. Lock files are
//! created on demand and never deleted.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Exclusive advisory lock over one file.
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Block until the exclusive lock on `path` is acquired.
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = open_lock_file(path)?;
        file.lock_exclusive()
            .with_context(|| format!("unable to acquire lock on {}", path.display()))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Non-blocking variant; errors when the lock is held elsewhere.
    pub fn try_acquire(path: &Path) -> Result<Self> {
        let file = open_lock_file(path)?;
        file.try_lock_exclusive()
            .with_context(|| format!("lock on {} is held elsewhere", path.display()))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Release explicitly, surfacing unlock errors.
    ///
    /// Dropping the guard releases the lock too, silently.
    pub fn release(self) -> Result<()> {
        self.file
            .unlock()
            .with_context(|| format!("unable to release lock on {}", self.path.display()))
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
        .with_context(|| format!("unable to open lock file {}", path.display()))
}
