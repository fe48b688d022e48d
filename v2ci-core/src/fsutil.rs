//! Filesystem helpers shared by the supervisor, workers and build threads.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::path::{Path, PathBuf};

/// Recursively create a directory.
///
/// Idempotent: an existing directory (and its mode) is left untouched.
pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("unable to create directory {}", path.display()))
}

/// Create a file after creating its parent directories.
///
/// An existing file is truncated: log files are reset this way at worker
/// start and during recovery.
pub fn ensure_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    File::create(path).with_context(|| format!("unable to create file {}", path.display()))?;
    Ok(())
}

/// Lexically graft a chroot-relative absolute path onto a chroot root.
///
/// `host_path("/bd/amd64-chroot", "/home/p1")` is `/bd/amd64-chroot/home/p1`.
/// No symlink resolution is performed.
pub fn host_path(chroot_dir: &Path, chroot_relative: &Path) -> PathBuf {
    match chroot_relative.strip_prefix("/") {
        Ok(relative) => chroot_dir.join(relative),
        Err(_) => chroot_dir.join(chroot_relative),
    }
}
