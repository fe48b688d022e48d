//! Singleton pidfiles with liveness probing.
//!
//! A pidfile is advisory: it records the owner's PID and is checked with a
//! signal-0 probe. A file naming a live process blocks a second instance;
//! a stale or unparsable file is overwritten.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::signals::pid_alive;

/// RAII claim over a pidfile; the file is removed on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Claim `path` for the current process.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(pid) = read_pid(path) {
            if pid_alive(pid) {
                bail!(
                    "another instance is already running with PID {pid} (pidfile {})",
                    path.display()
                );
            }
        }
        fs::write(path, format!("{}\n", std::process::id()))
            .with_context(|| format!("unable to create pidfile {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Read the PID recorded in `path`, if the file exists and parses.
pub fn read_pid(path: &Path) -> Option<u32> {
    let contents = fs::read_to_string(path).ok()?;
    contents.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn acquire_writes_own_pid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("v2ci.pid");

        let pidfile = PidFile::acquire(&path).unwrap();
        assert_eq!(read_pid(&path), Some(std::process::id()));
        drop(pidfile);
    }

    #[test]
    fn drop_removes_the_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("v2ci.pid");

        let pidfile = PidFile::acquire(&path).unwrap();
        drop(pidfile);
        assert!(!path.exists());
    }

    #[test]
    fn live_pid_blocks_acquisition() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("v2ci.pid");
        fs::write(&path, format!("{}\n", std::process::id())).unwrap();

        let err = PidFile::acquire(&path).unwrap_err();
        assert!(err.to_string().contains("already running"));
    }

    #[test]
    fn stale_pid_is_overwritten() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("v2ci.pid");
        fs::write(&path, "4000000\n").unwrap();

        let pidfile = PidFile::acquire(&path).unwrap();
        assert_eq!(read_pid(&path), Some(std::process::id()));
        drop(pidfile);
    }

    #[test]
    fn garbage_contents_are_overwritten() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("v2ci.pid");
        fs::write(&path, "not a pid\n").unwrap();

        let pidfile = PidFile::acquire(&path).unwrap();
        assert_eq!(read_pid(&path), Some(std::process::id()));
        drop(pidfile);
    }

    #[test]
    fn read_pid_of_missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        assert_eq!(read_pid(&dir.path().join("absent.pid")), None);
    }
}
