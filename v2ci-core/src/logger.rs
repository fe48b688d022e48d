//! Line-buffered structured log records.
//!
//! Every actor (supervisor, worker, build thread) appends to its own log
//! file. Records have the shape
//!
//! ```text
//! [2026-08-01 12:00:00] [ERROR] source: { file: src/worker.rs, line: 42 }, project: p1, arch: amd64, message: ...
//! ```
//!
//! Concurrent writers to the same file produce interleaved but line-atomic
//! records: each record is flushed as one line.

use anyhow::{Context, Result};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{LineWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Severity of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Error,
    Interrupt,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Level::Info => "INFO",
            Level::Error => "ERROR",
            Level::Interrupt => "INTERRUPT",
        };
        f.write_str(label)
    }
}

/// Append-only, line-buffered log destination.
pub struct Logger {
    path: PathBuf,
    out: Mutex<LineWriter<File>>,
}

impl Logger {
    /// Open `path` for appending, creating it if missing.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("unable to open log file {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            out: Mutex::new(LineWriter::new(file)),
        })
    }

    /// Reopen the log at `path`, dropping the previous destination.
    ///
    /// Used after recovery recreated a log file the old handle pointed at.
    pub fn reopen(&mut self, path: &Path) -> Result<()> {
        *self = Self::open(path)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record.
    ///
    /// Write failures are swallowed: logging must never take down the actor
    /// it serves. Prefer the [`record!`](crate::logger::record) macro, which
    /// fills in the source coordinates.
    pub fn write_record(
        &self,
        level: Level,
        file: &str,
        line: u32,
        project: Option<&str>,
        arch: Option<&str>,
        message: &str,
    ) {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        let mut out = match self.out.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let _ = writeln!(
            out,
            "[{timestamp}] [{level}] source: {{ file: {file}, line: {line} }}, project: {}, arch: {}, message: {message}",
            project.unwrap_or("N/A"),
            arch.unwrap_or("N/A"),
        );
    }
}

/// Append a record to a [`Logger`], capturing the call site.
///
/// `record!(logger, Level::Error, Some("p1"), None, "failed: {err}")`
macro_rules! record {
    ($logger:expr, $level:expr, $project:expr, $arch:expr, $($arg:tt)*) => {
        $logger.write_record($level, file!(), line!(), $project, $arch, &format!($($arg)*))
    };
}
pub(crate) use record;

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn records_carry_level_project_arch_and_message() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("main.log");
        let logger = Logger::open(&path).unwrap();

        record!(logger, Level::Error, Some("p1"), Some("amd64"), "boom {}", 7);

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("[ERROR]"));
        assert!(contents.contains("project: p1"));
        assert!(contents.contains("arch: amd64"));
        assert!(contents.contains("message: boom 7"));
        assert!(contents.contains("file: "));
        assert!(contents.ends_with('\n'));
    }

    #[test]
    fn missing_coordinates_render_as_na() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("main.log");
        let logger = Logger::open(&path).unwrap();

        record!(logger, Level::Info, None, None, "hello");

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("project: N/A"));
        assert!(contents.contains("arch: N/A"));
    }

    #[test]
    fn open_appends_to_existing_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("main.log");
        fs::write(&path, "earlier line\n").unwrap();

        let logger = Logger::open(&path).unwrap();
        record!(logger, Level::Info, None, None, "later line");

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("earlier line\n"));
        assert!(contents.contains("later line"));
    }

    #[test]
    fn reopen_switches_to_the_fresh_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("worker.log");
        let mut logger = Logger::open(&path).unwrap();

        fs::remove_file(&path).unwrap();
        fs::write(&path, "").unwrap();
        logger.reopen(&path).unwrap();
        record!(logger, Level::Info, Some("p1"), None, "after recovery");

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("after recovery"));
    }

    #[test]
    fn level_labels() {
        assert_eq!(Level::Info.to_string(), "INFO");
        assert_eq!(Level::Error.to_string(), "ERROR");
        assert_eq!(Level::Interrupt.to_string(), "INTERRUPT");
    }
}
