//! Nightly binaries-rotation cronjob, installed once at worker startup.
//!
//! All workers of one user mutate the same crontab, so the read-modify-
//! write runs under the global [`paths::CRONJOB_LOCK_FILE`] lock. The
//! installation is idempotent: lines byte-equal to the new entry are
//! removed before it is appended, so restarts leave exactly one entry.
//!
//! Crontab access goes through the [`Crontab`] port; the production
//! adapter drives `/usr/bin/crontab` for `$USER`, and tests substitute a
//! fake.

use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::Project;
use crate::lockfile::FileLock;
use crate::logger::{record, Level, Logger};
use crate::paths;

/// Port over per-user crontab storage.
pub trait Crontab {
    /// The current crontab contents; empty when the user has none.
    fn current(&self) -> Result<String>;

    /// Replace the crontab with `content`.
    fn install(&self, content: &str) -> Result<()>;
}

/// Production adapter: `/usr/bin/crontab -u $USER`.
///
/// Installation goes through a temporary file under the project build
/// directory, removed afterwards.
pub struct SystemCrontab {
    user: String,
    temp_file: PathBuf,
}

impl SystemCrontab {
    pub fn for_project(project: &Project) -> Result<Self> {
        let user = std::env::var("USER").context("USER is not set; cannot manage the crontab")?;
        Ok(Self {
            user,
            temp_file: project
                .main_project_build_dir
                .join(format!("{}-crontab", project.name)),
        })
    }
}

impl Crontab for SystemCrontab {
    fn current(&self) -> Result<String> {
        let output = Command::new("/usr/bin/crontab")
            .args(["-u", &self.user, "-l"])
            .output()
            .context("failed to run crontab -l")?;
        // A user without a crontab makes `crontab -l` exit nonzero.
        if !output.status.success() {
            return Ok(String::new());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn install(&self, content: &str) -> Result<()> {
        fs::write(&self.temp_file, content).with_context(|| {
            format!(
                "unable to write temporary crontab file {}",
                self.temp_file.display()
            )
        })?;
        let status = Command::new("/usr/bin/crontab")
            .args(["-u", &self.user])
            .arg(&self.temp_file)
            .status()
            .context("failed to run crontab")?;
        let result = if status.success() {
            Ok(())
        } else {
            Err(anyhow!("crontab install exited with {status}"))
        };
        let _ = fs::remove_file(&self.temp_file);
        result
    }
}

/// The exact crontab line scheduling the nightly rotation for `project`.
pub fn rotation_entry(project: &Project, rotation_script: &Path) -> String {
    let limits = &project.binaries_limits;
    format!(
        "0 0 * * * {} {} {} {} {} {} {} {} {} {}\n",
        rotation_script.display(),
        project.name,
        project.target_dir.display(),
        project.cronjob_log_file.display(),
        limits.weekly_mem_limit,
        limits.monthly_mem_limit,
        limits.yearly_mem_limit,
        limits.weekly_interval,
        limits.monthly_interval,
        limits.yearly_interval,
    )
}

/// `existing` with every line byte-equal to `entry` removed and `entry`
/// appended.
pub fn merged_crontab(existing: &str, entry: &str) -> String {
    let entry_line = entry.trim_end_matches('\n');
    let mut merged = String::new();
    for line in existing.lines() {
        if line != entry_line {
            merged.push_str(line);
            merged.push('\n');
        }
    }
    merged.push_str(entry_line);
    merged.push('\n');
    merged
}

/// Install the rotation entry for `project` under the global cron lock.
pub fn install_rotation_cronjob(
    project: &Project,
    crontab: &dyn Crontab,
    logger: &Logger,
) -> Result<()> {
    let lock = FileLock::acquire(Path::new(paths::CRONJOB_LOCK_FILE))
        .context("unable to acquire the cronjob lock")?;

    let rotation_script = paths::expand_tilde(paths::SCRIPTS_DIR)?.join(paths::ROTATION_SCRIPT);
    let entry = rotation_entry(project, &rotation_script);
    let existing = crontab
        .current()
        .context("unable to read the existing crontab")?;
    crontab
        .install(&merged_crontab(&existing, &entry))
        .context("unable to install the new crontab")?;

    record!(
        logger,
        Level::Info,
        Some(project.name.as_str()),
        None,
        "Rotation cronjob entry installed."
    );
    lock.release()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::cell::RefCell;
    use tempfile::TempDir;

    fn test_project(build_dir: &Path) -> Project {
        let yaml = format!(
            r#"
build_dir: {}
projects:
  - name: p1
    target_dir: /tmp/out
    source:
      main_repo:
        git_url: https://x/y/r.git
        build_system: make
    binaries-limits:
      weekly_mem_limit: 500
      monthly_mem_limit: 2000
      yearly_mem_limit: 10000
      weekly_interval: 10080
      monthly_interval: 43200
      yearly_interval: 525600
"#,
            build_dir.display()
        );
        Config::from_yaml(&yaml).unwrap().projects.remove(0)
    }

    struct FakeCrontab {
        installed: RefCell<String>,
    }

    impl FakeCrontab {
        fn new(initial: &str) -> Self {
            Self {
                installed: RefCell::new(initial.to_string()),
            }
        }
    }

    impl Crontab for FakeCrontab {
        fn current(&self) -> Result<String> {
            Ok(self.installed.borrow().clone())
        }

        fn install(&self, content: &str) -> Result<()> {
            *self.installed.borrow_mut() = content.to_string();
            Ok(())
        }
    }

    #[test]
    fn rotation_entry_has_the_documented_shape() {
        let dir = TempDir::new().unwrap();
        let project = test_project(dir.path());
        let entry = rotation_entry(&project, Path::new("/usr/lib/v2ci/scripts/binaries_rotation.sh"));
        assert_eq!(
            entry,
            format!(
                "0 0 * * * /usr/lib/v2ci/scripts/binaries_rotation.sh p1 /tmp/out {}/p1/logs/binaries_rotation_cronjob.log 500 2000 10000 10080 43200 525600\n",
                dir.path().display()
            )
        );
    }

    #[test]
    fn merged_crontab_preserves_unrelated_lines() {
        let merged = merged_crontab("0 1 * * * other-job\n", "0 0 * * * rotate p1\n");
        assert_eq!(merged, "0 1 * * * other-job\n0 0 * * * rotate p1\n");
    }

    #[test]
    fn merged_crontab_drops_byte_equal_duplicates() {
        let entry = "0 0 * * * rotate p1\n";
        let merged = merged_crontab("0 0 * * * rotate p1\n0 1 * * * other\n", entry);
        assert_eq!(merged, "0 1 * * * other\n0 0 * * * rotate p1\n");
    }

    #[test]
    fn merged_crontab_is_idempotent() {
        let entry = "0 0 * * * rotate p1\n";
        let mut crontab = String::from("0 1 * * * other\n");
        for _ in 0..5 {
            crontab = merged_crontab(&crontab, entry);
        }
        let matching = crontab.lines().filter(|l| *l == entry.trim_end()).count();
        assert_eq!(matching, 1);
    }

    #[test]
    fn merged_crontab_from_empty() {
        let merged = merged_crontab("", "0 0 * * * rotate p1\n");
        assert_eq!(merged, "0 0 * * * rotate p1\n");
    }

    #[test]
    fn install_is_idempotent_across_restarts() {
        let dir = TempDir::new().unwrap();
        let project = test_project(dir.path());
        let logger = Logger::open(&dir.path().join("worker.log")).unwrap();
        let crontab = FakeCrontab::new("0 1 * * * other\n");

        install_rotation_cronjob(&project, &crontab, &logger).unwrap();
        install_rotation_cronjob(&project, &crontab, &logger).unwrap();

        let installed = crontab.installed.borrow();
        assert!(installed.contains("0 1 * * * other"));
        let rotation_lines = installed
            .lines()
            .filter(|l| l.contains("binaries_rotation.sh p1"))
            .count();
        assert_eq!(rotation_lines, 1);
    }
}
