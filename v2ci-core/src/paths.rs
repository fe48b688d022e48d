//! Well-known paths: configuration file, collaborator scripts, pidfiles
//! and the global lock files under `/tmp`.

use anyhow::{bail, Result};
use std::path::{Path, PathBuf};

/// Default configuration file, tilde-expanded from `$HOME`.
pub const DEFAULT_CONFIG_PATH: &str = "~/.config/v2ci/config.yml";

/// Directory holding the collaborator shell scripts.
pub const SCRIPTS_DIR: &str = "/usr/lib/v2ci/scripts";

pub const CHROOT_SETUP_SCRIPT: &str = "chroot_setup.sh";
pub const CHECK_UPDATES_SCRIPT: &str = "check_updates.sh";
pub const INSTALL_PACKAGES_SCRIPT: &str = "install_packages_in_chroot.sh";
pub const CLONE_OR_PULL_SCRIPT: &str = "clone_or_pull_for_project.sh";
pub const BUILD_SCRIPT: &str = "cross_compiler.sh";
pub const ROTATION_SCRIPT: &str = "binaries_rotation.sh";

/// Supervisor singleton pidfile.
pub const SUPERVISOR_PID_FILE: &str = "/tmp/rootless_v2ci.pid";

/// Global lock serializing crontab mutation across worker processes.
pub const CRONJOB_LOCK_FILE: &str = "/tmp/cronjob_lock.lock";

/// Global lock serializing recovery, which may re-bootstrap shared chroots.
pub const RECOVERY_LOCK_FILE: &str = "/tmp/v2ci_worker_recovery_state.lock";

/// Singleton pidfile for the worker owning `project_name`.
pub fn worker_pid_file(project_name: &str) -> PathBuf {
    PathBuf::from(format!("/tmp/{project_name}-worker.pid"))
}

/// Chroot root for one architecture: `<build_dir>/<arch>-chroot`.
pub fn chroot_dir(build_dir: &Path, arch: &str) -> PathBuf {
    build_dir.join(format!("{arch}-chroot"))
}

/// Expand a leading `~` using `$HOME`. Paths without a tilde pass through.
pub fn expand_tilde(path: &str) -> Result<PathBuf> {
    expand_tilde_with(std::env::var("HOME").ok().as_deref(), path)
}

fn expand_tilde_with(home: Option<&str>, path: &str) -> Result<PathBuf> {
    let Some(rest) = path.strip_prefix('~') else {
        return Ok(PathBuf::from(path));
    };
    match home {
        Some(home) if !home.is_empty() => Ok(PathBuf::from(format!("{home}{rest}"))),
        _ => bail!("HOME is not set; cannot expand {path}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_tilde_substitutes_home() {
        let expanded = expand_tilde_with(Some("/home/ci"), "~/.config/v2ci/config.yml").unwrap();
        assert_eq!(expanded, PathBuf::from("/home/ci/.config/v2ci/config.yml"));
    }

    #[test]
    fn expand_tilde_passes_absolute_paths_through() {
        let expanded = expand_tilde_with(None, "/usr/lib/v2ci/scripts").unwrap();
        assert_eq!(expanded, PathBuf::from("/usr/lib/v2ci/scripts"));
    }

    #[test]
    fn expand_tilde_without_home_is_an_error() {
        assert!(expand_tilde_with(None, "~/x").is_err());
        assert!(expand_tilde_with(Some(""), "~/x").is_err());
    }

    #[test]
    fn worker_pid_file_embeds_project_name() {
        assert_eq!(
            worker_pid_file("sshlirp"),
            PathBuf::from("/tmp/sshlirp-worker.pid")
        );
    }

    #[test]
    fn chroot_dir_appends_arch_suffix() {
        assert_eq!(
            chroot_dir(Path::new("/tmp/bd"), "arm64"),
            PathBuf::from("/tmp/bd/arm64-chroot")
        );
    }
}
