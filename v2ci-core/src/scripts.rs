//! Collaborator scripts: opaque external programs with fixed argv contracts.
//!
//! The core never implements chroot bootstrap, update detection, package
//! installation, clone/pull or cross-compilation itself; it invokes the
//! shell scripts under [`paths::SCRIPTS_DIR`]. Every invocation first sets
//! execute permissions on the script, then spawns it argv-style (no shell,
//! no quoting) and interprets the exit status: a `None` code means the
//! script was killed by a signal and counts as failure.
//!
//! [`BuildScripts`] is the trait boundary; tests substitute mocks.

use anyhow::{bail, Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::paths;

/// Outcome of an update check on one repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateCheck {
    UpToDate,
    UpdateAvailable,
}

/// Port over the collaborator scripts.
///
/// `Sync` because one implementation is shared by all build threads of a
/// worker.
pub trait BuildScripts: Sync {
    /// Bootstrap (or validate) the chroot for one architecture. Idempotent
    /// on the script side: an already valid chroot returns success.
    fn chroot_setup(&self, arch: &str, chroot_dir: &Path, main_log_file: &Path) -> Result<()>;

    /// Ask whether `repo_name` inside the chroot has upstream changes.
    fn check_updates(
        &self,
        chroot_dir: &Path,
        chroot_build_dir: &Path,
        repo_name: &str,
        chroot_log_file: &Path,
        project: &str,
        arch: &str,
    ) -> Result<UpdateCheck>;

    /// Install a package list inside the chroot. The caller holds the
    /// chroot's package-manager lock. The log path is relative to the
    /// chroot root; the script writes there from inside.
    fn install_packages(
        &self,
        chroot_dir: &Path,
        chroot_log_file: &Path,
        project: &str,
        arch: &str,
        packages: &[String],
    ) -> Result<()>;

    /// Clone `git_url` into the chroot build dir, or pull if already there.
    #[allow(clippy::too_many_arguments)]
    fn clone_or_pull(
        &self,
        chroot_dir: &Path,
        chroot_build_dir: &Path,
        repo_name: &str,
        git_url: &str,
        thread_log_file: &Path,
        project: &str,
        arch: &str,
    ) -> Result<()>;

    /// Cross-compile one repository inside the chroot. The main project
    /// passes `target_dirs = (in-chroot target, host target)` so the script
    /// copies the finished binaries out; dependency builds pass `None`.
    #[allow(clippy::too_many_arguments)]
    fn build(
        &self,
        arch: &str,
        chroot_dir: &Path,
        chroot_build_dir: &Path,
        repo_name: &str,
        build_system: &str,
        thread_log_file: &Path,
        chroot_log_file: &Path,
        project: &str,
        target_dirs: Option<(&Path, &Path)>,
    ) -> Result<()>;
}

/// Production implementation invoking the scripts in `scripts_dir`.
pub struct ScriptRunner {
    scripts_dir: PathBuf,
}

impl ScriptRunner {
    pub fn new(scripts_dir: &Path) -> Self {
        Self {
            scripts_dir: scripts_dir.to_path_buf(),
        }
    }

    /// Runner over the system scripts directory.
    pub fn system() -> Result<Self> {
        Ok(Self::new(&paths::expand_tilde(paths::SCRIPTS_DIR)?))
    }

    /// Resolve a script and make it executable. chmod failures are fatal.
    fn executable(&self, script: &str) -> Result<PathBuf> {
        let path = self.scripts_dir.join(script);
        let mut perms = fs::metadata(&path)
            .with_context(|| format!("unable to stat script {}", path.display()))?
            .permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms)
            .with_context(|| format!("unable to set execute permissions on {}", path.display()))?;
        Ok(path)
    }
}

/// Run a prepared command and return its exit code. Abnormal termination
/// (killed by a signal) is an error, not a code.
fn run_script(script: &Path, cmd: &mut Command) -> Result<i32> {
    let status = cmd
        .status()
        .with_context(|| format!("failed to spawn script {}", script.display()))?;
    match status.code() {
        Some(code) => Ok(code),
        None => bail!(
            "script {} did not terminate normally ({status})",
            script.display()
        ),
    }
}

impl BuildScripts for ScriptRunner {
    fn chroot_setup(&self, arch: &str, chroot_dir: &Path, main_log_file: &Path) -> Result<()> {
        let script = self.executable(paths::CHROOT_SETUP_SCRIPT)?;
        let code = run_script(
            &script,
            Command::new(&script)
                .arg(arch)
                .arg(chroot_dir)
                .arg(main_log_file),
        )?;
        if code != 0 {
            bail!("chroot setup for architecture {arch} exited with code {code}");
        }
        Ok(())
    }

    fn check_updates(
        &self,
        chroot_dir: &Path,
        chroot_build_dir: &Path,
        repo_name: &str,
        chroot_log_file: &Path,
        project: &str,
        arch: &str,
    ) -> Result<UpdateCheck> {
        let script = self.executable(paths::CHECK_UPDATES_SCRIPT)?;
        let code = run_script(
            &script,
            Command::new(&script)
                .arg(chroot_dir)
                .arg(chroot_build_dir)
                .arg(repo_name)
                .arg(chroot_log_file)
                .arg(project)
                .arg(arch),
        )?;
        match code {
            0 => Ok(UpdateCheck::UpToDate),
            2 => Ok(UpdateCheck::UpdateAvailable),
            other => bail!("update check for repository {repo_name} exited with code {other}"),
        }
    }

    fn install_packages(
        &self,
        chroot_dir: &Path,
        chroot_log_file: &Path,
        project: &str,
        arch: &str,
        packages: &[String],
    ) -> Result<()> {
        let script = self.executable(paths::INSTALL_PACKAGES_SCRIPT)?;
        let code = run_script(
            &script,
            Command::new(&script)
                .arg(chroot_dir)
                .arg(chroot_log_file)
                .arg(project)
                .arg(arch)
                .args(packages),
        )?;
        if code != 0 {
            bail!("package installation for architecture {arch} exited with code {code}");
        }
        Ok(())
    }

    fn clone_or_pull(
        &self,
        chroot_dir: &Path,
        chroot_build_dir: &Path,
        repo_name: &str,
        git_url: &str,
        thread_log_file: &Path,
        project: &str,
        arch: &str,
    ) -> Result<()> {
        let script = self.executable(paths::CLONE_OR_PULL_SCRIPT)?;
        let code = run_script(
            &script,
            Command::new(&script)
                .arg(chroot_dir)
                .arg(chroot_build_dir)
                .arg(repo_name)
                .arg(git_url)
                .arg(thread_log_file)
                .arg(project)
                .arg(arch),
        )?;
        if code != 0 {
            bail!("clone or pull of repository {repo_name} exited with code {code}");
        }
        Ok(())
    }

    fn build(
        &self,
        arch: &str,
        chroot_dir: &Path,
        chroot_build_dir: &Path,
        repo_name: &str,
        build_system: &str,
        thread_log_file: &Path,
        chroot_log_file: &Path,
        project: &str,
        target_dirs: Option<(&Path, &Path)>,
    ) -> Result<()> {
        let script = self.executable(paths::BUILD_SCRIPT)?;
        let mut cmd = Command::new(&script);
        cmd.arg(arch)
            .arg(chroot_dir)
            .arg(chroot_build_dir)
            .arg(repo_name)
            .arg(build_system)
            .arg(thread_log_file)
            .arg(chroot_log_file)
            .arg(project);
        if let Some((chroot_target_dir, host_target_dir)) = target_dirs {
            cmd.arg(chroot_target_dir).arg(host_target_dir);
        }
        let code = run_script(&script, &mut cmd)?;
        if code != 0 {
            bail!("build of repository {repo_name} exited with code {code}");
        }
        Ok(())
    }
}
