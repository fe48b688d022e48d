//! Per-architecture build pipeline.
//!
//! Each build thread drives one architecture through the strictly ordered
//! phases install → clone/pull → build inside that architecture's chroot,
//! with a termination checkpoint between phases. Progress milestones are
//! recorded in the [`ThreadResult`] the worker reads after join.

use anyhow::{bail, Context, Result};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::{ManualDependency, Project};
use crate::fsutil;
use crate::lockfile::FileLock;
use crate::logger::{record, Level, Logger};
use crate::paths;
use crate::repo::extract_repo_name;
use crate::scripts::BuildScripts;
use crate::signals::Shutdown;

/// Progress milestones of a build thread, in pipeline order.
///
/// The observed sequence is always a prefix of
/// 0 % → 10 % → 30 % → 50 % → 70 % → 100 %.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Progress {
    /// Thread log prepared.
    Started,
    /// Package-manager lock acquired.
    PackageLockHeld,
    /// Main project packages installed.
    MainPackagesInstalled,
    /// Every manual dependency's packages installed.
    DependencyPackagesInstalled,
    /// All repositories cloned or pulled.
    SourcesSynced,
    /// Dependencies and main project built.
    Built,
}

impl Progress {
    pub fn percent(self) -> u8 {
        match self {
            Progress::Started => 0,
            Progress::PackageLockHeld => 10,
            Progress::MainPackagesInstalled => 30,
            Progress::DependencyPackagesInstalled => 50,
            Progress::SourcesSynced => 70,
            Progress::Built => 100,
        }
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Progress: {}%", self.percent())
    }
}

/// Everything one build thread needs for its architecture.
///
/// The `thread_chroot_*` paths are absolute with respect to the chroot
/// root; grafting them onto `thread_chroot_dir` yields the host-visible
/// location.
pub struct ThreadArgs<'a> {
    pub project: &'a Project,
    pub arch: String,
    /// `<main_project_build_dir>/logs/<arch>-worker.log` on the host.
    pub thread_log_file: PathBuf,
    /// `<build_dir>/<arch>-chroot`
    pub thread_chroot_dir: PathBuf,
    /// `/home/<name>` inside the chroot.
    pub thread_chroot_build_dir: PathBuf,
    /// `/home/<name>/logs/worker.log` inside the chroot.
    pub thread_chroot_log_file: PathBuf,
    /// `/home/<name>/binaries` inside the chroot.
    pub thread_chroot_target_dir: PathBuf,
    pub shutdown: Shutdown,
}

impl<'a> ThreadArgs<'a> {
    pub fn new(project: &'a Project, arch: &str, build_dir: &Path, shutdown: Shutdown) -> Self {
        let name = &project.name;
        Self {
            thread_log_file: project
                .main_project_build_dir
                .join("logs")
                .join(format!("{arch}-worker.log")),
            thread_chroot_dir: paths::chroot_dir(build_dir, arch),
            thread_chroot_build_dir: PathBuf::from(format!("/home/{name}")),
            thread_chroot_log_file: PathBuf::from(format!("/home/{name}/logs/worker.log")),
            thread_chroot_target_dir: PathBuf::from(format!("/home/{name}/binaries")),
            project,
            arch: arch.to_string(),
            shutdown,
        }
    }
}

/// Final record of one build thread; consumed by the worker after join.
#[derive(Debug)]
pub struct ThreadResult {
    /// 0 on success, nonzero on failure.
    pub status: i32,
    pub error_message: Option<String>,
    /// Last milestone reached.
    pub stats: Progress,
}

impl ThreadResult {
    pub fn is_success(&self) -> bool {
        self.status == 0
    }
}

/// Entry point of a build thread.
pub fn run_build(args: &ThreadArgs<'_>, scripts: &dyn BuildScripts) -> ThreadResult {
    let mut progress = Progress::Started;
    let project = args.project;

    let logger = match prepare_thread_log(args) {
        Ok(logger) => logger,
        Err(err) => {
            return ThreadResult {
                status: 1,
                error_message: Some(format!("{err:#}")),
                stats: progress,
            }
        }
    };
    record!(
        logger,
        Level::Info,
        Some(project.name.as_str()),
        Some(args.arch.as_str()),
        "Build thread started for project {}, architecture {}.",
        project.name,
        args.arch
    );

    match build_phases(args, scripts, &logger, &mut progress) {
        Ok(()) => {
            record!(
                logger,
                Level::Info,
                Some(project.name.as_str()),
                Some(args.arch.as_str()),
                "Build completed successfully for architecture {}.",
                args.arch
            );
            ThreadResult {
                status: 0,
                error_message: None,
                stats: progress,
            }
        }
        Err(err) => {
            record!(
                logger,
                Level::Error,
                Some(project.name.as_str()),
                Some(args.arch.as_str()),
                "{err:#}"
            );
            ThreadResult {
                status: 1,
                error_message: Some(format!("{err:#}")),
                stats: progress,
            }
        }
    }
}

fn prepare_thread_log(args: &ThreadArgs<'_>) -> Result<Logger> {
    fsutil::ensure_file(&args.thread_log_file).context("unable to create build thread log file")?;
    Logger::open(&args.thread_log_file)
}

fn build_phases(
    args: &ThreadArgs<'_>,
    scripts: &dyn BuildScripts,
    logger: &Logger,
    progress: &mut Progress,
) -> Result<()> {
    let project = args.project;
    let name = project.name.as_str();
    let arch = args.arch.as_str();

    // Host-visible locations of the in-chroot build tree. The chroot root
    // itself was created by chroot setup.
    let chroot_build_dir = fsutil::host_path(&args.thread_chroot_dir, &args.thread_chroot_build_dir);
    let chroot_log_file = fsutil::host_path(&args.thread_chroot_dir, &args.thread_chroot_log_file);
    let chroot_target_dir =
        fsutil::host_path(&args.thread_chroot_dir, &args.thread_chroot_target_dir);
    fsutil::ensure_dir(&chroot_build_dir).context("unable to create chroot build directory")?;
    fsutil::ensure_file(&chroot_log_file).context("unable to create chroot log file")?;
    fsutil::ensure_dir(&chroot_target_dir).context("unable to create chroot target directory")?;

    if args.shutdown.is_set() {
        record!(
            logger,
            Level::Interrupt,
            Some(name),
            Some(arch),
            "Termination signal received before installing packages, exiting..."
        );
        bail!("termination signal received before installing packages");
    }

    // Package installation is serialized per chroot: forked workers may
    // share a chroot across projects, so the package manager must not run
    // concurrently in it. Threads of one worker each own a different chroot.
    record!(
        logger,
        Level::Info,
        Some(name),
        Some(arch),
        "Starting installation of dependency packages in the chroot..."
    );
    let lock_path = args.thread_chroot_dir.join("lock");
    let package_lock =
        FileLock::acquire(&lock_path).context("failed to acquire package manager lock")?;
    *progress = Progress::PackageLockHeld;
    record!(
        logger,
        Level::Info,
        Some(name),
        Some(arch),
        "Acquired package manager lock."
    );

    // Early returns below drop the guard, so the lock is released on every
    // exit path.
    scripts
        .install_packages(
            &args.thread_chroot_dir,
            &args.thread_chroot_log_file,
            name,
            arch,
            &project.dependency_packages,
        )
        .context("failed to install main dependency packages")?;
    *progress = Progress::MainPackagesInstalled;

    for dep in &project.manual_dependencies {
        scripts
            .install_packages(
                &args.thread_chroot_dir,
                &args.thread_chroot_log_file,
                name,
                arch,
                &dep.dependencies,
            )
            .with_context(|| {
                format!("failed to install packages for manual dependency {}", dep.git_url)
            })?;
    }
    *progress = Progress::DependencyPackagesInstalled;
    record!(
        logger,
        Level::Info,
        Some(name),
        Some(arch),
        "All dependency packages installed in the chroot."
    );

    package_lock
        .release()
        .context("failed to release package manager lock")?;
    record!(
        logger,
        Level::Info,
        Some(name),
        Some(arch),
        "Released package manager lock."
    );

    if args.shutdown.is_set() {
        record!(
            logger,
            Level::Interrupt,
            Some(name),
            Some(arch),
            "Termination signal received before syncing sources, exiting..."
        );
        bail!("termination signal received before syncing sources");
    }

    // Repository names resolve up front: a bad URL fails the phase before
    // anything is cloned.
    let dep_repos: Vec<(String, &ManualDependency)> = project
        .manual_dependencies
        .iter()
        .map(|dep| {
            extract_repo_name(&dep.git_url)
                .with_context(|| format!("manual dependency {}", dep.git_url))
                .map(|repo_name| (repo_name, dep))
        })
        .collect::<Result<_>>()?;
    let main_repo = extract_repo_name(&project.repo_url).context("main repository")?;

    for (repo_name, dep) in &dep_repos {
        scripts
            .clone_or_pull(
                &args.thread_chroot_dir,
                &args.thread_chroot_build_dir,
                repo_name,
                &dep.git_url,
                &args.thread_log_file,
                name,
                arch,
            )
            .with_context(|| format!("failed to clone or pull manual dependency {repo_name}"))?;
    }
    scripts
        .clone_or_pull(
            &args.thread_chroot_dir,
            &args.thread_chroot_build_dir,
            &main_repo,
            &project.repo_url,
            &args.thread_log_file,
            name,
            arch,
        )
        .with_context(|| format!("failed to clone or pull main repository {main_repo}"))?;
    *progress = Progress::SourcesSynced;
    record!(
        logger,
        Level::Info,
        Some(name),
        Some(arch),
        "All sources cloned or pulled inside the chroot."
    );

    if args.shutdown.is_set() {
        record!(
            logger,
            Level::Interrupt,
            Some(name),
            Some(arch),
            "Termination signal received before starting the build, exiting..."
        );
        bail!("termination signal received before starting the build");
    }

    record!(
        logger,
        Level::Info,
        Some(name),
        Some(arch),
        "Starting build process for architecture {}...",
        arch
    );
    for (repo_name, dep) in &dep_repos {
        scripts
            .build(
                arch,
                &args.thread_chroot_dir,
                &args.thread_chroot_build_dir,
                repo_name,
                &dep.build_system,
                &args.thread_log_file,
                &args.thread_chroot_log_file,
                name,
                None,
            )
            .with_context(|| format!("failed to build manual dependency {repo_name}"))?;
    }
    scripts
        .build(
            arch,
            &args.thread_chroot_dir,
            &args.thread_chroot_build_dir,
            &main_repo,
            &project.main_build_system,
            &args.thread_log_file,
            &args.thread_chroot_log_file,
            name,
            Some((
                args.thread_chroot_target_dir.as_path(),
                project.target_dir.as_path(),
            )),
        )
        .with_context(|| format!("failed to build main repository {main_repo}"))?;
    *progress = Progress::Built;

    Ok(())
}
