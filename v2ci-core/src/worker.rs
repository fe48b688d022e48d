//! Project worker: one process per project, forked by the supervisor.
//!
//! The worker owns a polling loop:
//!
//! ```text
//! init ─► bootstrap ─► install cron ─► check updates ─► need update?
//!                                            ▲              │ yes
//!           no ◄─────────────────────────────┘              ▼
//!            │                                        spawn builds
//!          sleep ◄── all success ◄── join ── any failure ─► recovery ─┐
//!            │                                   ▲                    │
//!   terminate? ── yes ─► cleanup ─► exit         └────────────────────┘
//! ```
//!
//! Update-check failures run recovery with one retry per poll interval;
//! build failures run recovery once and restart the iteration without
//! sleeping. SIGTERM is observed at the checkpoints marked in the loop;
//! running collaborators are never killed.

pub mod cron;
pub mod recovery;

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use crate::build_thread::{run_build, ThreadArgs};
use crate::config::{BuildMode, Project};
use crate::fsutil;
use crate::logger::{record, Level, Logger};
use crate::paths;
use crate::pidfile::PidFile;
use crate::repo::extract_repo_name;
use crate::scripts::{BuildScripts, UpdateCheck};
use crate::signals::Shutdown;
use crate::worker::cron::Crontab;
use crate::worker::recovery::{handle_recovery, RecoveryOutcome};

/// Outcome of one update-check pass.
enum PollOutcome {
    Updates(bool),
    /// Transient failure (bad repo URL); retry on the next iteration.
    RetryLater,
    Terminated,
}

/// Entry point of a worker process. Returns only after the polling loop
/// exits; the forking supervisor maps the result to the child exit code.
pub fn run_worker(
    project: &Project,
    build_dir: &Path,
    scripts: &dyn BuildScripts,
    crontab: &dyn Crontab,
) -> Result<()> {
    fsutil::ensure_file(&project.worker_log_file)
        .context("unable to create the worker log file")?;
    let mut logger = Logger::open(&project.worker_log_file)?;
    let name = project.name.as_str();
    record!(logger, Level::Info, Some(name), None, "v2ci worker started.");

    let _pidfile = match PidFile::acquire(&paths::worker_pid_file(&name)) {
        Ok(pidfile) => pidfile,
        Err(err) => {
            record!(logger, Level::Error, Some(name), None, "{err:#}");
            return Err(err);
        }
    };
    let shutdown = Shutdown::install();

    if project.architectures.is_empty() {
        record!(
            logger,
            Level::Error,
            Some(name),
            None,
            "No usable architectures remain for project {}; exiting.",
            name
        );
        bail!("no usable architectures remain for project {name}");
    }

    for dir in [&project.main_project_build_dir, &project.target_dir] {
        if let Err(err) = fsutil::ensure_dir(dir) {
            record!(logger, Level::Error, Some(name), None, "{err:#}");
            return Err(err);
        }
    }
    record!(
        logger,
        Level::Info,
        Some(name),
        None,
        "Initial directories set up for project {}.",
        name
    );

    if let Err(err) = cron::install_rotation_cronjob(project, crontab, &logger) {
        record!(
            logger,
            Level::Error,
            Some(name),
            None,
            "Failed to set the binaries rotation cronjob: {err:#}"
        );
        return Err(err);
    }
    record!(
        logger,
        Level::Info,
        Some(name),
        None,
        "Binaries rotation cronjob set for project {}.",
        name
    );

    loop {
        if shutdown.is_set() {
            record!(
                logger,
                Level::Interrupt,
                Some(name),
                None,
                "Termination signal received before starting operations, exiting..."
            );
            break;
        }
        record!(logger, Level::Info, Some(name), None, "Starting build operations...");

        let need_update = match poll_updates(&mut logger, project, build_dir, scripts, shutdown) {
            PollOutcome::Terminated => {
                record!(
                    logger,
                    Level::Interrupt,
                    Some(name),
                    None,
                    "Termination signal received during update checks, exiting..."
                );
                break;
            }
            PollOutcome::RetryLater => continue,
            PollOutcome::Updates(need_update) => need_update,
        };

        if !need_update {
            record!(
                logger,
                Level::Info,
                Some(name),
                None,
                "No updates found for project {}. Sleeping for {} seconds.",
                name,
                project.poll_secs()
            );
            sleep_interruptible(project.poll_interval, shutdown, &logger, &name);
            continue;
        }

        let failed_builds = dispatch_builds(&logger, project, build_dir, scripts, shutdown);

        if failed_builds > 0 {
            record!(
                logger,
                Level::Info,
                Some(name),
                None,
                "{} builds failed for project {}. Retrying with recovery...",
                failed_builds,
                name
            );
            if !recover_until_done(&mut logger, project, build_dir, scripts, shutdown) {
                record!(
                    logger,
                    Level::Interrupt,
                    Some(name),
                    None,
                    "Termination signal received during recovery after failed builds, exiting..."
                );
                break;
            }
            record!(
                logger,
                Level::Info,
                Some(name),
                None,
                "Recovery completed for project {}. Restarting builds...",
                name
            );
            // The failure itself triggered the retry; no sleep here.
            continue;
        }

        record!(
            logger,
            Level::Info,
            Some(name),
            None,
            "All builds completed successfully for project {}.",
            name
        );
        record!(
            logger,
            Level::Info,
            Some(name),
            None,
            "Your final binaries are located in {} for each architecture.",
            project.target_dir.display()
        );
        record!(
            logger,
            Level::Info,
            Some(name),
            None,
            "Sleeping for {} seconds before the next check.",
            project.poll_secs()
        );
        sleep_interruptible(project.poll_interval, shutdown, &logger, &name);
    }

    record!(
        logger,
        Level::Info,
        Some(name),
        None,
        "v2ci worker for project {} exiting.",
        name
    );
    Ok(())
}

/// Check the watched repositories for upstream changes.
///
/// Uses the first architecture's chroot; only the repository metadata
/// inside a chroot is consulted, so the choice is arbitrary. Collaborator
/// failures trigger recovery and a re-check, indefinitely, bounded only by
/// the termination flag.
fn poll_updates(
    logger: &mut Logger,
    project: &Project,
    build_dir: &Path,
    scripts: &dyn BuildScripts,
    shutdown: Shutdown,
) -> PollOutcome {
    let name = project.name.as_str();
    let first_arch = project.architectures[0].clone();
    let chroot_dir = paths::chroot_dir(build_dir, &first_arch);
    let chroot_build_dir = PathBuf::from(format!("/home/{name}"));
    let chroot_log_file = PathBuf::from(format!("/home/{name}/logs/worker.log"));

    let mut need_update = false;

    if project.build_mode.checks_main() {
        let repo_name = match extract_repo_name(&project.repo_url) {
            Ok(repo_name) => repo_name,
            Err(err) => {
                record!(
                    logger,
                    Level::Error,
                    Some(name),
                    None,
                    "Failed to extract repository name from URL {}: {err:#}",
                    project.repo_url
                );
                if sleep_interruptible(project.poll_interval, shutdown, logger, &name) {
                    return PollOutcome::Terminated;
                }
                return PollOutcome::RetryLater;
            }
        };
        match checked_update(
            logger, project, build_dir, scripts, shutdown, &chroot_dir, &chroot_build_dir,
            &chroot_log_file, &repo_name, &first_arch,
        ) {
            Some(update) => need_update = update,
            None => return PollOutcome::Terminated,
        }
    }

    let check_deps = match project.build_mode {
        BuildMode::Main => false,
        BuildMode::Dep => true,
        // In full mode the dependencies only matter while the main
        // repository is current.
        BuildMode::Full => !need_update,
    };
    if check_deps {
        for dep in &project.manual_dependencies {
            let repo_name = match extract_repo_name(&dep.git_url) {
                Ok(repo_name) => repo_name,
                Err(err) => {
                    record!(
                        logger,
                        Level::Error,
                        Some(name),
                        None,
                        "Failed to extract repository name from URL {}: {err:#}",
                        dep.git_url
                    );
                    if sleep_interruptible(project.poll_interval, shutdown, logger, &name) {
                        return PollOutcome::Terminated;
                    }
                    return PollOutcome::RetryLater;
                }
            };
            match checked_update(
                logger, project, build_dir, scripts, shutdown, &chroot_dir, &chroot_build_dir,
                &chroot_log_file, &repo_name, &first_arch,
            ) {
                Some(true) => {
                    record!(
                        logger,
                        Level::Info,
                        Some(name),
                        None,
                        "Update detected in manual dependency {}.",
                        dep.git_url
                    );
                    need_update = true;
                    break;
                }
                Some(false) => {}
                None => return PollOutcome::Terminated,
            }
        }
    }

    PollOutcome::Updates(need_update)
}

/// One repository's update check with the recovery-and-retry loop folded
/// in. `None` means a termination signal ended the attempt.
#[allow(clippy::too_many_arguments)]
fn checked_update(
    logger: &mut Logger,
    project: &Project,
    build_dir: &Path,
    scripts: &dyn BuildScripts,
    shutdown: Shutdown,
    chroot_dir: &Path,
    chroot_build_dir: &Path,
    chroot_log_file: &Path,
    repo_name: &str,
    arch: &str,
) -> Option<bool> {
    let name = project.name.as_str();
    loop {
        match scripts.check_updates(
            chroot_dir,
            chroot_build_dir,
            repo_name,
            chroot_log_file,
            &name,
            arch,
        ) {
            Ok(UpdateCheck::UpdateAvailable) => return Some(true),
            Ok(UpdateCheck::UpToDate) => return Some(false),
            Err(err) => {
                record!(
                    logger,
                    Level::Error,
                    Some(name),
                    None,
                    "Failed to check for updates in {}: {err:#}; attempting recovery...",
                    repo_name
                );
                if !recover_until_done(logger, project, build_dir, scripts, shutdown) {
                    return None;
                }
            }
        }
        if shutdown.is_set() {
            return None;
        }
    }
}

/// Retry recovery until it completes. A failed attempt sleeps one poll
/// interval first. Returns false when a termination signal ended the loop.
fn recover_until_done(
    logger: &mut Logger,
    project: &Project,
    build_dir: &Path,
    scripts: &dyn BuildScripts,
    shutdown: Shutdown,
) -> bool {
    loop {
        match handle_recovery(logger, project, build_dir, scripts, shutdown) {
            RecoveryOutcome::Completed => return true,
            RecoveryOutcome::Interrupted => return false,
            RecoveryOutcome::Failed => {
                record!(
                    logger,
                    Level::Error,
                    Some(project.name.as_str()),
                    None,
                    "Recovery operations failed; will retry after the poll interval."
                );
                if sleep_interruptible(project.poll_interval, shutdown, logger, &project.name) {
                    return false;
                }
            }
        }
    }
}

/// Spawn one build thread per architecture, join them in spawn order and
/// return the number of failed builds.
///
/// Thread-creation failure retries the same architecture after one poll
/// interval; architectures are never skipped. After a termination signal
/// no new threads are spawned, but the launched ones are joined.
fn dispatch_builds(
    logger: &Logger,
    project: &Project,
    build_dir: &Path,
    scripts: &dyn BuildScripts,
    shutdown: Shutdown,
) -> usize {
    let name = project.name.as_str();
    let mut failed = 0;

    thread::scope(|scope| {
        let mut handles = Vec::with_capacity(project.architectures.len());
        let mut next = 0;
        while next < project.architectures.len() {
            if shutdown.is_set() {
                break;
            }
            let arch = project.architectures[next].clone();
            let args = ThreadArgs::new(project, &arch, build_dir, shutdown);
            let spawned = thread::Builder::new()
                .name(format!("build-{arch}"))
                .spawn_scoped(scope, move || run_build(&args, scripts));
            match spawned {
                Ok(handle) => {
                    record!(
                        logger,
                        Level::Info,
                        Some(name),
                        None,
                        "Build thread created for architecture {}.",
                        arch
                    );
                    handles.push((arch, handle));
                    next += 1;
                }
                Err(err) => {
                    record!(
                        logger,
                        Level::Error,
                        Some(name),
                        None,
                        "Failed to create build thread for architecture {}: {}. Retrying after the poll interval.",
                        arch,
                        err
                    );
                    if sleep_interruptible(project.poll_interval, shutdown, logger, &name) {
                        break;
                    }
                }
            }
        }

        if handles.len() < project.architectures.len() {
            record!(
                logger,
                Level::Interrupt,
                Some(name),
                None,
                "Only {} of {} build threads were created; joining the launched ones...",
                handles.len(),
                project.architectures.len()
            );
        }

        for (arch, handle) in handles {
            match handle.join() {
                Ok(result) if result.is_success() => {
                    record!(
                        logger,
                        Level::Info,
                        Some(name),
                        Some(arch.as_str()),
                        "Build thread for architecture {} terminated successfully. Stats: {}",
                        arch,
                        result.stats
                    );
                }
                Ok(result) => {
                    record!(
                        logger,
                        Level::Error,
                        Some(name),
                        Some(arch.as_str()),
                        "Build thread for architecture {} terminated with errors (code {}): {}",
                        arch,
                        result.status,
                        result.error_message.as_deref().unwrap_or("unknown error")
                    );
                    failed += 1;
                }
                Err(_) => {
                    record!(
                        logger,
                        Level::Error,
                        Some(name),
                        Some(arch.as_str()),
                        "Build thread for architecture {} panicked.",
                        arch
                    );
                    failed += 1;
                }
            }
        }
        record!(
            logger,
            Level::Info,
            Some(name),
            None,
            "All launched build threads joined for project {}.",
            name
        );
    });

    failed
}

/// Sleep for `interval`, observing the termination flag about once per
/// second. A wakeup without the flag set resumes sleeping the remainder.
/// Returns true when the sleep was cut short by termination.
pub(crate) fn sleep_interruptible(
    interval: Duration,
    shutdown: Shutdown,
    logger: &Logger,
    project: &str,
) -> bool {
    const SLICE: Duration = Duration::from_secs(1);
    let deadline = Instant::now() + interval;
    loop {
        if shutdown.is_set() {
            record!(
                logger,
                Level::Interrupt,
                Some(project),
                None,
                "Sleep interrupted by termination signal."
            );
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        thread::sleep(SLICE.min(deadline - now));
    }
}
