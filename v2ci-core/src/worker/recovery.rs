//! Recovery: restore the build root, log files and chroots.
//!
//! Entered after a failed update check or failed builds. Runs under the
//! global [`paths::RECOVERY_LOCK_FILE`] lock because several workers could
//! otherwise re-bootstrap the same shared chroot at once.

use std::path::Path;

use crate::config::Project;
use crate::fsutil;
use crate::lockfile::FileLock;
use crate::logger::{record, Level, Logger};
use crate::paths;
use crate::scripts::BuildScripts;
use crate::signals::Shutdown;

/// Result of one recovery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Completed,
    Failed,
    /// A termination signal arrived between chroot setups.
    Interrupted,
}

/// Run recovery under the global recovery lock.
pub fn handle_recovery(
    logger: &mut Logger,
    project: &Project,
    build_dir: &Path,
    scripts: &dyn BuildScripts,
    shutdown: Shutdown,
) -> RecoveryOutcome {
    let name = project.name.as_str();
    let lock = match FileLock::acquire(Path::new(paths::RECOVERY_LOCK_FILE)) {
        Ok(lock) => lock,
        Err(err) => {
            record!(
                logger,
                Level::Error,
                Some(name),
                None,
                "[Recovery] Unable to acquire the recovery lock: {err:#}"
            );
            return RecoveryOutcome::Failed;
        }
    };

    record!(
        logger,
        Level::Info,
        Some(name),
        None,
        "[Recovery] Starting recovery operations..."
    );
    let outcome = recover(logger, project, build_dir, scripts, shutdown);
    match outcome {
        RecoveryOutcome::Completed => record!(
            logger,
            Level::Info,
            Some(name),
            None,
            "[Recovery] Recovery operations completed successfully."
        ),
        RecoveryOutcome::Failed => record!(
            logger,
            Level::Error,
            Some(name),
            None,
            "[Recovery] Recovery operations failed."
        ),
        RecoveryOutcome::Interrupted => record!(
            logger,
            Level::Interrupt,
            Some(name),
            None,
            "[Recovery] Termination signal received during recovery, exiting..."
        ),
    }

    if let Err(err) = lock.release() {
        record!(
            logger,
            Level::Error,
            Some(name),
            None,
            "[Recovery] Unable to release the recovery lock: {err:#}"
        );
    }
    outcome
}

fn recover(
    logger: &mut Logger,
    project: &Project,
    build_dir: &Path,
    scripts: &dyn BuildScripts,
    shutdown: Shutdown,
) -> RecoveryOutcome {
    let name = project.name.as_str();

    // Recreate the fundamental directories and the worker log. The old log
    // handle may point at a deleted file, so the logger moves onto the
    // fresh one.
    for dir in [build_dir, project.main_project_build_dir.as_path()] {
        if let Err(err) = fsutil::ensure_dir(dir) {
            record!(
                logger,
                Level::Error,
                Some(name),
                None,
                "[Recovery] Unable to recreate directory {}: {err:#}",
                dir.display()
            );
            return RecoveryOutcome::Failed;
        }
    }
    if let Err(err) = fsutil::ensure_file(&project.worker_log_file) {
        record!(
            logger,
            Level::Error,
            Some(name),
            None,
            "[Recovery] Unable to recreate worker log file {}: {err:#}",
            project.worker_log_file.display()
        );
        return RecoveryOutcome::Failed;
    }
    if let Err(err) = logger.reopen(&project.worker_log_file) {
        eprintln!(
            "Unable to reopen log file at {}: {err:#}",
            project.worker_log_file.display()
        );
        return RecoveryOutcome::Failed;
    }
    record!(
        logger,
        Level::Info,
        Some(name),
        None,
        "[Recovery] Recreated fundamental directories and files."
    );

    // Re-bootstrap each chroot; the collaborator returns success when the
    // chroot is already valid.
    for arch in &project.architectures {
        if shutdown.is_set() {
            record!(
                logger,
                Level::Interrupt,
                Some(name),
                None,
                "[Recovery] Termination signal received before the chroot setup for {}, exiting...",
                arch
            );
            break;
        }
        let chroot = paths::chroot_dir(build_dir, arch);
        record!(
            logger,
            Level::Info,
            Some(name),
            None,
            "[Recovery] Setting up chroot at {} for architecture {} if missing...",
            chroot.display(),
            arch
        );
        if let Err(err) = scripts.chroot_setup(arch, &chroot, &project.worker_log_file) {
            record!(
                logger,
                Level::Error,
                Some(name),
                Some(arch.as_str()),
                "[Recovery] Failed to set up chroot for architecture {}: {err:#}",
                arch
            );
            return RecoveryOutcome::Failed;
        }
    }

    if shutdown.is_set() {
        RecoveryOutcome::Interrupted
    } else {
        RecoveryOutcome::Completed
    }
}
