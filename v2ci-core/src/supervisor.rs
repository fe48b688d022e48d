//! Supervisor: daemonize, bootstrap chroots, fork one worker per project.
//!
//! The supervisor is the root of the process tree. It computes the union
//! of architectures across all projects, bootstraps one chroot per
//! architecture sequentially, then forks a worker process per project and
//! exits without waiting for them. Architectures whose bootstrap failed
//! are removed from each project before the worker runs.
//!
//! SIGTERM is observed between chroot setups and between project forks;
//! an in-flight chroot setup always runs to completion first.

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::process;

use crate::config::{Config, Project};
use crate::fsutil;
use crate::logger::{record, Level, Logger};
use crate::paths;
use crate::pidfile::PidFile;
use crate::scripts::{BuildScripts, ScriptRunner};
use crate::signals::Shutdown;
use crate::worker;
use crate::worker::cron::SystemCrontab;

/// Entry point for `v2ci-start`: load the configuration, prepare the build
/// root, detach, then run the supervisor loop.
///
/// Successful daemonization makes the invoking process exit 0; everything
/// after that reports through the main log file.
pub fn start() -> Result<()> {
    println!("Starting rootless v2ci...");
    println!("Loading configuration...");
    let cfg = Config::load().context("failed to load configuration")?;
    println!("Configuration loaded successfully ({} project(s)).", cfg.projects.len());

    fsutil::ensure_dir(&cfg.build_dir).context("unable to create the build directory")?;
    fsutil::ensure_file(&cfg.main_log_file).context("unable to create the main log file")?;
    println!("Main directories and files are set up.");

    println!("Daemonizing the process...");
    println!("The main log file is located at: {}", cfg.main_log_file.display());
    daemonize()?;

    let scripts = ScriptRunner::system()?;
    run(cfg, &scripts)
}

/// Detach from the controlling terminal: fork, new session, fork again,
/// change the working directory to `/`.
fn daemonize() -> Result<()> {
    // SAFETY: no threads exist yet; both parents exit immediately without
    // touching shared state.
    unsafe {
        match libc::fork() {
            -1 => bail!("daemonize: first fork failed"),
            0 => {}
            _ => process::exit(0),
        }
        if libc::setsid() < 0 {
            bail!("daemonize: setsid failed");
        }
        match libc::fork() {
            -1 => bail!("daemonize: second fork failed"),
            0 => {}
            _ => process::exit(0),
        }
    }
    let _ = std::env::set_current_dir("/");
    Ok(())
}

/// The daemonized supervisor body.
fn run(cfg: Config, scripts: &dyn BuildScripts) -> Result<()> {
    let logger = Logger::open(&cfg.main_log_file)?;

    let pidfile = match PidFile::acquire(Path::new(paths::SUPERVISOR_PID_FILE)) {
        Ok(pidfile) => pidfile,
        Err(err) => {
            record!(logger, Level::Error, None, None, "{err:#}");
            return Err(err);
        }
    };
    let shutdown = Shutdown::install();

    let archs = unique_architectures(&cfg.projects);
    record!(
        logger,
        Level::Info,
        None,
        None,
        "Unique architectures to be built across all projects: {}",
        archs.join(" ")
    );

    let mut failed_archs: Vec<String> = Vec::new();
    for arch in &archs {
        // Chroot setups are the longest operations; the flag is only
        // observed between them, never mid-setup.
        if shutdown.is_set() {
            record!(
                logger,
                Level::Interrupt,
                None,
                None,
                "Termination signal received during chroot setups, exiting..."
            );
            bail!("terminated during chroot setups");
        }
        let chroot = paths::chroot_dir(&cfg.build_dir, arch);
        record!(
            logger,
            Level::Info,
            None,
            Some(arch.as_str()),
            "Setting up chroot at {} for architecture {}...",
            chroot.display(),
            arch
        );
        if let Err(err) = scripts.chroot_setup(arch, &chroot, &cfg.main_log_file) {
            record!(
                logger,
                Level::Error,
                None,
                Some(arch.as_str()),
                "Failed to set up chroot for architecture {}: {err:#}",
                arch
            );
            failed_archs.push(arch.clone());
        }
    }
    if failed_archs.len() == archs.len() {
        record!(logger, Level::Error, None, None, "All chroot setups failed. Exiting...");
        bail!("all chroot setups failed");
    }

    record!(logger, Level::Info, None, None, "Launching project build processes...");
    let mut launched: Vec<&Project> = Vec::new();
    for project in &cfg.projects {
        if shutdown.is_set() {
            record!(
                logger,
                Level::Interrupt,
                None,
                None,
                "Termination signal received before launching project {}, exiting...",
                project.name
            );
            break;
        }
        // SAFETY: the child takes its own copy of the project, runs the
        // worker and leaves through process::exit without unwinding.
        match unsafe { libc::fork() } {
            -1 => {
                record!(
                    logger,
                    Level::Error,
                    None,
                    None,
                    "Failed to fork for project {}.",
                    project.name
                );
                if launched.is_empty() {
                    bail!("failed to fork the first project worker");
                }
                break;
            }
            0 => {
                let mut owned = project.clone();
                remove_failed_architectures(&mut owned, &failed_archs);
                let code = run_worker_process(&owned, &cfg.build_dir, scripts, &logger);
                // process::exit skips destructors on purpose: the
                // supervisor pidfile belongs to the parent.
                process::exit(code);
            }
            pid => {
                record!(
                    logger,
                    Level::Info,
                    Some(project.name.as_str()),
                    None,
                    "Launched project {} with PID {}.",
                    project.name,
                    pid
                );
                launched.push(project);
            }
        }
    }

    record!(
        logger,
        Level::Info,
        None,
        None,
        "Logs will be available in the project log files:"
    );
    for project in &launched {
        record!(
            logger,
            Level::Info,
            Some(project.name.as_str()),
            None,
            "Project '{}' log file: {}",
            project.name,
            project.worker_log_file.display()
        );
    }
    record!(
        logger,
        Level::Info,
        None,
        None,
        "To terminate the entire daemon, run: v2ci-stop"
    );

    drop(pidfile);
    Ok(())
}

/// Worker body of a freshly forked child; maps the result to an exit code.
fn run_worker_process(
    project: &Project,
    build_dir: &Path,
    scripts: &dyn BuildScripts,
    logger: &Logger,
) -> i32 {
    let crontab = match SystemCrontab::for_project(project) {
        Ok(crontab) => crontab,
        Err(err) => {
            record!(logger, Level::Error, Some(project.name.as_str()), None, "{err:#}");
            return 1;
        }
    };
    match worker::run_worker(project, build_dir, scripts, &crontab) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

/// First-seen-order union of the architectures of all projects.
fn unique_architectures(projects: &[Project]) -> Vec<String> {
    let mut archs: Vec<String> = Vec::new();
    for project in projects {
        for arch in &project.architectures {
            if !archs.contains(arch) {
                archs.push(arch.clone());
            }
        }
    }
    archs
}

/// Drop architectures whose chroot bootstrap failed, keeping declared
/// order. They must never reach a build thread.
fn remove_failed_architectures(project: &mut Project, failed: &[String]) {
    project.architectures.retain(|arch| !failed.contains(arch));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn projects_from(yaml: &str) -> Vec<Project> {
        Config::from_yaml(yaml).unwrap().projects
    }

    #[test]
    fn union_preserves_first_seen_order() {
        let projects = projects_from(
            r#"
build_dir: /tmp/bd
projects:
  - name: p1
    target_dir: /tmp/out1
    architectures: [arm64, amd64]
    source:
      main_repo:
        git_url: https://x/y/a.git
        build_system: make
  - name: p2
    target_dir: /tmp/out2
    architectures: [amd64, riscv64]
    source:
      main_repo:
        git_url: https://x/y/b.git
        build_system: make
"#,
        );
        assert_eq!(
            unique_architectures(&projects),
            vec!["arm64", "amd64", "riscv64"]
        );
    }

    #[test]
    fn union_of_identical_projects_has_no_duplicates() {
        let projects = projects_from(
            r#"
build_dir: /tmp/bd
projects:
  - name: p1
    target_dir: /tmp/out1
    architectures: [amd64]
    source:
      main_repo:
        git_url: https://x/y/a.git
        build_system: make
  - name: p2
    target_dir: /tmp/out2
    architectures: [amd64]
    source:
      main_repo:
        git_url: https://x/y/b.git
        build_system: make
"#,
        );
        assert_eq!(unique_architectures(&projects), vec!["amd64"]);
    }

    #[test]
    fn failed_architectures_are_removed_in_place() {
        let mut project = projects_from(
            r#"
build_dir: /tmp/bd
projects:
  - name: p1
    target_dir: /tmp/out
    architectures: [amd64, arm64, riscv64]
    source:
      main_repo:
        git_url: https://x/y/a.git
        build_system: make
"#,
        )
        .remove(0);

        remove_failed_architectures(&mut project, &["arm64".to_string()]);
        assert_eq!(project.architectures, vec!["amd64", "riscv64"]);

        // Removing everything leaves the project without architectures;
        // the worker treats that as a fatal bootstrap failure.
        remove_failed_architectures(
            &mut project,
            &["amd64".to_string(), "riscv64".to_string()],
        );
        assert!(project.architectures.is_empty());
    }
}
