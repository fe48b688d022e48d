//! Shutdown routine for `v2ci-stop`.
//!
//! Signals the supervisor first (interrupting in-flight chroot setups at
//! the next checkpoint), then every project worker found through the
//! configuration. Workers drain their running build threads before
//! exiting; nothing is killed forcefully.

use anyhow::{Context, Result};
use std::path::Path;

use crate::config::Config;
use crate::paths;
use crate::pidfile::read_pid;
use crate::signals::send_sigterm;

pub fn stop() -> Result<()> {
    if let Some(pid) = read_pid(Path::new(paths::SUPERVISOR_PID_FILE)) {
        if send_sigterm(pid) {
            println!("Sent termination signal to the main v2ci process (PID: {pid}).");
        } else {
            eprintln!("Failed to stop the main v2ci process (PID: {pid}).");
        }
    }

    let cfg = Config::load().context("failed to load configuration during stop")?;

    let mut stopped = 0;
    for project in &cfg.projects {
        let pid_file = paths::worker_pid_file(&project.name);
        let Some(pid) = read_pid(&pid_file) else {
            continue;
        };
        if send_sigterm(pid) {
            stopped += 1;
            println!(
                "Sent termination signal to project {} (PID: {pid}).",
                project.name
            );
        } else {
            eprintln!("Failed to stop project {} (PID: {pid}).", project.name);
        }
    }

    if stopped > 0 {
        println!("Successfully stopped {stopped} project(s).");
    } else {
        println!("No projects were stopped.");
    }
    Ok(())
}
