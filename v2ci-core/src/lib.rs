//! Core library for v2ci, a rootless multi-architecture CI daemon.
//!
//! For each configured project the daemon polls a set of git repositories
//! and, when changes are detected, cross-compiles the project and its
//! declared dependencies inside per-architecture chroots, depositing the
//! resulting binaries in the project's target directory.
//!
//! Process model:
//!   - `supervisor`   — detaches from the terminal, bootstraps one chroot
//!                      per architecture, forks one worker per project
//!   - `worker`       — polling loop for a single project: update check,
//!                      build dispatch, recovery, rotation-cron setup
//!   - `build_thread` — one thread per architecture inside a worker,
//!                      driving install → clone/pull → build
//!
//! Shared plumbing:
//!   - `config`   — YAML configuration with derived paths
//!   - `scripts`  — trait boundary over the collaborator shell scripts
//!   - `logger`   — line-buffered structured log records
//!   - `lockfile` — cross-process advisory file locks
//!   - `pidfile`  — singleton pidfiles with liveness probing
//!   - `signals`  — SIGTERM flag, liveness probes, termination signals
//!   - `fsutil`   — recursive directory/file creation, chroot path grafting
//!   - `repo`     — repository-name derivation from git URLs
//!   - `stop`     — shutdown routine used by `v2ci-stop`

pub mod build_thread;
pub mod config;
pub mod fsutil;
pub mod lockfile;
pub mod logger;
pub mod paths;
pub mod pidfile;
pub mod repo;
pub mod scripts;
pub mod signals;
pub mod stop;
pub mod supervisor;
pub mod worker;
