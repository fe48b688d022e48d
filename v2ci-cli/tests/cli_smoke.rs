//! Binary smoke tests for the v2ci command-line entry points.
//!
//! These run the compiled binaries with `assert_cmd`. `HOME` is pointed at
//! a temporary directory so the configuration lookup never touches the
//! invoking user's files, and startup is exercised only up to the
//! config-loading error paths (a valid config would daemonize).

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

#[allow(deprecated)] // cargo_bin works fine for our use case
fn start_cmd(home: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("v2ci-start").unwrap();
    cmd.env("HOME", home.path());
    cmd
}

#[allow(deprecated)]
fn stop_cmd(home: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("v2ci-stop").unwrap();
    cmd.env("HOME", home.path());
    cmd
}

fn write_config(home: &TempDir, contents: &str) {
    let config_dir = home.path().join(".config/v2ci");
    fs::create_dir_all(&config_dir).unwrap();
    fs::write(config_dir.join("config.yml"), contents).unwrap();
}

#[test]
fn start_help_mentions_the_daemon() {
    let home = TempDir::new().unwrap();
    start_cmd(&home)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("start the rootless v2ci daemon"));
}

#[test]
fn start_version_flag() {
    let home = TempDir::new().unwrap();
    start_cmd(&home)
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::starts_with("v2ci-start "));
}

#[test]
fn start_rejects_positional_arguments() {
    let home = TempDir::new().unwrap();
    start_cmd(&home).arg("spurious").assert().failure();
}

#[test]
fn start_without_config_exits_one() {
    let home = TempDir::new().unwrap();
    start_cmd(&home)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("failed to load configuration"));
}

#[test]
fn start_with_malformed_config_exits_one() {
    let home = TempDir::new().unwrap();
    write_config(&home, "projects: [not: [valid\n");
    start_cmd(&home)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("failed to load configuration"));
}

#[test]
fn start_with_zero_projects_exits_one() {
    let home = TempDir::new().unwrap();
    write_config(&home, "build_dir: /tmp/bd\nprojects: []\n");
    start_cmd(&home)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("no projects"));
}

#[test]
fn stop_help_mentions_the_daemon() {
    let home = TempDir::new().unwrap();
    stop_cmd(&home)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("stop the rootless v2ci daemon"));
}
