//! Integration tests for the prefork CLI.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;
use tempfile::tempdir;

/// Get a command for the prefork binary.
fn prefork() -> Command {
    #[allow(deprecated)]
    Command::cargo_bin("prefork").unwrap()
}

#[test]
fn help_describes_subcommands() {
    prefork()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("worker pool supervisor"))
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("worker"));
}

#[test]
fn serve_requires_config() {
    prefork().arg("serve").assert().failure();
}

#[test]
fn serve_rejects_missing_config_file() {
    prefork()
        .args(["serve", "--config", "/nonexistent/prefork.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load"));
}

#[test]
fn serve_rejects_invalid_config() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bad.json");
    std::fs::File::create(&path)
        .unwrap()
        .write_all(b"{ not json }")
        .unwrap();

    prefork()
        .args(["serve", "--config"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load"));
}

#[test]
fn serve_validates_pool_configs() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("zero.json");
    std::fs::write(
        &path,
        r#"{"pools": {"bad": {"min_children": 0}}}"#,
    )
    .unwrap();

    prefork()
        .args(["serve", "--config"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("min_children"));
}

#[test]
fn worker_exits_cleanly_on_eof() {
    // With no parent frames, stdin EOF means the supervisor went away:
    // the worker drains (nothing in flight) and exits 0.
    prefork().arg("worker").assert().success();
}
