use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;

fn write_config(dir: &std::path::Path, content: &str) -> std::path::PathBuf {
    let path = dir.join("tandemd.yaml");
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn check_accepts_a_valid_config_and_prints_the_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        dir.path(),
        r#"
version: "1"
services:
  api:
    command: "sleep 5"
    depends_on: [agent]
  agent:
    command: "sleep 5"
"#,
    );

    Command::cargo_bin("tandemd")
        .unwrap()
        .args(["check", "--config", path.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("agent -> api"));
}

#[test]
fn check_rejects_a_cyclic_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        dir.path(),
        r#"
version: "1"
services:
  api:
    command: "sleep 5"
    depends_on: [agent]
  agent:
    command: "sleep 5"
    depends_on: [api]
"#,
    );

    Command::cargo_bin("tandemd")
        .unwrap()
        .args(["check", "--config", path.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("dependency cycle"));
}

#[test]
fn check_rejects_an_unknown_dependency() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        dir.path(),
        r#"
version: "1"
services:
  api:
    command: "sleep 5"
    depends_on: [ghost]
"#,
    );

    Command::cargo_bin("tandemd")
        .unwrap()
        .args(["check", "--config", path.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown dependency 'ghost'"));
}

#[test]
fn run_fails_fast_on_a_missing_config_file() {
    Command::cargo_bin("tandemd")
        .unwrap()
        .args(["run", "--config", "/nonexistent/tandemd.yaml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read config"));
}

#[test]
fn health_exits_nonzero_when_the_endpoint_is_unreachable() {
    Command::cargo_bin("tandemd")
        .unwrap()
        .args([
            "health",
            "--url",
            "http://127.0.0.1:9/health",
            "--timeout",
            "2s",
        ])
        .assert()
        .failure();
}
