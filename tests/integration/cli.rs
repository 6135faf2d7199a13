//! Integration tests for the forgeline binary.
//!
//! Each test runs in its own temp directory, so the default `forgeline.toml`
//! and `.forgeline` state directory stay isolated.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const WORKER_CONFIG: &str = r#"
tick_interval_secs = 1
default_concurrency_limit = 2

[timeouts]
poll_interval_ms = 20

[workers]
plan = ["sh", "-c", "exit 0"]
implement = ["sh", "-c", "exit 0"]
review = ["sh", "-c", "exit 0"]
verify = ["sh", "-c", "test -n \"$FORGELINE_FEATURE_ID\""]
"#;

/// Get a Command instance for the forgeline binary
#[allow(deprecated)]
fn forgeline_cmd(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("forgeline").expect("Failed to find forgeline binary");
    cmd.current_dir(dir)
        .env_remove("FORGELINE_CONFIG")
        .env("RUST_LOG", "warn")
        .timeout(std::time::Duration::from_secs(30));
    cmd
}

fn setup_project(dir: &Path) {
    fs::write(dir.join("forgeline.toml"), WORKER_CONFIG).expect("Failed to write config");
    forgeline_cmd(dir)
        .args(["tenant", "add", "acme", "--limit", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Tenant acme (limit 1)"));
    forgeline_cmd(dir)
        .args(["feature", "add", "A", "--tenant", "acme", "--title", "Login form"])
        .assert()
        .success();
    forgeline_cmd(dir)
        .args(["feature", "add", "B", "--tenant", "acme", "--depends-on", "A"])
        .assert()
        .success();
}

#[test]
fn test_init_writes_default_config_once() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");

    forgeline_cmd(temp_dir.path())
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote forgeline.toml"));
    let written = fs::read_to_string(temp_dir.path().join("forgeline.toml")).unwrap();
    assert!(written.contains("default_concurrency_limit = 2"));
    assert!(written.contains("changes_requested_exit_code = 2"));

    forgeline_cmd(temp_dir.path())
        .arg("init")
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
    forgeline_cmd(temp_dir.path())
        .args(["init", "--force"])
        .assert()
        .success();
}

#[test]
fn test_config_path_from_environment() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_dir = temp_dir.path().join("conf");
    fs::create_dir_all(&config_dir).unwrap();
    let config_path = config_dir.join("other.toml");
    fs::write(
        &config_path,
        "default_concurrency_limit = 5\nstate_dir = \"custom-state\"\n",
    )
    .unwrap();

    forgeline_cmd(temp_dir.path())
        .env("FORGELINE_CONFIG", &config_path)
        .args(["tenant", "add", "acme"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Tenant acme (limit 5)"));
    assert!(temp_dir.path().join("custom-state").join("state.json").exists());
}

#[test]
fn test_depend_rejects_cycle() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    setup_project(temp_dir.path());

    forgeline_cmd(temp_dir.path())
        .args(["depend", "A", "B"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("would create a cycle"));

    forgeline_cmd(temp_dir.path())
        .args(["undepend", "B", "A"])
        .assert()
        .success();
    forgeline_cmd(temp_dir.path())
        .args(["depend", "A", "B"])
        .assert()
        .success()
        .stdout(predicate::str::contains("A now depends on B"));
}

#[test]
fn test_depend_unknown_feature_fails() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    setup_project(temp_dir.path());

    forgeline_cmd(temp_dir.path())
        .args(["depend", "A", "missing"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown feature: missing"));
}

#[test]
fn test_status_shows_ready_and_blocked() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    setup_project(temp_dir.path());

    forgeline_cmd(temp_dir.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("acme  0/1 in flight, 1 ready, 1 blocked"))
        .stdout(predicate::str::contains("ready: A"));
}

#[test]
fn test_run_once_drives_one_tick_of_pipelines() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    setup_project(temp_dir.path());

    forgeline_cmd(temp_dir.path())
        .args(["run", "--once"])
        .assert()
        .success();

    let output = forgeline_cmd(temp_dir.path())
        .args(["status", "--json"])
        .output()
        .expect("status");
    assert!(output.status.success());
    let status: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    let acme = &status["tenants"][0];
    assert_eq!(acme["passing"], 1);
    assert_eq!(acme["in_flight"], 0);
    assert_eq!(acme["ready"][0], "B");

    forgeline_cmd(temp_dir.path())
        .args(["run", "--once"])
        .assert()
        .success();
    forgeline_cmd(temp_dir.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("0 ready, 0 blocked, 2 passing"));

    assert!(temp_dir
        .path()
        .join(".forgeline/evidence/runs")
        .read_dir()
        .expect("journal dir")
        .next()
        .is_some());
    forgeline_cmd(temp_dir.path())
        .arg("metrics")
        .assert()
        .success()
        .stdout(predicate::str::contains("1 admitted, 1 done, 0 failed"));
}

#[test]
fn test_failed_feature_can_be_reenqueued() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config = WORKER_CONFIG.replace(
        "plan = [\"sh\", \"-c\", \"exit 0\"]",
        "plan = [\"sh\", \"-c\", \"exit 5\"]",
    );
    fs::write(temp_dir.path().join("forgeline.toml"), config).unwrap();
    forgeline_cmd(temp_dir.path())
        .args(["feature", "add", "A", "--tenant", "acme"])
        .assert()
        .success();

    forgeline_cmd(temp_dir.path())
        .args(["run", "--once"])
        .assert()
        .success()
        .stdout(predicate::str::contains("failing: A (worker_error: plan exited with code 5)"));

    forgeline_cmd(temp_dir.path())
        .args(["enqueue", "A"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Enqueued A"));
    forgeline_cmd(temp_dir.path())
        .args(["confirm-merge", "A"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot move from pending to passing"));
}
