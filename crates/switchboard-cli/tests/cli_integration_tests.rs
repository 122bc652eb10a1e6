//! CLI integration tests for switchboard
//!
//! Tests the switchboard CLI commands end-to-end using assert_cmd.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Helper to create a command with an isolated config directory
#[allow(deprecated)]
fn switchboard_cmd(config_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("switchboard").unwrap();
    cmd.env("SWITCHBOARD_CONFIG_DIR", config_dir.path());
    cmd.env_remove("RUST_LOG");
    cmd
}

fn json_stdout(cmd: &mut Command) -> serde_json::Value {
    let output = cmd.output().unwrap();
    assert!(output.status.success(), "command failed: {:?}", output);
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn test_help_command() {
    let config_dir = TempDir::new().unwrap();
    switchboard_cmd(&config_dir)
        .args(["--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Adaptive multi-backend request routing"));
}

#[test]
fn test_version_output() {
    let config_dir = TempDir::new().unwrap();
    switchboard_cmd(&config_dir)
        .args(["--version"])
        .assert()
        .success()
        .stdout(predicate::str::contains("switchboard"));
}

#[test]
fn test_simulate_text_output() {
    let config_dir = TempDir::new().unwrap();
    switchboard_cmd(&config_dir)
        .args(["simulate", "--requests", "30", "--seed", "7"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Simulated 30 requests"))
        .stdout(predicate::str::contains("Bandit arms:"))
        .stdout(predicate::str::contains("default:openai"));
}

#[test]
fn test_simulate_json_serves_every_request() {
    let config_dir = TempDir::new().unwrap();
    let report = json_stdout(switchboard_cmd(&config_dir).args([
        "simulate",
        "--requests",
        "40",
        "--format",
        "json",
    ]));

    let served: u64 = report["served"]
        .as_object()
        .unwrap()
        .values()
        .map(|v| v.as_u64().unwrap())
        .sum();
    assert_eq!(served, 40);
    assert_eq!(report["requests"], 40);
    assert_eq!(report["arms"].as_object().unwrap().len(), 3);
}

#[test]
fn test_simulate_failing_backend_is_disabled() {
    let config_dir = TempDir::new().unwrap();
    let report = json_stdout(switchboard_cmd(&config_dir).args([
        "simulate",
        "--requests",
        "50",
        "--fail-rate",
        "openai=1.0",
        "--format",
        "json",
    ]));

    assert!(report["served"].get("openai").is_none());
    assert_eq!(report["health"]["openai"]["enabled"], false);
    assert_eq!(report["health"]["openai"]["reason"], "PROVIDER_UNAVAILABLE");
}

#[test]
fn test_simulate_reports_event_counts() {
    let config_dir = TempDir::new().unwrap();
    let report = json_stdout(switchboard_cmd(&config_dir).args([
        "simulate",
        "--requests",
        "10",
        "--events",
        "--format",
        "json",
    ]));

    assert_eq!(report["events"]["routing.bandit.reward"], 10);
    assert_eq!(report["events"]["fallback.succeeded"], 10);
}

#[test]
fn test_simulate_rejects_unknown_backend() {
    let config_dir = TempDir::new().unwrap();
    switchboard_cmd(&config_dir)
        .args(["simulate", "--fail-rate", "mystery=0.5"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown backend 'mystery'"));
}

#[test]
fn test_simulate_rejects_bad_fail_rate() {
    let config_dir = TempDir::new().unwrap();
    switchboard_cmd(&config_dir)
        .args(["simulate", "--fail-rate", "openai=2"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("probability must be between 0 and 1"));
}

#[test]
fn test_sqlite_store_persists_between_runs() {
    let config_dir = TempDir::new().unwrap();
    let data_dir = TempDir::new().unwrap();
    let db = data_dir.path().join("bandit.db");
    let db_arg = db.to_str().unwrap();

    switchboard_cmd(&config_dir)
        .args(["simulate", "--requests", "20", "--store", "sqlite", "--db", db_arg, "-q"])
        .assert()
        .success();
    assert!(db.exists());

    let first = json_stdout(switchboard_cmd(&config_dir).args(["stats", "--db", db_arg, "--format", "json"]));
    assert_eq!(first["summary"]["total_trials"], 20);
    assert_eq!(first["summary"]["backends"], 3);

    switchboard_cmd(&config_dir)
        .args(["simulate", "--requests", "10", "--store", "sqlite", "--db", db_arg, "-q"])
        .assert()
        .success();

    let second = json_stdout(switchboard_cmd(&config_dir).args(["stats", "--db", db_arg, "--format", "json"]));
    assert_eq!(second["summary"]["total_trials"], 30);
}

#[test]
fn test_stats_text_output() {
    let config_dir = TempDir::new().unwrap();
    let data_dir = TempDir::new().unwrap();
    let db = data_dir.path().join("bandit.db");
    let db_arg = db.to_str().unwrap();

    switchboard_cmd(&config_dir)
        .args(["simulate", "--requests", "5", "--store", "sqlite", "--db", db_arg, "-q"])
        .assert()
        .success();

    switchboard_cmd(&config_dir)
        .args(["stats", "--db", db_arg])
        .assert()
        .success()
        .stdout(predicate::str::contains("3 arms"))
        .stdout(predicate::str::contains("TRIALS"));
}

#[test]
fn test_stats_missing_database_fails() {
    let config_dir = TempDir::new().unwrap();
    switchboard_cmd(&config_dir)
        .args(["stats", "--db", "/nonexistent/switchboard/bandit.db"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Database not found"));
}

#[test]
fn test_config_set_get_reset() {
    let config_dir = TempDir::new().unwrap();

    switchboard_cmd(&config_dir)
        .args(["config", "set", "routing.preference", "cost"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Set routing.preference = cost"));

    switchboard_cmd(&config_dir)
        .args(["config", "get", "routing.preference"])
        .assert()
        .success()
        .stdout("cost\n");

    switchboard_cmd(&config_dir)
        .args(["config", "reset", "-q"])
        .assert()
        .success();

    switchboard_cmd(&config_dir)
        .args(["config", "get", "routing.preference"])
        .assert()
        .success()
        .stdout("balanced\n");
}

#[test]
fn test_config_list_and_path() {
    let config_dir = TempDir::new().unwrap();

    switchboard_cmd(&config_dir)
        .args(["config", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("sticky.ttl_secs = 600"))
        .stdout(predicate::str::contains("store.backend = memory"));

    switchboard_cmd(&config_dir)
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains("config.toml"));
}

#[test]
fn test_config_unknown_key_fails() {
    let config_dir = TempDir::new().unwrap();
    switchboard_cmd(&config_dir)
        .args(["config", "get", "nope.key"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown configuration key"));
}
