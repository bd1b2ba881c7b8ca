//! Integration tests for the `thingbridge` CLI binary.
//!
//! Argument parsing, help output, completions, config inspection, and
//! configuration error exit codes. Nothing here needs a hub or gateway.
#![allow(clippy::unwrap_used)]

use std::path::Path;

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

// ── Helpers ─────────────────────────────────────────────────────────

/// The `thingbridge` binary with env isolation.
fn thingbridge_cmd() -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("thingbridge");
    cmd.env("HOME", "/tmp/thingbridge-cli-test-nonexistent")
        .env("XDG_CONFIG_HOME", "/tmp/thingbridge-cli-test-nonexistent")
        .env_remove("THINGBRIDGE_CONFIG")
        .env_remove("THINGBRIDGE_OUTPUT")
        .env_remove("THINGBRIDGE_LOG_FILE")
        .env_remove("THINGBRIDGE_HUB_CONNECTION_STRING")
        .env_remove("THINGBRIDGE_ACCESS_TOKEN")
        .env_remove("RUST_LOG");
    cmd
}

fn write_config(dir: &Path, contents: &str) -> std::path::PathBuf {
    let path = dir.join("config.toml");
    std::fs::write(&path, contents).unwrap();
    path
}

fn combined_output(output: &std::process::Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    format!("{stdout}{stderr}")
}

// ── Basic invocation ────────────────────────────────────────────────

#[test]
fn test_no_args_shows_help() {
    let output = thingbridge_cmd().output().unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(combined_output(&output).contains("Usage"));
}

#[test]
fn test_help_flag() {
    thingbridge_cmd().arg("--help").assert().success().stdout(
        predicate::str::contains("IoT hub")
            .and(predicate::str::contains("run"))
            .and(predicate::str::contains("identities"))
            .and(predicate::str::contains("config")),
    );
}

#[test]
fn test_version_flag() {
    thingbridge_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("thingbridge"));
}

#[test]
fn test_run_help_lists_flags() {
    thingbridge_cmd()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("--update-twin")
                .and(predicate::str::contains("--ephemeral-keys")),
        );
}

// ── Shell completions ───────────────────────────────────────────────

#[test]
fn test_completions_bash() {
    thingbridge_cmd()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty().not());
}

#[test]
fn test_completions_zsh() {
    thingbridge_cmd()
        .args(["completions", "zsh"])
        .assert()
        .success()
        .stdout(predicate::str::contains("#compdef"));
}

// ── Config ──────────────────────────────────────────────────────────

#[test]
fn test_config_path_honours_flag() {
    thingbridge_cmd()
        .args(["config", "path", "--config", "/srv/bridge/config.toml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("/srv/bridge/config.toml"));
}

#[test]
fn test_config_path_default_mentions_app() {
    thingbridge_cmd()
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains("thingbridge"));
}

#[test]
fn test_config_show_without_file_prints_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing.toml");
    thingbridge_cmd()
        .args(["config", "show", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("http://localhost:8080"));
}

#[test]
fn test_config_show_redacts_secrets() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        dir.path(),
        r#"
hub_connection_string = "HostName=myhub.example.net;SharedAccessKeyName=owner;SharedAccessKey=c2VjcmV0"
access_token = "gateway-jwt-value"

[[devices]]
id = "living-room-lamp"
primary_key = "ZGV2aWNla2V5"
"#,
    );

    let output = thingbridge_cmd()
        .args(["config", "show", "--config"])
        .arg(&path)
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("living-room-lamp"));
    assert!(!stdout.contains("c2VjcmV0"));
    assert!(!stdout.contains("gateway-jwt-value"));
    assert!(!stdout.contains("ZGV2aWNla2V5"));
}

#[test]
fn test_config_show_json() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path(), "gateway_url = \"http://gateway.local:8080\"\ntimeout = 5\n");

    let output = thingbridge_cmd()
        .args(["--output", "json", "config", "show", "--config"])
        .arg(&path)
        .output()
        .unwrap();
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["gateway_url"], "http://gateway.local:8080");
    assert_eq!(value["timeout"], 5);
}

#[test]
fn test_config_show_applies_timeout_flag() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path(), "timeout = 5\n");

    let output = thingbridge_cmd()
        .args(["--output", "json-compact", "--timeout", "90", "config", "show", "--config"])
        .arg(&path)
        .output()
        .unwrap();
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["timeout"], 90);
}

#[test]
fn test_config_show_migrates_legacy_devices() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path(), "[devices.lamp]\nprimaryKey = \"a2V5\"\n");

    thingbridge_cmd()
        .args(["config", "show", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("lamp"));

    let rewritten = std::fs::read_to_string(&path).unwrap();
    assert!(rewritten.contains("[[devices]]"), "file not migrated:\n{rewritten}");
}

// ── Error cases ─────────────────────────────────────────────────────

#[test]
fn test_invalid_output_format() {
    let output = thingbridge_cmd()
        .args(["--output", "invalid", "config", "path"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(combined_output(&output).contains("possible values"));
}

#[test]
fn test_malformed_config_is_usage_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path(), "timeout = [not toml");

    let output = thingbridge_cmd()
        .args(["config", "show", "--config"])
        .arg(&path)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(combined_output(&output).contains("Could not load configuration"));
}

#[test]
fn test_run_without_hub_connection_string() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path(), "access_token = \"t\"\n");

    let output = thingbridge_cmd()
        .args(["run", "--config"])
        .arg(&path)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(3));
    assert!(combined_output(&output).contains("hub connection string"));
}

#[test]
fn test_run_with_malformed_hub_connection_string() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        dir.path(),
        "hub_connection_string = \"SharedAccessKeyName=a;SharedAccessKey=b\"\naccess_token = \"t\"\n",
    );

    let output = thingbridge_cmd()
        .args(["run", "--config"])
        .arg(&path)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(combined_output(&output).contains("HostName"));
}

#[test]
fn test_identities_without_hub_connection_string() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");

    thingbridge_cmd()
        .args(["identities", "--config"])
        .arg(&path)
        .assert()
        .code(3)
        .stderr(predicate::str::contains("hub connection string"));
}

#[test]
fn test_set_secret_rejects_empty_stdin() {
    thingbridge_cmd()
        .args(["config", "set-secret", "access-token"])
        .write_stdin("\n")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("no value on stdin"));
}

#[test]
fn test_run_rejects_zero_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");

    thingbridge_cmd()
        .args(["--timeout", "0", "run", "--config"])
        .arg(&path)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("timeout"));
}
