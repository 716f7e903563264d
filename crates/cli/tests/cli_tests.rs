//! CLI integration tests

use std::process::{Command, Output};

fn ghctl(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_ghctl"))
        .args(args)
        // nothing listens here, so agent-backed commands fail fast
        .env("GHCTL_API_URL", "http://127.0.0.1:9")
        .output()
        .expect("Failed to execute command")
}

/// Test that the CLI shows help
#[test]
fn test_cli_help() {
    let output = ghctl(&["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI help should succeed");
    assert!(
        stdout.contains("game server host agent"),
        "Should show app description"
    );
    for command in ["stats", "history", "health", "cron"] {
        assert!(stdout.contains(command), "Should show {} command", command);
    }
}

/// Test that the CLI shows version
#[test]
fn test_cli_version() {
    let output = ghctl(&["--version"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI version should succeed");
    assert!(stdout.contains("ghctl"), "Should show binary name");
}

#[test]
fn test_history_help_shows_period() {
    let output = ghctl(&["history", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success());
    assert!(stdout.contains("--period"));
}

#[test]
fn test_cron_json_output() {
    let output = ghctl(&["cron", "*/15 * * * *", "--utc", "--count", "2", "--format", "json"]);
    assert!(output.status.success(), "cron should succeed offline");

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["fields"]["minute"], serde_json::json!([0, 15, 30, 45]));
    assert_eq!(report["zone"], "utc");
    assert_eq!(report["next"].as_array().unwrap().len(), 2);
}

#[test]
fn test_cron_rejects_invalid_expression() {
    let output = ghctl(&["cron", "60 * * * *"]);
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(!output.status.success(), "invalid cron should fail");
    assert!(stderr.contains("minute"), "Should name the bad field");
}

#[test]
fn test_stats_requires_server_id() {
    let output = ghctl(&["stats"]);
    assert!(!output.status.success());
}

#[test]
fn test_stats_fails_without_agent() {
    let output = ghctl(&["stats", "mc"]);
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(!output.status.success());
    assert!(stderr.contains("Failed to send request"));
}
