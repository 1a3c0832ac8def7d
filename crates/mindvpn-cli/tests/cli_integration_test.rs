//! CLI Integration Tests
//!
//! Runs the built `mindvpn` binary for the one-shot subcommands:
//! rendering presets to stdout and to disk, and validating config files.

use std::process::{Command, Output};

// ============================================================================
// Test Helpers
// ============================================================================

fn mindvpn(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_mindvpn"))
        .args(args)
        .env_remove("MINDVPN_XRAY_BIN")
        .env_remove("MINDVPN_SINGBOX_BIN")
        .output()
        .expect("Failed to run mindvpn binary")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

const USER_OVERRIDES: &str = r#"{"users": [{"uuid": "3c9e1f2a-5b7d-4e8f-9a0b-1c2d3e4f5a6b"}]}"#;

// ============================================================================
// Render
// ============================================================================

#[test]
fn test_render_prints_file_map() {
    let output = mindvpn(&["render", "xray", "reality_tcp", "-p", "8443", "-o", USER_OVERRIDES]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));

    let files: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    let inbound = files["inbound.json"].as_str().unwrap();
    assert!(inbound.contains("3c9e1f2a-5b7d-4e8f-9a0b-1c2d3e4f5a6b"));
    assert!(inbound.contains("8443"));
    assert!(files["config.json"].is_string());
}

#[test]
fn test_render_digest_is_stable() {
    let first = mindvpn(&["render", "xray", "vmess", "--digest", "-o", USER_OVERRIDES]);
    let second = mindvpn(&["render", "xray", "vmess", "--digest", "-o", USER_OVERRIDES]);
    assert!(first.status.success(), "stderr: {}", stderr(&first));

    let digest = stdout(&first).trim().to_string();
    assert_eq!(digest.len(), 64);
    assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(digest, stdout(&second).trim());
}

#[test]
fn test_render_unknown_preset_lists_available() {
    let output = mindvpn(&["render", "singbox", "vmess"]);
    assert!(!output.status.success());
    let err = stderr(&output);
    assert!(err.contains("hysteria2"), "stderr: {}", err);
}

#[test]
fn test_render_rejects_non_object_overrides() {
    let output = mindvpn(&["render", "xray", "reality_tcp", "-o", "[1, 2]"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("JSON object"));
}

// ============================================================================
// Render + Validate
// ============================================================================

#[test]
fn test_render_to_dir_then_validate() {
    let dir = tempfile::tempdir().unwrap();
    let out_dir = dir.path().join("out");
    let out_dir_arg = out_dir.to_str().unwrap();

    let output = mindvpn(&["render", "xray", "reality_grpc", "-o", USER_OVERRIDES, "--out-dir", out_dir_arg]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert_eq!(stdout(&output).lines().count(), 2);

    let config = out_dir.join("config.json");
    let output = mindvpn(&["validate", "xray", config.to_str().unwrap()]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert_eq!(stdout(&output).trim(), "valid");
}

#[test]
fn test_validate_rejects_broken_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.json");
    std::fs::write(&path, r#"{"inbounds": [{"port": 0, "protocol": "vless"}]}"#).unwrap();

    let output = mindvpn(&["validate", "xray", path.to_str().unwrap()]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("not a valid xray config"));
}

#[test]
fn test_validate_fails_closed_on_missing_binary() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, r#"{"inbounds": [{"listen_port": 443, "type": "hysteria2"}]}"#).unwrap();

    let ok = mindvpn(&["validate", "singbox", path.to_str().unwrap()]);
    assert!(ok.status.success(), "stderr: {}", stderr(&ok));

    let missing = dir.path().join("no-such-sing-box");
    let output = mindvpn(&[
        "validate",
        "singbox",
        path.to_str().unwrap(),
        "--singbox-bin",
        missing.to_str().unwrap(),
    ]);
    assert!(!output.status.success());
}

#[test]
fn test_validate_missing_file() {
    let output = mindvpn(&["validate", "xray", "/nonexistent/mindvpn/config.json"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("Failed to read"));
}
