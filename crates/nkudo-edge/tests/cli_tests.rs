//! Integration tests for the `nkudo-edge` binary.
//!
//! These exercise the CLI as a subprocess, verifying exit codes,
//! output, and filesystem side effects. They do NOT require a running
//! control plane or a hypervisor — commands that need one are pointed
//! at a dead port and asserted on their failure classification.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::Path;
use std::process::Command;

/// Helper: locate the `nkudo-edge` binary built by `cargo test`.
fn edge_bin() -> String {
    let path = env!("CARGO_BIN_EXE_nkudo-edge");
    assert!(
        Path::new(path).exists(),
        "nkudo-edge binary not found at {path}"
    );
    path.to_owned()
}

/// Helper: run nkudo-edge with args in a temp data dir and return
/// (`exit_code`, stdout, stderr).
fn run_in(data_dir: &Path, args: &[&str]) -> (i32, String, String) {
    let output = Command::new(edge_bin())
        .args(args)
        .env("NKUDO_DATA_DIR", data_dir)
        .env("CONTROL_PLANE_URL", "http://127.0.0.1:19997") // Dead port
        .env_remove("NKUDO_ENROLL_TOKEN")
        .env_remove("NKUDO_STATE_KEY")
        .output()
        .expect("failed to execute nkudo-edge");

    let code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (code, stdout, stderr)
}

// ── Version & help ───────────────────────────────────────────────────

#[test]
fn test_version_flag() {
    let dir = tempfile::tempdir().unwrap();
    let (code, stdout, _) = run_in(dir.path(), &["--version"]);
    assert_eq!(code, 0, "nkudo-edge --version should exit 0");
    assert!(stdout.contains("nkudo-edge"));
}

#[test]
fn test_version_subcommand() {
    let dir = tempfile::tempdir().unwrap();
    let (code, stdout, _) = run_in(dir.path(), &["version"]);
    assert_eq!(code, 0);
    assert!(stdout.contains("nkudo-edge"));
}

#[test]
fn test_help_lists_subcommands() {
    let dir = tempfile::tempdir().unwrap();
    let (code, stdout, _) = run_in(dir.path(), &["--help"]);
    assert_eq!(code, 0);
    for sub in ["enroll", "run", "apply", "status", "renew", "unenroll", "check"] {
        assert!(stdout.contains(sub), "help should list '{sub}': {stdout}");
    }
}

// ── Enroll ───────────────────────────────────────────────────────────

#[test]
fn test_enroll_without_token_is_validation_error() {
    let dir = tempfile::tempdir().unwrap();
    let (code, _, stderr) = run_in(dir.path(), &["enroll"]);
    assert_eq!(code, 1, "missing token is a user error: {stderr}");
    assert!(stderr.contains("token"));
}

#[test]
fn test_enroll_against_dead_server_is_transient() {
    let dir = tempfile::tempdir().unwrap();
    let (code, _, stderr) = run_in(
        dir.path(),
        &["enroll", "--token", "nket_0000000000000000"],
    );
    assert_eq!(code, 2, "unreachable server is transient: {stderr}");
}

// ── Status ───────────────────────────────────────────────────────────

#[test]
fn test_status_before_enrollment() {
    let dir = tempfile::tempdir().unwrap();
    let (code, stdout, _) = run_in(dir.path(), &["status"]);
    assert_eq!(code, 0);
    assert!(stdout.contains("Not enrolled"));
    assert!(stdout.contains("No microVMs"));
}

// ── Run ──────────────────────────────────────────────────────────────

#[test]
fn test_run_requires_enrollment() {
    let dir = tempfile::tempdir().unwrap();
    let (code, _, stderr) = run_in(dir.path(), &["run"]);
    assert_eq!(code, 3, "run without identity is fatal: {stderr}");
    assert!(stderr.contains("not enrolled") || stderr.contains("enroll"));
}

// ── Apply ────────────────────────────────────────────────────────────

#[test]
fn test_apply_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let (code, _, stderr) = run_in(dir.path(), &["apply", "/tmp/nkudo-test-missing.json"]);
    assert_eq!(code, 1);
    assert!(!stderr.is_empty());
}

#[test]
fn test_apply_rejects_invalid_operations() {
    let dir = tempfile::tempdir().unwrap();
    let plan = dir.path().join("plan.json");
    // start without vm_id is invalid.
    std::fs::write(
        &plan,
        r#"{"operations":[{"operation_id":"o1","type":"start"}]}"#,
    )
    .unwrap();
    let (code, _, stderr) = run_in(dir.path(), &["apply", plan.to_str().unwrap()]);
    assert_eq!(code, 1, "{stderr}");
    assert!(stderr.contains("vm_id"));
}

#[test]
fn test_apply_delete_of_unknown_vm_succeeds_idempotently() {
    let dir = tempfile::tempdir().unwrap();
    let plan = dir.path().join("plan.json");
    std::fs::write(
        &plan,
        r#"{"operations":[{"operation_id":"o1","type":"delete","vm_id":"8f3a0f6e-8c4e-4f9f-9c33-111111111111"}]}"#,
    )
    .unwrap();
    let (code, stdout, stderr) = run_in(dir.path(), &["apply", plan.to_str().unwrap()]);
    assert_eq!(code, 0, "stdout={stdout} stderr={stderr}");
    assert!(stdout.contains("ok    o1"));

    // Re-apply replays the cached outcome and still succeeds.
    let (code2, stdout2, _) = run_in(dir.path(), &["apply", plan.to_str().unwrap()]);
    assert_eq!(code2, 0);
    assert!(stdout2.contains("ok    o1"));
}

#[test]
fn test_apply_reports_failed_operations() {
    let dir = tempfile::tempdir().unwrap();
    let plan = dir.path().join("plan.json");
    // Starting a VM that was never created fails with not_found.
    std::fs::write(
        &plan,
        r#"{"operations":[{"operation_id":"o1","type":"start","vm_id":"8f3a0f6e-8c4e-4f9f-9c33-222222222222"}]}"#,
    )
    .unwrap();
    let (code, stdout, _) = run_in(dir.path(), &["apply", plan.to_str().unwrap()]);
    assert_eq!(code, 1);
    assert!(stdout.contains("FAIL  o1"));
    assert!(stdout.contains("not_found"));
}

// ── Renew / unenroll ─────────────────────────────────────────────────

#[test]
fn test_renew_without_identity_fails() {
    let dir = tempfile::tempdir().unwrap();
    let (code, _, _) = run_in(dir.path(), &["renew"]);
    assert_eq!(code, 3, "renew without enrollment is fatal-local");
}

#[test]
fn test_unenroll_requires_confirmation() {
    let dir = tempfile::tempdir().unwrap();
    let (code, _, stderr) = run_in(dir.path(), &["unenroll"]);
    assert_eq!(code, 1);
    assert!(stderr.contains("--yes"));

    let (code, stdout, _) = run_in(dir.path(), &["unenroll", "--yes"]);
    assert_eq!(code, 0, "{stdout}");
}

// ── State file side effects ──────────────────────────────────────────

#[test]
fn test_apply_persists_action_records() {
    let dir = tempfile::tempdir().unwrap();
    let plan = dir.path().join("plan.json");
    std::fs::write(
        &plan,
        r#"{"operations":[{"operation_id":"o1","type":"delete","vm_id":"8f3a0f6e-8c4e-4f9f-9c33-333333333333"}]}"#,
    )
    .unwrap();
    let (code, _, _) = run_in(dir.path(), &["apply", plan.to_str().unwrap()]);
    assert_eq!(code, 0);

    let state_file = dir.path().join("state").join("edge-state.json");
    assert!(state_file.exists(), "state file should be written");
    let raw = std::fs::read_to_string(&state_file).unwrap();
    assert!(raw.contains("\"actions\""));
    assert!(raw.contains(":o1"), "action id keyed by plan:operation");
}

#[test]
fn test_encrypted_state_round_trip_via_env() {
    let dir = tempfile::tempdir().unwrap();
    let key = "11".repeat(32);
    let plan = dir.path().join("plan.json");
    std::fs::write(
        &plan,
        r#"{"operations":[{"operation_id":"o1","type":"delete","vm_id":"8f3a0f6e-8c4e-4f9f-9c33-444444444444"}]}"#,
    )
    .unwrap();

    let output = Command::new(edge_bin())
        .args(["apply", plan.to_str().unwrap()])
        .env("NKUDO_DATA_DIR", dir.path())
        .env("CONTROL_PLANE_URL", "http://127.0.0.1:19997")
        .env("NKUDO_STATE_KEY", &key)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0));

    let raw = std::fs::read(dir.path().join("state").join("edge-state.json")).unwrap();
    assert!(raw.starts_with(b"NKEDGE1"), "state should be encrypted");

    // Status with the key still reads it.
    let output = Command::new(edge_bin())
        .args(["status"])
        .env("NKUDO_DATA_DIR", dir.path())
        .env("CONTROL_PLANE_URL", "http://127.0.0.1:19997")
        .env("NKUDO_STATE_KEY", &key)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0));

    // Without the key, the store refuses (fatal local error).
    let output = Command::new(edge_bin())
        .args(["status"])
        .env("NKUDO_DATA_DIR", dir.path())
        .env("CONTROL_PLANE_URL", "http://127.0.0.1:19997")
        .env_remove("NKUDO_STATE_KEY")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(3));
}
