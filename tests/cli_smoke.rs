//! CLI startup smoke tests.
//!
//! Runs the compiled binary in a scratch directory and checks exit codes
//! and diagnostics. None of these reach the network: every path here fails
//! or finishes before a platform call.

use std::path::Path;
use std::process::{Command, Output};

fn understudy(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_understudy"))
        .current_dir(dir)
        .arg("-c")
        .arg(dir.join("understudy.toml"))
        .args(args)
        .env_remove("UNDERSTUDY_CREDENTIAL")
        .env_remove("UNDERSTUDY_CREDENTIAL_FILE")
        .env("RUST_LOG", "info")
        .output()
        .expect("failed to run understudy")
}

fn describe(output: &Output) -> String {
    format!(
        "status: {:?}\nstdout: {}\nstderr: {}",
        output.status.code(),
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr),
    )
}

#[test]
fn help_exits_zero() {
    let dir = tempfile::tempdir().unwrap();
    let output = understudy(dir.path(), &["--help"]);
    assert!(output.status.success(), "{}", describe(&output));
    assert!(String::from_utf8_lossy(&output.stdout).contains("understudy"));
}

#[test]
fn run_without_credential_exits_nonzero() {
    let dir = tempfile::tempdir().unwrap();
    let output = understudy(dir.path(), &["run"]);
    assert!(!output.status.success(), "{}", describe(&output));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("no credential could be resolved"),
        "{}",
        describe(&output)
    );
}

#[test]
fn run_with_malformed_credential_exits_nonzero() {
    let dir = tempfile::tempdir().unwrap();
    let output = Command::new(env!("CARGO_BIN_EXE_understudy"))
        .current_dir(dir.path())
        .args(["-c", "understudy.toml", "run"])
        .env("UNDERSTUDY_CREDENTIAL", "abc:xyz")
        .env_remove("UNDERSTUDY_CREDENTIAL_FILE")
        .output()
        .unwrap();
    assert!(!output.status.success(), "{}", describe(&output));
    assert!(String::from_utf8_lossy(&output.stderr).contains("invalid credential"));
}

#[test]
fn launch_with_malformed_credential_exits_one() {
    let dir = tempfile::tempdir().unwrap();
    let output = understudy(dir.path(), &["launch", "123456:short"]);
    assert_eq!(output.status.code(), Some(1), "{}", describe(&output));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Invalid credential"));
    assert!(
        !dir.path().join(".understudy").join("clones").exists(),
        "no instance directory may be created for a malformed credential"
    );
}

#[test]
fn launch_json_reports_failure() {
    let dir = tempfile::tempdir().unwrap();
    let output = understudy(dir.path(), &["launch", "abc:xyz", "--json"]);
    assert_eq!(output.status.code(), Some(1), "{}", describe(&output));
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["success"], false);
}

#[test]
fn empty_fleet_and_identity_exit_zero() {
    let dir = tempfile::tempdir().unwrap();

    let fleet = understudy(dir.path(), &["fleet"]);
    assert!(fleet.status.success(), "{}", describe(&fleet));
    assert!(String::from_utf8_lossy(&fleet.stdout).contains("No standbys"));

    let identity = understudy(dir.path(), &["identity"]);
    assert!(identity.status.success(), "{}", describe(&identity));
    assert!(String::from_utf8_lossy(&identity.stdout).contains("No promotion recorded"));
}

#[test]
fn unknown_clone_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let output = understudy(dir.path(), &["unit", "clone_0_00000000"]);
    assert!(!output.status.success(), "{}", describe(&output));
    assert!(String::from_utf8_lossy(&output.stderr).contains("unknown clone"));
}

#[test]
fn bad_config_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("understudy.toml"),
        "[monitor]\nfailure_threshold = 0\n",
    )
    .unwrap();
    let output = understudy(dir.path(), &["fleet"]);
    assert!(!output.status.success(), "{}", describe(&output));
    assert!(String::from_utf8_lossy(&output.stderr).contains("failure_threshold"));
}
