//! CLI argument parsing and end-to-end tests
//!
//! Parsing tests guard the accepted formats of sizes, durations and cache names. The
//! remaining tests run the binary against a temporary cache directory.

use assert_cmd::Command;
use predicates::prelude::*;

fn diskguard() -> Command {
    Command::cargo_bin("diskguard").unwrap()
}

#[test]
fn test_help_runs() {
    diskguard().arg("--help").assert().success();
}

#[test]
fn test_version_runs() {
    diskguard().arg("--version").assert().success();
}

#[test]
fn test_subcommand_is_required() {
    diskguard().assert().failure();
}

#[test]
fn test_byte_limit_accepts_units() {
    for size in ["200GiB", "1 MiB", "512KB"] {
        diskguard()
            .args(["--byte-limit", size, "status", "--help"])
            .assert()
            .success();
    }
}

#[test]
fn test_byte_limit_rejects_garbage() {
    diskguard()
        .args(["--byte-limit", "lots", "status"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--byte-limit"));
}

#[test]
fn test_clear_backoff_accepts_human_durations() {
    for delay in ["200ms", "1s", "5min"] {
        diskguard()
            .args(["--clear-backoff", delay, "status", "--help"])
            .assert()
            .success();
    }
}

#[test]
fn test_cache_names() {
    for cache in ["any", "working-set", "sync"] {
        diskguard()
            .args(["simulate", "--cache", cache, "--help"])
            .assert()
            .success();
    }
    diskguard()
        .args(["simulate", "--cache", "disk"])
        .assert()
        .failure();
}

#[test]
fn test_clear_rejects_bad_folder_ids() {
    diskguard()
        .args(["clear", "--tlf", "not-hex"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--tlf"));
}

#[test]
fn test_cache_dir_is_required() {
    diskguard()
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--cache-dir"));
}

#[test]
fn test_status_reports_both_caches() {
    let tmp = tempfile::tempdir().unwrap();
    let output = diskguard()
        .arg("--cache-dir")
        .arg(tmp.path())
        .arg("status")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let report: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert!(report["caches"]["WorkingSetBlockCache"].is_object());
    assert!(report["caches"]["SyncBlockCache"].is_object());
    assert!(report["limiter"]["journal_tracker_status"].is_object());
}

#[test]
fn test_simulate_fills_the_working_set() {
    let tmp = tempfile::tempdir().unwrap();
    let output = diskguard()
        .arg("--cache-dir")
        .arg(tmp.path())
        .args([
            "simulate",
            "--blocks",
            "20",
            "--block-size",
            "1KiB",
            "--folders",
            "2",
        ])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let report: serde_json::Value = serde_json::from_slice(&output).unwrap();
    let working_set = &report["caches"]["WorkingSetBlockCache"];
    assert_eq!(working_set["num_blocks"], 20);
    assert_eq!(working_set["meters"]["puts"]["count"], 20);

    // the blocks are still there after reopening
    let output = diskguard()
        .arg("--cache-dir")
        .arg(tmp.path())
        .arg("status")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let report: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(report["caches"]["WorkingSetBlockCache"]["num_blocks"], 20);
}
