//! CLI Integration Tests
//!
//! These tests verify that the CLI commands work correctly end-to-end.
//! They test the actual binary behavior, not just the library.
//!
//! Run with:
//! ```bash
//! cargo test --test cli_integration
//! ```

use std::path::Path;
use std::process::Command;
use tempfile::tempdir;

/// Run chkmap against a store and return (stdout, stderr, success)
fn run_chkmap(args: &[&str], store_path: &Path) -> (String, String, bool) {
    let output = Command::new(env!("CARGO_BIN_EXE_chkmap"))
        .arg("-s")
        .arg(store_path)
        .args(["-f", "json"])
        .args(args)
        .env_remove("CHKMAP_LOG")
        .output()
        .expect("Failed to execute chkmap");

    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.success(),
    )
}

fn json(stdout: &str) -> serde_json::Value {
    serde_json::from_str(stdout.trim()).expect("stdout should be JSON")
}

// ============================================================================
// Store Initialization Tests
// ============================================================================

#[test]
fn test_cli_init_creates_store_and_config() {
    let dir = tempdir().unwrap();
    let store_path = dir.path().join("maps.chk");

    let (stdout, _stderr, success) = run_chkmap(
        &["init", "--maximum-size", "100", "--search-key", "hash-16-way"],
        &store_path,
    );

    assert!(success, "init should succeed");
    let out = json(&stdout);
    assert_eq!(out["status"], "ok");
    // an empty leaf with a 100 byte limit
    assert_eq!(out["root"], "sha1:5043609b05ee7572343a017d1f487836ced8e58b");
    assert!(store_path.exists(), "store file should be created");

    let config = std::fs::read_to_string(dir.path().join("maps.chk.json")).unwrap();
    assert!(config.contains("hash-16-way"));
}

#[test]
fn test_cli_init_rejects_unknown_search_key() {
    let dir = tempdir().unwrap();
    let store_path = dir.path().join("maps.chk");
    let (_stdout, _stderr, success) =
        run_chkmap(&["init", "--search-key", "hash-7-way"], &store_path);
    assert!(!success);
}

// ============================================================================
// Item Tests
// ============================================================================

#[test]
fn test_cli_put_and_get() {
    let dir = tempdir().unwrap();
    let store_path = dir.path().join("maps.chk");
    run_chkmap(&["init"], &store_path);

    let (stdout, _stderr, success) = run_chkmap(&["put", "readme", "file-id-1"], &store_path);
    assert!(success, "put should succeed");
    assert!(json(&stdout)["root"].as_str().unwrap().starts_with("sha1:"));

    let (stdout, _stderr, success) = run_chkmap(&["get", "readme"], &store_path);
    assert!(success);
    assert_eq!(json(&stdout)["value"], "file-id-1");
}

#[test]
fn test_cli_get_missing_key_fails() {
    let dir = tempdir().unwrap();
    let store_path = dir.path().join("maps.chk");
    run_chkmap(&["init"], &store_path);

    let (stdout, _stderr, success) = run_chkmap(&["get", "nope"], &store_path);
    assert!(!success);
    assert_eq!(json(&stdout)["status"], "error");
}

#[test]
fn test_cli_multi_element_keys() {
    let dir = tempdir().unwrap();
    let store_path = dir.path().join("maps.chk");
    run_chkmap(&["init", "--key-width", "2"], &store_path);

    run_chkmap(&["put", "dir", "a", "1"], &store_path);
    run_chkmap(&["put", "dir", "b", "2"], &store_path);
    run_chkmap(&["put", "other", "c", "3"], &store_path);

    let (stdout, _stderr, success) = run_chkmap(&["list", "dir"], &store_path);
    assert!(success);
    let out = json(&stdout);
    assert_eq!(out["count"], 2);
    assert_eq!(out["items"][0]["key"], serde_json::json!(["dir", "a"]));

    // wrong width is rejected
    let (_stdout, _stderr, success) = run_chkmap(&["put", "dir", "x"], &store_path);
    assert!(!success);
}

#[test]
fn test_cli_delete() {
    let dir = tempdir().unwrap();
    let store_path = dir.path().join("maps.chk");
    let (init, _, _) = run_chkmap(&["init"], &store_path);
    let empty_root = json(&init)["root"].clone();

    run_chkmap(&["put", "a", "1"], &store_path);
    let (stdout, _stderr, success) = run_chkmap(&["delete", "a"], &store_path);
    assert!(success);
    assert_eq!(json(&stdout)["root"], empty_root);

    let (_stdout, _stderr, success) = run_chkmap(&["delete", "a"], &store_path);
    assert!(!success, "deleting a missing key should fail");
}

#[test]
fn test_cli_data_persists_across_invocations() {
    let dir = tempdir().unwrap();
    let store_path = dir.path().join("maps.chk");
    run_chkmap(&["init", "--maximum-size", "64"], &store_path);

    for i in 0..30 {
        let key = format!("key{:02}", i);
        let value = format!("value {}", i);
        let (_, stderr, success) = run_chkmap(&["put", &key, &value], &store_path);
        assert!(success, "put {} failed: {}", key, stderr);
    }

    let (stdout, _stderr, _success) = run_chkmap(&["list"], &store_path);
    assert_eq!(json(&stdout)["count"], 30);

    let (stdout, _stderr, _success) = run_chkmap(&["status"], &store_path);
    let status = json(&stdout);
    assert_eq!(status["items"], 30);
    assert_eq!(status["ref"], "main");
}

// ============================================================================
// Refs and Diff Tests
// ============================================================================

#[test]
fn test_cli_diff_between_refs() {
    let dir = tempdir().unwrap();
    let store_path = dir.path().join("maps.chk");
    run_chkmap(&["init"], &store_path);
    run_chkmap(&["put", "a", "1"], &store_path);
    run_chkmap(&["put", "b", "2"], &store_path);

    let (stdout, _, _) = run_chkmap(&["status"], &store_path);
    let base_root = json(&stdout)["root"].as_str().unwrap().to_string();

    run_chkmap(&["put", "b", "changed"], &store_path);
    run_chkmap(&["put", "c", "3"], &store_path);
    run_chkmap(&["delete", "a"], &store_path);

    let (stdout, _stderr, success) = run_chkmap(&["diff", &base_root, "main"], &store_path);
    assert!(success);
    let out = json(&stdout);
    assert_eq!(out["added"], 1);
    assert_eq!(out["removed"], 1);
    assert_eq!(out["modified"], 1);
    assert_eq!(out["entries"][1]["old"], "2");
    assert_eq!(out["entries"][1]["new"], "changed");
}

#[test]
fn test_cli_separate_refs() {
    let dir = tempdir().unwrap();
    let store_path = dir.path().join("maps.chk");
    run_chkmap(&["init"], &store_path);
    run_chkmap(&["put", "a", "1"], &store_path);
    run_chkmap(&["--ref", "feature", "put", "z", "26"], &store_path);

    let (stdout, _, _) = run_chkmap(&["--ref", "feature", "list"], &store_path);
    assert_eq!(json(&stdout)["count"], 1);
    let (stdout, _, _) = run_chkmap(&["list"], &store_path);
    assert_eq!(json(&stdout)["items"][0]["key"], serde_json::json!(["a"]));
}

#[test]
fn test_cli_diff_unknown_ref_fails() {
    let dir = tempdir().unwrap();
    let store_path = dir.path().join("maps.chk");
    run_chkmap(&["init"], &store_path);
    let (_stdout, _stderr, success) = run_chkmap(&["diff", "nope", "main"], &store_path);
    assert!(!success);
}

#[test]
fn test_cli_dump_text() {
    let dir = tempdir().unwrap();
    let store_path = dir.path().join("maps.chk");
    run_chkmap(&["init"], &store_path);
    run_chkmap(&["put", "foo", "bar"], &store_path);

    let output = Command::new(env!("CARGO_BIN_EXE_chkmap"))
        .arg("-s")
        .arg(&store_path)
        .args(["-f", "text", "dump", "--keys"])
        .output()
        .expect("Failed to execute chkmap");
    assert!(output.status.success());
    assert_eq!(
        String::from_utf8_lossy(&output.stdout),
        "'' LeafNode sha1:2ba8cacd747c1b47fc83c5cb02d4b4789198ed19\n      ('foo',) 'bar'\n"
    );
}

#[test]
fn test_cli_help_lists_commands() {
    let output = Command::new(env!("CARGO_BIN_EXE_chkmap"))
        .args(["--help"])
        .output()
        .expect("Failed to execute chkmap");

    let stdout = String::from_utf8_lossy(&output.stdout);
    for command in ["init", "put", "get", "delete", "list", "diff", "dump", "status"] {
        assert!(stdout.contains(command), "help should list {}", command);
    }
    assert!(stdout.contains("[default: maps.chk]"));
}
