use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn twv_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("twv");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let data_dir = root.join("data");
    fs::create_dir_all(&data_dir).unwrap();

    // Source points at a closed port; tests below never reach the network.
    let config_content = format!(
        r#"[db]
path = "{}/data/twv.sqlite"

[source]
base_url = "http://127.0.0.1:1"
bearer_token = "test-token"

[server]
bind = "127.0.0.1:7332"
"#,
        root.display()
    );

    let config_path = config_dir.join("twv.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_twv(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = twv_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run twv binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_twv(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/twv.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_twv(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_twv(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_dry_run_prints_queries_without_touching_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_twv(
        &config_path,
        &["search", "AGI", "GPT-5", "--dry-run", "--since", "2026-08-01"],
    );
    assert!(
        success,
        "dry-run failed: stdout={}, stderr={}",
        stdout, stderr
    );
    assert!(stdout.contains("\"AGI\" OR \"GPT-5\""));
    assert!(stdout.contains("since:2026-08-01"));
    assert!(stdout.contains("-filter:retweets"));

    // No init was run and the dry run must not have created the file.
    assert!(!tmp.path().join("data/twv.sqlite").exists());
}

#[test]
fn test_comma_separated_variants_are_split() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_twv(&config_path, &["search", "AGI, GPT-5", "--dry-run"]);
    assert!(success);
    assert!(stdout.contains("2 variant(s)"));
    assert!(stdout.contains("\"AGI\" OR \"GPT-5\""));
}

#[test]
fn test_dry_run_splits_long_variant_lists() {
    let (_tmp, config_path) = setup_test_env();

    let variants: Vec<String> = (0..40).map(|i| format!("variant-number-{:02}", i)).collect();
    let mut args: Vec<&str> = vec!["search"];
    args.extend(variants.iter().map(String::as_str));
    args.push("--dry-run");

    let (stdout, _, success) = run_twv(&config_path, &args);
    assert!(success);
    assert!(stdout.contains("40 variant(s)"));
    // More than one sub-query listed.
    assert!(stdout.contains("  2. "));
}

#[test]
fn test_days_conflicts_with_since() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_twv(
        &config_path,
        &["search", "AGI", "--days", "7", "--since", "2026-08-01"],
    );
    assert!(!success, "expected --days/--since conflict to be rejected");
    assert!(stderr.contains("--since") || stderr.contains("cannot be used"));
}

#[test]
fn test_search_rejects_bad_date() {
    let (_tmp, config_path) = setup_test_env();
    run_twv(&config_path, &["init"]);

    let (_, stderr, success) = run_twv(
        &config_path,
        &["search", "AGI", "--since", "not-a-date", "--dry-run"],
    );
    assert!(!success);
    assert!(stderr.contains("invalid date"));
}

#[test]
fn test_resume_unknown_session_fails() {
    let (_tmp, config_path) = setup_test_env();
    run_twv(&config_path, &["init"]);

    let (_, stderr, success) = run_twv(&config_path, &["resume", "999"]);
    assert!(!success);
    assert!(stderr.contains("not found"), "stderr was: {}", stderr);
}

#[test]
fn test_cleanup_on_empty_database() {
    let (_tmp, config_path) = setup_test_env();
    run_twv(&config_path, &["init"]);

    let (stdout, stderr, success) = run_twv(&config_path, &["cleanup", "--older-than", "30"]);
    assert!(
        success,
        "cleanup failed: stdout={}, stderr={}",
        stdout, stderr
    );
    assert!(stdout.contains("Deleted 0 session(s)."));
}

#[test]
fn test_missing_config_is_an_error() {
    let tmp = TempDir::new().unwrap();
    let missing = tmp.path().join("nope.toml");

    let (_, _, success) = run_twv(&missing, &["init"]);
    assert!(!success);
}
