//! Binary-level checks of the command line

use assert_cmd::Command;
use tempfile::tempdir;

fn cli() -> Command {
    let mut cmd = Command::cargo_bin("listing-scraper").unwrap();
    cmd.env_remove("PROXY_USERNAME")
        .env_remove("PROXY_PASSWORD")
        .env_remove("PROXY_BASE_URL")
        .env_remove("API_TIMEOUT")
        .env_remove("API_MAX_RETRIES")
        .env_remove("API_CONNECT_TIMEOUT");
    cmd
}

#[test]
fn test_help_lists_commands() {
    let output = cli().arg("--help").output().unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("scrape"));
    assert!(stdout.contains("batch"));
    assert!(stdout.contains("dead-letters"));
}

#[test]
fn test_scrape_without_credentials_fails() {
    let dir = tempdir().unwrap();
    cli()
        .args(["--output-dir"])
        .arg(dir.path())
        .args(["scrape", "desk lamp"])
        .assert()
        .failure();

    // Nothing was written
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn test_invalid_concurrency_rejected() {
    cli()
        .args(["--concurrency", "0", "scrape", "desk lamp"])
        .assert()
        .failure();
}

#[test]
fn test_dead_letters_list_on_empty_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("dead_letters.json");

    let output = cli()
        .args(["--output-format", "json", "--dead-letter-file"])
        .arg(&path)
        .args(["dead-letters", "list"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let entries: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(entries, serde_json::json!([]));
}
