//! CLI tests for forge-sync.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn forge_sync() -> Command {
    let mut cmd = cargo_bin_cmd!("forge-sync");
    // Keep a developer's environment from leaking into assertions.
    for key in [
        "FORGE_SYNC_PORT",
        "FORGE_SYNC_DB",
        "FORGE_SYNC_PUBLIC_URL",
        "FORGE_SYNC_LOG_FORMAT",
        "FORGE_SYNC_CONFIG",
    ] {
        cmd.env_remove(key);
    }
    cmd
}

#[test]
fn test_help() {
    forge_sync()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("init"));
}

#[test]
fn test_version() {
    forge_sync().arg("--version").assert().success();
}

#[test]
fn test_init_creates_database() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("nested/sync.db");

    forge_sync()
        .current_dir(dir.path())
        .args(["init", "--db"])
        .arg(&db)
        .assert()
        .success()
        .stdout(predicate::str::contains("Sync database initialized"));

    assert!(db.exists());
}

#[test]
fn test_config_prints_defaults() {
    let dir = TempDir::new().unwrap();
    forge_sync()
        .current_dir(dir.path())
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("[http]"))
        .stdout(predicate::str::contains("port = 8119"))
        .stdout(predicate::str::contains("base_delay_secs = 30"));
}

#[test]
fn test_config_reads_file_and_env() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sync.toml");
    fs::write(&path, "[http]\nport = 9000\n\n[address]\npublic_url = \"https://sync.example.com\"\n").unwrap();

    forge_sync()
        .current_dir(dir.path())
        .args(["config", "--config"])
        .arg(&path)
        .env("FORGE_SYNC_PORT", "9100")
        .assert()
        .success()
        .stdout(predicate::str::contains("port = 9100"))
        .stdout(predicate::str::contains("https://sync.example.com"));
}

#[test]
fn test_config_rejects_unknown_keys() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sync.toml");
    fs::write(&path, "[http]\nprot = 9000\n").unwrap();

    forge_sync()
        .current_dir(dir.path())
        .args(["config", "--config"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid config file"));
}
