// SPDX-FileCopyrightText: 2026 Walsnap Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Command line tests: run the built `walsnap` binary in a scratch
//! directory so no local `walsnap.toml` leaks in.

use std::path::Path;
use std::process::{Command, Output};
use std::time::Duration;

use walsnap_storage::Database;

fn walsnap(cwd: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_walsnap"))
        .args(args)
        .current_dir(cwd)
        .env_remove("RUST_LOG")
        .env("WALSNAP_LOG_LEVEL", "warn")
        .output()
        .expect("failed to run walsnap")
}

fn make_snapshot(dir: &Path) {
    let db = Database::open(dir.join("app.db")).unwrap();
    db.execute_batch("CREATE TABLE t (v TEXT); INSERT INTO t VALUES ('a');")
        .unwrap();
    db.set_snapshot_directory(dir.join("snaps"), Duration::from_secs(3600))
        .unwrap();
    db.execute("INSERT INTO t VALUES (?1)", ["b"]).unwrap();
    db.close().unwrap();
}

#[test]
fn list_prints_database_path() {
    let dir = tempfile::tempdir().unwrap();
    make_snapshot(dir.path());

    let output = walsnap(dir.path(), &["list", "-vv", "snaps"]);
    assert!(output.status.success(), "{output:?}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("app.db"));
    assert!(stdout.contains("frame"));
}

#[test]
fn list_of_empty_directory_fails() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("empty")).unwrap();

    let output = walsnap(dir.path(), &["list", "empty"]);
    assert!(!output.status.success());
}

#[test]
fn restore_without_destination_or_force_fails() {
    let dir = tempfile::tempdir().unwrap();
    make_snapshot(dir.path());

    let output = walsnap(dir.path(), &["restore", "snaps"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("--force"), "{stderr}");
}

#[test]
fn restore_into_output_dir() {
    let dir = tempfile::tempdir().unwrap();
    make_snapshot(dir.path());

    let output = walsnap(dir.path(), &["restore", "-O", "out", "snaps"]);
    assert!(output.status.success(), "{output:?}");

    let restored: Vec<_> = walk(&dir.path().join("out"))
        .into_iter()
        .filter(|p| p.file_name().is_some_and(|n| n == "app.db"))
        .collect();
    assert_eq!(restored.len(), 1);

    let conn = rusqlite::Connection::open(&restored[0]).unwrap();
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 2);
}

#[test]
fn unknown_config_key_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("bad.toml"), "[snapshot]\ndirectry = \"/x\"\n").unwrap();

    let output = walsnap(dir.path(), &["--config", "bad.toml", "list", "."]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("directory"), "{stderr}");
}

fn walk(dir: &Path) -> Vec<std::path::PathBuf> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            found.extend(walk(&path));
        } else {
            found.push(path);
        }
    }
    found
}
