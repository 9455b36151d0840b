// SPDX-FileCopyrightText: 2026 Walsnap Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end snapshot tests: live database -> main stream -> restore.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use walsnap_core::WalsnapError;
use walsnap_storage::{
    Database, SnapshotInfo, collect_snapshots, list_snapshot_files, restore_snapshot,
    restore_snapshot_at, sidecar_path, wal_path,
};

const HOUR: Duration = Duration::from_secs(3600);

fn setup() -> (TempDir, Database) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("live.db")).unwrap();
    db.execute_batch("CREATE TABLE kv (k TEXT PRIMARY KEY, v TEXT NOT NULL);")
        .unwrap();
    (dir, db)
}

fn put(db: &Database, key: &str, value: &str) {
    db.execute("INSERT INTO kv (k, v) VALUES (?1, ?2)", [key, value])
        .unwrap();
}

fn collect_one(dir: &Path, db: &Database) -> SnapshotInfo {
    let files = list_snapshot_files(&dir.join("snaps")).unwrap();
    let set = collect_snapshots(&files).unwrap();
    set.get(db.path()).cloned().expect("snapshot for live database")
}

fn keys(path: &Path) -> Vec<String> {
    let conn = Connection::open(path).unwrap();
    let mut stmt = conn.prepare("SELECT k FROM kv ORDER BY k").unwrap();
    stmt.query_map([], |row| row.get(0))
        .unwrap()
        .collect::<Result<Vec<String>, _>>()
        .unwrap()
}

fn gunzip(path: &Path) -> Vec<u8> {
    let mut out = Vec::new();
    GzDecoder::new(File::open(path).unwrap())
        .read_to_end(&mut out)
        .unwrap();
    out
}

#[test]
fn write_enable_write_checkpoint_restore() {
    let (dir, db) = setup();
    put(&db, "a", "A");
    db.set_snapshot_directory(dir.path().join("snaps"), HOUR)
        .unwrap();
    put(&db, "b", "B");
    db.checkpoint().unwrap();

    let stream = db.snapshot_stream().unwrap();
    assert!(sidecar_path(&stream, 0).exists());
    assert!(sidecar_path(&stream, 1).exists());
    assert!(sidecar_path(&stream, 2).exists(), "next generation is open");
    assert!(!sidecar_path(&stream, 3).exists());

    let info = collect_one(dir.path(), &db);
    assert_eq!(info.versions.len(), 1);
    assert_eq!(info.frames.len(), 2);

    let dest = dir.path().join("restored.db");
    restore_snapshot(&info, &dest, false).unwrap();
    assert_eq!(keys(&dest), ["a", "b"]);
    assert!(!wal_path(&dest).exists());
}

#[test]
fn sealed_sidecars_match_their_digests() {
    let (dir, db) = setup();
    db.set_snapshot_directory(dir.path().join("snaps"), HOUR)
        .unwrap();
    for round in 0..3 {
        put(&db, &format!("k{round}"), "v");
        db.checkpoint().unwrap();
    }

    let info = collect_one(dir.path(), &db);
    assert_eq!(info.frames.len(), 4);
    for frame in &info.frames {
        let digest: [u8; 32] = Sha256::digest(gunzip(&frame.file)).into();
        assert_eq!(digest, frame.sha256.0, "frame {}", frame.index);
    }
}

#[test]
fn idle_checkpoints_add_no_frames() {
    let (dir, db) = setup();
    db.set_snapshot_directory(dir.path().join("snaps"), HOUR)
        .unwrap();
    put(&db, "a", "A");
    db.checkpoint_snapshot(false).unwrap();

    let stream = db.snapshot_stream().unwrap();
    let size = fs::metadata(&stream).unwrap().len();
    let generation = db.snapshot_generation();

    db.checkpoint_snapshot(false).unwrap();
    db.checkpoint_snapshot(false).unwrap();
    assert_eq!(fs::metadata(&stream).unwrap().len(), size);
    assert_eq!(db.snapshot_generation(), generation);
}

#[test]
fn restart_keeps_uncheckpointed_writes() {
    let (dir, db) = setup();
    db.set_snapshot_directory(dir.path().join("snaps"), HOUR)
        .unwrap();
    put(&db, "a", "A");
    db.checkpoint().unwrap();
    put(&db, "b", "B");

    // "b" is only in the WAL when the new full copy is taken.
    db.checkpoint_snapshot(true).unwrap();
    put(&db, "c", "C");
    db.checkpoint().unwrap();

    let info = collect_one(dir.path(), &db);
    assert_eq!(info.versions.len(), 2);

    let dest = dir.path().join("restored.db");
    restore_snapshot(&info, &dest, false).unwrap();
    assert_eq!(keys(&dest), ["a", "b", "c"]);
}

#[test]
fn restore_at_earlier_frame() {
    let (dir, db) = setup();
    db.set_snapshot_directory(dir.path().join("snaps"), HOUR)
        .unwrap();
    put(&db, "a", "A");
    db.checkpoint().unwrap();
    put(&db, "b", "B");
    db.checkpoint().unwrap();

    let info = collect_one(dir.path(), &db);
    assert_eq!(info.frames.len(), 3);

    let dest = dir.path().join("as-of.db");
    restore_snapshot_at(&info, 1, &dest, false).unwrap();
    assert_eq!(keys(&dest), ["a"]);

    restore_snapshot_at(&info, 0, &dest, true).unwrap();
    assert!(keys(&dest).is_empty());
}

#[test]
fn restore_refuses_to_overwrite() {
    let (dir, db) = setup();
    db.set_snapshot_directory(dir.path().join("snaps"), HOUR)
        .unwrap();
    let info = collect_one(dir.path(), &db);

    let dest = dir.path().join("taken.db");
    fs::write(&dest, b"keep me").unwrap();
    let err = restore_snapshot(&info, &dest, false).unwrap_err();
    assert!(matches!(err, WalsnapError::RefuseOverwrite { .. }));
    assert_eq!(fs::read(&dest).unwrap(), b"keep me");

    restore_snapshot(&info, &dest, true).unwrap();
    assert!(keys(&dest).is_empty());
}

#[test]
fn tampered_wal_sidecar_fails_restore_and_cleans_up() {
    let (dir, db) = setup();
    db.set_snapshot_directory(dir.path().join("snaps"), HOUR)
        .unwrap();
    put(&db, "a", "A");
    db.checkpoint().unwrap();

    let info = collect_one(dir.path(), &db);
    let mut encoder = GzEncoder::new(File::create(&info.frames[1].file).unwrap(), Compression::fast());
    encoder.write_all(b"not the WAL you are looking for").unwrap();
    encoder.finish().unwrap();

    let dest = dir.path().join("restored.db");
    let err = restore_snapshot(&info, &dest, false).unwrap_err();
    assert!(matches!(err, WalsnapError::ChecksumMismatch { kind: "WAL", .. }));
    assert!(!wal_path(&dest).exists());
}

#[test]
fn tampered_full_copy_fails_restore() {
    let (dir, db) = setup();
    put(&db, "a", "A");
    db.set_snapshot_directory(dir.path().join("snaps"), HOUR)
        .unwrap();

    let info = collect_one(dir.path(), &db);
    let full = &info.frames[0];
    assert!(full.is_full());
    let mut encoder = GzEncoder::new(File::create(&full.file).unwrap(), Compression::fast());
    encoder.write_all(b"SQLite format 3\0 but not really").unwrap();
    encoder.finish().unwrap();

    let dest = dir.path().join("restored.db");
    let err = restore_snapshot(&info, &dest, false).unwrap_err();
    assert!(matches!(
        err,
        WalsnapError::ChecksumMismatch { kind: "database", .. }
    ));
}

#[test]
fn restarts_leave_no_unsealed_sidecars() {
    let (dir, db) = setup();
    db.set_snapshot_directory(dir.path().join("snaps"), HOUR)
        .unwrap();
    let first = db.snapshot_stream().unwrap();
    let first_open = sidecar_path(&first, 1);
    assert!(first_open.exists());

    for round in 0..5 {
        db.checkpoint_snapshot(true).unwrap();
        put(&db, &format!("k{round}"), "v");
    }
    assert!(!first_open.exists());
    db.close().unwrap();

    // Every file left is a main stream or a sidecar with a frame record.
    let files = list_snapshot_files(&dir.path().join("snaps")).unwrap();
    let set = collect_snapshots(&files).unwrap();
    let mut expected: Vec<_> = files.clone();
    for info in set.iter() {
        expected.extend(info.frames.iter().map(|frame| frame.file.clone()));
    }
    expected.sort();
    let mut on_disk: Vec<_> = fs::read_dir(dir.path().join("snaps"))
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    on_disk.sort();
    assert_eq!(on_disk, expected);
}

#[test]
fn checkpoint_after_close_writes_nothing() {
    let (dir, db) = setup();
    db.set_snapshot_directory(dir.path().join("snaps"), HOUR)
        .unwrap();
    put(&db, "a", "A");
    db.close().unwrap();
    let before = fs::read_dir(dir.path().join("snaps")).unwrap().count();

    let err = db.checkpoint_snapshot(true).unwrap_err();
    assert!(matches!(err, WalsnapError::SnapshotDisabled));
    assert_eq!(fs::read_dir(dir.path().join("snaps")).unwrap().count(), before);
}

#[test]
fn close_racing_a_restart_keeps_latest_version_restorable() {
    for attempt in 0..10 {
        let (dir, db) = setup();
        db.set_snapshot_directory(dir.path().join("snaps"), HOUR)
            .unwrap();
        for i in 0..20 {
            put(&db, &format!("{attempt}-{i:02}"), "v");
        }
        let live_path = db.path().to_path_buf();
        let db = Arc::new(db);
        let barrier = Arc::new(Barrier::new(2));

        let restarter = {
            let (db, barrier) = (Arc::clone(&db), Arc::clone(&barrier));
            thread::spawn(move || {
                barrier.wait();
                match db.checkpoint_snapshot(true) {
                    Ok(()) | Err(WalsnapError::SnapshotDisabled) => {}
                    Err(e) => panic!("unexpected checkpoint error: {e}"),
                }
            })
        };
        barrier.wait();
        db.close().unwrap();
        restarter.join().unwrap();

        let files = list_snapshot_files(&dir.path().join("snaps")).unwrap();
        let set = collect_snapshots(&files).unwrap();
        let info = set.get(&live_path).unwrap();
        let dest = dir.path().join("restored.db");
        restore_snapshot(info, &dest, false).unwrap();
        assert_eq!(keys(&dest).len(), 20, "attempt {attempt}");
    }
}

#[test]
fn close_seals_pending_writes() {
    let (dir, db) = setup();
    db.set_snapshot_directory(dir.path().join("snaps"), HOUR)
        .unwrap();
    put(&db, "a", "A");
    let live_path = db.path().to_path_buf();
    db.close().unwrap();

    let files = list_snapshot_files(&dir.path().join("snaps")).unwrap();
    let set = collect_snapshots(&files).unwrap();
    let info = set.get(&live_path).unwrap();

    let dest = dir.path().join("restored.db");
    restore_snapshot(info, &dest, false).unwrap();
    assert_eq!(keys(&dest), ["a"]);
}

#[test]
fn concurrent_writers_with_checkpoint_thread() {
    let (dir, db) = setup();
    db.set_snapshot_directory(dir.path().join("snaps"), HOUR)
        .unwrap();
    let db = Arc::new(db);

    let writers: Vec<_> = (0..3)
        .map(|w| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                for i in 0..40 {
                    put(&db, &format!("w{w}-{i:03}"), "x");
                }
            })
        })
        .collect();
    let checkpointer = {
        let db = Arc::clone(&db);
        thread::spawn(move || {
            for _ in 0..10 {
                db.checkpoint().unwrap();
                thread::sleep(Duration::from_millis(2));
            }
        })
    };
    let reader = {
        let db = Arc::clone(&db);
        thread::spawn(move || {
            for _ in 0..40 {
                let _: i64 = db
                    .query_row("SELECT COUNT(*) FROM kv", [], |row| row.get(0))
                    .unwrap();
            }
        })
    };

    for handle in writers {
        handle.join().unwrap();
    }
    checkpointer.join().unwrap();
    reader.join().unwrap();
    db.checkpoint().unwrap();

    let info = collect_one(dir.path(), &db);
    let dest = dir.path().join("restored.db");
    restore_snapshot(&info, &dest, false).unwrap();
    assert_eq!(keys(&dest).len(), 120);
}
