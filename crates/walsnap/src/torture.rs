// SPDX-FileCopyrightText: 2026 Walsnap Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `walsnap torture`: concurrent load against a snapshotting database,
//! followed by a restore that must reproduce the final row count.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use rusqlite::{Connection, OpenFlags, params};
use tracing::{debug, error, info};

use walsnap_config::DatabaseConfig;
use walsnap_core::WalsnapError;
use walsnap_storage::{Database, collect_snapshots, list_snapshot_files, restore_snapshot};

const SEED_ROWS: usize = 1000;
const MAX_BATCH: usize = 16;
const MAX_PAYLOAD: usize = 512;

#[derive(Debug, Clone)]
pub struct TortureOptions {
    /// Defaults to `<database>.snapshots` next to the database.
    pub snapshot_dir: Option<PathBuf>,
    pub duration: Duration,
    pub full_delay: Duration,
    pub checkpoint_interval: Duration,
    pub threads: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TortureReport {
    pub rows: u64,
    pub transactions: u64,
    pub reads: u64,
    pub checkpoints: u64,
    pub failed_checkpoints: u64,
    pub restored_rows: u64,
}

impl fmt::Display for TortureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} transactions, {} reads, {} checkpoints ({} failed); {} rows live, {} restored",
            self.transactions,
            self.reads,
            self.checkpoints,
            self.failed_checkpoints,
            self.rows,
            self.restored_rows
        )
    }
}

#[derive(Default)]
struct Counters {
    transactions: AtomicU64,
    reads: AtomicU64,
    checkpoints: AtomicU64,
    failed_checkpoints: AtomicU64,
}

/// `<database>.snapshots`.
pub fn default_snapshot_dir(database: &Path) -> PathBuf {
    let mut name = OsString::from(database.as_os_str());
    name.push(".snapshots");
    PathBuf::from(name)
}

/// Run the stress harness against `database` and verify the result.
pub fn run_torture(
    database: &Path,
    options: &TortureOptions,
    config: &DatabaseConfig,
) -> Result<TortureReport, WalsnapError> {
    let db = Database::open_with_config(database, config)?;
    db.execute_batch(
        "CREATE TABLE IF NOT EXISTS torture (
            id INTEGER PRIMARY KEY,
            writer INTEGER NOT NULL,
            payload BLOB NOT NULL
        )",
    )?;
    db.transaction(|db| {
        for _ in 0..SEED_ROWS {
            insert_random(db, -1)?;
        }
        Ok(())
    })?;
    info!(database = %db.path().display(), rows = SEED_ROWS, "seeded");

    let snapshot_dir = options
        .snapshot_dir
        .clone()
        .unwrap_or_else(|| default_snapshot_dir(db.path()));
    db.set_snapshot_directory(&snapshot_dir, options.full_delay)?;

    let writers = (options.threads / 2).max(1);
    let readers = options.threads.saturating_sub(writers);
    let stop = AtomicBool::new(false);
    let counters = Counters::default();
    let deadline = Instant::now() + options.duration;

    thread::scope(|scope| -> Result<(), WalsnapError> {
        let checkpointer =
            scope.spawn(|| checkpoint_loop(&db, options.checkpoint_interval, &stop, &counters));
        let writer_handles: Vec<_> = (0..writers)
            .map(|id| {
                let (db, stop, counters) = (&db, &stop, &counters);
                scope.spawn(move || write_loop(db, id as i64, stop, counters))
            })
            .collect();
        let reader_handles: Vec<_> = (0..readers)
            .map(|_| scope.spawn(|| read_loop(&db, &stop, &counters)))
            .collect();

        while Instant::now() < deadline {
            if writer_handles.iter().all(|h| h.is_finished()) {
                break;
            }
            thread::sleep(Duration::from_millis(10).min(options.duration));
        }
        stop.store(true, Ordering::Release);

        let mut outcome = Ok(());
        for handle in writer_handles.into_iter().chain(reader_handles) {
            let result = handle
                .join()
                .unwrap_or_else(|_| Err(WalsnapError::Internal("worker thread panicked".into())));
            outcome = outcome.and(result);
        }
        checkpointer
            .join()
            .map_err(|_| WalsnapError::Internal("checkpoint thread panicked".into()))?;
        outcome
    })?;

    db.checkpoint_snapshot(false)?;
    counters.checkpoints.fetch_add(1, Ordering::Relaxed);

    let rows = count_rows(&db)?;
    let restored_rows = verify_restore(&db, &snapshot_dir)?;

    let report = TortureReport {
        rows,
        transactions: counters.transactions.load(Ordering::Relaxed),
        reads: counters.reads.load(Ordering::Relaxed),
        checkpoints: counters.checkpoints.load(Ordering::Relaxed),
        failed_checkpoints: counters.failed_checkpoints.load(Ordering::Relaxed),
        restored_rows,
    };
    db.close()?;

    if report.rows != report.restored_rows {
        error!(live = report.rows, restored = report.restored_rows, "row count mismatch");
        return Err(WalsnapError::Internal(format!(
            "restored snapshot has {} rows, live database has {}",
            report.restored_rows, report.rows
        )));
    }
    info!(%report, "torture run passed");
    Ok(report)
}

fn insert_random(db: &Database, writer: i64) -> Result<(), WalsnapError> {
    let mut rng = rand::thread_rng();
    let mut payload = vec![0u8; rng.gen_range(1..=MAX_PAYLOAD)];
    rng.fill(&mut payload[..]);
    db.execute(
        "INSERT INTO torture (writer, payload) VALUES (?1, ?2)",
        params![writer, payload],
    )?;
    Ok(())
}

fn write_loop(
    db: &Database,
    id: i64,
    stop: &AtomicBool,
    counters: &Counters,
) -> Result<(), WalsnapError> {
    while !stop.load(Ordering::Acquire) {
        let batch = rand::thread_rng().gen_range(1..=MAX_BATCH);
        db.transaction(|db| {
            for _ in 0..batch {
                insert_random(db, id)?;
            }
            Ok(())
        })?;
        counters.transactions.fetch_add(1, Ordering::Relaxed);
    }
    debug!(writer = id, "writer stopped");
    Ok(())
}

fn read_loop(db: &Database, stop: &AtomicBool, counters: &Counters) -> Result<(), WalsnapError> {
    while !stop.load(Ordering::Acquire) {
        let _bytes: i64 = db.query_row(
            "SELECT COALESCE(SUM(LENGTH(payload)), 0) FROM torture",
            [],
            |row| row.get(0),
        )?;
        counters.reads.fetch_add(1, Ordering::Relaxed);
        thread::yield_now();
    }
    Ok(())
}

/// Checkpoint failures are counted and logged, never fatal; the engine
/// recovers by starting a new chain.
fn checkpoint_loop(db: &Database, interval: Duration, stop: &AtomicBool, counters: &Counters) {
    while !stop.load(Ordering::Acquire) {
        thread::sleep(interval);
        match db.checkpoint_snapshot(false) {
            Ok(()) => {
                counters.checkpoints.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                counters.failed_checkpoints.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, "checkpoint failed");
            }
        }
    }
}

fn count_rows(db: &Database) -> Result<u64, WalsnapError> {
    let rows: i64 = db.query_row("SELECT COUNT(*) FROM torture", [], |row| row.get(0))?;
    Ok(rows.max(0) as u64)
}

fn verify_restore(db: &Database, snapshot_dir: &Path) -> Result<u64, WalsnapError> {
    let files = list_snapshot_files(snapshot_dir)?;
    let snapshots = collect_snapshots(&files)?;
    let snapshot = snapshots.get(db.path()).ok_or_else(|| {
        WalsnapError::Internal(format!("no snapshot found for {}", db.path().display()))
    })?;

    let scratch = tempfile::Builder::new()
        .prefix("walsnap-torture")
        .tempdir()
        .map_err(|e| WalsnapError::io("create scratch directory", e))?;
    let dest = scratch.path().join("restored.db");
    restore_snapshot(snapshot, &dest, false)?;

    let conn = Connection::open_with_flags(&dest, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .map_err(WalsnapError::storage)?;
    let rows: i64 = conn
        .query_row("SELECT COUNT(*) FROM torture", [], |row| row.get(0))
        .map_err(WalsnapError::storage)?;
    debug!(dest = %dest.display(), rows, "restored copy counted");
    Ok(rows.max(0) as u64)
}
