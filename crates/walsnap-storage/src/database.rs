// SPDX-FileCopyrightText: 2026 Walsnap Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Database handle: one SQLite connection shared between threads.
//!
//! Writes run under the exclusive side of the handle's [`LockManager`],
//! reads under the shared side. The connection itself sits behind a
//! reentrant mutex so a thread that already holds the exclusive lock (for
//! example inside [`Database::transaction`]) can keep issuing statements.
//!
//! Lock order is fixed: lock manager, then connection, then snapshot state.
//! When snapshots are enabled, every write that leaves the connection in
//! autocommit mode is followed by a WAL mirror pass while the connection is
//! still held.

use std::cell::RefCell;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, ErrorCode, OpenFlags, Params, Row};
use tracing::{debug, error, warn};

use walsnap_config::DatabaseConfig;
use walsnap_core::WalsnapError;

use crate::checkpoint::SnapshotState;
use crate::lock::LockManager;

/// A SQLite database opened for shared use across threads.
pub struct Database {
    conn: ReentrantMutex<RefCell<Option<Connection>>>,
    pub(crate) lock: LockManager,
    path: PathBuf,
    pub(crate) snapshot: Mutex<Option<SnapshotState>>,
    pub(crate) checkpointing: Mutex<()>,
}

impl Database {
    /// Open (or create) a database with the default read-write flags.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WalsnapError> {
        Self::open_with_flags(path, OpenFlags::default())
    }

    pub fn open_with_flags(path: impl AsRef<Path>, flags: OpenFlags) -> Result<Self, WalsnapError> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(path, flags).map_err(WalsnapError::storage)?;
        let path = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        debug!(path = %path.display(), "database opened");

        Ok(Self {
            conn: ReentrantMutex::new(RefCell::new(Some(conn))),
            lock: LockManager::new(),
            path,
            snapshot: Mutex::new(None),
            checkpointing: Mutex::new(()),
        })
    }

    /// Open a database and apply the connection settings from `config`.
    pub fn open_with_config(
        path: impl AsRef<Path>,
        config: &DatabaseConfig,
    ) -> Result<Self, WalsnapError> {
        let db = Self::open(path)?;
        let synchronous = if config.synchronous_full { "FULL" } else { "NORMAL" };
        db.with_conn(|conn| {
            conn.busy_timeout(config.busy_timeout())?;
            run_pragma(conn, &format!("PRAGMA synchronous = {synchronous}"))?;
            Ok(())
        })?;
        Ok(db)
    }

    /// Canonical path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The lock manager guarding this handle.
    pub fn lock_manager(&self) -> &LockManager {
        &self.lock
    }

    /// Execute one statement and return the number of changed rows.
    pub fn execute<P: Params>(&self, sql: &str, params: P) -> Result<usize, WalsnapError> {
        let _guard = self.lock.exclusive();
        self.with_write_conn(|conn| conn.execute(sql, params))
    }

    /// Execute a batch of semicolon-separated statements.
    pub fn execute_batch(&self, sql: &str) -> Result<(), WalsnapError> {
        let _guard = self.lock.exclusive();
        self.with_write_conn(|conn| conn.execute_batch(sql))
    }

    /// Run a query expected to return at least one row and map the first.
    pub fn query_row<T, P, F>(&self, sql: &str, params: P, f: F) -> Result<T, WalsnapError>
    where
        P: Params,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        let _guard = self.lock.shared();
        self.with_conn(|conn| conn.query_row(sql, params, f))
    }

    /// Run `f` inside `BEGIN IMMEDIATE` / `COMMIT`, rolling back on error.
    ///
    /// Calls nested inside another transaction on the same thread run
    /// inline as part of the outer one.
    pub fn transaction<T, F>(&self, f: F) -> Result<T, WalsnapError>
    where
        F: FnOnce(&Database) -> Result<T, WalsnapError>,
    {
        let guard = self.lock.exclusive();
        if guard.is_nested() {
            return f(self);
        }

        self.with_write_conn(|conn| conn.execute_batch("BEGIN IMMEDIATE"))?;
        let outcome = f(self).and_then(|value| {
            self.with_write_conn(|conn| conn.execute_batch("COMMIT"))?;
            Ok(value)
        });
        if outcome.is_err() {
            let still_open = self.with_conn(|conn| Ok(!conn.is_autocommit())).unwrap_or(false);
            if still_open {
                if let Err(e) = self.with_write_conn(|conn| conn.execute_batch("ROLLBACK")) {
                    warn!(error = %e, "rollback failed");
                }
            }
        }
        outcome
    }

    pub fn user_version(&self) -> Result<i32, WalsnapError> {
        self.query_row("PRAGMA user_version", [], |row| row.get(0))
    }

    pub fn set_user_version(&self, version: i32) -> Result<(), WalsnapError> {
        let _guard = self.lock.exclusive();
        self.with_write_conn(|conn| {
            run_pragma(conn, &format!("PRAGMA user_version = {version}")).map(|_| ())
        })
    }

    /// Copy the live database to `dest` with SQLite's online backup API.
    pub fn backup_to(&self, dest: impl AsRef<Path>) -> Result<(), WalsnapError> {
        let dest = dest.as_ref();
        let _guard = self.lock.shared();
        let mut target = Connection::open(dest).map_err(WalsnapError::storage)?;
        self.with_conn(|conn| {
            let backup = rusqlite::backup::Backup::new(conn, &mut target)?;
            // 100 pages per step with a short pause keeps writers moving.
            backup.run_to_completion(100, Duration::from_millis(10), None)
        })?;
        debug!(dest = %dest.display(), "online backup complete");
        Ok(())
    }

    /// Checkpoint the WAL.
    ///
    /// With snapshots enabled this is `checkpoint_snapshot(false)`;
    /// otherwise a plain `FULL` checkpoint where contention is not an error.
    pub fn checkpoint(&self) -> Result<(), WalsnapError> {
        if self.snapshot.lock().is_some() {
            return self.checkpoint_snapshot(false);
        }

        let _guard = self.lock.exclusive();
        if !self.with_conn(|conn| wal_checkpoint(conn, "FULL"))? {
            debug!(path = %self.path.display(), "WAL checkpoint contended, skipped");
        }
        Ok(())
    }

    /// Take a final snapshot checkpoint, tear down snapshot state and close
    /// the connection. Closing twice is a no-op.
    ///
    /// Checkpoints stay blocked until the connection is gone: closing lets
    /// SQLite write the WAL back into the database file, which a concurrent
    /// full copy must not observe.
    pub fn close(&self) -> Result<(), WalsnapError> {
        let _serial = self.checkpointing.lock();
        if self.conn.lock().borrow().is_none() {
            return Ok(());
        }

        let mut result = Ok(());
        if self.snapshot.lock().is_some() {
            result = self.checkpoint_serialized(false);
        }

        let _guard = self.lock.exclusive();
        let conn_guard = self.conn.lock();
        if let Some(mut state) = self.snapshot.lock().take() {
            state.mirror.abandon();
            debug!(directory = %state.directory.display(), "snapshots disabled");
        }

        let conn = conn_guard.borrow_mut().take();
        if let Some(conn) = conn {
            if let Err((_, e)) = conn.close() {
                result = result.and(Err(WalsnapError::storage(e)));
            }
        }
        debug!(path = %self.path.display(), "database closed");
        result
    }

    /// Run `f` against the connection. Fails with `Closed` after `close`.
    pub(crate) fn with_connection<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, WalsnapError>,
    ) -> Result<T, WalsnapError> {
        let guard = self.conn.lock();
        let slot = guard.borrow();
        let conn = slot.as_ref().ok_or(WalsnapError::Closed)?;
        f(conn)
    }

    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, WalsnapError> {
        self.with_connection(|conn| f(conn).map_err(WalsnapError::storage))
    }

    /// Like [`Database::with_conn`], then mirror the WAL if the write
    /// committed.
    fn with_write_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, WalsnapError> {
        let guard = self.conn.lock();
        let slot = guard.borrow();
        let conn = slot.as_ref().ok_or(WalsnapError::Closed)?;
        let result = f(conn).map_err(WalsnapError::storage);
        if conn.is_autocommit() {
            self.mirror_wal();
        }
        result
    }

    /// WAL-append notification. A failure here never fails the write; it
    /// forces the next checkpoint to start a fresh chain instead.
    fn mirror_wal(&self) {
        let mut snapshot = self.snapshot.lock();
        if let Some(state) = snapshot.as_mut() {
            if let Err(e) = state.mirror.copy_wal() {
                error!(error = %e, "WAL mirror failed, next checkpoint restarts the snapshot chain");
                state.last_full = 0;
            }
        }
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(path = %self.path.display(), error = %e, "error closing database");
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .field("snapshots", &self.snapshot.lock().is_some())
            .finish_non_exhaustive()
    }
}

/// `<database>-wal`.
pub fn wal_path(database: &Path) -> PathBuf {
    let mut name = OsString::from(database.as_os_str());
    name.push("-wal");
    PathBuf::from(name)
}

/// Run a PRAGMA and return its first value as text, if it produced one.
pub(crate) fn run_pragma(conn: &Connection, sql: &str) -> rusqlite::Result<Option<String>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query([])?;
    let value = match rows.next()? {
        Some(row) => match row.get_ref(0)? {
            ValueRef::Text(text) => Some(String::from_utf8_lossy(text).into_owned()),
            ValueRef::Integer(n) => Some(n.to_string()),
            _ => None,
        },
        None => None,
    };
    Ok(value)
}

/// `PRAGMA wal_checkpoint(<mode>)`. `Ok(false)` means the engine reported
/// contention (busy result, `SQLITE_BUSY` or `SQLITE_LOCKED`).
pub(crate) fn wal_checkpoint(conn: &Connection, mode: &str) -> rusqlite::Result<bool> {
    let sql = format!("PRAGMA wal_checkpoint({mode})");
    match conn.query_row(&sql, [], |row| row.get::<_, i64>(0)) {
        Ok(busy) => Ok(busy == 0),
        Err(e) if is_contention(&e) => Ok(false),
        Err(e) => Err(e),
    }
}

fn is_contention(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (Database, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("test.db")).unwrap();
        (db, dir)
    }

    #[test]
    fn execute_and_query_round_trip() {
        let (db, _dir) = open_temp();
        db.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT);")
            .unwrap();
        let changed = db
            .execute("INSERT INTO t (v) VALUES (?1)", ["hello"])
            .unwrap();
        assert_eq!(changed, 1);
        let v: String = db
            .query_row("SELECT v FROM t WHERE id = 1", [], |row| row.get(0))
            .unwrap();
        assert_eq!(v, "hello");
    }

    #[test]
    fn transaction_rolls_back_on_error() {
        let (db, _dir) = open_temp();
        db.execute_batch("CREATE TABLE t (v INTEGER);").unwrap();

        let result: Result<(), WalsnapError> = db.transaction(|tx| {
            tx.execute("INSERT INTO t VALUES (1)", [])?;
            Err(WalsnapError::Internal("abort".into()))
        });
        assert!(result.is_err());

        let count: i64 = db
            .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn nested_transaction_joins_outer() {
        let (db, _dir) = open_temp();
        db.execute_batch("CREATE TABLE t (v INTEGER);").unwrap();

        db.transaction(|tx| {
            tx.execute("INSERT INTO t VALUES (1)", [])?;
            tx.transaction(|inner| inner.execute("INSERT INTO t VALUES (2)", []))?;
            Ok(())
        })
        .unwrap();

        let count: i64 = db
            .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn user_version_round_trip() {
        let (db, _dir) = open_temp();
        assert_eq!(db.user_version().unwrap(), 0);
        db.set_user_version(7).unwrap();
        assert_eq!(db.user_version().unwrap(), 7);
    }

    #[test]
    fn closed_handle_rejects_statements() {
        let (db, _dir) = open_temp();
        db.close().unwrap();
        db.close().unwrap();
        let err = db.execute_batch("SELECT 1;").unwrap_err();
        assert!(matches!(err, WalsnapError::Closed));
    }

    #[test]
    fn backup_copies_rows() {
        let (db, dir) = open_temp();
        db.execute_batch("CREATE TABLE t (v INTEGER); INSERT INTO t VALUES (5);")
            .unwrap();
        let copy = dir.path().join("copy.db");
        db.backup_to(&copy).unwrap();

        let conn = Connection::open(&copy).unwrap();
        let v: i64 = conn.query_row("SELECT v FROM t", [], |row| row.get(0)).unwrap();
        assert_eq!(v, 5);
    }

    #[test]
    fn direct_checkpoint_without_snapshots() {
        let (db, _dir) = open_temp();
        db.execute_batch("CREATE TABLE t (v INTEGER); INSERT INTO t VALUES (1);")
            .unwrap();
        db.checkpoint().unwrap();
        db.checkpoint().unwrap();
    }

    #[test]
    fn config_applies_connection_settings() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            busy_timeout_ms: 250,
            synchronous_full: false,
        };
        let db = Database::open_with_config(dir.path().join("c.db"), &config).unwrap();
        let sync: i64 = db
            .query_row("PRAGMA synchronous", [], |row| row.get(0))
            .unwrap();
        assert_eq!(sync, 1, "NORMAL");
    }

    #[test]
    fn wal_path_appends_suffix() {
        assert_eq!(wal_path(Path::new("/a/b.db")), PathBuf::from("/a/b.db-wal"));
    }
}
