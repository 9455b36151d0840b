// SPDX-FileCopyrightText: 2026 Walsnap Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! SQLite handle with a reader/writer lock manager and live, incremental,
//! checksum-verified snapshots of the write-ahead log.
//!
//! A [`Database`] mirrors every committed WAL append into a gzip sidecar.
//! [`Database::checkpoint_snapshot`] seals those sidecars into an
//! append-only `.dbsnap` main stream. Offline, [`collect_snapshots`]
//! rebuilds the history from main streams and [`restore_snapshot`] replays
//! it into a new database file.

pub mod checkpoint;
pub mod collect;
pub mod database;
pub mod format;
pub mod lock;
pub mod mirror;
pub mod restore;
pub mod stream;

pub use collect::{
    SnapshotFrame, SnapshotInfo, SnapshotSet, SnapshotVersion, collect_snapshots,
    list_snapshot_files,
};
pub use database::{Database, wal_path};
pub use lock::{ExclusiveGuard, LockManager, SharedGuard};
pub use restore::{restore_snapshot, restore_snapshot_at};
pub use stream::sidecar_path;
