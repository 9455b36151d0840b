// SPDX-FileCopyrightText: 2026 Walsnap Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Snapshot checkpoints: full copies, WAL generations and the main stream.
//!
//! A snapshot chain is one main stream plus its sidecars. Sidecar 0 is a
//! gzip copy of the database file; every later sidecar holds the WAL bytes
//! written between two checkpoints. A checkpoint either starts a new chain
//! (forced, first run, or the full copy is older than `full_delay`) or
//! seals the current generation and truncates the WAL.
//!
//! With WAL auto-checkpointing disabled the database file only changes when
//! this module checkpoints it, so the full copy can be taken without
//! blocking writers. Everything after that runs under the exclusive lock.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::Connection;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use walsnap_config::SnapshotConfig;
use walsnap_core::{Sha256Digest, WalsnapError, now_millis};

use crate::database::{Database, run_pragma, wal_checkpoint, wal_path};
use crate::format::FrameData;
use crate::mirror::WalMirror;
use crate::stream::{
    MainStream, SidecarWriter, remove_stale_sidecars, sidecar_path, splice_with_checksum,
};

/// Per-handle snapshot bookkeeping. Mutated under the exclusive lock, plus
/// the WAL mirror on the write path.
pub(crate) struct SnapshotState {
    pub(crate) directory: PathBuf,
    pub(crate) full_delay: Duration,
    pub(crate) main: Option<MainStream>,
    pub(crate) generation: u64,
    /// Unix ms of the last full copy. Zero forces a new chain.
    pub(crate) last_full: i64,
    pub(crate) mirror: WalMirror,
}

impl SnapshotState {
    fn full_copy_expired(&self, now: i64) -> bool {
        let delay = i64::try_from(self.full_delay.as_millis()).unwrap_or(i64::MAX);
        now.saturating_sub(self.last_full) >= delay
    }
}

impl Database {
    /// Enable snapshots into `directory` and take the first full copy.
    ///
    /// Switches the connection to exclusive locking and WAL journaling and
    /// disables auto-vacuum, cache spill and WAL auto-checkpointing. Fails
    /// with [`WalsnapError::SnapshotConfigured`] if called twice.
    pub fn set_snapshot_directory(
        &self,
        directory: impl AsRef<Path>,
        full_delay: Duration,
    ) -> Result<(), WalsnapError> {
        let directory = directory.as_ref();
        {
            let _guard = self.lock.exclusive();
            if self.snapshot.lock().is_some() {
                return Err(WalsnapError::SnapshotConfigured);
            }

            fs::create_dir_all(directory).map_err(|e| {
                WalsnapError::io(format!("create snapshot directory {}", directory.display()), e)
            })?;
            let directory = fs::canonicalize(directory).map_err(|e| {
                WalsnapError::io(format!("resolve snapshot directory {}", directory.display()), e)
            })?;

            let journal_mode = self.with_conn(|conn| {
                run_pragma(conn, "PRAGMA locking_mode = EXCLUSIVE")?;
                let mode = run_pragma(conn, "PRAGMA journal_mode = WAL")?;
                run_pragma(conn, "PRAGMA auto_vacuum = 0")?;
                run_pragma(conn, "PRAGMA cache_spill = false")?;
                run_pragma(conn, "PRAGMA wal_autocheckpoint = 0")?;
                Ok(mode)
            })?;
            if !journal_mode.as_deref().is_some_and(|m| m.eq_ignore_ascii_case("wal")) {
                return Err(WalsnapError::Internal(format!(
                    "could not switch {} to WAL journaling (journal_mode = {journal_mode:?})",
                    self.path().display()
                )));
            }

            info!(
                database = %self.path().display(),
                directory = %directory.display(),
                full_delay_secs = full_delay.as_secs(),
                "snapshots enabled"
            );
            *self.snapshot.lock() = Some(SnapshotState {
                directory,
                full_delay,
                main: None,
                generation: 0,
                last_full: 0,
                mirror: WalMirror::new(wal_path(self.path())),
            });
        }

        self.checkpoint_snapshot(true)
    }

    /// Enable snapshots from configuration.
    ///
    /// Returns `false` without doing anything when no directory is set.
    pub fn enable_snapshots(&self, config: &SnapshotConfig) -> Result<bool, WalsnapError> {
        match &config.directory {
            Some(directory) => {
                self.set_snapshot_directory(directory, config.full_delay())?;
                Ok(true)
            }
            None => {
                debug!("no snapshot directory configured");
                Ok(false)
            }
        }
    }

    /// Checkpoint the database into its snapshot chain.
    ///
    /// Starts a new chain when `restart` is set, when none exists yet, or
    /// when the last full copy is older than the configured delay. Engine
    /// contention is not an error: the WAL is left alone and the next call
    /// starts a new chain. Any failure also forces a new chain next time.
    pub fn checkpoint_snapshot(&self, restart: bool) -> Result<(), WalsnapError> {
        let _serial = self.checkpointing.lock();
        self.checkpoint_serialized(restart)
    }

    /// [`Database::checkpoint_snapshot`] body. The caller holds
    /// `checkpointing`.
    pub(crate) fn checkpoint_serialized(&self, restart: bool) -> Result<(), WalsnapError> {
        let now = now_millis();

        let (restart, directory) = {
            let snapshot = self.snapshot.lock();
            let state = snapshot.as_ref().ok_or(WalsnapError::SnapshotDisabled)?;
            let restart = restart || state.main.is_none() || state.full_copy_expired(now);
            (restart, state.directory.clone())
        };

        let result = if restart {
            self.start_chain(&directory, now)
        } else {
            self.continue_chain()
        };

        if let Err(e) = &result {
            error!(
                database = %self.path().display(),
                error = %e,
                "snapshot checkpoint failed, next checkpoint starts a new chain"
            );
            if let Some(state) = self.snapshot.lock().as_mut() {
                state.last_full = 0;
            }
        }
        result
    }

    /// Directory receiving snapshot files, if snapshots are enabled.
    pub fn snapshot_directory(&self) -> Option<PathBuf> {
        self.snapshot.lock().as_ref().map(|s| s.directory.clone())
    }

    /// Main stream of the current chain, if one was started.
    pub fn snapshot_stream(&self) -> Option<PathBuf> {
        let snapshot = self.snapshot.lock();
        snapshot
            .as_ref()
            .and_then(|s| s.main.as_ref())
            .map(|m| m.path().to_path_buf())
    }

    /// Index of the generation currently receiving WAL bytes.
    pub fn snapshot_generation(&self) -> Option<u64> {
        self.snapshot.lock().as_ref().map(|s| s.generation)
    }

    fn start_chain(&self, directory: &Path, now: i64) -> Result<(), WalsnapError> {
        let main = MainStream::create_random(directory, self.path())?;
        let stream = main.path().to_path_buf();
        let mut installed = false;

        let result = self.install_chain(main, now, &mut installed);
        if result.is_err() && !installed {
            discard_chain(&stream);
        }
        result
    }

    /// Take the full copy into `main` and make it the current chain.
    /// `installed` is set once the handle owns the stream.
    fn install_chain(
        &self,
        mut main: MainStream,
        now: i64,
        installed: &mut bool,
    ) -> Result<(), WalsnapError> {
        let digest = copy_database(self.path(), &sidecar_path(main.path(), 0))?;
        main.append_frame(&FrameData {
            mtime: now_millis(),
            sha256: digest,
        })?;

        let _guard = self.lock.exclusive();
        self.with_snapshot_conn(|conn, state| {
            let removed = remove_stale_sidecars(main.path())?;
            if removed > 0 {
                debug!(removed, "removed stale sidecars");
            }

            // The full copy reflects the database file as of the last WAL
            // truncation; generation 1 starts with the whole current WAL.
            // Starting it also deletes the superseded chain's open sidecar.
            state.mirror.start(&sidecar_path(main.path(), 1))?;
            info!(stream = %main.path().display(), "started snapshot chain");
            state.main = Some(main);
            state.generation = 1;
            state.last_full = now;
            *installed = true;
            state.mirror.copy_wal()?;

            seal_generation(conn, state)
        })
    }

    fn continue_chain(&self) -> Result<(), WalsnapError> {
        let _guard = self.lock.exclusive();
        self.with_snapshot_conn(|conn, state| {
            state.mirror.copy_wal()?;
            seal_generation(conn, state)
        })
    }

    fn with_snapshot_conn<T>(
        &self,
        f: impl FnOnce(&Connection, &mut SnapshotState) -> Result<T, WalsnapError>,
    ) -> Result<T, WalsnapError> {
        self.with_connection(|conn| {
            let mut snapshot = self.snapshot.lock();
            let state = snapshot.as_mut().ok_or(WalsnapError::SnapshotDisabled)?;
            f(conn, state)
        })
    }
}

/// Truncate the WAL and, if the open generation received bytes, seal it
/// into the main stream and open the next one.
fn seal_generation(conn: &Connection, state: &mut SnapshotState) -> Result<(), WalsnapError> {
    if !wal_checkpoint(conn, "TRUNCATE").map_err(WalsnapError::storage)? {
        debug!("WAL checkpoint contended, next checkpoint starts a new chain");
        state.last_full = 0;
        return Ok(());
    }

    if !state.mirror.is_dirty() {
        return Ok(());
    }

    let digest = state
        .mirror
        .finish()?
        .ok_or_else(|| WalsnapError::Internal("no open snapshot generation".into()))?;
    let main = state
        .main
        .as_mut()
        .ok_or_else(|| WalsnapError::Internal("no snapshot main stream".into()))?;
    main.append_frame(&FrameData {
        mtime: now_millis(),
        sha256: digest,
    })?;
    let sealed = state.generation;
    let next = sidecar_path(main.path(), sealed + 1);

    state.generation = sealed + 1;
    state.mirror.start(&next)?;
    debug!(generation = sealed, digest = %digest, "sealed snapshot generation");
    Ok(())
}

/// Delete a chain that never became current: its main stream, full copy
/// and any generation sidecars.
fn discard_chain(stream: &Path) {
    let full = sidecar_path(stream, 0);
    for path in [full.as_path(), stream] {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "could not remove unused snapshot file"),
        }
    }
    if let Err(e) = remove_stale_sidecars(stream) {
        warn!(stream = %stream.display(), error = %e, "could not remove unused sidecars");
    }
    debug!(stream = %stream.display(), "discarded unfinished snapshot chain");
}

/// Gzip the database file into an atomically renamed sidecar, returning
/// the SHA-256 of the uncompressed bytes.
fn copy_database(database: &Path, target: &Path) -> Result<Sha256Digest, WalsnapError> {
    let mut source = File::open(database)
        .map_err(|e| WalsnapError::io(format!("open database {}", database.display()), e))?;
    let mut sidecar = SidecarWriter::create_atomic(target)?;
    let mut hasher = Sha256::new();
    let bytes = splice_with_checksum(&mut source, &mut sidecar, &mut hasher)
        .map_err(|e| WalsnapError::io(format!("copy database {}", database.display()), e))?;
    sidecar.finish()?;
    debug!(bytes, target = %target.display(), "full database copy written");

    let digest: [u8; 32] = hasher.finalize().into();
    Ok(Sha256Digest(digest))
}
