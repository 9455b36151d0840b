// SPDX-FileCopyrightText: 2026 Walsnap Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Replay a snapshot version into a fresh database file.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use rusqlite::{Connection, OpenFlags};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use walsnap_core::{Sha256Digest, WalsnapError};

use crate::collect::{SnapshotFrame, SnapshotInfo};
use crate::database::wal_path;
use crate::stream::splice_with_checksum;

/// Restore the most recent version of `snapshot` into `dest`.
///
/// Refuses to touch an existing `dest` unless `overwrite` is set. A failure
/// part-way may leave a partial database at `dest`.
pub fn restore_snapshot(
    snapshot: &SnapshotInfo,
    dest: &Path,
    overwrite: bool,
) -> Result<(), WalsnapError> {
    let version = snapshot.latest_version().ok_or_else(|| WalsnapError::Format {
        path: snapshot.path.clone(),
        message: "snapshot has no versions".to_string(),
    })?;
    replay(&snapshot.frames[version.frames.clone()], dest, overwrite)
}

/// Restore `snapshot` as of frame `frame`: its version's full copy plus
/// every WAL generation up to and including `frame`.
pub fn restore_snapshot_at(
    snapshot: &SnapshotInfo,
    frame: usize,
    dest: &Path,
    overwrite: bool,
) -> Result<(), WalsnapError> {
    let version = snapshot.version_of(frame).ok_or_else(|| {
        WalsnapError::Internal(format!(
            "frame {frame} is out of range for {}",
            snapshot.path.display()
        ))
    })?;
    replay(&snapshot.frames[version.frames.start..=frame], dest, overwrite)
}

fn replay(frames: &[SnapshotFrame], dest: &Path, overwrite: bool) -> Result<(), WalsnapError> {
    let Some((full, deltas)) = frames.split_first() else {
        return Err(WalsnapError::Internal("no frames to restore".into()));
    };

    let wal = wal_path(dest);
    prepare_destination(dest, &wal, overwrite)?;

    inflate_verified(full, dest, "database")?;
    debug!(dest = %dest.display(), sidecar = %full.file.display(), "full copy restored");

    let _cleanup = RemoveOnDrop(wal.clone());
    for frame in deltas {
        inflate_verified(frame, &wal, "WAL")?;
        replay_wal(dest)?;
        ensure_replayed(dest, &wal)?;
        debug!(index = frame.index, "WAL generation replayed");
    }

    info!(
        dest = %dest.display(),
        frames = frames.len(),
        "snapshot restored"
    );
    Ok(())
}

fn prepare_destination(dest: &Path, wal: &Path, overwrite: bool) -> Result<(), WalsnapError> {
    if fs::symlink_metadata(dest).is_ok() {
        if !overwrite {
            return Err(WalsnapError::RefuseOverwrite {
                path: dest.to_path_buf(),
            });
        }
        remove_if_exists(dest)?;
    }
    remove_if_exists(wal)
}

fn remove_if_exists(path: &Path) -> Result<(), WalsnapError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(WalsnapError::io(format!("remove {}", path.display()), e)),
    }
}

/// Decompress a sidecar into `target`, failing if its digest differs from
/// the frame record.
fn inflate_verified(
    frame: &SnapshotFrame,
    target: &Path,
    kind: &'static str,
) -> Result<(), WalsnapError> {
    let source = File::open(&frame.file)
        .map_err(|e| WalsnapError::io(format!("open sidecar {}", frame.file.display()), e))?;
    let out = File::create(target)
        .map_err(|e| WalsnapError::io(format!("create {}", target.display()), e))?;

    let mut reader = GzDecoder::new(source);
    let mut writer = BufWriter::new(out);
    let mut hasher = Sha256::new();
    splice_with_checksum(&mut reader, &mut writer, &mut hasher)
        .and_then(|_| writer.flush())
        .map_err(|e| WalsnapError::io(format!("inflate {}", frame.file.display()), e))?;

    let digest: [u8; 32] = hasher.finalize().into();
    if Sha256Digest(digest) != frame.sha256 {
        return Err(WalsnapError::ChecksumMismatch {
            kind,
            path: frame.file.clone(),
        });
    }
    Ok(())
}

/// Open and close `dest` so SQLite folds the `-wal` file into it.
fn replay_wal(dest: &Path) -> Result<(), WalsnapError> {
    let conn = Connection::open_with_flags(dest, OpenFlags::SQLITE_OPEN_READ_WRITE)
        .map_err(WalsnapError::storage)?;
    conn.query_row("PRAGMA user_version", [], |row| row.get::<_, i64>(0))
        .map_err(WalsnapError::storage)?;
    conn.close().map_err(|(_, e)| WalsnapError::storage(e))
}

/// SQLite deletes the `-wal` file once it has checkpointed it on close.
fn ensure_replayed(dest: &Path, wal: &Path) -> Result<(), WalsnapError> {
    if wal.exists() {
        return Err(WalsnapError::WalNotReplayed {
            path: dest.to_path_buf(),
        });
    }
    Ok(())
}

struct RemoveOnDrop(PathBuf);

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leftover_wal_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("restored.db");
        let wal = wal_path(&dest);

        ensure_replayed(&dest, &wal).unwrap();

        fs::write(&wal, b"unreplayed").unwrap();
        let err = ensure_replayed(&dest, &wal).unwrap_err();
        assert!(matches!(err, WalsnapError::WalNotReplayed { ref path } if path == &dest));
    }

    #[test]
    fn leftover_wal_is_removed_when_restore_stops() {
        let dir = tempfile::tempdir().unwrap();
        let wal = dir.path().join("restored.db-wal");
        fs::write(&wal, b"partial").unwrap();
        drop(RemoveOnDrop(wal.clone()));
        assert!(!wal.exists());
    }

    #[test]
    fn existing_destination_needs_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("taken.db");
        let wal = wal_path(&dest);
        fs::write(&dest, b"db").unwrap();
        fs::write(&wal, b"stale").unwrap();

        let err = prepare_destination(&dest, &wal, false).unwrap_err();
        assert!(matches!(err, WalsnapError::RefuseOverwrite { .. }));

        prepare_destination(&dest, &wal, true).unwrap();
        assert!(!dest.exists());
        assert!(!wal.exists());
    }
}
