// SPDX-FileCopyrightText: 2026 Walsnap Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `walsnap restore`: rebuild databases from their snapshot history.

use std::fs;
use std::path::{Component, Path, PathBuf};

use tracing::{info, warn};

use walsnap_core::{WalsnapError, format_millis};
use walsnap_storage::{
    SnapshotInfo, collect_snapshots, list_snapshot_files, restore_snapshot, restore_snapshot_at,
};

/// Which state of a database to restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointInTime {
    Latest,
    /// Last frame sealed at or before this Unix time in milliseconds.
    At(i64),
}

#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    pub output_dir: Option<PathBuf>,
    pub dry_run: bool,
    pub force: bool,
    pub at: Option<PointInTime>,
}

/// Parse `--at`: `latest` or whole Unix seconds.
///
/// Seconds cover the entire second, so `--at 10` includes frames sealed
/// at 10.999.
pub fn parse_point_in_time(value: &str) -> Result<PointInTime, String> {
    if value.eq_ignore_ascii_case("latest") {
        return Ok(PointInTime::Latest);
    }
    let secs: i64 = value
        .parse()
        .map_err(|_| format!("expected Unix seconds or 'latest', got '{value}'"))?;
    secs.checked_mul(1000)
        .and_then(|ms| ms.checked_add(999))
        .map(PointInTime::At)
        .ok_or_else(|| format!("timestamp {secs} is out of range"))
}

/// Map an original database path to a relative path under an output
/// directory. Root and prefix components are dropped, `.` is skipped
/// and `..` becomes `__`.
pub fn sanitize_path(path: &Path) -> PathBuf {
    path.components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(PathBuf::from(part)),
            Component::ParentDir => Some(PathBuf::from("__")),
            Component::RootDir | Component::Prefix(_) | Component::CurDir => None,
        })
        .collect()
}

/// Run the `walsnap restore` command.
pub fn run_restore(path: &Path, options: &RestoreOptions) -> Result<(), WalsnapError> {
    if options.output_dir.is_none() && !options.force {
        return Err(WalsnapError::Config(
            "restoring to the original paths requires --force (or use --output-dir)".into(),
        ));
    }

    let files = list_snapshot_files(path)?;
    let snapshots = collect_snapshots(&files)?;
    if snapshots.is_empty() {
        warn!(path = %path.display(), "no snapshots found");
        return Ok(());
    }

    for snapshot in snapshots.iter() {
        let dest = match &options.output_dir {
            Some(dir) => dir.join(sanitize_path(&snapshot.path)),
            None => snapshot.path.clone(),
        };
        restore_one(snapshot, &dest, options)?;
    }
    Ok(())
}

fn restore_one(
    snapshot: &SnapshotInfo,
    dest: &Path,
    options: &RestoreOptions,
) -> Result<(), WalsnapError> {
    let frame = match options.at {
        None | Some(PointInTime::Latest) => None,
        Some(PointInTime::At(ms)) => match snapshot.find_frame(ms) {
            Some(frame) => Some(frame),
            None => {
                warn!(
                    database = %snapshot.path.display(),
                    at = %format_millis(ms),
                    "no snapshot that old, skipping"
                );
                return Ok(());
            }
        },
    };

    if options.dry_run {
        let mtime = frame
            .map(|f| snapshot.frames[f].mtime)
            .unwrap_or(snapshot.mtime);
        info!(
            database = %snapshot.path.display(),
            dest = %dest.display(),
            state = %format_millis(mtime),
            "would restore"
        );
        return Ok(());
    }

    if let Some(parent) = dest.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| {
                WalsnapError::io(format!("create directory {}", parent.display()), e)
            })?;
        }
    }

    match frame {
        Some(frame) => restore_snapshot_at(snapshot, frame, dest, options.force)?,
        None => restore_snapshot(snapshot, dest, options.force)?,
    }
    info!(database = %snapshot.path.display(), dest = %dest.display(), "restored");
    Ok(())
}
