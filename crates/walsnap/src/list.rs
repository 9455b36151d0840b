// SPDX-FileCopyrightText: 2026 Walsnap Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `walsnap list`: print the snapshot history found in main streams.

use std::io::{self, Write};
use std::path::Path;

use tracing::debug;

use walsnap_core::{WalsnapError, format_millis};
use walsnap_storage::{SnapshotSet, collect_snapshots, list_snapshot_files};

/// Run the `walsnap list` command.
pub fn run_list(path: &Path, verbose: u8) -> Result<(), WalsnapError> {
    let files = list_snapshot_files(path)?;
    debug!(path = %path.display(), files = files.len(), "collecting snapshots");
    let snapshots = collect_snapshots(&files)?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    write_listing(&mut out, &snapshots, verbose)
        .and_then(|()| out.flush())
        .map_err(|e| WalsnapError::io("write listing", e))
}

/// Render `snapshots` at the given verbosity.
///
/// 0 prints one line per database, 1 adds its versions, 2 adds every
/// frame and 3 adds the frame digests.
pub fn write_listing<W: Write>(out: &mut W, snapshots: &SnapshotSet, verbose: u8) -> io::Result<()> {
    for snapshot in snapshots.iter() {
        writeln!(out, "{}", snapshot.path.display())?;
        writeln!(out, "  created: {}", format_millis(snapshot.ctime))?;
        writeln!(out, "  last:    {}", format_millis(snapshot.mtime))?;
        if verbose == 0 {
            continue;
        }

        for version in &snapshot.versions {
            writeln!(
                out,
                "  version {} ({} frames)",
                version.stream.display(),
                version.frames.len()
            )?;
            writeln!(
                out,
                "    {} .. {}",
                format_millis(version.ctime),
                format_millis(version.mtime)
            )?;
            if verbose < 2 {
                continue;
            }

            for frame in &snapshot.frames[version.frames.clone()] {
                let kind = if frame.is_full() { "full" } else { "wal" };
                write!(
                    out,
                    "    frame {:>4} {kind:<4} {}",
                    frame.index,
                    format_millis(frame.mtime)
                )?;
                if verbose >= 3 {
                    write!(out, " {}", frame.sha256)?;
                }
                writeln!(out)?;
            }
        }
    }
    Ok(())
}
