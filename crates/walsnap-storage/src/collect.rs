// SPDX-FileCopyrightText: 2026 Walsnap Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Rebuild snapshot history from main stream files.
//!
//! Each main stream is one *version* of the database it names in its
//! header. Versions of the same database are grouped into a
//! [`SnapshotInfo`], ordered by the time of their full copy, and their
//! frames are laid out in that order so frame indexes grow with time.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::ops::Range;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use walsnap_core::{Sha256Digest, WalsnapError};

use crate::format::{FRAME_LEN, FrameData, HEADER_LEN, SnapshotHeader, decode_path, read_full};
use crate::stream::{MAIN_STREAM_EXTENSION, sidecar_path};

/// One sealed sidecar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFrame {
    /// Position within its version; 0 is the full copy.
    pub index: u64,
    pub mtime: i64,
    pub sha256: Sha256Digest,
    /// Sidecar file holding the compressed bytes.
    pub file: PathBuf,
}

impl SnapshotFrame {
    pub fn is_full(&self) -> bool {
        self.index == 0
    }
}

/// One main stream: a full copy followed by WAL generations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotVersion {
    pub stream: PathBuf,
    pub ctime: i64,
    pub mtime: i64,
    /// Range into [`SnapshotInfo::frames`].
    pub frames: Range<usize>,
}

/// Every version found for one database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    /// Original database path, as recorded in the stream headers.
    pub path: PathBuf,
    pub ctime: i64,
    pub mtime: i64,
    /// Sorted by `ctime`, oldest first.
    pub versions: Vec<SnapshotVersion>,
    pub frames: Vec<SnapshotFrame>,
}

impl SnapshotInfo {
    pub fn latest_version(&self) -> Option<&SnapshotVersion> {
        self.versions.last()
    }

    /// The version owning frame `frame`.
    pub fn version_of(&self, frame: usize) -> Option<&SnapshotVersion> {
        self.versions.iter().find(|v| v.frames.contains(&frame))
    }

    /// Index of the last frame sealed at or before `mtime` (Unix ms).
    pub fn find_frame(&self, mtime: i64) -> Option<usize> {
        self.frames
            .iter()
            .enumerate()
            .filter(|(_, frame)| frame.mtime <= mtime)
            .map(|(index, _)| index)
            .last()
    }
}

/// Snapshots keyed by original database path.
#[derive(Debug, Default, Clone)]
pub struct SnapshotSet {
    snapshots: BTreeMap<PathBuf, SnapshotInfo>,
}

impl SnapshotSet {
    pub fn get(&self, database: &Path) -> Option<&SnapshotInfo> {
        self.snapshots.get(database)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SnapshotInfo> {
        self.snapshots.values()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

impl IntoIterator for SnapshotSet {
    type Item = SnapshotInfo;
    type IntoIter = std::collections::btree_map::IntoValues<PathBuf, SnapshotInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.snapshots.into_values()
    }
}

struct ScannedVersion {
    stream: PathBuf,
    frames: Vec<SnapshotFrame>,
}

/// Read every main stream in `paths` and group the versions by database.
///
/// Fails on unreadable files and on foreign or future-format files. A file
/// whose header is cut short is skipped, and a version stops at a
/// truncated frame record, both with a warning.
pub fn collect_snapshots<P: AsRef<Path>>(paths: &[P]) -> Result<SnapshotSet, WalsnapError> {
    let mut scanned: BTreeMap<PathBuf, Vec<ScannedVersion>> = BTreeMap::new();

    for path in paths {
        let path = path.as_ref();
        let Some((database, version)) = scan_stream(path)? else {
            continue;
        };
        if version.frames.is_empty() {
            warn!(stream = %path.display(), "snapshot stream has no frames, skipping");
            continue;
        }
        scanned.entry(database).or_default().push(version);
    }

    let snapshots = scanned
        .into_iter()
        .map(|(database, versions)| {
            let info = assemble(database.clone(), versions);
            (database, info)
        })
        .collect();
    Ok(SnapshotSet { snapshots })
}

fn scan_stream(path: &Path) -> Result<Option<(PathBuf, ScannedVersion)>, WalsnapError> {
    let file = File::open(path)
        .map_err(|e| WalsnapError::io(format!("open snapshot {}", path.display()), e))?;
    let mut reader = BufReader::new(file);
    let read_err = |e| WalsnapError::io(format!("read snapshot {}", path.display()), e);

    let mut header_buf = [0u8; HEADER_LEN];
    if read_full(&mut reader, &mut header_buf).map_err(read_err)? < HEADER_LEN {
        warn!(stream = %path.display(), "truncated snapshot header, skipping");
        return Ok(None);
    }
    let header = SnapshotHeader::decode(&header_buf);
    header.validate(path)?;

    // The length comes from disk; read at most what the file holds.
    let path_len = u64::from(header.path_len.unsigned_abs());
    let mut path_buf = Vec::new();
    (&mut reader)
        .take(path_len)
        .read_to_end(&mut path_buf)
        .map_err(read_err)?;
    if (path_buf.len() as u64) < path_len {
        warn!(stream = %path.display(), "truncated database path, skipping");
        return Ok(None);
    }
    let database = decode_path(&path_buf);

    let mut frames = Vec::new();
    let mut frame_buf = [0u8; FRAME_LEN];
    loop {
        let n = read_full(&mut reader, &mut frame_buf).map_err(read_err)?;
        if n == 0 {
            break;
        }
        if n < FRAME_LEN {
            warn!(
                stream = %path.display(),
                frames = frames.len(),
                "truncated frame record, ignoring the rest of the stream"
            );
            break;
        }
        let record = FrameData::decode(&frame_buf);
        let index = frames.len() as u64;
        frames.push(SnapshotFrame {
            index,
            mtime: record.mtime,
            sha256: record.sha256,
            file: sidecar_path(path, index),
        });
    }

    debug!(
        stream = %path.display(),
        database = %database.display(),
        frames = frames.len(),
        "scanned snapshot stream"
    );
    Ok(Some((
        database,
        ScannedVersion {
            stream: path.to_path_buf(),
            frames,
        },
    )))
}

fn assemble(path: PathBuf, mut versions: Vec<ScannedVersion>) -> SnapshotInfo {
    versions.sort_by_key(|v| v.frames.first().map(|f| f.mtime).unwrap_or_default());

    let mut info = SnapshotInfo {
        path,
        ctime: i64::MAX,
        mtime: i64::MIN,
        versions: Vec::with_capacity(versions.len()),
        frames: Vec::new(),
    };
    for version in versions {
        let ctime = version.frames.first().map(|f| f.mtime).unwrap_or_default();
        let mtime = version.frames.last().map(|f| f.mtime).unwrap_or_default();
        let start = info.frames.len();
        info.frames.extend(version.frames);

        info.ctime = info.ctime.min(ctime);
        info.mtime = info.mtime.max(mtime);
        info.versions.push(SnapshotVersion {
            stream: version.stream,
            ctime,
            mtime,
            frames: start..info.frames.len(),
        });
    }
    info
}

/// Resolve a CLI argument to main stream files: the path itself if it is a
/// file, otherwise every `*.dbsnap` file in the directory, sorted.
pub fn list_snapshot_files(path: &Path) -> Result<Vec<PathBuf>, WalsnapError> {
    let metadata = fs::metadata(path)
        .map_err(|e| WalsnapError::io(format!("stat {}", path.display()), e))?;
    if !metadata.is_dir() {
        return Ok(vec![path.to_path_buf()]);
    }

    let entries = fs::read_dir(path)
        .map_err(|e| WalsnapError::io(format!("list {}", path.display()), e))?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| WalsnapError::io(format!("list {}", path.display()), e))?;
        let candidate = entry.path();
        let is_stream = candidate
            .extension()
            .is_some_and(|ext| ext == MAIN_STREAM_EXTENSION);
        if is_stream && candidate.is_file() {
            files.push(candidate);
        }
    }

    if files.is_empty() {
        return Err(WalsnapError::Format {
            path: path.to_path_buf(),
            message: format!("no .{MAIN_STREAM_EXTENSION} files found"),
        });
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tracing_test::traced_test;

    use super::*;
    use crate::format::{SnapshotHeader, encode_path};

    fn write_stream(dir: &Path, name: &str, database: &str, mtimes: &[i64]) -> PathBuf {
        let path = dir.join(name);
        let mut file = File::create(&path).unwrap();
        let db = encode_path(Path::new(database));
        file.write_all(&SnapshotHeader::new(db.len()).unwrap().encode())
            .unwrap();
        file.write_all(&db).unwrap();
        for (i, mtime) in mtimes.iter().enumerate() {
            let frame = FrameData {
                mtime: *mtime,
                sha256: Sha256Digest([i as u8; 32]),
            };
            file.write_all(&frame.encode()).unwrap();
        }
        path
    }

    #[test]
    fn versions_are_sorted_and_frames_follow_them() {
        let dir = tempfile::tempdir().unwrap();
        let newer = write_stream(dir.path(), "b.dbsnap", "/db/app.db", &[500, 600]);
        let older = write_stream(dir.path(), "a.dbsnap", "/db/app.db", &[100, 200, 300]);

        let set = collect_snapshots(&[&newer, &older]).unwrap();
        assert_eq!(set.len(), 1);
        let info = set.get(Path::new("/db/app.db")).unwrap();

        assert_eq!(info.ctime, 100);
        assert_eq!(info.mtime, 600);
        assert_eq!(info.versions[0].stream, older);
        assert_eq!(info.versions[0].frames, 0..3);
        assert_eq!(info.versions[1].frames, 3..5);
        let mtimes: Vec<i64> = info.frames.iter().map(|f| f.mtime).collect();
        assert_eq!(mtimes, [100, 200, 300, 500, 600]);
        assert!(info.frames[3].is_full());
        assert_eq!(info.frames[4].file, sidecar_path(&newer, 1));
    }

    #[test]
    fn find_frame_picks_last_frame_not_after() {
        let dir = tempfile::tempdir().unwrap();
        let stream = write_stream(dir.path(), "a.dbsnap", "/db/x.db", &[100, 200, 300]);
        let set = collect_snapshots(&[stream]).unwrap();
        let info = set.iter().next().unwrap();

        assert_eq!(info.find_frame(99), None);
        assert_eq!(info.find_frame(100), Some(0));
        assert_eq!(info.find_frame(250), Some(1));
        assert_eq!(info.find_frame(i64::MAX), Some(2));
        assert_eq!(info.version_of(2).unwrap().frames, 0..3);
    }

    #[test]
    fn separate_databases_get_separate_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_stream(dir.path(), "a.dbsnap", "/db/one.db", &[1]);
        let b = write_stream(dir.path(), "b.dbsnap", "/db/two.db", &[2]);
        let set = collect_snapshots(&[a, b]).unwrap();
        assert_eq!(set.len(), 2);
        let paths: Vec<PathBuf> = set.into_iter().map(|s| s.path).collect();
        assert_eq!(paths, [PathBuf::from("/db/one.db"), PathBuf::from("/db/two.db")]);
    }

    #[test]
    #[traced_test]
    fn truncated_frame_keeps_earlier_frames() {
        let dir = tempfile::tempdir().unwrap();
        let stream = write_stream(dir.path(), "a.dbsnap", "/db/x.db", &[10, 20]);
        let mut file = fs::OpenOptions::new().append(true).open(&stream).unwrap();
        file.write_all(&[0u8; 17]).unwrap();
        drop(file);

        let set = collect_snapshots(&[stream]).unwrap();
        assert_eq!(set.iter().next().unwrap().frames.len(), 2);
        assert!(logs_contain("truncated frame record"));
    }

    #[test]
    #[traced_test]
    fn truncated_header_skips_file() {
        let dir = tempfile::tempdir().unwrap();
        let short = dir.path().join("short.dbsnap");
        fs::write(&short, b"SQLITE").unwrap();
        let good = write_stream(dir.path(), "good.dbsnap", "/db/x.db", &[1]);

        let set = collect_snapshots(&[short, good]).unwrap();
        assert_eq!(set.len(), 1);
        assert!(logs_contain("truncated snapshot header"));
    }

    #[test]
    #[traced_test]
    fn oversized_path_length_skips_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge.dbsnap");
        let mut header = SnapshotHeader::new(8).unwrap();
        header.path_len = i32::MAX;
        let mut file = File::create(&path).unwrap();
        file.write_all(&header.encode()).unwrap();
        file.write_all(b"/data/app.db").unwrap();
        drop(file);

        let set = collect_snapshots(&[path]).unwrap();
        assert!(set.is_empty());
        assert!(logs_contain("truncated database path"));
    }

    #[test]
    #[traced_test]
    fn empty_version_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let empty = write_stream(dir.path(), "e.dbsnap", "/db/x.db", &[]);
        let set = collect_snapshots(&[empty]).unwrap();
        assert!(set.is_empty());
        assert!(logs_contain("has no frames"));
    }

    #[test]
    fn corrupted_signature_fails_collection() {
        let dir = tempfile::tempdir().unwrap();
        let good = write_stream(dir.path(), "good.dbsnap", "/db/x.db", &[1]);
        let bad = write_stream(dir.path(), "bad.dbsnap", "/db/x.db", &[1]);
        let mut bytes = fs::read(&bad).unwrap();
        bytes[3] ^= 0xFF;
        fs::write(&bad, bytes).unwrap();

        let err = collect_snapshots(&[good, bad]).unwrap_err();
        assert!(matches!(err, WalsnapError::Format { .. }));
    }

    #[test]
    fn missing_file_fails_collection() {
        let err = collect_snapshots(&[Path::new("/nonexistent/x.dbsnap")]).unwrap_err();
        assert!(matches!(err, WalsnapError::Io { .. }));
    }

    #[test]
    fn listing_a_directory_finds_only_streams() {
        let dir = tempfile::tempdir().unwrap();
        let stream = write_stream(dir.path(), "a.dbsnap", "/db/x.db", &[1]);
        fs::write(sidecar_path(&stream, 0), b"gz").unwrap();
        fs::write(dir.path().join("notes.txt"), b"").unwrap();

        assert_eq!(list_snapshot_files(dir.path()).unwrap(), vec![stream.clone()]);
        assert_eq!(list_snapshot_files(&stream).unwrap(), vec![stream]);
    }

    #[test]
    fn listing_an_empty_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(list_snapshot_files(dir.path()).is_err());
    }
}
