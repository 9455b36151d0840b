// SPDX-FileCopyrightText: 2026 Walsnap Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! File plumbing for snapshot chains: the append-only main stream and the
//! gzip sidecars that hold the actual database and WAL bytes.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tempfile::{NamedTempFile, TempPath};
use tracing::debug;

use walsnap_core::WalsnapError;

use crate::format::{FrameData, SnapshotHeader, encode_path};

/// Attempts at finding an unused main stream name before giving up.
pub const NAME_ATTEMPTS: usize = 1000;

pub const MAIN_STREAM_EXTENSION: &str = "dbsnap";

const COPY_BUFFER: usize = 16 * 1024;

/// `<main-stream-path>-<index as 16 hex digits>`.
pub fn sidecar_path(main: &Path, index: u64) -> PathBuf {
    let mut name = OsString::from(main.as_os_str());
    name.push(format!("-{index:016x}"));
    PathBuf::from(name)
}

/// Copy `reader` into `writer` in 16 KiB chunks, folding every byte into
/// `hasher`. Returns the number of bytes copied.
pub fn splice_with_checksum<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    hasher: &mut Sha256,
) -> io::Result<u64> {
    let mut buf = vec![0u8; COPY_BUFFER];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buf[..n])?;
        hasher.update(&buf[..n]);
        total += n as u64;
    }
}

/// A gzip-compressed sidecar being written.
///
/// Atomic sidecars are written to a temporary file in the same directory
/// and renamed into place by [`SidecarWriter::finish`], so a crash never
/// leaves a half-written full copy under the final name.
pub struct SidecarWriter {
    encoder: GzEncoder<BufWriter<File>>,
    path: PathBuf,
    pending: Option<TempPath>,
}

impl SidecarWriter {
    /// Create (or truncate) `path` and write to it directly.
    pub fn create(path: &Path) -> Result<Self, WalsnapError> {
        let file = File::create(path)
            .map_err(|e| WalsnapError::io(format!("create sidecar {}", path.display()), e))?;
        Ok(Self::with_file(file, path, None))
    }

    /// Write to a temporary file and rename it to `path` on finish.
    pub fn create_atomic(path: &Path) -> Result<Self, WalsnapError> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let tmp = NamedTempFile::new_in(dir)
            .map_err(|e| WalsnapError::io(format!("create temp file in {}", dir.display()), e))?;
        let (file, temp_path) = tmp.into_parts();
        Ok(Self::with_file(file, path, Some(temp_path)))
    }

    fn with_file(file: File, path: &Path, pending: Option<TempPath>) -> Self {
        Self {
            encoder: GzEncoder::new(BufWriter::new(file), Compression::fast()),
            path: path.to_path_buf(),
            pending,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the gzip trailer, sync, and move an atomic sidecar into place.
    pub fn finish(self) -> Result<PathBuf, WalsnapError> {
        let context = |what: &str| format!("{what} sidecar {}", self.path.display());
        let writer = self.encoder.finish().map_err(|e| WalsnapError::io(context("finish"), e))?;
        let file = writer
            .into_inner()
            .map_err(|e| WalsnapError::io(context("flush"), e.into_error()))?;
        file.sync_all().map_err(|e| WalsnapError::io(context("sync"), e))?;
        drop(file);

        if let Some(temp_path) = self.pending {
            temp_path
                .persist(&self.path)
                .map_err(|e| WalsnapError::io(context("rename"), e.error))?;
        }
        Ok(self.path)
    }
}

impl Write for SidecarWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.encoder.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.encoder.flush()
    }
}

/// The append-only main stream of one snapshot chain.
pub struct MainStream {
    file: File,
    path: PathBuf,
    frames: u64,
}

impl MainStream {
    /// Create `<24 random hex>.dbsnap` in `dir` and write its header.
    ///
    /// Names are drawn at random and opened with `create_new`, so two
    /// writers never share a stream.
    pub fn create_random(dir: &Path, database: &Path) -> Result<Self, WalsnapError> {
        let mut rng = rand::thread_rng();
        for _ in 0..NAME_ATTEMPTS {
            let mut id = [0u8; 12];
            rng.fill_bytes(&mut id);
            let path = dir.join(format!("{}.{MAIN_STREAM_EXTENSION}", hex::encode(id)));

            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => {
                    let mut stream = Self {
                        file,
                        path,
                        frames: 0,
                    };
                    stream.write_header(database)?;
                    debug!(path = %stream.path.display(), "created snapshot main stream");
                    return Ok(stream);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(WalsnapError::io(
                        format!("create snapshot file {}", path.display()),
                        e,
                    ));
                }
            }
        }
        Err(WalsnapError::Exhausted {
            what: format!("choosing a snapshot file name in {}", dir.display()),
            attempts: NAME_ATTEMPTS,
        })
    }

    fn write_header(&mut self, database: &Path) -> Result<(), WalsnapError> {
        let path_bytes = encode_path(database);
        let header = SnapshotHeader::new(path_bytes.len())?;
        let mut record = header.encode().to_vec();
        record.extend_from_slice(&path_bytes);
        self.write_durably(&record, "write header to")
    }

    /// Append one frame record and sync it to disk.
    pub fn append_frame(&mut self, frame: &FrameData) -> Result<(), WalsnapError> {
        self.write_durably(&frame.encode(), "append frame to")?;
        self.frames += 1;
        Ok(())
    }

    fn write_durably(&mut self, bytes: &[u8], what: &str) -> Result<(), WalsnapError> {
        let context = || format!("{what} {}", self.path.display());
        self.file
            .write_all(bytes)
            .map_err(|e| WalsnapError::io(context(), e))?;
        self.file.sync_data().map_err(|e| WalsnapError::io(context(), e))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Frames appended through this handle.
    pub fn frame_count(&self) -> u64 {
        self.frames
    }
}

/// Remove `<main>-1`, `<main>-2`, ... until the first gap.
///
/// Returns how many files were removed.
pub fn remove_stale_sidecars(main: &Path) -> Result<u64, WalsnapError> {
    let mut index = 1;
    loop {
        let path = sidecar_path(main, index);
        match fs::remove_file(&path) {
            Ok(()) => index += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(index - 1),
            Err(e) => {
                return Err(WalsnapError::io(
                    format!("remove stale sidecar {}", path.display()),
                    e,
                ));
            }
        }
    }
}
