// SPDX-FileCopyrightText: 2026 Walsnap Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! On-disk records of the snapshot main stream.
//!
//! A main stream (`<24 hex>.dbsnap`) starts with a [`SnapshotHeader`]
//! followed by the original database path, then holds one [`FrameData`]
//! record per finalized sidecar. All integers are little-endian.
//!
//! ```text
//! header  : signature[15] "SQLITESNAPSHOT\0" | version i8 | path_len i32
//! path    : path_len bytes
//! frame*  : mtime i64 (unix ms) | sha256[32]
//! ```

use std::io::{self, Read};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};

use walsnap_core::{Sha256Digest, WalsnapError};

pub const SIGNATURE: [u8; 15] = *b"SQLITESNAPSHOT\0";
pub const FORMAT_VERSION: i8 = 1;
pub const HEADER_LEN: usize = 20;
pub const FRAME_LEN: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub signature: [u8; 15],
    pub version: i8,
    pub path_len: i32,
}

impl SnapshotHeader {
    pub fn new(path_len: usize) -> Result<Self, WalsnapError> {
        let path_len = i32::try_from(path_len)
            .map_err(|_| WalsnapError::Internal(format!("database path too long: {path_len}")))?;
        Ok(Self {
            signature: SIGNATURE,
            version: FORMAT_VERSION,
            path_len,
        })
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[..15].copy_from_slice(&self.signature);
        buf[15] = self.version.to_le_bytes()[0];
        LittleEndian::write_i32(&mut buf[16..], self.path_len);
        buf
    }

    pub fn decode(buf: &[u8; HEADER_LEN]) -> Self {
        let mut signature = [0u8; 15];
        signature.copy_from_slice(&buf[..15]);
        Self {
            signature,
            version: i8::from_le_bytes([buf[15]]),
            path_len: LittleEndian::read_i32(&buf[16..]),
        }
    }

    /// Reject files that are not version-1 snapshot streams.
    pub fn validate(&self, file: &Path) -> Result<(), WalsnapError> {
        if self.signature != SIGNATURE {
            return Err(WalsnapError::Format {
                path: file.to_path_buf(),
                message: "bad signature".to_string(),
            });
        }
        if self.version != FORMAT_VERSION {
            return Err(WalsnapError::Format {
                path: file.to_path_buf(),
                message: format!("unsupported format version {}", self.version),
            });
        }
        if self.path_len < 0 {
            return Err(WalsnapError::Format {
                path: file.to_path_buf(),
                message: format!("negative path length {}", self.path_len),
            });
        }
        Ok(())
    }
}

/// One finalized sidecar: when it was sealed and the digest of its
/// decompressed content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameData {
    pub mtime: i64,
    pub sha256: Sha256Digest,
}

impl FrameData {
    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let mut buf = [0u8; FRAME_LEN];
        LittleEndian::write_i64(&mut buf[..8], self.mtime);
        buf[8..].copy_from_slice(self.sha256.as_bytes());
        buf
    }

    pub fn decode(buf: &[u8; FRAME_LEN]) -> Self {
        let mut sha = [0u8; 32];
        sha.copy_from_slice(&buf[8..]);
        Self {
            mtime: LittleEndian::read_i64(&buf[..8]),
            sha256: Sha256Digest(sha),
        }
    }
}

/// Encode a database path for the header.
///
/// Non-UTF-8 paths are stored lossily.
pub fn encode_path(path: &Path) -> Vec<u8> {
    path.to_string_lossy().into_owned().into_bytes()
}

pub fn decode_path(bytes: &[u8]) -> PathBuf {
    PathBuf::from(String::from_utf8_lossy(bytes).into_owned())
}

/// Read until `buf` is full or the reader is exhausted.
///
/// Returns the number of bytes read, so callers can tell a clean end of
/// stream (0) from a truncated record.
pub fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
