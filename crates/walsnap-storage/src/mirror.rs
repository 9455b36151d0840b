// SPDX-FileCopyrightText: 2026 Walsnap Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Copies freshly appended WAL bytes into the open generation's sidecar.

use std::fs::{self, File};
use std::io::{self, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, trace, warn};

use walsnap_core::{Sha256Digest, WalsnapError};

use crate::stream::{SidecarWriter, splice_with_checksum};

/// Tails the live `-wal` file of one database.
///
/// The reader is opened lazily because SQLite creates the WAL on first use.
/// Every byte copied is folded into a running SHA-256 that becomes the
/// generation's frame digest on [`WalMirror::finish`].
pub struct WalMirror {
    wal_path: PathBuf,
    reader: Option<File>,
    offset: u64,
    sidecar: Option<SidecarWriter>,
    hasher: Sha256,
    dirty: bool,
}

impl WalMirror {
    pub fn new(wal_path: PathBuf) -> Self {
        Self {
            wal_path,
            reader: None,
            offset: 0,
            sidecar: None,
            hasher: Sha256::new(),
            dirty: false,
        }
    }

    /// Start a new generation: open `sidecar`, rewind to the start of the
    /// WAL and reset the digest.
    ///
    /// A generation that was still open is closed without a frame record.
    pub fn start(&mut self, sidecar: &Path) -> Result<(), WalsnapError> {
        self.abandon();
        self.sidecar = Some(SidecarWriter::create(sidecar)?);
        self.offset = 0;
        self.hasher = Sha256::new();
        self.dirty = false;
        Ok(())
    }

    /// Drain everything appended to the WAL since the last call.
    ///
    /// Returns the number of bytes copied. Without an open generation this
    /// is a no-op.
    pub fn copy_wal(&mut self) -> Result<u64, WalsnapError> {
        let Some(sidecar) = self.sidecar.as_mut() else {
            return Ok(0);
        };

        if self.reader.is_none() {
            match File::open(&self.wal_path) {
                Ok(file) => self.reader = Some(file),
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
                Err(e) => {
                    return Err(WalsnapError::io(
                        format!("open WAL {}", self.wal_path.display()),
                        e,
                    ));
                }
            }
        }
        let Some(reader) = self.reader.as_mut() else {
            return Ok(0);
        };

        let context = |what: &str| format!("{what} WAL {}", self.wal_path.display());
        reader
            .seek(SeekFrom::Start(self.offset))
            .map_err(|e| WalsnapError::io(context("seek"), e))?;
        let copied = splice_with_checksum(reader, sidecar, &mut self.hasher)
            .map_err(|e| WalsnapError::io(context("mirror"), e))?;

        if copied > 0 {
            self.offset += copied;
            self.dirty = true;
            trace!(bytes = copied, offset = self.offset, "mirrored WAL bytes");
        }
        Ok(copied)
    }

    /// Seal the open generation and return the digest of everything
    /// copied into it. `None` if no generation was open.
    pub fn finish(&mut self) -> Result<Option<Sha256Digest>, WalsnapError> {
        let Some(sidecar) = self.sidecar.take() else {
            return Ok(None);
        };
        sidecar.finish()?;
        self.dirty = false;
        let digest: [u8; 32] = self.hasher.finalize_reset().into();
        Ok(Some(Sha256Digest(digest)))
    }

    /// Drop the open generation and delete its sidecar. It never got a
    /// frame record, so no reader can reach it.
    pub fn abandon(&mut self) {
        if let Some(sidecar) = self.sidecar.take() {
            let path = sidecar.path().to_path_buf();
            drop(sidecar);
            remove_abandoned(&path);
        }
        self.dirty = false;
    }

    /// `true` once bytes were copied into the open generation.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn sidecar_path(&self) -> Option<&Path> {
        self.sidecar.as_ref().map(SidecarWriter::path)
    }
}

fn remove_abandoned(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed abandoned sidecar"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "could not remove abandoned sidecar"),
    }
}
