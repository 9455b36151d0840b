// SPDX-FileCopyrightText: 2026 Walsnap Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for the walsnap workspace.

use std::path::PathBuf;

use thiserror::Error;

/// The primary error type returned by every fallible walsnap operation.
#[derive(Debug, Error)]
pub enum WalsnapError {
    /// Configuration errors (invalid TOML, out-of-range values).
    #[error("configuration error: {0}")]
    Config(String),

    /// Filesystem failures (open, read, write, rename, remove).
    #[error("{context}: {source}")]
    Io {
        context: String,
        source: std::io::Error,
    },

    /// Errors reported by the embedded database engine.
    #[error("storage error: {source}")]
    Storage {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A snapshot file is not in a format this build understands.
    #[error("invalid snapshot file '{}': {message}", path.display())]
    Format { path: PathBuf, message: String },

    /// A restored file does not hash to its recorded digest.
    #[error("{kind} checksum does not match for '{}'", path.display())]
    ChecksumMismatch { kind: &'static str, path: PathBuf },

    /// The engine left the replayed WAL file in place.
    #[error("SQLite did not replay the WAL for '{}'", path.display())]
    WalNotReplayed { path: PathBuf },

    /// A bounded retry loop ran out of attempts.
    #[error("{what}: gave up after {attempts} attempts")]
    Exhausted { what: String, attempts: usize },

    /// Destination exists and overwriting was not requested.
    #[error("refusing to overwrite '{}'", path.display())]
    RefuseOverwrite { path: PathBuf },

    /// Snapshots were already enabled on this database handle.
    #[error("snapshots are already enabled for this database")]
    SnapshotConfigured,

    /// A snapshot operation was requested without a snapshot directory.
    #[error("snapshots are not enabled for this database")]
    SnapshotDisabled,

    /// The database handle was already closed.
    #[error("database is closed")]
    Closed,

    /// Internal or unexpected errors.
    #[error("internal error: {0}")]
    Internal(String),
}

impl WalsnapError {
    /// Wrap an I/O error with a short description of what was attempted.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Wrap an engine error.
    pub fn storage(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Storage {
            source: Box::new(source),
        }
    }
}
