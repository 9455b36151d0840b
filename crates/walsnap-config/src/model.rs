// SPDX-FileCopyrightText: 2026 Walsnap Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration model structs for walsnap.
//!
//! All structs use `#[serde(deny_unknown_fields)]` to reject unrecognized
//! config keys at startup, providing actionable error messages.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level walsnap configuration.
///
/// Loaded from TOML files following XDG hierarchy, with environment variable overrides.
/// All sections are optional and default to sensible values.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WalsnapConfig {
    /// Logging settings.
    #[serde(default)]
    pub log: LogConfig,

    /// Settings applied to every database handle on open.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Snapshot stream settings.
    #[serde(default)]
    pub snapshot: SnapshotConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Connection settings applied by `Database::open_with_config`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    /// How long SQLite retries a busy database file before failing.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Use `synchronous = FULL` instead of `NORMAL`.
    #[serde(default = "default_synchronous_full")]
    pub synchronous_full: bool,
}

impl DatabaseConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: default_busy_timeout_ms(),
            synchronous_full: default_synchronous_full(),
        }
    }
}

fn default_busy_timeout_ms() -> u64 {
    15_000
}

fn default_synchronous_full() -> bool {
    true
}

/// Snapshot stream configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SnapshotConfig {
    /// Directory receiving `.dbsnap` main streams and their sidecars.
    /// Snapshots stay disabled while this is unset.
    #[serde(default)]
    pub directory: Option<String>,

    /// Maximum age of a full copy before a checkpoint starts a new chain.
    #[serde(default = "default_full_delay_secs")]
    pub full_delay_secs: u64,

    /// How often long-running tools call `checkpoint()`.
    #[serde(default = "default_checkpoint_interval_ms")]
    pub checkpoint_interval_ms: u64,
}

impl SnapshotConfig {
    pub fn full_delay(&self) -> Duration {
        Duration::from_secs(self.full_delay_secs)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            directory: None,
            full_delay_secs: default_full_delay_secs(),
            checkpoint_interval_ms: default_checkpoint_interval_ms(),
        }
    }
}

fn default_full_delay_secs() -> u64 {
    86_400
}

fn default_checkpoint_interval_ms() -> u64 {
    1_000
}
