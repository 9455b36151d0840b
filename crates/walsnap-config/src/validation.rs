// SPDX-FileCopyrightText: 2026 Walsnap Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Semantic checks that serde attributes cannot express.

use crate::diagnostic::ConfigError;
use crate::model::WalsnapConfig;

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Validate a deserialized configuration.
///
/// Collects every problem instead of failing on the first one.
pub fn validate_config(config: &WalsnapConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    if !LOG_LEVELS.contains(&config.log.level.to_ascii_lowercase().as_str()) {
        errors.push(ConfigError::Validation {
            key: "log.level".to_string(),
            message: format!(
                "`{}` is not one of {}",
                config.log.level,
                LOG_LEVELS.join(", ")
            ),
        });
    }

    if config.database.busy_timeout_ms > i32::MAX as u64 {
        errors.push(ConfigError::Validation {
            key: "database.busy_timeout_ms".to_string(),
            message: format!("must not exceed {}", i32::MAX),
        });
    }

    if let Some(dir) = &config.snapshot.directory {
        if dir.trim().is_empty() {
            errors.push(ConfigError::Validation {
                key: "snapshot.directory".to_string(),
                message: "must not be empty; omit the key to disable snapshots".to_string(),
            });
        }
    }

    if config.snapshot.full_delay_secs == 0 {
        errors.push(ConfigError::Validation {
            key: "snapshot.full_delay_secs".to_string(),
            message: "must be at least 1".to_string(),
        });
    }

    if config.snapshot.checkpoint_interval_ms == 0 {
        errors.push(ConfigError::Validation {
            key: "snapshot.checkpoint_interval_ms".to_string(),
            message: "must be at least 1".to_string(),
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
