// SPDX-FileCopyrightText: 2026 Walsnap Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Layered config loading with Figment.
//!
//! Lookup order: `./walsnap.toml` > `~/.config/walsnap/walsnap.toml` >
//! `/etc/walsnap/walsnap.toml`, then `WALSNAP_*` environment variables.

#![allow(clippy::result_large_err)] // figment::Error is external

use std::path::{Path, PathBuf};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

use crate::model::WalsnapConfig;

pub const SYSTEM_CONFIG: &str = "/etc/walsnap/walsnap.toml";
pub const LOCAL_CONFIG: &str = "walsnap.toml";

/// Path of the per-user config file, if the platform has a config dir.
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("walsnap").join("walsnap.toml"))
}

/// Load configuration from the standard hierarchy with env var overrides.
///
/// Merge order (later overrides earlier):
/// 1. Compiled defaults
/// 2. `/etc/walsnap/walsnap.toml`
/// 3. `~/.config/walsnap/walsnap.toml`
/// 4. `./walsnap.toml`
/// 5. `WALSNAP_*` environment variables
pub fn load_config() -> Result<WalsnapConfig, figment::Error> {
    build_figment().extract()
}

/// Load configuration from an inline TOML string only. No files, no env.
pub fn load_config_from_str(toml_content: &str) -> Result<WalsnapConfig, figment::Error> {
    Figment::new()
        .merge(Serialized::defaults(WalsnapConfig::default()))
        .merge(Toml::string(toml_content))
        .extract()
}

/// Load configuration from one explicit file with env var overrides.
pub fn load_config_from_path(path: &Path) -> Result<WalsnapConfig, figment::Error> {
    Figment::new()
        .merge(Serialized::defaults(WalsnapConfig::default()))
        .merge(Toml::file(path))
        .merge(env_provider())
        .extract()
}

/// The full hierarchy before extraction.
pub fn build_figment() -> Figment {
    Figment::new()
        .merge(Serialized::defaults(WalsnapConfig::default()))
        .merge(Toml::file(SYSTEM_CONFIG))
        .merge(Toml::file(user_config_path().unwrap_or_default()))
        .merge(Toml::file(LOCAL_CONFIG))
        .merge(env_provider())
}

/// Env provider mapping `WALSNAP_<SECTION>_<KEY>` onto `section.key`.
///
/// Uses `map()` rather than `split("_")` because keys such as
/// `busy_timeout_ms` contain underscores themselves.
fn env_provider() -> Env {
    Env::prefixed("WALSNAP_").map(|key| map_env_key(key.as_str()).into())
}

fn map_env_key(key: &str) -> String {
    for section in ["log", "database", "snapshot"] {
        if let Some(rest) = key.strip_prefix(section) {
            if let Some(field) = rest.strip_prefix('_') {
                return format!("{section}.{field}");
            }
        }
    }
    key.to_string()
}
