// SPDX-FileCopyrightText: 2026 Walsnap Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core library for the walsnap workspace.
//!
//! Provides the error type and the small value types shared by the storage
//! engine and the `walsnap` command line tool.

pub mod error;
pub mod types;

// Re-export key items at crate root for ergonomic imports.
pub use error::WalsnapError;
pub use types::{Sha256Digest, format_millis, now_millis};
