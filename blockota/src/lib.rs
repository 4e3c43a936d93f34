// SPDX-FileCopyrightText: 2024-2026 blockota contributors
// SPDX-License-Identifier: GPL-3.0-only

//! blockota is a command-line tool first and a library second: semver applies
//! to the CLI surface only, and any Rust API here can change in any release.
//!
//! Code under `cli/` sticks to concrete types for simplicity. The format and
//! engine modules stay generic over their stream inputs so they work against
//! block devices, image files, and in-memory buffers alike.

pub mod cli;
pub mod crypto;
pub mod engine;
pub mod format;
pub mod stream;
pub mod util;
