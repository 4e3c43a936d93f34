// SPDX-FileCopyrightText: 2024-2026 blockota contributors
// SPDX-License-Identifier: GPL-3.0-only

pub mod blockmap;
pub mod bsdiff;
pub mod hashtree;
pub mod imgdiff;
pub mod package;
pub mod rangeset;
pub mod transferlist;
