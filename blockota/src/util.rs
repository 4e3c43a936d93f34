/*
 * SPDX-FileCopyrightText: 2024-2025 blockota contributors
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::path::Path;

use num_traits::PrimInt;

pub const ZEROS: [u8; 16384] = [0u8; 16384];

/// Number of whole blocks needed to cover `size` bytes.
pub fn blocks_for_size<N: PrimInt>(size: N, block_size: N) -> N {
    let whole = size / block_size;
    if size % block_size == N::zero() {
        whole
    } else {
        whole + N::one()
    }
}

/// Amount of padding needed to align `offset` to the next multiple of
/// `alignment`.
pub fn padding_for<N: PrimInt>(offset: N, alignment: N) -> N {
    let r = offset % alignment;
    if r == N::zero() {
        N::zero()
    } else {
        alignment - r
    }
}

/// Round up to the next multiple of `alignment`.
pub fn round_up<N: PrimInt>(offset: N, alignment: N) -> Option<N> {
    offset.checked_add(&padding_for(offset, alignment))
}

/// Get the non-empty parent of a path. If the path has no parent in the string,
/// then `.` is returned. This does not perform any filesystem operations.
pub fn parent_path(path: &Path) -> &Path {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            return parent;
        }
    }

    Path::new(".")
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    #[test]
    fn test_blocks_for_size() {
        assert_eq!(super::blocks_for_size(1u64, 4096), 1);
        assert_eq!(super::blocks_for_size(4096u64, 4096), 1);
        assert_eq!(super::blocks_for_size(4097u64, 4096), 2);
        assert_eq!(super::blocks_for_size(49652u64, 4096), 13);
    }

    #[test]
    fn test_round_up() {
        assert_eq!(super::round_up(0u32, 4096), Some(0));
        assert_eq!(super::round_up(1u32, 4096), Some(4096));
        assert_eq!(super::round_up(8192u32, 4096), Some(8192));
        assert_eq!(super::round_up(u32::MAX, 4096), None);
    }

    #[test]
    fn test_parent_path() {
        assert_eq!(super::parent_path(Path::new("a/b")), Path::new("a"));
        assert_eq!(super::parent_path(Path::new("a")), Path::new("."));
    }
}
