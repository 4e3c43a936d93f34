// SPDX-FileCopyrightText: 2024-2026 blockota contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{io, ops::Range, sync::atomic::AtomicBool};

use num_traits::ToPrimitive;
use rayon::{
    iter::{IndexedParallelIterator, ParallelIterator},
    slice::ParallelSliceMut,
};
use ring::digest::{Algorithm, Context};
use thiserror::Error;

use crate::{stream, util};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Hashing algorithm not supported: {0:?}")]
    UnsupportedHashAlgorithm(String),
    #[error("Image size {0} is not a multiple of the block size")]
    UnalignedImageSize(u64),
    #[error("Cannot build a hash tree over an empty image")]
    EmptyImage,
    #[error("Expected root digest {expected}, but have {actual}")]
    InvalidRootDigest { expected: String, actual: String },
    #[error("{0:?} field is out of bounds")]
    FieldOutOfBounds(&'static str),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Digest implementation for a dm-verity hash algorithm name.
pub fn ring_algorithm(name: &str) -> Result<&'static Algorithm> {
    if name.eq_ignore_ascii_case("sha1") {
        Ok(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY)
    } else if name.eq_ignore_ascii_case("sha256") {
        Ok(&ring::digest::SHA256)
    } else {
        Err(Error::UnsupportedHashAlgorithm(name.to_owned()))
    }
}

/// A dm-verity-style salted Merkle tree over an in-memory image.
///
/// Every digest is salted (`H(salt || data)`) and zero-padded to the next
/// power of two. Each level is zero-padded to the block size. The serialized
/// tree stores the top level first and the leaf level last. The root digest
/// is the salted hash of the entire top-level block and is not part of the
/// tree data itself.
pub struct HashTree {
    block_size: u32,
    salted_context: Context,
}

impl HashTree {
    pub fn new(block_size: u32, algorithm: &'static Algorithm, salt: &[u8]) -> Self {
        let mut salted_context = Context::new(algorithm);
        salted_context.update(salt);

        Self {
            block_size,
            salted_context,
        }
    }

    fn digest_padded_len(&self) -> usize {
        self.salted_context.algorithm().output_len().next_power_of_two()
    }

    /// Compute the list of offset ranges that each level occupies in the
    /// serialized tree. The items are returned with the leaf level's offsets
    /// first in the list, even though the leaf level is stored at the end.
    /// Levels are produced until one fits in a single block, so even a
    /// single-block image has a one-level tree.
    pub fn compute_level_offsets(&self, image_size: u64) -> Result<Vec<Range<usize>>> {
        let digest_size = self.digest_padded_len() as u64;
        let mut ranges = vec![];
        let mut level_size = image_size;

        while level_size > 0 {
            let blocks = level_size.div_ceil(u64::from(self.block_size));
            level_size = blocks
                .checked_mul(digest_size)
                .and_then(|s| util::round_up(s, u64::from(self.block_size)))
                .ok_or(Error::FieldOutOfBounds("level_size"))?;

            // Depending on the chosen block size, the image size could
            // overflow a usize without the first level's size doing the same.
            let level_size_usize = level_size
                .to_usize()
                .ok_or(Error::FieldOutOfBounds("level_size"))?;

            ranges.push(0..level_size_usize);

            if level_size <= u64::from(self.block_size) {
                break;
            }
        }

        // The serialized tree puts the leaves at the end.
        let mut offset = 0;
        for range in ranges.iter_mut().rev() {
            let level_size = range.end - range.start;
            range.start += offset;
            range.end += offset;
            offset += level_size;
        }

        Ok(ranges)
    }

    /// Total size of the serialized tree for an image of the given size.
    pub fn tree_size(&self, image_size: u64) -> Result<u64> {
        let offsets = self.compute_level_offsets(image_size)?;

        Ok(offsets.first().map(|r| r.end as u64).unwrap_or(0))
    }

    /// Hash a sequence of blocks into one level's digest slots. The output
    /// must already be zeroed; only the digest bytes are written, leaving the
    /// per-digest and per-level padding untouched.
    fn hash_level(
        &self,
        input: &[u8],
        level_data: &mut [u8],
        cancel_signal: &AtomicBool,
    ) -> io::Result<()> {
        let digest_padded = self.digest_padded_len();

        for (block, out) in input
            .chunks(self.block_size as usize)
            .zip(level_data.chunks_mut(digest_padded))
        {
            stream::check_cancel(cancel_signal)?;

            let mut context = self.salted_context.clone();
            context.update(block);
            let digest = context.finish();

            out[..digest.as_ref().len()].copy_from_slice(digest.as_ref());
        }

        Ok(())
    }

    /// Hash the leaf level in parallel. Upper levels are small enough that
    /// sequential hashing is fine.
    fn hash_level_parallel(
        &self,
        input: &[u8],
        level_data: &mut [u8],
        cancel_signal: &AtomicBool,
    ) -> io::Result<()> {
        let digest_padded = self.digest_padded_len();
        let block_size = self.block_size as usize;
        // Parallelize in larger chunks to keep per-task overhead low.
        let multiplier = 1024;

        level_data
            .par_chunks_mut(digest_padded * multiplier)
            .enumerate()
            .map(|(chunk, out_data)| -> io::Result<()> {
                let in_start = chunk * multiplier * block_size;
                if in_start >= input.len() {
                    // Level padding past the last digest.
                    return Ok(());
                }

                let in_end = (in_start + multiplier * block_size).min(input.len());

                self.hash_level(&input[in_start..in_end], out_data, cancel_signal)
            })
            .collect::<io::Result<()>>()
    }

    /// Build the hash tree for the image. Returns the root digest and the
    /// serialized tree data.
    pub fn generate(
        &self,
        input: &[u8],
        cancel_signal: &AtomicBool,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        if input.is_empty() {
            return Err(Error::EmptyImage);
        } else if input.len() % self.block_size as usize != 0 {
            return Err(Error::UnalignedImageSize(input.len() as u64));
        }

        let offsets = self.compute_level_offsets(input.len() as u64)?;
        let tree_size = offsets.first().map(|r| r.end).unwrap_or(0);
        let mut tree = vec![0u8; tree_size];

        for (i, level_range) in offsets.iter().enumerate() {
            let (front, back) = tree.split_at_mut(level_range.end);
            let level_data = &mut front[level_range.clone()];

            if i == 0 {
                self.hash_level_parallel(input, level_data, cancel_signal)?;
            } else {
                // Hash the previous (lower) level, which sits just behind
                // this one in the serialized layout.
                let prev_range = &offsets[i - 1];
                let prev_size = prev_range.end - prev_range.start;

                self.hash_level(&back[..prev_size], level_data, cancel_signal)?;
            }
        }

        // The root is the salted hash of the whole top-level block.
        let mut context = self.salted_context.clone();
        context.update(&tree[offsets.last().unwrap().clone()]);
        let root = context.finish().as_ref().to_vec();

        Ok((root, tree))
    }

    /// Build the hash tree and check the root against an expected digest.
    /// Returns the serialized tree data on success.
    pub fn verify_root(
        &self,
        input: &[u8],
        expected_root: &[u8],
        cancel_signal: &AtomicBool,
    ) -> Result<Vec<u8>> {
        let (root, tree) = self.generate(input, cancel_signal)?;

        if root != expected_root {
            return Err(Error::InvalidRootDigest {
                expected: hex::encode(expected_root),
                actual: hex::encode(&root),
            });
        }

        Ok(tree)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn salted_digest(algorithm: &'static Algorithm, salt: &[u8], data: &[u8]) -> Vec<u8> {
        let mut context = Context::new(algorithm);
        context.update(salt);
        context.update(data);
        context.finish().as_ref().to_vec()
    }

    #[test]
    fn level_offsets() {
        let hash_tree = HashTree::new(4096, &ring::digest::SHA256, &[]);

        assert_eq!(
            hash_tree.compute_level_offsets(0).unwrap(),
            &[] as &[Range<usize>],
        );

        // A single-block image still gets a one-level tree.
        assert_eq!(hash_tree.compute_level_offsets(4096).unwrap(), &[0..4096]);

        assert_eq!(
            hash_tree.compute_level_offsets(1024 * 1024 * 1024).unwrap(),
            &[69632..8458240, 4096..69632, 0..4096],
        );
        assert_eq!(
            hash_tree.tree_size(1024 * 1024 * 1024).unwrap(),
            8458240,
        );
    }

    #[test]
    fn single_level_tree() {
        let cancel_signal = AtomicBool::new(false);
        let salt = b"Salt";
        let hash_tree = HashTree::new(64, &ring::digest::SHA256, salt);

        // Two 64-byte blocks produce two digests that exactly fill one
        // 64-byte top level.
        let input = [[0xaau8; 64], [0xbbu8; 64]].concat();
        let (root, tree) = hash_tree.generate(&input, &cancel_signal).unwrap();

        let mut expected_tree = salted_digest(&ring::digest::SHA256, salt, &input[..64]);
        expected_tree.extend(salted_digest(&ring::digest::SHA256, salt, &input[64..]));
        assert_eq!(tree, expected_tree);

        let expected_root = salted_digest(&ring::digest::SHA256, salt, &expected_tree);
        assert_eq!(root, expected_root);
    }

    #[test]
    fn sha1_digests_are_padded() {
        let cancel_signal = AtomicBool::new(false);
        let salt = b"Salt";
        let hash_tree = HashTree::new(64, &ring::digest::SHA1_FOR_LEGACY_USE_ONLY, salt);

        let input = [0x5au8; 64];
        let (root, tree) = hash_tree.generate(&input, &cancel_signal).unwrap();

        // One 20-byte digest, padded to 32, in a 64-byte level.
        assert_eq!(tree.len(), 64);
        let digest = salted_digest(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY, salt, &input);
        assert_eq!(&tree[..20], &digest[..]);
        assert_eq!(&tree[20..], &[0u8; 44][..]);

        let expected_root = salted_digest(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY, salt, &tree);
        assert_eq!(root, expected_root);
    }

    #[test]
    fn two_level_tree() {
        let cancel_signal = AtomicBool::new(false);
        let salt = b"Salt";
        let algorithm = &ring::digest::SHA256;
        let hash_tree = HashTree::new(64, algorithm, salt);

        // Three blocks: the leaf level holds 3 digests (96 bytes, padded to
        // 128), the top level holds 2 digests (64 bytes). Top level is
        // serialized first.
        let input = [[0x11u8; 64], [0x22u8; 64], [0x33u8; 64]].concat();

        assert_eq!(
            hash_tree.compute_level_offsets(input.len() as u64).unwrap(),
            &[64..192, 0..64],
        );

        let (root, tree) = hash_tree.generate(&input, &cancel_signal).unwrap();
        assert_eq!(tree.len(), 192);

        let mut leaves = vec![];
        for block in input.chunks(64) {
            leaves.extend(salted_digest(algorithm, salt, block));
        }
        leaves.resize(128, 0);
        assert_eq!(&tree[64..], &leaves[..]);

        let mut top = vec![];
        top.extend(salted_digest(algorithm, salt, &leaves[..64]));
        top.extend(salted_digest(algorithm, salt, &leaves[64..]));
        assert_eq!(&tree[..64], &top[..]);

        assert_eq!(root, salted_digest(algorithm, salt, &top));
    }

    #[test]
    fn verify_root_mismatch() {
        let cancel_signal = AtomicBool::new(false);
        let hash_tree = HashTree::new(64, &ring::digest::SHA256, b"Salt");

        let mut input = vec![0x77u8; 128];
        let (root, tree) = hash_tree.generate(&input, &cancel_signal).unwrap();

        let verified_tree = hash_tree
            .verify_root(&input, &root, &cancel_signal)
            .unwrap();
        assert_eq!(verified_tree, tree);

        input[5] ^= 1;
        assert_matches!(
            hash_tree.verify_root(&input, &root, &cancel_signal),
            Err(Error::InvalidRootDigest { .. })
        );
    }

    #[test]
    fn invalid_inputs() {
        let cancel_signal = AtomicBool::new(false);
        let hash_tree = HashTree::new(64, &ring::digest::SHA256, b"Salt");

        assert_matches!(
            hash_tree.generate(&[], &cancel_signal),
            Err(Error::EmptyImage)
        );
        assert_matches!(
            hash_tree.generate(&[0u8; 100], &cancel_signal),
            Err(Error::UnalignedImageSize(100))
        );

        assert_matches!(ring_algorithm("sha256"), Ok(_));
        assert_matches!(ring_algorithm("SHA1"), Ok(_));
        assert_matches!(
            ring_algorithm("blake2b-256"),
            Err(Error::UnsupportedHashAlgorithm(_))
        );
    }
}
