// SPDX-FileCopyrightText: 2024-2026 blockota contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{fmt, num::ParseIntError, ops::Range, slice};

use thiserror::Error;

/// Block size used for byte-offset arithmetic in transfer lists and stashes.
pub const BLOCK_SIZE: u64 = 4096;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Not enough tokens in range set: {0:?}")]
    NotEnoughTokens(String),
    #[error("Invalid number in range set: {0:?}")]
    InvalidNumber(String, #[source] ParseIntError),
    #[error("Number count not a positive multiple of 2: {0:?}")]
    InvalidNumberCount(String),
    #[error("Number count does not match actual count: {0:?}")]
    NumberCountMismatch(String),
    #[error("Empty or inverted range: [{start}, {end})")]
    EmptyRange { start: u64, end: u64 },
    #[error("Total block count overflows integer type")]
    BlockCountOverflow,
    #[error("Byte offset not covered by any range: {0}")]
    OffsetNotCovered(u64),
}

pub type Result<T> = std::result::Result<T, Error>;

/// An ordered sequence of half-open block ranges as it appears in transfer
/// lists. Ranges are not required to be sorted nor disjoint.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RangeSet {
    ranges: Vec<Range<u64>>,
    blocks: u64,
}

impl RangeSet {
    /// Parse the textual form `"<count>,<start0>,<end0>,..."` where `count` is
    /// the number of integers that follow it.
    pub fn parse(text: &str) -> Result<Self> {
        let pieces = text.split(',').collect::<Vec<_>>();
        if pieces.len() < 3 {
            return Err(Error::NotEnoughTokens(text.to_owned()));
        }

        let num: u64 = pieces[0]
            .parse()
            .map_err(|e| Error::InvalidNumber(pieces[0].to_owned(), e))?;

        if num == 0 || num % 2 != 0 {
            return Err(Error::InvalidNumberCount(text.to_owned()));
        } else if num != pieces.len() as u64 - 1 {
            return Err(Error::NumberCountMismatch(text.to_owned()));
        }

        let mut ranges = Vec::with_capacity(num as usize / 2);
        let mut blocks: u64 = 0;

        for pair in pieces[1..].chunks_exact(2) {
            let start: u64 = pair[0]
                .parse()
                .map_err(|e| Error::InvalidNumber(pair[0].to_owned(), e))?;
            let end: u64 = pair[1]
                .parse()
                .map_err(|e| Error::InvalidNumber(pair[1].to_owned(), e))?;

            if start >= end {
                return Err(Error::EmptyRange { start, end });
            }

            blocks = blocks
                .checked_add(end - start)
                .ok_or(Error::BlockCountOverflow)?;
            ranges.push(start..end);
        }

        Ok(Self { ranges, blocks })
    }

    /// Build a set from already-parsed ranges, eg. from a block map file.
    pub fn from_ranges(ranges: impl IntoIterator<Item = Range<u64>>) -> Result<Self> {
        let ranges = ranges.into_iter().collect::<Vec<_>>();
        let mut blocks: u64 = 0;

        for range in &ranges {
            if range.start >= range.end {
                return Err(Error::EmptyRange {
                    start: range.start,
                    end: range.end,
                });
            }

            blocks = blocks
                .checked_add(range.end - range.start)
                .ok_or(Error::BlockCountOverflow)?;
        }

        Ok(Self { ranges, blocks })
    }

    /// Total number of blocks covered, counting duplicates if ranges overlap.
    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    pub fn ranges(&self) -> &[Range<u64>] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn iter(&self) -> slice::Iter<'_, Range<u64>> {
        self.ranges.iter()
    }

    /// Absolute block number at logical position `idx` when the ranges are
    /// laid out contiguously in order.
    pub fn block_number(&self, idx: u64) -> Option<u64> {
        let mut remaining = idx;

        for range in &self.ranges {
            let size = range.end - range.start;
            if remaining < size {
                return Some(range.start + remaining);
            }
            remaining -= size;
        }

        None
    }

    /// Whether any block is covered by both sets. Ranges are half-open, so
    /// `[3, 5)` and `[5, 7)` do not overlap.
    pub fn overlaps(&self, other: &Self) -> bool {
        self.ranges.iter().any(|a| {
            other
                .ranges
                .iter()
                .any(|b| a.start < b.end && b.start < a.end)
        })
    }

    /// Partition the set into `groups` sets covering the same blocks in the
    /// same order, differing in size by at most one block. Produces fewer,
    /// single-block sets if there are fewer blocks than groups.
    pub fn split(&self, groups: usize) -> Vec<Self> {
        if self.ranges.is_empty() || groups == 0 {
            return vec![];
        }

        let groups = (groups as u64).min(self.blocks);
        let mean = self.blocks / groups;
        let extra = self.blocks % groups;

        let mut result = Vec::with_capacity(groups as usize);
        let mut iter = self.ranges.iter();
        let mut current = iter.next().cloned();

        for g in 0..groups {
            // The first `extra` groups get one additional block.
            let mut needed = if g < extra { mean + 1 } else { mean };
            let mut ranges = Vec::new();

            while needed > 0 {
                let Some(range) = &mut current else {
                    unreachable!("Group sizes sum to the total block count");
                };

                let take = (range.end - range.start).min(needed);
                ranges.push(range.start..range.start + take);
                range.start += take;
                needed -= take;

                if range.start == range.end {
                    current = iter.next().cloned();
                }
            }

            let blocks = ranges.iter().map(|r| r.end - r.start).sum();
            result.push(Self { ranges, blocks });
        }

        result
    }
}

impl fmt::Display for RangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ranges.is_empty() {
            return Ok(());
        }

        write!(f, "{}", self.ranges.len() * 2)?;
        for range in &self.ranges {
            write!(f, ",{},{}", range.start, range.end)?;
        }

        Ok(())
    }
}

impl<'a> IntoIterator for &'a RangeSet {
    type Item = &'a Range<u64>;
    type IntoIter = slice::Iter<'a, Range<u64>>;

    fn into_iter(self) -> Self::IntoIter {
        self.ranges.iter()
    }
}

/// A range set that additionally keeps its ranges disjoint and in ascending
/// order, merging on insert. Byte-granular operations use [`BLOCK_SIZE`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SortedRangeSet(RangeSet);

impl SortedRangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blocks(&self) -> u64 {
        self.0.blocks
    }

    pub fn ranges(&self) -> &[Range<u64>] {
        &self.0.ranges
    }

    /// Insert a block range, merging it with any ranges it touches or
    /// overlaps.
    pub fn insert(&mut self, range: Range<u64>) {
        debug_assert!(range.start < range.end);

        let ranges = &mut self.0.ranges;
        let pos = ranges.partition_point(|r| r.start < range.start);
        ranges.insert(pos, range);

        let mut merged: Vec<Range<u64>> = Vec::with_capacity(ranges.len());
        for range in ranges.drain(..) {
            match merged.last_mut() {
                // Adjacent ranges merge too.
                Some(last) if range.start <= last.end => {
                    last.end = last.end.max(range.end);
                }
                _ => merged.push(range),
            }
        }

        *ranges = merged;
        self.0.blocks = ranges.iter().map(|r| r.end - r.start).sum();
    }

    /// Insert the blocks covering `len` bytes starting at byte offset
    /// `start`.
    pub fn insert_bytes(&mut self, start: u64, len: u64) {
        if len == 0 {
            return;
        }

        self.insert(start / BLOCK_SIZE..(start + len - 1) / BLOCK_SIZE + 1);
    }

    /// Whether the blocks covering `len` bytes starting at byte offset
    /// `start` overlap the set.
    pub fn overlaps_bytes(&self, start: u64, len: u64) -> bool {
        if len == 0 {
            return false;
        }

        let begin = start / BLOCK_SIZE;
        let end = (start + len - 1) / BLOCK_SIZE + 1;

        self.0
            .ranges
            .iter()
            .any(|r| r.start < end && begin < r.end)
    }

    /// Map an absolute byte offset in the original file to its byte offset
    /// within the stored ranges laid out contiguously.
    pub fn offset_in_set(&self, old_offset: u64) -> Result<u64> {
        let old_block = old_offset / BLOCK_SIZE;
        let mut blocks_before: u64 = 0;

        for range in &self.0.ranges {
            if old_block >= range.start && old_block < range.end {
                let new_block = blocks_before + (old_block - range.start);
                return Ok(new_block * BLOCK_SIZE + old_offset % BLOCK_SIZE);
            }

            blocks_before += range.end - range.start;
        }

        Err(Error::OffsetNotCovered(old_offset))
    }
}

impl fmt::Display for SortedRangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_round_trip() {
        for text in ["2,1,10", "4,10,20,30,40", "6,1,2,3,4,5,6"] {
            let set = RangeSet::parse(text).unwrap();
            assert_eq!(set.to_string(), text);
        }
    }

    #[test]
    fn parse_blocks() {
        let set = RangeSet::parse("4,1,3,5,10").unwrap();
        assert_eq!(set.blocks(), 7);
        assert_eq!(set.ranges(), &[1..3, 5..10]);
    }

    #[test]
    fn parse_invalid() {
        assert_matches!(RangeSet::parse(""), Err(Error::NotEnoughTokens(_)));
        assert_matches!(RangeSet::parse("2,1"), Err(Error::NotEnoughTokens(_)));
        assert_matches!(
            RangeSet::parse("0,1,10"),
            Err(Error::InvalidNumberCount(_))
        );
        assert_matches!(
            RangeSet::parse("3,1,2,3"),
            Err(Error::InvalidNumberCount(_))
        );
        assert_matches!(
            RangeSet::parse("4,1,10"),
            Err(Error::NumberCountMismatch(_))
        );
        assert_matches!(RangeSet::parse("2,a,b"), Err(Error::InvalidNumber(..)));
        assert_matches!(RangeSet::parse("-2,1,10"), Err(Error::InvalidNumber(..)));
        assert_matches!(
            RangeSet::parse("2,2,2"),
            Err(Error::EmptyRange { start: 2, end: 2 })
        );
        assert_matches!(
            RangeSet::parse("2,5,3"),
            Err(Error::EmptyRange { start: 5, end: 3 })
        );
    }

    #[test]
    fn block_number() {
        let set = RangeSet::parse("4,10,12,20,22").unwrap();
        assert_eq!(set.block_number(0), Some(10));
        assert_eq!(set.block_number(1), Some(11));
        assert_eq!(set.block_number(2), Some(20));
        assert_eq!(set.block_number(3), Some(21));
        assert_eq!(set.block_number(4), None);
    }

    #[test]
    fn overlaps_half_open() {
        let a = RangeSet::parse("2,3,5").unwrap();
        let b = RangeSet::parse("2,5,7").unwrap();
        assert!(!a.overlaps(&b));
        assert!(!b.overlaps(&a));

        let c = RangeSet::parse("2,3,6").unwrap();
        assert!(c.overlaps(&b));
        assert!(b.overlaps(&c));
    }

    #[test]
    fn split_evenly() {
        let set = RangeSet::parse("4,0,5,10,15").unwrap();

        let groups = set.split(3);
        assert_eq!(groups.len(), 3);
        assert_eq!(
            groups.iter().map(RangeSet::blocks).collect::<Vec<_>>(),
            [4, 3, 3]
        );
        assert_eq!(groups[0].ranges(), &[0..4]);
        assert_eq!(groups[1].ranges(), &[4..5, 10..12]);
        assert_eq!(groups[2].ranges(), &[12..15]);
    }

    #[test]
    fn split_more_groups_than_blocks() {
        let set = RangeSet::parse("2,0,4").unwrap();

        let groups = set.split(10);
        assert_eq!(groups.len(), 4);
        assert!(groups.iter().all(|g| g.blocks() == 1));
        assert_eq!(
            groups.iter().map(RangeSet::blocks).sum::<u64>(),
            set.blocks()
        );
    }

    #[test]
    fn split_empty() {
        assert!(RangeSet::default().split(4).is_empty());
        assert!(RangeSet::parse("2,0,4").unwrap().split(0).is_empty());
    }

    #[test]
    fn sorted_insert_merges() {
        let mut set = SortedRangeSet::new();
        set.insert(5..8);
        set.insert(10..12);
        assert_eq!(set.ranges(), &[5..8, 10..12]);
        assert_eq!(set.blocks(), 5);

        // Adjacent on both sides.
        set.insert(8..10);
        assert_eq!(set.ranges(), &[5..12]);
        assert_eq!(set.blocks(), 7);

        set.insert(1..3);
        set.insert(2..6);
        assert_eq!(set.ranges(), &[1..12]);
        assert_eq!(set.blocks(), 11);
    }

    #[test]
    fn sorted_insert_bytes() {
        let mut set = SortedRangeSet::new();
        set.insert_bytes(0, 1);
        assert_eq!(set.ranges(), &[0..1]);

        set.insert_bytes(BLOCK_SIZE, BLOCK_SIZE);
        assert_eq!(set.ranges(), &[0..2]);

        set.insert_bytes(10 * BLOCK_SIZE - 1, 2);
        assert_eq!(set.ranges(), &[0..2, 9..11]);

        assert!(set.overlaps_bytes(BLOCK_SIZE + 1, 1));
        assert!(!set.overlaps_bytes(5 * BLOCK_SIZE, BLOCK_SIZE));
        assert!(set.overlaps_bytes(8 * BLOCK_SIZE, BLOCK_SIZE + 1));
    }

    #[test]
    fn offset_in_set() {
        let mut set = SortedRangeSet::new();
        set.insert(0..2);
        set.insert(10..12);

        assert_eq!(set.offset_in_set(5).unwrap(), 5);
        assert_eq!(
            set.offset_in_set(10 * BLOCK_SIZE + 5).unwrap(),
            2 * BLOCK_SIZE + 5
        );
        assert_eq!(
            set.offset_in_set(11 * BLOCK_SIZE).unwrap(),
            3 * BLOCK_SIZE
        );

        assert_matches!(
            set.offset_in_set(5 * BLOCK_SIZE),
            Err(Error::OffsetNotCovered(_))
        );
    }
}
