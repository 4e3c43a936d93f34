// SPDX-FileCopyrightText: 2024-2026 blockota contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use thiserror::Error;

use crate::{
    format::rangeset::{self, RangeSet},
    stream::{self, ReadAt, check_cancel},
    util,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Block map has fewer than 4 lines")]
    TooFewLines,
    #[error("Invalid file size or block size: {0:?}")]
    InvalidSizeLine(String),
    #[error("Invalid range count: {0:?}")]
    InvalidRangeCount(String),
    #[error("Block count does not fit in 32 bits: {0}")]
    TooManyBlocks(u64),
    #[error("Expected {expected} lines, but found {actual}")]
    LineCountMismatch { expected: usize, actual: usize },
    #[error("Invalid range line: {0:?}")]
    InvalidRangeLine(String),
    #[error("Range [{start}, {end}) exceeds the {remaining} remaining blocks")]
    RangeOverrun { start: u64, end: u64, remaining: u64 },
    #[error("Ranges leave {0} blocks uncovered")]
    UncoveredBlocks(u64),
    #[error("Invalid range set")]
    RangeSet(#[from] rangeset::Error),
    #[error("Failed to read block map: {0:?}")]
    ReadBlockMap(PathBuf, #[source] io::Error),
    #[error("Failed to read image: {0:?}")]
    ReadImage(PathBuf, #[source] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A parsed block map file: a description of one file as a device path plus
/// the device block ranges storing its contents in logical order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockMapData {
    path: PathBuf,
    file_size: u64,
    block_size: u32,
    ranges: RangeSet,
}

impl BlockMapData {
    /// Parse the textual form: line 0 is the device path, line 1 is
    /// `"<file_size> <block_size>"`, line 2 is the range count, and each
    /// following line is one `"<start> <end>"` block range. The ranges must
    /// cover exactly the number of blocks implied by the file size.
    pub fn parse(text: &str) -> Result<Self> {
        let lines = text.lines().collect::<Vec<_>>();
        if lines.len() < 4 {
            return Err(Error::TooFewLines);
        }

        let path = PathBuf::from(lines[0]);

        let (file_size, block_size) = lines[1]
            .split_once(' ')
            .and_then(|(f, b)| Some((f.parse::<u64>().ok()?, b.parse::<u32>().ok()?)))
            .filter(|&(f, b)| f != 0 && b != 0)
            .ok_or_else(|| Error::InvalidSizeLine(lines[1].to_owned()))?;

        let range_count = lines[2]
            .parse::<usize>()
            .ok()
            .filter(|&n| n != 0)
            .ok_or_else(|| Error::InvalidRangeCount(lines[2].to_owned()))?;

        let blocks = util::blocks_for_size(file_size, u64::from(block_size));
        if blocks > u64::from(u32::MAX) {
            return Err(Error::TooManyBlocks(blocks));
        }

        if lines.len() != 3 + range_count {
            return Err(Error::LineCountMismatch {
                expected: 3 + range_count,
                actual: lines.len(),
            });
        }

        let mut ranges = Vec::with_capacity(range_count);
        let mut remaining = blocks;

        for line in &lines[3..] {
            let (start, end) = line
                .split_once(' ')
                .and_then(|(s, e)| Some((s.parse::<u64>().ok()?, e.parse::<u64>().ok()?)))
                .filter(|&(s, e)| s < e)
                .ok_or_else(|| Error::InvalidRangeLine((*line).to_owned()))?;

            let range_blocks = end - start;
            if range_blocks > remaining {
                return Err(Error::RangeOverrun {
                    start,
                    end,
                    remaining,
                });
            }

            remaining -= range_blocks;
            ranges.push(start..end);
        }

        if remaining != 0 {
            return Err(Error::UncoveredBlocks(remaining));
        }

        Ok(Self {
            path,
            file_size,
            block_size,
            ranges: RangeSet::from_ranges(ranges)?,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn ranges(&self) -> &RangeSet {
        &self.ranges
    }

    /// Read every mapped range from `device` in logical order and assemble
    /// the contiguous file contents, truncated to the file size. The result
    /// is complete or an error, never a partial image.
    pub fn read_from(
        &self,
        device: &(impl ReadAt + ?Sized),
        cancel_signal: &AtomicBool,
    ) -> io::Result<Vec<u8>> {
        let block_size = u64::from(self.block_size);
        let mut buf =
            Vec::with_capacity(self.ranges.blocks() as usize * self.block_size as usize);

        for range in &self.ranges {
            check_cancel(cancel_signal)?;

            let offset = range.start * block_size;
            let size = ((range.end - range.start) * block_size) as usize;

            let start = buf.len();
            buf.resize(start + size, 0);
            device.read_exact_at(&mut buf[start..], offset)?;
        }

        buf.truncate(self.file_size as usize);

        Ok(buf)
    }
}

/// Load an image into one contiguous owned buffer. A spec beginning with `@`
/// names a block map file describing scattered ranges of a raw device; a
/// plain spec names a regular file.
pub fn load_image(spec: &str, cancel_signal: &AtomicBool) -> Result<Vec<u8>> {
    match spec.strip_prefix('@') {
        Some(map_path) => {
            let map_path = Path::new(map_path);
            let text = std::fs::read_to_string(map_path)
                .map_err(|e| Error::ReadBlockMap(map_path.to_owned(), e))?;
            let map = BlockMapData::parse(&text)?;

            let device = File::open(map.path())
                .map_err(|e| Error::ReadImage(map.path().to_owned(), e))?;

            map.read_from(&device, cancel_signal)
                .map_err(|e| Error::ReadImage(map.path().to_owned(), e))
        }
        None => {
            let path = Path::new(spec);
            let file = File::open(path).map_err(|e| Error::ReadImage(path.to_owned(), e))?;

            let mut buf = Vec::new();
            stream::copy(file, &mut buf, cancel_signal)
                .map_err(|e| Error::ReadImage(path.to_owned(), e))?;

            Ok(buf)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, io::Cursor, path::Path};

    use assert_matches::assert_matches;

    use crate::stream::MutexFile;

    use super::*;

    #[test]
    fn parse_valid() {
        let text = "/dev/abc\n49652 4096\n3\n1000 1008\n2100 2102\n30 33\n";
        let map = BlockMapData::parse(text).unwrap();

        assert_eq!(map.path(), Path::new("/dev/abc"));
        assert_eq!(map.file_size(), 49652);
        assert_eq!(map.block_size(), 4096);
        assert_eq!(map.ranges().ranges(), &[1000..1008, 2100..2102, 30..33]);
    }

    #[test]
    fn parse_wrong_range_count() {
        // Declaring 2 ranges with 3 data lines must fail.
        let text = "/dev/abc\n49652 4096\n2\n1000 1008\n2100 2102\n30 33\n";
        assert_matches!(
            BlockMapData::parse(text),
            Err(Error::LineCountMismatch {
                expected: 5,
                actual: 6,
            })
        );
    }

    #[test]
    fn parse_invalid() {
        assert_matches!(
            BlockMapData::parse("/dev/abc\n49652 4096\n3\n"),
            Err(Error::TooFewLines)
        );
        assert_matches!(
            BlockMapData::parse("/dev/abc\n0 4096\n1\n0 1\n"),
            Err(Error::InvalidSizeLine(_))
        );
        assert_matches!(
            BlockMapData::parse("/dev/abc\n49652 0\n1\n0 13\n"),
            Err(Error::InvalidSizeLine(_))
        );
        assert_matches!(
            BlockMapData::parse("/dev/abc\n49652 4096\n0\n0 13\n"),
            Err(Error::InvalidRangeCount(_))
        );
        assert_matches!(
            BlockMapData::parse("/dev/abc\n49652 4096\n1\n13 13\n"),
            Err(Error::InvalidRangeLine(_))
        );
        assert_matches!(
            BlockMapData::parse("/dev/abc\n49652 4096\n1\n0 20\n"),
            Err(Error::RangeOverrun {
                start: 0,
                end: 20,
                remaining: 13,
            })
        );
        assert_matches!(
            BlockMapData::parse("/dev/abc\n49652 4096\n2\n0 8\n8 10\n"),
            Err(Error::UncoveredBlocks(3))
        );
    }

    #[test]
    fn read_scattered_ranges() {
        let cancel_signal = AtomicBool::new(false);

        // 3 blocks of 4 bytes, stored out of order on the device.
        let map = BlockMapData::parse("/dev/abc\n10 4\n2\n4 6\n1 2\n").unwrap();

        let device_data = (0..28).collect::<Vec<u8>>();
        let device = MutexFile::new(Cursor::new(device_data));

        let image = map.read_from(&device, &cancel_signal).unwrap();
        assert_eq!(image, [16, 17, 18, 19, 20, 21, 22, 23, 4, 5]);
    }

    #[test]
    fn load_plain_and_mapped() {
        let cancel_signal = AtomicBool::new(false);
        let temp_dir = tempfile::tempdir().unwrap();

        let device_path = temp_dir.path().join("device.img");
        let device_data = (0u8..=255).cycle().take(6 * 4096).collect::<Vec<_>>();
        fs::write(&device_path, &device_data).unwrap();

        let loaded = load_image(device_path.to_str().unwrap(), &cancel_signal).unwrap();
        assert_eq!(loaded, device_data);

        let map_path = temp_dir.path().join("file.map");
        let map_text = format!(
            "{}\n{} 4096\n2\n4 6\n1 2\n",
            device_path.to_str().unwrap(),
            2 * 4096 + 100,
        );
        fs::write(&map_path, map_text).unwrap();

        let spec = format!("@{}", map_path.to_str().unwrap());
        let loaded = load_image(&spec, &cancel_signal).unwrap();

        let mut expected = device_data[4 * 4096..6 * 4096].to_vec();
        expected.extend_from_slice(&device_data[4096..2 * 4096]);
        expected.truncate(2 * 4096 + 100);
        assert_eq!(loaded, expected);
    }
}
