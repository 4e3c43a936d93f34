// SPDX-FileCopyrightText: 2024-2026 blockota contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io::{self, Read, Write},
    sync::atomic::AtomicBool,
};

use flate2::{Compress, Compression, read::DeflateDecoder, write::ZlibEncoder};
use thiserror::Error;
use zerocopy::{FromBytes, little_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{format::bsdiff, stream::check_cancel};

pub const MAGIC: &[u8; 8] = b"IMGDIFF2";

const CHUNK_NORMAL: u32 = 0;
const CHUNK_GZIP: u32 = 1;
const CHUNK_DEFLATE: u32 = 2;
const CHUNK_RAW: u32 = 3;

/// zlib's only defined compression method.
const METHOD_DEFLATED: i32 = 8;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Patch is too small: {0} bytes")]
    TooSmall(usize),
    #[error("Invalid magic: {0:?}")]
    InvalidMagic([u8; 8]),
    #[error("Chunk #{0} header is truncated")]
    TruncatedHeader(u32),
    #[error("Chunk #{0} data is truncated")]
    TruncatedData(u32),
    #[error("Chunk #{index} source window [{start}, +{len}) exceeds source size {size}")]
    SourceOverrun {
        index: u32,
        start: u64,
        len: u64,
        size: usize,
    },
    #[error("Chunk #{index} patch offset {offset} exceeds patch size {size}")]
    PatchOffsetOverrun {
        index: u32,
        offset: u64,
        size: usize,
    },
    #[error("Chunk #{index} expanded to {actual} bytes, but expected {expected}")]
    ExpandedSizeMismatch {
        index: u32,
        expected: u64,
        actual: u64,
    },
    #[error("Chunk #{0} uses the legacy gzip format")]
    GzipUnsupported(u32),
    #[error("Chunk #{index} has unknown type: {kind}")]
    UnknownChunkType { index: u32, kind: u32 },
    #[error("Chunk #{0} records unsupported deflate parameters")]
    UnsupportedDeflateParams(u32),
    #[error("Chunk #{index} patch failed to apply")]
    Bsdiff {
        index: u32,
        #[source]
        source: bsdiff::Error,
    },
    #[error("I/O error")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned)]
#[repr(C)]
struct Header {
    magic: [u8; 8],
    num_chunks: little_endian::U32,
}

#[derive(FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned)]
#[repr(C)]
struct NormalHeader {
    src_start: little_endian::U64,
    src_len: little_endian::U64,
    patch_offset: little_endian::U64,
}

/// The trailing five fields record the zlib parameters the target chunk was
/// originally compressed with. `target_len` is informational only.
#[derive(FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned)]
#[repr(C)]
struct DeflateHeader {
    src_start: little_endian::U64,
    src_len: little_endian::U64,
    patch_offset: little_endian::U64,
    expanded_len: little_endian::U64,
    target_len: little_endian::U64,
    level: little_endian::I32,
    method: little_endian::I32,
    window_bits: little_endian::I32,
    mem_level: little_endian::I32,
    strategy: little_endian::I32,
}

fn source_window<'a>(old_data: &'a [u8], start: u64, len: u64, index: u32) -> Result<&'a [u8]> {
    let end = start
        .checked_add(len)
        .filter(|&e| e <= old_data.len() as u64)
        .ok_or(Error::SourceOverrun {
            index,
            start,
            len,
            size: old_data.len(),
        })?;

    Ok(&old_data[start as usize..end as usize])
}

fn patch_from(patch: &[u8], offset: u64, index: u32) -> Result<&[u8]> {
    if offset > patch.len() as u64 {
        return Err(Error::PatchOffsetOverrun {
            index,
            offset,
            size: patch.len(),
        });
    }

    Ok(&patch[offset as usize..])
}

fn apply_deflate_chunk(
    old_data: &[u8],
    patch: &[u8],
    header: &DeflateHeader,
    bonus_data: Option<&[u8]>,
    index: u32,
    mut sink: impl Write,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let src = source_window(old_data, header.src_start.get(), header.src_len.get(), index)?;
    let patch_data = patch_from(patch, header.patch_offset.get(), index)?;

    let expanded_len = header.expanded_len.get();
    let bonus_size = bonus_data.map_or(0, |b| b.len() as u64);

    // The source window must inflate to the expanded size minus exactly the
    // bonus bytes, which then fill the tail.
    let expected = expanded_len
        .checked_sub(bonus_size)
        .ok_or(Error::ExpandedSizeMismatch {
            index,
            expected: expanded_len,
            actual: bonus_size,
        })?;

    let mut expanded = Vec::new();
    DeflateDecoder::new(src)
        .take(expected.saturating_add(1))
        .read_to_end(&mut expanded)?;

    if expanded.len() as u64 != expected {
        return Err(Error::ExpandedSizeMismatch {
            index,
            expected,
            actual: expanded.len() as u64,
        });
    }

    if let Some(bonus) = bonus_data {
        expanded.extend_from_slice(bonus);
    }

    let mut target = Vec::new();
    bsdiff::apply(&expanded, patch_data, &mut target, cancel_signal)
        .map_err(|e| Error::Bsdiff { index, source: e })?;

    // Byte-identical output requires compressing with the recorded
    // parameters. The memory level and strategy are always the zlib defaults
    // in practice and are the only combination flate2 can express.
    let level = header.level.get();
    let window_bits = header.window_bits.get();

    if !(0..=9).contains(&level)
        || header.method.get() != METHOD_DEFLATED
        || !(9..=15).contains(&window_bits.unsigned_abs())
        || header.mem_level.get() != 8
        || header.strategy.get() != 0
    {
        return Err(Error::UnsupportedDeflateParams(index));
    }

    let compress = Compress::new_with_window_bits(
        Compression::new(level as u32),
        window_bits > 0,
        window_bits.unsigned_abs() as u8,
    );

    let mut encoder = ZlibEncoder::new_with_compress(&mut sink, compress);
    encoder.write_all(&target)?;
    encoder.finish()?;

    Ok(())
}

/// Apply an `IMGDIFF2` patch to `old_data`, streaming the concatenated chunk
/// outputs into `sink`. `bonus_data`, when present, supplies the expanded
/// tail of the second chunk's source window. Any chunk failure aborts the
/// whole apply.
pub fn apply(
    old_data: &[u8],
    patch: &[u8],
    bonus_data: Option<&[u8]>,
    mut sink: impl Write,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let Ok((header, _)) = Header::read_from_prefix(patch) else {
        return Err(Error::TooSmall(patch.len()));
    };

    if header.magic != *MAGIC {
        return Err(Error::InvalidMagic(header.magic));
    }

    let mut pos = size_of::<Header>();

    for index in 0..header.num_chunks.get() {
        check_cancel(cancel_signal)?;

        let Ok((kind, _)) = little_endian::U32::read_from_prefix(&patch[pos..]) else {
            return Err(Error::TruncatedHeader(index));
        };
        pos += 4;

        match kind.get() {
            CHUNK_NORMAL => {
                let Ok((hdr, _)) = NormalHeader::read_from_prefix(&patch[pos..]) else {
                    return Err(Error::TruncatedHeader(index));
                };
                pos += size_of::<NormalHeader>();

                let src =
                    source_window(old_data, hdr.src_start.get(), hdr.src_len.get(), index)?;
                let patch_data = patch_from(patch, hdr.patch_offset.get(), index)?;

                bsdiff::apply(src, patch_data, &mut sink, cancel_signal)
                    .map_err(|e| Error::Bsdiff { index, source: e })?;
            }
            CHUNK_RAW => {
                let Ok((len, _)) = little_endian::U32::read_from_prefix(&patch[pos..]) else {
                    return Err(Error::TruncatedHeader(index));
                };
                pos += 4;

                let len = len.get() as usize;
                if len > patch.len() - pos {
                    return Err(Error::TruncatedData(index));
                }

                sink.write_all(&patch[pos..pos + len])?;
                pos += len;
            }
            CHUNK_DEFLATE => {
                let Ok((hdr, _)) = DeflateHeader::read_from_prefix(&patch[pos..]) else {
                    return Err(Error::TruncatedHeader(index));
                };
                pos += size_of::<DeflateHeader>();

                let bonus = if index == 1 { bonus_data } else { None };
                apply_deflate_chunk(old_data, patch, &hdr, bonus, index, &mut sink, cancel_signal)?;
            }
            CHUNK_GZIP => return Err(Error::GzipUnsupported(index)),
            kind => return Err(Error::UnknownChunkType { index, kind }),
        }
    }

    Ok(())
}
