// SPDX-FileCopyrightText: 2024-2026 blockota contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io::{self, Read, Write},
    sync::atomic::AtomicBool,
};

use bzip2::read::BzDecoder;
use thiserror::Error;
use zerocopy::{FromBytes, FromZeros, IntoBytes};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::stream::{self, check_cancel};

pub const MAGIC: &[u8; 8] = b"BSDIFF40";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Patch is too small: {0} bytes")]
    TooSmall(usize),
    #[error("Invalid magic: {0:?}")]
    InvalidMagic([u8; 8]),
    #[error("Negative length in header: {0}")]
    NegativeLength(i64),
    #[error("Compressed streams exceed patch size: {0} > {1}")]
    StreamsTooLarge(u64, usize),
    #[error("Negative copy length in control entry: {0}")]
    NegativeCopy(i64),
    #[error("Control entries exceed output size: {0}")]
    OutputOverrun(u64),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Fixed header: magic followed by three sign-magnitude little-endian
/// lengths (control stream, diff stream, output size). The three bzip2
/// streams follow back to back.
#[derive(FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned)]
#[repr(C)]
struct Header {
    magic: [u8; 8],
    ctrl_len: [u8; 8],
    diff_len: [u8; 8],
    new_size: [u8; 8],
}

#[derive(FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned)]
#[repr(C)]
struct ControlEntry {
    diff_count: [u8; 8],
    extra_count: [u8; 8],
    seek: [u8; 8],
}

/// Decode an 8-byte sign-magnitude little-endian value. The sign lives in
/// the high bit of the last byte.
fn decode_off(buf: &[u8; 8]) -> i64 {
    let mut bytes = *buf;
    let negative = bytes[7] & 0x80 != 0;
    bytes[7] &= 0x7f;

    let magnitude = i64::from_le_bytes(bytes);
    if negative { -magnitude } else { magnitude }
}

/// Apply a `BSDIFF40` patch to `old_data`, streaming the output into `sink`.
/// On success, the sink receives exactly the output size declared in the
/// patch header.
pub fn apply(
    old_data: &[u8],
    patch: &[u8],
    mut sink: impl Write,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let Ok((header, _)) = Header::read_from_prefix(patch) else {
        return Err(Error::TooSmall(patch.len()));
    };

    if header.magic != *MAGIC {
        return Err(Error::InvalidMagic(header.magic));
    }

    let ctrl_len = decode_off(&header.ctrl_len);
    let diff_len = decode_off(&header.diff_len);
    let new_size = decode_off(&header.new_size);

    for len in [ctrl_len, diff_len, new_size] {
        if len < 0 {
            return Err(Error::NegativeLength(len));
        }
    }

    let header_size = size_of::<Header>();
    let streams_end = (header_size as u64) + ctrl_len as u64 + diff_len as u64;
    if streams_end > patch.len() as u64 {
        return Err(Error::StreamsTooLarge(streams_end, patch.len()));
    }

    let diff_start = header_size + ctrl_len as usize;
    let extra_start = diff_start + diff_len as usize;

    let mut ctrl_stream = BzDecoder::new(&patch[header_size..diff_start]);
    let mut diff_stream = BzDecoder::new(&patch[diff_start..extra_start]);
    let mut extra_stream = BzDecoder::new(&patch[extra_start..]);

    let new_size = new_size as u64;
    let mut new_pos: u64 = 0;
    let mut old_pos: i64 = 0;
    let mut buf = [0u8; 16384];

    while new_pos < new_size {
        check_cancel(cancel_signal)?;

        let mut entry = ControlEntry::new_zeroed();
        ctrl_stream.read_exact(entry.as_mut_bytes())?;

        let diff_count = decode_off(&entry.diff_count);
        let extra_count = decode_off(&entry.extra_count);
        let seek = decode_off(&entry.seek);

        for count in [diff_count, extra_count] {
            if count < 0 {
                return Err(Error::NegativeCopy(count));
            }
        }

        let diff_count = diff_count as u64;
        let extra_count = extra_count as u64;

        if diff_count > new_size - new_pos {
            return Err(Error::OutputOverrun(new_size));
        }

        // Diff bytes are added to the old data wherever the old position is
        // in bounds and pass through unchanged everywhere else.
        let mut offset: u64 = 0;
        while offset < diff_count {
            check_cancel(cancel_signal)?;

            let n = (diff_count - offset).min(buf.len() as u64) as usize;
            diff_stream.read_exact(&mut buf[..n])?;

            for (i, byte) in buf[..n].iter_mut().enumerate() {
                let old_idx = old_pos.wrapping_add((offset + i as u64) as i64);
                if old_idx >= 0 && (old_idx as u64) < old_data.len() as u64 {
                    *byte = byte.wrapping_add(old_data[old_idx as usize]);
                }
            }

            sink.write_all(&buf[..n])?;
            offset += n as u64;
        }

        new_pos += diff_count;
        old_pos = old_pos.wrapping_add(diff_count as i64);

        if extra_count > new_size - new_pos {
            return Err(Error::OutputOverrun(new_size));
        }

        stream::copy_n(&mut extra_stream, &mut sink, extra_count, cancel_signal)?;

        new_pos += extra_count;
        old_pos = old_pos.wrapping_add(seek);
    }

    Ok(())
}

#[cfg(test)]
pub(crate) fn bz_compress(data: &[u8]) -> Vec<u8> {
    use std::io::Write as _;

    let mut encoder = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::new(9));
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

#[cfg(test)]
pub(crate) fn encode_off(value: i64) -> [u8; 8] {
    let mut bytes = value.unsigned_abs().to_le_bytes();
    if value < 0 {
        bytes[7] |= 0x80;
    }
    bytes
}

/// Generate a valid patch that transforms `old` into `new`: one control
/// entry diffing the common prefix and one appending the remainder as extra
/// data. Not a real diff algorithm, but it fully exercises the decoder.
#[cfg(test)]
pub(crate) fn generate(old: &[u8], new: &[u8]) -> Vec<u8> {
    let overlap = old.len().min(new.len());

    let mut ctrl = Vec::new();
    ctrl.extend_from_slice(&encode_off(overlap as i64));
    ctrl.extend_from_slice(&encode_off((new.len() - overlap) as i64));
    ctrl.extend_from_slice(&encode_off(0));

    let diff = new[..overlap]
        .iter()
        .zip(&old[..overlap])
        .map(|(n, o)| n.wrapping_sub(*o))
        .collect::<Vec<_>>();

    let ctrl = bz_compress(&ctrl);
    let diff = bz_compress(&diff);
    let extra = bz_compress(&new[overlap..]);

    let mut patch = Vec::new();
    patch.extend_from_slice(MAGIC);
    patch.extend_from_slice(&encode_off(ctrl.len() as i64));
    patch.extend_from_slice(&encode_off(diff.len() as i64));
    patch.extend_from_slice(&encode_off(new.len() as i64));
    patch.extend_from_slice(&ctrl);
    patch.extend_from_slice(&diff);
    patch.extend_from_slice(&extra);

    patch
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use rand::RngCore;

    use super::*;

    fn make_patch(entries: &[(i64, i64, i64)], diff: &[u8], extra: &[u8], new_size: i64) -> Vec<u8> {
        let mut ctrl = Vec::new();
        for &(d, e, s) in entries {
            ctrl.extend_from_slice(&encode_off(d));
            ctrl.extend_from_slice(&encode_off(e));
            ctrl.extend_from_slice(&encode_off(s));
        }

        let ctrl = bz_compress(&ctrl);
        let diff = bz_compress(diff);
        let extra = bz_compress(extra);

        let mut patch = Vec::new();
        patch.extend_from_slice(MAGIC);
        patch.extend_from_slice(&encode_off(ctrl.len() as i64));
        patch.extend_from_slice(&encode_off(diff.len() as i64));
        patch.extend_from_slice(&encode_off(new_size));
        patch.extend_from_slice(&ctrl);
        patch.extend_from_slice(&diff);
        patch.extend_from_slice(&extra);

        patch
    }

    fn apply_to_vec(old: &[u8], patch: &[u8]) -> Result<Vec<u8>> {
        let cancel_signal = AtomicBool::new(false);
        let mut new = Vec::new();
        apply(old, patch, &mut new, &cancel_signal)?;
        Ok(new)
    }

    #[test]
    fn offsets_round_trip() {
        for value in [0, 1, -1, 127, -128, i64::MAX, i64::MIN + 1] {
            assert_eq!(decode_off(&encode_off(value)), value);
        }

        // Negative zero decodes as zero.
        let mut bytes = [0u8; 8];
        bytes[7] = 0x80;
        assert_eq!(decode_off(&bytes), 0);
    }

    #[test]
    fn round_trip_empty() {
        assert_eq!(apply_to_vec(b"", &generate(b"", b"")).unwrap(), b"");
        assert_eq!(apply_to_vec(b"old", &generate(b"old", b"")).unwrap(), b"");
    }

    #[test]
    fn round_trip_single_byte() {
        assert_eq!(apply_to_vec(b"a", &generate(b"a", b"b")).unwrap(), b"b");
        assert_eq!(apply_to_vec(b"", &generate(b"", b"x")).unwrap(), b"x");
    }

    #[test]
    fn round_trip_random() {
        let mut rng = rand::thread_rng();

        let mut old = vec![0u8; 5000];
        let mut new = vec![0u8; 6000];
        rng.fill_bytes(&mut old);
        rng.fill_bytes(&mut new);

        assert_eq!(apply_to_vec(&old, &generate(&old, &new)).unwrap(), new);
    }

    #[test]
    fn negative_seek() {
        // Second entry rereads the start of the old data with +1 diffs.
        let old = b"abcdef";
        let diff = [0, 0, 0, 1, 1, 1];
        let patch = make_patch(&[(3, 0, -3), (3, 0, 0)], &diff, b"", 6);

        assert_eq!(apply_to_vec(old, &patch).unwrap(), b"abcbcd");
    }

    #[test]
    fn diff_beyond_old_data() {
        // Bytes past the end of the old data pass through unchanged.
        let old = b"ab";
        let diff = [1, 1, 1, 1];
        let patch = make_patch(&[(4, 0, 0)], &diff, b"", 4);

        assert_eq!(apply_to_vec(old, &patch).unwrap(), [b'b', b'c', 1, 1]);
    }

    #[test]
    fn invalid_patches() {
        assert_matches!(apply_to_vec(b"", b"BSDIFF40"), Err(Error::TooSmall(8)));

        let mut patch = generate(b"old", b"new");
        patch[..8].copy_from_slice(b"BSDIFF41");
        assert_matches!(apply_to_vec(b"old", &patch), Err(Error::InvalidMagic(_)));

        let mut patch = generate(b"old", b"new");
        patch[15] |= 0x80;
        assert_matches!(apply_to_vec(b"old", &patch), Err(Error::NegativeLength(_)));

        // Control stream length pointing past the end of the patch.
        let mut patch = generate(b"old", b"new");
        patch[8..16].copy_from_slice(&encode_off(1 << 30));
        assert_matches!(apply_to_vec(b"old", &patch), Err(Error::StreamsTooLarge(..)));
    }

    #[test]
    fn output_overrun() {
        let diff = [0u8; 8];
        let patch = make_patch(&[(8, 0, 0)], &diff, b"", 4);

        assert_matches!(apply_to_vec(b"", &patch), Err(Error::OutputOverrun(4)));
    }

    #[test]
    fn truncated_control_stream() {
        // Output size is larger than what the control entries produce, so the
        // decoder hits EOF in the control stream.
        let patch = make_patch(&[(0, 2, 0)], b"", b"ab", 4);

        assert_matches!(apply_to_vec(b"", &patch), Err(Error::Io(_)));
    }
}
