//! Byte-slice utilities for bounds-oriented parsing.
//!
//! There are two layers:
//! - **Option layer** (`read_*`): zero-cost helpers that return `Option<T>`.
//! - **Result layer** (`*_r`): wrappers that map `None` to
//!   `DeserializationError::Truncated`.
//!
//! All numeric reads are little-endian (EVTX data is LE). Offsets are `usize`
//! and are interpreted relative to the slice you pass in.

use crate::err::{DeserializationError, DeserializationResult};

/// Read `N` raw bytes at `offset`.
///
/// Returns `None` if the range is out of bounds.
pub(crate) fn read_array<const N: usize>(buf: &[u8], offset: usize) -> Option<[u8; N]> {
    let end = offset.checked_add(N)?;
    let bytes: [u8; N] = buf.get(offset..end)?.try_into().ok()?;
    Some(bytes)
}

/// Read a single byte at `offset`.
pub(crate) fn read_u8(buf: &[u8], offset: usize) -> Option<u8> {
    buf.get(offset).copied()
}

/// Read a `u16` (little-endian) at `offset`.
pub(crate) fn read_u16_le(buf: &[u8], offset: usize) -> Option<u16> {
    Some(u16::from_le_bytes(read_array::<2>(buf, offset)?))
}

/// Read a `u32` (little-endian) at `offset`.
pub(crate) fn read_u32_le(buf: &[u8], offset: usize) -> Option<u32> {
    Some(u32::from_le_bytes(read_array::<4>(buf, offset)?))
}

/// Read a `u64` (little-endian) at `offset`.
pub(crate) fn read_u64_le(buf: &[u8], offset: usize) -> Option<u64> {
    Some(u64::from_le_bytes(read_array::<8>(buf, offset)?))
}

/// Borrow `len` bytes at `offset`, or fail with `Truncated`.
pub(crate) fn slice_r<'a>(
    buf: &'a [u8],
    offset: usize,
    len: usize,
    what: &'static str,
) -> DeserializationResult<&'a [u8]> {
    let end = offset
        .checked_add(len)
        .ok_or_else(|| truncated(buf, offset, len, what))?;
    buf.get(offset..end)
        .ok_or_else(|| truncated(buf, offset, len, what))
}

pub(crate) fn read_array_r<const N: usize>(
    buf: &[u8],
    offset: usize,
    what: &'static str,
) -> DeserializationResult<[u8; N]> {
    read_array::<N>(buf, offset).ok_or_else(|| truncated(buf, offset, N, what))
}

pub(crate) fn read_u16_le_r(
    buf: &[u8],
    offset: usize,
    what: &'static str,
) -> DeserializationResult<u16> {
    read_u16_le(buf, offset).ok_or_else(|| truncated(buf, offset, 2, what))
}

pub(crate) fn read_u32_le_r(
    buf: &[u8],
    offset: usize,
    what: &'static str,
) -> DeserializationResult<u32> {
    read_u32_le(buf, offset).ok_or_else(|| truncated(buf, offset, 4, what))
}

pub(crate) fn read_u64_le_r(
    buf: &[u8],
    offset: usize,
    what: &'static str,
) -> DeserializationResult<u64> {
    read_u64_le(buf, offset).ok_or_else(|| truncated(buf, offset, 8, what))
}

fn truncated(buf: &[u8], offset: usize, need: usize, what: &'static str) -> DeserializationError {
    DeserializationError::Truncated {
        what,
        offset: offset as u64,
        need,
        have: buf.len().saturating_sub(offset),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_little_endian_primitives() {
        let buf = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        assert_eq!(read_u8(&buf, 0), Some(0x01));
        assert_eq!(read_u16_le(&buf, 0), Some(0x0201));
        assert_eq!(read_u32_le(&buf, 2), Some(0x06050403));
        assert_eq!(read_u64_le(&buf, 0), Some(0x0807060504030201));
        assert_eq!(read_u32_le(&buf, 6), None);
    }

    #[test]
    fn test_result_layer_reports_offsets() {
        let buf = [0u8; 4];
        let err = read_u64_le_r(&buf, 2, "record header").unwrap_err();
        match err {
            DeserializationError::Truncated {
                offset, need, have, ..
            } => {
                assert_eq!(offset, 2);
                assert_eq!(need, 8);
                assert_eq!(have, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
