use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt};
use log::trace;
use std::io::{Cursor, Read, Seek, SeekFrom};

use crate::chunk::{CHUNK_MAGIC, EVTX_CHUNK_SIZE};
use crate::err::{EvtxError, Result};

pub const EVTX_FILE_HEADER_SIZE: usize = 128;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeaderFlags: u32 {
        /// The file was not closed cleanly; header fields may lag the data.
        const DIRTY = 0x1;
        const FULL = 0x2;
        /// Chunk checksums are not maintained for this file.
        const NO_CRC32 = 0x4;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvtxFileHeader {
    pub first_chunk_number: u64,
    pub last_chunk_number: u64,
    pub next_record_id: u64,
    pub header_size: u32,
    pub minor_version: u16,
    pub major_version: u16,
    pub header_block_size: u16,
    pub chunk_count: u16,
    pub flags: HeaderFlags,
    // Checksum is of the first 120 bytes of the header.
    pub checksum: u32,
}

impl EvtxFileHeader {
    /// Parse the file header from the start of `buffer`.
    ///
    /// This is a cold path (once per file), so it reads through a `Cursor`
    /// rather than the slice cursor used by record decoding.
    pub fn from_buffer(buffer: &[u8]) -> Result<EvtxFileHeader> {
        if buffer.len() < EVTX_FILE_HEADER_SIZE {
            return Err(EvtxError::TruncatedFileHeader { len: buffer.len() });
        }

        let mut stream = Cursor::new(buffer);
        let mut magic = [0_u8; 8];
        stream.read_exact(&mut magic)?;

        if &magic != b"ElfFile\x00" {
            return Err(EvtxError::InvalidFileMagic { magic });
        }

        let first_chunk_number = stream.read_u64::<LittleEndian>()?;
        let last_chunk_number = stream.read_u64::<LittleEndian>()?;
        let next_record_id = stream.read_u64::<LittleEndian>()?;
        let header_size = stream.read_u32::<LittleEndian>()?;
        let minor_version = stream.read_u16::<LittleEndian>()?;
        let major_version = stream.read_u16::<LittleEndian>()?;
        let header_block_size = stream.read_u16::<LittleEndian>()?;
        let chunk_count = stream.read_u16::<LittleEndian>()?;

        // Unused
        stream.seek(SeekFrom::Current(76))?;
        let flags = HeaderFlags::from_bits_retain(stream.read_u32::<LittleEndian>()?);
        let checksum = stream.read_u32::<LittleEndian>()?;

        Ok(EvtxFileHeader {
            first_chunk_number,
            last_chunk_number,
            next_record_id,
            header_size,
            minor_version,
            major_version,
            header_block_size,
            chunk_count,
            flags,
            checksum,
        })
    }

    pub fn is_dirty(&self) -> bool {
        self.flags.contains(HeaderFlags::DIRTY)
    }
}

/// Enumerate the file offsets of all chunks in `buffer`.
///
/// The chunk region begins at `header_block_size` and chunks are laid out in
/// 64 KiB steps. Blocks without the chunk magic are skipped (dirty files can
/// contain gaps); the scan stops once a chunk header would run past the end
/// of the buffer. A file with no chunks yields an empty list.
pub fn chunk_offsets(buffer: &[u8], header: &EvtxFileHeader) -> Vec<usize> {
    candidate_chunk_offsets(buffer, header)
        .into_iter()
        .filter(|&offset| {
            let is_chunk = buffer[offset..offset + 8] == CHUNK_MAGIC;
            if !is_chunk {
                trace!("no chunk magic at file offset {offset}, skipping block");
            }
            is_chunk
        })
        .collect()
}

/// All 64 KiB-aligned block offsets whose chunk header fits the buffer,
/// without the magic gate.
///
/// The parse loop hands every non-empty candidate to the chunk walker so
/// that a chunk with a damaged magic still surfaces as a warned, record-less
/// result instead of vanishing silently.
pub(crate) fn candidate_chunk_offsets(buffer: &[u8], header: &EvtxFileHeader) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(usize::from(header.chunk_count));
    let mut offset = usize::from(header.header_block_size);

    while offset + crate::chunk::EVTX_CHUNK_HEADER_SIZE <= buffer.len() {
        offsets.push(offset);
        offset += EVTX_CHUNK_SIZE;
    }

    offsets
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn header_bytes(chunk_count: u16, flags: u32) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4096);
        buf.extend_from_slice(b"ElfFile\x00");
        buf.extend_from_slice(&0u64.to_le_bytes()); // first chunk
        buf.extend_from_slice(&25u64.to_le_bytes()); // last chunk
        buf.extend_from_slice(&2226u64.to_le_bytes()); // next record id
        buf.extend_from_slice(&128u32.to_le_bytes()); // header size
        buf.extend_from_slice(&1u16.to_le_bytes()); // minor
        buf.extend_from_slice(&3u16.to_le_bytes()); // major
        buf.extend_from_slice(&4096u16.to_le_bytes()); // block size
        buf.extend_from_slice(&chunk_count.to_le_bytes());
        buf.resize(120, 0);
        buf.extend_from_slice(&flags.to_le_bytes());
        buf.extend_from_slice(&0xDEADBEEFu32.to_le_bytes());
        buf.resize(4096, 0);
        buf
    }

    #[test]
    fn test_parses_file_header() {
        let buf = header_bytes(26, 1);
        let header = EvtxFileHeader::from_buffer(&buf).unwrap();
        assert_eq!(
            header,
            EvtxFileHeader {
                first_chunk_number: 0,
                last_chunk_number: 25,
                next_record_id: 2226,
                header_size: 128,
                minor_version: 1,
                major_version: 3,
                header_block_size: 4096,
                chunk_count: 26,
                flags: HeaderFlags::DIRTY,
                checksum: 0xDEADBEEF,
            }
        );
        assert!(header.is_dirty());
    }

    #[test]
    fn test_rejects_wrong_magic() {
        let mut buf = header_bytes(1, 0);
        buf[0] = b'X';
        match EvtxFileHeader::from_buffer(&buf) {
            Err(EvtxError::InvalidFileMagic { .. }) => {}
            other => panic!("expected InvalidFileMagic, got {other:?}"),
        }
    }

    #[test]
    fn test_rejects_truncated_header() {
        let buf = header_bytes(1, 0);
        match EvtxFileHeader::from_buffer(&buf[..64]) {
            Err(EvtxError::TruncatedFileHeader { len: 64 }) => {}
            other => panic!("expected TruncatedFileHeader, got {other:?}"),
        }
    }

    #[test]
    fn test_chunk_walk_skips_blocks_without_magic() {
        let header_buf = header_bytes(2, 0);
        let header = EvtxFileHeader::from_buffer(&header_buf).unwrap();

        let mut buf = header_buf;
        // First block: valid chunk magic. Second: garbage. Third: valid.
        for magic in [&CHUNK_MAGIC[..], b"notachnk", &CHUNK_MAGIC[..]] {
            let start = buf.len();
            buf.resize(start + EVTX_CHUNK_SIZE, 0);
            buf[start..start + 8].copy_from_slice(magic);
        }

        assert_eq!(
            chunk_offsets(&buf, &header),
            vec![4096, 4096 + 2 * EVTX_CHUNK_SIZE]
        );
    }

    #[test]
    fn test_chunkless_file_yields_empty_list() {
        let buf = header_bytes(0, 0);
        let header = EvtxFileHeader::from_buffer(&buf).unwrap();
        assert!(chunk_offsets(&buf, &header).is_empty());
    }
}
