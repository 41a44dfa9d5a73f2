use jiff::Timestamp;

use crate::err::{DeserializationError, DeserializationResult};
use crate::utils::ByteCursor;
use crate::utils::time::filetime_to_timestamp;

pub const EVTX_RECORD_MAGIC: [u8; 4] = [0x2A, 0x2A, 0x00, 0x00];

/// Fixed bytes around the BinXml payload: 24-byte header + 4-byte size copy.
pub(crate) const EVTX_RECORD_FRAMING_SIZE: u32 = 28;

/// A record located inside a chunk. The payload is referenced by its
/// chunk-relative span; the bytes stay in the shared file buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct EvtxRecord {
    pub event_record_id: u64,
    pub timestamp: Timestamp,
    /// Raw FILETIME ticks, kept for zero-timestamp validation.
    pub timestamp_ticks: u64,
    pub size: u32,
    pub size_copy: u32,
    /// Chunk-relative offset of the first BinXml payload byte.
    pub payload_offset: usize,
    pub payload_len: usize,
}

impl EvtxRecord {
    /// Parse a record at chunk-relative `offset` within `chunk_data`.
    ///
    /// Fails on wrong magic or an implausible size; a size/size-copy mismatch
    /// is preserved on the record and reported by the caller as a warning.
    pub(crate) fn parse(chunk_data: &[u8], offset: usize) -> DeserializationResult<EvtxRecord> {
        let mut cursor = ByteCursor::with_pos(chunk_data, offset)?;

        let magic = cursor.array::<4>("record magic")?;
        if magic != EVTX_RECORD_MAGIC {
            return Err(DeserializationError::InvalidRecordMagic { magic });
        }

        let size = cursor.u32_named("record size")?;
        let event_record_id = cursor.u64_named("record id")?;
        let timestamp_ticks = cursor.u64_named("record timestamp")?;

        // Smallest well-formed record: framing plus one payload byte.
        if size <= EVTX_RECORD_FRAMING_SIZE
            || offset + size as usize > chunk_data.len()
        {
            return Err(DeserializationError::ImplausibleRecordSize {
                record_id: event_record_id,
                size,
            });
        }

        let payload_offset = cursor.pos();
        let payload_len = (size - EVTX_RECORD_FRAMING_SIZE) as usize;

        cursor.advance(payload_len, "record payload")?;
        let size_copy = cursor.u32_named("record size copy")?;

        let timestamp = filetime_to_timestamp(timestamp_ticks).unwrap_or(Timestamp::UNIX_EPOCH);

        Ok(EvtxRecord {
            event_record_id,
            timestamp,
            timestamp_ticks,
            size,
            size_copy,
            payload_offset,
            payload_len,
        })
    }

    pub fn size_fields_agree(&self) -> bool {
        self.size == self.size_copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record_bytes(id: u64, payload: &[u8], size_copy_delta: u32) -> Vec<u8> {
        let size = EVTX_RECORD_FRAMING_SIZE + payload.len() as u32;
        let mut buf = Vec::new();
        buf.extend_from_slice(&EVTX_RECORD_MAGIC);
        buf.extend_from_slice(&size.to_le_bytes());
        buf.extend_from_slice(&id.to_le_bytes());
        buf.extend_from_slice(&131_124_751_716_816_400u64.to_le_bytes());
        buf.extend_from_slice(payload);
        buf.extend_from_slice(&(size + size_copy_delta).to_le_bytes());
        buf
    }

    #[test]
    fn test_parses_record() {
        let payload = [0x0F, 0x01, 0x01, 0x00, 0x00];
        let buf = record_bytes(7, &payload, 0);
        let record = EvtxRecord::parse(&buf, 0).unwrap();
        assert_eq!(record.event_record_id, 7);
        assert_eq!(record.size, 33);
        assert_eq!(record.payload_offset, 24);
        assert_eq!(record.payload_len, 5);
        assert!(record.size_fields_agree());
    }

    #[test]
    fn test_size_copy_mismatch_is_not_fatal() {
        let buf = record_bytes(7, &[0x0F, 0x01, 0x01, 0x00], 8);
        let record = EvtxRecord::parse(&buf, 0).unwrap();
        assert!(!record.size_fields_agree());
    }

    #[test]
    fn test_rejects_wrong_magic() {
        let mut buf = record_bytes(7, &[0x0F], 0);
        buf[0] = 0x2B;
        assert!(matches!(
            EvtxRecord::parse(&buf, 0),
            Err(DeserializationError::InvalidRecordMagic { .. })
        ));
    }

    #[test]
    fn test_rejects_implausible_size() {
        let mut buf = record_bytes(7, &[0x0F], 0);
        buf[4..8].copy_from_slice(&10u32.to_le_bytes());
        assert!(matches!(
            EvtxRecord::parse(&buf, 0),
            Err(DeserializationError::ImplausibleRecordSize { size: 10, .. })
        ));
    }

    #[test]
    fn test_rejects_size_past_end_of_chunk() {
        let mut buf = record_bytes(7, &[0x0F], 0);
        buf[4..8].copy_from_slice(&512u32.to_le_bytes());
        assert!(matches!(
            EvtxRecord::parse(&buf, 0),
            Err(DeserializationError::ImplausibleRecordSize { size: 512, .. })
        ));
    }
}
