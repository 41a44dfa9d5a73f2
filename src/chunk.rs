use bitflags::bitflags;
use jiff::Timestamp;
use log::{debug, trace};

use crate::binxml::compile::CompiledTemplateCache;
use crate::binxml::decoder::XmlRenderer;
use crate::binxml::json::JsonRenderer;
use crate::binxml::ChunkCtx;
use crate::err::{DeserializationError, DeserializationResult};
use crate::parser::{OutputFormat, ParserSettings};
use crate::record::{EVTX_RECORD_MAGIC, EvtxRecord};
use crate::string_cache::StringCache;
use crate::template_cache::TemplateCache;
use crate::utils::ByteCursor;
use crate::utils::bytes;
use crate::utils::hexdump::hexdump;

pub const EVTX_CHUNK_SIZE: usize = 65536;
pub const EVTX_CHUNK_HEADER_SIZE: usize = 512;
pub(crate) const CHUNK_MAGIC: [u8; 8] = *b"ElfChnk\x00";

const STRING_TABLE_OFFSET: usize = 128;
const TEMPLATE_TABLE_OFFSET: usize = 384;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChunkFlags: u32 {
        const CORRUPTED = 0x1;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvtxChunkHeader {
    pub first_event_record_number: u64,
    pub last_event_record_number: u64,
    pub first_event_record_id: u64,
    pub last_event_record_id: u64,
    pub header_size: u32,
    pub last_event_record_data_offset: u32,
    pub free_space_offset: u32,
    pub events_checksum: u32,
    pub flags: ChunkFlags,
    pub header_chunk_checksum: u32,
    pub string_offsets: [u32; 64],
    pub template_offsets: [u32; 32],
}

impl EvtxChunkHeader {
    pub(crate) fn from_buffer(chunk_data: &[u8]) -> DeserializationResult<EvtxChunkHeader> {
        let mut cursor = ByteCursor::with_pos(chunk_data, 0)?;

        let magic = cursor.array::<8>("chunk magic")?;
        if magic != CHUNK_MAGIC {
            return Err(DeserializationError::InvalidChunkMagic { magic });
        }

        let first_event_record_number = cursor.u64_named("first event record number")?;
        let last_event_record_number = cursor.u64_named("last event record number")?;
        let first_event_record_id = cursor.u64_named("first event record id")?;
        let last_event_record_id = cursor.u64_named("last event record id")?;
        let header_size = cursor.u32_named("chunk header size")?;
        let last_event_record_data_offset = cursor.u32_named("last event record data offset")?;
        let free_space_offset = cursor.u32_named("free space offset")?;
        let events_checksum = cursor.u32_named("events checksum")?;

        // Reserved
        cursor.advance(64, "chunk header reserved")?;
        let flags = ChunkFlags::from_bits_retain(cursor.u32_named("chunk flags")?);
        let header_chunk_checksum = cursor.u32_named("chunk header checksum")?;

        debug_assert_eq!(cursor.pos(), STRING_TABLE_OFFSET);
        let mut string_offsets = [0u32; 64];
        for slot in string_offsets.iter_mut() {
            *slot = cursor.u32_named("common string offset")?;
        }

        debug_assert_eq!(cursor.pos(), TEMPLATE_TABLE_OFFSET);
        let mut template_offsets = [0u32; 32];
        for slot in template_offsets.iter_mut() {
            *slot = cursor.u32_named("template pointer")?;
        }

        Ok(EvtxChunkHeader {
            first_event_record_number,
            last_event_record_number,
            first_event_record_id,
            last_event_record_id,
            header_size,
            last_event_record_data_offset,
            free_space_offset,
            events_checksum,
            flags,
            header_chunk_checksum,
            string_offsets,
            template_offsets,
        })
    }
}

/// One record's serialized output.
#[derive(Debug, Clone, PartialEq)]
pub struct SerializedRecord {
    pub event_record_id: u64,
    pub timestamp: Timestamp,
    pub data: RecordData,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordData {
    Xml(String),
    /// UTF-8 bytes of a single JSON value.
    Json(Vec<u8>),
}

impl RecordData {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            RecordData::Xml(s) => s.as_bytes(),
            RecordData::Json(b) => b,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

/// Everything a worker produced for one chunk.
#[derive(Debug)]
pub struct ChunkResult {
    pub chunk_index: usize,
    pub header: Option<EvtxChunkHeader>,
    pub records: Vec<EvtxRecord>,
    pub renderings: Vec<SerializedRecord>,
    pub warnings: Vec<String>,
}

/// Parse and render one 64 KiB chunk end-to-end.
///
/// Chunk-level defects degrade to warnings: a bad chunk magic skips the
/// chunk, a bad record resynchronizes 4 bytes further, and rendering
/// failures drop only the affected record.
pub(crate) fn parse_chunk(
    buffer: &[u8],
    chunk_index: usize,
    chunk_offset: usize,
    settings: &ParserSettings,
    compiled: &CompiledTemplateCache,
) -> ChunkResult {
    let chunk_end = chunk_offset.saturating_add(EVTX_CHUNK_SIZE).min(buffer.len());
    let chunk_data = &buffer[chunk_offset..chunk_end];

    let mut warnings = Vec::new();

    let header = match EvtxChunkHeader::from_buffer(chunk_data) {
        Ok(header) => header,
        Err(e) => {
            warnings.push(format!("chunk {chunk_index}: {e}"));
            return ChunkResult {
                chunk_index,
                header: None,
                records: Vec::new(),
                renderings: Vec::new(),
                warnings,
            };
        }
    };

    let string_cache = StringCache::populate(chunk_data, &header.string_offsets);
    let template_cache =
        TemplateCache::populate(chunk_data, &header.template_offsets, &mut warnings);
    debug!(
        "chunk {chunk_index}: preloaded {} strings, {} templates",
        string_cache.len(),
        template_cache.len()
    );

    let records = scan_records(chunk_data, &header, &mut warnings);
    validate_records(chunk_data, &header, &records, &mut warnings);

    let mut ctx = ChunkCtx {
        data: chunk_data,
        string_cache,
        template_cache,
        ansi_codec: settings.get_ansi_codec(),
    };

    let mut renderings = Vec::with_capacity(records.len());
    match settings.get_output_format() {
        OutputFormat::Xml => {
            let mut renderer = XmlRenderer::new(&mut ctx, compiled);
            for record in &records {
                match renderer.render_record(record.payload_offset, record.payload_len) {
                    Ok(xml) => renderings.push(SerializedRecord {
                        event_record_id: record.event_record_id,
                        timestamp: record.timestamp,
                        data: RecordData::Xml(xml),
                    }),
                    Err(e) => {
                        debug_dump_payload(chunk_data, record);
                        warnings.push(format!(
                            "record {}: binxml parse error: {e}",
                            record.event_record_id
                        ));
                    }
                }
                warnings.extend(renderer.drain_warnings());
            }
        }
        OutputFormat::Json => {
            let mut renderer =
                JsonRenderer::new(&mut ctx, settings.should_separate_json_attributes());
            for record in &records {
                match renderer.render_record(record.payload_offset, record.payload_len) {
                    Ok(json) => renderings.push(SerializedRecord {
                        event_record_id: record.event_record_id,
                        timestamp: record.timestamp,
                        data: RecordData::Json(json),
                    }),
                    Err(e) => {
                        debug_dump_payload(chunk_data, record);
                        warnings.push(format!(
                            "record {}: binxml parse error: {e}",
                            record.event_record_id
                        ));
                    }
                }
                warnings.extend(renderer.drain_warnings());
            }
        }
    }

    ChunkResult {
        chunk_index,
        header: Some(header),
        records,
        renderings,
        warnings,
    }
}

/// Hex-dump the payload of a record that failed to render.
fn debug_dump_payload(chunk_data: &[u8], record: &EvtxRecord) {
    if log::log_enabled!(log::Level::Debug) {
        let end = (record.payload_offset + record.payload_len).min(chunk_data.len());
        let payload = &chunk_data[record.payload_offset.min(end)..end];
        debug!(
            "record {} payload:\n{}",
            record.event_record_id,
            hexdump(payload, record.payload_offset)
        );
    }
}

/// Fault-tolerant record scan over the chunk's data region.
///
/// Four zero bytes end the region cleanly; anything that is not a record
/// (bad magic, implausible size) advances the scan by 4 bytes and retries.
fn scan_records(
    chunk_data: &[u8],
    header: &EvtxChunkHeader,
    warnings: &mut Vec<String>,
) -> Vec<EvtxRecord> {
    let mut records = Vec::new();
    let data_end = (header.free_space_offset as usize).min(chunk_data.len());
    let mut pos = EVTX_CHUNK_HEADER_SIZE;
    let mut resyncing = false;

    while pos + 4 <= data_end {
        let dword = bytes::read_u32_le(chunk_data, pos).expect("bounds checked by loop condition");
        if dword == 0 {
            break;
        }

        if chunk_data[pos..pos + 4] != EVTX_RECORD_MAGIC {
            if !resyncing {
                warnings.push(format!(
                    "no record magic at chunk offset {pos}, resynchronizing"
                ));
                resyncing = true;
            }
            pos += 4;
            continue;
        }

        match EvtxRecord::parse(chunk_data, pos) {
            Ok(record) => {
                if !record.size_fields_agree() {
                    warnings.push(format!(
                        "record {}: size {} disagrees with trailing copy {}",
                        record.event_record_id, record.size, record.size_copy
                    ));
                }
                resyncing = false;
                pos += record.size as usize;
                records.push(record);
            }
            Err(e) => {
                warnings.push(format!("skipping record at chunk offset {pos}: {e}"));
                pos += 4;
            }
        }
    }

    trace!("scanned {} records", records.len());
    records
}

/// Advisory validation; every finding is a warning, none aborts parsing.
fn validate_records(
    chunk_data: &[u8],
    header: &EvtxChunkHeader,
    records: &[EvtxRecord],
    warnings: &mut Vec<String>,
) {
    if header.flags.contains(ChunkFlags::CORRUPTED) {
        warnings.push("chunk is flagged as corrupted".to_string());
    }

    let expected = header
        .last_event_record_id
        .saturating_sub(header.first_event_record_id)
        .saturating_add(1);
    if !records.is_empty() && records.len() as u64 != expected {
        warnings.push(format!(
            "found {} records, chunk header covers ids {}..={} ({expected})",
            records.len(),
            header.first_event_record_id,
            header.last_event_record_id
        ));
    }

    for pair in records.windows(2) {
        if pair[1].event_record_id != pair[0].event_record_id + 1 {
            warnings.push(format!(
                "non-sequential record ids: {} followed by {}",
                pair[0].event_record_id, pair[1].event_record_id
            ));
        }
    }

    for record in records {
        if record.payload_len < 4 {
            warnings.push(format!(
                "record {}: binxml payload is improbably small ({} bytes)",
                record.event_record_id, record.payload_len
            ));
        } else if bytes::read_u8(chunk_data, record.payload_offset) != Some(0x0F) {
            warnings.push(format!(
                "record {}: binxml payload does not start with a fragment header",
                record.event_record_id
            ));
        }
        if record.timestamp_ticks == 0 {
            warnings.push(format!(
                "record {}: zero timestamp",
                record.event_record_id
            ));
        }
    }
}
