//! A fast, buffer-oriented parser for the Windows XML Event Log (`.evtx`)
//! binary format.
//!
//! The parser consumes a complete in-memory file, discovers its 64 KiB
//! chunks, decodes every record's BinXml payload and renders it as XML text
//! or JSON bytes. Chunks are decoded end-to-end by independent workers;
//! repeated template renderings are accelerated by a process-wide
//! compiled-template cache.
//!
//! ```no_run
//! use fastevtx::{EvtxParser, OutputFormat, ParserSettings};
//!
//! let buffer = std::fs::read("security.evtx").unwrap();
//! let parser = EvtxParser::from_buffer(&buffer)
//!     .unwrap()
//!     .with_configuration(ParserSettings::new().output_format(OutputFormat::Xml));
//!
//! for record in parser.parse().records() {
//!     println!("{}", String::from_utf8_lossy(record.data.as_bytes()));
//! }
//! ```

mod binxml;
mod chunk;
mod err;
mod evtx_filter;
mod file_header;
mod guid;
mod ntsid;
mod parser;
mod record;
mod string_cache;
mod template_cache;
mod utils;

/// A chunk-relative byte offset.
pub type Offset = u32;

pub use binxml::compile::CompiledTemplateCache;
pub use chunk::{
    ChunkFlags, ChunkResult, EVTX_CHUNK_HEADER_SIZE, EVTX_CHUNK_SIZE, EvtxChunkHeader, RecordData,
    SerializedRecord,
};
pub use err::{EvtxError, Result};
pub use evtx_filter::{EvtxFilter, Ranges};
pub use file_header::{EVTX_FILE_HEADER_SIZE, EvtxFileHeader, HeaderFlags};
pub use guid::Guid;
pub use ntsid::Sid;
pub use parser::{EvtxParser, OutputFormat, ParsedFile, ParserSettings};
pub use record::{EVTX_RECORD_MAGIC, EvtxRecord};
pub use string_cache::StringCache;
pub use template_cache::{TemplateCache, TemplateDescriptor};
