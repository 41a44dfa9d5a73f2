use std::fmt;

use encoding::EncodingRef;
use encoding::all::WINDOWS_1252;
use log::debug;
#[cfg(feature = "multithreading")]
use log::warn;

use crate::binxml::compile::CompiledTemplateCache;
use crate::chunk::{ChunkResult, SerializedRecord, parse_chunk};
use crate::err::Result;
use crate::file_header::{EvtxFileHeader, candidate_chunk_offsets, chunk_offsets};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Xml,
    Json,
}

/// Parser configuration, builder style.
#[derive(Clone)]
pub struct ParserSettings {
    /// Hard upper bound on worker threads; `0` means "all cores".
    num_threads: usize,
    output_format: OutputFormat,
    ansi_codec: EncodingRef,
    /// JSON only: emit attributes as `<name>_attributes` siblings instead of
    /// nested `#attributes` objects.
    separate_json_attributes: bool,
}

impl Default for ParserSettings {
    fn default() -> Self {
        ParserSettings {
            num_threads: 0,
            output_format: OutputFormat::Xml,
            ansi_codec: WINDOWS_1252,
            separate_json_attributes: false,
        }
    }
}

impl fmt::Debug for ParserSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParserSettings")
            .field("num_threads", &self.num_threads)
            .field("output_format", &self.output_format)
            .field("ansi_codec", &self.ansi_codec.name())
            .field("separate_json_attributes", &self.separate_json_attributes)
            .finish()
    }
}

impl PartialEq for ParserSettings {
    fn eq(&self, other: &Self) -> bool {
        self.num_threads == other.num_threads
            && self.output_format == other.output_format
            && self.ansi_codec.name() == other.ansi_codec.name()
            && self.separate_json_attributes == other.separate_json_attributes
    }
}

impl ParserSettings {
    pub fn new() -> Self {
        ParserSettings::default()
    }

    pub fn num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    pub fn output_format(mut self, output_format: OutputFormat) -> Self {
        self.output_format = output_format;
        self
    }

    pub fn ansi_codec(mut self, ansi_codec: EncodingRef) -> Self {
        self.ansi_codec = ansi_codec;
        self
    }

    pub fn separate_json_attributes(mut self, separate: bool) -> Self {
        self.separate_json_attributes = separate;
        self
    }

    pub fn should_separate_json_attributes(&self) -> bool {
        self.separate_json_attributes
    }

    #[allow(dead_code)]
    pub(crate) fn get_num_threads(&self) -> usize {
        self.num_threads
    }
}

// Accessors used by the chunk worker.
impl ParserSettings {
    pub(crate) fn get_output_format(&self) -> OutputFormat {
        self.output_format
    }

    pub(crate) fn get_ansi_codec(&self) -> EncodingRef {
        self.ansi_codec
    }
}

/// A parser over a complete in-memory `.evtx` file.
///
/// The buffer is borrowed for the parser's lifetime and shared read-only
/// across all workers.
pub struct EvtxParser<'a> {
    data: &'a [u8],
    header: EvtxFileHeader,
    config: ParserSettings,
}

impl<'a> EvtxParser<'a> {
    /// Validate the file header and prepare a parser with default settings.
    pub fn from_buffer(data: &'a [u8]) -> Result<EvtxParser<'a>> {
        let header = EvtxFileHeader::from_buffer(data)?;
        Ok(EvtxParser {
            data,
            header,
            config: ParserSettings::default(),
        })
    }

    pub fn with_configuration(mut self, config: ParserSettings) -> Self {
        self.config = config;
        self
    }

    pub fn header(&self) -> &EvtxFileHeader {
        &self.header
    }

    /// File offsets of all chunks, in file order.
    pub fn chunk_offsets(&self) -> Vec<usize> {
        chunk_offsets(self.data, &self.header)
    }

    /// Parse and render every chunk.
    ///
    /// Chunks are independent units of work; the compiled-template cache is
    /// the only state shared between workers, and results always come back
    /// in ascending chunk index regardless of thread count.
    pub fn parse(&self) -> ParsedFile {
        // Hand every non-empty block to the chunk walker: a chunk with a
        // damaged magic is reported (warning, zero records) rather than
        // silently dropped, while zeroed gaps in dirty files are skipped.
        let offsets: Vec<usize> = candidate_chunk_offsets(self.data, &self.header)
            .into_iter()
            .filter(|&offset| self.data[offset..offset + 8].iter().any(|&b| b != 0))
            .collect();
        debug!(
            "parsing {} chunks with {} threads",
            offsets.len(),
            match self.config.num_threads {
                0 => "all".to_string(),
                n => n.to_string(),
            }
        );

        let compiled = CompiledTemplateCache::new();
        let chunks = self.parse_chunks(&offsets, &compiled);

        ParsedFile {
            header: self.header.clone(),
            chunks,
        }
    }

    #[cfg(feature = "multithreading")]
    fn parse_chunks(&self, offsets: &[usize], compiled: &CompiledTemplateCache) -> Vec<ChunkResult> {
        use rayon::prelude::*;

        if self.config.num_threads == 1 {
            return self.parse_chunks_sequential(offsets, compiled);
        }

        match rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.num_threads)
            .build()
        {
            Ok(pool) => pool.install(|| {
                offsets
                    .par_iter()
                    .enumerate()
                    .map(|(index, &offset)| {
                        parse_chunk(self.data, index, offset, &self.config, compiled)
                    })
                    .collect()
            }),
            Err(e) => {
                warn!("failed to build worker pool ({e}), parsing sequentially");
                self.parse_chunks_sequential(offsets, compiled)
            }
        }
    }

    #[cfg(not(feature = "multithreading"))]
    fn parse_chunks(&self, offsets: &[usize], compiled: &CompiledTemplateCache) -> Vec<ChunkResult> {
        self.parse_chunks_sequential(offsets, compiled)
    }

    fn parse_chunks_sequential(
        &self,
        offsets: &[usize],
        compiled: &CompiledTemplateCache,
    ) -> Vec<ChunkResult> {
        offsets
            .iter()
            .enumerate()
            .map(|(index, &offset)| parse_chunk(self.data, index, offset, &self.config, compiled))
            .collect()
    }
}

/// The outcome of a whole-file parse: per-chunk results in chunk order.
#[derive(Debug)]
pub struct ParsedFile {
    pub header: EvtxFileHeader,
    pub chunks: Vec<ChunkResult>,
}

impl ParsedFile {
    /// All record renderings in file order.
    pub fn records(&self) -> impl Iterator<Item = &SerializedRecord> {
        self.chunks.iter().flat_map(|chunk| chunk.renderings.iter())
    }

    /// All warnings, in chunk order.
    pub fn warnings(&self) -> impl Iterator<Item = &str> {
        self.chunks
            .iter()
            .flat_map(|chunk| chunk.warnings.iter().map(String::as_str))
    }
}
