use thiserror::Error;

pub type Result<T> = std::result::Result<T, EvtxError>;

pub(crate) type DeserializationResult<T> = std::result::Result<T, DeserializationError>;

/// Fatal, file-level errors. Anything below the file header is recoverable
/// and surfaces as a warning on the owning chunk instead.
#[derive(Debug, Error)]
pub enum EvtxError {
    #[error("Invalid EVTX file header magic, expected `ElfFile0`, found `{magic:02X?}`")]
    InvalidFileMagic { magic: [u8; 8] },

    #[error("File is truncated before the end of the file header ({len} bytes, need 128)")]
    TruncatedFileHeader { len: usize },

    #[error("An I/O error has occurred")]
    IO {
        #[from]
        source: std::io::Error,
    },

    #[error("`serde_json` failed")]
    JsonError {
        #[from]
        source: serde_json::error::Error,
    },
}

/// Recoverable decoding errors.
///
/// These never abort a parse: the chunk walker converts them into warning
/// strings and resumes at the next record boundary.
#[derive(Debug, Error)]
pub enum DeserializationError {
    #[error("Offset {offset}: truncated read of {what} (need {need} bytes, have {have})")]
    Truncated {
        what: &'static str,
        offset: u64,
        need: usize,
        have: usize,
    },

    #[error("Invalid EVTX chunk header magic, expected `ElfChnk0`, found `{magic:02X?}`")]
    InvalidChunkMagic { magic: [u8; 8] },

    #[error("Invalid EVTX record header magic, expected `2a2a0000`, found `{magic:02X?}`")]
    InvalidRecordMagic { magic: [u8; 4] },

    #[error("Record {record_id}: implausible size {size}")]
    ImplausibleRecordSize { record_id: u64, size: u32 },

    #[error("Offset {offset}: tried to read an invalid byte `{value:#x}` as a binxml token")]
    InvalidToken { value: u8, offset: u64 },

    #[error("Offset {offset}: tried to read an invalid byte `{value:#x}` as a binxml value type")]
    InvalidValueType { value: u8, offset: u64 },

    #[error("Offset {offset}: failed to decode UTF-16 string")]
    FailedToDecodeUTF16String { offset: u64 },

    #[error(
        "Offset {offset}: failed to decode ansi string (used encoding scheme {encoding}): {message}"
    )]
    FailedToDecodeAnsiString {
        encoding: &'static str,
        message: String,
        offset: u64,
    },

    #[error("Offset {offset}: {message}")]
    Other { message: &'static str, offset: u64 },
}

impl DeserializationError {
    pub(crate) fn other(message: &'static str, offset: u64) -> Self {
        DeserializationError::Other { message, offset }
    }
}
