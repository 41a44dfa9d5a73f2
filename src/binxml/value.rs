//! Typed substitution values.
//!
//! A template instance carries a table of typed value blobs; this module
//! decodes a blob per its descriptor type (the descriptor is authoritative,
//! the per-substitution type byte in the body is advisory) and renders the
//! result as XML text or a JSON primitive.

use std::fmt::Write;

use encoding::{DecoderTrap, EncodingRef};
use quick_xml::escape::escape;
use serde_json::Value as JsonValue;

use crate::err::{DeserializationError, DeserializationResult};
use crate::guid::Guid;
use crate::ntsid::Sid;
use crate::utils::ByteCursor;
use crate::utils::time::{write_filetime, write_systemtime};
use crate::utils::utf16::decode_utf16le;

/// The array bit of the value-type byte.
pub(crate) const ARRAY_FLAG: u8 = 0x80;

/// A substitution value's location within the chunk: a view, not a copy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct SlotRef {
    /// Chunk-relative offset of the first value byte.
    pub offset: usize,
    pub size: u16,
    /// Raw descriptor type byte (array flag included).
    pub value_type: u8,
}

impl SlotRef {
    pub(crate) fn is_empty_optional(&self) -> bool {
        self.value_type & !ARRAY_FLAG == 0x00 || self.size == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinXmlValueType {
    Null,
    String,
    AnsiString,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Real32,
    Real64,
    Bool,
    Binary,
    Guid,
    SizeT,
    FileTime,
    SysTime,
    Sid,
    HexInt32,
    HexInt64,
    EvtHandle,
    BinXml,
    EvtXml,
}

impl BinXmlValueType {
    pub(crate) fn from_u8(byte: u8) -> Option<BinXmlValueType> {
        match byte {
            0x00 => Some(BinXmlValueType::Null),
            0x01 => Some(BinXmlValueType::String),
            0x02 => Some(BinXmlValueType::AnsiString),
            0x03 => Some(BinXmlValueType::Int8),
            0x04 => Some(BinXmlValueType::UInt8),
            0x05 => Some(BinXmlValueType::Int16),
            0x06 => Some(BinXmlValueType::UInt16),
            0x07 => Some(BinXmlValueType::Int32),
            0x08 => Some(BinXmlValueType::UInt32),
            0x09 => Some(BinXmlValueType::Int64),
            0x0a => Some(BinXmlValueType::UInt64),
            0x0b => Some(BinXmlValueType::Real32),
            0x0c => Some(BinXmlValueType::Real64),
            0x0d => Some(BinXmlValueType::Bool),
            0x0e => Some(BinXmlValueType::Binary),
            0x0f => Some(BinXmlValueType::Guid),
            0x10 => Some(BinXmlValueType::SizeT),
            0x11 => Some(BinXmlValueType::FileTime),
            0x12 => Some(BinXmlValueType::SysTime),
            0x13 => Some(BinXmlValueType::Sid),
            0x14 => Some(BinXmlValueType::HexInt32),
            0x15 => Some(BinXmlValueType::HexInt64),
            0x20 => Some(BinXmlValueType::EvtHandle),
            0x21 => Some(BinXmlValueType::BinXml),
            0x23 => Some(BinXmlValueType::EvtXml),
            _ => None,
        }
    }

    /// Element width for array splitting; `None` for variable-width types.
    fn fixed_width(&self) -> Option<usize> {
        match self {
            BinXmlValueType::Int8 | BinXmlValueType::UInt8 => Some(1),
            BinXmlValueType::Int16 | BinXmlValueType::UInt16 => Some(2),
            BinXmlValueType::Int32
            | BinXmlValueType::UInt32
            | BinXmlValueType::Real32
            | BinXmlValueType::Bool
            | BinXmlValueType::HexInt32 => Some(4),
            BinXmlValueType::Int64
            | BinXmlValueType::UInt64
            | BinXmlValueType::Real64
            | BinXmlValueType::FileTime
            | BinXmlValueType::HexInt64 => Some(8),
            BinXmlValueType::Guid | BinXmlValueType::SysTime => Some(16),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum BinXmlValue<'a> {
    Null,
    String(String),
    AnsiString(String),
    Int8(i8),
    UInt8(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Real32(f32),
    Real64(f64),
    Bool(bool),
    Binary(&'a [u8]),
    Guid(Guid),
    SizeT { value: u64, width: usize },
    FileTime(u64),
    SysTime([u16; 8]),
    Sid(Sid),
    HexInt32(u32),
    HexInt64(u64),
    /// A nested BinXml document; the span is chunk-relative so the renderer
    /// can re-enter the decoder with the correct inline-detection base.
    BinXml { offset: usize, len: usize },
    EvtXml(String),
    Array(Vec<BinXmlValue<'a>>),
}

impl<'a> BinXmlValue<'a> {
    /// Decode the substitution value `slot` references inside `chunk_data`.
    pub(crate) fn from_slot(
        chunk_data: &'a [u8],
        slot: SlotRef,
        ansi_codec: EncodingRef,
    ) -> DeserializationResult<BinXmlValue<'a>> {
        let end = slot
            .offset
            .checked_add(usize::from(slot.size))
            .filter(|&end| end <= chunk_data.len())
            .ok_or(DeserializationError::Truncated {
                what: "substitution value",
                offset: slot.offset as u64,
                need: usize::from(slot.size),
                have: chunk_data.len().saturating_sub(slot.offset),
            })?;
        let bytes = &chunk_data[slot.offset..end];

        let base = slot.value_type & !ARRAY_FLAG;
        let Some(value_type) = BinXmlValueType::from_u8(base) else {
            // Unknown types fall back to a hex dump of the blob.
            return Ok(BinXmlValue::Binary(bytes));
        };

        if slot.value_type & ARRAY_FLAG != 0 {
            return Self::decode_array(chunk_data, slot, value_type, bytes, ansi_codec);
        }

        Self::decode_scalar(value_type, slot.offset, bytes, ansi_codec)
    }

    fn decode_scalar(
        value_type: BinXmlValueType,
        chunk_offset: usize,
        bytes: &'a [u8],
        ansi_codec: EncodingRef,
    ) -> DeserializationResult<BinXmlValue<'a>> {
        let mut cursor = ByteCursor::with_pos(bytes, 0)?;

        let value = match value_type {
            BinXmlValueType::Null => BinXmlValue::Null,
            BinXmlValueType::String => {
                let mut text = bytes;
                if text.len() >= 2 && text[text.len() - 2] == 0 && text[text.len() - 1] == 0 {
                    text = &text[..text.len() - 2];
                }
                BinXmlValue::String(decode_utf16le(text))
            }
            BinXmlValueType::AnsiString => {
                let until_nul = match bytes.iter().position(|&b| b == 0) {
                    Some(nul) => &bytes[..nul],
                    None => bytes,
                };
                let decoded = ansi_codec
                    .decode(until_nul, DecoderTrap::Replace)
                    .map_err(|message| DeserializationError::FailedToDecodeAnsiString {
                        encoding: ansi_codec.name(),
                        message: message.to_string(),
                        offset: chunk_offset as u64,
                    })?;
                BinXmlValue::AnsiString(decoded)
            }
            BinXmlValueType::Int8 => BinXmlValue::Int8(cursor.u8_named("i8")? as i8),
            BinXmlValueType::UInt8 => BinXmlValue::UInt8(cursor.u8_named("u8")?),
            BinXmlValueType::Int16 => BinXmlValue::Int16(cursor.u16_named("i16")? as i16),
            BinXmlValueType::UInt16 => BinXmlValue::UInt16(cursor.u16_named("u16")?),
            BinXmlValueType::Int32 => BinXmlValue::Int32(cursor.u32_named("i32")? as i32),
            BinXmlValueType::UInt32 => BinXmlValue::UInt32(cursor.u32_named("u32")?),
            BinXmlValueType::Int64 => BinXmlValue::Int64(cursor.u64_named("i64")? as i64),
            BinXmlValueType::UInt64 => BinXmlValue::UInt64(cursor.u64_named("u64")?),
            BinXmlValueType::Real32 => {
                BinXmlValue::Real32(f32::from_le_bytes(cursor.array::<4>("f32")?))
            }
            BinXmlValueType::Real64 => {
                BinXmlValue::Real64(f64::from_le_bytes(cursor.array::<8>("f64")?))
            }
            // Stored as a u32; any non-zero value is truthy (irregular values
            // occur in the wild).
            BinXmlValueType::Bool => BinXmlValue::Bool(cursor.u32_named("bool")? != 0),
            BinXmlValueType::Binary => BinXmlValue::Binary(bytes),
            BinXmlValueType::Guid => BinXmlValue::Guid(Guid::from_cursor(&mut cursor)?),
            BinXmlValueType::SizeT => match bytes.len() {
                4 => BinXmlValue::SizeT {
                    value: u64::from(cursor.u32_named("size_t")?),
                    width: 4,
                },
                _ => BinXmlValue::SizeT {
                    value: cursor.u64_named("size_t")?,
                    width: 8,
                },
            },
            BinXmlValueType::FileTime => BinXmlValue::FileTime(cursor.u64_named("filetime")?),
            BinXmlValueType::SysTime => {
                let mut fields = [0u16; 8];
                for field in fields.iter_mut() {
                    *field = cursor.u16_named("systemtime")?;
                }
                BinXmlValue::SysTime(fields)
            }
            BinXmlValueType::Sid => BinXmlValue::Sid(Sid::from_cursor(&mut cursor)?),
            BinXmlValueType::HexInt32 => BinXmlValue::HexInt32(cursor.u32_named("hexint32")?),
            BinXmlValueType::HexInt64 => BinXmlValue::HexInt64(cursor.u64_named("hexint64")?),
            BinXmlValueType::BinXml => BinXmlValue::BinXml {
                offset: chunk_offset,
                len: bytes.len(),
            },
            BinXmlValueType::EvtXml => BinXmlValue::EvtXml(decode_utf16le(bytes)),
            // Handles carry no renderable structure; dump them as hex.
            BinXmlValueType::EvtHandle => BinXmlValue::Binary(bytes),
        };

        Ok(value)
    }

    fn decode_array(
        chunk_data: &'a [u8],
        slot: SlotRef,
        value_type: BinXmlValueType,
        bytes: &'a [u8],
        ansi_codec: EncodingRef,
    ) -> DeserializationResult<BinXmlValue<'a>> {
        let mut items = Vec::new();

        match value_type {
            BinXmlValueType::String => {
                // UTF-16 strings are packed NUL-separated; empty pieces are
                // dropped.
                let units: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]))
                    .collect();
                for piece in units.split(|&u| u == 0) {
                    if piece.is_empty() {
                        continue;
                    }
                    let piece_bytes: Vec<u8> =
                        piece.iter().flat_map(|u| u.to_le_bytes()).collect();
                    items.push(BinXmlValue::String(decode_utf16le(&piece_bytes)));
                }
            }
            BinXmlValueType::Sid => {
                let mut pos = 0usize;
                while pos + 8 <= bytes.len() {
                    let width = Sid::wire_size(bytes[pos + 1]);
                    if pos + width > bytes.len() {
                        break;
                    }
                    let element = SlotRef {
                        offset: slot.offset + pos,
                        size: width as u16,
                        value_type: 0x13,
                    };
                    items.push(BinXmlValue::from_slot(chunk_data, element, ansi_codec)?);
                    pos += width;
                }
            }
            other => match other.fixed_width() {
                Some(width) => {
                    for (index, _) in bytes.chunks_exact(width).enumerate() {
                        let element = SlotRef {
                            offset: slot.offset + index * width,
                            size: width as u16,
                            value_type: slot.value_type & !ARRAY_FLAG,
                        };
                        items.push(BinXmlValue::from_slot(chunk_data, element, ansi_codec)?);
                    }
                }
                // Variable-width arrays have no defined framing; fall back
                // to a hex dump of the whole blob.
                None => return Ok(BinXmlValue::Binary(bytes)),
            },
        }

        Ok(BinXmlValue::Array(items))
    }

    /// Append the XML textual form to `out`, escaping where text can contain
    /// metacharacters.
    pub(crate) fn render_xml_into(&self, out: &mut String) {
        match self {
            BinXmlValue::Null => {}
            BinXmlValue::String(s) | BinXmlValue::AnsiString(s) | BinXmlValue::EvtXml(s) => {
                out.push_str(&escape(s.as_str()));
            }
            BinXmlValue::Int8(v) => write_display(out, v),
            BinXmlValue::UInt8(v) => write_display(out, v),
            BinXmlValue::Int16(v) => write_display(out, v),
            BinXmlValue::UInt16(v) => write_display(out, v),
            BinXmlValue::Int32(v) => write_display(out, v),
            BinXmlValue::UInt32(v) => write_display(out, v),
            BinXmlValue::Int64(v) => write_display(out, v),
            BinXmlValue::UInt64(v) => write_display(out, v),
            BinXmlValue::Real32(v) => write_display(out, v),
            BinXmlValue::Real64(v) => write_display(out, v),
            BinXmlValue::Bool(v) => out.push_str(if *v { "true" } else { "false" }),
            BinXmlValue::Binary(bytes) => write_hex_upper(out, bytes),
            BinXmlValue::Guid(guid) => write_display(out, guid),
            BinXmlValue::SizeT { value, width } => {
                if *width == 4 {
                    write!(out, "0x{value:08x}").expect("writing to a String cannot fail");
                } else {
                    write!(out, "0x{value:016x}").expect("writing to a String cannot fail");
                }
            }
            BinXmlValue::FileTime(ticks) => write_filetime(*ticks, out),
            BinXmlValue::SysTime(fields) => write_systemtime(*fields, out),
            BinXmlValue::Sid(sid) => write_display(out, sid),
            BinXmlValue::HexInt32(v) => {
                write!(out, "0x{v:08x}").expect("writing to a String cannot fail")
            }
            BinXmlValue::HexInt64(v) => {
                write!(out, "0x{v:016x}").expect("writing to a String cannot fail")
            }
            // Nested documents are rendered by the decoder, which owns the
            // chunk context; reaching this arm means a slot was stringified.
            BinXmlValue::BinXml { .. } => {}
            BinXmlValue::Array(items) => {
                let mut first = true;
                for item in items {
                    if !first {
                        out.push_str(", ");
                    }
                    first = false;
                    item.render_xml_into(out);
                }
            }
        }
    }

    /// The JSON primitive corresponding to this value; types without a JSON
    /// number form keep their textual form as a string.
    pub(crate) fn to_json_value(&self) -> JsonValue {
        match self {
            BinXmlValue::Null => JsonValue::Null,
            BinXmlValue::String(s) | BinXmlValue::AnsiString(s) | BinXmlValue::EvtXml(s) => {
                JsonValue::String(s.clone())
            }
            BinXmlValue::Int8(v) => JsonValue::from(*v),
            BinXmlValue::UInt8(v) => JsonValue::from(*v),
            BinXmlValue::Int16(v) => JsonValue::from(*v),
            BinXmlValue::UInt16(v) => JsonValue::from(*v),
            BinXmlValue::Int32(v) => JsonValue::from(*v),
            BinXmlValue::UInt32(v) => JsonValue::from(*v),
            BinXmlValue::Int64(v) => JsonValue::from(*v),
            BinXmlValue::UInt64(v) => JsonValue::from(*v),
            BinXmlValue::Real32(v) => JsonValue::from(f64::from(*v)),
            BinXmlValue::Real64(v) => JsonValue::from(*v),
            BinXmlValue::Bool(v) => JsonValue::Bool(*v),
            BinXmlValue::Array(items) => {
                JsonValue::Array(items.iter().map(BinXmlValue::to_json_value).collect())
            }
            other => {
                let mut text = String::new();
                other.render_text_unescaped(&mut text);
                JsonValue::String(text)
            }
        }
    }

    /// Textual form without XML escaping, for JSON strings and attribute
    /// values that are post-escaped.
    pub(crate) fn render_text_unescaped(&self, out: &mut String) {
        match self {
            BinXmlValue::String(s) | BinXmlValue::AnsiString(s) | BinXmlValue::EvtXml(s) => {
                out.push_str(s)
            }
            BinXmlValue::Array(items) => {
                let mut first = true;
                for item in items {
                    if !first {
                        out.push_str(", ");
                    }
                    first = false;
                    item.render_text_unescaped(out);
                }
            }
            other => other.render_xml_into(out),
        }
    }
}

fn write_display<T: std::fmt::Display>(out: &mut String, value: &T) {
    write!(out, "{value}").expect("writing to a String cannot fail");
}

fn write_hex_upper(out: &mut String, bytes: &[u8]) {
    for byte in bytes {
        write!(out, "{byte:02X}").expect("writing to a String cannot fail");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use encoding::all::WINDOWS_1252;
    use pretty_assertions::assert_eq;

    fn render(value: &BinXmlValue) -> String {
        let mut out = String::new();
        value.render_xml_into(&mut out);
        out
    }

    fn slot(offset: usize, size: usize, value_type: u8) -> SlotRef {
        SlotRef {
            offset,
            size: size as u16,
            value_type,
        }
    }

    #[test]
    fn test_decodes_and_renders_numbers() {
        let data = 0xFFFF_FFFEu32.to_le_bytes();
        let value = BinXmlValue::from_slot(&data, slot(0, 4, 0x07), WINDOWS_1252).unwrap();
        assert_eq!(value, BinXmlValue::Int32(-2));
        assert_eq!(render(&value), "-2");

        let value = BinXmlValue::from_slot(&data, slot(0, 4, 0x08), WINDOWS_1252).unwrap();
        assert_eq!(render(&value), "4294967294");
    }

    #[test]
    fn test_string_drops_trailing_nul_and_escapes() {
        let mut data: Vec<u8> = "a<b".encode_utf16().flat_map(u16::to_le_bytes).collect();
        data.extend_from_slice(&[0, 0]);
        let value =
            BinXmlValue::from_slot(&data, slot(0, data.len(), 0x01), WINDOWS_1252).unwrap();
        assert_eq!(value, BinXmlValue::String("a<b".to_string()));
        assert_eq!(render(&value), "a&lt;b");
    }

    #[test]
    fn test_ansi_string_stops_at_nul() {
        let data = b"hello\x00world".to_vec();
        let value =
            BinXmlValue::from_slot(&data, slot(0, data.len(), 0x02), WINDOWS_1252).unwrap();
        assert_eq!(value, BinXmlValue::AnsiString("hello".to_string()));
    }

    #[test]
    fn test_binary_renders_uppercase_hex() {
        let data = [0xDE, 0xAD, 0xBE, 0xEF];
        let value = BinXmlValue::from_slot(&data, slot(0, 4, 0x0e), WINDOWS_1252).unwrap();
        assert_eq!(render(&value), "DEADBEEF");
    }

    #[test]
    fn test_bool_reads_four_bytes() {
        let data = 2u32.to_le_bytes();
        let value = BinXmlValue::from_slot(&data, slot(0, 4, 0x0d), WINDOWS_1252).unwrap();
        assert_eq!(value, BinXmlValue::Bool(true));
        assert_eq!(value.to_json_value(), JsonValue::Bool(true));
    }

    #[test]
    fn test_hex_ints_are_fixed_width_lowercase() {
        let data32 = 0x1Fu32.to_le_bytes();
        let value = BinXmlValue::from_slot(&data32, slot(0, 4, 0x14), WINDOWS_1252).unwrap();
        assert_eq!(render(&value), "0x0000001f");

        let data64 = 0x8020_0000_0000u64.to_le_bytes();
        let value = BinXmlValue::from_slot(&data64, slot(0, 8, 0x15), WINDOWS_1252).unwrap();
        assert_eq!(render(&value), "0x0000802000000000");
    }

    #[test]
    fn test_unknown_type_falls_back_to_hex() {
        let data = [0xAB, 0xCD];
        let value = BinXmlValue::from_slot(&data, slot(0, 2, 0x1f), WINDOWS_1252).unwrap();
        assert_eq!(render(&value), "ABCD");
    }

    #[test]
    fn test_uint16_array_renders_comma_separated() {
        let mut data = Vec::new();
        for v in [1u16, 2, 3] {
            data.extend_from_slice(&v.to_le_bytes());
        }
        let value =
            BinXmlValue::from_slot(&data, slot(0, data.len(), 0x86), WINDOWS_1252).unwrap();
        assert_eq!(render(&value), "1, 2, 3");
        assert_eq!(
            value.to_json_value(),
            serde_json::json!([1, 2, 3])
        );
    }

    #[test]
    fn test_string_array_splits_on_nul() {
        let mut data: Vec<u8> = Vec::new();
        for piece in ["one", "two"] {
            data.extend(piece.encode_utf16().flat_map(u16::to_le_bytes));
            data.extend_from_slice(&[0, 0]);
        }
        let value =
            BinXmlValue::from_slot(&data, slot(0, data.len(), 0x81), WINDOWS_1252).unwrap();
        assert_eq!(render(&value), "one, two");
    }

    #[test]
    fn test_empty_optional_detection() {
        assert!(slot(0, 0, 0x01).is_empty_optional());
        assert!(slot(0, 4, 0x00).is_empty_optional());
        assert!(!slot(0, 4, 0x01).is_empty_optional());
    }

    #[test]
    fn test_filetime_slot() {
        let data = 131_124_751_716_816_400u64.to_le_bytes();
        let value = BinXmlValue::from_slot(&data, slot(0, 8, 0x11), WINDOWS_1252).unwrap();
        assert_eq!(render(&value), "2016-07-08T18:12:51.6816400Z");
        assert_eq!(
            value.to_json_value(),
            JsonValue::String("2016-07-08T18:12:51.6816400Z".to_string())
        );
    }
}
