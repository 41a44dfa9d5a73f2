//! UTF-16LE decoding helpers.
//!
//! All BinXml names and string values are UTF-16LE. Decoding must never fail
//! on malformed input: unpaired surrogates are replaced with `U+FFFD` so the
//! rendered output always survives UTF-8 encoding.

use crate::err::DeserializationResult;
use crate::utils::byte_cursor::ByteCursor;

/// Decode a UTF-16LE byte region into a `String`, replacing unpaired
/// surrogates with `U+FFFD`.
pub(crate) fn decode_utf16le(bytes: &[u8]) -> String {
    let units = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]));
    char::decode_utf16(units)
        .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

/// Read a `u16` count of UTF-16 code units, then that many code units.
/// When `is_null_terminated` is set, a trailing NUL code unit is consumed
/// and discarded.
pub(crate) fn read_len_prefixed_utf16_string<'a>(
    cursor: &mut ByteCursor<'a>,
    is_null_terminated: bool,
    what: &'static str,
) -> DeserializationResult<String> {
    let num_chars = cursor.u16_named(what)? as usize;
    let bytes = cursor.take_bytes(num_chars * 2, what)?;
    if is_null_terminated {
        let _ = cursor.u16_named(what)?;
    }
    Ok(decode_utf16le(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utf16le(s: &str) -> Vec<u8> {
        s.encode_utf16().flat_map(u16::to_le_bytes).collect()
    }

    #[test]
    fn test_decodes_plain_text() {
        assert_eq!(decode_utf16le(&utf16le("Event")), "Event");
    }

    #[test]
    fn test_replaces_unpaired_surrogates() {
        // Lone high surrogate D800 followed by 'A'.
        let bytes = [0x00, 0xD8, 0x41, 0x00];
        let decoded = decode_utf16le(&bytes);
        assert_eq!(decoded, "\u{FFFD}A");
        // The result must be encodable as UTF-8 (it is a `String` already).
        assert!(decoded.as_bytes().len() > 0);
    }

    #[test]
    fn test_len_prefixed_string() {
        let mut buf = vec![4, 0];
        buf.extend(utf16le("Data"));
        buf.extend_from_slice(&[0, 0]);
        let mut cur = ByteCursor::with_pos(&buf, 0).unwrap();
        let s = read_len_prefixed_utf16_string(&mut cur, true, "name").unwrap();
        assert_eq!(s, "Data");
        assert_eq!(cur.pos(), buf.len());
    }
}
