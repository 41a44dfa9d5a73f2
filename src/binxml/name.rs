use std::rc::Rc;

use log::trace;

use crate::Offset;
use crate::err::DeserializationResult;
use crate::string_cache::StringCache;
use crate::utils::ByteCursor;
use crate::utils::utf16::read_len_prefixed_utf16_string;

/// Decode a name structure at `offset`: next-name link (4), hash (2),
/// character count (2), UTF-16LE characters, NUL terminator (2).
///
/// Returns the decoded name and the number of bytes the structure occupies.
pub(crate) fn read_name_at(
    chunk_data: &[u8],
    offset: usize,
) -> DeserializationResult<(Rc<str>, usize)> {
    let mut cursor = ByteCursor::with_pos(chunk_data, offset)?;
    let _next_name_offset = cursor.u32_named("name link")?;
    let _hash = cursor.u16_named("name hash")?;
    let name = read_len_prefixed_utf16_string(&mut cursor, true, "name string")?;
    Ok((Rc::from(name.as_str()), cursor.pos() - offset))
}

/// Resolve a name reference in the token stream.
///
/// The cursor is positioned at the 4-byte name-offset field. The name is
/// **inline** when the offset equals the cursor position right after the
/// field, in which case the structure is consumed from the stream; otherwise
/// it is a back-reference served from (and added to) the chunk's cache.
pub(crate) fn read_name_ref(
    cursor: &mut ByteCursor<'_>,
    cache: &mut StringCache,
) -> DeserializationResult<Rc<str>> {
    let name_offset = cursor.u32_named("name offset")?;

    if name_offset as usize == cursor.pos() {
        let (name, consumed) = read_name_at(cursor.buf(), name_offset as usize)?;
        cursor.advance(consumed, "inline name")?;
        cache.insert(name_offset as Offset, name.clone());
        return Ok(name);
    }

    if let Some(name) = cache.get(name_offset as Offset) {
        return Ok(name);
    }

    trace!("name cache miss at offset {name_offset}");
    let (name, _) = read_name_at(cursor.buf(), name_offset as usize)?;
    cache.insert(name_offset as Offset, name.clone());
    Ok(name)
}
