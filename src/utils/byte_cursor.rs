use crate::err::{DeserializationError, DeserializationResult};
use crate::utils::bytes;

/// A lightweight cursor over an immutable byte slice.
///
/// This is the slice/offset equivalent of `Cursor<&[u8]>`, intended for
/// hot-path parsing where the data is already in memory and we want explicit
/// bounds/offset control without IO-style error plumbing.
///
/// All reads are little-endian and advance the cursor on success. The cursor
/// is `Copy`, which is what makes the side-effect-free pre-scans of the JSON
/// renderer cheap.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ByteCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    #[inline]
    pub(crate) fn with_pos(buf: &'a [u8], pos: usize) -> DeserializationResult<Self> {
        // Allow pos == len (EOF), reject pos > len.
        let _ = bytes::slice_r(buf, pos, 0, "cursor.position")?;
        Ok(Self { buf, pos })
    }

    #[inline]
    pub(crate) fn buf(&self) -> &'a [u8] {
        self.buf
    }

    #[inline]
    pub(crate) fn pos(&self) -> usize {
        self.pos
    }

    #[inline]
    pub(crate) fn position(&self) -> u64 {
        self.pos as u64
    }

    #[inline]
    pub(crate) fn set_pos(&mut self, pos: usize, what: &'static str) -> DeserializationResult<()> {
        let _ = bytes::slice_r(self.buf, pos, 0, what)?;
        self.pos = pos;
        Ok(())
    }

    #[inline]
    pub(crate) fn advance(&mut self, n: usize, what: &'static str) -> DeserializationResult<()> {
        let new_pos = self
            .pos
            .checked_add(n)
            .ok_or_else(|| DeserializationError::Truncated {
                what,
                offset: self.pos as u64,
                need: n,
                have: self.buf.len().saturating_sub(self.pos),
            })?;
        self.set_pos(new_pos, what)
    }

    #[inline]
    pub(crate) fn take_bytes(
        &mut self,
        len: usize,
        what: &'static str,
    ) -> DeserializationResult<&'a [u8]> {
        let out = bytes::slice_r(self.buf, self.pos, len, what)?;
        self.pos += len;
        Ok(out)
    }

    #[inline]
    pub(crate) fn array<const N: usize>(
        &mut self,
        what: &'static str,
    ) -> DeserializationResult<[u8; N]> {
        let v = bytes::read_array_r::<N>(self.buf, self.pos, what)?;
        self.pos += N;
        Ok(v)
    }

    #[inline]
    pub(crate) fn u8_named(&mut self, what: &'static str) -> DeserializationResult<u8> {
        let b =
            bytes::read_u8(self.buf, self.pos).ok_or_else(|| DeserializationError::Truncated {
                what,
                offset: self.pos as u64,
                need: 1,
                have: self.buf.len().saturating_sub(self.pos),
            })?;
        self.pos += 1;
        Ok(b)
    }

    #[inline]
    pub(crate) fn u16_named(&mut self, what: &'static str) -> DeserializationResult<u16> {
        let v = bytes::read_u16_le_r(self.buf, self.pos, what)?;
        self.pos += 2;
        Ok(v)
    }

    #[inline]
    pub(crate) fn u32_named(&mut self, what: &'static str) -> DeserializationResult<u32> {
        let v = bytes::read_u32_le_r(self.buf, self.pos, what)?;
        self.pos += 4;
        Ok(v)
    }

    #[inline]
    pub(crate) fn u64_named(&mut self, what: &'static str) -> DeserializationResult<u64> {
        let v = bytes::read_u64_le_r(self.buf, self.pos, what)?;
        self.pos += 8;
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_advances_on_reads() {
        let buf = [0xAA, 0xBB, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00];
        let mut cur = ByteCursor::with_pos(&buf, 0).unwrap();
        assert_eq!(cur.u8_named("a").unwrap(), 0xAA);
        assert_eq!(cur.u8_named("b").unwrap(), 0xBB);
        assert_eq!(cur.u16_named("c").unwrap(), 1);
        assert_eq!(cur.u32_named("d").unwrap(), 2);
        assert_eq!(cur.pos(), 8);
        assert!(cur.u8_named("eof").is_err());
    }

    #[test]
    fn test_with_pos_rejects_out_of_bounds() {
        let buf = [0u8; 4];
        assert!(ByteCursor::with_pos(&buf, 4).is_ok());
        assert!(ByteCursor::with_pos(&buf, 5).is_err());
    }
}
