use std::fmt::{self, Debug, Display, Write};

use crate::err::DeserializationResult;
use crate::utils::ByteCursor;

/// A Windows GUID. Data1/Data2/Data3 are stored little-endian, the trailing
/// eight bytes in byte order.
#[derive(PartialOrd, PartialEq, Eq, Hash, Clone, Copy)]
pub struct Guid {
    data1: u32,
    data2: u16,
    data3: u16,
    data4: [u8; 8],
}

impl Guid {
    pub fn new(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Guid {
        Guid {
            data1,
            data2,
            data3,
            data4,
        }
    }

    pub(crate) fn from_cursor(cursor: &mut ByteCursor<'_>) -> DeserializationResult<Guid> {
        let data1 = cursor.u32_named("guid.data1")?;
        let data2 = cursor.u16_named("guid.data2")?;
        let data3 = cursor.u16_named("guid.data3")?;
        let data4 = cursor.array::<8>("guid.data4")?;
        Ok(Guid::new(data1, data2, data3, data4))
    }

    /// The raw 16 bytes in on-disk order, used as the compiled-template
    /// cache key.
    pub(crate) fn as_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..4].copy_from_slice(&self.data1.to_le_bytes());
        out[4..6].copy_from_slice(&self.data2.to_le_bytes());
        out[6..8].copy_from_slice(&self.data3.to_le_bytes());
        out[8..16].copy_from_slice(&self.data4);
        out
    }
}

impl Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // We know ahead of time how much space we need.
        let mut s = String::with_capacity(38);
        write!(
            &mut s,
            "{{{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}}}",
            self.data1,
            self.data2,
            self.data3,
            self.data4[0],
            self.data4[1],
            self.data4[2],
            self.data4[3],
            self.data4[4],
            self.data4[5],
            self.data4[6],
            self.data4[7]
        )
        .expect("writing to a preallocated buffer cannot fail");
        f.write_str(&s)
    }
}

impl Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guid_formatting_is_braced_lowercase() {
        // {03ba9a5d-267a-4bd8-a5a8-5bd41ecb48f2} in on-disk byte order.
        let bytes = [
            0x5D, 0x9A, 0xBA, 0x03, 0x7A, 0x26, 0xD8, 0x4B, 0xA5, 0xA8, 0x5B, 0xD4, 0x1E, 0xCB,
            0x48, 0xF2,
        ];
        let mut cur = ByteCursor::with_pos(&bytes, 0).unwrap();
        let guid = Guid::from_cursor(&mut cur).unwrap();
        assert_eq!(
            guid.to_string(),
            "{03ba9a5d-267a-4bd8-a5a8-5bd41ecb48f2}"
        );
        assert_eq!(guid.as_bytes(), bytes);
    }
}
