use std::fmt::{self, Debug, Display, Write};

use crate::err::DeserializationResult;
use crate::utils::ByteCursor;

/// A Windows security identifier (NTSID).
///
/// On disk: revision (u8), sub-authority count (u8), a 6-byte big-endian
/// identifier authority, then the sub-authorities as little-endian u32s.
#[derive(PartialOrd, PartialEq, Clone)]
pub struct Sid {
    revision: u8,
    authority: u64,
    sub_authorities: Vec<u32>,
}

impl Sid {
    pub(crate) fn from_cursor(cursor: &mut ByteCursor<'_>) -> DeserializationResult<Sid> {
        let revision = cursor.u8_named("sid.revision")?;
        let sub_authority_count = cursor.u8_named("sid.sub_authority_count")?;
        let authority_bytes = cursor.array::<6>("sid.authority")?;

        let mut authority = 0u64;
        for byte in authority_bytes {
            authority = (authority << 8) | u64::from(byte);
        }

        let mut sub_authorities = Vec::with_capacity(usize::from(sub_authority_count));
        for _ in 0..sub_authority_count {
            sub_authorities.push(cursor.u32_named("sid.sub_authority")?);
        }

        Ok(Sid {
            revision,
            authority,
            sub_authorities,
        })
    }

    /// Total on-disk width of a SID whose second byte is `sub_authority_count`.
    pub(crate) fn wire_size(sub_authority_count: u8) -> usize {
        8 + 4 * usize::from(sub_authority_count)
    }
}

impl Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut repr = String::new();
        write!(repr, "S-{}-{}", self.revision, self.authority)
            .expect("Writing to a String cannot fail");
        for element in self.sub_authorities.iter() {
            write!(repr, "-{}", element).expect("Writing to a String cannot fail");
        }
        f.write_str(&repr)
    }
}

impl Debug for Sid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}
