use std::rc::Rc;

use ahash::RandomState;
use hashbrown::HashMap;
use log::trace;

use crate::Offset;
use crate::binxml::name::read_name_at;

/// Per-chunk cache of decoded element/attribute names, keyed by the
/// chunk-relative offset of the name structure.
///
/// The 64-bucket common-string table is preloaded; anything else is decoded
/// on first reference and cached. Owned by a single worker, never shared.
#[derive(Debug, Default)]
pub struct StringCache(HashMap<Offset, Rc<str>, RandomState>);

impl StringCache {
    pub(crate) fn populate(chunk_data: &[u8], offsets: &[Offset]) -> Self {
        let mut cache = HashMap::with_capacity_and_hasher(offsets.len(), RandomState::new());

        for &offset in offsets.iter().filter(|&&offset| offset > 0) {
            match read_name_at(chunk_data, offset as usize) {
                Ok((name, _)) => {
                    cache.insert(offset, name);
                }
                Err(e) => {
                    // A broken bucket only loses the dedup, names are still
                    // resolvable from the token stream.
                    trace!("skipping common-string bucket at {offset}: {e}");
                }
            }
        }

        StringCache(cache)
    }

    pub(crate) fn get(&self, offset: Offset) -> Option<Rc<str>> {
        self.0.get(&offset).cloned()
    }

    pub(crate) fn insert(&mut self, offset: Offset, name: Rc<str>) {
        self.0.insert(offset, name);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name_struct(name: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&(name.len() as u16).to_le_bytes());
        buf.extend(name.encode_utf16().flat_map(u16::to_le_bytes));
        buf.extend_from_slice(&[0, 0]);
        buf
    }

    #[test]
    fn test_populates_from_bucket_offsets() {
        let mut data = vec![0u8; 16];
        let offset = data.len() as Offset;
        data.extend(name_struct("Provider"));

        let cache = StringCache::populate(&data, &[0, offset, 0]);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(offset).as_deref(), Some("Provider"));
        assert_eq!(cache.get(4), None);
    }

    #[test]
    fn test_bad_bucket_is_skipped() {
        let data = vec![0u8; 8];
        let cache = StringCache::populate(&data, &[60000]);
        assert!(cache.is_empty());
    }
}
