use ahash::RandomState;
use hashbrown::HashMap;
use log::trace;

use crate::Offset;
use crate::chunk::EVTX_CHUNK_SIZE;
use crate::guid::Guid;
use crate::utils::bytes;

/// On-disk size of a template definition header:
/// next-offset (4) + GUID (16) + data size (4).
pub(crate) const TEMPLATE_HEADER_SIZE: usize = 24;

/// A template definition located inside a chunk.
///
/// The descriptor is a weak handle: it owns nothing, the body bytes stay in
/// the shared file buffer and are re-walked per rendering (or served from the
/// compiled-template cache).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemplateDescriptor {
    pub guid: Guid,
    pub data_size: u32,
    /// Chunk-relative offset of the first body byte (past the 24-byte header).
    pub data_offset: Offset,
}

/// Per-chunk cache of template definitions, keyed by the chunk-relative
/// offset of the definition. Owned by a single worker.
#[derive(Debug, Default)]
pub struct TemplateCache(HashMap<Offset, TemplateDescriptor, RandomState>);

impl TemplateCache {
    pub(crate) fn new() -> Self {
        TemplateCache(HashMap::with_hasher(RandomState::new()))
    }

    /// Preload definitions by walking the 32 chained buckets of the chunk's
    /// template pointer table.
    ///
    /// A chain terminates on: a zero next-offset, an offset already present
    /// (revisiting any known offset is equivalent to cycle detection, since
    /// keys are definition offsets), or a descriptor that would exceed the
    /// chunk (reported through `warnings`).
    pub(crate) fn populate(
        chunk_data: &[u8],
        offsets: &[Offset],
        warnings: &mut Vec<String>,
    ) -> Self {
        let mut cache = TemplateCache::new();

        for &head in offsets.iter().filter(|&&offset| offset > 0) {
            let mut offset = head;

            while offset > 0 {
                if offset as usize + TEMPLATE_HEADER_SIZE > EVTX_CHUNK_SIZE {
                    warnings.push(format!(
                        "template pointer {offset} exceeds chunk bounds, terminating chain"
                    ));
                    break;
                }

                if cache.0.contains_key(&offset) {
                    trace!("template at {offset} already cached, terminating chain");
                    break;
                }

                let Some(descriptor) = read_descriptor(chunk_data, offset) else {
                    warnings.push(format!(
                        "template definition at {offset} is truncated, terminating chain"
                    ));
                    break;
                };

                let next = match bytes::read_u32_le(chunk_data, offset as usize) {
                    Some(next) => next,
                    None => break,
                };

                if descriptor.data_offset as usize + descriptor.data_size as usize
                    > EVTX_CHUNK_SIZE
                {
                    warnings.push(format!(
                        "template body at {offset} ({} bytes) exceeds chunk bounds, \
                         terminating chain",
                        descriptor.data_size
                    ));
                    break;
                }

                cache.0.insert(offset, descriptor);
                offset = next;
            }
        }

        cache
    }

    pub(crate) fn get(&self, offset: Offset) -> Option<TemplateDescriptor> {
        self.0.get(&offset).copied()
    }

    pub(crate) fn insert(&mut self, offset: Offset, descriptor: TemplateDescriptor) {
        self.0.insert(offset, descriptor);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Read a descriptor's header fields at `offset` without touching any cursor.
pub(crate) fn read_descriptor(chunk_data: &[u8], offset: Offset) -> Option<TemplateDescriptor> {
    let offset = offset as usize;
    let guid_bytes = bytes::read_array::<16>(chunk_data, offset + 4)?;
    let data_size = bytes::read_u32_le(chunk_data, offset + 20)?;

    let guid = Guid::new(
        u32::from_le_bytes(guid_bytes[0..4].try_into().expect("sliced 4 bytes")),
        u16::from_le_bytes(guid_bytes[4..6].try_into().expect("sliced 2 bytes")),
        u16::from_le_bytes(guid_bytes[6..8].try_into().expect("sliced 2 bytes")),
        guid_bytes[8..16].try_into().expect("sliced 8 bytes"),
    );

    Some(TemplateDescriptor {
        guid,
        data_size,
        data_offset: (offset + TEMPLATE_HEADER_SIZE) as Offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(next: u32, guid_seed: u8, body: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&next.to_le_bytes());
        buf.extend_from_slice(&[guid_seed; 16]);
        buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
        buf.extend_from_slice(body);
        buf
    }

    #[test]
    fn test_walks_a_chain() {
        let mut data = vec![0u8; 1024];
        // First definition at 1024, chained to a second at 1100.
        data.extend(definition(1100, 1, &[0x0F; 8]));
        data.resize(1100, 0);
        data.extend(definition(0, 2, &[0x0F; 4]));
        data.resize(EVTX_CHUNK_SIZE, 0);

        let mut warnings = vec![];
        let cache = TemplateCache::populate(&data, &[1024], &mut warnings);
        assert_eq!(cache.len(), 2);
        assert!(warnings.is_empty());
        assert_eq!(cache.get(1024).unwrap().data_offset, 1048);
        assert_eq!(cache.get(1100).unwrap().data_size, 4);
    }

    #[test]
    fn test_zero_bucket_preloads_nothing() {
        let data = vec![0u8; EVTX_CHUNK_SIZE];
        let mut warnings = vec![];
        let cache = TemplateCache::populate(&data, &[0, 0], &mut warnings);
        assert!(cache.is_empty());
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_cyclic_chain_terminates() {
        let mut data = vec![0u8; 1024];
        // Definition pointing back at itself.
        data.extend(definition(1024, 1, &[0x0F; 4]));
        data.resize(EVTX_CHUNK_SIZE, 0);

        let mut warnings = vec![];
        let cache = TemplateCache::populate(&data, &[1024], &mut warnings);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_out_of_bounds_pointer_warns() {
        let data = vec![0u8; EVTX_CHUNK_SIZE];
        let mut warnings = vec![];
        let cache = TemplateCache::populate(&data, &[0x1_0000], &mut warnings);
        assert!(cache.is_empty());
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_oversized_body_warns_and_terminates() {
        let mut data = vec![0u8; 1024];
        data.extend(definition(0, 1, &[]));
        // Lie about the body size.
        data[1044..1048].copy_from_slice(&(u32::MAX).to_le_bytes());
        data.resize(EVTX_CHUNK_SIZE, 0);

        let mut warnings = vec![];
        let cache = TemplateCache::populate(&data, &[1024], &mut warnings);
        assert!(cache.is_empty());
        assert_eq!(warnings.len(), 1);
    }
}
