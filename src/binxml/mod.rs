//! BinXml decoding.
//!
//! The decoder is a recursive-descent interpreter over a byte cursor that is
//! always positioned *within the chunk slice*, so chunk-relative offsets and
//! cursor positions coincide. That single invariant drives all inline/
//! back-reference decisions: a name or template definition is inline exactly
//! when its offset field equals the cursor position, including inside nested
//! documents carried by `BinXml`-typed substitution values.

pub(crate) mod compile;
pub(crate) mod decoder;
pub(crate) mod json;
pub(crate) mod name;
pub(crate) mod tokens;
pub(crate) mod value;

use encoding::EncodingRef;
use log::trace;

use crate::Offset;
use crate::err::{DeserializationError, DeserializationResult};
use crate::string_cache::StringCache;
use crate::template_cache::{TEMPLATE_HEADER_SIZE, TemplateCache, TemplateDescriptor, read_descriptor};
use crate::utils::ByteCursor;
use value::SlotRef;

/// Maximum element/document nesting depth. Crafted inputs beyond this bound
/// are rejected instead of growing the stack.
pub(crate) const MAX_NESTING_DEPTH: usize = 64;

/// Worker-local decoding context for one chunk.
pub(crate) struct ChunkCtx<'a> {
    /// The chunk slice (up to 64 KiB), shared read-only.
    pub data: &'a [u8],
    pub string_cache: StringCache,
    pub template_cache: TemplateCache,
    pub ansi_codec: EncodingRef,
}

/// A parsed template-instance header: the resolved definition (if any) plus
/// the typed substitution value table.
pub(crate) struct TemplateInstance {
    pub descriptor: Option<TemplateDescriptor>,
    pub def_offset: Offset,
    pub values: Vec<SlotRef>,
}

/// Consume a template instance (the `0x0C` token itself is already consumed).
///
/// The definition is inline iff its offset equals the cursor position; inline
/// definitions are consumed and registered in the chunk template cache. A
/// back-reference is served from the cache, or synthesized by reading the
/// 24-byte definition header in place on a miss (`register` also controls
/// whether the synthesized descriptor is cached, which the side-effect-free
/// pre-scans disable).
pub(crate) fn read_template_instance<'a>(
    ctx: &mut ChunkCtx<'a>,
    cursor: &mut ByteCursor<'a>,
    register: bool,
) -> DeserializationResult<TemplateInstance> {
    let _reserved = cursor.u8_named("template instance")?;
    let _template_id = cursor.u32_named("template id")?;
    let def_offset = cursor.u32_named("template definition offset")?;

    let descriptor = if def_offset as usize == cursor.pos() {
        // Inline definition: consume the header and the body.
        let descriptor = read_descriptor(ctx.data, def_offset);
        if let Some(descriptor) = descriptor {
            cursor.advance(
                TEMPLATE_HEADER_SIZE + descriptor.data_size as usize,
                "inline template definition",
            )?;
            if register {
                ctx.template_cache.insert(def_offset, descriptor);
            }
        }
        descriptor
    } else {
        match ctx.template_cache.get(def_offset) {
            Some(descriptor) => Some(descriptor),
            None => {
                trace!("template cache miss for definition at {def_offset}");
                let descriptor = read_descriptor(ctx.data, def_offset);
                if let (Some(descriptor), true) = (descriptor, register) {
                    ctx.template_cache.insert(def_offset, descriptor);
                }
                descriptor
            }
        }
    };

    // Reject descriptors whose body does not fit the chunk.
    let descriptor = descriptor.filter(|d| {
        d.data_offset as usize + d.data_size as usize <= ctx.data.len()
    });

    let num_values = cursor.u32_named("substitution count")?;

    // Each descriptor occupies 4 bytes; an implausible count cannot be real.
    let remaining = ctx.data.len().saturating_sub(cursor.pos());
    if num_values as usize > remaining / 4 {
        return Err(DeserializationError::other(
            "substitution count exceeds available data",
            cursor.position(),
        ));
    }

    let mut descriptors = Vec::with_capacity(num_values as usize);
    for _ in 0..num_values {
        let size = cursor.u16_named("substitution size")?;
        let value_type = cursor.u8_named("substitution type")?;
        let _reserved = cursor.u8_named("substitution reserved")?;
        descriptors.push((size, value_type));
    }

    let mut values = Vec::with_capacity(descriptors.len());
    for (size, value_type) in descriptors {
        values.push(SlotRef {
            offset: cursor.pos(),
            size,
            value_type,
        });
        cursor.advance(usize::from(size), "substitution value")?;
    }

    Ok(TemplateInstance {
        descriptor,
        def_offset,
        values,
    })
}
