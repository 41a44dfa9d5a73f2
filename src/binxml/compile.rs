//! Template specialization.
//!
//! A template body is walked once, without substitution values, into an
//! interleaved sequence of static text fragments and substitution slots:
//! `parts[0] slot[0] parts[1] slot[1] ... parts[n]`. Renderings after the
//! first skip all structural re-parsing and only fill slots.
//!
//! Compilation is best-effort: a body containing a nested template instance,
//! a nested fragment header, a processing instruction or a token the compiler
//! does not model stores `None` for that GUID, and the interpreter handles
//! every future rendering. The emission rules mirror `decoder` exactly so the
//! two paths are byte-identical.

use std::sync::{Arc, RwLock};

use ahash::RandomState;
use hashbrown::HashMap;
use log::trace;
use quick_xml::escape::escape;

use crate::binxml::name::read_name_ref;
use crate::binxml::tokens::BinXmlRawToken;
use crate::binxml::{ChunkCtx, MAX_NESTING_DEPTH};
use crate::template_cache::TemplateDescriptor;
use crate::utils::ByteCursor;
use crate::utils::bytes;
use crate::utils::utf16::read_len_prefixed_utf16_string;

/// A specialized template: static text around substitution slots.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CompiledTemplate {
    pub parts: Vec<String>,
    /// `(slot id, is optional substitution)` per gap between parts.
    pub subs: Vec<(u16, bool)>,
}

/// Process-wide compiled-template cache, keyed by template GUID.
///
/// Shared across workers. Two workers may race to compile the same GUID;
/// equal inputs produce equal outputs, so last-wins insertion is idempotent.
#[derive(Debug, Default)]
pub struct CompiledTemplateCache {
    inner: RwLock<HashMap<[u8; 16], Option<Arc<CompiledTemplate>>, RandomState>>,
}

impl CompiledTemplateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outer `None` is a cache miss; inner `None` records a template that
    /// could not be specialized.
    pub(crate) fn get(&self, guid: &[u8; 16]) -> Option<Option<Arc<CompiledTemplate>>> {
        self.inner
            .read()
            .expect("compiled template cache lock poisoned")
            .get(guid)
            .cloned()
    }

    pub(crate) fn insert(&self, guid: [u8; 16], compiled: Option<Arc<CompiledTemplate>>) {
        self.inner
            .write()
            .expect("compiled template cache lock poisoned")
            .insert(guid, compiled);
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .expect("compiled template cache lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Compile the body of `descriptor`, or `None` if the body resists static
/// specialization (the caller caches either outcome).
pub(crate) fn compile_template(
    ctx: &mut ChunkCtx<'_>,
    descriptor: &TemplateDescriptor,
) -> Option<CompiledTemplate> {
    let body_start = descriptor.data_offset as usize;
    let body_end = body_start.checked_add(descriptor.data_size as usize)?;
    if body_end > ctx.data.len() {
        return None;
    }

    let mut cursor = ByteCursor::with_pos(ctx.data, body_start).ok()?;
    let mut compiler = Compiler {
        ctx,
        parts: vec![String::new()],
        subs: Vec::new(),
    };

    compiler.walk_body(&mut cursor, body_end)?;

    debug_assert_eq!(compiler.parts.len(), compiler.subs.len() + 1);
    Some(CompiledTemplate {
        parts: compiler.parts,
        subs: compiler.subs,
    })
}

struct Compiler<'a, 'c> {
    ctx: &'a mut ChunkCtx<'c>,
    parts: Vec<String>,
    subs: Vec<(u16, bool)>,
}

impl<'a, 'c> Compiler<'a, 'c> {
    fn emit(&mut self, text: &str) {
        self.parts
            .last_mut()
            .expect("parts is never empty")
            .push_str(text);
    }

    fn slot(&mut self, slot_id: u16, optional: bool) {
        self.subs.push((slot_id, optional));
        self.parts.push(String::new());
    }

    fn peek_token(&self, cursor: &ByteCursor<'c>) -> Option<BinXmlRawToken> {
        bytes::read_u8(self.ctx.data, cursor.pos()).and_then(BinXmlRawToken::from_u8)
    }

    /// The body starts with a fragment header, then holds one element.
    fn walk_body(&mut self, cursor: &mut ByteCursor<'c>, end: usize) -> Option<()> {
        let first = cursor.u8_named("token").ok()?;
        if BinXmlRawToken::from_u8(first) != Some(BinXmlRawToken::StartOfStream) {
            trace!("template body does not start with a fragment header");
            return None;
        }
        cursor.advance(3, "fragment header").ok()?;

        while cursor.pos() < end {
            match self.peek_token(cursor)? {
                BinXmlRawToken::EndOfStream => {
                    cursor.advance(1, "token").ok()?;
                    break;
                }
                BinXmlRawToken::OpenStartElement { has_attributes } => {
                    cursor.advance(1, "token").ok()?;
                    self.walk_element(cursor, end, has_attributes, 0)?;
                }
                // Nested fragments and template instances are not modelled.
                _ => return None,
            }
        }

        Some(())
    }

    fn walk_element(
        &mut self,
        cursor: &mut ByteCursor<'c>,
        end: usize,
        has_attributes: bool,
        depth: usize,
    ) -> Option<()> {
        if depth >= MAX_NESTING_DEPTH {
            return None;
        }

        let _dependency_id = cursor.u16_named("element dependency id").ok()?;
        let _data_size = cursor.u32_named("element data size").ok()?;
        let name = read_name_ref(cursor, &mut self.ctx.string_cache).ok()?;

        self.emit("<");
        self.emit(&name);

        if has_attributes {
            let attr_list_size = cursor.u32_named("attribute list size").ok()?;
            let attr_end = (cursor.pos() + attr_list_size as usize).min(end);
            while cursor.pos() < attr_end {
                match self.peek_token(cursor)? {
                    BinXmlRawToken::Attribute => {
                        cursor.advance(1, "token").ok()?;
                        let attr_name = read_name_ref(cursor, &mut self.ctx.string_cache).ok()?;
                        self.emit(" ");
                        self.emit(&attr_name);
                        self.emit("=\"");
                        self.walk_content(cursor, attr_end, depth, true)?;
                        self.emit("\"");
                    }
                    _ => return None,
                }
            }
        }

        match self.peek_token(cursor)? {
            BinXmlRawToken::CloseEmptyElement => {
                cursor.advance(1, "token").ok()?;
                self.emit("/>");
                Some(())
            }
            BinXmlRawToken::CloseStartElement => {
                cursor.advance(1, "token").ok()?;
                self.emit(">");
                self.walk_content(cursor, end, depth, false)?;
                self.emit("</");
                self.emit(&name);
                self.emit(">");
                Some(())
            }
            _ => {
                cursor.advance(1, "token").ok()?;
                self.emit("/>");
                Some(())
            }
        }
    }

    fn walk_content(
        &mut self,
        cursor: &mut ByteCursor<'c>,
        end: usize,
        depth: usize,
        in_attribute: bool,
    ) -> Option<()> {
        while cursor.pos() < end {
            match self.peek_token(cursor)? {
                BinXmlRawToken::EndOfStream => {
                    cursor.advance(1, "token").ok()?;
                    return Some(());
                }
                BinXmlRawToken::CloseElement => {
                    cursor.advance(1, "token").ok()?;
                    return Some(());
                }
                BinXmlRawToken::Attribute
                | BinXmlRawToken::CloseStartElement
                | BinXmlRawToken::CloseEmptyElement
                    if in_attribute =>
                {
                    return Some(());
                }
                BinXmlRawToken::CloseStartElement | BinXmlRawToken::CloseEmptyElement => {
                    cursor.advance(1, "token").ok()?;
                    return Some(());
                }
                BinXmlRawToken::Value => {
                    cursor.advance(1, "token").ok()?;
                    let value_type = cursor.u8_named("value type").ok()?;
                    if value_type != 0x01 {
                        return None;
                    }
                    let text =
                        read_len_prefixed_utf16_string(cursor, false, "value text").ok()?;
                    let escaped = escape(text.as_str()).into_owned();
                    self.emit(&escaped);
                }
                BinXmlRawToken::NormalSubstitution => {
                    cursor.advance(1, "token").ok()?;
                    let slot_id = cursor.u16_named("substitution slot").ok()?;
                    let _value_type = cursor.u8_named("substitution type").ok()?;
                    self.slot(slot_id, false);
                }
                BinXmlRawToken::ConditionalSubstitution => {
                    cursor.advance(1, "token").ok()?;
                    let slot_id = cursor.u16_named("substitution slot").ok()?;
                    let _value_type = cursor.u8_named("substitution type").ok()?;
                    self.slot(slot_id, true);
                }
                BinXmlRawToken::CharReference => {
                    cursor.advance(1, "token").ok()?;
                    let codepoint = cursor.u16_named("char ref").ok()?;
                    let text = format!("&#{codepoint};");
                    self.emit(&text);
                }
                BinXmlRawToken::EntityReference => {
                    cursor.advance(1, "token").ok()?;
                    let name = read_name_ref(cursor, &mut self.ctx.string_cache).ok()?;
                    self.emit("&");
                    self.emit(&name);
                    self.emit(";");
                }
                BinXmlRawToken::CDataSection => {
                    cursor.advance(1, "token").ok()?;
                    let text = read_len_prefixed_utf16_string(cursor, false, "cdata").ok()?;
                    if in_attribute {
                        let escaped = escape(text.as_str()).into_owned();
                        self.emit(&escaped);
                    } else {
                        self.emit("<![CDATA[");
                        self.emit(&text);
                        self.emit("]]>");
                    }
                }
                BinXmlRawToken::OpenStartElement { has_attributes } if !in_attribute => {
                    cursor.advance(1, "token").ok()?;
                    self.walk_element(cursor, end, has_attributes, depth + 1)?;
                }
                // TemplateInstance, nested StartOfStream, processing
                // instructions, or anything else: bail.
                _ => return None,
            }
        }

        Some(())
    }
}
