//! The XML renderer: a recursive-descent interpreter over the token stream.
//!
//! Rendering appends directly to an output `String`. Template bodies go
//! through the process-wide compiled-template cache first (§`compile`);
//! bodies that could not be specialized are interpreted token-by-token with
//! the exact same emission rules, so both paths are byte-identical.

use log::{trace, warn};

use crate::binxml::compile::{CompiledTemplateCache, compile_template};
use crate::binxml::name::read_name_ref;
use crate::binxml::tokens::BinXmlRawToken;
use crate::binxml::value::{BinXmlValue, SlotRef};
use crate::binxml::{ChunkCtx, MAX_NESTING_DEPTH, read_template_instance};
use crate::err::{DeserializationError, DeserializationResult};
use crate::utils::ByteCursor;
use crate::utils::bytes;
use crate::utils::utf16::read_len_prefixed_utf16_string;
use quick_xml::escape::escape;

/// How a content run ended.
#[derive(Debug, PartialEq, Eq)]
enum ContentEnd {
    /// `EndElement` (`0x04`) was consumed.
    EndElement,
    /// End-of-stream token or end of the bounded region.
    EndOfStream,
    /// A token that belongs to the caller was peeked but not consumed.
    CallerToken,
}

pub(crate) struct XmlRenderer<'a, 'c> {
    ctx: &'a mut ChunkCtx<'c>,
    compiled: &'a CompiledTemplateCache,
    warnings: Vec<String>,
}

impl<'a, 'c> XmlRenderer<'a, 'c> {
    pub(crate) fn new(ctx: &'a mut ChunkCtx<'c>, compiled: &'a CompiledTemplateCache) -> Self {
        XmlRenderer {
            ctx,
            compiled,
            warnings: Vec::new(),
        }
    }

    pub(crate) fn drain_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }

    /// Render one record payload (a BinXml document) to XML text.
    pub(crate) fn render_record(
        &mut self,
        payload_offset: usize,
        payload_len: usize,
    ) -> DeserializationResult<String> {
        let end = payload_offset
            .saturating_add(payload_len)
            .min(self.ctx.data.len());
        let mut cursor = ByteCursor::with_pos(self.ctx.data, payload_offset)?;
        let mut out = String::with_capacity(payload_len * 2);
        self.render_document(&mut cursor, end, &[], 0, &mut out)?;
        Ok(out)
    }

    /// Render a document: optional processing instructions, then a fragment
    /// holding either a template instance or an element.
    pub(crate) fn render_document(
        &mut self,
        cursor: &mut ByteCursor<'c>,
        end: usize,
        values: &[SlotRef],
        depth: usize,
        out: &mut String,
    ) -> DeserializationResult<()> {
        if depth >= MAX_NESTING_DEPTH {
            return Err(DeserializationError::other(
                "document nesting exceeds depth bound",
                cursor.position(),
            ));
        }

        while cursor.pos() < end {
            let token = self.read_token(cursor)?;
            match token {
                BinXmlRawToken::EndOfStream => break,
                BinXmlRawToken::StartOfStream => {
                    // major, minor, flags
                    cursor.advance(3, "fragment header")?;
                }
                BinXmlRawToken::ProcessingInstructionTarget => {
                    self.render_pi(cursor, out)?;
                }
                BinXmlRawToken::TemplateInstance => {
                    self.render_template_instance(cursor, depth, out)?;
                }
                BinXmlRawToken::OpenStartElement { has_attributes } => {
                    self.render_element(cursor, end, values, has_attributes, depth, out)?;
                }
                other => {
                    trace!("unexpected document-level token {other:?}");
                    return Err(DeserializationError::other(
                        "unexpected token at document level",
                        cursor.position(),
                    ));
                }
            }
        }

        Ok(())
    }

    fn read_token(&self, cursor: &mut ByteCursor<'c>) -> DeserializationResult<BinXmlRawToken> {
        let offset = cursor.position();
        let byte = cursor.u8_named("binxml token")?;
        BinXmlRawToken::from_u8(byte)
            .ok_or(DeserializationError::InvalidToken { value: byte, offset })
    }

    fn peek_token(&self, cursor: &ByteCursor<'c>) -> Option<BinXmlRawToken> {
        bytes::read_u8(self.ctx.data, cursor.pos()).and_then(BinXmlRawToken::from_u8)
    }

    /// `<?target data?>`. The target and data arrive as separate tokens; a
    /// dangling target renders without data.
    fn render_pi(
        &mut self,
        cursor: &mut ByteCursor<'c>,
        out: &mut String,
    ) -> DeserializationResult<()> {
        let name = read_name_ref(cursor, &mut self.ctx.string_cache)?;
        out.push_str("<?");
        out.push_str(&name);

        if self.peek_token(cursor) == Some(BinXmlRawToken::ProcessingInstructionData) {
            cursor.advance(1, "pi data token")?;
            let data = read_len_prefixed_utf16_string(cursor, false, "pi data")?;
            if !data.is_empty() {
                out.push(' ');
                out.push_str(&data);
            }
        }
        out.push_str("?>");
        Ok(())
    }

    /// Render an element. The open token is already consumed; layout is
    /// dependency id (2), data size (4), name offset (4), optional inline
    /// name, then an optional attribute list.
    fn render_element(
        &mut self,
        cursor: &mut ByteCursor<'c>,
        end: usize,
        values: &[SlotRef],
        has_attributes: bool,
        depth: usize,
        out: &mut String,
    ) -> DeserializationResult<()> {
        if depth >= MAX_NESTING_DEPTH {
            return Err(DeserializationError::other(
                "element nesting exceeds depth bound",
                cursor.position(),
            ));
        }

        let _dependency_id = cursor.u16_named("element dependency id")?;
        let _data_size = cursor.u32_named("element data size")?;
        let name = read_name_ref(cursor, &mut self.ctx.string_cache)?;

        out.push('<');
        out.push_str(&name);

        if has_attributes {
            let attr_list_size = cursor.u32_named("attribute list size")?;
            let attr_end = cursor.pos() + attr_list_size as usize;
            self.render_attributes(cursor, attr_end.min(end), values, depth, out)?;
        }

        match self.read_token(cursor) {
            Ok(BinXmlRawToken::CloseEmptyElement) => {
                out.push_str("/>");
                Ok(())
            }
            Ok(BinXmlRawToken::CloseStartElement) => {
                out.push('>');
                self.render_content(cursor, end, values, depth, out, false)?;
                out.push_str("</");
                out.push_str(&name);
                out.push('>');
                Ok(())
            }
            // Malformed close; emit an empty element rather than bailing on
            // the whole record.
            _ => {
                out.push_str("/>");
                Ok(())
            }
        }
    }

    fn render_attributes(
        &mut self,
        cursor: &mut ByteCursor<'c>,
        attr_end: usize,
        values: &[SlotRef],
        depth: usize,
        out: &mut String,
    ) -> DeserializationResult<()> {
        while cursor.pos() < attr_end {
            match self.read_token(cursor)? {
                BinXmlRawToken::Attribute => {
                    let name = read_name_ref(cursor, &mut self.ctx.string_cache)?;
                    out.push(' ');
                    out.push_str(&name);
                    out.push_str("=\"");
                    self.render_content(cursor, attr_end, values, depth, out, true)?;
                    out.push('"');
                }
                other => {
                    trace!("unexpected token {other:?} in attribute list");
                    return Err(DeserializationError::other(
                        "unexpected token in attribute list",
                        cursor.position(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Render a content run. In attribute context the run breaks (without
    /// consuming) on the next `Attribute` token or element-close token;
    /// otherwise it ends at `EndElement`/end-of-stream.
    fn render_content(
        &mut self,
        cursor: &mut ByteCursor<'c>,
        end: usize,
        values: &[SlotRef],
        depth: usize,
        out: &mut String,
        in_attribute: bool,
    ) -> DeserializationResult<ContentEnd> {
        while cursor.pos() < end {
            let Some(token) = self.peek_token(cursor) else {
                let offset = cursor.position();
                let value = bytes::read_u8(self.ctx.data, cursor.pos()).unwrap_or(0);
                return Err(DeserializationError::InvalidToken { value, offset });
            };

            match token {
                BinXmlRawToken::EndOfStream => {
                    cursor.advance(1, "token")?;
                    return Ok(ContentEnd::EndOfStream);
                }
                BinXmlRawToken::CloseElement => {
                    cursor.advance(1, "token")?;
                    return Ok(ContentEnd::EndElement);
                }
                BinXmlRawToken::Attribute
                | BinXmlRawToken::CloseStartElement
                | BinXmlRawToken::CloseEmptyElement
                    if in_attribute =>
                {
                    return Ok(ContentEnd::CallerToken);
                }
                BinXmlRawToken::CloseStartElement | BinXmlRawToken::CloseEmptyElement => {
                    // Malformed content; stop and let the element close.
                    cursor.advance(1, "token")?;
                    return Ok(ContentEnd::EndElement);
                }
                BinXmlRawToken::Value => {
                    cursor.advance(1, "token")?;
                    self.render_value_text(cursor, out)?;
                }
                BinXmlRawToken::NormalSubstitution => {
                    cursor.advance(1, "token")?;
                    self.render_substitution(cursor, false, values, depth, out)?;
                }
                BinXmlRawToken::ConditionalSubstitution => {
                    cursor.advance(1, "token")?;
                    self.render_substitution(cursor, true, values, depth, out)?;
                }
                BinXmlRawToken::CharReference => {
                    cursor.advance(1, "token")?;
                    let codepoint = cursor.u16_named("char ref")?;
                    out.push_str("&#");
                    out.push_str(&codepoint.to_string());
                    out.push(';');
                }
                BinXmlRawToken::EntityReference => {
                    cursor.advance(1, "token")?;
                    let name = read_name_ref(cursor, &mut self.ctx.string_cache)?;
                    out.push('&');
                    out.push_str(&name);
                    out.push(';');
                }
                BinXmlRawToken::CDataSection => {
                    cursor.advance(1, "token")?;
                    let text = read_len_prefixed_utf16_string(cursor, false, "cdata")?;
                    if in_attribute {
                        out.push_str(&escape(text.as_str()));
                    } else {
                        out.push_str("<![CDATA[");
                        out.push_str(&text);
                        out.push_str("]]>");
                    }
                }
                BinXmlRawToken::StartOfStream => {
                    cursor.advance(4, "fragment header")?;
                }
                BinXmlRawToken::TemplateInstance => {
                    cursor.advance(1, "token")?;
                    self.render_template_instance(cursor, depth, out)?;
                }
                BinXmlRawToken::OpenStartElement { has_attributes } if !in_attribute => {
                    cursor.advance(1, "token")?;
                    self.render_element(cursor, end, values, has_attributes, depth + 1, out)?;
                }
                other => {
                    trace!("unexpected content token {other:?}");
                    return Err(DeserializationError::other(
                        "unexpected token in content",
                        cursor.position(),
                    ));
                }
            }
        }

        Ok(ContentEnd::EndOfStream)
    }

    /// A `Value` token: a type byte (must be a UTF-16 string) and the text.
    fn render_value_text(
        &mut self,
        cursor: &mut ByteCursor<'c>,
        out: &mut String,
    ) -> DeserializationResult<()> {
        let offset = cursor.position();
        let value_type = cursor.u8_named("value type")?;
        if value_type != 0x01 {
            return Err(DeserializationError::InvalidValueType {
                value: value_type,
                offset,
            });
        }
        let text = read_len_prefixed_utf16_string(cursor, false, "value text")?;
        out.push_str(&escape(text.as_str()));
        Ok(())
    }

    fn render_substitution(
        &mut self,
        cursor: &mut ByteCursor<'c>,
        optional: bool,
        values: &[SlotRef],
        depth: usize,
        out: &mut String,
    ) -> DeserializationResult<()> {
        let slot_id = cursor.u16_named("substitution slot")?;
        // The in-body type byte is advisory; the descriptor's type governs.
        let _value_type = cursor.u8_named("substitution type")?;
        self.render_slot(slot_id, optional, values, depth, out)
    }

    pub(crate) fn render_slot(
        &mut self,
        slot_id: u16,
        optional: bool,
        values: &[SlotRef],
        depth: usize,
        out: &mut String,
    ) -> DeserializationResult<()> {
        let Some(&slot) = values.get(usize::from(slot_id)) else {
            trace!("substitution slot {slot_id} out of range ({})", values.len());
            return Ok(());
        };

        if optional && slot.is_empty_optional() {
            return Ok(());
        }

        let value = BinXmlValue::from_slot(self.ctx.data, slot, self.ctx.ansi_codec)?;
        if let BinXmlValue::BinXml { offset, len } = value {
            // An embedded document; its chunk-relative base is the value's
            // own position, which the chunk-wide cursor provides as-is.
            let mut nested = ByteCursor::with_pos(self.ctx.data, offset)?;
            let nested_end = offset.saturating_add(len).min(self.ctx.data.len());
            return self.render_document(&mut nested, nested_end, &[], depth + 1, out);
        }

        value.render_xml_into(out);
        Ok(())
    }

    /// Render a template instance: resolve the definition, read the value
    /// table, then emit the body through the compiled-template cache when
    /// possible.
    fn render_template_instance(
        &mut self,
        cursor: &mut ByteCursor<'c>,
        depth: usize,
        out: &mut String,
    ) -> DeserializationResult<()> {
        let instance = read_template_instance(self.ctx, cursor, true)?;

        let Some(descriptor) = instance.descriptor else {
            warn!(
                "missing template definition at offset {}",
                instance.def_offset
            );
            self.warnings.push(format!(
                "missing template definition at offset {}",
                instance.def_offset
            ));
            out.push_str(&format!(
                "<!-- missing template definition at offset {} -->",
                instance.def_offset
            ));
            return Ok(());
        };

        let guid_key = descriptor.guid.as_bytes();
        let compiled = match self.compiled.get(&guid_key) {
            Some(entry) => entry,
            None => {
                let compiled = compile_template(self.ctx, &descriptor).map(std::sync::Arc::new);
                self.compiled.insert(guid_key, compiled.clone());
                compiled
            }
        };

        if let Some(compiled) = compiled {
            debug_assert_eq!(compiled.parts.len(), compiled.subs.len() + 1);
            for (part, &(slot_id, optional)) in compiled.parts.iter().zip(compiled.subs.iter()) {
                out.push_str(part);
                self.render_slot(slot_id, optional, &instance.values, depth, out)?;
            }
            out.push_str(compiled.parts.last().expect("parts is never empty"));
            return Ok(());
        }

        // Interpreted fallback for templates that did not specialize.
        let body_start = descriptor.data_offset as usize;
        let body_end = body_start + descriptor.data_size as usize;
        let mut body_cursor = ByteCursor::with_pos(self.ctx.data, body_start)?;
        self.render_document(
            &mut body_cursor,
            body_end,
            &instance.values,
            depth + 1,
            out,
        )
    }
}
