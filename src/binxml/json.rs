//! The JSON renderer.
//!
//! JSON output is a second interpretation of the same token stream. An
//! element's JSON shape depends on a pre-scan classification of its immediate
//! children (child elements / text / attributes); the pre-scan walks a copied
//! cursor and never consumes the main one. Conventions:
//!
//! - Element names become object keys; duplicates get `_1`, `_2`, ...
//!   suffixes.
//! - Attributes live under `#attributes`; mixed text under `#text`.
//! - `EventData`/`UserData` containers flatten `<Data Name="X">v</Data>`
//!   children to `"X": v`.
//! - An element whose whole content is a single typed substitution becomes
//!   the matching JSON primitive; other text content concatenates to a
//!   string.

use log::{trace, warn};
use serde_json::{Map, Value as JsonValue};

use crate::binxml::name::read_name_ref;
use crate::binxml::tokens::BinXmlRawToken;
use crate::binxml::value::{BinXmlValue, SlotRef};
use crate::binxml::{ChunkCtx, MAX_NESTING_DEPTH, read_template_instance};
use crate::err::{DeserializationError, DeserializationResult};
use crate::utils::ByteCursor;
use crate::utils::bytes;
use crate::utils::utf16::read_len_prefixed_utf16_string;

pub(crate) struct JsonRenderer<'a, 'c> {
    ctx: &'a mut ChunkCtx<'c>,
    /// Emit attributes as `<name>_attributes` siblings instead of nested
    /// `#attributes` objects.
    separate_attributes: bool,
    warnings: Vec<String>,
}

/// Immediate-children classification produced by the pre-scan.
#[derive(Debug, Default, Clone, Copy)]
struct ContentClass {
    has_elements: bool,
    has_text: bool,
}

/// Accumulates a text-only content run, remembering whether the whole run
/// was a single typed substitution (which then keeps its native JSON type).
#[derive(Default)]
struct TextContent {
    text: String,
    substitutions: usize,
    single: Option<JsonValue>,
    has_literal_text: bool,
}

impl TextContent {
    fn push_literal(&mut self, piece: &str) {
        if !piece.is_empty() {
            self.has_literal_text = true;
        }
        self.text.push_str(piece);
    }

    fn push_substitution(&mut self, textual: &str, json: JsonValue) {
        self.substitutions += 1;
        self.single = Some(json);
        self.text.push_str(textual);
    }

    fn is_empty(&self) -> bool {
        self.substitutions == 0 && !self.has_literal_text
    }

    fn into_value(self) -> JsonValue {
        if self.substitutions == 1 && !self.has_literal_text {
            self.single.expect("tracked with the substitution")
        } else {
            JsonValue::String(self.text)
        }
    }
}

impl<'a, 'c> JsonRenderer<'a, 'c> {
    pub(crate) fn new(ctx: &'a mut ChunkCtx<'c>, separate_attributes: bool) -> Self {
        JsonRenderer {
            ctx,
            separate_attributes,
            warnings: Vec::new(),
        }
    }

    pub(crate) fn drain_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }

    /// Render one record payload to a UTF-8 JSON document.
    pub(crate) fn render_record(
        &mut self,
        payload_offset: usize,
        payload_len: usize,
    ) -> DeserializationResult<Vec<u8>> {
        let end = payload_offset
            .saturating_add(payload_len)
            .min(self.ctx.data.len());
        let mut cursor = ByteCursor::with_pos(self.ctx.data, payload_offset)?;

        let mut root = Map::new();
        self.document_into(&mut root, &mut cursor, end, &[], 0)?;

        serde_json::to_vec(&JsonValue::Object(root)).map_err(|e| {
            trace!("json serialization failed: {e}");
            DeserializationError::other("failed to serialize json document", payload_offset as u64)
        })
    }

    /// Walk a document and merge its root elements into `map`.
    fn document_into(
        &mut self,
        map: &mut Map<String, JsonValue>,
        cursor: &mut ByteCursor<'c>,
        end: usize,
        values: &[SlotRef],
        depth: usize,
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
                    cursor.advance(3, "fragment header")?;
                }
                BinXmlRawToken::ProcessingInstructionTarget => {
                    // Processing instructions have no JSON shape.
                    let _name = read_name_ref(cursor, &mut self.ctx.string_cache)?;
                    if self.peek_token(cursor) == Some(BinXmlRawToken::ProcessingInstructionData) {
                        cursor.advance(1, "pi data token")?;
                        let _ = read_len_prefixed_utf16_string(cursor, false, "pi data")?;
                    }
                }
                BinXmlRawToken::TemplateInstance => {
                    self.template_into(map, cursor, depth)?;
                }
                BinXmlRawToken::OpenStartElement { has_attributes } => {
                    let entries =
                        self.element_entry(cursor, end, values, has_attributes, depth, false)?;
                    for (name, value) in entries {
                        insert_dedup(map, name, value);
                    }
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

    /// Resolve a template instance and merge its body into `map`.
    ///
    /// The JSON path always interprets the body: compiled templates are flat
    /// text and cannot carry the structural output JSON needs.
    fn template_into(
        &mut self,
        map: &mut Map<String, JsonValue>,
        cursor: &mut ByteCursor<'c>,
        depth: usize,
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
            return Ok(());
        };

        let body_start = descriptor.data_offset as usize;
        let body_end = body_start + descriptor.data_size as usize;
        let mut body_cursor = ByteCursor::with_pos(self.ctx.data, body_start)?;
        self.document_into(map, &mut body_cursor, body_end, &instance.values, depth + 1)
    }

    /// Parse one element and produce its JSON entries: the element itself
    /// and, in separate-attributes mode, a `<name>_attributes` sibling.
    ///
    /// `in_data_container` is set when the parent is `EventData`/`UserData`,
    /// which flattens `<Data Name="X">v</Data>` children into `"X": v`.
    fn element_entry(
        &mut self,
        cursor: &mut ByteCursor<'c>,
        end: usize,
        values: &[SlotRef],
        has_attributes: bool,
        depth: usize,
        in_data_container: bool,
    ) -> DeserializationResult<Vec<(String, JsonValue)>> {
        if depth >= MAX_NESTING_DEPTH {
            return Err(DeserializationError::other(
                "element nesting exceeds depth bound",
                cursor.position(),
            ));
        }

        let _dependency_id = cursor.u16_named("element dependency id")?;
        let _data_size = cursor.u32_named("element data size")?;
        let name = read_name_ref(cursor, &mut self.ctx.string_cache)?;

        let mut attrs: Vec<(String, String)> = Vec::new();
        if has_attributes {
            let attr_list_size = cursor.u32_named("attribute list size")?;
            let attr_end = (cursor.pos() + attr_list_size as usize).min(end);
            self.parse_attributes(cursor, attr_end, values, &mut attrs)?;
        }

        let flatten_key = if in_data_container && &*name == "Data" {
            attrs
                .iter()
                .find(|(attr_name, _)| attr_name == "Name")
                .map(|(_, value)| value.clone())
        } else {
            None
        };

        let non_empty_attrs: Vec<&(String, String)> =
            attrs.iter().filter(|(_, value)| !value.is_empty()).collect();

        // In separate mode attributes move to a sibling entry and never
        // force the element itself into object shape.
        let separate_sibling = if self.separate_attributes && !non_empty_attrs.is_empty() {
            Some((
                format!("{name}_attributes"),
                attrs_object(&non_empty_attrs),
            ))
        } else {
            None
        };
        let attrs_in_object = !self.separate_attributes && !non_empty_attrs.is_empty();

        let with_sibling = |entry: (String, JsonValue)| -> Vec<(String, JsonValue)> {
            match separate_sibling {
                Some(sibling) => vec![sibling, entry],
                None => vec![entry],
            }
        };

        let close = self.read_token(cursor);
        match close {
            Ok(BinXmlRawToken::CloseStartElement) => {}
            // Empty element (or a malformed close treated as one).
            _ => {
                if let Some(key) = flatten_key {
                    return Ok(vec![(key, JsonValue::Null)]);
                }
                if !attrs_in_object {
                    return Ok(with_sibling((name.to_string(), JsonValue::Null)));
                }
                let mut object = Map::new();
                object.insert("#attributes".to_string(), attrs_object(&non_empty_attrs));
                return Ok(vec![(name.to_string(), JsonValue::Object(object))]);
            }
        }

        // `Data Name="X"` flattening keeps only the text content.
        if let Some(key) = flatten_key {
            let content = self.text_content(cursor, end, values, depth)?;
            let value = if content.is_empty() {
                JsonValue::Null
            } else {
                content.into_value()
            };
            return Ok(vec![(key, value)]);
        }

        let class = self.classify(*cursor, end, values, depth)?;

        if !class.has_elements && !attrs_in_object {
            let content = self.text_content(cursor, end, values, depth)?;
            let value = if content.is_empty() {
                JsonValue::Null
            } else {
                content.into_value()
            };
            return Ok(with_sibling((name.to_string(), value)));
        }

        // Object shape: attributes, then children, then mixed text.
        let mut object = Map::new();
        if attrs_in_object {
            object.insert("#attributes".to_string(), attrs_object(&non_empty_attrs));
        }

        let is_data_container = &*name == "EventData" || &*name == "UserData";
        let mut text = TextContent::default();
        self.object_content(
            &mut object,
            cursor,
            end,
            values,
            depth,
            is_data_container,
            &mut text,
        )?;

        if !text.is_empty() {
            object.insert("#text".to_string(), text.into_value());
        }

        Ok(with_sibling((name.to_string(), JsonValue::Object(object))))
    }

    /// Consume an element's content in object shape, inserting child
    /// elements (and spliced nested documents) into `object` and gathering
    /// loose text.
    fn object_content(
        &mut self,
        object: &mut Map<String, JsonValue>,
        cursor: &mut ByteCursor<'c>,
        end: usize,
        values: &[SlotRef],
        depth: usize,
        is_data_container: bool,
        text: &mut TextContent,
    ) -> DeserializationResult<()> {
        while cursor.pos() < end {
            let Some(token) = self.peek_token(cursor) else {
                let offset = cursor.position();
                let value = bytes::read_u8(self.ctx.data, cursor.pos()).unwrap_or(0);
                return Err(DeserializationError::InvalidToken { value, offset });
            };

            match token {
                BinXmlRawToken::EndOfStream | BinXmlRawToken::CloseElement => {
                    cursor.advance(1, "token")?;
                    return Ok(());
                }
                BinXmlRawToken::CloseStartElement | BinXmlRawToken::CloseEmptyElement => {
                    cursor.advance(1, "token")?;
                    return Ok(());
                }
                BinXmlRawToken::OpenStartElement { has_attributes } => {
                    cursor.advance(1, "token")?;
                    let entries = self.element_entry(
                        cursor,
                        end,
                        values,
                        has_attributes,
                        depth + 1,
                        is_data_container,
                    )?;
                    for (name, value) in entries {
                        insert_dedup(object, name, value);
                    }
                }
                BinXmlRawToken::TemplateInstance => {
                    cursor.advance(1, "token")?;
                    self.template_into(object, cursor, depth)?;
                }
                BinXmlRawToken::StartOfStream => {
                    cursor.advance(4, "fragment header")?;
                }
                BinXmlRawToken::NormalSubstitution | BinXmlRawToken::ConditionalSubstitution => {
                    cursor.advance(1, "token")?;
                    let slot_id = cursor.u16_named("substitution slot")?;
                    let _value_type = cursor.u8_named("substitution type")?;
                    self.substitution_into(object, text, slot_id, values, depth)?;
                }
                _ => {
                    self.text_token(cursor, text, values, depth)?;
                }
            }
        }
        Ok(())
    }

    /// Consume a text-classified content run through its end-element token.
    fn text_content(
        &mut self,
        cursor: &mut ByteCursor<'c>,
        end: usize,
        values: &[SlotRef],
        depth: usize,
    ) -> DeserializationResult<TextContent> {
        let mut text = TextContent::default();

        while cursor.pos() < end {
            let Some(token) = self.peek_token(cursor) else {
                let offset = cursor.position();
                let value = bytes::read_u8(self.ctx.data, cursor.pos()).unwrap_or(0);
                return Err(DeserializationError::InvalidToken { value, offset });
            };

            match token {
                BinXmlRawToken::EndOfStream
                | BinXmlRawToken::CloseElement
                | BinXmlRawToken::CloseStartElement
                | BinXmlRawToken::CloseEmptyElement => {
                    cursor.advance(1, "token")?;
                    return Ok(text);
                }
                BinXmlRawToken::StartOfStream => {
                    cursor.advance(4, "fragment header")?;
                }
                // Stray structure in a text-classified run: skip it so the
                // cursor stays aligned; the classifier keeps this path rare.
                BinXmlRawToken::OpenStartElement { has_attributes } => {
                    cursor.advance(1, "token")?;
                    self.skip_element(cursor, end, has_attributes, depth + 1)?;
                }
                BinXmlRawToken::TemplateInstance => {
                    cursor.advance(1, "token")?;
                    let _ = read_template_instance(self.ctx, cursor, true)?;
                }
                BinXmlRawToken::NormalSubstitution | BinXmlRawToken::ConditionalSubstitution => {
                    cursor.advance(1, "token")?;
                    let slot_id = cursor.u16_named("substitution slot")?;
                    let _value_type = cursor.u8_named("substitution type")?;
                    self.substitution_text(&mut text, slot_id, values, depth)?;
                }
                _ => {
                    self.text_token(cursor, &mut text, values, depth)?;
                }
            }
        }

        Ok(text)
    }

    /// Handle one literal text-bearing token (`Value`, char/entity refs,
    /// CDATA). The cursor is positioned at the token byte.
    fn text_token(
        &mut self,
        cursor: &mut ByteCursor<'c>,
        text: &mut TextContent,
        _values: &[SlotRef],
        _depth: usize,
    ) -> DeserializationResult<()> {
        match self.read_token(cursor)? {
            BinXmlRawToken::Value => {
                let offset = cursor.position();
                let value_type = cursor.u8_named("value type")?;
                if value_type != 0x01 {
                    return Err(DeserializationError::InvalidValueType {
                        value: value_type,
                        offset,
                    });
                }
                let piece = read_len_prefixed_utf16_string(cursor, false, "value text")?;
                text.push_literal(&piece);
            }
            BinXmlRawToken::CharReference => {
                let codepoint = cursor.u16_named("char ref")?;
                let ch = char::from_u32(u32::from(codepoint)).unwrap_or(char::REPLACEMENT_CHARACTER);
                text.push_literal(&ch.to_string());
            }
            BinXmlRawToken::EntityReference => {
                let name = read_name_ref(cursor, &mut self.ctx.string_cache)?;
                match resolve_entity(&name) {
                    Some(ch) => text.push_literal(&ch.to_string()),
                    None => text.push_literal(&format!("&{name};")),
                }
            }
            BinXmlRawToken::CDataSection => {
                let piece = read_len_prefixed_utf16_string(cursor, false, "cdata")?;
                text.push_literal(&piece);
            }
            other => {
                trace!("unexpected text token {other:?}");
                return Err(DeserializationError::other(
                    "unexpected token in content",
                    cursor.position(),
                ));
            }
        }
        Ok(())
    }

    /// A substitution in text context: empty slots vanish, embedded BinXml
    /// becomes a document object, anything else contributes text plus its
    /// JSON primitive.
    fn substitution_text(
        &mut self,
        text: &mut TextContent,
        slot_id: u16,
        values: &[SlotRef],
        depth: usize,
    ) -> DeserializationResult<()> {
        let Some(&slot) = values.get(usize::from(slot_id)) else {
            return Ok(());
        };
        if slot.is_empty_optional() {
            // Null or zero-sized slots render to nothing in either mode.
            return Ok(());
        }

        let value = BinXmlValue::from_slot(self.ctx.data, slot, self.ctx.ansi_codec)?;
        if let BinXmlValue::BinXml { offset, len } = value {
            let nested = self.nested_document_value(offset, len, depth)?;
            text.push_substitution("", nested);
            return Ok(());
        }

        let mut textual = String::new();
        value.render_text_unescaped(&mut textual);
        text.push_substitution(&textual, value.to_json_value());
        Ok(())
    }

    /// A substitution in object context: embedded BinXml splices its inner
    /// structure into the surrounding object, anything else is loose text.
    fn substitution_into(
        &mut self,
        object: &mut Map<String, JsonValue>,
        text: &mut TextContent,
        slot_id: u16,
        values: &[SlotRef],
        depth: usize,
    ) -> DeserializationResult<()> {
        let Some(&slot) = values.get(usize::from(slot_id)) else {
            return Ok(());
        };
        if slot.is_empty_optional() {
            return Ok(());
        }

        let value = BinXmlValue::from_slot(self.ctx.data, slot, self.ctx.ansi_codec)?;
        if let BinXmlValue::BinXml { offset, len } = value {
            let nested = self.nested_document_value(offset, len, depth)?;
            if let JsonValue::Object(entries) = nested {
                for (key, entry) in entries {
                    insert_dedup(object, key, entry);
                }
            }
            return Ok(());
        }

        let mut textual = String::new();
        value.render_text_unescaped(&mut textual);
        text.push_substitution(&textual, value.to_json_value());
        Ok(())
    }

    /// Render an embedded BinXml document (a `0x21` value) at its own
    /// chunk-relative base.
    fn nested_document_value(
        &mut self,
        offset: usize,
        len: usize,
        depth: usize,
    ) -> DeserializationResult<JsonValue> {
        let mut nested = ByteCursor::with_pos(self.ctx.data, offset)?;
        let nested_end = offset.saturating_add(len).min(self.ctx.data.len());
        let mut map = Map::new();
        self.document_into(&mut map, &mut nested, nested_end, &[], depth + 1)?;
        Ok(JsonValue::Object(map))
    }

    fn parse_attributes(
        &mut self,
        cursor: &mut ByteCursor<'c>,
        attr_end: usize,
        values: &[SlotRef],
        attrs: &mut Vec<(String, String)>,
    ) -> DeserializationResult<()> {
        while cursor.pos() < attr_end {
            match self.read_token(cursor)? {
                BinXmlRawToken::Attribute => {
                    let name = read_name_ref(cursor, &mut self.ctx.string_cache)?;
                    let value = self.attribute_value(cursor, attr_end, values)?;
                    attrs.push((name.to_string(), value));
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

    /// Collect an attribute's value as unescaped text. Breaks (without
    /// consuming) on the next attribute or element-close token.
    fn attribute_value(
        &mut self,
        cursor: &mut ByteCursor<'c>,
        attr_end: usize,
        values: &[SlotRef],
    ) -> DeserializationResult<String> {
        let mut out = String::new();

        while cursor.pos() < attr_end {
            let Some(token) = self.peek_token(cursor) else {
                break;
            };

            match token {
                BinXmlRawToken::Attribute
                | BinXmlRawToken::CloseStartElement
                | BinXmlRawToken::CloseEmptyElement
                | BinXmlRawToken::CloseElement
                | BinXmlRawToken::EndOfStream => break,
                BinXmlRawToken::Value => {
                    cursor.advance(1, "token")?;
                    let offset = cursor.position();
                    let value_type = cursor.u8_named("value type")?;
                    if value_type != 0x01 {
                        return Err(DeserializationError::InvalidValueType {
                            value: value_type,
                            offset,
                        });
                    }
                    let piece = read_len_prefixed_utf16_string(cursor, false, "value text")?;
                    out.push_str(&piece);
                }
                BinXmlRawToken::NormalSubstitution | BinXmlRawToken::ConditionalSubstitution => {
                    cursor.advance(1, "token")?;
                    let slot_id = cursor.u16_named("substitution slot")?;
                    let _value_type = cursor.u8_named("substitution type")?;
                    if let Some(&slot) = values.get(usize::from(slot_id)) {
                        if !slot.is_empty_optional() {
                            let value =
                                BinXmlValue::from_slot(self.ctx.data, slot, self.ctx.ansi_codec)?;
                            if !matches!(value, BinXmlValue::BinXml { .. }) {
                                value.render_text_unescaped(&mut out);
                            }
                        }
                    }
                }
                BinXmlRawToken::CharReference => {
                    cursor.advance(1, "token")?;
                    let codepoint = cursor.u16_named("char ref")?;
                    let ch =
                        char::from_u32(u32::from(codepoint)).unwrap_or(char::REPLACEMENT_CHARACTER);
                    out.push(ch);
                }
                BinXmlRawToken::EntityReference => {
                    cursor.advance(1, "token")?;
                    let name = read_name_ref(cursor, &mut self.ctx.string_cache)?;
                    match resolve_entity(&name) {
                        Some(ch) => out.push(ch),
                        None => out.push_str(&format!("&{name};")),
                    }
                }
                BinXmlRawToken::CDataSection => {
                    cursor.advance(1, "token")?;
                    let piece = read_len_prefixed_utf16_string(cursor, false, "cdata")?;
                    out.push_str(&piece);
                }
                other => {
                    trace!("unexpected token {other:?} in attribute value");
                    return Err(DeserializationError::other(
                        "unexpected token in attribute value",
                        cursor.position(),
                    ));
                }
            }
        }

        Ok(out)
    }

    /// Pre-scan an element's content on a copied cursor, classifying its
    /// immediate children. Never consumes the main cursor, never registers
    /// template descriptors.
    fn classify(
        &mut self,
        mut cursor: ByteCursor<'c>,
        end: usize,
        values: &[SlotRef],
        depth: usize,
    ) -> DeserializationResult<ContentClass> {
        let mut class = ContentClass::default();

        while cursor.pos() < end {
            if class.has_elements && class.has_text {
                break;
            }
            let Some(token) = self.peek_token(&cursor) else {
                break;
            };

            match token {
                BinXmlRawToken::EndOfStream
                | BinXmlRawToken::CloseElement
                | BinXmlRawToken::CloseStartElement
                | BinXmlRawToken::CloseEmptyElement => break,
                BinXmlRawToken::StartOfStream => {
                    cursor.advance(4, "fragment header")?;
                }
                BinXmlRawToken::OpenStartElement { has_attributes } => {
                    cursor.advance(1, "token")?;
                    class.has_elements = true;
                    self.skip_element(&mut cursor, end, has_attributes, depth + 1)?;
                }
                BinXmlRawToken::TemplateInstance => {
                    cursor.advance(1, "token")?;
                    class.has_elements = true;
                    let _ = read_template_instance(self.ctx, &mut cursor, false)?;
                }
                BinXmlRawToken::Value => {
                    cursor.advance(1, "token")?;
                    let _value_type = cursor.u8_named("value type")?;
                    let num_chars = cursor.u16_named("value text")? as usize;
                    cursor.advance(num_chars * 2, "value text")?;
                    if num_chars > 0 {
                        class.has_text = true;
                    }
                }
                BinXmlRawToken::NormalSubstitution | BinXmlRawToken::ConditionalSubstitution => {
                    cursor.advance(1, "token")?;
                    let slot_id = cursor.u16_named("substitution slot")?;
                    let _value_type = cursor.u8_named("substitution type")?;
                    if let Some(slot) = values.get(usize::from(slot_id)) {
                        if !slot.is_empty_optional() {
                            if slot.value_type & 0x7F == 0x21 {
                                class.has_elements = true;
                            } else {
                                class.has_text = true;
                            }
                        }
                    }
                }
                BinXmlRawToken::CharReference => {
                    cursor.advance(3, "char ref")?;
                    class.has_text = true;
                }
                BinXmlRawToken::EntityReference => {
                    cursor.advance(1, "token")?;
                    let _ = read_name_ref(&mut cursor, &mut self.ctx.string_cache)?;
                    class.has_text = true;
                }
                BinXmlRawToken::CDataSection => {
                    cursor.advance(1, "token")?;
                    let num_chars = cursor.u16_named("cdata")? as usize;
                    cursor.advance(num_chars * 2, "cdata")?;
                    if num_chars > 0 {
                        class.has_text = true;
                    }
                }
                other => {
                    trace!("unexpected token {other:?} during pre-scan");
                    break;
                }
            }
        }

        Ok(class)
    }

    /// Structurally skip an element (open token already consumed).
    fn skip_element(
        &mut self,
        cursor: &mut ByteCursor<'c>,
        end: usize,
        has_attributes: bool,
        depth: usize,
    ) -> DeserializationResult<()> {
        if depth >= MAX_NESTING_DEPTH {
            return Err(DeserializationError::other(
                "element nesting exceeds depth bound",
                cursor.position(),
            ));
        }

        let _dependency_id = cursor.u16_named("element dependency id")?;
        let _data_size = cursor.u32_named("element data size")?;
        let _name = read_name_ref(cursor, &mut self.ctx.string_cache)?;

        if has_attributes {
            let attr_list_size = cursor.u32_named("attribute list size")?;
            cursor.advance(
                (attr_list_size as usize).min(end.saturating_sub(cursor.pos())),
                "attribute list",
            )?;
        }

        match self.read_token(cursor) {
            Ok(BinXmlRawToken::CloseStartElement) => {}
            _ => return Ok(()),
        }

        // Skip content until the matching end-element.
        while cursor.pos() < end {
            let Some(token) = self.peek_token(cursor) else {
                return Ok(());
            };
            match token {
                BinXmlRawToken::EndOfStream | BinXmlRawToken::CloseElement => {
                    cursor.advance(1, "token")?;
                    return Ok(());
                }
                BinXmlRawToken::CloseStartElement | BinXmlRawToken::CloseEmptyElement => {
                    cursor.advance(1, "token")?;
                    return Ok(());
                }
                BinXmlRawToken::StartOfStream => {
                    cursor.advance(4, "fragment header")?;
                }
                BinXmlRawToken::OpenStartElement { has_attributes } => {
                    cursor.advance(1, "token")?;
                    self.skip_element(cursor, end, has_attributes, depth + 1)?;
                }
                BinXmlRawToken::TemplateInstance => {
                    cursor.advance(1, "token")?;
                    let _ = read_template_instance(self.ctx, cursor, false)?;
                }
                BinXmlRawToken::Value => {
                    cursor.advance(1, "token")?;
                    let _value_type = cursor.u8_named("value type")?;
                    let num_chars = cursor.u16_named("value text")? as usize;
                    cursor.advance(num_chars * 2, "value text")?;
                }
                BinXmlRawToken::NormalSubstitution | BinXmlRawToken::ConditionalSubstitution => {
                    cursor.advance(4, "substitution")?;
                }
                BinXmlRawToken::CharReference => {
                    cursor.advance(3, "char ref")?;
                }
                BinXmlRawToken::EntityReference => {
                    cursor.advance(1, "token")?;
                    let _ = read_name_ref(cursor, &mut self.ctx.string_cache)?;
                }
                BinXmlRawToken::CDataSection => {
                    cursor.advance(1, "token")?;
                    let num_chars = cursor.u16_named("cdata")? as usize;
                    cursor.advance(num_chars * 2, "cdata")?;
                }
                BinXmlRawToken::Attribute | BinXmlRawToken::ProcessingInstructionTarget => {
                    cursor.advance(1, "token")?;
                    let _ = read_name_ref(cursor, &mut self.ctx.string_cache)?;
                }
                BinXmlRawToken::ProcessingInstructionData => {
                    cursor.advance(1, "token")?;
                    let num_chars = cursor.u16_named("pi data")? as usize;
                    cursor.advance(num_chars * 2, "pi data")?;
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
}

fn attrs_object(attrs: &[&(String, String)]) -> JsonValue {
    let mut map = Map::new();
    for (name, value) in attrs.iter() {
        map.insert(name.clone(), JsonValue::String(value.clone()));
    }
    JsonValue::Object(map)
}

/// Insert `value` under `key`, disambiguating duplicates as `key_1`,
/// `key_2`, ... (the first occurrence keeps the bare name).
fn insert_dedup(map: &mut Map<String, JsonValue>, key: String, value: JsonValue) {
    if !map.contains_key(&key) {
        map.insert(key, value);
        return;
    }
    let mut index = 1usize;
    loop {
        let candidate = format!("{key}_{index}");
        if !map.contains_key(&candidate) {
            map.insert(candidate, value);
            return;
        }
        index += 1;
    }
}

/// The five standard XML entities resolve to their literal characters in
/// JSON; anything else passes through as `&name;`.
fn resolve_entity(name: &str) -> Option<char> {
    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::string_cache::StringCache;
    use crate::template_cache::TemplateCache;
    use encoding::all::WINDOWS_1252;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_insert_dedup_appends_suffixes() {
        let mut map = Map::new();
        insert_dedup(&mut map, "Data".to_string(), json!(1));
        insert_dedup(&mut map, "Data".to_string(), json!(2));
        insert_dedup(&mut map, "Data".to_string(), json!(3));

        let keys: Vec<&str> = map.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["Data", "Data_1", "Data_2"]);
    }

    #[test]
    fn test_standard_entities_resolve_to_literals() {
        assert_eq!(resolve_entity("amp"), Some('&'));
        assert_eq!(resolve_entity("lt"), Some('<'));
        assert_eq!(resolve_entity("gt"), Some('>'));
        assert_eq!(resolve_entity("quot"), Some('"'));
        assert_eq!(resolve_entity("apos"), Some('\''));
        assert_eq!(resolve_entity("nbsp"), None);
    }

    #[test]
    fn test_text_only_element_renders_as_string() {
        // Name structure "Msg" at offset 0, then `<Msg>hi</Msg>`.
        let mut data = Vec::new();
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&3u16.to_le_bytes());
        data.extend("Msg".encode_utf16().flat_map(u16::to_le_bytes));
        data.extend_from_slice(&[0, 0]);
        let doc_start = data.len();
        data.extend_from_slice(&[0x0F, 0x01, 0x01, 0x00]);
        data.push(0x01);
        data.extend_from_slice(&0xFFFFu16.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.push(0x02);
        data.extend_from_slice(&[0x05, 0x01]);
        data.extend_from_slice(&2u16.to_le_bytes());
        data.extend("hi".encode_utf16().flat_map(u16::to_le_bytes));
        data.push(0x04);
        data.push(0x00);

        let mut ctx = ChunkCtx {
            data: &data,
            string_cache: StringCache::default(),
            template_cache: TemplateCache::new(),
            ansi_codec: WINDOWS_1252,
        };
        let mut renderer = JsonRenderer::new(&mut ctx, false);
        let bytes = renderer
            .render_record(doc_start, data.len() - doc_start)
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value, json!({ "Msg": "hi" }));
    }
}
