/// The one-byte BinXml token alphabet.
///
/// Bit `0x40` is the "more data follows" flag on value-like tokens and the
/// "has attribute list" flag on `OpenStartElement`; it is masked off before
/// dispatch and carried separately where it matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinXmlRawToken {
    EndOfStream,
    OpenStartElement { has_attributes: bool },
    CloseStartElement,
    CloseEmptyElement,
    CloseElement,
    Value,
    Attribute,
    CDataSection,
    CharReference,
    EntityReference,
    ProcessingInstructionTarget,
    ProcessingInstructionData,
    TemplateInstance,
    NormalSubstitution,
    ConditionalSubstitution,
    StartOfStream,
}

impl BinXmlRawToken {
    pub(crate) fn from_u8(byte: u8) -> Option<BinXmlRawToken> {
        match byte {
            0x00 => Some(BinXmlRawToken::EndOfStream),
            0x01 | 0x41 => Some(BinXmlRawToken::OpenStartElement {
                has_attributes: byte & 0x40 != 0,
            }),
            0x02 => Some(BinXmlRawToken::CloseStartElement),
            0x03 => Some(BinXmlRawToken::CloseEmptyElement),
            0x04 => Some(BinXmlRawToken::CloseElement),
            0x05 | 0x45 => Some(BinXmlRawToken::Value),
            0x06 | 0x46 => Some(BinXmlRawToken::Attribute),
            0x07 | 0x47 => Some(BinXmlRawToken::CDataSection),
            0x08 | 0x48 => Some(BinXmlRawToken::CharReference),
            0x09 | 0x49 => Some(BinXmlRawToken::EntityReference),
            0x0a => Some(BinXmlRawToken::ProcessingInstructionTarget),
            0x0b => Some(BinXmlRawToken::ProcessingInstructionData),
            0x0c => Some(BinXmlRawToken::TemplateInstance),
            0x0d => Some(BinXmlRawToken::NormalSubstitution),
            0x0e => Some(BinXmlRawToken::ConditionalSubstitution),
            0x0f => Some(BinXmlRawToken::StartOfStream),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_masks_the_more_data_flag() {
        assert_eq!(
            BinXmlRawToken::from_u8(0x45),
            Some(BinXmlRawToken::Value)
        );
        assert_eq!(
            BinXmlRawToken::from_u8(0x41),
            Some(BinXmlRawToken::OpenStartElement {
                has_attributes: true
            })
        );
        assert_eq!(
            BinXmlRawToken::from_u8(0x01),
            Some(BinXmlRawToken::OpenStartElement {
                has_attributes: false
            })
        );
        assert_eq!(BinXmlRawToken::from_u8(0x16), None);
    }
}
