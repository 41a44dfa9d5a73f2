
use fixtures::*;

use fastevtx::{EvtxFilter, EvtxParser, OutputFormat, ParserSettings, RecordData};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

fn xml_settings(threads: usize) -> ParserSettings {
    ParserSettings::new().num_threads(threads)
}

fn json_settings() -> ParserSettings {
    ParserSettings::new()
        .num_threads(1)
        .output_format(OutputFormat::Json)
}

fn xml_of(data: &RecordData) -> &str {
    match data {
        RecordData::Xml(xml) => xml,
        RecordData::Json(_) => panic!("expected XML output"),
    }
}

#[test]
fn test_parses_single_chunk_to_xml() {
    ensure_env_logger_initialized();
    let chunk = ChunkBuilder::new()
        .add_record(1, standard_values())
        .add_record(2, standard_values())
        .add_record(3, standard_values())
        .build();
    let file = build_file(&[chunk], 0);

    let parser = EvtxParser::from_buffer(&file)
        .unwrap()
        .with_configuration(xml_settings(1));
    let parsed = parser.parse();

    assert_eq!(parsed.chunks.len(), 1);
    assert_eq!(parsed.warnings().count(), 0);

    let renderings: Vec<&str> = parsed.records().map(|r| xml_of(&r.data)).collect();
    assert_eq!(renderings.len(), 3);
    assert!(renderings[0].starts_with("<Event xmlns=\""));
    assert_eq!(renderings[0], standard_xml());
    // Records sharing a template are identical modulo substitution values.
    assert_eq!(renderings[0], renderings[1]);

    let ids: Vec<u64> = parsed.records().map(|r| r.event_record_id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(parsed.records().filter(|r| !r.data.is_empty()).count(), 3);
}

#[test]
fn test_chunk_offsets_walker() {
    ensure_env_logger_initialized();
    let chunk = ChunkBuilder::new().add_record(1, standard_values()).build();
    let file = build_file(&[chunk], 0);

    let parser = EvtxParser::from_buffer(&file).unwrap();
    assert_eq!(parser.chunk_offsets(), vec![4096]);
    assert_eq!(parser.header().chunk_count, 1);
}

#[test]
fn test_thread_counts_produce_identical_output() {
    ensure_env_logger_initialized();
    let mut chunks = Vec::new();
    let mut next_id = 1u64;
    for _ in 0..3 {
        chunks.push(
            ChunkBuilder::new()
                .add_record(next_id, standard_values())
                .add_record(next_id + 1, standard_values())
                .build(),
        );
        next_id += 2;
    }
    let file = build_file(&chunks, 0);

    let single: Vec<String> = EvtxParser::from_buffer(&file)
        .unwrap()
        .with_configuration(xml_settings(1))
        .parse()
        .records()
        .map(|r| xml_of(&r.data).to_string())
        .collect();

    let multi: Vec<String> = EvtxParser::from_buffer(&file)
        .unwrap()
        .with_configuration(xml_settings(4))
        .parse()
        .records()
        .map(|r| xml_of(&r.data).to_string())
        .collect();

    assert_eq!(single.len(), 6);
    assert_eq!(single, multi);

    // Rendering is a pure function of the input bytes.
    let again: Vec<String> = EvtxParser::from_buffer(&file)
        .unwrap()
        .with_configuration(xml_settings(4))
        .parse()
        .records()
        .map(|r| xml_of(&r.data).to_string())
        .collect();
    assert_eq!(single, again);
}

#[test]
fn test_json_output_shape() {
    ensure_env_logger_initialized();
    let chunk = ChunkBuilder::new().add_record(1, standard_values()).build();
    let file = build_file(&[chunk], 0);

    let parsed = EvtxParser::from_buffer(&file)
        .unwrap()
        .with_configuration(json_settings())
        .parse();

    let record = parsed.records().next().expect("one record");
    let value: Value = match &record.data {
        RecordData::Json(bytes) => serde_json::from_slice(bytes).expect("valid json"),
        RecordData::Xml(_) => panic!("expected JSON output"),
    };

    assert_eq!(
        value,
        json!({
            "Event": {
                "#attributes": { "xmlns": EVENT_XMLNS },
                "System": {
                    "Provider": { "#attributes": { "Name": "TestProvider" } },
                    "EventID": 4624,
                    "TimeCreated": {
                        "#attributes": { "SystemTime": "2016-07-08T18:12:51.6816400Z" }
                    }
                },
                "EventData": { "A": "1", "B": 2 }
            }
        })
    );
}

#[test]
fn test_json_separate_attributes_mode() {
    ensure_env_logger_initialized();
    let chunk = ChunkBuilder::new().add_record(1, standard_values()).build();
    let file = build_file(&[chunk], 0);

    let parsed = EvtxParser::from_buffer(&file)
        .unwrap()
        .with_configuration(json_settings().separate_json_attributes(true))
        .parse();

    let record = parsed.records().next().expect("one record");
    let value: Value = match &record.data {
        RecordData::Json(bytes) => serde_json::from_slice(bytes).expect("valid json"),
        RecordData::Xml(_) => panic!("expected JSON output"),
    };

    assert_eq!(
        value,
        json!({
            "Event_attributes": { "xmlns": EVENT_XMLNS },
            "Event": {
                "System": {
                    "Provider_attributes": { "Name": "TestProvider" },
                    "Provider": null,
                    "EventID": 4624,
                    "TimeCreated_attributes": {
                        "SystemTime": "2016-07-08T18:12:51.6816400Z"
                    },
                    "TimeCreated": null
                },
                "EventData": { "A": "1", "B": 2 }
            }
        })
    );
}

#[test]
fn test_record_id_filter() {
    ensure_env_logger_initialized();
    let chunk = ChunkBuilder::new()
        .add_record(1, standard_values())
        .add_record(2, standard_values())
        .add_record(3, standard_values())
        .build();
    let file = build_file(&[chunk], 0);

    let filter = EvtxFilter::with_ranges("2-3".parse().unwrap());
    let parsed = EvtxParser::from_buffer(&file)
        .unwrap()
        .with_configuration(xml_settings(1))
        .parse();

    let ids: Vec<u64> = parsed
        .records()
        .filter(|r| filter.matches(r))
        .map(|r| r.event_record_id)
        .collect();
    assert_eq!(ids, vec![2, 3]);
}

#[test]
fn test_optional_substitution_with_null_slot() {
    ensure_env_logger_initialized();
    let mut values = standard_values();
    values[3] = (0x00, Vec::new());
    let chunk = ChunkBuilder::new().add_record(1, values).build();
    let file = build_file(&[chunk], 0);

    let parsed = EvtxParser::from_buffer(&file)
        .unwrap()
        .with_configuration(xml_settings(1))
        .parse();
    let xml = xml_of(&parsed.records().next().expect("one record").data).to_string();
    assert!(xml.contains("<Data Name=\"A\"></Data>"));

    let parsed = EvtxParser::from_buffer(&file)
        .unwrap()
        .with_configuration(json_settings())
        .parse();
    let record = parsed.records().next().expect("one record");
    let value: Value = match &record.data {
        RecordData::Json(bytes) => serde_json::from_slice(bytes).unwrap(),
        RecordData::Xml(_) => panic!("expected JSON output"),
    };
    assert_eq!(value["Event"]["EventData"]["A"], Value::Null);
}

#[test]
fn test_dirty_file_still_yields_all_records() {
    ensure_env_logger_initialized();
    let chunk = ChunkBuilder::new()
        .add_record(1, standard_values())
        .add_record(2, standard_values())
        .build();
    let file = build_file(&[chunk], 0x1);

    let parser = EvtxParser::from_buffer(&file).unwrap();
    assert!(parser.header().is_dirty());

    let parsed = parser.parse();
    assert_eq!(parsed.records().count(), 2);
    assert!(parsed.records().all(|r| !r.data.is_empty()));
}

#[test]
fn test_bad_chunk_magic_contributes_warning_and_no_records() {
    ensure_env_logger_initialized();
    let good = ChunkBuilder::new()
        .add_record(1, standard_values())
        .add_record(2, standard_values())
        .build();
    let bad = ChunkBuilder::new().add_record(3, standard_values()).build();
    let mut file = build_file(&[good, bad], 0);

    // Damage the second chunk's magic.
    file[4096 + EVTX_CHUNK_SIZE] = b'X';

    let parser = EvtxParser::from_buffer(&file).unwrap();
    // The magic-gated walker no longer sees the damaged chunk...
    assert_eq!(parser.chunk_offsets(), vec![4096]);

    // ...but the parse still reports it: zero records, one warning.
    let parsed = parser.parse();
    assert_eq!(parsed.chunks.len(), 2);

    assert_eq!(parsed.chunks[0].renderings.len(), 2);
    assert!(parsed.chunks[0].warnings.is_empty());

    assert!(parsed.chunks[1].header.is_none());
    assert!(parsed.chunks[1].records.is_empty());
    assert!(parsed.chunks[1].renderings.is_empty());
    assert_eq!(parsed.chunks[1].warnings.len(), 1);
}

#[test]
fn test_unpaired_surrogate_is_replaced() {
    ensure_env_logger_initialized();
    let mut values = standard_values();
    // A lone high surrogate followed by 'X'.
    values[3] = (0x01, vec![0x00, 0xD8, 0x58, 0x00]);
    let chunk = ChunkBuilder::new().add_record(1, values).build();
    let file = build_file(&[chunk], 0);

    let parsed = EvtxParser::from_buffer(&file)
        .unwrap()
        .with_configuration(xml_settings(1))
        .parse();
    let xml = xml_of(&parsed.records().next().expect("one record").data).to_string();
    assert!(xml.contains("<Data Name=\"A\">\u{FFFD}X</Data>"));
    // Already a `String`, so UTF-8 encoding cannot fail; make it explicit.
    assert!(String::from_utf8(xml.into_bytes()).is_ok());
}

#[test]
fn test_embedded_binxml_substitution() {
    ensure_env_logger_initialized();
    let nested_len = 60;
    let payload_len = 18 + 4 * 5 + (24 + 2 + 8 + nested_len + 4);

    let chunk = ChunkBuilder::new()
        .add_raw_record(1, payload_len, |payload_base, layout| {
            let mut values = standard_values();
            let blob_prefix: usize = values[..3].iter().map(|(_, bytes)| bytes.len()).sum();
            let nested_base = payload_base + 18 + 4 * 5 + blob_prefix;
            values[3] = (0x21, nested_binxml_document(nested_base, layout));
            templated_payload(layout.template_offset, &values)
        })
        .build();
    let file = build_file(&[chunk], 0);

    let parsed = EvtxParser::from_buffer(&file)
        .unwrap()
        .with_configuration(xml_settings(1))
        .parse();
    assert_eq!(parsed.warnings().count(), 0);
    let xml = xml_of(&parsed.records().next().expect("one record").data).to_string();
    assert!(
        xml.contains("<Data Name=\"A\"><Nested/></Data>"),
        "nested document missing from: {xml}"
    );

    let parsed = EvtxParser::from_buffer(&file)
        .unwrap()
        .with_configuration(json_settings())
        .parse();
    let record = parsed.records().next().expect("one record");
    let value: Value = match &record.data {
        RecordData::Json(bytes) => serde_json::from_slice(bytes).unwrap(),
        RecordData::Xml(_) => panic!("expected JSON output"),
    };
    assert_eq!(value["Event"]["EventData"]["A"], json!({ "Nested": null }));
}

#[test]
fn test_missing_template_definition_renders_comment() {
    ensure_env_logger_initialized();
    let chunk = ChunkBuilder::new()
        .add_raw_record(1, 18, |_, _| {
            let mut payload = vec![0x0F, 0x01, 0x01, 0x00];
            payload.push(0x0C);
            payload.push(0x00);
            payload.extend_from_slice(&0u32.to_le_bytes());
            // Points past the end of the chunk.
            payload.extend_from_slice(&65536u32.to_le_bytes());
            payload.extend_from_slice(&0u32.to_le_bytes());
            payload
        })
        .build();
    let file = build_file(&[chunk], 0);

    let parsed = EvtxParser::from_buffer(&file)
        .unwrap()
        .with_configuration(xml_settings(1))
        .parse();

    let xml = xml_of(&parsed.records().next().expect("one record").data).to_string();
    assert_eq!(xml, "<!-- missing template definition at offset 65536 -->");
    assert!(
        parsed
            .warnings()
            .any(|w| w.contains("missing template definition"))
    );
}

#[test]
fn test_record_scan_resynchronizes_after_damage() {
    ensure_env_logger_initialized();
    let record_size = 28 + 18 + 4 * 5 + (24 + 2 + 8 + 2 + 4);
    let chunk = ChunkBuilder::new()
        .add_record(1, standard_values())
        .add_record(2, standard_values())
        .add_record(3, standard_values())
        .build();
    let mut file = build_file(&[chunk], 0);

    // Damage the last record's magic; the earlier records survive and the
    // scan reports the 4-byte resynchronization.
    file[4096 + 512 + 2 * record_size] = 0x2B;

    let parsed = EvtxParser::from_buffer(&file)
        .unwrap()
        .with_configuration(xml_settings(1))
        .parse();

    let recovered: Vec<u64> = parsed.records().map(|r| r.event_record_id).collect();
    assert_eq!(recovered, vec![1, 2]);
    assert!(parsed.warnings().any(|w| w.contains("resynchronizing")));
}

#[test]
fn test_payload_without_fragment_header_warns_but_renders() {
    ensure_env_logger_initialized();
    let chunk = ChunkBuilder::new()
        .add_raw_record(1, 13, |_, layout| {
            // A bare element with no fragment header in front of it.
            let mut payload = vec![0x01];
            payload.extend_from_slice(&0xFFFFu16.to_le_bytes());
            payload.extend_from_slice(&0u32.to_le_bytes());
            payload.extend_from_slice(&layout.names["Event"].to_le_bytes());
            payload.push(0x03);
            payload.push(0x00);
            payload
        })
        .build();
    let file = build_file(&[chunk], 0);

    let parsed = EvtxParser::from_buffer(&file)
        .unwrap()
        .with_configuration(xml_settings(1))
        .parse();

    let xml = xml_of(&parsed.records().next().expect("one record").data).to_string();
    assert_eq!(xml, "<Event/>");
    assert!(
        parsed
            .warnings()
            .any(|w| w.contains("does not start with a fragment header"))
    );
}

#[test]
fn test_invalid_file_magic_fails_the_parse() {
    ensure_env_logger_initialized();
    let chunk = ChunkBuilder::new().add_record(1, standard_values()).build();
    let mut file = build_file(&[chunk], 0);
    file[0] = b'X';

    assert!(EvtxParser::from_buffer(&file).is_err());
}
