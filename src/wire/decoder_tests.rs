use bytes::{BufMut, BytesMut};
use prost::Message;

use super::messages::*;
use super::varint::encode_length;
use super::{decode, encode};
use crate::error::DecodeError;

fn frame(header: &WireMessageHeader, payload: &[u8]) -> Vec<u8> {
    let header_bytes = header.encode_to_vec();
    let mut out = Vec::new();
    encode_length(header_bytes.len() as u64, &mut out);
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(payload);
    out
}

fn header(types: &[i32], offsets: &[u32]) -> WireMessageHeader {
    WireMessageHeader {
        types: types.to_vec(),
        offsets: offsets.to_vec(),
    }
}

fn table(name: &str, oid: u32) -> Option<TableDescription> {
    Some(TableDescription {
        schema_name: "public".to_string(),
        table_name: name.to_string(),
        table_oid: oid,
    })
}

fn fields(names: &[&str], values: Vec<Vec<u8>>, nulls: Vec<u8>) -> Option<FieldSetDescription> {
    Some(FieldSetDescription {
        names: names.iter().map(|n| n.to_string()).collect(),
        values,
        type_oids: vec![],
        nulls,
        formats: vec![],
    })
}

#[test]
fn test_truncated_message() {
    assert_eq!(
        decode(&[0x00, 0x00]).unwrap_err(),
        DecodeError::TruncatedMessage { len: 2 }
    );
    assert_eq!(
        decode(&[]).unwrap_err(),
        DecodeError::TruncatedMessage { len: 0 }
    );
}

#[test]
fn test_malformed_length_prefix() {
    let err = decode(&[0x80; 8]).unwrap_err();
    assert_eq!(
        err,
        DecodeError::MalformedLengthPrefix {
            prefix: vec![0x80; 6]
        }
    );
}

#[test]
fn test_header_past_end_of_buffer() {
    let err = decode(&[0x10, 0x00, 0x00]).unwrap_err();
    match err {
        DecodeError::HeaderDecodeError {
            offset, header_len, ..
        } => {
            assert_eq!(offset, 1);
            assert_eq!(header_len, 16);
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[test]
fn test_header_not_protobuf() {
    let err = decode(&[0x02, 0xFF, 0xFF]).unwrap_err();
    assert!(matches!(err, DecodeError::HeaderDecodeError { offset: 1, .. }));
}

#[test]
fn test_header_length_mismatch() {
    let raw = frame(&header(&[0], &[]), &[]);
    let err = decode(&raw).unwrap_err();
    match err {
        DecodeError::HeaderDecodeError { reason, .. } => {
            assert!(reason.contains("len(types) 1 != len(offsets) 0"), "{}", reason);
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[test]
fn test_offset_past_payload() {
    let raw = frame(&header(&[0], &[5]), &[]);
    assert_eq!(
        decode(&raw).unwrap_err(),
        DecodeError::OffsetOutOfBounds {
            index: 0,
            offset: 5,
            payload_len: 0
        }
    );
}

#[test]
fn test_next_offset_past_payload() {
    let raw = frame(&header(&[0, 1], &[0, 9]), &[0x00]);
    assert_eq!(
        decode(&raw).unwrap_err(),
        DecodeError::OffsetOutOfBounds {
            index: 1,
            offset: 9,
            payload_len: 1
        }
    );
}

#[test]
fn test_decreasing_offsets() {
    let raw = frame(&header(&[0, 1], &[2, 1]), &[0x00, 0x00]);
    assert_eq!(
        decode(&raw).unwrap_err(),
        DecodeError::OffsetOutOfBounds {
            index: 1,
            offset: 1,
            payload_len: 2
        }
    );
}

#[test]
fn test_unknown_message_type() {
    let raw = frame(&header(&[0, 7], &[0, 0]), &[]);
    assert_eq!(
        decode(&raw).unwrap_err(),
        DecodeError::UnknownMessageType { index: 1, value: 7 }
    );
}

#[test]
fn test_payload_not_an_entity() {
    let raw = frame(&header(&[2], &[0]), &[0xFF]);
    match decode(&raw).unwrap_err() {
        DecodeError::PayloadDecodeError {
            index,
            message_type,
            len,
            ..
        } => {
            assert_eq!(index, 0);
            assert_eq!(message_type, "InsertDescription");
            assert_eq!(len, 1);
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[test]
fn test_empty_header_yields_no_messages() {
    assert!(decode(&[0x00, 0xAA, 0xBB]).unwrap().is_empty());
}

#[test]
fn test_empty_begin_and_commit_payloads() {
    let raw = frame(&header(&[0, 1], &[0, 0]), &[]);
    assert_eq!(
        decode(&raw).unwrap(),
        vec![
            WireMessage::Begin(BeginTransaction {}),
            WireMessage::Commit(CommitTransaction {})
        ]
    );
}

#[test]
fn test_unpacked_header_is_accepted() {
    // types: key (1 << 3 | 0) = 0x08, value 0
    // offsets: key (2 << 3 | 0) = 0x10, value 0
    let raw = [0x04, 0x08, 0x00, 0x10, 0x00];
    assert_eq!(
        decode(&raw).unwrap(),
        vec![WireMessage::Begin(BeginTransaction {})]
    );
}

#[test]
fn test_hand_built_insert() {
    let insert = InsertDescription {
        table: table("t", 16384),
        new_values: fields(&["a", "b"], vec![b"42".to_vec(), vec![]], vec![0, 1]),
    };
    let payload = insert.encode_to_vec();

    let mut buf = BytesMut::new();
    buf.put_slice(&payload);
    buf.put_slice(&CommitTransaction {}.encode_to_vec());

    let raw = frame(&header(&[2, 1], &[0, payload.len() as u32]), &buf);
    assert_eq!(
        decode(&raw).unwrap(),
        vec![
            WireMessage::Insert(insert),
            WireMessage::Commit(CommitTransaction {})
        ]
    );
}

#[test]
fn test_round_trip_transaction() {
    let old = fields(
        &["id", "payload"],
        vec![vec![0, 0, 0, 1], b"\\x0102".to_vec()],
        vec![0, 0],
    );
    let mut new = fields(
        &["id", "payload"],
        vec![vec![0, 0, 0, 1], vec![]],
        vec![0, 1],
    );
    if let Some(fsd) = new.as_mut() {
        fsd.type_oids = vec![23, 17];
        fsd.formats = vec![1, 0];
    }

    let messages = vec![
        WireMessage::Begin(BeginTransaction {}),
        WireMessage::Insert(InsertDescription {
            table: table("rt", 0),
            new_values: old.clone(),
        }),
        WireMessage::Update(UpdateDescription {
            table: table("rt", 0),
            key_fields: old.clone(),
            new_values: new.clone(),
        }),
        WireMessage::Delete(DeleteDescription {
            table: table("rt", 0),
            key_fields: new,
        }),
        WireMessage::Commit(CommitTransaction {}),
    ];

    assert_eq!(decode(&encode(&messages)).unwrap(), messages);
}

#[test]
fn test_round_trip_zero_column_insert() {
    let messages = vec![WireMessage::Insert(InsertDescription {
        table: table("empty", 0),
        new_values: fields(&[], vec![], vec![]),
    })];
    let decoded = decode(&encode(&messages)).unwrap();
    // proto3 drops empty sub-messages' contents but keeps their presence
    match &decoded[0] {
        WireMessage::Insert(insert) => {
            assert_eq!(insert.table, table("empty", 0));
            assert_eq!(insert.new_values, Some(FieldSetDescription::default()));
        }
        other => panic!("unexpected message: {:?}", other),
    }
}

#[test]
fn test_value_length_boundaries() {
    for len in [
        110usize, 111, 112, 16365, 16366, 16367, 2097132, 2097133, 2097134,
    ] {
        let value = vec![b'x'; len];
        let messages = vec![WireMessage::Insert(InsertDescription {
            table: table("message_length_test", 0),
            new_values: fields(&["data"], vec![value.clone()], vec![0]),
        })];

        let decoded = decode(&encode(&messages)).unwrap();
        match &decoded[0] {
            WireMessage::Insert(InsertDescription {
                new_values: Some(fsd),
                ..
            }) => {
                assert_eq!(fsd.values.len(), 1);
                assert_eq!(fsd.values[0].len(), len, "length {}", len);
                assert!(fsd.values[0].iter().all(|&b| b == b'x'));
            }
            other => panic!("unexpected message for length {}: {:?}", len, other),
        }
    }
}

fn push_varint(mut value: usize, out: &mut Vec<u8>) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

fn push_field(tag: u8, bytes: &[u8], out: &mut Vec<u8>) {
    out.push(tag);
    push_varint(bytes.len(), out);
    out.extend_from_slice(bytes);
}

/// One INSERT into `t(d)` with a `len`-byte value, serialized by hand.
fn raw_insert(len: usize) -> Vec<u8> {
    let mut table = Vec::new();
    push_field(0x12, b"t", &mut table);

    let mut fields = Vec::new();
    push_field(0x12, b"d", &mut fields);
    push_field(0x1a, &vec![b'x'; len], &mut fields);
    push_field(0x2a, &[0], &mut fields);

    let mut insert = Vec::new();
    push_field(0x0a, &table, &mut insert);
    push_field(0x1a, &fields, &mut insert);

    // types = [INSERT], offsets = [0], both packed
    let header = [0x0a, 0x01, 0x02, 0x12, 0x01, 0x00];
    let mut raw = vec![header.len() as u8];
    raw.extend_from_slice(&header);
    raw.extend_from_slice(&insert);
    raw
}

#[test]
fn test_hand_built_value_length_boundaries() {
    for len in [110usize, 111, 16238, 16239] {
        let decoded = decode(&raw_insert(len)).unwrap();
        assert_eq!(
            decoded,
            vec![WireMessage::Insert(InsertDescription {
                table: Some(TableDescription {
                    schema_name: String::new(),
                    table_name: "t".to_string(),
                    table_oid: 0,
                }),
                new_values: fields(&["d"], vec![vec![b'x'; len]], vec![0]),
            })],
            "length {}",
            len
        );
    }
}

#[test]
fn test_many_messages_need_multi_byte_header_length() {
    let messages: Vec<WireMessage> = (0..100)
        .map(|i| {
            WireMessage::Insert(InsertDescription {
                table: table("bulk", 0),
                new_values: fields(&["n"], vec![format!("{}", i).into_bytes()], vec![0]),
            })
        })
        .collect();

    let raw = encode(&messages);
    // header_len exceeds 127, so the prefix takes two bytes
    assert!(raw[0] & 0x80 != 0);
    assert_eq!(decode(&raw).unwrap(), messages);
}
