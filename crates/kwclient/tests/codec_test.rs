//
// codec_test.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

#![allow(missing_docs)]

use bytes::Bytes;
use kwclient::error::CodecError;
use kwclient::wire_message::{attachment_from_value, deserialize, serialize, WireMessage};
use kwclient::wire_message_header::new_header;
use kwshared::jupyter_message::{JupyterChannel, JupyterMessage, MessageContent};
use serde_json::{json, Value};

fn message(msg_type: &str, content: Value) -> JupyterMessage {
    JupyterMessage::new(
        new_header(String::from("msg-1"), msg_type, "session-1", "tester"),
        content,
    )
}

/// Build a v1 frame by hand from a channel tag and raw parts.
fn frame(channel: &str, parts: &[&str]) -> Vec<u8> {
    let count = parts.len() + 2;
    let mut offsets = Vec::with_capacity(count);
    let mut offset = (count + 1) * 8;
    offsets.push(offset);
    offset += channel.len();
    offsets.push(offset);
    for part in parts {
        offset += part.len();
        offsets.push(offset);
    }

    let mut frame = Vec::new();
    frame.extend_from_slice(&(count as u64).to_le_bytes());
    for offset in offsets {
        frame.extend_from_slice(&(offset as u64).to_le_bytes());
    }
    frame.extend_from_slice(channel.as_bytes());
    for part in parts {
        frame.extend_from_slice(part.as_bytes());
    }
    frame
}

#[test]
fn test_round_trip_preserves_message_and_buffers() {
    let mut original = message("comm_msg", json!({ "comm_id": "abc", "data": { "n": 1 } }));
    original.parent_header = Some(new_header(
        String::from("parent-1"),
        "comm_open",
        "session-1",
        "tester",
    ));
    original
        .metadata
        .insert(String::from("tag"), json!("value"));
    original.buffers = vec![
        Bytes::from_static(b"first"),
        Bytes::from_static(&[0, 1, 2, 255]),
        Bytes::new(),
    ];

    let parts = serialize(&original).expect("Failed to serialize");
    assert_eq!(parts.len(), 7);
    assert_eq!(&parts[4][..], b"first");
    assert_eq!(&parts[6][..], b"");

    let decoded = deserialize(&parts, true).expect("Failed to deserialize");
    assert_eq!(decoded, original);
    assert_eq!(decoded.buffers.len(), 3);
    assert_eq!(&decoded.buffers[0][..], b"first");
    assert_eq!(&decoded.buffers[1][..], &[0u8, 1, 2, 255]);
    assert!(decoded.buffers[2].is_empty());
}

#[test]
fn test_absent_parent_is_empty_object() {
    let parts = serialize(&message("kernel_info_request", json!({}))).expect("Failed to serialize");
    assert_eq!(&parts[1][..], b"{}");

    let decoded = deserialize(&parts, true).expect("Failed to deserialize");
    assert!(decoded.parent_header.is_none());
    assert_eq!(decoded.parent_id(), None);
}

#[test]
fn test_non_object_content_fails_to_encode() {
    let result = serialize(&message("execute_request", json!(["not", "an", "object"])));
    assert!(matches!(result, Err(CodecError::Encoding(_))));
}

#[test]
fn test_raw_content_passes_through() {
    let mut msg = message("execute_request", json!({}));
    msg.content = MessageContent::Raw(Bytes::from_static(br#"{"code":"1+1"}"#));
    let parts = serialize(&msg).expect("Failed to serialize");
    assert_eq!(&parts[3][..], br#"{"code":"1+1"}"#);

    let decoded = deserialize(&parts, false).expect("Failed to deserialize");
    assert_eq!(
        decoded.content,
        MessageContent::Raw(Bytes::from_static(br#"{"code":"1+1"}"#))
    );
}

#[test]
fn test_too_few_parts_is_malformed() {
    let parts = serialize(&message("status", json!({ "execution_state": "idle" })))
        .expect("Failed to serialize");
    let result = deserialize(&parts[..3], true);
    assert!(matches!(result, Err(CodecError::Malformed(_))));
}

#[test]
fn test_header_without_msg_type_is_malformed() {
    let parts = vec![
        Bytes::from_static(br#"{"msg_id":"abc"}"#),
        Bytes::from_static(b"{}"),
        Bytes::from_static(b"{}"),
        Bytes::from_static(b"{}"),
    ];
    let result = deserialize(&parts, true);
    assert!(matches!(result, Err(CodecError::Malformed(_))));
}

#[test]
fn test_invalid_json_names_the_part() {
    let parts = vec![
        Bytes::from_static(br#"{"msg_id":"abc","msg_type":"status"}"#),
        Bytes::from_static(b"{}"),
        Bytes::from_static(b"{}"),
        Bytes::from_static(b"{not json"),
    ];
    match deserialize(&parts, true) {
        Err(CodecError::Json { part, .. }) => assert_eq!(part, "content"),
        other => panic!("Expected a JSON error, got {:?}", other),
    }

    // Undecoded content is never parsed
    assert!(deserialize(&parts, false).is_ok());
}

#[test]
fn test_envelope_round_trip() {
    let mut msg = message("display_data", json!({ "data": {}, "metadata": {} }));
    msg.buffers = vec![Bytes::from_static(b"\x00\x01binary")];
    let wire = WireMessage::from_jupyter(&msg).expect("Failed to serialize");
    let frame = wire.to_ws_frame(JupyterChannel::IOPub);

    // Count, then one offset per part plus the channel and the end
    let count = u64::from_le_bytes(frame[0..8].try_into().expect("short frame"));
    assert_eq!(count as usize, wire.parts.len() + 2);

    let (channel, unwrapped) =
        WireMessage::from_ws_frame(Bytes::from(frame)).expect("Failed to unwrap");
    assert_eq!(channel, JupyterChannel::IOPub);
    assert_eq!(unwrapped, wire);
    assert_eq!(unwrapped.to_jupyter(true).expect("Failed to decode"), msg);
}

#[test]
fn test_envelope_rejects_truncated_offset_table() {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&(6u64).to_le_bytes());
    bytes.extend_from_slice(&(56u64).to_le_bytes());
    let result = WireMessage::from_ws_frame(Bytes::from(bytes));
    assert!(matches!(result, Err(CodecError::Malformed(_))));

    let result = WireMessage::from_ws_frame(Bytes::from_static(&[1, 2, 3]));
    assert!(matches!(result, Err(CodecError::Malformed(_))));
}

#[test]
fn test_envelope_rejects_descending_offsets() {
    let mut bytes = frame("shell", &["{}", "{}", "{}", "{}"]);
    // Swap the offsets of the second and third parts
    let second = bytes[24..32].to_vec();
    let third = bytes[32..40].to_vec();
    bytes[24..32].copy_from_slice(&third);
    bytes[32..40].copy_from_slice(&second);
    let result = WireMessage::from_ws_frame(Bytes::from(bytes));
    assert!(matches!(result, Err(CodecError::Malformed(_))));
}

#[test]
fn test_envelope_rejects_offsets_past_end() {
    let mut bytes = frame("shell", &["{}", "{}", "{}", "{}"]);
    bytes.truncate(bytes.len() - 1);
    let result = WireMessage::from_ws_frame(Bytes::from(bytes));
    assert!(matches!(result, Err(CodecError::Malformed(_))));
}

#[test]
fn test_envelope_rejects_unknown_channel() {
    let bytes = frame("bogus", &["{}", "{}", "{}", "{}"]);
    let result = WireMessage::from_ws_frame(Bytes::from(bytes));
    assert!(matches!(result, Err(CodecError::Malformed(_))));
}

#[test]
fn test_three_part_frame_is_malformed() {
    let header = r#"{"msg_id":"abc","msg_type":"status","version":"5.3"}"#;
    let bytes = frame("iopub", &[header, "{}", "{}"]);
    let (channel, wire) =
        WireMessage::from_ws_frame(Bytes::from(bytes)).expect("Envelope itself is valid");
    assert_eq!(channel, JupyterChannel::IOPub);
    assert_eq!(wire.parts.len(), 3);
    assert!(matches!(
        wire.to_jupyter(true),
        Err(CodecError::Malformed(_))
    ));
}

#[test]
fn test_buffers_are_views_of_the_frame() {
    let mut msg = message("comm_msg", json!({}));
    msg.buffers = vec![Bytes::from_static(b"payload")];
    let frame = Bytes::from(
        WireMessage::from_jupyter(&msg)
            .expect("Failed to serialize")
            .to_ws_frame(JupyterChannel::Shell),
    );
    let frame_range = frame.as_ptr() as usize..frame.as_ptr() as usize + frame.len();

    let (_, wire) = WireMessage::from_ws_frame(frame.clone()).expect("Failed to unwrap");
    let decoded = wire.to_jupyter(true).expect("Failed to decode");
    let buffer = &decoded.buffers[0];
    assert_eq!(&buffer[..], b"payload");
    assert!(frame_range.contains(&(buffer.as_ptr() as usize)));
}

#[test]
fn test_attachments_from_json_values() {
    let decoded = attachment_from_value(0, &json!("aGVsbG8=")).expect("Valid base64");
    assert_eq!(&decoded[..], b"hello");

    let decoded = attachment_from_value(1, &json!([104, 105])).expect("Valid bytes");
    assert_eq!(&decoded[..], b"hi");

    match attachment_from_value(2, &json!({ "not": "bytes" })) {
        Err(CodecError::InvalidAttachment { index, .. }) => assert_eq!(index, 2),
        other => panic!("Expected an invalid attachment, got {:?}", other),
    }
    assert!(matches!(
        attachment_from_value(3, &json!([1, 256])),
        Err(CodecError::InvalidAttachment { index: 3, .. })
    ));
    assert!(matches!(
        attachment_from_value(4, &json!("%%%")),
        Err(CodecError::InvalidAttachment { index: 4, .. })
    ));
}
