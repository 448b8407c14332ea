//
// wire_message_header.rs
//
// Copyright (C) 2024 Posit Software, PBC. All rights reserved.
//
//

use kwshared::jupyter_message::JupyterMessageHeader;
use kwshared::protocol_version::PROTOCOL_VERSION;
use serde_json::{Map, Value};

use crate::error::CodecError;

/// Create the header of an outgoing message, stamped with the current time
/// and the protocol version this client speaks.
pub fn new_header(
    msg_id: String,
    msg_type: &str,
    session_id: &str,
    username: &str,
) -> JupyterMessageHeader {
    // Create an ISO 8601 date string
    let date = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
    JupyterMessageHeader {
        msg_id,
        msg_type: msg_type.to_string(),
        session: session_id.to_string(),
        username: username.to_string(),
        date,
        version: String::from(PROTOCOL_VERSION),
        extra: Map::new(),
    }
}

/// Decode the header part of a message. The header must name both the message
/// ID and the message type.
pub fn decode_header(bytes: &[u8]) -> Result<JupyterMessageHeader, CodecError> {
    let value: Value = serde_json::from_slice(bytes).map_err(|source| CodecError::Json {
        part: "header",
        source,
    })?;
    if value.get("msg_id").and_then(Value::as_str).is_none() {
        return Err(CodecError::Malformed(String::from(
            "header is missing msg_id",
        )));
    }
    if value.get("msg_type").and_then(Value::as_str).is_none() {
        return Err(CodecError::Malformed(String::from(
            "header is missing msg_type",
        )));
    }
    serde_json::from_value(value).map_err(|source| CodecError::Json {
        part: "header",
        source,
    })
}

/// Decode the parent header part of a message. Messages that were not caused
/// by another message carry an empty object here.
pub fn decode_parent_header(bytes: &[u8]) -> Result<Option<JupyterMessageHeader>, CodecError> {
    let value: Value = serde_json::from_slice(bytes).map_err(|source| CodecError::Json {
        part: "parent_header",
        source,
    })?;
    match value.get("msg_id").and_then(Value::as_str) {
        Some(msg_id) if !msg_id.is_empty() => serde_json::from_value(value)
            .map(Some)
            .map_err(|source| CodecError::Json {
                part: "parent_header",
                source,
            }),
        _ => Ok(None),
    }
}
