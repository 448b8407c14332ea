//
// wire_message.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
//
//

use base64::Engine;
use bytes::Bytes;
use kwshared::jupyter_message::{JupyterChannel, JupyterMessage, MessageContent};
use serde_json::{Map, Value};

use crate::adapt::adapt_inbound;
use crate::error::CodecError;
use crate::wire_message_header::{decode_header, decode_parent_header};

/// The number of parts every message carries before its buffers: header,
/// parent header, metadata and content.
pub const MESSAGE_PARTS: usize = 4;

/// A message in wire form: an ordered list of byte buffers.
#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    /// The parts of the message, as an array of byte arrays
    pub parts: Vec<Bytes>,
}

impl WireMessage {
    /// Create a new wire message from a Jupyter message.
    pub fn from_jupyter(msg: &JupyterMessage) -> Result<Self, CodecError> {
        Ok(WireMessage {
            parts: serialize(msg)?,
        })
    }

    /// Convert the wire message into a Jupyter message.
    pub fn to_jupyter(&self, include_content: bool) -> Result<JupyterMessage, CodecError> {
        deserialize(&self.parts, include_content)
    }

    /// Wrap the message in the websocket v1 envelope, tagged with the channel
    /// it is sent on.
    ///
    /// The envelope is a little-endian `u64` count `n`, followed by `n`
    /// little-endian `u64` offsets, followed by the channel name and the
    /// message parts. Offset `i` marks the start of part `i`; the last offset
    /// marks the end of the frame.
    pub fn to_ws_frame(&self, channel: JupyterChannel) -> Vec<u8> {
        let channel_tag = channel.as_str().as_bytes();
        let offset_count = self.parts.len() + 2;
        let body_len: usize =
            channel_tag.len() + self.parts.iter().map(|part| part.len()).sum::<usize>();
        let mut frame = Vec::with_capacity((offset_count + 1) * 8 + body_len);

        frame.extend_from_slice(&(offset_count as u64).to_le_bytes());
        let mut offset = (offset_count + 1) * 8;
        frame.extend_from_slice(&(offset as u64).to_le_bytes());
        offset += channel_tag.len();
        frame.extend_from_slice(&(offset as u64).to_le_bytes());
        for part in &self.parts {
            offset += part.len();
            frame.extend_from_slice(&(offset as u64).to_le_bytes());
        }

        frame.extend_from_slice(channel_tag);
        for part in &self.parts {
            frame.extend_from_slice(part);
        }
        frame
    }

    /// Unwrap a websocket v1 envelope. The parts are views into `frame`; no
    /// bytes are copied.
    pub fn from_ws_frame(frame: Bytes) -> Result<(JupyterChannel, Self), CodecError> {
        if frame.len() < 8 {
            return Err(CodecError::Malformed(format!(
                "frame of {} bytes is too short for an offset count",
                frame.len()
            )));
        }
        let offset_count = read_u64(&frame, 0) as usize;
        if offset_count < 2 {
            return Err(CodecError::Malformed(format!(
                "frame declares {} offsets; at least 2 are required",
                offset_count
            )));
        }
        let table_end = offset_count
            .checked_add(1)
            .and_then(|n| n.checked_mul(8))
            .filter(|end| *end <= frame.len())
            .ok_or_else(|| {
                CodecError::Malformed(format!(
                    "offset table of {} entries does not fit in a {} byte frame",
                    offset_count,
                    frame.len()
                ))
            })?;

        let offsets: Vec<usize> = (0..offset_count)
            .map(|i| read_u64(&frame, 8 * (i + 1)) as usize)
            .collect();
        if offsets[0] < table_end {
            return Err(CodecError::Malformed(String::from(
                "first part overlaps the offset table",
            )));
        }
        if offsets.windows(2).any(|pair| pair[0] > pair[1]) {
            return Err(CodecError::Malformed(String::from(
                "offsets are not in ascending order",
            )));
        }
        if offsets[offset_count - 1] > frame.len() {
            return Err(CodecError::Malformed(format!(
                "offsets run past the end of the {} byte frame",
                frame.len()
            )));
        }

        let channel_tag = std::str::from_utf8(&frame[offsets[0]..offsets[1]])
            .map_err(|e| CodecError::Malformed(format!("channel tag is not UTF-8: {}", e)))?;
        let channel = channel_tag
            .parse::<JupyterChannel>()
            .map_err(|e| CodecError::Malformed(e.to_string()))?;

        let parts = offsets[1..]
            .windows(2)
            .map(|pair| frame.slice(pair[0]..pair[1]))
            .collect();
        Ok((channel, WireMessage { parts }))
    }
}

fn read_u64(frame: &[u8], at: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&frame[at..at + 8]);
    u64::from_le_bytes(word)
}

/// Serialize a message into its wire parts: header, parent header, metadata
/// and content (each encoded as JSON), followed by the binary buffers in order.
///
/// Content that is already serialized passes through untouched. JSON content
/// must be an object.
pub fn serialize(msg: &JupyterMessage) -> Result<Vec<Bytes>, CodecError> {
    let mut parts: Vec<Bytes> = Vec::with_capacity(MESSAGE_PARTS + msg.buffers.len());

    parts.push(encode_json("header", &msg.header)?);

    // Add the parent header, if any
    match &msg.parent_header {
        Some(parent_header) => parts.push(encode_json("parent_header", parent_header)?),
        None => parts.push(encode_json("parent_header", &Map::new())?),
    }

    parts.push(encode_json("metadata", &msg.metadata)?);

    match &msg.content {
        MessageContent::Raw(raw) => parts.push(raw.clone()),
        MessageContent::Json(value @ Value::Object(_)) => {
            parts.push(encode_json("content", value)?)
        }
        MessageContent::Json(other) => {
            return Err(CodecError::Encoding(format!(
                "content of {} message must be an object, not {}",
                msg.header.msg_type,
                json_kind(other)
            )));
        }
    }

    parts.extend(msg.buffers.iter().cloned());
    Ok(parts)
}

/// Deserialize a message from its wire parts.
///
/// Any parts beyond the first four are the message's buffers. When
/// `include_content` is false the content is left as raw bytes and the message
/// is not adapted to the current protocol version.
pub fn deserialize(parts: &[Bytes], include_content: bool) -> Result<JupyterMessage, CodecError> {
    if parts.len() < MESSAGE_PARTS {
        return Err(CodecError::Malformed(format!(
            "expected at least {} parts, got {}",
            MESSAGE_PARTS,
            parts.len()
        )));
    }

    let mut header = decode_header(&parts[0])?;
    let parent_header = decode_parent_header(&parts[1])?;
    let metadata = match serde_json::from_slice::<Value>(&parts[2]).map_err(|source| {
        CodecError::Json {
            part: "metadata",
            source,
        }
    })? {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            return Err(CodecError::Malformed(format!(
                "metadata must be an object, not {}",
                json_kind(&other)
            )));
        }
    };

    let content = if include_content {
        let mut content: Value =
            serde_json::from_slice(&parts[3]).map_err(|source| CodecError::Json {
                part: "content",
                source,
            })?;
        adapt_inbound(&mut header, &mut content);
        MessageContent::Json(content)
    } else {
        MessageContent::Raw(parts[3].clone())
    };

    Ok(JupyterMessage {
        header,
        parent_header,
        metadata,
        content,
        buffers: parts[MESSAGE_PARTS..].to_vec(),
    })
}

/// Convert an attachment given as a JSON value into a byte buffer. Base64
/// strings and arrays of byte values are accepted; anything else cannot be
/// sent as a contiguous buffer.
pub fn attachment_from_value(index: usize, value: &Value) -> Result<Bytes, CodecError> {
    match value {
        Value::String(encoded) => base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(|e| CodecError::InvalidAttachment {
                index,
                reason: format!("not valid base64: {}", e),
            }),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_u64()
                    .filter(|byte| *byte <= u8::MAX as u64)
                    .map(|byte| byte as u8)
                    .ok_or_else(|| CodecError::InvalidAttachment {
                        index,
                        reason: format!("{} is not a byte value", item),
                    })
            })
            .collect::<Result<Vec<u8>, CodecError>>()
            .map(Bytes::from),
        other => Err(CodecError::InvalidAttachment {
            index,
            reason: format!("expected bytes, got {}", json_kind(other)),
        }),
    }
}

fn encode_json<T: serde::Serialize>(part: &'static str, value: &T) -> Result<Bytes, CodecError> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|source| CodecError::Json { part, source })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
