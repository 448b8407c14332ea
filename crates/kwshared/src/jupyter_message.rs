//
// jupyter_message.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
// Licensed under the Elastic License 2.0. See LICENSE.txt for license information.
//
//

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The header of a Jupyter message.
///
/// Fields the client does not interpret (for example `subshell_id`) are kept
/// in `extra` so that relayed messages survive a decode/encode cycle.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JupyterMessageHeader {
    /// The message ID
    pub msg_id: String,

    /// The type of the message
    pub msg_type: String,

    /// The ID of the session that produced the message
    #[serde(default)]
    pub session: String,

    /// The user who produced the message
    #[serde(default)]
    pub username: String,

    /// The date/time the message was created, as an ISO 8601 string
    #[serde(default)]
    pub date: String,

    /// The version of the Jupyter protocol; empty when the peer omitted it
    #[serde(default)]
    pub version: String,

    /// Header fields not modeled above
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The set of all Jupyter sockets ("channels") over which messages are sent and
/// received.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JupyterChannel {
    /// The shell channel
    Shell,

    /// The control channel
    Control,

    /// The stdin channel
    Stdin,

    /// The iopub channel
    IOPub,

    /// The heartbeat channel
    #[serde(alias = "hb")]
    Heartbeat,
}

impl JupyterChannel {
    /// All channels, in a fixed order.
    pub const ALL: [JupyterChannel; 5] = [
        JupyterChannel::Shell,
        JupyterChannel::Control,
        JupyterChannel::Stdin,
        JupyterChannel::IOPub,
        JupyterChannel::Heartbeat,
    ];

    /// The tag used for this channel on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            JupyterChannel::Shell => "shell",
            JupyterChannel::Control => "control",
            JupyterChannel::Stdin => "stdin",
            JupyterChannel::IOPub => "iopub",
            JupyterChannel::Heartbeat => "heartbeat",
        }
    }
}

impl fmt::Display for JupyterChannel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a channel tag names no known channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownChannel(pub String);

impl fmt::Display for UnknownChannel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "unknown channel '{}'", self.0)
    }
}

impl std::error::Error for UnknownChannel {}

impl FromStr for JupyterChannel {
    type Err = UnknownChannel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shell" => Ok(JupyterChannel::Shell),
            "control" => Ok(JupyterChannel::Control),
            "stdin" => Ok(JupyterChannel::Stdin),
            "iopub" => Ok(JupyterChannel::IOPub),
            "heartbeat" | "hb" => Ok(JupyterChannel::Heartbeat),
            other => Err(UnknownChannel(other.to_string())),
        }
    }
}

/// The payload of a message.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    /// Decoded JSON content
    Json(Value),

    /// Content that is already serialized (when relaying) or that was
    /// deliberately left undecoded
    Raw(Bytes),
}

impl MessageContent {
    /// Returns the decoded JSON content, if the content was decoded.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            MessageContent::Json(value) => Some(value),
            MessageContent::Raw(_) => None,
        }
    }

    /// Looks up a top-level field of decoded JSON content.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_json().and_then(|value| value.get(key))
    }
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Json(Value::Object(Map::new()))
    }
}

impl From<Value> for MessageContent {
    fn from(value: Value) -> Self {
        MessageContent::Json(value)
    }
}

/// A Jupyter message. The channel it travels on is carried alongside the
/// message, never inside it.
#[derive(Debug, Clone, PartialEq)]
pub struct JupyterMessage {
    /// The header of the message
    pub header: JupyterMessageHeader,

    /// The header of the message's parent (the message that caused this message)
    pub parent_header: Option<JupyterMessageHeader>,

    /// Additional metadata
    pub metadata: Map<String, Value>,

    /// The message payload
    pub content: MessageContent,

    /// The message buffers
    pub buffers: Vec<Bytes>,
}

impl JupyterMessage {
    /// Create a message with the given header and JSON content and no parent,
    /// metadata or buffers.
    pub fn new(header: JupyterMessageHeader, content: Value) -> Self {
        Self {
            header,
            parent_header: None,
            metadata: Map::new(),
            content: MessageContent::Json(content),
            buffers: Vec::new(),
        }
    }

    /// The message ID
    pub fn id(&self) -> &str {
        &self.header.msg_id
    }

    /// The message type
    pub fn msg_type(&self) -> &str {
        &self.header.msg_type
    }

    /// The ID of the message this message replies to, if any
    pub fn parent_id(&self) -> Option<&str> {
        self.parent_header
            .as_ref()
            .map(|parent| parent.msg_id.as_str())
    }

    /// Whether this message was caused by the message with the given ID
    pub fn is_child_of(&self, msg_id: &str) -> bool {
        self.parent_id() == Some(msg_id)
    }
}
