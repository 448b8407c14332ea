//
// error.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
//
//

use std::time::Duration;

use kwshared::jupyter_message::JupyterChannel;
use thiserror::Error;

/// Errors raised while encoding or decoding a single message. These are fatal
/// to the message involved, never to the connection.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The message could not be encoded (e.g. its content is not an object)
    #[error("Cannot encode message: {0}")]
    Encoding(String),

    /// The bytes received do not form a valid message
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// A binary attachment was not given as a contiguous byte buffer
    #[error("Invalid attachment at index {index}: {reason}")]
    InvalidAttachment { index: usize, reason: String },

    /// A JSON part failed to serialize or parse
    #[error("JSON error in message {part}: {source}")]
    Json {
        part: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors surfaced by the kernel client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// A channel required by the operation is not running
    #[error("The {0} channel is not ready")]
    ChannelNotReady(JupyterChannel),

    /// The operation needs an open socket and there is none
    #[error("Not connected to the kernel")]
    NotConnected,

    /// The socket dropped while the operation was in flight
    #[error("Connection to the kernel was lost")]
    ConnectionLost,

    /// No reply or output arrived within the time allowed
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The operation was cancelled locally; the kernel has been interrupted
    #[error("Interrupted")]
    Interrupted,

    /// A variable store lookup missed
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// The websocket handshake with the kernel endpoint failed
    #[error("Handshake with {endpoint} failed: {reason}")]
    Handshake { endpoint: String, reason: String },

    /// The endpoint URL could not be used
    #[error("Invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    /// A reply arrived but its content was not what the request expects
    #[error("Unexpected reply to {msg_type}: {reason}")]
    UnexpectedReply { msg_type: String, reason: String },

    /// Reading input from the terminal failed
    #[error("Failed to read input: {0}")]
    Input(String),
}
