//
// session.rs
//
// Copyright (C) 2024 Posit Software, PBC. All rights reserved.
//
//

//! Per-connection session identity and message construction.

use std::sync::atomic::{AtomicU64, Ordering};

use kwshared::jupyter_message::{JupyterMessage, JupyterMessageHeader};
use serde_json::Value;

use crate::wire_message_header::new_header;

#[derive(Debug)]
pub struct Session {
    /// The ID of the session; survives reconnects
    session_id: String,

    /// The username stamped on outgoing messages
    username: String,

    /// Counter used to derive unique message IDs
    message_count: AtomicU64,
}

impl Session {
    /// Create a session with a fresh random ID.
    pub fn new(username: Option<String>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().simple().to_string(), username)
    }

    /// Create a session with a caller-chosen ID, e.g. to keep the same
    /// identity across client instances.
    pub fn with_id(session_id: String, username: Option<String>) -> Self {
        let username = username.unwrap_or_else(default_username);
        Self {
            session_id,
            username,
            message_count: AtomicU64::new(0),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Generate a message ID that is unique within this session.
    pub fn next_message_id(&self) -> String {
        let count = self.message_count.fetch_add(1, Ordering::SeqCst);
        format!("{}_{}_{}", self.session_id, std::process::id(), count)
    }

    /// Create a header for a new outgoing message of the given type.
    pub fn header(&self, msg_type: &str) -> JupyterMessageHeader {
        new_header(
            self.next_message_id(),
            msg_type,
            &self.session_id,
            &self.username,
        )
    }

    /// Create a new outgoing message of the given type.
    pub fn message(&self, msg_type: &str, content: Value) -> JupyterMessage {
        JupyterMessage::new(self.header(msg_type), content)
    }
}

fn default_username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| String::from("username"))
}
