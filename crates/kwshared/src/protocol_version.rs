//
// protocol_version.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
// Licensed under the Elastic License 2.0. See LICENSE.txt for license information.
//
//

// Jupyter peers stamp every message header with the version of the messaging
// protocol they speak. Version 5 changed a handful of message types and
// content fields, so a client talking to an older kernel has to upgrade what
// it receives before interpreting it.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The protocol version this client speaks, stamped on outgoing headers.
pub const PROTOCOL_VERSION: &str = "5.3";

/// The websocket sub-protocol that selects the binary v1 framing.
pub const WEBSOCKET_SUBPROTOCOL: &str = "v1.kernel.websocket.jupyter.org";

/// A parsed `major.minor` Jupyter protocol version
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProtocolVersion {
    /// Major version number
    pub major: u32,

    /// Minor version number
    pub minor: u32,
}

impl ProtocolVersion {
    /// Create a new protocol version
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Returns the version spoken by this client
    pub fn current() -> Self {
        Self { major: 5, minor: 3 }
    }

    /// Parse a version string such as "5.3" or "4.1". A bare major version
    /// ("5") is accepted with a minor version of 0; anything after the minor
    /// component (e.g. a patch level) is ignored.
    pub fn parse(version: &str) -> Option<Self> {
        let mut parts = version.trim().split('.');
        let major = parts.next()?.parse::<u32>().ok()?;
        let minor = match parts.next() {
            Some(minor) => minor.parse::<u32>().ok()?,
            None => 0,
        };
        Some(Self { major, minor })
    }

    /// Resolve the version a message header declares. Version 4 headers have
    /// no version field, so a missing version means 4.0.
    pub fn from_header(version: &str) -> Self {
        if version.is_empty() {
            return Self::new(4, 0);
        }
        Self::parse(version).unwrap_or_else(Self::current)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}
