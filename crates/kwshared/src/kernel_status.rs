//
// kernel_status.rs
//
// Copyright (C) 2024 Posit Software, PBC. All rights reserved.
//
//

use std::fmt;

use serde::{Deserialize, Serialize};

/// The execution state a kernel reports in `status` messages on IOPub.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    /// The kernel is starting up
    Starting,
    /// The kernel is busy handling a request
    Busy,
    /// The kernel is idle
    Idle,
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExecutionState::Starting => write!(f, "starting"),
            ExecutionState::Busy => write!(f, "busy"),
            ExecutionState::Idle => write!(f, "idle"),
        }
    }
}

/// The content of a `status` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusContent {
    pub execution_state: ExecutionState,
}
