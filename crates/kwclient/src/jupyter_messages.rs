//
// jupyter_messages.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
// Licensed under the Elastic License 2.0. See LICENSE.txt for license information.
//
//

use kwshared::jupyter_message::JupyterMessage;
use kwshared::kernel_info::KernelInfoReply;
use kwshared::kernel_status::{ExecutionState, StatusContent};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};

/// An enum of message types we know how to handle from the kernel. This is in
/// no way exhaustive; it just includes the types the client acts on.
pub enum JupyterMsg {
    Status(StatusContent),
    Stream(StreamContent),
    ExecuteResult(DisplayContent),
    DisplayData(DisplayContent),
    Error(ErrorContent),
    InputRequest(InputRequest),
    ExecuteReply(ExecuteReply),
    KernelInfoReply(Box<KernelInfoReply>),
    Other,
}

/// Convert a JupyterMessage (generic type) into a JupyterMsg (specific type)
impl From<&JupyterMessage> for JupyterMsg {
    fn from(msg: &JupyterMessage) -> Self {
        let Some(content) = msg.content.as_json() else {
            return JupyterMsg::Other;
        };
        match msg.header.msg_type.as_str() {
            "status" => parse(content).map_or(JupyterMsg::Other, JupyterMsg::Status),
            "stream" => parse(content).map_or(JupyterMsg::Other, JupyterMsg::Stream),
            "execute_result" => parse(content).map_or(JupyterMsg::Other, JupyterMsg::ExecuteResult),
            "display_data" => parse(content).map_or(JupyterMsg::Other, JupyterMsg::DisplayData),
            "error" => parse(content).map_or(JupyterMsg::Other, JupyterMsg::Error),
            "input_request" => parse(content).map_or(JupyterMsg::Other, JupyterMsg::InputRequest),
            "execute_reply" => parse(content).map_or(JupyterMsg::Other, JupyterMsg::ExecuteReply),
            "kernel_info_reply" => parse(content)
                .map_or(JupyterMsg::Other, |reply| JupyterMsg::KernelInfoReply(Box::new(reply))),
            _ => JupyterMsg::Other,
        }
    }
}

fn parse<T: DeserializeOwned>(content: &Value) -> Option<T> {
    T::deserialize(content).ok()
}

/// Whether the message is a status message reporting that the kernel is idle
pub fn is_idle(msg: &JupyterMessage) -> bool {
    matches!(
        JupyterMsg::from(msg),
        JupyterMsg::Status(StatusContent {
            execution_state: ExecutionState::Idle
        })
    )
}

#[derive(Deserialize)]
pub struct StreamContent {
    /// "stdout" or "stderr"
    pub name: String,
    pub text: String,
}

/// Content of `execute_result` and `display_data`
#[derive(Deserialize)]
pub struct DisplayContent {
    #[serde(default)]
    pub data: Map<String, Value>,

    #[serde(default)]
    pub metadata: Map<String, Value>,

    #[serde(default)]
    pub execution_count: Option<u64>,
}

impl DisplayContent {
    /// The plain text rendering, if the kernel sent one
    pub fn text(&self) -> Option<&str> {
        self.data.get("text/plain").and_then(Value::as_str)
    }
}

#[derive(Deserialize)]
pub struct ErrorContent {
    #[serde(default)]
    pub ename: String,

    #[serde(default)]
    pub evalue: String,

    #[serde(default)]
    pub traceback: Vec<String>,
}

#[derive(Deserialize)]
pub struct InputRequest {
    #[serde(default)]
    pub prompt: String,

    #[serde(default)]
    pub password: bool,
}

#[derive(Deserialize)]
pub struct ExecuteReply {
    pub status: String,

    #[serde(default)]
    pub execution_count: Option<u64>,

    #[serde(default)]
    pub user_expressions: Map<String, Value>,

    #[serde(default)]
    pub ename: Option<String>,

    #[serde(default)]
    pub evalue: Option<String>,
}
