//
// kernel.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! A scripted kernel that understands a handful of "programs".
//!
//! - `1+1` produces an `execute_result` of `2`
//! - `print` writes `hello` to stdout
//! - `raise` fails with a `ValueError`
//! - `input()` and `getpass()` prompt on stdin and echo the answer
//! - `hang` goes busy and never finishes
//!
//! User expressions naming `x` or `name` evaluate; anything else is a
//! `NameError`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use kwshared::jupyter_message::{JupyterChannel, JupyterMessage};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use super::{kernel_message, MockKernel, Responder};

type Outgoing = Vec<(JupyterChannel, JupyterMessage)>;

pub struct ScriptedKernel {
    session_id: String,
    execution_count: AtomicU64,
    awaiting_input: Mutex<Option<JupyterMessage>>,
    variables: HashMap<&'static str, &'static str>,
}

impl ScriptedKernel {
    pub fn new() -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            execution_count: AtomicU64::new(0),
            awaiting_input: Mutex::new(None),
            variables: HashMap::from([("x", "42"), ("name", "'kernel'")]),
        }
    }

    pub fn responder(self) -> Responder {
        let kernel = Arc::new(self);
        Arc::new(move |channel: JupyterChannel, message: &JupyterMessage| {
            kernel.respond(channel, message)
        })
    }

    fn reply(&self, parent: &JupyterMessage, msg_type: &str, content: Value) -> JupyterMessage {
        kernel_message(&self.session_id, Some(parent), msg_type, content)
    }

    fn status(&self, parent: &JupyterMessage, state: &str) -> (JupyterChannel, JupyterMessage) {
        (
            JupyterChannel::IOPub,
            self.reply(parent, "status", json!({ "execution_state": state })),
        )
    }

    pub fn respond(&self, channel: JupyterChannel, message: &JupyterMessage) -> Outgoing {
        match message.header.msg_type.as_str() {
            "kernel_info_request" => vec![
                self.status(message, "busy"),
                (
                    JupyterChannel::Shell,
                    self.reply(
                        message,
                        "kernel_info_reply",
                        json!({
                            "status": "ok",
                            "protocol_version": "5.3",
                            "implementation": "scripted",
                            "implementation_version": "0.1",
                            "language_info": {
                                "name": "script",
                                "version": "1.0",
                                "file_extension": ".script"
                            },
                            "banner": "Scripted kernel"
                        }),
                    ),
                ),
                self.status(message, "idle"),
            ],
            "execute_request" => self.execute(message),
            "input_reply" => self.input_reply(message),
            "interrupt_request" => self.interrupt(message),
            "shutdown_request" => vec![(
                JupyterChannel::Control,
                self.reply(
                    message,
                    "shutdown_reply",
                    json!({
                        "status": "ok",
                        "restart": message.content.get("restart").cloned().unwrap_or(Value::Bool(false))
                    }),
                ),
            )],
            other => match other.strip_suffix("_request") {
                Some(base) => vec![(
                    channel,
                    self.reply(message, &format!("{}_reply", base), json!({ "status": "ok" })),
                )],
                None => Vec::new(),
            },
        }
    }

    fn execute(&self, request: &JupyterMessage) -> Outgoing {
        let code = request
            .content
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let count = self.execution_count.fetch_add(1, Ordering::SeqCst) + 1;

        let mut out = vec![
            self.status(request, "busy"),
            (
                JupyterChannel::IOPub,
                self.reply(
                    request,
                    "execute_input",
                    json!({ "code": code, "execution_count": count }),
                ),
            ),
        ];

        let mut status = "ok";
        match code.as_str() {
            "1+1" => out.push((
                JupyterChannel::IOPub,
                self.reply(
                    request,
                    "execute_result",
                    json!({
                        "data": { "text/plain": "2" },
                        "metadata": {},
                        "execution_count": count
                    }),
                ),
            )),
            "print" => out.push((
                JupyterChannel::IOPub,
                self.reply(
                    request,
                    "stream",
                    json!({ "name": "stdout", "text": "hello\n" }),
                ),
            )),
            "raise" => {
                status = "error";
                out.push((
                    JupyterChannel::IOPub,
                    self.reply(
                        request,
                        "error",
                        json!({
                            "ename": "ValueError",
                            "evalue": "boom",
                            "traceback": ["Traceback (most recent call last)", "ValueError: boom"]
                        }),
                    ),
                ));
            }
            "input()" | "getpass()" => {
                *self.awaiting_input.lock().expect("Poisoned") = Some(request.clone());
                out.push((
                    JupyterChannel::Stdin,
                    self.reply(
                        request,
                        "input_request",
                        json!({ "prompt": "Name: ", "password": code == "getpass()" }),
                    ),
                ));
                return out;
            }
            "hang" => return out,
            _ => {}
        }

        out.push(self.status(request, "idle"));
        let user_expressions = self.evaluate(request);
        let mut reply = json!({
            "status": status,
            "execution_count": count,
            "user_expressions": user_expressions
        });
        if status == "error" {
            reply["ename"] = json!("ValueError");
            reply["evalue"] = json!("boom");
        }
        out.push((
            JupyterChannel::Shell,
            self.reply(request, "execute_reply", reply),
        ));
        out
    }

    fn evaluate(&self, request: &JupyterMessage) -> Map<String, Value> {
        let Some(Value::Object(expressions)) = request.content.get("user_expressions") else {
            return Map::new();
        };
        expressions
            .keys()
            .map(|name| {
                let result = match self.variables.get(name.as_str()) {
                    Some(value) => json!({
                        "status": "ok",
                        "data": { "text/plain": value },
                        "metadata": {}
                    }),
                    None => json!({
                        "status": "error",
                        "ename": "NameError",
                        "evalue": format!("name '{}' is not defined", name),
                        "traceback": []
                    }),
                };
                (name.clone(), result)
            })
            .collect()
    }

    fn input_reply(&self, reply: &JupyterMessage) -> Outgoing {
        let Some(request) = self.awaiting_input.lock().expect("Poisoned").take() else {
            return Vec::new();
        };
        let value = reply
            .content
            .get("value")
            .and_then(Value::as_str)
            .unwrap_or_default();
        vec![
            (
                JupyterChannel::IOPub,
                self.reply(
                    &request,
                    "stream",
                    json!({ "name": "stdout", "text": format!("got {}\n", value) }),
                ),
            ),
            self.status(&request, "idle"),
            (
                JupyterChannel::Shell,
                self.reply(
                    &request,
                    "execute_reply",
                    json!({ "status": "ok", "execution_count": 1, "user_expressions": {} }),
                ),
            ),
        ]
    }

    fn interrupt(&self, interrupt: &JupyterMessage) -> Outgoing {
        let mut out = vec![(
            JupyterChannel::Control,
            self.reply(interrupt, "interrupt_reply", json!({ "status": "ok" })),
        )];
        if let Some(request) = self.awaiting_input.lock().expect("Poisoned").take() {
            out.push((
                JupyterChannel::IOPub,
                self.reply(
                    &request,
                    "error",
                    json!({ "ename": "KeyboardInterrupt", "evalue": "", "traceback": [] }),
                ),
            ));
            out.push(self.status(&request, "idle"));
            out.push((
                JupyterChannel::Shell,
                self.reply(
                    &request,
                    "execute_reply",
                    json!({ "status": "error", "ename": "KeyboardInterrupt", "evalue": "" }),
                ),
            ));
        }
        out
    }
}

impl MockKernel {
    /// Start a kernel running the scripted programs above.
    pub async fn scripted() -> Self {
        Self::start(ScriptedKernel::new().responder()).await
    }
}
