//
// hooks.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
// Licensed under the Elastic License 2.0. See LICENSE.txt for license information.
//
//

//! Callbacks that `execute_interactive` hands kernel output and input
//! requests to, with defaults that use the terminal.

use std::io::{Stderr, Stdout, Write};
use std::sync::Arc;

use async_trait::async_trait;
use dialoguer::{Input, Password};
use kwshared::jupyter_message::JupyterMessage;
use tokio_util::sync::CancellationToken;

use crate::error::ClientError;
use crate::jupyter_messages::{InputRequest, JupyterMsg};
use crate::kernel_client::KernelClient;

/// Receives every IOPub message produced by an execution, in arrival order.
pub trait OutputHook: Send {
    fn on_output(&mut self, message: &JupyterMessage);
}

impl<F> OutputHook for F
where
    F: FnMut(&JupyterMessage) + Send,
{
    fn on_output(&mut self, message: &JupyterMessage) {
        self(message)
    }
}

/// Answers the kernel's `input_request` messages, usually by calling
/// `client.input`.
#[async_trait]
pub trait StdinHook: Send {
    async fn on_input_request(
        &mut self,
        client: &KernelClient,
        request: JupyterMessage,
    ) -> Result<(), ClientError>;
}

/// Writes streams, results and tracebacks to a pair of writers (the
/// terminal by default).
pub struct ConsoleOutput<O = Stdout, E = Stderr> {
    stdout: O,
    stderr: E,
}

impl ConsoleOutput {
    pub fn new() -> Self {
        Self {
            stdout: std::io::stdout(),
            stderr: std::io::stderr(),
        }
    }
}

impl Default for ConsoleOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl<O: Write + Send, E: Write + Send> ConsoleOutput<O, E> {
    pub fn with_writers(stdout: O, stderr: E) -> Self {
        Self { stdout, stderr }
    }

    /// Give back the writers.
    pub fn into_inner(self) -> (O, E) {
        (self.stdout, self.stderr)
    }

    fn render(&mut self, message: &JupyterMessage) -> std::io::Result<()> {
        match JupyterMsg::from(message) {
            JupyterMsg::Stream(stream) => {
                if stream.name == "stderr" {
                    self.stderr.write_all(stream.text.as_bytes())?;
                    self.stderr.flush()
                } else {
                    self.stdout.write_all(stream.text.as_bytes())?;
                    self.stdout.flush()
                }
            }
            JupyterMsg::ExecuteResult(display) | JupyterMsg::DisplayData(display) => {
                if let Some(text) = display.text() {
                    writeln!(self.stdout, "{}", text)?;
                }
                self.stdout.flush()
            }
            JupyterMsg::Error(error) => {
                if error.traceback.is_empty() {
                    writeln!(self.stderr, "{}: {}", error.ename, error.evalue)?;
                } else {
                    writeln!(self.stderr, "{}", error.traceback.join("\n"))?;
                }
                self.stderr.flush()
            }
            _ => Ok(()),
        }
    }
}

impl<O: Write + Send, E: Write + Send> OutputHook for ConsoleOutput<O, E> {
    fn on_output(&mut self, message: &JupyterMessage) {
        if let Err(e) = self.render(message) {
            log::warn!(
                "Failed to write {} output: {}",
                message.header.msg_type,
                e
            );
        }
    }
}

/// Reads one line of input given the prompt and whether to mask it. Runs on
/// a blocking thread.
pub type PromptFn = Arc<dyn Fn(&str, bool) -> Result<String, String> + Send + Sync>;

/// Prompts on the terminal. Cancelling the token while a prompt is open
/// interrupts the kernel and abandons the prompt.
pub struct ConsoleInput {
    cancel: CancellationToken,
    prompt: PromptFn,
}

impl ConsoleInput {
    pub fn new() -> Self {
        Self::with_cancellation(CancellationToken::new())
    }

    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self::with_prompt(cancel, Arc::new(read_line))
    }

    /// Use `prompt` instead of the terminal to read input.
    pub fn with_prompt(cancel: CancellationToken, prompt: PromptFn) -> Self {
        Self { cancel, prompt }
    }

    /// The token that cancels an open prompt
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    fn interrupted(&self, client: &KernelClient) -> ClientError {
        log::info!("Input cancelled; interrupting the kernel");
        if let Err(e) = client.interrupt() {
            log::error!("Failed to send interrupt_request: {}", e);
        }
        ClientError::Interrupted
    }
}

impl Default for ConsoleInput {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StdinHook for ConsoleInput {
    async fn on_input_request(
        &mut self,
        client: &KernelClient,
        request: JupyterMessage,
    ) -> Result<(), ClientError> {
        let InputRequest { prompt, password } = match JupyterMsg::from(&request) {
            JupyterMsg::InputRequest(content) => content,
            _ => {
                return Err(ClientError::UnexpectedReply {
                    msg_type: request.header.msg_type.clone(),
                    reason: String::from("malformed input_request content"),
                })
            }
        };

        if self.cancel.is_cancelled() {
            return Err(self.interrupted(client));
        }

        let read_input = self.prompt.clone();
        let read = tokio::task::spawn_blocking(move || read_input(&prompt, password));
        let value = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                // The prompt thread is left to finish on its own
                return Err(self.interrupted(client));
            }
            result = read => match result {
                Ok(Ok(value)) => value,
                Ok(Err(e)) => return Err(ClientError::Input(e)),
                Err(e) => return Err(ClientError::Input(e.to_string())),
            },
        };

        // A newer input request, or the reply that ends the execution that
        // asked, supersedes this prompt. Replies to other requests do not.
        let channels = client.channels();
        let finished = request
            .parent_id()
            .is_some_and(|execution| channels.shell.any(|reply| reply.is_child_of(execution)));
        if channels.stdin.has_pending() || finished {
            log::debug!(
                "Skipping input_reply to {}; the prompt is stale",
                request.header.msg_id
            );
            return Ok(());
        }

        client.input(&value)?;
        Ok(())
    }
}

fn read_line(prompt: &str, password: bool) -> Result<String, String> {
    let line = if password {
        Password::new()
            .with_prompt(prompt)
            .allow_empty_password(true)
            .interact()
    } else {
        Input::<String>::new()
            .with_prompt(prompt)
            .allow_empty(true)
            .interact_text()
    };
    line.map_err(|e| e.to_string())
}
