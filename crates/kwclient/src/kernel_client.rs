//
// kernel_client.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
// Licensed under the Elastic License 2.0. See LICENSE.txt for license information.
//
//

//! The request/reply surface of the client and the interactive execution
//! loop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use event_listener::EventListener;
use kwshared::jupyter_message::{JupyterChannel, JupyterMessage};
use kwshared::kernel_info::KernelInfoReply;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::channel::{Channel, Channels};
use crate::config::ClientConfig;
use crate::connection::ConnectionManager;
use crate::error::ClientError;
use crate::heartbeat::HeartbeatMonitor;
use crate::hooks::{ConsoleInput, ConsoleOutput, OutputHook, StdinHook};
use crate::jupyter_messages::{self, JupyterMsg};
use crate::session::Session;
use crate::store::VariableStore;

/// How long `wait_for_ready` waits for each `kernel_info_reply` before asking
/// again
const KERNEL_INFO_RETRY: Duration = Duration::from_secs(1);

/// Settings for an `execute_request`.
#[derive(Debug, Clone, Serialize)]
pub struct ExecuteOptions {
    pub silent: bool,
    pub store_history: bool,
    pub user_expressions: Map<String, Value>,
    pub allow_stdin: bool,
    pub stop_on_error: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            silent: false,
            store_history: true,
            user_expressions: Map::new(),
            allow_stdin: false,
            stop_on_error: true,
        }
    }
}

/// Settings for `execute_interactive`.
#[derive(Debug, Clone, Default)]
pub struct InteractiveOptions {
    pub execute: ExecuteOptions,

    /// Overall limit for the execution, output included; `None` waits as long
    /// as the kernel keeps running
    pub timeout: Option<Duration>,

    /// Cancels the default stdin hook's open prompt and interrupts the kernel
    pub cancel: Option<CancellationToken>,
}

/// Which part of the history a `history_request` asks for.
#[derive(Debug, Clone)]
pub enum HistoryAccess {
    /// The last `n` entries
    Tail { n: u32 },

    /// Entries `start..stop` of a session (0 for the current one)
    Range { session: i64, start: i64, stop: i64 },

    /// Entries matching a glob pattern
    Search { pattern: String, n: Option<u32>, unique: bool },
}

/// Settings for a `history_request`.
#[derive(Debug, Clone)]
pub struct HistoryOptions {
    pub raw: bool,
    pub output: bool,
    pub access: HistoryAccess,
}

impl Default for HistoryOptions {
    fn default() -> Self {
        Self {
            raw: true,
            output: false,
            access: HistoryAccess::Tail { n: 10 },
        }
    }
}

impl HistoryOptions {
    fn content(&self) -> Value {
        let mut content = json!({
            "raw": self.raw,
            "output": self.output,
        });
        let access = match &self.access {
            HistoryAccess::Tail { n } => json!({ "hist_access_type": "tail", "n": n }),
            HistoryAccess::Range {
                session,
                start,
                stop,
            } => json!({
                "hist_access_type": "range",
                "session": session,
                "start": start,
                "stop": stop,
            }),
            HistoryAccess::Search { pattern, n, unique } => json!({
                "hist_access_type": "search",
                "pattern": pattern,
                "n": n,
                "unique": unique,
            }),
        };
        if let (Value::Object(content), Value::Object(access)) = (&mut content, access) {
            content.extend(access);
        }
        content
    }
}

/// A request that was sent and whose reply has not been consumed yet.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub msg_type: String,
    pub channel: JupyterChannel,
    pub sent_at: Instant,
    generation: u64,
}

/// A client for one kernel, reached over one websocket connection.
pub struct KernelClient {
    session: Session,
    config: ClientConfig,
    channels: Arc<Channels>,
    connection: Arc<ConnectionManager>,
    pending: Mutex<HashMap<String, PendingRequest>>,
    heartbeat: Mutex<Option<HeartbeatMonitor>>,
}

impl KernelClient {
    /// Create a client that is not connected yet.
    pub fn new(config: ClientConfig) -> Self {
        let session = match &config.session_id {
            Some(id) => Session::with_id(id.clone(), config.username.clone()),
            None => Session::new(config.username.clone()),
        };
        let channels = Arc::new(Channels::new());
        let connection = Arc::new(ConnectionManager::new(
            session.session_id().to_string(),
            config.clone(),
            channels.clone(),
        ));
        Self {
            session,
            config,
            channels,
            connection,
            pending: Mutex::new(HashMap::new()),
            heartbeat: Mutex::new(None),
        }
    }

    /// Create a client and open its connection.
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let client = Self::new(config);
        client.start_channels().await?;
        Ok(client)
    }

    /// Open the connection, wait for the handshake, and start the heartbeat
    /// monitor.
    pub async fn start_channels(&self) -> Result<(), ClientError> {
        self.connection
            .connect(&self.config.endpoint, self.config.token.as_deref())?;
        self.connection
            .wait_ready(Some(self.config.connect_timeout))
            .await?;

        let monitor = HeartbeatMonitor::new(
            self.connection.clone(),
            self.session.session_id().to_string(),
            self.config.heartbeat_interval,
            self.config.heartbeat_timeout,
        );
        monitor.monitor();
        if let Some(previous) = self.lock_heartbeat().replace(monitor) {
            previous.stop();
        }
        Ok(())
    }

    /// Stop the heartbeat monitor and close the connection. Safe to call more
    /// than once.
    pub async fn stop_channels(&self) {
        if let Some(monitor) = self.lock_heartbeat().take() {
            monitor.stop();
        }
        self.connection.close().await;
        self.lock_pending().clear();
    }

    /// Whether the connection is open and the kernel answers heartbeats
    pub fn is_alive(&self) -> bool {
        self.connection.is_alive()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn channels(&self) -> &Channels {
        &self.channels
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    // Requests

    /// Ask the kernel to execute code.
    pub fn execute(&self, code: &str, options: &ExecuteOptions) -> Result<String, ClientError> {
        let mut content = json!({ "code": code });
        if let (Value::Object(content), Ok(Value::Object(options))) =
            (&mut content, serde_json::to_value(options))
        {
            content.extend(options);
        }
        self.request(JupyterChannel::Shell, "execute_request", content)
    }

    /// Ask for information about the object at `cursor_pos` (end of `code`
    /// if omitted).
    pub fn inspect(
        &self,
        code: &str,
        cursor_pos: Option<usize>,
        detail_level: u8,
    ) -> Result<String, ClientError> {
        let content = json!({
            "code": code,
            "cursor_pos": cursor_pos.unwrap_or_else(|| code.chars().count()),
            "detail_level": detail_level,
        });
        self.request(JupyterChannel::Shell, "inspect_request", content)
    }

    /// Ask for completions at `cursor_pos` (end of `code` if omitted).
    pub fn complete(&self, code: &str, cursor_pos: Option<usize>) -> Result<String, ClientError> {
        let content = json!({
            "code": code,
            "cursor_pos": cursor_pos.unwrap_or_else(|| code.chars().count()),
        });
        self.request(JupyterChannel::Shell, "complete_request", content)
    }

    pub fn history(&self, options: &HistoryOptions) -> Result<String, ClientError> {
        self.request(JupyterChannel::Shell, "history_request", options.content())
    }

    pub fn kernel_info(&self) -> Result<String, ClientError> {
        self.request(JupyterChannel::Shell, "kernel_info_request", json!({}))
    }

    /// Ask which comms are open, optionally only those for one target.
    pub fn comm_info(&self, target_name: Option<&str>) -> Result<String, ClientError> {
        let content = match target_name {
            Some(target_name) => json!({ "target_name": target_name }),
            None => json!({}),
        };
        self.request(JupyterChannel::Shell, "comm_info_request", content)
    }

    /// Ask whether `code` is a complete statement.
    pub fn is_complete(&self, code: &str) -> Result<String, ClientError> {
        self.request(
            JupyterChannel::Shell,
            "is_complete_request",
            json!({ "code": code }),
        )
    }

    /// Answer the kernel's pending `input_request`. No reply is expected.
    pub fn input(&self, value: &str) -> Result<String, ClientError> {
        let message = self.session.message("input_reply", json!({ "value": value }));
        self.connection.send(JupyterChannel::Stdin, &message)?;
        Ok(message.header.msg_id)
    }

    pub fn shutdown(&self, restart: bool) -> Result<String, ClientError> {
        self.request(
            JupyterChannel::Control,
            "shutdown_request",
            json!({ "restart": restart }),
        )
    }

    pub fn interrupt(&self) -> Result<String, ClientError> {
        self.request(JupyterChannel::Control, "interrupt_request", json!({}))
    }

    /// Send a request that expects a reply and track it until the reply is
    /// consumed.
    fn request(
        &self,
        channel: JupyterChannel,
        msg_type: &str,
        content: Value,
    ) -> Result<String, ClientError> {
        let message = self.session.message(msg_type, content);
        self.connection.send(channel, &message)?;
        log::debug!(
            "[session {}] Sent {} ({}) on {}",
            self.session.session_id(),
            msg_type,
            message.header.msg_id,
            channel
        );

        let mut pending = self.lock_pending();
        self.prune_pending(&mut pending);
        pending.insert(
            message.header.msg_id.clone(),
            PendingRequest {
                msg_type: msg_type.to_string(),
                channel,
                sent_at: Instant::now(),
                generation: self.connection.generation(),
            },
        );
        Ok(message.header.msg_id)
    }

    // Replies

    /// Wait for the reply to `msg_id` on `channel`. Messages on that channel
    /// that answer other requests are discarded. `None` uses the configured
    /// default timeout.
    pub async fn recv_reply(
        &self,
        msg_id: &str,
        channel: JupyterChannel,
        timeout: Option<Duration>,
    ) -> Result<JupyterMessage, ClientError> {
        let inbox = self
            .channels
            .get(channel)
            .ok_or(ClientError::ChannelNotReady(channel))?;
        let timeout = timeout.or(self.config.default_timeout);
        let deadline = timeout.map(|limit| Instant::now() + limit);
        let generation = self
            .lock_pending()
            .get(msg_id)
            .map(|request| request.generation)
            .unwrap_or_else(|| self.connection.generation());

        let result = self
            .wait_for_reply(inbox, msg_id, generation, timeout, deadline)
            .await;
        self.lock_pending().remove(msg_id);
        result
    }

    async fn wait_for_reply(
        &self,
        inbox: &Channel,
        msg_id: &str,
        generation: u64,
        timeout: Option<Duration>,
        deadline: Option<Instant>,
    ) -> Result<JupyterMessage, ClientError> {
        loop {
            // Register before looking so a message that lands in between
            // still wakes us
            let listener = self.channels.activity().listen();

            while let Some(message) = inbox.try_get() {
                if message.is_child_of(msg_id) {
                    return Ok(message);
                }
                log::debug!(
                    "[session {}] Discarding {} ({}) on {} while waiting for reply to {}",
                    self.session.session_id(),
                    message.header.msg_type,
                    message.header.msg_id,
                    inbox.kind(),
                    msg_id
                );
            }

            if self.connection_lost(generation) {
                return Err(ClientError::ConnectionLost);
            }
            if !wait_for_activity(listener, deadline).await {
                return Err(ClientError::Timeout(timeout.unwrap_or_default()));
            }
        }
    }

    /// The IDs of requests whose replies have not been consumed. Requests
    /// sent on a connection that has since been lost are forgotten.
    pub fn pending_requests(&self) -> Vec<String> {
        let mut pending = self.lock_pending();
        self.prune_pending(&mut pending);
        let mut ids: Vec<(Instant, String)> = pending
            .iter()
            .map(|(id, request)| (request.sent_at, id.clone()))
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Details of a pending request, if it is still pending
    pub fn pending_request(&self, msg_id: &str) -> Option<PendingRequest> {
        let mut pending = self.lock_pending();
        self.prune_pending(&mut pending);
        pending.get(msg_id).cloned()
    }

    fn prune_pending(&self, pending: &mut HashMap<String, PendingRequest>) {
        let generation = self.connection.generation();
        let before = pending.len();
        pending.retain(|_, request| request.generation == generation);
        if pending.len() < before {
            log::debug!(
                "[session {}] Dropped {} request(s) sent on a lost connection",
                self.session.session_id(),
                before - pending.len()
            );
        }
    }

    fn connection_lost(&self, generation: u64) -> bool {
        !self.connection.is_ready() || self.connection.generation() != generation
    }

    // Higher-level operations

    /// Ask for kernel info until the kernel answers, then discard whatever
    /// IOPub traffic the probes caused.
    pub async fn wait_for_ready(
        &self,
        timeout: Option<Duration>,
    ) -> Result<KernelInfoReply, ClientError> {
        let timeout = timeout.or(self.config.default_timeout);
        let deadline = timeout.map(|limit| Instant::now() + limit);
        let expired = || deadline.is_some_and(|deadline| Instant::now() >= deadline);

        loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            self.connection.wait_ready(remaining).await.map_err(|e| match e {
                ClientError::Timeout(_) => ClientError::Timeout(timeout.unwrap_or_default()),
                other => other,
            })?;

            let msg_id = self.kernel_info()?;
            let wait = match deadline {
                Some(deadline) => {
                    KERNEL_INFO_RETRY.min(deadline.saturating_duration_since(Instant::now()))
                }
                None => KERNEL_INFO_RETRY,
            };
            match self
                .recv_reply(&msg_id, JupyterChannel::Shell, Some(wait))
                .await
            {
                Ok(reply) => {
                    let info = parse_kernel_info(&reply)?;
                    let flushed = self.channels.iopub.drain_all();
                    log::info!(
                        "[session {}] Kernel is ready: {} (protocol {}); flushed {} IOPub message(s)",
                        self.session.session_id(),
                        info.implementation.as_deref().unwrap_or(&info.language_info.name),
                        info.protocol_version,
                        flushed.len()
                    );
                    return Ok(info);
                }
                Err(ClientError::Timeout(_)) if !expired() => {
                    log::debug!(
                        "[session {}] No kernel_info_reply yet; asking again",
                        self.session.session_id()
                    );
                }
                Err(ClientError::Timeout(_)) => {
                    return Err(ClientError::Timeout(timeout.unwrap_or_default()))
                }
                Err(ClientError::ConnectionLost) if !expired() => {
                    // Wait for a reconnect on the next pass
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Evaluate each name in the kernel and store the results. Names whose
    /// evaluation fails are logged and removed from the store. Returns the
    /// number of values stored.
    pub async fn fetch_variables(
        &self,
        names: &[&str],
        store: &mut VariableStore,
        timeout: Option<Duration>,
    ) -> Result<usize, ClientError> {
        let user_expressions: Map<String, Value> = names
            .iter()
            .map(|name| (name.to_string(), Value::String(name.to_string())))
            .collect();
        let options = ExecuteOptions {
            silent: true,
            store_history: false,
            user_expressions,
            allow_stdin: false,
            stop_on_error: false,
        };
        let msg_id = self.execute("", &options)?;
        let reply = self
            .recv_reply(&msg_id, JupyterChannel::Shell, timeout)
            .await?;

        let JupyterMsg::ExecuteReply(reply) = JupyterMsg::from(&reply) else {
            return Err(ClientError::UnexpectedReply {
                msg_type: String::from("execute_request"),
                reason: format!("got {}", reply.header.msg_type),
            });
        };
        if reply.status != "ok" {
            return Err(ClientError::UnexpectedReply {
                msg_type: String::from("execute_request"),
                reason: format!(
                    "status {}: {} {}",
                    reply.status,
                    reply.ename.unwrap_or_default(),
                    reply.evalue.unwrap_or_default()
                ),
            });
        }

        let mut stored = 0;
        for name in names {
            let Some(result) = reply.user_expressions.get(*name) else {
                log::warn!("No result for '{}' in execute_reply", name);
                continue;
            };
            let status = result.get("status").and_then(Value::as_str).unwrap_or("ok");
            if status == "ok" {
                let value = result.get("data").cloned().unwrap_or(Value::Null);
                store.set(*name, value);
                stored += 1;
            } else {
                log::warn!(
                    "Failed to evaluate '{}': {} {}",
                    name,
                    result.get("ename").and_then(Value::as_str).unwrap_or(""),
                    result.get("evalue").and_then(Value::as_str).unwrap_or("")
                );
                let _ = store.delete(name);
            }
        }
        Ok(stored)
    }

    /// Execute code, feeding every IOPub message the execution produces to
    /// `output_hook` and every input request to `stdin_hook`, until the
    /// kernel goes idle; then return the `execute_reply`. The idle status
    /// itself is not passed to the hook. Hooks default to writing to the
    /// console and prompting on the terminal; `options.cancel` cancels the
    /// default prompt.
    pub async fn execute_interactive(
        &self,
        code: &str,
        options: InteractiveOptions,
        output_hook: Option<&mut dyn OutputHook>,
        stdin_hook: Option<&mut dyn StdinHook>,
    ) -> Result<JupyterMessage, ClientError> {
        let allow_stdin = options.execute.allow_stdin;
        if !self.channels.iopub.is_alive() {
            return Err(ClientError::ChannelNotReady(JupyterChannel::IOPub));
        }
        if allow_stdin && !self.channels.stdin.is_alive() {
            return Err(ClientError::ChannelNotReady(JupyterChannel::Stdin));
        }

        let mut console_output = ConsoleOutput::new();
        let output_hook: &mut dyn OutputHook = match output_hook {
            Some(hook) => hook,
            None => &mut console_output,
        };
        let mut console_input = match &options.cancel {
            Some(cancel) => ConsoleInput::with_cancellation(cancel.clone()),
            None => ConsoleInput::new(),
        };
        let stdin_hook: &mut dyn StdinHook = match stdin_hook {
            Some(hook) => hook,
            None => &mut console_input,
        };

        let timeout = options.timeout;
        let deadline = timeout.map(|limit| Instant::now() + limit);

        let stale = self.channels.iopub.drain_all();
        if !stale.is_empty() {
            log::debug!(
                "[session {}] Discarded {} stale IOPub message(s) before executing",
                self.session.session_id(),
                stale.len()
            );
        }

        let generation = self.connection.generation();
        let msg_id = self.execute(code, &options.execute)?;

        let finished = self
            .replay_output(&msg_id, generation, allow_stdin, deadline, output_hook, stdin_hook)
            .await;
        if let Err(e) = finished {
            self.lock_pending().remove(&msg_id);
            return Err(match e {
                ClientError::Timeout(_) => ClientError::Timeout(timeout.unwrap_or_default()),
                other => other,
            });
        }

        // A reply that has already arrived is collected even if the deadline
        // has just passed
        let reply = self
            .wait_for_reply(&self.channels.shell, &msg_id, generation, timeout, deadline)
            .await;
        self.lock_pending().remove(&msg_id);
        reply
    }

    /// Pump IOPub (and stdin, when allowed) until the execution goes idle.
    async fn replay_output(
        &self,
        msg_id: &str,
        generation: u64,
        allow_stdin: bool,
        deadline: Option<Instant>,
        output_hook: &mut dyn OutputHook,
        stdin_hook: &mut dyn StdinHook,
    ) -> Result<(), ClientError> {
        loop {
            if self.connection_lost(generation) {
                log::warn!(
                    "[session {}] Connection lost while executing {}",
                    self.session.session_id(),
                    msg_id
                );
                return Err(ClientError::ConnectionLost);
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(ClientError::Timeout(Duration::ZERO));
            }

            let listener = self.channels.activity().listen();

            if allow_stdin {
                if let Some(request) = self.channels.stdin.try_get() {
                    if request.header.msg_type == "input_request" {
                        stdin_hook.on_input_request(self, request).await?;
                    } else {
                        log::debug!(
                            "[session {}] Ignoring {} on stdin",
                            self.session.session_id(),
                            request.header.msg_type
                        );
                    }
                    continue;
                }
            }

            let Some(message) = self.channels.iopub.try_get() else {
                if !wait_for_activity(listener, deadline).await {
                    return Err(ClientError::Timeout(Duration::ZERO));
                }
                continue;
            };

            if !message.is_child_of(msg_id) {
                log::debug!(
                    "[session {}] Skipping {} message (parent {:?}); not from execution {}",
                    self.session.session_id(),
                    message.header.msg_type,
                    message.parent_id(),
                    msg_id
                );
                continue;
            }

            // The idle status ends the execution and is not output
            if jupyter_messages::is_idle(&message) {
                return Ok(());
            }
            output_hook.on_output(&message);
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_heartbeat(&self) -> std::sync::MutexGuard<'_, Option<HeartbeatMonitor>> {
        self.heartbeat.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn parse_kernel_info(reply: &JupyterMessage) -> Result<KernelInfoReply, ClientError> {
    match JupyterMsg::from(reply) {
        JupyterMsg::KernelInfoReply(info) => Ok(*info),
        _ => Err(ClientError::UnexpectedReply {
            msg_type: String::from("kernel_info_request"),
            reason: format!("could not parse {} content", reply.header.msg_type),
        }),
    }
}

/// Wait for the listener to fire. Returns false if the deadline passed first.
async fn wait_for_activity(listener: EventListener, deadline: Option<Instant>) -> bool {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, listener).await.is_ok(),
        None => {
            listener.await;
            true
        }
    }
}
