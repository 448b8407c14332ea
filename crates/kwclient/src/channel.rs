//
// channel.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
// Licensed under the Elastic License 2.0. See LICENSE.txt for license information.
//
//

//! Logical channels multiplexed over the kernel connection. Each channel owns
//! an unbounded inbox that the connection's I/O task fills and callers drain.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_channel::{Receiver, Sender};
use bytes::Bytes;
use event_listener::Event;
use kwshared::jupyter_message::{JupyterChannel, JupyterMessage};
use tokio::time::Instant;

use crate::error::ClientError;

/// Something that can sit in a channel inbox.
pub trait InboxItem: Send + 'static {
    /// A short description used in diagnostics
    fn describe(&self) -> String;

    /// Whether the item marks the end of the kernel's life, after which
    /// unconsumed messages are expected
    fn is_terminal(&self) -> bool;
}

impl InboxItem for JupyterMessage {
    fn describe(&self) -> String {
        self.header.msg_type.clone()
    }

    fn is_terminal(&self) -> bool {
        self.header.msg_type == "shutdown_reply"
    }
}

impl InboxItem for Bytes {
    fn describe(&self) -> String {
        format!("pong ({} bytes)", self.len())
    }

    fn is_terminal(&self) -> bool {
        false
    }
}

/// A named logical queue.
pub struct Channel<T = JupyterMessage> {
    kind: JupyterChannel,
    tx: Sender<T>,
    rx: Receiver<T>,

    /// Items moved out of `rx` to be inspected; always older than anything
    /// still in `rx`, so they are handed out first
    held: Mutex<VecDeque<T>>,

    alive: AtomicBool,
    activity: Arc<Event>,
}

impl<T: InboxItem> Channel<T> {
    /// Create a stopped channel. `activity` is notified every time an item is
    /// pushed.
    pub fn new(kind: JupyterChannel, activity: Arc<Event>) -> Self {
        let (tx, rx) = async_channel::unbounded::<T>();
        Self {
            kind,
            tx,
            rx,
            held: Mutex::new(VecDeque::new()),
            alive: AtomicBool::new(false),
            activity,
        }
    }

    /// Which channel this is
    pub fn kind(&self) -> JupyterChannel {
        self.kind
    }

    /// Add an item to the inbox. Never blocks and never drops.
    pub fn push(&self, item: T) {
        // The channel holds its own receiver, so the sender can never observe
        // a closed channel; an unbounded channel is never full.
        if let Err(e) = self.tx.try_send(item) {
            log::error!("Failed to queue message on {} channel: {}", self.kind, e);
            return;
        }
        self.activity.notify(usize::MAX);
    }

    /// Wait for the next item, for at most `timeout` (forever if `None`).
    pub async fn get(&self, timeout: Option<Duration>) -> Result<T, ClientError> {
        let deadline = timeout.map(|limit| Instant::now() + limit);
        loop {
            let listener = self.activity.listen();
            if let Some(item) = self.try_get() {
                return Ok(item);
            }
            match (deadline, timeout) {
                (Some(deadline), Some(limit)) => {
                    if tokio::time::timeout_at(deadline, listener).await.is_err() {
                        return Err(ClientError::Timeout(limit));
                    }
                }
                _ => listener.await,
            }
        }
    }

    /// Take the next item if one is queued.
    pub fn try_get(&self) -> Option<T> {
        let mut held = self.lock_held();
        match held.pop_front() {
            Some(item) => Some(item),
            None => self.rx.try_recv().ok(),
        }
    }

    /// Remove and return everything currently queued, in arrival order.
    pub fn drain_all(&self) -> Vec<T> {
        let mut held = self.lock_held();
        let mut items: Vec<T> = held.drain(..).collect();
        while let Ok(item) = self.rx.try_recv() {
            items.push(item);
        }
        items
    }

    /// Whether any queued item satisfies `predicate`. Nothing is removed and
    /// the order is kept.
    pub fn any(&self, predicate: impl Fn(&T) -> bool) -> bool {
        let mut held = self.lock_held();
        while let Ok(item) = self.rx.try_recv() {
            held.push_back(item);
        }
        held.iter().any(predicate)
    }

    /// Whether any items are waiting
    pub fn has_pending(&self) -> bool {
        !self.is_empty()
    }

    /// The number of items waiting
    pub fn len(&self) -> usize {
        let held = self.lock_held();
        held.len() + self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark the channel as running.
    pub fn start(&self) {
        self.alive.store(true, Ordering::SeqCst);
    }

    /// Whether the channel is running
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Mark the channel as stopped. Queued items stay queued; if any remain
    /// and none of them is terminal, a warning lists what was never consumed.
    pub fn stop(&self) {
        self.alive.store(false, Ordering::SeqCst);

        let mut held = self.lock_held();
        while let Ok(item) = self.rx.try_recv() {
            held.push_back(item);
        }
        if held.is_empty() || held.iter().any(InboxItem::is_terminal) {
            return;
        }
        let kinds: Vec<String> = held.iter().map(InboxItem::describe).collect();
        log::warn!(
            "Stopping {} channel with {} unconsumed message(s): {}",
            self.kind,
            kinds.len(),
            kinds.join(", ")
        );
    }

    fn lock_held(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The inboxes of every channel on one connection.
pub struct Channels {
    pub shell: Channel,
    pub iopub: Channel,
    pub stdin: Channel,
    pub control: Channel,
    pub heartbeat: Channel<Bytes>,
    activity: Arc<Event>,
}

impl Channels {
    pub fn new() -> Self {
        let activity = Arc::new(Event::new());
        Self {
            shell: Channel::new(JupyterChannel::Shell, activity.clone()),
            iopub: Channel::new(JupyterChannel::IOPub, activity.clone()),
            stdin: Channel::new(JupyterChannel::Stdin, activity.clone()),
            control: Channel::new(JupyterChannel::Control, activity.clone()),
            heartbeat: Channel::new(JupyterChannel::Heartbeat, activity.clone()),
            activity,
        }
    }

    /// Look up the inbox for a message channel. The heartbeat channel carries
    /// pong payloads rather than messages, so it has no message inbox.
    pub fn get(&self, channel: JupyterChannel) -> Option<&Channel> {
        match channel {
            JupyterChannel::Shell => Some(&self.shell),
            JupyterChannel::IOPub => Some(&self.iopub),
            JupyterChannel::Stdin => Some(&self.stdin),
            JupyterChannel::Control => Some(&self.control),
            JupyterChannel::Heartbeat => None,
        }
    }

    /// Deliver an inbound message to the inbox of the channel it arrived on.
    /// Returns false if the channel has no message inbox.
    pub fn route(&self, channel: JupyterChannel, message: JupyterMessage) -> bool {
        match self.get(channel) {
            Some(inbox) => {
                inbox.push(message);
                true
            }
            None => false,
        }
    }

    /// The signal raised whenever anything arrives or the connection changes
    pub fn activity(&self) -> &Arc<Event> {
        &self.activity
    }

    /// Wake everyone waiting for activity.
    pub fn notify_activity(&self) {
        self.activity.notify(usize::MAX);
    }

    pub fn start_all(&self) {
        for channel in [&self.shell, &self.iopub, &self.stdin, &self.control] {
            channel.start();
        }
        self.heartbeat.start();
    }

    pub fn stop_all(&self) {
        for channel in [&self.shell, &self.iopub, &self.stdin, &self.control] {
            channel.stop();
        }
        self.heartbeat.stop();
        self.notify_activity();
    }
}

impl Default for Channels {
    fn default() -> Self {
        Self::new()
    }
}
