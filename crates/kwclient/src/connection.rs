//
// connection.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
// Licensed under the Elastic License 2.0. See LICENSE.txt for license information.
//
//

//! The single websocket connection to a kernel.
//!
//! A background task exclusively owns the socket. It reads frames, decodes
//! them, and routes each message to the inbox of the channel named in the
//! frame. Everything else talks to the task through its outbound queue and
//! observes it through the connection state, the activity signal, and a few
//! flags.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_channel::{Receiver, Sender};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use kwshared::jupyter_message::{JupyterChannel, JupyterMessage};
use kwshared::protocol_version::WEBSOCKET_SUBPROTOCOL;
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::channel::Channels;
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::wire_message::WireMessage;

/// How long `close` waits for the I/O task to finish
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

type KernelSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Lifecycle of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Ready => write!(f, "ready"),
            ConnectionState::Closing => write!(f, "closing"),
        }
    }
}

/// Work queued for the I/O task.
enum Outbound {
    /// An encoded message frame
    Frame(Vec<u8>),

    /// A websocket ping carrying the given payload
    Ping(Vec<u8>),

    /// Close the socket and stop
    Close,
}

/// Why the I/O loop stopped.
#[derive(Debug, PartialEq)]
enum PumpExit {
    /// We closed the socket
    Closed,

    /// The kernel side closed the socket
    PeerClosed,

    /// Reading or writing failed
    Failed,
}

/// State shared between the manager and its I/O task.
struct Shared {
    session_id: String,
    channels: Arc<Channels>,
    state: watch::Sender<ConnectionState>,
    generation: AtomicU64,
    alive: AtomicBool,
    shutting_down: AtomicBool,
    gave_up: AtomicBool,
    last_error: Mutex<Option<String>>,
    outbound: Mutex<Option<Sender<Outbound>>>,
    shutdown: Mutex<CancellationToken>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            log::debug!(
                "[session {}] connection '{}' => '{}'",
                self.session_id,
                previous,
                state
            );
        }
    }

    fn outbound(&self) -> Option<Sender<Outbound>> {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_outbound(&self, sender: Option<Sender<Outbound>>) {
        *self.outbound.lock().unwrap_or_else(PoisonError::into_inner) = sender;
    }

    fn shutdown_token(&self) -> CancellationToken {
        self.shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record_error(&self, error: String) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
    }

    /// Decode an inbound frame and deliver it to its channel. Frames that
    /// cannot be decoded are logged and dropped.
    fn dispatch(&self, frame: Bytes) {
        let (channel, wire_message) = match WireMessage::from_ws_frame(frame) {
            Ok(unwrapped) => unwrapped,
            Err(e) => {
                log::error!(
                    "[session {}] Dropping undecodable frame: {}",
                    self.session_id,
                    e
                );
                return;
            }
        };
        let message = match wire_message.to_jupyter(true) {
            Ok(message) => message,
            Err(e) => {
                log::error!(
                    "[session {}] Dropping {} message: {}",
                    self.session_id,
                    channel,
                    e
                );
                return;
            }
        };
        log::trace!(
            "[session {}] Got {} message {} on {}",
            self.session_id,
            message.header.msg_type,
            message.header.msg_id,
            channel
        );
        if !self.channels.route(channel, message) {
            log::warn!(
                "[session {}] Ignoring message on the {} channel, which carries no messages",
                self.session_id,
                channel
            );
        }
    }
}

/// Owns the websocket connection to the kernel.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    config: ClientConfig,
    state_rx: watch::Receiver<ConnectionState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Create a disconnected manager delivering into `channels`.
    pub fn new(session_id: String, config: ClientConfig, channels: Arc<Channels>) -> Self {
        let (state, state_rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                session_id,
                channels,
                state,
                generation: AtomicU64::new(0),
                alive: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                gave_up: AtomicBool::new(false),
                last_error: Mutex::new(None),
                outbound: Mutex::new(None),
                shutdown: Mutex::new(CancellationToken::new()),
            }),
            config,
            state_rx,
            task: Mutex::new(None),
        }
    }

    /// Open the connection in the background. Returns once the I/O task is
    /// running; use `wait_ready` to wait for the handshake. Handshake failures
    /// are retried with backoff and logged; once retries are exhausted the
    /// state settles at `Disconnected`.
    pub fn connect(&self, endpoint: &str, token: Option<&str>) -> Result<(), ClientError> {
        let url = channel_url(endpoint, token)?;

        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(running) = task.as_ref() {
            if !running.is_finished() {
                log::warn!(
                    "[session {}] Ignoring connect request; connection is {}",
                    self.shared.session_id,
                    self.state()
                );
                return Ok(());
            }
        }

        self.shared.shutting_down.store(false, Ordering::SeqCst);
        self.shared.gave_up.store(false, Ordering::SeqCst);
        *self
            .shared
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        let shutdown = CancellationToken::new();
        *self
            .shared
            .shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = shutdown.clone();
        self.shared.set_state(ConnectionState::Connecting);

        log::info!(
            "[session {}] Connecting to {}",
            self.shared.session_id,
            redact_token(&url)
        );
        *task = Some(tokio::spawn(run_connection(
            self.shared.clone(),
            url,
            self.config.clone(),
            shutdown,
        )));
        Ok(())
    }

    /// Wait until the connection is ready, for at most `timeout`.
    pub async fn wait_ready(&self, timeout: Option<Duration>) -> Result<(), ClientError> {
        let mut state_rx = self.state_rx.clone();
        let gave_up = &self.shared.gave_up;
        let wait = state_rx.wait_for(|state| {
            *state == ConnectionState::Ready
                || (*state == ConnectionState::Disconnected && gave_up.load(Ordering::SeqCst))
        });
        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(result) => result.map(|state| *state),
                Err(_) => return Err(ClientError::Timeout(limit)),
            },
            None => wait.await.map(|state| *state),
        };
        match result {
            Ok(ConnectionState::Ready) => Ok(()),
            Ok(_) => Err(ClientError::Handshake {
                endpoint: self.config.endpoint.clone(),
                reason: self
                    .shared
                    .last_error
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone()
                    .unwrap_or_else(|| String::from("connection closed")),
            }),
            Err(_) => Err(ClientError::ConnectionLost),
        }
    }

    /// Send a message on a channel. Fails immediately if the socket is not
    /// open.
    pub fn send(&self, channel: JupyterChannel, message: &JupyterMessage) -> Result<(), ClientError> {
        if !self.is_ready() {
            return Err(ClientError::NotConnected);
        }
        let frame = WireMessage::from_jupyter(message)?.to_ws_frame(channel);
        let outbound = self.shared.outbound().ok_or(ClientError::NotConnected)?;
        outbound
            .try_send(Outbound::Frame(frame))
            .map_err(|_| ClientError::NotConnected)?;
        log::trace!(
            "[session {}] Queued {} message {} for {}",
            self.shared.session_id,
            message.header.msg_type,
            message.header.msg_id,
            channel
        );
        Ok(())
    }

    /// Send a websocket ping; the pong payload arrives on the heartbeat
    /// channel.
    pub fn ping(&self, payload: Vec<u8>) -> Result<(), ClientError> {
        if !self.is_ready() {
            return Err(ClientError::NotConnected);
        }
        let outbound = self.shared.outbound().ok_or(ClientError::NotConnected)?;
        outbound
            .try_send(Outbound::Ping(payload))
            .map_err(|_| ClientError::NotConnected)
    }

    /// Close the connection. Safe to call more than once; only the first call
    /// does anything.
    pub async fn close(&self) {
        if self.shared.shutting_down.swap(true, Ordering::SeqCst) {
            log::debug!(
                "[session {}] Connection already closing",
                self.shared.session_id
            );
            return;
        }

        if self.state() != ConnectionState::Disconnected {
            self.shared.set_state(ConnectionState::Closing);
        }
        self.shared.channels.stop_all();

        if let Some(outbound) = self.shared.outbound() {
            let _ = outbound.try_send(Outbound::Close);
        }
        self.shared.shutdown_token().cancel();

        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            match tokio::time::timeout(CLOSE_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    log::error!(
                        "[session {}] Connection task failed: {}",
                        self.shared.session_id,
                        e
                    );
                }
                Err(_) => {
                    log::warn!(
                        "[session {}] Connection task did not stop within {:?}",
                        self.shared.session_id,
                        CLOSE_TIMEOUT
                    );
                }
            }
        }
        self.shared.set_state(ConnectionState::Disconnected);
        self.shared.channels.notify_activity();
        log::info!("[session {}] Connection closed", self.shared.session_id);
    }

    /// The current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Whether the socket is open and the handshake completed
    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Watch connection state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Counts established connections; changes every time the socket is lost,
    /// so an operation can tell that the socket it started on went away even
    /// if a new one has since been opened.
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::SeqCst)
    }

    /// Whether the kernel is answering heartbeats
    pub fn is_alive(&self) -> bool {
        self.is_ready() && self.shared.alive.load(Ordering::SeqCst)
    }

    pub(crate) fn set_alive(&self, alive: bool) {
        self.shared.alive.store(alive, Ordering::SeqCst);
    }

    /// Whether `close` has been called
    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutting_down.load(Ordering::SeqCst)
    }

    pub fn channels(&self) -> &Arc<Channels> {
        &self.shared.channels
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        // Ask the task to close the socket unless `close` already did.
        if !self.shared.shutting_down.swap(true, Ordering::SeqCst) {
            self.shared.shutdown_token().cancel();
        }
    }
}

/// Form the websocket URL for an endpoint, adding the token as a query
/// parameter. HTTP URLs are converted to their websocket equivalents.
pub fn channel_url(endpoint: &str, token: Option<&str>) -> Result<Url, ClientError> {
    let invalid = |reason: String| ClientError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason,
    };
    let mut url = Url::parse(endpoint).map_err(|e| invalid(e.to_string()))?;
    let scheme = match url.scheme() {
        "ws" | "wss" => None,
        "http" => Some("ws"),
        "https" => Some("wss"),
        other => return Err(invalid(format!("unsupported scheme '{}'", other))),
    };
    if let Some(scheme) = scheme {
        url.set_scheme(scheme)
            .map_err(|_| invalid(format!("cannot use scheme '{}'", scheme)))?;
    }
    if let Some(token) = token {
        url.query_pairs_mut().append_pair("token", token);
    }
    Ok(url)
}

fn redact_token(url: &Url) -> String {
    let mut redacted = url.clone();
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(key, value)| {
            if key == "token" {
                (key.into_owned(), String::from("<redacted>"))
            } else {
                (key.into_owned(), value.into_owned())
            }
        })
        .collect();
    if pairs.is_empty() {
        return redacted.to_string();
    }
    redacted.query_pairs_mut().clear().extend_pairs(pairs);
    redacted.to_string()
}

/// Spread reconnect attempts from many clients by up to 20% either way.
fn with_jitter(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.8..1.2);
    delay.mul_f64(factor)
}

async fn open_socket(url: &Url, timeout: Duration) -> Result<KernelSocket, String> {
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| e.to_string())?;
    request.headers_mut().insert(
        SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static(WEBSOCKET_SUBPROTOCOL),
    );
    match tokio::time::timeout(timeout, connect_async(request)).await {
        Ok(Ok((socket, response))) => {
            log::debug!("Websocket handshake completed ({})", response.status());
            Ok(socket)
        }
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("no handshake within {:?}", timeout)),
    }
}

/// Body of the I/O task: connect, pump frames until the socket goes away,
/// and reconnect with backoff until retries run out or the connection is
/// closed.
async fn run_connection(
    shared: Arc<Shared>,
    url: Url,
    config: ClientConfig,
    shutdown: CancellationToken,
) {
    let session_id = shared.session_id.clone();
    let mut attempt: u32 = 0;

    loop {
        if shutdown.is_cancelled() {
            break;
        }
        shared.set_state(ConnectionState::Connecting);

        let opened = select! {
            opened = open_socket(&url, config.connect_timeout) => opened,
            _ = shutdown.cancelled() => break,
        };

        match opened {
            Ok(socket) => {
                attempt = 0;
                let (outbound_tx, outbound_rx) = async_channel::unbounded::<Outbound>();
                shared.set_outbound(Some(outbound_tx));
                shared.alive.store(true, Ordering::SeqCst);
                shared.channels.start_all();
                shared.set_state(ConnectionState::Ready);
                shared.channels.notify_activity();
                log::info!("[session {}] Connected to kernel", session_id);

                let exit = pump(&shared, socket, outbound_rx, &shutdown).await;

                shared.set_outbound(None);
                shared.alive.store(false, Ordering::SeqCst);
                shared.generation.fetch_add(1, Ordering::SeqCst);
                if exit == PumpExit::Closed || shutdown.is_cancelled() {
                    break;
                }
                shared.set_state(ConnectionState::Disconnected);
                shared.channels.notify_activity();
                log::warn!("[session {}] Lost connection to kernel", session_id);
            }
            Err(e) => {
                log::error!(
                    "[session {}] Failed to connect to kernel: {}",
                    session_id,
                    e
                );
                shared.record_error(e);
            }
        }

        if attempt >= config.reconnect_attempts {
            log::error!(
                "[session {}] Giving up after {} reconnect attempt(s)",
                session_id,
                attempt
            );
            shared.gave_up.store(true, Ordering::SeqCst);
            shared.set_state(ConnectionState::Disconnected);
            shared.channels.notify_activity();
            return;
        }

        let delay = with_jitter(config.reconnect_delay(attempt));
        attempt += 1;
        log::info!(
            "[session {}] Reconnecting in {:?} (attempt {} of {})",
            session_id,
            delay,
            attempt,
            config.reconnect_attempts
        );
        select! {
            _ = tokio::time::sleep(delay) => {},
            _ = shutdown.cancelled() => break,
        }
    }

    shared.set_state(ConnectionState::Disconnected);
    shared.channels.notify_activity();
}

/// Move frames between the socket and the channels until the socket closes.
async fn pump(
    shared: &Shared,
    socket: KernelSocket,
    outbound: Receiver<Outbound>,
    shutdown: &CancellationToken,
) -> PumpExit {
    let session_id = shared.session_id.as_str();
    let (mut write, mut read) = socket.split();

    loop {
        select! {
            from_socket = read.next() => {
                let message = match from_socket {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        log::error!("[session {}] Failed to read from websocket: {}", session_id, e);
                        return PumpExit::Failed;
                    }
                    None => {
                        log::info!("[session {}] Websocket stream ended", session_id);
                        return PumpExit::PeerClosed;
                    }
                };
                match message {
                    Message::Binary(data) => shared.dispatch(Bytes::from(data)),
                    Message::Text(text) => {
                        log::warn!(
                            "[session {}] Ignoring text frame ({} bytes); expected binary framing",
                            session_id,
                            text.len()
                        );
                    }
                    Message::Pong(data) => shared.channels.heartbeat.push(Bytes::from(data)),
                    Message::Ping(data) => {
                        // Tungstenite answers pings itself
                        log::trace!("[session {}] Got ping ({} bytes)", session_id, data.len());
                    }
                    Message::Close(frame) => {
                        log::info!("[session {}] Websocket closed by kernel: {:?}", session_id, frame);
                        return PumpExit::PeerClosed;
                    }
                    Message::Frame(_) => {}
                }
            },
            item = outbound.recv() => {
                match item {
                    Ok(Outbound::Frame(frame)) => {
                        if let Err(e) = write.send(Message::Binary(frame)).await {
                            log::error!("[session {}] Failed to write to websocket: {}", session_id, e);
                            return PumpExit::Failed;
                        }
                    }
                    Ok(Outbound::Ping(payload)) => {
                        if let Err(e) = write.send(Message::Ping(payload)).await {
                            log::error!("[session {}] Failed to send ping: {}", session_id, e);
                            return PumpExit::Failed;
                        }
                    }
                    Ok(Outbound::Close) | Err(_) => {
                        let _ = write.send(Message::Close(None)).await;
                        let _ = write.close().await;
                        return PumpExit::Closed;
                    }
                }
            },
            _ = shutdown.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                let _ = write.close().await;
                return PumpExit::Closed;
            }
        }
    }
}
