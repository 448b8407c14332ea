//
// mod.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

//! An in-process kernel that speaks the websocket v1 protocol, for tests.

#![allow(dead_code)]

pub mod kernel;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use kwclient::wire_message::WireMessage;
use kwclient::wire_message_header::new_header;
use kwclient::ClientConfig;
use kwshared::jupyter_message::{JupyterChannel, JupyterMessage};
use kwshared::protocol_version::WEBSOCKET_SUBPROTOCOL;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

/// Computes the messages the kernel sends in response to one it received.
pub type Responder =
    Arc<dyn Fn(JupyterChannel, &JupyterMessage) -> Vec<(JupyterChannel, JupyterMessage)> + Send + Sync>;

/// Things a test can make the kernel do.
#[derive(Debug)]
pub enum Command {
    /// Send a message
    Send(JupyterChannel, JupyterMessage),

    /// Send arbitrary bytes as a binary frame
    Raw(Vec<u8>),

    /// Send a text frame
    Text(String),

    /// Stop reading from the socket (and so stop answering pings)
    Freeze,

    /// Drop the socket without a close handshake
    Drop,
}

pub struct MockKernel {
    addr: SocketAddr,
    session_id: String,
    received: async_channel::Receiver<(JupyterChannel, JupyterMessage)>,
    commands: async_channel::Sender<Command>,
    connections: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<(String, Option<String>)>>>,
    task: JoinHandle<()>,
}

impl MockKernel {
    /// Start a kernel that answers every message with `responder`.
    pub async fn start(responder: Responder) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock kernel");
        let addr = listener.local_addr().expect("No local address");

        let (received_tx, received) = async_channel::unbounded();
        let (commands, commands_rx) = async_channel::unbounded();
        let connections = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));

        let task = {
            let connections = connections.clone();
            let closes = closes.clone();
            let requests = requests.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(
                        stream,
                        responder.clone(),
                        received_tx.clone(),
                        commands_rx.clone(),
                        closes.clone(),
                        requests.clone(),
                    ));
                }
            })
        };

        Self {
            addr,
            session_id: Uuid::new_v4().to_string(),
            received,
            commands,
            connections,
            closes,
            requests,
            task,
        }
    }

    /// Start a kernel that never answers anything.
    pub async fn silent() -> Self {
        Self::start(Arc::new(no_replies)).await
    }

    pub fn url(&self) -> String {
        format!("ws://{}/api/kernels/mock/channels", self.addr)
    }

    /// A client configuration for this kernel with short timeouts and no
    /// reconnects.
    pub fn config(&self) -> ClientConfig {
        let mut config = ClientConfig::new(self.url(), Some(String::from("secret")));
        config.connect_timeout = Duration::from_secs(5);
        config.default_timeout = Some(Duration::from_secs(5));
        config.reconnect_attempts = 0;
        config
    }

    /// The next message the client sent, with the channel it arrived on.
    pub async fn next_received(&self) -> (JupyterChannel, JupyterMessage) {
        tokio::time::timeout(Duration::from_secs(5), self.received.recv())
            .await
            .expect("Timed out waiting for a client message")
            .expect("Mock kernel stopped")
    }

    /// The next message of the given type the client sent.
    pub async fn next_received_of_type(&self, msg_type: &str) -> (JupyterChannel, JupyterMessage) {
        loop {
            let (channel, message) = self.next_received().await;
            if message.header.msg_type == msg_type {
                return (channel, message);
            }
        }
    }

    pub fn command(&self, command: Command) {
        self.commands
            .try_send(command)
            .expect("Failed to queue mock kernel command");
    }

    pub fn send(&self, channel: JupyterChannel, message: JupyterMessage) {
        self.command(Command::Send(channel, message));
    }

    /// Build a message from the kernel, optionally in reply to `parent`.
    pub fn message(
        &self,
        parent: Option<&JupyterMessage>,
        msg_type: &str,
        content: Value,
    ) -> JupyterMessage {
        kernel_message(&self.session_id, parent, msg_type, content)
    }

    /// The number of websocket connections accepted so far
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// The number of close frames received so far
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// The query string and requested subprotocol of each handshake
    pub fn handshakes(&self) -> Vec<(String, Option<String>)> {
        self.requests.lock().expect("Poisoned").clone()
    }
}

impl Drop for MockKernel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn no_replies(_: JupyterChannel, _: &JupyterMessage) -> Vec<(JupyterChannel, JupyterMessage)> {
    Vec::new()
}

/// Build a message from a kernel session, optionally in reply to `parent`.
pub fn kernel_message(
    session_id: &str,
    parent: Option<&JupyterMessage>,
    msg_type: &str,
    content: Value,
) -> JupyterMessage {
    let header = new_header(Uuid::new_v4().to_string(), msg_type, session_id, "kernel");
    let mut message = JupyterMessage::new(header, content);
    message.parent_header = parent.map(|parent| parent.header.clone());
    message
}

async fn serve(
    stream: TcpStream,
    responder: Responder,
    received: async_channel::Sender<(JupyterChannel, JupyterMessage)>,
    commands: async_channel::Receiver<Command>,
    closes: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<(String, Option<String>)>>>,
) {
    let record = requests.clone();
    let callback = move |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        let protocol = request
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|value| value.to_str().ok())
            .map(String::from);
        let query = request.uri().query().unwrap_or_default().to_string();
        record.lock().expect("Poisoned").push((query, protocol));
        response.headers_mut().insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(WEBSOCKET_SUBPROTOCOL),
        );
        Ok(response)
    };
    let socket = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(socket) => socket,
        Err(_) => return,
    };
    let (mut write, mut read) = socket.split();
    let mut frozen = false;

    loop {
        tokio::select! {
            frame = read.next(), if !frozen => {
                let data = match frame {
                    Some(Ok(Message::Binary(data))) => data,
                    Some(Ok(Message::Close(_))) => {
                        closes.fetch_add(1, Ordering::SeqCst);
                        return;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(_)) | None => return,
                };
                let Ok((channel, wire)) = WireMessage::from_ws_frame(bytes::Bytes::from(data)) else {
                    continue;
                };
                let Ok(message) = wire.to_jupyter(true) else {
                    continue;
                };
                let replies = responder(channel, &message);
                let _ = received.send((channel, message)).await;
                for (channel, reply) in replies {
                    if send_message(&mut write, channel, &reply).await.is_err() {
                        return;
                    }
                }
            }
            command = commands.recv() => {
                let result = match command {
                    Ok(Command::Send(channel, message)) => {
                        send_message(&mut write, channel, &message).await
                    }
                    Ok(Command::Raw(frame)) => write.send(Message::Binary(frame)).await,
                    Ok(Command::Text(text)) => write.send(Message::Text(text)).await,
                    Ok(Command::Freeze) => {
                        frozen = true;
                        Ok(())
                    }
                    Ok(Command::Drop) | Err(_) => return,
                };
                if result.is_err() {
                    return;
                }
            }
        }
    }
}

async fn send_message<S>(
    write: &mut S,
    channel: JupyterChannel,
    message: &JupyterMessage,
) -> Result<(), tokio_tungstenite::tungstenite::Error>
where
    S: futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let frame = WireMessage::from_jupyter(message)
        .expect("Mock kernel built an unencodable message")
        .to_ws_frame(channel);
    write.send(Message::Binary(frame)).await
}
