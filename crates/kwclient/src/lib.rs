//! A client for interactive Jupyter kernels reached through a websocket
//! endpoint: message codec, channel multiplexing, request/reply correlation,
//! and interactive execution with output and input hooks.

#![allow(missing_docs)]

pub mod adapt;
pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod heartbeat;
pub mod hooks;
pub mod jupyter_messages;
pub mod kernel_client;
pub mod session;
pub mod store;
pub mod wire_message;
pub mod wire_message_header;

pub use config::ClientConfig;
pub use error::{ClientError, CodecError};
pub use kernel_client::{ExecuteOptions, InteractiveOptions, KernelClient};
