//
// heartbeat.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
// Licensed under the Elastic License 2.0. See LICENSE.txt for license information.
//
//

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::connection::ConnectionManager;
use crate::error::ClientError;

/// Probes the kernel with websocket pings and tracks whether it answers.
pub struct HeartbeatMonitor {
    connection: Arc<ConnectionManager>,
    session_id: String,
    interval: Duration,
    timeout: Duration,
    exit: CancellationToken,
}

/// A heartbeat monitor for a kernel connection.
impl HeartbeatMonitor {
    /// Create a new heartbeat monitor.
    ///
    /// # Arguments
    ///
    /// - `connection`: The connection to probe.
    /// - `session_id`: The ID of the session, for logging.
    /// - `interval`: How long to wait between probes.
    /// - `timeout`: How long to wait for each probe to be answered.
    pub fn new(
        connection: Arc<ConnectionManager>,
        session_id: String,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            connection,
            session_id,
            interval,
            timeout,
            exit: CancellationToken::new(),
        }
    }

    /// Stop the monitor. It finishes at its next await point.
    pub fn stop(&self) {
        self.exit.cancel();
    }

    /// Monitor the kernel's heartbeat. Returns immediately and runs the monitor
    /// job in the background.
    pub fn monitor(&self) -> JoinHandle<()> {
        let connection = self.connection.clone();
        let session_id = self.session_id.clone();
        let exit = self.exit.clone();
        let interval = self.interval;
        let timeout = self.timeout;

        tokio::spawn(async move {
            let mut offline = false;
            let mut initial = true;
            let mut counter: u64 = 0;

            loop {
                if Self::should_stop_monitor(&connection, &exit, &session_id) {
                    return;
                }

                if connection.is_ready() {
                    counter += 1;
                    log::trace!("[session {}] Sending heartbeat {}.", session_id, counter);
                    match connection.ping(counter.to_be_bytes().to_vec()) {
                        Ok(()) => {
                            let should_continue = Self::handle_heartbeat_response(
                                &connection,
                                &exit,
                                &session_id,
                                counter,
                                timeout,
                                &mut offline,
                                &mut initial,
                            )
                            .await;
                            if !should_continue {
                                return;
                            }
                        }
                        Err(e) => {
                            log::debug!(
                                "[session {}] Could not send heartbeat: {}",
                                session_id,
                                e
                            );
                        }
                    }
                }

                if Self::wait_or_exit(&exit, &session_id, interval).await {
                    return;
                }
            }
        })
    }

    fn should_stop_monitor(
        connection: &ConnectionManager,
        exit: &CancellationToken,
        session_id: &str,
    ) -> bool {
        if exit.is_cancelled() || connection.is_shutting_down() {
            log::debug!(
                "[session {}] Stopping heartbeat monitor (connection closed).",
                session_id
            );
            true
        } else {
            false
        }
    }

    /// Wait for the pong matching `counter`, or the exit signal
    async fn handle_heartbeat_response(
        connection: &ConnectionManager,
        exit: &CancellationToken,
        session_id: &str,
        counter: u64,
        timeout: Duration,
        offline: &mut bool,
        initial: &mut bool,
    ) -> bool {
        tokio::select! {
            _ = exit.cancelled() => {
                log::debug!(
                    "[session {}] Stopping heartbeat monitor (exit signaled).",
                    session_id
                );
                false
            }
            result = Self::wait_for_pong(connection, counter, timeout) => {
                Self::process_heartbeat_result(result, connection, session_id, offline, initial);
                true
            }
        }
    }

    async fn wait_for_pong(
        connection: &ConnectionManager,
        counter: u64,
        timeout: Duration,
    ) -> Result<(), ClientError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let expected = counter.to_be_bytes();
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(ClientError::Timeout(timeout));
            }
            let pong = connection.channels().heartbeat.get(Some(remaining)).await?;
            if pong[..] == expected[..] {
                return Ok(());
            }
            // A late answer to an earlier probe
            log::trace!("Discarding stale pong ({} bytes)", pong.len());
        }
    }

    fn process_heartbeat_result(
        result: Result<(), ClientError>,
        connection: &ConnectionManager,
        session_id: &str,
        offline: &mut bool,
        initial: &mut bool,
    ) {
        match result {
            Ok(()) => {
                if *offline {
                    log::info!(
                        "[session {}] Kernel is answering heartbeats again.",
                        session_id
                    );
                    *offline = false;
                } else if *initial {
                    log::debug!("[session {}] Received initial heartbeat.", session_id);
                }
                *initial = false;
                connection.set_alive(true);
            }
            Err(ClientError::Timeout(limit)) => {
                if !*offline {
                    log::error!(
                        "[session {}] Kernel did not answer heartbeat within {:?}; marking it offline.",
                        session_id,
                        limit
                    );
                    *offline = true;
                }
                connection.set_alive(false);
            }
            Err(e) => {
                log::debug!("[session {}] Heartbeat failed: {}", session_id, e);
            }
        }
    }

    /// Wait before the next probe. Returns true if the monitor should exit.
    async fn wait_or_exit(exit: &CancellationToken, session_id: &str, interval: Duration) -> bool {
        tokio::select! {
            _ = exit.cancelled() => {
                log::debug!(
                    "[session {}] Stopping heartbeat monitor (exit signaled).",
                    session_id
                );
                true
            }
            _ = tokio::time::sleep(interval) => false,
        }
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.exit.cancel();
    }
}
