//
// config.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
// Licensed under the Elastic License 2.0. See LICENSE.txt for license information.
//
//

//! Client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable naming the kernel's websocket endpoint
pub const ENDPOINT_ENV: &str = "KW_ENDPOINT";

/// Environment variable holding the authentication token
pub const TOKEN_ENV: &str = "KW_TOKEN";

/// Environment variable overriding the default request timeout, in seconds
pub const TIMEOUT_ENV: &str = "KW_TIMEOUT_SECS";

/// Settings for a kernel client and its connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// The websocket URL of the kernel's channels endpoint
    pub endpoint: String,

    /// The bearer token appended to the endpoint, if any
    pub token: Option<String>,

    /// The username stamped on outgoing messages
    pub username: Option<String>,

    /// A fixed session ID; a random one is generated if omitted
    pub session_id: Option<String>,

    /// How long requests wait for replies unless the caller says otherwise;
    /// `None` waits forever
    #[serde(with = "optional_secs")]
    pub default_timeout: Option<Duration>,

    /// How long `connect` waits for the socket handshake
    #[serde(with = "secs")]
    pub connect_timeout: Duration,

    /// The number of times a dropped connection is re-established
    pub reconnect_attempts: u32,

    /// The delay before the first reconnect; doubles on every attempt
    #[serde(with = "secs")]
    pub reconnect_base_delay: Duration,

    /// The longest delay between reconnect attempts
    #[serde(with = "secs")]
    pub reconnect_max_delay: Duration,

    /// How often the heartbeat monitor probes the kernel
    #[serde(with = "secs")]
    pub heartbeat_interval: Duration,

    /// How long the heartbeat monitor waits for a probe to be answered
    #[serde(with = "secs")]
    pub heartbeat_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            token: None,
            username: None,
            session_id: None,
            default_timeout: Some(Duration::from_secs(30)),
            connect_timeout: Duration::from_secs(10),
            reconnect_attempts: 5,
            reconnect_base_delay: Duration::from_millis(250),
            reconnect_max_delay: Duration::from_secs(8),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(5),
        }
    }
}

impl ClientConfig {
    /// Create a configuration for the given endpoint with default settings.
    pub fn new(endpoint: impl Into<String>, token: Option<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            token,
            ..Self::default()
        }
    }

    /// Apply overrides from the environment to this configuration.
    pub fn from_env(mut self) -> Self {
        if let Ok(endpoint) = std::env::var(ENDPOINT_ENV) {
            self.endpoint = endpoint;
        }
        if let Ok(token) = std::env::var(TOKEN_ENV) {
            self.token = Some(token);
        }
        if let Ok(timeout) = std::env::var(TIMEOUT_ENV) {
            match timeout.trim().parse::<f64>() {
                Ok(secs) if secs > 0.0 => {
                    self.default_timeout = Some(Duration::from_secs_f64(secs));
                }
                Ok(_) => {
                    // Zero or negative disables the default timeout
                    self.default_timeout = None;
                }
                Err(e) => {
                    log::warn!(
                        "Ignoring invalid {} value '{}': {}",
                        TIMEOUT_ENV,
                        timeout,
                        e
                    );
                }
            }
        }
        self
    }

    /// The delay before reconnect attempt `attempt` (starting at 0).
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.reconnect_base_delay
            .saturating_mul(factor)
            .min(self.reconnect_max_delay)
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

mod optional_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        match Option::<f64>::deserialize(deserializer)? {
            Some(secs) => Duration::try_from_secs_f64(secs)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
