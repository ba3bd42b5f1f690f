//! Session configuration for the resilient MQTT client
//!
//! Everything here is plain data, created once at client construction and
//! never mutated afterwards. The option types derive serde so applications
//! can load them from a config file.

use crate::codec::QoS;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Keepalive intervals below this defeat their purpose on a flaky link.
const MIN_KEEPALIVE_SECS: u64 = 5;

/// Message the broker publishes on our behalf if the session dies without
/// a graceful DISCONNECT.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    #[serde(default)]
    pub retain: bool,
}

/// Broker login, sent in the CONNECT packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
}

/// Immutable session configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttOptions {
    /// Broker URL, `mqtt://host[:port]` (or `mqtts://`, default port 8883).
    pub broker_url: String,
    /// Client identifier; a random one is generated when left empty.
    #[serde(default)]
    pub client_id: String,
    /// Maximum silence interval before a ping is required.
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    /// False asks the broker to retain subscription and in-flight state
    /// across reconnects for this client id.
    #[serde(default)]
    pub clean_session: bool,
    pub will: Option<Will>,
    pub credentials: Option<Credentials>,
    /// Deadline for the CONNECT/CONNACK handshake on each attempt.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Largest inbound frame accepted before the session is failed.
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
}

fn default_keepalive_secs() -> u64 {
    60
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_max_packet_size() -> usize {
    256 * 1024
}

/// Configuration errors surfaced at client construction.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("keepalive must be at least {MIN_KEEPALIVE_SECS} seconds, got {0}")]
    KeepaliveTooShort(u64),
    #[error("keepalive does not fit in the 16-bit CONNECT field: {0}")]
    KeepaliveTooLong(u64),
    #[error("reconnect backoff is misconfigured: {0}")]
    InvalidBackoff(String),
}

impl MqttOptions {
    pub fn new(broker_url: impl Into<String>) -> Self {
        Self {
            broker_url: broker_url.into(),
            client_id: String::new(),
            keepalive_secs: default_keepalive_secs(),
            clean_session: false,
            will: None,
            credentials: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            max_packet_size: default_max_packet_size(),
        }
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive_secs = keepalive.as_secs();
        self
    }

    pub fn clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    pub fn will(mut self, will: Will) -> Self {
        self.will = Some(will);
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    /// Resolve host and port from the broker URL.
    pub fn broker_addr(&self) -> Result<(String, u16), ConfigError> {
        let url = Url::parse(&self.broker_url)
            .map_err(|_| ConfigError::InvalidBrokerUrl(self.broker_url.clone()))?;
        let host = url
            .host_str()
            .ok_or_else(|| ConfigError::InvalidBrokerUrl(self.broker_url.clone()))?
            .to_string();
        let port = url
            .port()
            .unwrap_or(if url.scheme() == "mqtts" { 8883 } else { 1883 });
        Ok((host, port))
    }

    /// Validate the record and fill in a generated client id when empty.
    pub fn finalize(mut self) -> Result<Self, ConfigError> {
        self.broker_addr()?;
        if self.keepalive_secs < MIN_KEEPALIVE_SECS {
            return Err(ConfigError::KeepaliveTooShort(self.keepalive_secs));
        }
        if self.keepalive_secs > u16::MAX as u64 {
            return Err(ConfigError::KeepaliveTooLong(self.keepalive_secs));
        }
        if self.client_id.is_empty() {
            self.client_id = format!("steadfast-{}", uuid::Uuid::new_v4().simple());
        }
        Ok(self)
    }
}

/// Bounded exponential backoff for reconnection attempts.
///
/// The delay starts at `initial_ms`, is multiplied by `multiplier` after
/// every failed attempt, and never exceeds `cap_ms`. The supervisor resets
/// the schedule when the link itself goes down and after every successful
/// handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_ms")]
    pub initial_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
    #[serde(default = "default_cap_ms")]
    pub cap_ms: u64,
}

fn default_initial_ms() -> u64 {
    1_000
}

fn default_multiplier() -> u32 {
    2
}

fn default_cap_ms() -> u64 {
    30_000
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_initial_ms(),
            multiplier: default_multiplier(),
            cap_ms: default_cap_ms(),
        }
    }
}

impl ReconnectConfig {
    /// Delay before reconnection attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let mut delay = self.initial_ms;
        for _ in 1..attempt {
            delay = delay.saturating_mul(self.multiplier as u64);
            if delay >= self.cap_ms {
                delay = self.cap_ms;
                break;
            }
        }
        Duration::from_millis(delay.min(self.cap_ms))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_ms == 0 {
            return Err(ConfigError::InvalidBackoff(
                "initial delay must be non-zero".to_string(),
            ));
        }
        if self.multiplier < 1 {
            return Err(ConfigError::InvalidBackoff(
                "multiplier must be at least 1".to_string(),
            ));
        }
        if self.cap_ms < self.initial_ms {
            return Err(ConfigError::InvalidBackoff(
                "cap must not be below the initial delay".to_string(),
            ));
        }
        Ok(())
    }
}
