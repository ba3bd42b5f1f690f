//! Error taxonomy for the client
//!
//! Transient link and session failures are recovered internally by the
//! reconnection supervisor and never surface to callers; the types here
//! cover what *does* surface: handshake outcomes, caller deadlines,
//! shutdown cancellation, and misconfiguration.

use crate::codec::{ConnectReturnCode, ProtocolError};
use thiserror::Error;

/// Failure of a single connection attempt.
///
/// The supervisor retries these with backoff; `connect()` reports only the
/// first attempt's outcome when asked to wait for it.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("link is down")]
    LinkDown,
    #[error("broker refused the connection: {0:?}")]
    Refused(ConnectReturnCode),
    #[error("no CONNACK within the handshake deadline")]
    Timeout,
    #[error("stream error during handshake")]
    Io(#[from] std::io::Error),
    #[error("protocol error during handshake: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Surfaced from `publish` and its deadline-bounded variant.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("publish deadline elapsed before acknowledgement")]
    Timeout,
    #[error("client shut down while the publish was pending")]
    Cancelled,
    #[error("invalid topic: {0}")]
    InvalidTopic(String),
    #[error("every packet identifier is awaiting acknowledgement")]
    InFlightLimit,
}

/// Surfaced from `subscribe` / `unsubscribe`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubscribeError {
    #[error("subscribe deadline elapsed before acknowledgement")]
    Timeout,
    #[error("client shut down while the request was pending")]
    Cancelled,
    #[error("invalid topic filter: {0}")]
    InvalidFilter(String),
    #[error("broker rejected the subscription (return code 0x{0:02x})")]
    Rejected(u8),
    #[error("every packet identifier is awaiting acknowledgement")]
    InFlightLimit,
}

/// Why a live session was declared dead. Internal to the supervisor loop;
/// every variant leads to the same teardown-and-reconnect path.
#[derive(Debug, Error)]
pub(crate) enum SessionFault {
    #[error("stream I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("keepalive deadline missed")]
    KeepaliveTimeout,
    #[error("inbound message delivery stopped")]
    DeliveryHalted,
}

/// Validate a topic for publishing: non-empty, no wildcard characters.
pub(crate) fn validate_topic(topic: &str) -> Result<(), String> {
    if topic.is_empty() {
        return Err("topic must not be empty".to_string());
    }
    if topic.contains(['#', '+']) {
        return Err("publish topics must not contain wildcards".to_string());
    }
    if topic.contains('\0') {
        return Err("topic must not contain NUL".to_string());
    }
    Ok(())
}

/// Validate a subscription filter: non-empty, no NUL. Wildcards are legal
/// here, unlike publish topics.
pub(crate) fn validate_filter(filter: &str) -> Result<(), String> {
    if filter.is_empty() {
        return Err("filter must not be empty".to_string());
    }
    if filter.contains('\0') {
        return Err("filter must not contain NUL".to_string());
    }
    Ok(())
}
