//! Realtime event names and payloads

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{defaults, now_ms};

/// Server -> client: a cached resource changed and should be reloaded
pub const REFETCH_RESOURCE_EVENT: &str = "refetch_resource";

/// Client -> server: liveness signal
pub const HEARTBEAT_EVENT: &str = "heartbeat";

/// Payload of a `refetch_resource` event
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefetchResource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
}

impl RefetchResource {
    pub fn new(cache_key: impl Into<String>) -> Self {
        Self {
            cache_key: Some(cache_key.into()),
        }
    }

    /// The cache key, if present and non-empty
    pub fn key(&self) -> Option<&str> {
        self.cache_key.as_deref().filter(|k| !k.is_empty())
    }
}

/// Payload of a `heartbeat` event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    /// Milliseconds since Unix epoch
    pub timestamp: u64,
}

impl HeartbeatPayload {
    /// Create a heartbeat stamped with the current time
    pub fn now() -> Self {
        Self { timestamp: now_ms() }
    }
}

/// Engine.IO open packet body sent by the server right after the upgrade
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenHandshake {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    pub ping_interval: u64,
    pub ping_timeout: u64,
    #[serde(default)]
    pub max_payload: u64,
}

impl OpenHandshake {
    /// Handshake advertising the default ping settings
    pub fn with_sid(sid: impl Into<String>) -> Self {
        Self {
            sid: sid.into(),
            upgrades: Vec::new(),
            ping_interval: defaults::PING_INTERVAL_MS,
            ping_timeout: defaults::PING_TIMEOUT_MS,
            max_payload: defaults::MAX_PAYLOAD_BYTES,
        }
    }

    /// How long the client may go without a ping before declaring the link dead
    pub fn ping_deadline_ms(&self) -> u64 {
        self.ping_interval + self.ping_timeout
    }
}

/// Body of a namespace CONNECT acknowledgement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceAck {
    pub sid: String,
}

/// Body of a CONNECT_ERROR packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectErrorPayload {
    pub message: String,
}

/// Why a connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The server closed the namespace
    IoServerDisconnect,
    /// The client closed the connection
    IoClientDisconnect,
    /// No ping from the server within the deadline
    PingTimeout,
    /// The underlying socket closed
    TransportClose,
    /// The underlying socket failed
    TransportError(String),
}

impl DisconnectReason {
    /// Whether the transport should try to reconnect after this reason
    pub fn should_reconnect(&self) -> bool {
        !matches!(
            self,
            DisconnectReason::IoServerDisconnect | DisconnectReason::IoClientDisconnect
        )
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::IoServerDisconnect => write!(f, "io server disconnect"),
            DisconnectReason::IoClientDisconnect => write!(f, "io client disconnect"),
            DisconnectReason::PingTimeout => write!(f, "ping timeout"),
            DisconnectReason::TransportClose => write!(f, "transport close"),
            DisconnectReason::TransportError(e) => write!(f, "transport error: {}", e),
        }
    }
}
