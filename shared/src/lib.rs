//! CRM Realtime Shared Protocol Types
//!
//! This crate provides the payload types, the Engine.IO/Socket.IO packet codec
//! and the connection state machine shared by the realtime client and the
//! development server.

pub mod codec;
pub mod protocol;
pub mod state_machine;

use std::time::{SystemTime, UNIX_EPOCH};

// Re-export commonly used types at crate root
pub use protocol::*;

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Connection defaults observed on the CRM frontend
pub mod defaults {
    /// Port the framework's socketio server listens on
    pub const SOCKETIO_PORT: u16 = 9000;

    /// Site used when no site name is configured
    pub const DEFAULT_SITE_NAME: &str = "newcrm.localhost";

    /// Scheme used to reach the realtime server
    pub const DEFAULT_SCHEME: &str = "http";

    /// Engine.IO request path
    pub const ENGINE_IO_PATH: &str = "/socket.io/";

    /// Connection errors before the "reconnection exhausted" warning.
    /// Independent of [`RECONNECTION_ATTEMPTS`].
    pub const RECONNECT_WARN_MAX: u32 = 5;

    /// Transport-level retry budget
    pub const RECONNECTION_ATTEMPTS: u32 = 10;

    /// Initial reconnection delay in milliseconds
    pub const RECONNECTION_DELAY_MS: u64 = 1000;

    /// Maximum reconnection delay in milliseconds
    pub const RECONNECTION_DELAY_MAX_MS: u64 = 5000;

    /// Handshake timeout in milliseconds
    pub const HANDSHAKE_TIMEOUT_MS: u64 = 10000;

    /// Client heartbeat interval in milliseconds
    pub const HEARTBEAT_INTERVAL_MS: u64 = 30000;

    /// Server ping interval advertised in the open packet
    pub const PING_INTERVAL_MS: u64 = 25000;

    /// Grace period after a missed ping
    pub const PING_TIMEOUT_MS: u64 = 20000;

    /// Largest payload the server accepts
    pub const MAX_PAYLOAD_BYTES: u64 = 1_000_000;
}
