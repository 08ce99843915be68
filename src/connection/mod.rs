//! Realtime connection management
//!
//! This module handles:
//! - The single live connection and its replacement on re-initialization
//! - Lifecycle events driving the connection state machine
//! - The heartbeat timer, alive only while connected
//! - Reloading cached resources on `refetch_resource`

mod handle;
mod heartbeat;
mod manager;

pub use handle::ConnectionHandle;
pub use heartbeat::HeartbeatTask;
pub use manager::RealtimeManager;
