//! CRM realtime client
//!
//! Keeps one Socket.IO connection to the framework's realtime server and
//! reloads cached resources when the server invalidates them.

pub mod config;
pub mod connection;
pub mod resource;
pub mod transport;

pub use config::{ConnectOptions, Endpoint, RealtimeConfig};
pub use connection::{ConnectionHandle, RealtimeManager};
