//! Session management for connected realtime clients
//!
//! This module handles:
//! - Engine.IO handshake and server pings
//! - Namespace joins per site
//! - Broadcasting events to every joined namespace
//! - Dropping clients that stop answering pings

mod connection;
mod manager;

pub use connection::ClientSession;
pub use manager::SessionManager;
