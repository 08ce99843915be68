//! Realtime transports
//!
//! A transport owns the wire connection, its handshake and its retry loop.
//! The connection manager only sees [`TransportEvent`]s and sends [`Outbound`]
//! requests.

mod backoff;
pub mod socketio;
pub mod traits;

pub use backoff::Backoff;
pub use socketio::SocketIoTransport;
pub use traits::{Outbound, RealtimeTransport, TransportEvent, TransportSession};
