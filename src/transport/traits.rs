//! Transport trait abstraction for pluggable realtime backends

use crate::config::{ConnectOptions, Endpoint};
use crm_realtime_shared::DisconnectReason;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Events a transport delivers for one session, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Namespace connected
    Connect,
    /// A connection attempt failed
    ConnectError { message: String },
    /// An established connection ended
    Disconnect { reason: DisconnectReason },
    /// Connected again after `attempt` retries
    Reconnect { attempt: u32 },
    /// Retry budget exhausted, the session is over
    ReconnectFailed,
    /// Application event from the server
    Message { event: String, data: Option<Value> },
}

/// Requests from the client to the transport
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Emit { event: String, data: Value },
    Close,
}

/// The client's ends of an open session
pub struct TransportSession {
    pub outbound: mpsc::Sender<Outbound>,
    pub events: mpsc::Receiver<TransportEvent>,
    /// Task driving the session, if the transport runs one
    pub task: Option<JoinHandle<()>>,
}

/// Factory for realtime sessions
pub trait RealtimeTransport: Send + Sync + 'static {
    /// Start a session. Returns immediately; connection progress is
    /// reported on the session's event stream.
    fn open(&self, endpoint: &Endpoint, options: &ConnectOptions) -> TransportSession;

    /// Human-readable name for this transport
    fn name(&self) -> &'static str;
}
