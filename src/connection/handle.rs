//! Handle to the live realtime connection

use crate::config::Endpoint;
use crate::transport::Outbound;
use anyhow::{anyhow, Result};
use serde_json::Value;
use tokio::sync::mpsc;

/// Cloneable handle to one connection. Two handles refer to the same
/// connection iff their ids are equal.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: u64,
    endpoint: Endpoint,
    outbound: mpsc::Sender<Outbound>,
}

impl ConnectionHandle {
    pub(crate) fn new(id: u64, endpoint: Endpoint, outbound: mpsc::Sender<Outbound>) -> Self {
        Self {
            id,
            endpoint,
            outbound,
        }
    }

    /// Identity of the connection
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Emit an event to the server
    pub async fn emit(&self, event: &str, data: Value) -> Result<()> {
        self.outbound
            .send(Outbound::Emit {
                event: event.to_string(),
                data,
            })
            .await
            .map_err(|_| anyhow!("Connection closed"))
    }

    /// Ask the transport to close the connection
    pub fn close(&self) -> Result<()> {
        self.outbound
            .try_send(Outbound::Close)
            .map_err(|e| anyhow!("Failed to close connection {}: {}", self.id, e))
    }

    /// Whether the transport side has gone away
    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn handle() -> (ConnectionHandle, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(4);
        let endpoint = Endpoint::new("http", "localhost", 9000, "acme.local");
        (ConnectionHandle::new(1, endpoint, tx), rx)
    }

    #[tokio::test]
    async fn test_emit_and_close() {
        let (handle, mut rx) = handle();

        handle.emit("heartbeat", json!({ "timestamp": 1 })).await.unwrap();
        assert_eq!(
            rx.recv().await,
            Some(Outbound::Emit {
                event: "heartbeat".into(),
                data: json!({ "timestamp": 1 }),
            })
        );

        handle.close().unwrap();
        assert_eq!(rx.recv().await, Some(Outbound::Close));
    }

    #[tokio::test]
    async fn test_close_after_transport_gone() {
        let (handle, rx) = handle();
        drop(rx);

        assert!(handle.is_closed());
        assert!(handle.close().is_err());
        assert!(handle.emit("heartbeat", json!({})).await.is_err());
    }
}
