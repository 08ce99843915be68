//! Individual client session handling

use anyhow::{bail, Result};
use crm_realtime_shared::codec::{EnginePacket, SocketPacket, SocketPacketType, ROOT_NAMESPACE};
use crm_realtime_shared::{defaults, NamespaceAck, OpenHandshake, HEARTBEAT_EVENT};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::interval_at;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

/// Handle to send frames to a specific client
#[derive(Clone)]
pub struct SessionHandle {
    pub sid: String,
    pub addr: SocketAddr,
    outbound: mpsc::UnboundedSender<String>,
    namespaces: Arc<Mutex<HashSet<String>>>,
    pub last_pong: Arc<Mutex<Instant>>,
}

impl SessionHandle {
    /// Create a handle and the receiver its frames are written from
    pub fn new(sid: String, addr: SocketAddr) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let now = Instant::now();
        let handle = Self {
            sid,
            addr,
            outbound,
            namespaces: Arc::new(Mutex::new(HashSet::new())),
            last_pong: Arc::new(Mutex::new(now)),
        };
        (handle, outbound_rx)
    }

    /// Queue an Engine.IO packet for this client
    pub fn send_packet(&self, packet: &EnginePacket) -> Result<()> {
        let frame = packet.encode()?;
        if self.outbound.send(frame).is_err() {
            bail!("Session {} closed", self.sid);
        }
        Ok(())
    }

    /// Emit an event on a namespace. Returns false if the client has not joined it.
    pub async fn emit(&self, namespace: &str, event: &str, data: Value) -> Result<bool> {
        if !self.namespaces.lock().await.contains(namespace) {
            return Ok(false);
        }
        let body = SocketPacket::event(namespace, event, data).encode();
        self.send_packet(&EnginePacket::Message(body))?;
        Ok(true)
    }

    /// Namespaces the client has joined
    pub async fn namespaces(&self) -> Vec<String> {
        self.namespaces.lock().await.iter().cloned().collect()
    }

    /// Check if the client still answers pings
    pub async fn is_alive(&self) -> bool {
        let deadline = Duration::from_millis(defaults::PING_INTERVAL_MS + defaults::PING_TIMEOUT_MS);
        self.last_pong.lock().await.elapsed() < deadline
    }

    pub async fn update_pong(&self) {
        *self.last_pong.lock().await = Instant::now();
    }

    /// Handle one text frame from the client. Returns false when the client closed.
    pub async fn handle_frame(&self, frame: &str) -> Result<bool> {
        let packet = match EnginePacket::decode(frame) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Undecodable frame from {}: {}", self.addr, e);
                return Ok(true);
            }
        };

        match packet {
            EnginePacket::Pong(_) => self.update_pong().await,
            EnginePacket::Ping(probe) => self.send_packet(&EnginePacket::Pong(probe))?,
            EnginePacket::Message(body) => match SocketPacket::decode(&body) {
                Ok(packet) => self.handle_socket_packet(packet).await?,
                Err(e) => warn!("Undecodable packet from {}: {}", self.addr, e),
            },
            EnginePacket::Close => return Ok(false),
            _ => {}
        }

        Ok(true)
    }

    async fn handle_socket_packet(&self, packet: SocketPacket) -> Result<()> {
        match packet.kind {
            SocketPacketType::Connect if packet.namespace == ROOT_NAMESPACE => {
                let reply = SocketPacket::connect_error(ROOT_NAMESPACE, "Site namespace required");
                self.send_packet(&EnginePacket::Message(reply.encode()))?;
                warn!("[{}] rejected connect without a site namespace", self.sid);
            }
            SocketPacketType::Connect => {
                self.namespaces.lock().await.insert(packet.namespace.clone());
                let ack = serde_json::to_value(NamespaceAck {
                    sid: format!("{}{}", self.sid, packet.namespace),
                })?;
                let reply = SocketPacket::connect(packet.namespace.as_str(), Some(ack));
                self.send_packet(&EnginePacket::Message(reply.encode()))?;
                info!("[{}] joined {}", self.sid, packet.namespace);
            }
            SocketPacketType::Disconnect => {
                self.namespaces.lock().await.remove(&packet.namespace);
                info!("[{}] left {}", self.sid, packet.namespace);
            }
            SocketPacketType::Event => match packet.event_parts() {
                Some((HEARTBEAT_EVENT, data)) => {
                    let timestamp = data.and_then(|d| d["timestamp"].as_u64()).unwrap_or_default();
                    info!(
                        "[{}] {} HEARTBEAT: timestamp={}",
                        self.sid, packet.namespace, timestamp
                    );
                }
                Some((name, _)) => debug!("[{}] {} event '{}'", self.sid, packet.namespace, name),
                None => debug!("[{}] malformed event", self.sid),
            },
            other => debug!("[{}] ignoring {:?}", self.sid, other),
        }
        Ok(())
    }
}

/// Active client session
pub struct ClientSession {
    pub handle: SessionHandle,
    ws: WebSocketStream<TcpStream>,
    outbound_rx: mpsc::UnboundedReceiver<String>,
}

impl ClientSession {
    /// Create a session from an upgraded WebSocket
    pub fn new(ws: WebSocketStream<TcpStream>, addr: SocketAddr, sid: String) -> Self {
        let (handle, outbound_rx) = SessionHandle::new(sid, addr);
        Self {
            handle,
            ws,
            outbound_rx,
        }
    }

    /// Get a cloneable handle for sending messages
    pub fn get_handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Send the Engine.IO open packet
    pub async fn open(&mut self) -> Result<()> {
        let open = EnginePacket::Open(OpenHandshake::with_sid(self.handle.sid.clone()));
        self.ws.send(Message::Text(open.encode()?)).await?;
        Ok(())
    }

    /// Serve the client until it disconnects or stops answering pings
    pub async fn run(self) -> Result<()> {
        let ClientSession {
            handle,
            mut ws,
            mut outbound_rx,
        } = self;

        let period = Duration::from_millis(defaults::PING_INTERVAL_MS);
        let mut ping = interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    if !handle.is_alive().await {
                        bail!("ping timeout");
                    }
                    handle.send_packet(&EnginePacket::Ping(None))?;
                }

                Some(frame) = outbound_rx.recv() => {
                    ws.send(Message::Text(frame)).await?;
                }

                msg = ws.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if !handle.handle_frame(&text).await? {
                            return Ok(());
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn session() -> (SessionHandle, mpsc::UnboundedReceiver<String>) {
        SessionHandle::new("abc123".into(), "127.0.0.1:50000".parse().unwrap())
    }

    #[tokio::test]
    async fn test_namespace_connect_is_acknowledged() {
        let (handle, mut rx) = session();

        assert!(handle.handle_frame("40/acme.local,").await.unwrap());

        assert_eq!(
            rx.recv().await.unwrap(),
            r#"40/acme.local,{"sid":"abc123/acme.local"}"#
        );
        assert_eq!(handle.namespaces().await, vec!["/acme.local".to_string()]);
    }

    #[tokio::test]
    async fn test_root_namespace_is_rejected() {
        let (handle, mut rx) = session();

        assert!(handle.handle_frame("40").await.unwrap());

        assert_eq!(
            rx.recv().await.unwrap(),
            r#"44{"message":"Site namespace required"}"#
        );
        assert!(handle.namespaces().await.is_empty());
    }

    #[tokio::test]
    async fn test_emit_requires_joined_namespace() {
        let (handle, mut rx) = session();
        let data = json!({ "cache_key": "lead-statuses" });

        assert!(!handle
            .emit("/acme.local", "refetch_resource", data.clone())
            .await
            .unwrap());

        handle.handle_frame("40/acme.local,").await.unwrap();
        rx.recv().await.unwrap();

        assert!(handle
            .emit("/acme.local", "refetch_resource", data)
            .await
            .unwrap());
        assert_eq!(
            rx.recv().await.unwrap(),
            r#"42/acme.local,["refetch_resource",{"cache_key":"lead-statuses"}]"#
        );
    }

    #[tokio::test]
    async fn test_leave_and_close() {
        let (handle, _rx) = session();
        handle.handle_frame("40/acme.local,").await.unwrap();

        assert!(handle.handle_frame("41/acme.local,").await.unwrap());
        assert!(handle.namespaces().await.is_empty());

        assert!(!handle.handle_frame("1").await.unwrap());
    }

    #[tokio::test]
    async fn test_heartbeat_and_garbage_keep_session() {
        let (handle, _rx) = session();
        assert!(handle
            .handle_frame(r#"42/acme.local,["heartbeat",{"timestamp":1700000000000}]"#)
            .await
            .unwrap());
        assert!(handle.handle_frame("9nonsense").await.unwrap());
        assert!(handle.handle_frame("3").await.unwrap());
        assert!(handle.is_alive().await);
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (handle, rx) = session();
        drop(rx);
        assert!(handle.send_packet(&EnginePacket::Ping(None)).is_err());
    }
}
