//! Socket.IO client transport over a WebSocket
//!
//! Speaks Engine.IO v4 on `ws://host:port/socket.io/` and joins the site's
//! Socket.IO namespace. The session task owns the socket, answers server
//! pings and reconnects with exponential backoff until the retry budget runs
//! out.

use crate::config::{ConnectOptions, Endpoint};
use crate::transport::backoff::Backoff;
use crate::transport::traits::{Outbound, RealtimeTransport, TransportEvent, TransportSession};
use anyhow::{bail, Result};
use crm_realtime_shared::codec::{EnginePacket, SocketPacket, SocketPacketType};
use crm_realtime_shared::{ConnectErrorPayload, DisconnectReason, OpenHandshake};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::COOKIE, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Socket.IO transport
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketIoTransport;

impl RealtimeTransport for SocketIoTransport {
    fn open(&self, endpoint: &Endpoint, options: &ConnectOptions) -> TransportSession {
        let (outbound_tx, outbound_rx) = mpsc::channel::<Outbound>(100);
        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(100);

        let endpoint = endpoint.clone();
        let options = options.clone();
        let task = tokio::spawn(async move {
            session_loop(endpoint, options, outbound_rx, event_tx).await;
        });

        TransportSession {
            outbound: outbound_tx,
            events: event_rx,
            task: Some(task),
        }
    }

    fn name(&self) -> &'static str {
        "socket.io"
    }
}

/// Connect, run, and reconnect until closed or out of retries
async fn session_loop(
    endpoint: Endpoint,
    options: ConnectOptions,
    mut outbound_rx: mpsc::Receiver<Outbound>,
    event_tx: mpsc::Sender<TransportEvent>,
) {
    let namespace = endpoint.namespace();
    let mut backoff = Backoff::new(options.reconnection_delay, options.reconnection_delay_max);
    let mut attempt: u32 = 0;

    loop {
        let attempt_result = tokio::select! {
            result = timeout(options.timeout, handshake(&endpoint, &options, &namespace)) => result,
            _ = closed(&mut outbound_rx) => {
                debug!("Session for {} closed during handshake", endpoint);
                return;
            }
        };

        match attempt_result {
            Ok(Ok((mut ws, open))) => {
                backoff.reset();
                debug!("Engine.IO session {} open on {}", open.sid, endpoint);

                if !notify(&event_tx, TransportEvent::Connect).await {
                    return;
                }
                if attempt > 0 {
                    if !notify(&event_tx, TransportEvent::Reconnect { attempt }).await {
                        return;
                    }
                    attempt = 0;
                }

                let reason =
                    run_connected(&mut ws, &open, &namespace, &mut outbound_rx, &event_tx).await;
                let reconnect = options.reconnection && reason.should_reconnect();

                if !notify(&event_tx, TransportEvent::Disconnect { reason }).await || !reconnect {
                    return;
                }
            }
            Ok(Err(e)) => {
                let message = e.to_string();
                if !notify(&event_tx, TransportEvent::ConnectError { message }).await
                    || !options.reconnection
                {
                    return;
                }
            }
            Err(_) => {
                let message = "timeout".to_string();
                if !notify(&event_tx, TransportEvent::ConnectError { message }).await
                    || !options.reconnection
                {
                    return;
                }
            }
        }

        if attempt >= options.reconnection_attempts {
            let _ = event_tx.send(TransportEvent::ReconnectFailed).await;
            return;
        }

        attempt += 1;
        let delay = backoff.next_delay();
        debug!(
            "Reconnecting to {} in {:?} (attempt {}/{})",
            endpoint, delay, attempt, options.reconnection_attempts
        );

        if !wait_or_close(delay, &mut outbound_rx).await {
            return;
        }
    }
}

/// Deliver an event; false once nobody is listening
async fn notify(event_tx: &mpsc::Sender<TransportEvent>, event: TransportEvent) -> bool {
    event_tx.send(event).await.is_ok()
}

/// Sleep out the backoff delay. Returns false if the session was closed meanwhile.
async fn wait_or_close(delay: Duration, outbound_rx: &mut mpsc::Receiver<Outbound>) -> bool {
    tokio::select! {
        _ = sleep(delay) => true,
        _ = closed(outbound_rx) => false,
    }
}

/// Resolves once the session is closed, dropping emits made while disconnected
async fn closed(outbound_rx: &mut mpsc::Receiver<Outbound>) {
    loop {
        match outbound_rx.recv().await {
            Some(Outbound::Emit { event, .. }) => {
                debug!("Dropping '{}' emitted while disconnected", event);
            }
            Some(Outbound::Close) | None => return,
        }
    }
}

/// Open the WebSocket, read the Engine.IO open packet and join the namespace
async fn handshake(
    endpoint: &Endpoint,
    options: &ConnectOptions,
    namespace: &str,
) -> Result<(WsStream, OpenHandshake)> {
    let mut request = endpoint.websocket_url().into_client_request()?;
    if options.with_credentials {
        if let Some(cookie) = &options.credentials {
            request
                .headers_mut()
                .insert(COOKIE, HeaderValue::from_str(cookie)?);
        }
    }

    let (mut ws, _response) = connect_async(request).await?;

    let open = loop {
        match next_engine_packet(&mut ws).await? {
            EnginePacket::Open(open) => break open,
            other => debug!("Ignoring {:?} before open packet", other),
        }
    };

    send_packet(
        &mut ws,
        &EnginePacket::Message(SocketPacket::connect(namespace, None).encode()),
    )
    .await?;

    loop {
        match next_engine_packet(&mut ws).await? {
            EnginePacket::Ping(probe) => send_packet(&mut ws, &EnginePacket::Pong(probe)).await?,
            EnginePacket::Message(body) => {
                let packet = SocketPacket::decode(&body)?;
                if packet.namespace != namespace {
                    continue;
                }
                match packet.kind {
                    SocketPacketType::Connect => return Ok((ws, open)),
                    SocketPacketType::ConnectError => {
                        let message = packet
                            .data
                            .and_then(|d| serde_json::from_value::<ConnectErrorPayload>(d).ok())
                            .map(|p| p.message)
                            .unwrap_or_else(|| format!("{} rejected the connection", namespace));
                        bail!(message);
                    }
                    other => debug!("Ignoring {:?} packet during handshake", other),
                }
            }
            EnginePacket::Close => bail!("Server closed the session during handshake"),
            _ => {}
        }
    }
}

async fn next_engine_packet(ws: &mut WsStream) -> Result<EnginePacket> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return Ok(EnginePacket::decode(&text)?),
            Some(Ok(Message::Close(_))) | None => bail!("Connection closed during handshake"),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

async fn send_packet(ws: &mut WsStream, packet: &EnginePacket) -> Result<()> {
    ws.send(Message::Text(packet.encode()?)).await?;
    Ok(())
}

/// Handle an established connection until it ends
async fn run_connected(
    ws: &mut WsStream,
    open: &OpenHandshake,
    namespace: &str,
    outbound_rx: &mut mpsc::Receiver<Outbound>,
    event_tx: &mpsc::Sender<TransportEvent>,
) -> DisconnectReason {
    let ping_deadline = Duration::from_millis(open.ping_deadline_ms());
    let idle = sleep(ping_deadline);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            _ = &mut idle => return DisconnectReason::PingTimeout,

            cmd = outbound_rx.recv() => match cmd {
                Some(Outbound::Emit { event, data }) => {
                    let body = SocketPacket::event(namespace, &event, data).encode();
                    if let Err(e) = send_packet(ws, &EnginePacket::Message(body)).await {
                        return DisconnectReason::TransportError(e.to_string());
                    }
                }
                Some(Outbound::Close) | None => {
                    let body = SocketPacket::disconnect(namespace).encode();
                    let _ = send_packet(ws, &EnginePacket::Message(body)).await;
                    let _ = ws.close(None).await;
                    return DisconnectReason::IoClientDisconnect;
                }
            },

            msg = ws.next() => match msg {
                Some(Ok(Message::Text(text))) => match EnginePacket::decode(&text) {
                    Ok(EnginePacket::Ping(probe)) => {
                        idle.as_mut().reset(Instant::now() + ping_deadline);
                        if let Err(e) = send_packet(ws, &EnginePacket::Pong(probe)).await {
                            return DisconnectReason::TransportError(e.to_string());
                        }
                    }
                    Ok(EnginePacket::Message(body)) => match SocketPacket::decode(&body) {
                        Ok(packet) if packet.namespace == namespace => match packet.kind {
                            SocketPacketType::Event => {
                                if let Some((event, data)) = packet.event_parts() {
                                    let event = TransportEvent::Message {
                                        event: event.to_string(),
                                        data: data.cloned(),
                                    };
                                    if !notify(event_tx, event).await {
                                        return DisconnectReason::IoClientDisconnect;
                                    }
                                }
                            }
                            SocketPacketType::Disconnect => {
                                return DisconnectReason::IoServerDisconnect;
                            }
                            other => debug!("Ignoring {:?} packet", other),
                        },
                        Ok(packet) => debug!("Ignoring packet for namespace {}", packet.namespace),
                        Err(e) => warn!("Dropping undecodable packet: {}", e),
                    },
                    Ok(EnginePacket::Close) => return DisconnectReason::TransportClose,
                    Ok(_) => {}
                    Err(e) => warn!("Dropping undecodable frame: {}", e),
                },
                Some(Ok(Message::Close(_))) | None => return DisconnectReason::TransportClose,
                Some(Ok(_)) => {}
                Some(Err(e)) => return DisconnectReason::TransportError(e.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crm_realtime_shared::REFETCH_RESOURCE_EVENT;
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio_tungstenite::accept_async;

    const SITE: &str = "acme.local";

    fn test_options() -> ConnectOptions {
        ConnectOptions {
            reconnection_attempts: 1,
            reconnection_delay: Duration::from_millis(10),
            reconnection_delay_max: Duration::from_millis(20),
            timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    async fn recv_event(session: &mut TransportSession) -> TransportEvent {
        timeout(Duration::from_secs(5), session.events.recv())
            .await
            .expect("timed out waiting for transport event")
            .expect("event stream closed")
    }

    /// Accept one client, complete the handshake, then hand the socket back
    async fn accept_client(
        listener: &TcpListener,
        connect_reply: String,
    ) -> WebSocketStream<TcpStream> {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();

        let open = EnginePacket::Open(OpenHandshake::with_sid("test-sid"));
        ws.send(Message::Text(open.encode().unwrap())).await.unwrap();

        let join = ws.next().await.unwrap().unwrap();
        assert_eq!(join, Message::Text(format!("40/{},", SITE)));

        ws.send(Message::Text(connect_reply)).await.unwrap();
        ws
    }

    #[tokio::test]
    async fn test_connect_receive_and_emit() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let reply = format!(r#"40/{},{{"sid":"nsp-sid"}}"#, SITE);
            let mut ws = accept_client(&listener, reply).await;

            let refetch = SocketPacket::event(
                format!("/{}", SITE),
                REFETCH_RESOURCE_EVENT,
                json!({ "cache_key": "deal-statuses" }),
            );
            ws.send(Message::Text(refetch.to_frame())).await.unwrap();

            // Next frame from the client is the emitted heartbeat
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => text,
                other => panic!("unexpected frame {:?}", other),
            }
        });

        let endpoint = Endpoint::new("http", "127.0.0.1", port, SITE);
        let mut session = SocketIoTransport.open(&endpoint, &test_options());

        assert_eq!(recv_event(&mut session).await, TransportEvent::Connect);
        assert_eq!(
            recv_event(&mut session).await,
            TransportEvent::Message {
                event: REFETCH_RESOURCE_EVENT.into(),
                data: Some(json!({ "cache_key": "deal-statuses" })),
            }
        );

        session
            .outbound
            .send(Outbound::Emit {
                event: "heartbeat".into(),
                data: json!({ "timestamp": 7 }),
            })
            .await
            .unwrap();

        let frame = server.await.unwrap();
        assert_eq!(
            frame,
            format!(r#"42/{},["heartbeat",{{"timestamp":7}}]"#, SITE)
        );
    }

    #[tokio::test]
    async fn test_server_disconnect_is_not_retried() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let reply = format!(r#"40/{},{{"sid":"nsp-sid"}}"#, SITE);
            let mut ws = accept_client(&listener, reply).await;
            let bye = SocketPacket::disconnect(format!("/{}", SITE));
            ws.send(Message::Text(bye.to_frame())).await.unwrap();
            // Keep the socket open until the client hangs up
            while let Some(Ok(_)) = ws.next().await {}
        });

        let endpoint = Endpoint::new("http", "127.0.0.1", port, SITE);
        let mut session = SocketIoTransport.open(&endpoint, &test_options());

        assert_eq!(recv_event(&mut session).await, TransportEvent::Connect);
        assert_eq!(
            recv_event(&mut session).await,
            TransportEvent::Disconnect {
                reason: DisconnectReason::IoServerDisconnect
            }
        );
        let end = timeout(Duration::from_secs(5), session.events.recv())
            .await
            .expect("session did not end");
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn test_namespace_rejection_reports_message() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let reply = format!(r#"44/{},{{"message":"Invalid origin"}}"#, SITE);
            let _ws = accept_client(&listener, reply).await;
        });

        let endpoint = Endpoint::new("http", "127.0.0.1", port, SITE);
        let options = ConnectOptions {
            reconnection: false,
            ..test_options()
        };
        let mut session = SocketIoTransport.open(&endpoint, &options);

        assert_eq!(
            recv_event(&mut session).await,
            TransportEvent::ConnectError {
                message: "Invalid origin".into()
            }
        );
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        // Grab a free port and release it so connections are refused
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let endpoint = Endpoint::new("http", "127.0.0.1", port, SITE);
        let mut session = SocketIoTransport.open(&endpoint, &test_options());

        assert!(matches!(
            recv_event(&mut session).await,
            TransportEvent::ConnectError { .. }
        ));
        assert!(matches!(
            recv_event(&mut session).await,
            TransportEvent::ConnectError { .. }
        ));
        assert_eq!(
            recv_event(&mut session).await,
            TransportEvent::ReconnectFailed
        );
    }

    #[tokio::test]
    async fn test_close_during_handshake_never_joins_namespace() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (accepted_tx, accepted_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            accepted_tx.send(()).unwrap();

            // Hold the open packet back until the client has been closed
            release_rx.await.unwrap();
            let open = EnginePacket::Open(OpenHandshake::with_sid("late-sid"));
            let _ = ws.send(Message::Text(open.encode().unwrap())).await;
            timeout(Duration::from_secs(2), ws.next()).await
        });

        let endpoint = Endpoint::new("http", "127.0.0.1", port, SITE);
        let mut session = SocketIoTransport.open(&endpoint, &test_options());

        accepted_rx.await.unwrap();
        session.outbound.send(Outbound::Close).await.unwrap();
        let task = session.task.take().unwrap();
        timeout(Duration::from_secs(5), task)
            .await
            .expect("session task did not stop")
            .unwrap();

        release_tx.send(()).unwrap();
        let seen = server.await.unwrap();
        assert!(
            !matches!(seen, Ok(Some(Ok(Message::Text(_))))),
            "closed session kept talking: {:?}",
            seen
        );
        assert!(session.events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_close_while_waiting_ends_session() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let endpoint = Endpoint::new("http", "127.0.0.1", port, SITE);
        let options = ConnectOptions {
            reconnection_attempts: 10,
            reconnection_delay: Duration::from_secs(60),
            reconnection_delay_max: Duration::from_secs(60),
            ..test_options()
        };
        let mut session = SocketIoTransport.open(&endpoint, &options);

        assert!(matches!(
            recv_event(&mut session).await,
            TransportEvent::ConnectError { .. }
        ));
        session.outbound.send(Outbound::Close).await.unwrap();

        let task = session.task.take().unwrap();
        timeout(Duration::from_secs(5), task)
            .await
            .expect("session task did not stop")
            .unwrap();
    }
}
