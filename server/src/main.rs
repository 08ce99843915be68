mod session;

use anyhow::Result;
use crm_realtime_shared::{defaults, RefetchResource, REFETCH_RESOURCE_EVENT};
use session::{ClientSession, SessionManager};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_async;

use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| format!("0.0.0.0:{}", defaults::SOCKETIO_PORT));
    let listener = TcpListener::bind(&addr).await?;
    info!("Realtime server listening on {}", addr);
    info!("Type a cache key and press enter to broadcast refetch_resource");

    let sessions = Arc::new(SessionManager::new());

    let stdin_sessions = sessions.clone();
    tokio::spawn(async move {
        if let Err(e) = broadcast_stdin(stdin_sessions).await {
            warn!("Stdin reader stopped: {}", e);
        }
    });

    loop {
        let (stream, addr) = listener.accept().await?;
        let sessions = sessions.clone();

        tokio::spawn(async move {
            if let Err(e) = serve_client(stream, addr, &sessions).await {
                warn!("Session from {} ended: {}", addr, e);
            }
        });
    }
}

async fn serve_client(stream: TcpStream, addr: SocketAddr, sessions: &SessionManager) -> Result<()> {
    let ws = accept_async(stream).await?;
    let mut session = ClientSession::new(ws, addr, sessions.next_sid());
    let sid = session.handle.sid.clone();

    session.open().await?;
    sessions.register(session.get_handle()).await;
    info!("Connection from {} (sid {}), {} connected", addr, sid, sessions.count().await);

    let result = session.run().await;

    sessions.unregister(&sid).await;
    info!("Client disconnected: {} (sid {})", addr, sid);
    result
}

/// Broadcast each stdin line as a `refetch_resource` cache key
async fn broadcast_stdin(sessions: Arc<SessionManager>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let cache_key = line.trim();
        if cache_key.is_empty() {
            continue;
        }

        let payload = serde_json::to_value(RefetchResource::new(cache_key))?;
        let delivered = sessions.broadcast(REFETCH_RESOURCE_EVENT, payload).await;
        info!("refetch_resource {} -> {} namespace(s)", cache_key, delivered);
    }

    Ok(())
}
