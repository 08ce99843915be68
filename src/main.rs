use anyhow::Result;
use clap::Parser;
use crm_realtime::resource::{ResourceCache, StatusDoctype, StatusList};
use crm_realtime::transport::SocketIoTransport;
use crm_realtime::{RealtimeConfig, RealtimeManager};
use crm_realtime_shared::defaults;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

type Manager = RealtimeManager<SocketIoTransport, Arc<ResourceCache>>;

/// Realtime invalidation client for the CRM
#[derive(Parser, Debug)]
#[command(name = "crm-realtime", version, about)]
struct Cli {
    /// Host of the realtime server
    #[arg(long, env = "CRM_REALTIME_HOST", default_value = "localhost")]
    host: String,

    /// Port of the realtime server
    #[arg(long, env = "CRM_REALTIME_PORT", default_value_t = defaults::SOCKETIO_PORT)]
    port: u16,

    /// Site name, used as the Socket.IO namespace
    #[arg(long, env = "SITE_NAME", default_value = defaults::DEFAULT_SITE_NAME)]
    site_name: String,

    /// `https` connects over `wss://`
    #[arg(long, default_value = defaults::DEFAULT_SCHEME, value_parser = ["http", "https"])]
    scheme: String,

    /// Cookie header sent on the handshake, e.g. `sid=...`
    #[arg(long, env = "CRM_SID_COOKIE")]
    cookie: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        debug!("TLS crypto provider already installed");
    }

    let mut config = RealtimeConfig {
        scheme: cli.scheme,
        host: cli.host,
        port: cli.port,
        site_name: cli.site_name,
        ..Default::default()
    };
    config.options.credentials = cli.cookie;

    info!("CRM realtime client starting: {}", config.site_name);
    info!("  Realtime server: {}", config.endpoint());

    let registry = Arc::new(ResourceCache::new());
    let status_lists: Vec<Arc<StatusList>> = StatusDoctype::ALL
        .into_iter()
        .map(|kind| {
            let list = Arc::new(StatusList::new(kind));
            registry.register_list(list.clone());
            list
        })
        .collect();
    info!("Registered {} cached resources", registry.len());

    let manager: Manager = RealtimeManager::new(config, SocketIoTransport, registry);
    let handle = manager.initialize();
    info!("Opened connection {}", handle.id());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) => match line.trim() {
                    "" => {}
                    "status" => print_status(&manager, &status_lists),
                    "reconnect" => {
                        let handle = manager.force_reconnect();
                        info!("Opened connection {}", handle.id());
                    }
                    "quit" | "exit" => break,
                    other => warn!("Unknown command '{}' (try: status, reconnect, quit)", other),
                },
                None => stdin_open = false,
            },
        }
    }

    manager.shutdown(Duration::from_secs(2)).await;
    info!("Shutdown complete");
    Ok(())
}

fn print_status(manager: &Manager, status_lists: &[Arc<StatusList>]) {
    info!(
        "state={:?} reconnect_attempts={} heartbeat={}",
        manager.state(),
        manager.reconnect_attempts(),
        manager.heartbeat_active()
    );
    info!(
        "  endpoint={} cached_resources={}",
        manager.config().endpoint(),
        manager.registry().len()
    );
    for list in status_lists {
        info!(
            "  {}: {} reloads (last at {})",
            list.kind().cache_key(),
            list.reload_count(),
            list.last_reload_ms()
        );
    }
}
