//! Realtime client configuration

use crm_realtime_shared::{codec::ROOT_NAMESPACE, defaults};
use std::fmt;
use std::time::Duration;

/// Where the realtime server lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub site_name: String,
    /// Engine.IO request path
    pub path: String,
}

impl Endpoint {
    pub fn new(
        scheme: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        site_name: impl Into<String>,
    ) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
            port,
            site_name: site_name.into(),
            path: defaults::ENGINE_IO_PATH.into(),
        }
    }

    /// Socket.IO namespace for the site
    pub fn namespace(&self) -> String {
        if self.site_name.is_empty() {
            ROOT_NAMESPACE.to_string()
        } else {
            format!("/{}", self.site_name)
        }
    }

    /// WebSocket URL of the Engine.IO endpoint
    pub fn websocket_url(&self) -> String {
        let scheme = match self.scheme.as_str() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        format!(
            "{}://{}:{}{}?EIO=4&transport=websocket",
            scheme, self.host, self.port, self.path
        )
    }
}

/// `{scheme}://{host}:{port}/{site}`
impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}:{}/{}",
            self.scheme, self.host, self.port, self.site_name
        )
    }
}

/// Options handed to the transport
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Send credentials on the handshake
    pub with_credentials: bool,
    /// Cookie header sent when `with_credentials` is set
    pub credentials: Option<String>,
    /// Whether the transport reconnects on its own
    pub reconnection: bool,
    /// Transport retry budget
    pub reconnection_attempts: u32,
    /// Initial reconnection delay
    pub reconnection_delay: Duration,
    /// Maximum reconnection delay
    pub reconnection_delay_max: Duration,
    /// Handshake timeout
    pub timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            with_credentials: true,
            credentials: None,
            reconnection: true,
            reconnection_attempts: defaults::RECONNECTION_ATTEMPTS,
            reconnection_delay: Duration::from_millis(defaults::RECONNECTION_DELAY_MS),
            reconnection_delay_max: Duration::from_millis(defaults::RECONNECTION_DELAY_MAX_MS),
            timeout: Duration::from_millis(defaults::HANDSHAKE_TIMEOUT_MS),
        }
    }
}

/// Configuration for the connection manager
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub scheme: String,
    /// Host of the current execution environment
    pub host: String,
    pub port: u16,
    /// Site identifier, also the Socket.IO namespace
    pub site_name: String,
    pub options: ConnectOptions,
    /// Connection errors before warning that reconnection is exhausted
    pub reconnect_warn_max: u32,
    pub heartbeat_interval: Duration,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            scheme: defaults::DEFAULT_SCHEME.into(),
            host: "localhost".into(),
            port: defaults::SOCKETIO_PORT,
            site_name: defaults::DEFAULT_SITE_NAME.into(),
            options: ConnectOptions::default(),
            reconnect_warn_max: defaults::RECONNECT_WARN_MAX,
            heartbeat_interval: Duration::from_millis(defaults::HEARTBEAT_INTERVAL_MS),
        }
    }
}

impl RealtimeConfig {
    /// Compose the endpoint from host, port and site
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(&self.scheme, &self.host, self.port, &self.site_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_url() {
        let config = RealtimeConfig {
            host: "example.com".into(),
            site_name: "acme.local".into(),
            ..Default::default()
        };
        let endpoint = config.endpoint();

        assert_eq!(endpoint.to_string(), "http://example.com:9000/acme.local");
        assert_eq!(endpoint.namespace(), "/acme.local");
        assert_eq!(
            endpoint.websocket_url(),
            "ws://example.com:9000/socket.io/?EIO=4&transport=websocket"
        );
    }

    #[test]
    fn test_secure_scheme_uses_wss() {
        let endpoint = Endpoint::new("https", "crm.example.com", 443, "crm.example.com");
        assert!(endpoint.websocket_url().starts_with("wss://crm.example.com:443/"));
    }

    #[test]
    fn test_defaults() {
        let config = RealtimeConfig::default();
        assert_eq!(config.site_name, "newcrm.localhost");
        assert_eq!(config.port, 9000);
        assert_eq!(config.reconnect_warn_max, 5);
        assert_eq!(config.options.reconnection_attempts, 10);
        assert_eq!(config.options.reconnection_delay, Duration::from_secs(1));
        assert_eq!(config.options.reconnection_delay_max, Duration::from_secs(5));
        assert_eq!(config.options.timeout, Duration::from_secs(10));
        assert!(config.options.with_credentials);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
    }
}
