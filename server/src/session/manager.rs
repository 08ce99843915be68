//! Session manager for tracking all connected clients

use super::connection::SessionHandle;
use crm_realtime_shared::now_ms;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

/// Manages all active client sessions
pub struct SessionManager {
    /// Map of sid -> session handle
    sessions: Arc<RwLock<HashMap<String, SessionHandle>>>,
    next_id: AtomicU64,
}

impl SessionManager {
    /// Create a new session manager
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Allocate a session id
    pub fn next_sid(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        format!("{:x}{:04x}", now_ms(), n)
    }

    /// Register a client session
    pub async fn register(&self, handle: SessionHandle) {
        let mut sessions = self.sessions.write().await;
        sessions.insert(handle.sid.clone(), handle);
    }

    /// Unregister a client session
    pub async fn unregister(&self, sid: &str) {
        let mut sessions = self.sessions.write().await;
        sessions.remove(sid);
    }

    /// Emit an event on every namespace every client has joined.
    /// Returns the number of deliveries.
    pub async fn broadcast(&self, event: &str, data: Value) -> usize {
        let sessions = self.sessions.read().await;
        let mut delivered = 0;

        for (sid, handle) in sessions.iter() {
            for namespace in handle.namespaces().await {
                match handle.emit(&namespace, event, data.clone()).await {
                    Ok(true) => delivered += 1,
                    Ok(false) => {}
                    Err(e) => warn!("Failed to send to {}: {}", sid, e),
                }
            }
        }

        delivered
    }

    /// Get the number of connected clients
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}
