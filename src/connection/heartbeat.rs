//! Liveness heartbeat

use super::handle::ConnectionHandle;
use crm_realtime_shared::{HeartbeatPayload, HEARTBEAT_EVENT};
use serde_json::json;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::debug;

/// Recurring heartbeat on one connection. Dropping it cancels the timer.
pub struct HeartbeatTask {
    task: JoinHandle<()>,
}

impl HeartbeatTask {
    /// Emit a heartbeat every `period`, starting one period from now
    pub fn spawn(handle: ConnectionHandle, period: Duration) -> Self {
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let payload = json!(HeartbeatPayload::now());
                if let Err(e) = handle.emit(HEARTBEAT_EVENT, payload).await {
                    debug!("Heartbeat stopped on connection {}: {}", handle.id(), e);
                    break;
                }
            }
        });

        Self { task }
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for HeartbeatTask {
    fn drop(&mut self) {
        self.task.abort();
    }
}
