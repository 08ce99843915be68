//! Connection manager owning the single realtime connection

use super::handle::ConnectionHandle;
use super::heartbeat::HeartbeatTask;
use crate::config::RealtimeConfig;
use crate::resource::ResourceRegistry;
use crate::transport::{RealtimeTransport, TransportEvent};
use crm_realtime_shared::state_machine::{
    ConnectionState, ConnectionStateMachine, Effect, LifecycleEvent,
};
use crm_realtime_shared::{DisconnectReason, RefetchResource, REFETCH_RESOURCE_EVENT};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Owns at most one live connection and one heartbeat timer, and bridges
/// `refetch_resource` events to the resource registry.
///
/// Cloning yields another handle to the same manager.
pub struct RealtimeManager<T, R> {
    shared: Arc<Shared<T, R>>,
}

impl<T, R> Clone for RealtimeManager<T, R> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

struct Shared<T, R> {
    config: RealtimeConfig,
    transport: T,
    registry: R,
    state: Mutex<ManagerState>,
}

struct ManagerState {
    machine: ConnectionStateMachine,
    connection: Option<ActiveConnection>,
    heartbeat: Option<HeartbeatTask>,
    next_connection_id: u64,
}

/// The live connection and the tasks serving it
struct ActiveConnection {
    handle: ConnectionHandle,
    transport_task: Option<JoinHandle<()>>,
    pump: JoinHandle<()>,
}

impl ActiveConnection {
    /// Close the connection. Failures are logged, never returned.
    fn teardown(mut self) {
        if let Err(e) = self.handle.close() {
            warn!("Error disconnecting existing connection: {}", e);
            if let Some(task) = self.transport_task.take() {
                task.abort();
            }
        }
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

impl<T: RealtimeTransport, R: ResourceRegistry> RealtimeManager<T, R> {
    /// Create a manager. No connection is opened until [`initialize`](Self::initialize).
    pub fn new(config: RealtimeConfig, transport: T, registry: R) -> Self {
        let machine = ConnectionStateMachine::new(config.reconnect_warn_max);
        Self {
            shared: Arc::new(Shared {
                config,
                transport,
                registry,
                state: Mutex::new(ManagerState {
                    machine,
                    connection: None,
                    heartbeat: None,
                    next_connection_id: 0,
                }),
            }),
        }
    }

    /// Return the current handle if connected, otherwise replace any
    /// previous connection with a new one. Returns without waiting for the
    /// connection to be established.
    pub fn initialize(&self) -> ConnectionHandle {
        let mut state = self.shared.lock_state();
        if state.machine.is_connected() {
            if let Some(active) = &state.connection {
                return active.handle.clone();
            }
        }
        self.open_connection(&mut state)
    }

    /// Replace the current connection regardless of its state
    pub fn force_reconnect(&self) -> ConnectionHandle {
        info!("Manually reconnecting to realtime server...");
        let mut state = self.shared.lock_state();
        self.open_connection(&mut state)
    }

    /// Close the current connection and wait up to `grace` for the
    /// transport to say goodbye to the server
    pub async fn shutdown(&self, grace: Duration) {
        let (handle, task) = {
            let mut state = self.shared.lock_state();
            let Some(mut active) = state.connection.take() else {
                return;
            };
            let transition = state.machine.process(LifecycleEvent::Disconnect {
                reason: DisconnectReason::IoClientDisconnect,
            });
            self.shared.apply(&mut state, transition.effects);
            (active.handle.clone(), active.transport_task.take())
        };
        info!("Shutting down connection {}", handle.id());

        if handle.is_closed() {
            return;
        }
        if let Err(e) = handle.close() {
            warn!("Error closing connection: {}", e);
            if let Some(task) = task {
                task.abort();
            }
            return;
        }

        if let Some(task) = task {
            let abort = task.abort_handle();
            if timeout(grace, task).await.is_err() {
                warn!("Transport did not close within {:?}", grace);
                abort.abort();
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.lock_state().machine.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock_state().machine.state()
    }

    /// Connection errors since the last successful connect
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.lock_state().machine.reconnect_attempts()
    }

    /// Handle of the current connection, if any
    pub fn handle(&self) -> Option<ConnectionHandle> {
        self.shared
            .lock_state()
            .connection
            .as_ref()
            .map(|active| active.handle.clone())
    }

    pub fn heartbeat_active(&self) -> bool {
        self.shared
            .lock_state()
            .heartbeat
            .as_ref()
            .is_some_and(HeartbeatTask::is_active)
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &R {
        &self.shared.registry
    }

    /// Feed one transport event for `connection_id` through the state machine
    #[cfg(test)]
    pub(crate) fn handle_event(&self, connection_id: u64, event: TransportEvent) {
        self.shared.dispatch(connection_id, event);
    }

    fn open_connection(&self, state: &mut ManagerState) -> ConnectionHandle {
        let config = &self.shared.config;
        let endpoint = config.endpoint();
        info!(
            "Connecting to realtime server at {} ({})",
            endpoint,
            self.shared.transport.name()
        );

        if let Some(previous) = state.connection.take() {
            debug!("Tearing down connection {}", previous.handle.id());
            previous.teardown();
        }
        // Leaving Connected stops the heartbeat
        let transition = state.machine.begin_connecting();
        self.shared.apply(state, transition.effects);

        state.next_connection_id += 1;
        let id = state.next_connection_id;

        let session = self.shared.transport.open(&endpoint, &config.options);
        let handle = ConnectionHandle::new(id, endpoint, session.outbound);
        let pump = tokio::spawn(pump_events(
            Arc::downgrade(&self.shared),
            id,
            session.events,
        ));

        state.connection = Some(ActiveConnection {
            handle: handle.clone(),
            transport_task: session.task,
            pump,
        });

        handle
    }
}

impl<T: RealtimeTransport, R: ResourceRegistry> Shared<T, R> {
    fn lock_state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self, connection_id: u64, event: TransportEvent) {
        let Some(event) = lifecycle_event(event) else {
            return;
        };

        let reloads = {
            let mut state = self.lock_state();
            let current = state.connection.as_ref().map(|active| active.handle.id());
            if current != Some(connection_id) {
                debug!("Ignoring event from stale connection {}", connection_id);
                return;
            }

            log_event(&event);
            let transition = state.machine.process(event);
            if transition.from != transition.to {
                debug!(
                    "Connection state: {:?} -> {:?}",
                    transition.from, transition.to
                );
            }
            self.apply(&mut state, transition.effects)
        };

        for cache_key in reloads {
            self.reload_resource(&cache_key);
        }
    }

    /// Carry out transition effects; returns the cache keys to reload
    fn apply(&self, state: &mut ManagerState, effects: Vec<Effect>) -> Vec<String> {
        let mut reloads = Vec::new();

        for effect in effects {
            match effect {
                Effect::StartHeartbeat => {
                    state.heartbeat = None;
                    state.heartbeat = state.connection.as_ref().map(|active| {
                        HeartbeatTask::spawn(active.handle.clone(), self.config.heartbeat_interval)
                    });
                }
                Effect::StopHeartbeat => {
                    state.heartbeat = None;
                }
                Effect::WarnReconnectExhausted { attempts } => {
                    warn!(
                        "Reached maximum reconnect attempts ({}). Realtime updates are unavailable until the server is reachable again.",
                        attempts
                    );
                }
                Effect::ReloadResource { cache_key } => reloads.push(cache_key),
            }
        }

        reloads
    }

    fn reload_resource(&self, cache_key: &str) {
        let Some(resource) = self.registry.lookup(cache_key) else {
            debug!("No cached resource for {}", cache_key);
            return;
        };

        debug!("Reloading resource {}", cache_key);
        let cache_key = cache_key.to_string();
        tokio::spawn(async move {
            if let Err(e) = resource.reload().await {
                warn!("Failed to reload resource {}: {}", cache_key, e);
            }
        });
    }
}

/// Deliver a connection's events to the manager in order
async fn pump_events<T: RealtimeTransport, R: ResourceRegistry>(
    shared: Weak<Shared<T, R>>,
    connection_id: u64,
    mut events: mpsc::Receiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.dispatch(connection_id, event);
    }
    debug!("Event stream for connection {} ended", connection_id);
}

fn lifecycle_event(event: TransportEvent) -> Option<LifecycleEvent> {
    match event {
        TransportEvent::Connect => Some(LifecycleEvent::Connect),
        TransportEvent::ConnectError { message } => Some(LifecycleEvent::ConnectError { message }),
        TransportEvent::Disconnect { reason } => Some(LifecycleEvent::Disconnect { reason }),
        TransportEvent::Reconnect { attempt } => Some(LifecycleEvent::Reconnect { attempt }),
        TransportEvent::ReconnectFailed => Some(LifecycleEvent::ReconnectFailed),
        TransportEvent::Message { event, data } if event == REFETCH_RESOURCE_EVENT => {
            let payload = match data.map(serde_json::from_value::<RefetchResource>) {
                Some(Ok(payload)) => payload,
                Some(Err(e)) => {
                    debug!("Malformed refetch_resource payload: {}", e);
                    RefetchResource::default()
                }
                None => RefetchResource::default(),
            };
            Some(LifecycleEvent::RefetchResource(payload))
        }
        TransportEvent::Message { event, .. } => {
            debug!("Ignoring realtime event '{}'", event);
            None
        }
    }
}

fn log_event(event: &LifecycleEvent) {
    match event {
        LifecycleEvent::Connect => info!("Realtime connected"),
        LifecycleEvent::ConnectError { message } => {
            error!("Realtime connection error: {}", message)
        }
        LifecycleEvent::Disconnect { reason } => warn!("Realtime disconnected: {}", reason),
        LifecycleEvent::Reconnect { attempt } => {
            info!("Realtime reconnected after {} attempts", attempt)
        }
        LifecycleEvent::ReconnectFailed => error!("Realtime reconnection failed, giving up"),
        LifecycleEvent::RefetchResource(payload) => {
            debug!("Received refetch_resource event: {:?}", payload)
        }
    }
}
