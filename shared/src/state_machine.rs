//! Connection State Machine
//!
//! Turns connection lifecycle events into state changes and the side effects
//! the connection manager has to carry out.

use crate::{defaults, DisconnectReason, RefetchResource};

/// Connection state as seen by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Events delivered on a connection's event stream
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    /// Namespace connected
    Connect,
    /// A connection attempt failed
    ConnectError { message: String },
    /// An established connection ended
    Disconnect { reason: DisconnectReason },
    /// Connected again after one or more failed attempts
    Reconnect { attempt: u32 },
    /// The transport gave up after its retry budget
    ReconnectFailed,
    /// Server asked for a cached resource to be reloaded
    RefetchResource(RefetchResource),
}

/// Side effects requested by a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Arm the heartbeat, replacing any running timer
    StartHeartbeat,
    /// Cancel the heartbeat
    StopHeartbeat,
    /// Warn once that automatic reconnection attempts are exhausted
    WarnReconnectExhausted { attempts: u32 },
    /// Reload the resource cached under this key
    ReloadResource { cache_key: String },
}

/// Result of processing one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub effects: Vec<Effect>,
}

/// The connection state machine
#[derive(Debug)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    reconnect_attempts: u32,
    warn_threshold: u32,
    warned: bool,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new(defaults::RECONNECT_WARN_MAX)
    }
}

impl ConnectionStateMachine {
    /// Create a new state machine in Disconnected state
    pub fn new(warn_threshold: u32) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            reconnect_attempts: 0,
            warn_threshold,
            warned: false,
        }
    }

    /// Get current state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Connection errors since the last successful connect
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    /// A new connection is being opened. The reconnect counter is kept so
    /// repeated manual reconnects against a dead server still warn.
    pub fn begin_connecting(&mut self) -> Transition {
        self.enter(ConnectionState::Connecting, Vec::new())
    }

    /// Process an event and return the transition result
    pub fn process(&mut self, event: LifecycleEvent) -> Transition {
        match event {
            LifecycleEvent::Connect => {
                self.reset_attempts();
                self.enter(ConnectionState::Connected, vec![Effect::StartHeartbeat])
            }
            LifecycleEvent::Reconnect { .. } => {
                self.reset_attempts();
                // Already armed by the connect that normally precedes this event
                let effects = if self.is_connected() {
                    Vec::new()
                } else {
                    vec![Effect::StartHeartbeat]
                };
                self.enter(ConnectionState::Connected, effects)
            }
            LifecycleEvent::ConnectError { .. } => {
                self.reconnect_attempts += 1;
                let mut effects = Vec::new();
                if self.reconnect_attempts >= self.warn_threshold && !self.warned {
                    self.warned = true;
                    effects.push(Effect::WarnReconnectExhausted {
                        attempts: self.reconnect_attempts,
                    });
                }
                self.enter(ConnectionState::Connecting, effects)
            }
            LifecycleEvent::Disconnect { .. } | LifecycleEvent::ReconnectFailed => {
                self.enter(ConnectionState::Disconnected, Vec::new())
            }
            LifecycleEvent::RefetchResource(payload) => {
                let effects = payload
                    .key()
                    .map(|key| {
                        vec![Effect::ReloadResource {
                            cache_key: key.to_string(),
                        }]
                    })
                    .unwrap_or_default();
                Transition {
                    from: self.state,
                    to: self.state,
                    effects,
                }
            }
        }
    }

    fn reset_attempts(&mut self) {
        self.reconnect_attempts = 0;
        self.warned = false;
    }

    /// Move to `to`, stopping the heartbeat first when leaving Connected
    fn enter(&mut self, to: ConnectionState, mut effects: Vec<Effect>) -> Transition {
        let from = self.state;
        if from == ConnectionState::Connected && to != ConnectionState::Connected {
            effects.insert(0, Effect::StopHeartbeat);
        }
        self.state = to;
        Transition { from, to, effects }
    }
}
