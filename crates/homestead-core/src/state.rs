//! Runtime state machine.
//!
//! | From                          | Event                 | To        |
//! |-------------------------------|-----------------------|-----------|
//! | Stopped                       | `StartRequested`      | Starting  |
//! | Starting                      | `ListenerBound`       | LocalOnly |
//! | LocalOnly                     | `TunnelConnected`     | Tunneled  |
//! | Tunneled                      | `TunnelDropped`       | LocalOnly |
//! | LocalOnly, Tunneled           | `StopRequested`       | Stopping  |
//! | Starting, LocalOnly, Tunneled | `UnrecoverableError`  | Faulted   |
//! | Stopping                      | `Closed`              | Stopped   |
//! | Faulted                       | `StopRequested`       | Stopped   |
//!
//! The table is total: any (state, event) pair not listed in
//! [`RuntimeState::next`] is rejected with [`StateError::InvalidTransition`]
//! and leaves the state untouched.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// The daemon's operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeState {
    Stopped,
    Starting,
    LocalOnly,
    Tunneled,
    Stopping,
    Faulted,
}

impl RuntimeState {
    pub const ALL: [RuntimeState; 6] = [
        Self::Stopped,
        Self::Starting,
        Self::LocalOnly,
        Self::Tunneled,
        Self::Stopping,
        Self::Faulted,
    ];

    /// The state reached by applying `event`, if the pair is allowed.
    pub fn next(self, event: RuntimeEvent) -> Option<RuntimeState> {
        use RuntimeEvent as E;
        use RuntimeState as S;

        match (self, event) {
            (S::Stopped, E::StartRequested) => Some(S::Starting),
            (S::Starting, E::ListenerBound) => Some(S::LocalOnly),
            (S::LocalOnly, E::TunnelConnected) => Some(S::Tunneled),
            (S::Tunneled, E::TunnelDropped) => Some(S::LocalOnly),
            (S::LocalOnly | S::Tunneled, E::StopRequested) => Some(S::Stopping),
            (S::Starting | S::LocalOnly | S::Tunneled, E::UnrecoverableError) => Some(S::Faulted),
            (S::Stopping, E::Closed) => Some(S::Stopped),
            (S::Faulted, E::StopRequested) => Some(S::Stopped),
            _ => None,
        }
    }

    /// Whether the daemon is serving requests in this state.
    pub fn is_serving(self) -> bool {
        matches!(self, Self::LocalOnly | Self::Tunneled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::LocalOnly => "local_only",
            Self::Tunneled => "tunneled",
            Self::Stopping => "stopping",
            Self::Faulted => "faulted",
        }
    }
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs that drive the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeEvent {
    StartRequested,
    ListenerBound,
    TunnelConnected,
    TunnelDropped,
    StopRequested,
    UnrecoverableError,
    /// The local listener and the tunnel subprocess have both closed.
    Closed,
}

impl RuntimeEvent {
    pub const ALL: [RuntimeEvent; 7] = [
        Self::StartRequested,
        Self::ListenerBound,
        Self::TunnelConnected,
        Self::TunnelDropped,
        Self::StopRequested,
        Self::UnrecoverableError,
        Self::Closed,
    ];
}

impl fmt::Display for RuntimeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::StartRequested => "start_requested",
            Self::ListenerBound => "listener_bound",
            Self::TunnelConnected => "tunnel_connected",
            Self::TunnelDropped => "tunnel_dropped",
            Self::StopRequested => "stop_requested",
            Self::UnrecoverableError => "unrecoverable_error",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Emitted to listeners after every accepted transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransitionEvent {
    pub from: RuntimeState,
    pub to: RuntimeState,
    pub cause: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("invalid transition: event {event} is not allowed in state {state}")]
    InvalidTransition {
        state: RuntimeState,
        event: RuntimeEvent,
    },
}

/// Handle returned by [`RuntimeStateMachine::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

type Listener = Box<dyn Fn(&StateTransitionEvent) + Send + Sync>;

/// Holds the authoritative [`RuntimeState`] and its listeners.
///
/// Not internally synchronized; the supervisor keeps it behind its
/// control-plane mutex.
pub struct RuntimeStateMachine {
    state: RuntimeState,
    listeners: BTreeMap<SubscriptionId, Listener>,
    next_id: u64,
}

impl Default for RuntimeStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RuntimeStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeStateMachine")
            .field("state", &self.state)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl RuntimeStateMachine {
    pub fn new() -> Self {
        Self {
            state: RuntimeState::Stopped,
            listeners: BTreeMap::new(),
            next_id: 0,
        }
    }

    pub fn state(&self) -> RuntimeState {
        self.state
    }

    /// Whether `event` would be accepted in the current state.
    pub fn can_handle(&self, event: RuntimeEvent) -> bool {
        self.state.next(event).is_some()
    }

    /// Apply `event`. On success every listener sees the transition, in
    /// registration order, after the state has changed.
    pub fn transition(
        &mut self,
        event: RuntimeEvent,
        cause: impl Into<String>,
    ) -> Result<StateTransitionEvent, StateError> {
        let from = self.state;
        let to = from.next(event).ok_or(StateError::InvalidTransition {
            state: from,
            event,
        })?;

        self.state = to;
        let transition = StateTransitionEvent {
            from,
            to,
            cause: cause.into(),
            timestamp: Utc::now(),
        };
        debug!(%from, %to, %event, cause = %transition.cause, "Runtime state changed");

        for (id, listener) in &self.listeners {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener(&transition)));
            if outcome.is_err() {
                warn!(subscription = id.0, %from, %to, "State listener panicked");
            }
        }

        Ok(transition)
    }

    /// Register a listener. Listeners cannot veto a transition.
    pub fn subscribe<F>(&mut self, listener: F) -> SubscriptionId
    where
        F: Fn(&StateTransitionEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.listeners.insert(id, Box::new(listener));
        id
    }

    /// Remove a listener. Returns `false` if the handle was unknown.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.listeners.remove(&id).is_some()
    }
}
