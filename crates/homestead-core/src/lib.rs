#![deny(unsafe_code)]

//! Homestead runtime control plane.
//!
//! Owns everything that decides what mode the personal server is in and
//! how it is reached: the runtime state machine, the endpoint ownership
//! matrix, the local control channel used by the CLI, the PID registry,
//! and the reverse-tunnel manager. The [`Supervisor`] wires these together
//! for a running daemon.

use std::future::Future;
use std::pin::Pin;

/// A type-erased, `Send`-safe, boxed future, used where async trait methods
/// need dynamic dispatch (`dyn ControlHandler`).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Version and build metadata.
pub mod build_info;
/// Process detachment for `homestead start`.
pub mod daemon;
/// Endpoint ownership matrix: per-route transport and auth requirements.
pub mod endpoints;
/// Local HTTP listener and the transport guard middleware.
pub mod http;
/// Control channel: socket path resolution, wire protocol, server, client.
pub mod ipc;
/// In-memory log collector served over the control channel.
pub mod logging;
/// PID registry (`server.json`).
pub mod pid;
/// Runtime state machine and transition listeners.
pub mod state;
/// Startup/shutdown orchestration.
pub mod supervisor;
/// Reverse tunnel: signed claims, client config, subprocess lifecycle.
pub mod tunnel;

pub use daemon::{DaemonizeError, DaemonizeOptions, DaemonizeOutcome, daemonize, is_daemonized};
pub use endpoints::{AuthModel, EndpointSpec, Transport};
pub use ipc::{ControlClient, resolve_socket_path};
pub use logging::{LogCollector, LogReader};
pub use pid::{PidRegistry, ServerMetadata};
pub use state::{RuntimeEvent, RuntimeState, RuntimeStateMachine, StateTransitionEvent};
pub use supervisor::{ShutdownSignal, Supervisor, SupervisorError, SupervisorOptions};
pub use tunnel::{TunnelManager, TunnelStatus, TunnelStatusInfo};
