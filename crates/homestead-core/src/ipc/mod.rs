//! Local control channel between the CLI and a running daemon.
//!
//! ```text
//! ┌──────────┐   Unix socket / named pipe   ┌────────────────┐
//! │   CLI    │─────────────────────────────▶│ Control server │
//! │          │   newline-delimited JSON     │                │
//! └──────────┘                              └───────┬────────┘
//!                                                   │
//!                                           ┌───────▼────────┐
//!                                           │   Supervisor   │
//!                                           └────────────────┘
//! ```

pub mod client;
pub mod path;
pub mod protocol;
pub mod server;

pub use client::{ControlClient, ControlClientError};
pub use path::resolve_socket_path;
pub use protocol::{ControlRequest, ControlResponse, ErrorCode};
pub use server::{ControlHandler, ControlListener};
