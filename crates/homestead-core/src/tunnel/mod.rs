//! Reverse tunnel: exposes the local HTTP listener at a public URL through
//! an frp client subprocess.
//!
//! - [`claim`]: server identity and the signed claim the broker checks
//! - [`frpc`]: rendering the client's TOML config
//! - [`binary`]: finding the client executable
//! - [`signals`]: classifying the client's log output
//! - [`restart`]: backoff for unexpected exits
//! - [`verify`]: probing the public URL from outside
//! - [`manager`]: the subprocess lifecycle tying these together

use std::io;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod binary;
pub mod claim;
pub mod frpc;
pub mod manager;
pub mod restart;
pub mod signals;
pub mod verify;

pub use claim::{ServerIdentity, SignedClaim, generate_signed_claim};
pub use manager::{TunnelEvent, TunnelLaunch, TunnelManager, TunnelOutcome};
pub use restart::RestartPolicy;

/// Tunnel connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelStatus {
    Stopped,
    Connecting,
    Connected,
    Error,
}

impl std::fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Snapshot of the tunnel, as reported by `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelStatusInfo {
    pub status: TunnelStatus,
    pub enabled: bool,
    pub public_url: Option<String>,
    pub connected_since: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Default for TunnelStatusInfo {
    fn default() -> Self {
        Self {
            status: TunnelStatus::Stopped,
            enabled: true,
            public_url: None,
            connected_since: None,
            last_error: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("tunnel is already running")]
    AlreadyRunning,

    #[error("tunnel client binary not found (searched: {})", display_paths(.searched))]
    BinaryNotFound { searched: Vec<PathBuf> },

    #[error("failed to launch tunnel client {}: {source}", .binary.display())]
    Spawn { binary: PathBuf, source: io::Error },

    #[error("failed to access server key {}: {source}", .path.display())]
    Key { path: PathBuf, source: io::Error },

    #[error("server key {} is not a valid hex-encoded seed", .0.display())]
    InvalidKey(PathBuf),

    #[error("invalid claim: {0}")]
    InvalidClaim(String),

    #[error("tunnel authentication failed: {0}")]
    AuthFailed(String),

    #[error("tunnel client exited ({})", exit_code(.code))]
    ProcessExit { code: Option<i32> },

    #[error("failed to render tunnel config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("failed to encode claim: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn exit_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {code}"),
        None => "killed by signal".to_string(),
    }
}
