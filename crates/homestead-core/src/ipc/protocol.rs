//! Wire format for the control channel.
//!
//! Each message is one JSON object terminated by `\n`. A request is
//! `{"command": "...", "args": {...}}`; a response is either
//! `{"ok": true, "result": ...}` or
//! `{"ok": false, "error": {"code": "...", "message": "..."}}`.
//! Both the server (daemon) and client (CLI) use these types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::logging::LogEntry;
use crate::state::RuntimeState;
use crate::tunnel::TunnelStatusInfo;

/// Largest accepted frame, excluding the trailing newline.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Command names understood by the daemon.
pub mod commands {
    pub const STATUS: &str = "status";
    pub const STOP: &str = "stop";
    pub const RELOAD: &str = "reload";
    pub const HEALTH: &str = "health";
    pub const LOGS: &str = "logs";
}

/// A control request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlRequest {
    pub command: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

impl ControlRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Map::new(),
        }
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }
}

/// A control response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ControlResponse {
    pub fn success(result: Value) -> Self {
        Self {
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(ErrorBody {
                code,
                message: message.into(),
            }),
        }
    }
}

/// Error payload of a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The command name is not recognised.
    UnknownCommand,
    /// The frame could not be decoded; the connection is closed after this.
    Protocol,
    /// Arguments were present but invalid.
    InvalidArgs,
    /// A state change was rejected.
    InvalidTransition,
    /// The command was understood but failed.
    Internal,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::UnknownCommand => "unknown_command",
            Self::Protocol => "protocol",
            Self::InvalidArgs => "invalid_args",
            Self::InvalidTransition => "invalid_transition",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Frame decoding failures. Any of these terminates the connection.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame exceeds {max} bytes")]
    FrameTooLarge { max: usize },

    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("frame is not valid UTF-8")]
    NotUtf8,
}

/// Decode one request frame (without its trailing newline).
pub fn decode_request(frame: &[u8]) -> Result<ControlRequest, ProtocolError> {
    if frame.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge { max: MAX_FRAME_LEN });
    }
    let text = std::str::from_utf8(frame).map_err(|_| ProtocolError::NotUtf8)?;
    Ok(serde_json::from_str(text.trim_end_matches('\r'))?)
}

/// Encode a message as one newline-terminated frame.
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(b'\n');
    Ok(bytes)
}

// ── Command results ─────────────────────────────────────────────────

/// Result of `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResult {
    pub runtime_state: RuntimeState,
    pub tunnel: TunnelStatusInfo,
    pub pid: u32,
    pub port: u16,
    pub control_address: String,
    pub root_path: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub version: String,
}

/// Result of `stop`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopResult {
    pub acknowledged: bool,
    /// State observed after the request was applied.
    pub runtime_state: RuntimeState,
    /// `true` when another stop was already in progress or complete.
    pub already_stopping: bool,
}

/// Result of `reload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReloadResult {
    pub tunnel_enabled: bool,
    /// Settings that changed but only take effect after a restart.
    pub restart_required: Vec<String>,
    pub tunnel_status: TunnelStatusInfo,
}

/// Result of `health`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResult {
    pub status: String,
    pub version: String,
    pub pid: u32,
    pub uptime_secs: u64,
}

/// Result of `logs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogsResult {
    pub entries: Vec<LogEntry>,
    pub total: usize,
}
