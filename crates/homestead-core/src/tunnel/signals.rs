//! Classification of tunnel client output.
//!
//! The frp client reports progress only through its log lines, so the
//! patterns below are tied to a specific client release. Bump
//! [`FRPC_VERSION`] and revisit the patterns together.

/// Client release the patterns were taken from.
pub const FRPC_VERSION: &str = "0.67.0";

/// What a log line tells us about the tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelSignal {
    /// Logged in and the proxy is registered with the broker.
    Registered,
    /// The broker rejected our login or proxy claim.
    AuthFailed(String),
    /// The control connection to the broker dropped.
    Disconnected(String),
}

const REGISTERED: &[&str] = &["start proxy success", "login to server success"];

/// Texts the broker sends back when it refuses the credentials themselves.
const AUTH_FAILED: &[&str] = &[
    "authorization failed",
    "authentication failed",
    "plugin reject",
    "token in login doesn't match",
];

/// Lost or unreachable broker. Login failures land here unless the reason
/// is one of [`AUTH_FAILED`].
const DISCONNECTED: &[&str] = &[
    "login to the server failed",
    "login to server failed",
    "control writer is closing",
    "try to reconnect to server",
    "connection closed",
    "connect to server error",
    "connection refused",
    "session shutdown",
    "i/o timeout",
];

/// Classify one output line. Unrecognised lines return `None`.
///
/// Auth texts are checked first because frp prefixes them with the same
/// "login to the server failed" it uses for network errors.
pub fn classify_line(line: &str) -> Option<TunnelSignal> {
    let lower = line.to_ascii_lowercase();
    let has = |patterns: &[&str]| patterns.iter().any(|p| lower.contains(p));

    if has(AUTH_FAILED) {
        Some(TunnelSignal::AuthFailed(line.trim().to_string()))
    } else if has(REGISTERED) {
        Some(TunnelSignal::Registered)
    } else if has(DISCONNECTED) {
        Some(TunnelSignal::Disconnected(line.trim().to_string()))
    } else {
        None
    }
}
