#![deny(unsafe_code)]

//! Configuration loading and validation for Homestead.
//!
//! Loads TOML configuration files and validates them against expected schemas.
//! Provides the [`AppConfig`] type as the central configuration structure,
//! and the [`paths`] module for resolving the server's storage root.

/// Storage-root and well-known file resolution.
pub mod paths;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use paths::{default_config_path, expand_home_path, resolve_root_path};

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Top-level application configuration.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Local HTTP listener configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Reverse tunnel configuration.
    #[serde(default)]
    pub tunnel: TunnelConfig,

    /// Server identity (owner address and signing key location).
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Control channel (CLI ↔ daemon) configuration.
    #[serde(default)]
    pub control: ControlConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Configuration for the local HTTP listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port the local HTTP listener binds; `0` lets the OS pick one.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Address the local HTTP listener binds.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_addr: default_bind_addr(),
        }
    }
}

fn default_port() -> u16 {
    8080
}

fn default_bind_addr() -> String {
    "127.0.0.1".to_string()
}

/// Reverse tunnel configuration.
///
/// ## TOML Example
///
/// ```toml
/// [tunnel]
/// enabled = true
/// server_addr = "frpc.server.vana.org"
/// server_port = 7000
/// public_domain = "server.vana.org"
///
/// [tunnel.restart]
/// max_retries = 5
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Whether the daemon dials out to the tunnel broker.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Tunnel broker control-plane host.
    #[serde(default = "default_tunnel_server_addr")]
    pub server_addr: String,

    /// Tunnel broker control-plane port.
    #[serde(default = "default_tunnel_server_port")]
    pub server_port: u16,

    /// Domain under which the broker publishes `{subdomain}.{public_domain}`.
    #[serde(default = "default_public_domain")]
    pub public_domain: String,

    /// Explicit path to the tunnel client executable.
    #[serde(default)]
    pub binary_path: Option<String>,

    /// How long to wait for the tunnel client to exit after SIGTERM.
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    /// Probe the public URL's `/health` route once connected.
    #[serde(default = "default_true")]
    pub verify: bool,

    /// Managed-restart policy for unexpected tunnel client exits.
    #[serde(default)]
    pub restart: RestartConfig,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            server_addr: default_tunnel_server_addr(),
            server_port: default_tunnel_server_port(),
            public_domain: default_public_domain(),
            binary_path: None,
            grace_period_ms: default_grace_period_ms(),
            verify: true,
            restart: RestartConfig::default(),
        }
    }
}

impl TunnelConfig {
    /// Grace period as a [`Duration`].
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

fn default_true() -> bool {
    true
}

fn default_tunnel_server_addr() -> String {
    "frpc.server.vana.org".to_string()
}

fn default_tunnel_server_port() -> u16 {
    7000
}

fn default_public_domain() -> String {
    "server.vana.org".to_string()
}

fn default_grace_period_ms() -> u64 {
    5_000
}

/// Exponential backoff policy for restarting the tunnel client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Upper bound of the random jitter added to each delay.
    #[serde(default = "default_max_jitter_ms")]
    pub max_jitter_ms: u64,

    /// Consecutive restarts allowed before giving up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Uptime after which the consecutive-restart counter resets.
    #[serde(default = "default_reset_after_ms")]
    pub reset_after_ms: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_jitter_ms: default_max_jitter_ms(),
            max_retries: default_max_retries(),
            reset_after_ms: default_reset_after_ms(),
        }
    }
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_max_jitter_ms() -> u64 {
    1_000
}

fn default_max_retries() -> u32 {
    10
}

fn default_reset_after_ms() -> u64 {
    30_000
}

/// Server identity configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Owner wallet address (`0x…`). Tunneling is disabled without one.
    #[serde(default)]
    pub owner: Option<String>,

    /// Signing key location, relative to the storage root unless absolute.
    #[serde(default = "default_key_file")]
    pub key_file: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            owner: None,
            key_file: default_key_file(),
        }
    }
}

impl IdentityConfig {
    /// Resolve the key file against the storage root.
    pub fn key_path(&self, storage_root: &Path) -> PathBuf {
        let path = Path::new(&self.key_file);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            storage_root.join(path)
        }
    }
}

fn default_key_file() -> String {
    "keys/server.key".to_string()
}

/// Control channel configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Default client-side timeout for a single control request.
    #[serde(default = "default_control_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_control_timeout_ms(),
        }
    }
}

impl ControlConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_control_timeout_ms() -> u64 {
    5_000
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "debug", "trace").
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from a TOML file at the given path using async I/O.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::parse(&content)
    }

    /// Load configuration from `path`, falling back to defaults when the
    /// file does not exist. Any other read or parse failure is an error.
    pub async fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Self::parse(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.bind_addr.is_empty() {
            return Err(ConfigError::Validation(
                "server.bind_addr must not be empty".to_string(),
            ));
        }

        if self.tunnel.server_addr.is_empty() {
            return Err(ConfigError::Validation(
                "tunnel.server_addr must not be empty".to_string(),
            ));
        }
        if self.tunnel.server_port == 0 {
            return Err(ConfigError::Validation(
                "tunnel.server_port must be non-zero".to_string(),
            ));
        }
        if self.tunnel.public_domain.is_empty() {
            return Err(ConfigError::Validation(
                "tunnel.public_domain must not be empty".to_string(),
            ));
        }
        let restart = &self.tunnel.restart;
        if restart.base_delay_ms == 0 {
            return Err(ConfigError::Validation(
                "tunnel.restart.base_delay_ms must be non-zero".to_string(),
            ));
        }
        if restart.max_delay_ms < restart.base_delay_ms {
            return Err(ConfigError::Validation(format!(
                "tunnel.restart.max_delay_ms ({}) must be >= base_delay_ms ({})",
                restart.max_delay_ms, restart.base_delay_ms
            )));
        }

        if let Some(owner) = &self.identity.owner {
            if !is_address(owner) {
                return Err(ConfigError::Validation(format!(
                    "identity.owner must be a 0x-prefixed 20-byte hex address, got {owner:?}"
                )));
            }
        }
        if self.identity.key_file.is_empty() {
            return Err(ConfigError::Validation(
                "identity.key_file must not be empty".to_string(),
            ));
        }

        if self.control.timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "control.timeout_ms must be non-zero".to_string(),
            ));
        }

        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "logging.level must be one of {:?}, got {:?}",
                valid_levels, self.logging.level
            )));
        }

        Ok(())
    }

    /// Whether the tunnel should actually be started: it must be enabled
    /// and an owner address must be configured.
    pub fn tunnel_active(&self) -> bool {
        self.tunnel.enabled && self.identity.owner.is_some()
    }
}

fn is_address(s: &str) -> bool {
    s.len() == 42
        && s.starts_with("0x")
        && s[2..].chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    const OWNER: &str = "0x1234567890abcdef1234567890abcdef12345678";

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.bind_addr, "127.0.0.1");
        assert!(config.tunnel.enabled);
        assert_eq!(config.tunnel.server_port, 7000);
        assert_eq!(config.tunnel.grace_period(), Duration::from_secs(5));
        assert_eq!(config.tunnel.restart.max_retries, 10);
        assert_eq!(config.control.timeout(), Duration::from_secs(5));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_minimal_toml() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_parse_full_toml() {
        let toml = format!(
            r#"
            [server]
            port = 9090

            [tunnel]
            enabled = false
            server_addr = "broker.example.org"
            server_port = 7500
            public_domain = "example.org"
            binary_path = "/opt/frp/frpc"
            grace_period_ms = 1000

            [tunnel.restart]
            base_delay_ms = 200
            max_delay_ms = 800
            max_retries = 3

            [identity]
            owner = "{OWNER}"

            [logging]
            level = "debug"
        "#
        );
        let config = AppConfig::parse(&toml).unwrap();
        assert_eq!(config.server.port, 9090);
        assert!(!config.tunnel.enabled);
        assert_eq!(config.tunnel.server_addr, "broker.example.org");
        assert_eq!(config.tunnel.binary_path.as_deref(), Some("/opt/frp/frpc"));
        assert_eq!(config.tunnel.restart.max_retries, 3);
        assert_eq!(config.tunnel.restart.reset_after_ms, 30_000);
        assert_eq!(config.identity.owner.as_deref(), Some(OWNER));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_validation_rejects_zero_tunnel_port() {
        let result = AppConfig::parse("[tunnel]\nserver_port = 0\n");
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_ephemeral_server_port_is_allowed() {
        let config = AppConfig::parse("[server]\nport = 0\n").unwrap();
        assert_eq!(config.server.port, 0);
    }

    #[test]
    fn test_validation_rejects_bad_owner() {
        let result = AppConfig::parse("[identity]\nowner = \"alice\"\n");
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_validation_rejects_inverted_backoff() {
        let toml = r#"
            [tunnel.restart]
            base_delay_ms = 5000
            max_delay_ms = 1000
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_unknown_log_level() {
        assert!(AppConfig::parse("[logging]\nlevel = \"loud\"\n").is_err());
    }

    #[test]
    fn test_tunnel_requires_owner() {
        let mut config = AppConfig::default();
        assert!(!config.tunnel_active());

        config.identity.owner = Some(OWNER.to_string());
        assert!(config.tunnel_active());

        config.tunnel.enabled = false;
        assert!(!config.tunnel_active());
    }

    #[test]
    fn test_key_path_relative_to_root() {
        let identity = IdentityConfig::default();
        let root = Path::new("/srv/homestead");
        assert_eq!(
            identity.key_path(root),
            PathBuf::from("/srv/homestead/keys/server.key")
        );

        let absolute = IdentityConfig {
            key_file: "/etc/homestead/key".to_string(),
            ..IdentityConfig::default()
        };
        assert_eq!(absolute.key_path(root), PathBuf::from("/etc/homestead/key"));
    }

    // ── Async file-based loading ──────────────────────────────────────

    #[tokio::test]
    async fn test_load_from_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        tokio::fs::write(&path, b"[server]\nport = 4242\n")
            .await
            .unwrap();

        let config = AppConfig::load(&path).await.unwrap();
        assert_eq!(config.server.port, 4242);
    }

    #[tokio::test]
    async fn test_load_nonexistent_file() {
        let result = AppConfig::load(Path::new("/nonexistent/file.toml")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_load_or_default_missing_file() {
        let tmp = TempDir::new().unwrap();
        let config = AppConfig::load_or_default(&tmp.path().join("absent.toml"))
            .await
            .unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[tokio::test]
    async fn test_load_or_default_invalid_toml_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.toml");
        tokio::fs::write(&path, b"not valid toml [[[")
            .await
            .unwrap();

        let result = AppConfig::load_or_default(&path).await;
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::Validation("bad value".to_string());
        assert_eq!(err.to_string(), "validation error: bad value");
    }
}
