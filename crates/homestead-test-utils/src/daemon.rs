//! Daemon test helpers.
//!
//! [`TestRoot`] is a throwaway storage root with a config file, ready to
//! hand to [`Supervisor::start`](homestead_core::Supervisor::start).

use std::path::{Path, PathBuf};
use std::time::Duration;

use homestead_config::AppConfig;
use homestead_core::{ControlClient, SupervisorOptions, resolve_socket_path};
use tempfile::TempDir;

/// A test-scoped storage root.
///
/// The temp directory is deleted automatically when this value is dropped,
/// guaranteeing cleanup even on panic.
pub struct TestRoot {
    pub config: AppConfig,
    pub config_path: PathBuf,
    temp_dir: TempDir,
}

impl TestRoot {
    /// Create a root whose `config.toml` holds `config`.
    pub async fn new(config: AppConfig) -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let config_path = temp_dir.path().join("config.toml");
        let root = Self {
            config,
            config_path,
            temp_dir,
        };
        root.write_config(&root.config).await;
        root
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Supervisor options for this root. Signal handlers stay off so a
    /// test run is never stopped by a stray Ctrl-C.
    pub fn options(&self) -> SupervisorOptions {
        SupervisorOptions::new(
            self.path().to_path_buf(),
            self.config_path.clone(),
            self.config.clone(),
        )
        .without_signal_handlers()
    }

    /// A control client for this root's socket.
    pub fn client(&self) -> ControlClient {
        ControlClient::new(resolve_socket_path(self.path()), Duration::from_secs(5))
    }

    /// Overwrite the config file (for reload testing).
    pub async fn write_config(&self, config: &AppConfig) {
        let toml = toml::to_string(config).expect("failed to serialize test config");
        tokio::fs::write(&self.config_path, toml)
            .await
            .expect("failed to write test config");
    }
}
