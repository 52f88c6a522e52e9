//! Configuration builders for tests.
//!
//! Use [`TestConfigBuilder`] to create customised [`AppConfig`] values without
//! repeating boilerplate across crate boundaries. The defaults differ from
//! production in two ways: the HTTP port is `0` (ephemeral) and the tunnel
//! is off.

use homestead_config::AppConfig;

/// A syntactically valid owner address for tests.
pub const TEST_OWNER: &str = "0x00000000000000000000000000000000000000aa";

/// Fluent builder for [`AppConfig`] in tests.
///
/// # Example
///
/// ```ignore
/// let config = TestConfigBuilder::new()
///     .owner(TEST_OWNER)
///     .tunnel_enabled(true)
///     .build();
/// ```
pub struct TestConfigBuilder {
    config: AppConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        let mut config = AppConfig::default();
        config.server.port = 0;
        config.tunnel.enabled = false;
        config.tunnel.verify = false;
        Self { config }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.server.port = port;
        self
    }

    pub fn tunnel_enabled(mut self, enabled: bool) -> Self {
        self.config.tunnel.enabled = enabled;
        self
    }

    pub fn owner(mut self, owner: &str) -> Self {
        self.config.identity.owner = Some(owner.to_string());
        self
    }

    pub fn tunnel_binary(mut self, path: &std::path::Path) -> Self {
        self.config.tunnel.binary_path = Some(path.display().to_string());
        self
    }

    pub fn grace_period_ms(mut self, ms: u64) -> Self {
        self.config.tunnel.grace_period_ms = ms;
        self
    }

    /// Millisecond-scale restart backoff with no jitter.
    pub fn fast_restarts(mut self, max_retries: u32) -> Self {
        let restart = &mut self.config.tunnel.restart;
        restart.base_delay_ms = 10;
        restart.max_delay_ms = 50;
        restart.max_jitter_ms = 0;
        restart.max_retries = max_retries;
        self
    }

    pub fn log_level(mut self, level: &str) -> Self {
        self.config.logging.level = level.to_string();
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
