#![deny(unsafe_code)]

//! Shared test utilities for the Homestead workspace.
//!
//! Provides config builders, throwaway storage roots, a scriptable stand-in
//! for the tunnel client, and tracing helpers so that integration tests
//! stay concise and consistent.
//!
//! Only integration tests (`tests/`) may use this crate; it depends on
//! `homestead-core` itself.
//!
//! ```toml
//! [dev-dependencies]
//! homestead-test-utils = { workspace = true }
//! ```

pub mod config;
pub mod daemon;
pub mod frpc;
pub mod tracing_setup;

pub use config::TestConfigBuilder;
pub use daemon::TestRoot;
pub use tracing_setup::capture_logs;
