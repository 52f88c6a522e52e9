//! Log capture for tests that assert on what the daemon logged.
//!
//! [`capture_logs`] installs a thread-scoped subscriber: an env filter, the
//! test-harness writer, and a [`LogCollector`]. Under the default
//! current-thread `#[tokio::test]` runtime every spawned task runs on the
//! test thread and is captured. Tests on a multi-thread runtime only see
//! events emitted on the test thread.

use homestead_core::{LogCollector, LogReader};
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;

/// Ring buffer size for captured entries.
pub const TEST_LOG_CAPACITY: usize = 500;

/// Start capturing. Events are collected until the guard is dropped.
///
/// ```ignore
/// let (logs, _guard) = homestead_test_utils::capture_logs();
/// let options = root.options().with_logs(logs.clone());
/// ```
pub fn capture_logs() -> (LogReader, DefaultGuard) {
    let collector = LogCollector::new(TEST_LOG_CAPACITY);
    let reader = collector.reader();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("homestead_core=debug,info"));
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .with(collector);

    (reader, tracing::subscriber::set_default(subscriber))
}
