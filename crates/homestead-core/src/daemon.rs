//! Detaching the daemon from the terminal that started it.
//!
//! There is no fork. The CLI re-executes its own binary as a detached
//! child with an environment marker, output appended to
//! `{root}/daemon.log`, and exits. The child sees the marker and runs the
//! supervisor in the foreground of its own process group.

use std::ffi::OsString;
use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use tracing::info;

/// Set in the environment of the re-executed child.
pub const DAEMON_ENV_MARKER: &str = "HOMESTEAD_DAEMONIZED";

/// Log file for the detached daemon's stdout/stderr.
pub const DAEMON_LOG_FILENAME: &str = "daemon.log";

#[derive(Debug, Clone)]
pub struct DaemonizeOptions {
    pub storage_root: PathBuf,
    /// Arguments for the re-executed binary (without the program name).
    pub args: Vec<OsString>,
}

/// Result of [`daemonize`], seen from one side of the split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonizeOutcome {
    /// `true` in the launching process, which should report and exit.
    pub parent_should_exit: bool,
    /// Pid of the detached child; `None` inside the child.
    pub child_pid: Option<u32>,
    pub log_path: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum DaemonizeError {
    #[error("cannot locate the current executable: {0}")]
    CurrentExe(io::Error),

    #[error("failed to open daemon log {}: {source}", .path.display())]
    Log { path: PathBuf, source: io::Error },

    #[error("failed to spawn daemon process: {0}")]
    Spawn(io::Error),
}

/// Whether this process is the detached child.
pub fn is_daemonized() -> bool {
    std::env::var_os(DAEMON_ENV_MARKER).is_some_and(|v| v == "1")
}

/// Split into a detached daemon process.
///
/// Inside an already-detached child this is a no-op that reports
/// `parent_should_exit = false`.
pub fn daemonize(options: &DaemonizeOptions) -> Result<DaemonizeOutcome, DaemonizeError> {
    let log_path = options.storage_root.join(DAEMON_LOG_FILENAME);
    if is_daemonized() {
        return Ok(DaemonizeOutcome {
            parent_should_exit: false,
            child_pid: None,
            log_path,
        });
    }

    let exe = std::env::current_exe().map_err(DaemonizeError::CurrentExe)?;
    let mut command = Command::new(exe);
    command.args(&options.args);
    let child_pid = spawn_detached(&mut command, &log_path)?;

    info!(pid = child_pid, log = %log_path.display(), "Daemon process spawned");
    Ok(DaemonizeOutcome {
        parent_should_exit: true,
        child_pid: Some(child_pid),
        log_path,
    })
}

/// Spawn `command` detached with the daemon marker set and output appended
/// to `log_path`.
pub(crate) fn spawn_detached(
    command: &mut Command,
    log_path: &std::path::Path,
) -> Result<u32, DaemonizeError> {
    let log_error = |source| DaemonizeError::Log {
        path: log_path.to_path_buf(),
        source,
    };
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent).map_err(log_error)?;
    }
    let stdout = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .map_err(log_error)?;
    let stderr = stdout.try_clone().map_err(log_error)?;

    command
        .env(DAEMON_ENV_MARKER, "1")
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr);
    detach(command);

    let child = command.spawn().map_err(DaemonizeError::Spawn)?;
    Ok(child.id())
}

#[cfg(unix)]
fn detach(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    command.process_group(0);
}

#[cfg(windows)]
fn detach(command: &mut Command) {
    use std::os::windows::process::CommandExt;
    const DETACHED_PROCESS: u32 = 0x0000_0008;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    command.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
}

#[cfg(not(any(unix, windows)))]
fn detach(_command: &mut Command) {}
