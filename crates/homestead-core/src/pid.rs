//! PID registry: the `server.json` file describing the running daemon.
//!
//! The registry is a stateless persistence adapter. The supervisor owns
//! the metadata; anyone wanting to find a running daemon reads it here.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// File name inside the storage root.
pub const PID_FILENAME: &str = "server.json";

/// What a running daemon records about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMetadata {
    #[serde(rename = "pid")]
    pub process_id: u32,
    pub control_address: String,
    pub root_path: String,
    pub started_at: DateTime<Utc>,
    pub port: u16,
    pub version: String,
}

#[derive(Debug, thiserror::Error)]
pub enum PidError {
    #[error("failed to write PID file {}: {source}", .path.display())]
    Write { path: PathBuf, source: io::Error },

    #[error("failed to remove PID file {}: {source}", .path.display())]
    Remove { path: PathBuf, source: io::Error },

    #[error("failed to read PID file {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to encode PID file: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Outcome of [`PidRegistry::check_running_server`].
#[derive(Debug, Clone, PartialEq)]
pub struct RunningCheck {
    /// `true` only when the file exists and its process is alive.
    pub running: bool,
    /// Whatever the file contained, live or stale.
    pub metadata: Option<ServerMetadata>,
}

/// Reads and writes `{root}/server.json`.
#[derive(Debug, Clone)]
pub struct PidRegistry {
    path: PathBuf,
}

impl PidRegistry {
    pub fn new(storage_root: &Path) -> Self {
        Self {
            path: storage_root.join(PID_FILENAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `metadata` atomically: temp file in the same directory, then
    /// rename over the target.
    pub async fn write(&self, metadata: &ServerMetadata) -> Result<(), PidError> {
        let json = serde_json::to_string_pretty(metadata)?;
        let tmp = self
            .path
            .with_file_name(format!("{PID_FILENAME}.{}.tmp", std::process::id()));

        let write = async {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&tmp, json).await?;
            tokio::fs::rename(&tmp, &self.path).await
        };
        if let Err(source) = write.await {
            tokio::fs::remove_file(&tmp).await.ok();
            return Err(PidError::Write {
                path: self.path.clone(),
                source,
            });
        }

        debug!(path = %self.path.display(), pid = metadata.process_id, "PID file written");
        Ok(())
    }

    /// Read the file. Missing or unparseable files read as `None`.
    pub async fn read(&self) -> Result<Option<ServerMetadata>, PidError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(PidError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        match serde_json::from_str(&raw) {
            Ok(metadata) => Ok(Some(metadata)),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ignoring unparseable PID file");
                Ok(None)
            }
        }
    }

    /// Delete the file. Missing files are fine.
    pub async fn remove(&self) -> Result<(), PidError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(PidError::Remove {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Whether the recorded daemon is alive. Does not remove stale files;
    /// that is left to whoever is about to replace them.
    pub async fn check_running_server(&self) -> Result<RunningCheck, PidError> {
        let metadata = self.read().await?;
        let running = metadata
            .as_ref()
            .is_some_and(|m| is_process_alive(m.process_id));
        Ok(RunningCheck { running, metadata })
    }
}

/// Probe whether `pid` refers to a live process.
///
/// A permission error still means the process exists.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Without a cheap probe we assume the recorded process is alive; the
/// control-channel bind is the real exclusion check on these platforms.
#[cfg(not(unix))]
pub fn is_process_alive(pid: u32) -> bool {
    pid != 0
}
