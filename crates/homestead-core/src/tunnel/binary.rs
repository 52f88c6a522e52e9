//! Locating the tunnel client executable.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::TunnelError;

#[cfg(windows)]
pub const BINARY_NAME: &str = "frpc.exe";
#[cfg(not(windows))]
pub const BINARY_NAME: &str = "frpc";

/// Where a managed install lives under the storage root.
pub fn managed_binary_path(storage_root: &Path) -> PathBuf {
    storage_root.join("bin").join(BINARY_NAME)
}

/// Find the executable: the configured path, then `{root}/bin`, then
/// `PATH`. A found file without execute bits is made executable.
pub fn resolve_binary(
    configured: Option<&Path>,
    storage_root: &Path,
) -> Result<PathBuf, TunnelError> {
    let path_var = std::env::var_os("PATH");
    resolve_binary_with_path(configured, storage_root, path_var.as_deref())
}

pub(crate) fn resolve_binary_with_path(
    configured: Option<&Path>,
    storage_root: &Path,
    path_var: Option<&OsStr>,
) -> Result<PathBuf, TunnelError> {
    let mut searched = Vec::new();

    let mut candidates: Vec<PathBuf> = Vec::new();
    match configured {
        // An explicit path is authoritative; do not fall through to others.
        Some(path) => candidates.push(path.to_path_buf()),
        None => {
            candidates.push(managed_binary_path(storage_root));
            if let Some(path_var) = path_var {
                candidates.extend(std::env::split_paths(path_var).map(|dir| dir.join(BINARY_NAME)));
            }
        }
    }

    for candidate in candidates {
        if candidate.is_file() {
            ensure_executable(&candidate)?;
            debug!(path = %candidate.display(), "Resolved tunnel client binary");
            return Ok(candidate);
        }
        searched.push(candidate);
    }

    Err(TunnelError::BinaryNotFound { searched })
}

#[cfg(unix)]
fn ensure_executable(path: &Path) -> Result<(), TunnelError> {
    use std::os::unix::fs::PermissionsExt;

    let mode = std::fs::metadata(path)?.permissions().mode();
    if mode & 0o111 == 0 {
        debug!(path = %path.display(), "Marking tunnel client executable");
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).map_err(|_| {
            TunnelError::BinaryNotFound {
                searched: vec![path.to_path_buf()],
            }
        })?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn ensure_executable(_path: &Path) -> Result<(), TunnelError> {
    Ok(())
}
