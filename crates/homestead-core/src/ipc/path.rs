//! Control-channel address resolution.
//!
//! | Platform    | Address                                              |
//! |-------------|------------------------------------------------------|
//! | Unix        | `{storage_root}/ipc.sock`, hashed `/tmp` fallback     |
//! | Windows     | `\\.\pipe\homestead-personal-server`                 |
//!
//! Unix domain socket paths have a hard length ceiling (103 bytes on
//! macOS). When the preferred path is longer than [`MAX_SOCKET_PATH_LENGTH`]
//! the socket moves to `/tmp/homestead-{hash}.sock`, where `hash` is a
//! truncated SHA-256 of the storage root.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// Longest preferred socket path we accept before falling back.
pub const MAX_SOCKET_PATH_LENGTH: usize = 100;

/// Socket file name inside the storage root.
pub const SOCKET_FILENAME: &str = "ipc.sock";

/// Named pipe used on Windows. One daemon per machine.
pub const WINDOWS_PIPE_NAME: &str = r"\\.\pipe\homestead-personal-server";

/// Directory holding fallback sockets.
pub const FALLBACK_DIR: &str = "/tmp";

/// Hex characters of the storage-root hash kept in the fallback name.
const HASH_HEX_LEN: usize = 12;

/// Resolve the control-channel address for the current platform.
pub fn resolve_socket_path(storage_root: &Path) -> PathBuf {
    if cfg!(windows) {
        return PathBuf::from(WINDOWS_PIPE_NAME);
    }
    resolve_unix_socket_path(storage_root)
}

/// Domain-socket resolution, independent of the compile target.
pub fn resolve_unix_socket_path(storage_root: &Path) -> PathBuf {
    let preferred = storage_root.join(SOCKET_FILENAME);
    if preferred.as_os_str().len() <= MAX_SOCKET_PATH_LENGTH {
        return preferred;
    }

    let digest = Sha256::digest(storage_root.as_os_str().as_encoded_bytes());
    let hash = hex::encode(digest);
    PathBuf::from(FALLBACK_DIR).join(format!("homestead-{}.sock", &hash[..HASH_HEX_LEN]))
}
