//! Storage-root resolution.
//!
//! Every per-instance file (PID file, control socket, config, keys, tunnel
//! artifacts) lives under a single storage root. The root comes from an
//! explicit argument, then `HOMESTEAD_ROOT_PATH`, then `~/.homestead`.

use std::path::{Path, PathBuf};

/// Environment variable overriding the default storage root.
pub const ROOT_PATH_ENV: &str = "HOMESTEAD_ROOT_PATH";

/// Default storage root, before `~` expansion.
pub const DEFAULT_ROOT_PATH: &str = "~/.homestead";

/// Config file name inside the storage root.
pub const CONFIG_FILENAME: &str = "config.toml";

/// Expand a leading `~` to the current user's home directory.
///
/// Inputs without a leading `~`, or when no home directory can be
/// determined, are returned unchanged.
pub fn expand_home_path(input: &str) -> PathBuf {
    let home = dirs::home_dir();
    match (input, home) {
        ("~", Some(home)) => home,
        (s, Some(home)) if s.starts_with("~/") => home.join(&s[2..]),
        (s, _) => PathBuf::from(s),
    }
}

/// Resolve the storage root from an explicit value, the environment, or the
/// default, returning an absolute path.
pub fn resolve_root_path(explicit: Option<&str>) -> PathBuf {
    let env_value = std::env::var(ROOT_PATH_ENV).ok();
    root_path_from(explicit, env_value.as_deref())
}

/// Resolution logic behind [`resolve_root_path`], with the environment value
/// passed in.
pub fn root_path_from(explicit: Option<&str>, env_value: Option<&str>) -> PathBuf {
    let raw = explicit
        .or(env_value.filter(|v| !v.is_empty()))
        .unwrap_or(DEFAULT_ROOT_PATH);
    let expanded = expand_home_path(raw);
    std::path::absolute(&expanded).unwrap_or(expanded)
}

/// Default config file location for a storage root.
pub fn default_config_path(storage_root: &Path) -> PathBuf {
    storage_root.join(CONFIG_FILENAME)
}
