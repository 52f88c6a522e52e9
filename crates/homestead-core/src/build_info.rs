//! Build metadata embedded by the build script.
//!
//! `VERSION` is what the daemon reports in `server.json`, `status` and
//! `health`; [`version_string`] is the longer form for `--version`.

/// Crate version from Cargo.toml.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Short git commit hash at build time, or `unknown`.
pub const GIT_HASH: &str = env!("HOMESTEAD_GIT_HASH");

/// `debug` or `release`.
pub const BUILD_PROFILE: &str = env!("HOMESTEAD_BUILD_PROFILE");

/// `"0.1.0 (abc1234, debug)"`
pub fn version_string() -> String {
    format!("{VERSION} ({GIT_HASH}, {BUILD_PROFILE})")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_string_contains_parts() {
        let v = version_string();
        assert!(v.starts_with(VERSION));
        assert!(v.contains(GIT_HASH));
    }

    #[test]
    fn test_build_profile() {
        assert_eq!(BUILD_PROFILE, "debug");
    }
}
