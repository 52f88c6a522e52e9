//! A scriptable stand-in for the tunnel client executable.
//!
//! The manager only cares about the process lifetime and the log lines it
//! prints, so a shell script is enough to drive it through every state.

use std::path::{Path, PathBuf};

/// Prints a registration line and stays up until terminated.
pub const REGISTERS: &str = r#"echo "[I] [ps-test] start proxy success"
trap 'exit 0' TERM
while true; do sleep 0.05; done"#;

/// Prints an auth rejection and keeps running, like a real client with
/// `loginFailExit = false`.
pub const AUTH_REJECTED: &str = r#"echo "[W] login to the server failed: authorization failed"
trap 'exit 0' TERM
while true; do sleep 0.05; done"#;

/// Registers and crashes half a second later on its first run. Every later
/// run waits half a second, registers, and stays up. The wait keeps each
/// phase long enough for a status poll to observe it.
pub const DROPS_ONCE: &str = r#"marker="$(dirname "$0")/crashed-once"
if [ ! -e "$marker" ]; then
  touch "$marker"
  echo "[I] [ps-test] start proxy success"
  sleep 0.5
  exit 1
fi
sleep 0.5
echo "[I] [ps-test] start proxy success"
trap 'exit 0' TERM
while true; do sleep 0.05; done"#;

/// Exits immediately with a failure code.
pub const CRASHES: &str = "exit 3";

/// Registers, then ignores SIGTERM so only a kill stops it.
pub const IGNORES_TERM: &str = r#"echo "[I] [ps-test] start proxy success"
trap '' TERM
while true; do sleep 0.05; done"#;

/// Write an executable `frpc` script with `body` into `dir`. The script
/// also appends its arguments to `invocations.log` next to it.
#[cfg(unix)]
pub fn write_fake_frpc(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    std::fs::create_dir_all(dir).expect("failed to create fake frpc dir");
    let path = dir.join("frpc");
    let log = dir.join("invocations.log");
    let script = format!(
        "#!/bin/sh\necho \"$@\" >> '{}'\n{body}\n",
        log.display()
    );
    std::fs::write(&path, script).expect("failed to write fake frpc");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("failed to chmod fake frpc");
    path
}

/// How many times the fake client in `dir` was launched.
pub fn invocations(dir: &Path) -> usize {
    std::fs::read_to_string(dir.join("invocations.log"))
        .map(|s| s.lines().count())
        .unwrap_or(0)
}
