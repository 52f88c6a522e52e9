//! Tunnel subprocess lifecycle.
//!
//! The manager owns the frp client process and the [`TunnelStatusInfo`]
//! derived from it. Everything asynchronous that happens to the process
//! (output lines, exit, restart and refresh timers, reachability probes)
//! arrives as a [`TunnelEvent`] on the channel returned by
//! [`TunnelManager::new`]; the owner feeds each one back through
//! [`TunnelManager::handle_event`] while holding whatever lock guards the
//! manager. Events carry the generation of the process they belong to, so
//! anything left over from a replaced or stopped process is dropped.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::binary::resolve_binary;
use super::claim::{CLAIM_TTL_SECONDS, ServerIdentity, generate_signed_claim};
use super::frpc::{self, FrpcOptions};
use super::restart::{Backoff, RestartPolicy};
use super::signals::{TunnelSignal, classify_line};
use super::verify::{VerifyOptions, build_public_url, verify_public_url};
use super::{TunnelError, TunnelStatus, TunnelStatusInfo};

/// Fresh claims are issued at 80% of their lifetime.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs((CLAIM_TTL_SECONDS as u64) * 4 / 5);

/// Retry delay after a failed refresh.
pub const REFRESH_RETRY: Duration = Duration::from_secs(30);

/// Everything needed to launch (and relaunch) the tunnel.
#[derive(Debug, Clone)]
pub struct TunnelLaunch {
    pub identity: Arc<ServerIdentity>,
    pub owner: String,
    pub server_addr: String,
    pub server_port: u16,
    pub public_domain: String,
    pub local_port: u16,
    /// Explicit client executable; searched for when `None`.
    pub binary: Option<PathBuf>,
    pub grace_period: Duration,
    /// Probe the public URL once connected; `None` skips the probe.
    pub verify: Option<VerifyOptions>,
}

/// Something happened to the tunnel process.
#[derive(Debug)]
pub struct TunnelEvent {
    generation: u64,
    kind: EventKind,
}

#[derive(Debug)]
enum EventKind {
    Output(String),
    Exited { code: Option<i32>, uptime: Duration },
    RestartDue,
    RefreshDue,
    Verified { reachable: bool, error: Option<String> },
}

/// What the owner must do after [`TunnelManager::handle_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelOutcome {
    Continue,
    /// Restarts are used up; the tunnel stays down.
    Exhausted { attempts: u32 },
}

struct RunningChild {
    pid: Option<u32>,
    terminate_tx: oneshot::Sender<Duration>,
    monitor: JoinHandle<()>,
}

pub struct TunnelManager {
    storage_root: PathBuf,
    events_tx: mpsc::UnboundedSender<TunnelEvent>,
    info: TunnelStatusInfo,
    launch: Option<TunnelLaunch>,
    child: Option<RunningChild>,
    generation: u64,
    backoff: Backoff,
    refresh_interval: Duration,
    restart_timer: Option<JoinHandle<()>>,
    refresh_timer: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for TunnelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelManager")
            .field("info", &self.info)
            .field("pid", &self.child.as_ref().and_then(|c| c.pid))
            .field("generation", &self.generation)
            .finish()
    }
}

impl TunnelManager {
    pub fn new(
        storage_root: impl Into<PathBuf>,
        policy: RestartPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<TunnelEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let manager = Self {
            storage_root: storage_root.into(),
            events_tx,
            info: TunnelStatusInfo::default(),
            launch: None,
            child: None,
            generation: 0,
            backoff: Backoff::new(policy),
            refresh_interval: REFRESH_INTERVAL,
            restart_timer: None,
            refresh_timer: None,
        };
        (manager, events_rx)
    }

    /// Override the claim refresh interval.
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    // ── Reads ───────────────────────────────────────────────────────────

    pub fn status(&self) -> TunnelStatusInfo {
        self.info.clone()
    }

    /// `true` while the process is up and registered with the broker.
    pub fn is_running(&self) -> bool {
        self.child.is_some() && self.info.status == TunnelStatus::Connected
    }

    pub fn public_url(&self) -> Option<&str> {
        self.info.public_url.as_deref()
    }

    pub fn is_enabled(&self) -> bool {
        self.info.enabled
    }

    /// No process and no restart pending: nothing will change the status
    /// until someone calls [`start`](Self::start) or [`stop`](Self::stop).
    pub fn is_idle(&self) -> bool {
        self.child.is_none() && self.restart_timer.is_none()
    }

    // ── Commands ────────────────────────────────────────────────────────

    /// Record whether tunneling is wanted. Does not start or stop anything.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.info.enabled = enabled;
    }

    /// Launch the tunnel client. Fails if it is already connecting or
    /// connected; a process left over in the `Error` state is replaced.
    pub async fn start(&mut self, launch: TunnelLaunch) -> Result<String, TunnelError> {
        if matches!(
            self.info.status,
            TunnelStatus::Connecting | TunnelStatus::Connected
        ) {
            return Err(TunnelError::AlreadyRunning);
        }

        self.cancel_timers();
        self.terminate_child().await;

        let public_url = build_public_url(launch.identity.wallet(), &launch.public_domain);
        self.info.enabled = true;
        self.info.public_url = Some(public_url.clone());
        self.info.connected_since = None;
        self.info.last_error = None;
        self.launch = Some(launch);
        self.backoff.reset();

        if let Err(e) = self.spawn_child(false).await {
            self.info.status = TunnelStatus::Error;
            self.info.last_error = Some(e.to_string());
            return Err(e);
        }

        info!(url = %public_url, "Tunnel starting");
        Ok(public_url)
    }

    /// Stop the tunnel from any state. Sends a graceful termination, waits
    /// up to the grace period, then kills. Always ends `Stopped`.
    pub async fn stop(&mut self) {
        self.cancel_timers();
        // Anything still in flight belongs to the old process.
        self.generation += 1;

        let had_child = self.child.is_some();
        self.terminate_child().await;

        self.info.status = TunnelStatus::Stopped;
        self.info.public_url = None;
        self.info.connected_since = None;
        self.launch = None;
        self.backoff.reset();

        if had_child {
            info!("Tunnel stopped");
        }
    }

    /// Apply the result of an external reachability probe. A positive
    /// result only counts while a client process is running.
    pub fn set_verified(&mut self, reachable: bool, error: Option<String>) {
        if reachable {
            if self.child.is_none() {
                debug!("Ignoring reachability result for a tunnel with no client");
            } else if self.info.status != TunnelStatus::Stopped {
                self.info.status = TunnelStatus::Connected;
                self.info.connected_since.get_or_insert_with(Utc::now);
                self.info.last_error = None;
            }
        } else if self.info.status == TunnelStatus::Connected {
            let error = error.unwrap_or_else(|| "tunnel URL not reachable".to_string());
            warn!(error = %error, "Tunnel URL failed verification");
            self.info.status = TunnelStatus::Error;
            self.info.connected_since = None;
            self.info.last_error = Some(error);
        }
    }

    /// Apply one event from the channel.
    pub async fn handle_event(&mut self, event: TunnelEvent) -> TunnelOutcome {
        if event.generation != self.generation {
            debug!(event = ?event.kind, "Dropping stale tunnel event");
            return TunnelOutcome::Continue;
        }

        match event.kind {
            EventKind::Output(line) => {
                self.apply_output(&line);
                TunnelOutcome::Continue
            }
            EventKind::Exited { code, uptime } => {
                self.child = None;
                // Output and probe results still queued for the dead process.
                self.generation += 1;
                if let Some(timer) = self.refresh_timer.take() {
                    timer.abort();
                }
                let error = TunnelError::ProcessExit { code };
                warn!(error = %error, uptime_secs = uptime.as_secs(), "Tunnel client exited unexpectedly");
                self.mark_error(error.to_string());

                if !self.info.enabled || self.launch.is_none() {
                    self.settle_stopped();
                    return TunnelOutcome::Continue;
                }
                self.schedule_restart(uptime)
            }
            EventKind::RestartDue => {
                self.restart_timer = None;
                if self.child.is_some() || self.launch.is_none() || !self.info.enabled {
                    return TunnelOutcome::Continue;
                }
                info!(attempt = self.backoff.attempts(), "Restarting tunnel client");
                match self.spawn_child(false).await {
                    Ok(()) => TunnelOutcome::Continue,
                    Err(e) => {
                        warn!(error = %e, "Tunnel restart failed");
                        self.mark_error(e.to_string());
                        self.schedule_restart(Duration::ZERO)
                    }
                }
            }
            EventKind::RefreshDue => {
                self.refresh_timer = None;
                if self.launch.is_none() || self.restart_timer.is_some() {
                    return TunnelOutcome::Continue;
                }
                debug!("Refreshing tunnel claim");
                self.terminate_child().await;
                if let Err(e) = self.spawn_child(true).await {
                    warn!(error = %e, retry_secs = REFRESH_RETRY.as_secs(), "Tunnel claim refresh failed");
                    self.mark_error(e.to_string());
                    self.refresh_timer = Some(self.schedule(REFRESH_RETRY, EventKind::RefreshDue));
                }
                TunnelOutcome::Continue
            }
            EventKind::Verified { reachable, error } => {
                self.set_verified(reachable, error);
                TunnelOutcome::Continue
            }
        }
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn apply_output(&mut self, line: &str) {
        debug!(target: "homestead::frpc", "{line}");

        match classify_line(line) {
            Some(TunnelSignal::Registered) => {
                if self.info.status != TunnelStatus::Connected {
                    info!(url = ?self.info.public_url, "Tunnel connected");
                    self.info.status = TunnelStatus::Connected;
                    self.info.connected_since = Some(Utc::now());
                    self.info.last_error = None;
                    self.spawn_verification();
                }
            }
            Some(TunnelSignal::AuthFailed(message)) => {
                warn!(message = %message, "Tunnel authentication failed");
                self.mark_error(TunnelError::AuthFailed(message).to_string());
            }
            Some(TunnelSignal::Disconnected(message)) => {
                if self.info.status != TunnelStatus::Stopped {
                    warn!(message = %message, "Tunnel disconnected");
                    self.mark_error(message);
                }
            }
            None => {}
        }
    }

    fn mark_error(&mut self, message: String) {
        self.info.status = TunnelStatus::Error;
        self.info.connected_since = None;
        self.info.last_error = Some(message);
    }

    /// The failure is final: nothing is running or scheduled, so report
    /// `Stopped` with no URL. `last_error` keeps the reason.
    fn settle_stopped(&mut self) {
        self.cancel_timers();
        self.info.status = TunnelStatus::Stopped;
        self.info.public_url = None;
        self.info.connected_since = None;
        self.launch = None;
    }

    fn schedule_restart(&mut self, uptime: Duration) -> TunnelOutcome {
        match self.backoff.next_delay(uptime) {
            Some(delay) => {
                info!(
                    attempt = self.backoff.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling tunnel restart"
                );
                if let Some(timer) = self.restart_timer.take() {
                    timer.abort();
                }
                self.restart_timer = Some(self.schedule(delay, EventKind::RestartDue));
                TunnelOutcome::Continue
            }
            None => {
                let attempts = self.backoff.attempts();
                warn!(attempts, "Tunnel restart attempts exhausted");
                self.settle_stopped();
                self.info.last_error = Some(format!(
                    "tunnel restart attempts exhausted after {attempts} tries"
                ));
                TunnelOutcome::Exhausted { attempts }
            }
        }
    }

    /// Write a fresh claim and config, then launch the process. With
    /// `keep_connected`, a connected tunnel stays `Connected` across the
    /// swap so a routine refresh does not look like an outage.
    async fn spawn_child(&mut self, keep_connected: bool) -> Result<(), TunnelError> {
        let Some(launch) = self.launch.as_ref() else {
            return Ok(());
        };

        let binary = resolve_binary(launch.binary.as_deref(), &self.storage_root)?;
        let run_id = Uuid::new_v4().to_string();
        let claim = generate_signed_claim(&launch.identity, &launch.owner, &run_id, Utc::now())?;
        let config_path = frpc::write_config(
            &self.storage_root,
            &FrpcOptions {
                server_addr: &launch.server_addr,
                server_port: launch.server_port,
                local_port: launch.local_port,
                owner: &launch.owner,
                claim: &claim,
            },
        )
        .await?;

        let mut child = Command::new(&binary)
            .arg("-c")
            .arg(&config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TunnelError::Spawn {
                binary: binary.clone(),
                source,
            })?;

        self.generation += 1;
        let generation = self.generation;
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, generation, self.events_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, generation, self.events_tx.clone());
        }

        let (terminate_tx, terminate_rx) = oneshot::channel();
        let monitor = tokio::spawn(monitor_child(
            child,
            terminate_rx,
            generation,
            self.events_tx.clone(),
        ));
        self.child = Some(RunningChild {
            pid,
            terminate_tx,
            monitor,
        });

        if !(keep_connected && self.info.status == TunnelStatus::Connected) {
            self.info.status = TunnelStatus::Connecting;
            self.info.connected_since = None;
        }

        if let Some(timer) = self.refresh_timer.take() {
            timer.abort();
        }
        self.refresh_timer = Some(self.schedule(self.refresh_interval, EventKind::RefreshDue));

        debug!(?pid, run_id = %run_id, binary = %binary.display(), "Tunnel client launched");
        Ok(())
    }

    /// Ask the running process to exit and wait for it. Requested exits are
    /// not reported as events.
    async fn terminate_child(&mut self) {
        let Some(child) = self.child.take() else {
            return;
        };
        let grace = self
            .launch
            .as_ref()
            .map_or(Duration::from_secs(5), |l| l.grace_period);
        let _ = child.terminate_tx.send(grace);
        if let Err(e) = child.monitor.await {
            warn!(error = %e, "Tunnel monitor task failed");
        }
    }

    fn cancel_timers(&mut self) {
        for timer in [self.restart_timer.take(), self.refresh_timer.take()]
            .into_iter()
            .flatten()
        {
            timer.abort();
        }
    }

    fn schedule(&self, delay: Duration, kind: EventKind) -> JoinHandle<()> {
        let tx = self.events_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(TunnelEvent { generation, kind });
        })
    }

    fn spawn_verification(&self) {
        let (Some(launch), Some(url)) = (self.launch.as_ref(), self.info.public_url.clone()) else {
            return;
        };
        let Some(options) = launch.verify else {
            return;
        };
        let tx = self.events_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let outcome = verify_public_url(&url, options).await;
            let _ = tx.send(TunnelEvent {
                generation,
                kind: EventKind::Verified {
                    reachable: outcome.reachable,
                    error: outcome.error,
                },
            });
        });
    }
}

impl Drop for TunnelManager {
    fn drop(&mut self) {
        self.cancel_timers();
        // Dropping the sender makes the monitor kill the process.
        self.child.take();
    }
}

fn forward_lines<R>(reader: R, generation: u64, tx: mpsc::UnboundedSender<TunnelEvent>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let event = TunnelEvent {
                generation,
                kind: EventKind::Output(line),
            };
            if tx.send(event).is_err() {
                break;
            }
        }
    });
}

/// Own the child until it exits. An unrequested exit is reported; a
/// requested one runs the graceful termination sequence.
async fn monitor_child(
    mut child: Child,
    terminate_rx: oneshot::Receiver<Duration>,
    generation: u64,
    tx: mpsc::UnboundedSender<TunnelEvent>,
) {
    let started = Instant::now();
    tokio::select! {
        status = child.wait() => {
            let code = status.ok().and_then(|s| s.code());
            let _ = tx.send(TunnelEvent {
                generation,
                kind: EventKind::Exited { code, uptime: started.elapsed() },
            });
        }
        grace = terminate_rx => {
            // A dropped sender means the manager is gone: kill immediately.
            let grace = grace.unwrap_or(Duration::ZERO);
            if let Err(e) = terminate(&mut child, grace).await {
                warn!(error = %e, "Failed to reap tunnel client");
            }
        }
    }
}

async fn terminate(child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    if !grace.is_zero() && send_sigterm(child) {
        if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
            return status;
        }
        warn!(grace_ms = grace.as_millis() as u64, "Tunnel client ignored SIGTERM; killing");
    }
    child.kill().await?;
    child.wait().await
}

#[cfg(unix)]
fn send_sigterm(child: &Child) -> bool {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return false;
    };
    kill(Pid::from_raw(pid), Signal::SIGTERM).is_ok()
}

#[cfg(not(unix))]
fn send_sigterm(_child: &Child) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn launch(binary: Option<PathBuf>) -> TunnelLaunch {
        TunnelLaunch {
            identity: Arc::new(ServerIdentity::generate()),
            owner: "0x00000000000000000000000000000000000000aa".into(),
            server_addr: "127.0.0.1".into(),
            server_port: 7000,
            public_domain: "server.example.org".into(),
            local_port: 8080,
            binary,
            grace_period: Duration::from_millis(200),
            verify: None,
        }
    }

    /// Give the manager a real process to own, as a launch would.
    #[cfg(unix)]
    fn attach_sleeper(manager: &mut TunnelManager) {
        let child = Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let pid = child.id();
        let (terminate_tx, terminate_rx) = oneshot::channel();
        let monitor = tokio::spawn(monitor_child(
            child,
            terminate_rx,
            manager.generation,
            manager.events_tx.clone(),
        ));
        manager.child = Some(RunningChild {
            pid,
            terminate_tx,
            monitor,
        });
    }

    fn exited(manager: &TunnelManager) -> TunnelEvent {
        TunnelEvent {
            generation: manager.generation,
            kind: EventKind::Exited {
                code: Some(1),
                uptime: Duration::from_secs(1),
            },
        }
    }

    fn output(manager: &TunnelManager, line: &str) -> TunnelEvent {
        TunnelEvent {
            generation: manager.generation,
            kind: EventKind::Output(line.to_string()),
        }
    }

    #[tokio::test]
    async fn test_fresh_manager_reads() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (manager, _rx) = TunnelManager::new(tmp.path(), RestartPolicy::default());
        assert_eq!(manager.status(), TunnelStatusInfo::default());
        assert!(!manager.is_running());
        assert_eq!(manager.public_url(), None);
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_noop() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (mut manager, _rx) = TunnelManager::new(tmp.path(), RestartPolicy::default());
        manager.stop().await;
        manager.stop().await;
        assert_eq!(manager.status().status, TunnelStatus::Stopped);
    }

    #[tokio::test]
    async fn test_missing_binary_fails_start_with_error_status() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (mut manager, _rx) = TunnelManager::new(tmp.path(), RestartPolicy::default());

        let err = manager
            .start(launch(Some(tmp.path().join("no-such-frpc"))))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::BinaryNotFound { .. }));

        let status = manager.status();
        assert_eq!(status.status, TunnelStatus::Error);
        assert!(status.last_error.unwrap().contains("not found"));

        manager.stop().await;
        let status = manager.status();
        assert_eq!(status.status, TunnelStatus::Stopped);
        assert_eq!(status.public_url, None);
    }

    #[tokio::test]
    async fn test_output_drives_status() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (mut manager, _rx) = TunnelManager::new(tmp.path(), RestartPolicy::default());
        manager.info.status = TunnelStatus::Connecting;

        let event = output(&manager, "[I] [ps-1] start proxy success");
        manager.handle_event(event).await;
        let status = manager.status();
        assert_eq!(status.status, TunnelStatus::Connected);
        assert!(status.connected_since.is_some());

        let event = output(&manager, "[W] login to the server failed: authorization failed");
        manager.handle_event(event).await;
        let status = manager.status();
        assert_eq!(status.status, TunnelStatus::Error);
        assert_eq!(status.connected_since, None);
        assert!(status.last_error.unwrap().contains("authorization failed"));
    }

    #[tokio::test]
    async fn test_stale_events_are_ignored() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (mut manager, _rx) = TunnelManager::new(tmp.path(), RestartPolicy::default());
        manager.info.status = TunnelStatus::Connecting;

        let stale = TunnelEvent {
            generation: manager.generation + 1,
            kind: EventKind::Output("start proxy success".into()),
        };
        assert_eq!(manager.handle_event(stale).await, TunnelOutcome::Continue);
        assert_eq!(manager.status().status, TunnelStatus::Connecting);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_set_verified() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (mut manager, _rx) = TunnelManager::new(tmp.path(), RestartPolicy::default());

        // Ignored while stopped.
        manager.set_verified(true, None);
        assert_eq!(manager.status().status, TunnelStatus::Stopped);

        attach_sleeper(&mut manager);
        manager.info.status = TunnelStatus::Connecting;
        manager.set_verified(true, None);
        assert_eq!(manager.status().status, TunnelStatus::Connected);

        manager.set_verified(false, Some("HTTP 502".into()));
        let status = manager.status();
        assert_eq!(status.status, TunnelStatus::Error);
        assert_eq!(status.last_error.as_deref(), Some("HTTP 502"));
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_late_reachable_result_after_exit_is_ignored() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (mut manager, _rx) = TunnelManager::new(tmp.path(), RestartPolicy::default());
        manager.launch = Some(launch(None));
        manager.info.status = TunnelStatus::Connecting;

        let before_exit = manager.generation;
        manager.handle_event(exited(&manager)).await;
        assert_eq!(manager.status().status, TunnelStatus::Error);

        let straggler = TunnelEvent {
            generation: before_exit,
            kind: EventKind::Output("[I] [ps-1] start proxy success".into()),
        };
        manager.handle_event(straggler).await;
        assert_eq!(manager.status().status, TunnelStatus::Error);

        let verified = TunnelEvent {
            generation: manager.generation,
            kind: EventKind::Verified {
                reachable: true,
                error: None,
            },
        };
        manager.handle_event(verified).await;
        let status = manager.status();
        assert_eq!(status.status, TunnelStatus::Error);
        assert_eq!(status.connected_since, None);
        assert!(status.last_error.unwrap().contains("exited"));
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_exit_while_disabled_settles_stopped() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (mut manager, _rx) = TunnelManager::new(tmp.path(), RestartPolicy::default());
        manager.launch = Some(launch(None));
        manager.info.status = TunnelStatus::Connected;
        manager.info.public_url = Some("https://0xabc.server.example.org".into());
        manager.set_enabled(false);

        assert_eq!(
            manager.handle_event(exited(&manager)).await,
            TunnelOutcome::Continue
        );
        let status = manager.status();
        assert_eq!(status.status, TunnelStatus::Stopped);
        assert_eq!(status.public_url, None);
        assert!(status.last_error.unwrap().contains("code 1"));
        assert!(manager.is_idle());
    }

    #[tokio::test]
    async fn test_failed_start_leaves_manager_idle() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (mut manager, _rx) = TunnelManager::new(tmp.path(), RestartPolicy::default());
        assert!(manager.is_idle());

        manager
            .start(launch(Some(tmp.path().join("no-such-frpc"))))
            .await
            .unwrap_err();
        assert_eq!(manager.status().status, TunnelStatus::Error);
        assert!(manager.is_idle());
    }

    #[tokio::test]
    async fn test_unexpected_exit_schedules_restart_until_exhausted() {
        let tmp = tempfile::TempDir::new().unwrap();
        let policy = RestartPolicy {
            base_delay: Duration::from_secs(3600),
            max_delay: Duration::from_secs(3600),
            max_jitter: Duration::ZERO,
            max_retries: 2,
            reset_after: Duration::from_secs(3600),
        };
        let (mut manager, _rx) = TunnelManager::new(tmp.path(), policy);
        manager.launch = Some(launch(None));
        manager.info.status = TunnelStatus::Connected;
        manager.info.public_url = Some("https://0xabc.server.example.org".into());

        assert_eq!(
            manager.handle_event(exited(&manager)).await,
            TunnelOutcome::Continue
        );
        assert_eq!(manager.status().status, TunnelStatus::Error);
        assert!(manager.restart_timer.is_some());
        assert!(!manager.is_idle());

        assert_eq!(
            manager.handle_event(exited(&manager)).await,
            TunnelOutcome::Continue
        );
        assert_eq!(
            manager.handle_event(exited(&manager)).await,
            TunnelOutcome::Exhausted { attempts: 2 }
        );
        let status = manager.status();
        assert_eq!(status.status, TunnelStatus::Stopped);
        assert_eq!(status.public_url, None);
        assert!(status.last_error.unwrap().contains("exhausted"));
        assert!(manager.is_idle());
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_refresh_interval_is_eighty_percent_of_ttl() {
        assert_eq!(REFRESH_INTERVAL, Duration::from_secs(240));
    }
}
