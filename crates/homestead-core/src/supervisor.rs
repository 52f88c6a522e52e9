//! Startup, steady state and shutdown of a running daemon.
//!
//! ```text
//!            start()                              run()
//! ┌─────────────────────────────┐   ┌──────────────────────────────────┐
//! │ PID check → Starting        │   │ tunnel events ─┐                 │
//! │ bind HTTP + control         │   │ stop command  ─┼─▶ ControlPlane  │
//! │ → LocalOnly, write PID file │   │ SIGINT/SIGTERM ┘   (one mutex)   │
//! │ start tunnel (if active)    │   │ → teardown → Stopped             │
//! └─────────────────────────────┘   └──────────────────────────────────┘
//! ```
//!
//! Every piece of mutable daemon state (the state machine, the tunnel
//! manager, the live config) sits in one `ControlPlane` behind a single
//! async mutex. Control requests and tunnel events both take it, so they
//! observe each other's effects in a total order.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use homestead_config::{AppConfig, expand_home_path};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, Notify, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::BoxFuture;
use crate::build_info::VERSION;
use crate::http::{self, HttpState};
use crate::ipc::protocol::{
    HealthResult, LogsResult, ReloadResult, StatusResult, StopResult, commands,
};
use crate::ipc::server::{self as control, ControlHandler, ControlListener, unknown_command};
use crate::ipc::{ControlRequest, ControlResponse, ErrorCode, resolve_socket_path};
use crate::logging::LogReader;
use crate::pid::{PidError, PidRegistry, ServerMetadata};
use crate::state::{RuntimeEvent, RuntimeState, RuntimeStateMachine, StateError};
use crate::tunnel::verify::VerifyOptions;
use crate::tunnel::{
    RestartPolicy, ServerIdentity, TunnelError, TunnelEvent, TunnelLaunch, TunnelManager,
    TunnelOutcome, TunnelStatus,
};

/// Shutdown signal sent via broadcast channel to the listeners.
#[derive(Debug, Clone)]
pub struct ShutdownSignal;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("a daemon is already running (pid {pid}, control {control_address})")]
    AlreadyRunning { pid: u32, control_address: String },

    #[error("failed to bind HTTP listener on {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    #[error("failed to bind control channel at {}: {source}", .path.display())]
    ControlBind { path: PathBuf, source: io::Error },

    #[error(transparent)]
    Pid(#[from] PidError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Inputs to [`Supervisor::start`].
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub storage_root: PathBuf,
    /// Re-read by `reload`.
    pub config_path: PathBuf,
    pub config: AppConfig,
    /// Source for the `logs` command; `None` answers with no entries.
    pub logs: Option<LogReader>,
    /// Listen for SIGINT/SIGTERM in [`Supervisor::run`].
    pub handle_signals: bool,
}

impl SupervisorOptions {
    pub fn new(storage_root: PathBuf, config_path: PathBuf, config: AppConfig) -> Self {
        Self {
            storage_root,
            config_path,
            config,
            logs: None,
            handle_signals: true,
        }
    }

    pub fn with_logs(mut self, logs: LogReader) -> Self {
        self.logs = Some(logs);
        self
    }

    pub fn without_signal_handlers(mut self) -> Self {
        self.handle_signals = false;
        self
    }
}

/// Mutable daemon state. Only ever touched with the mutex held.
struct ControlPlane {
    machine: RuntimeStateMachine,
    tunnel: TunnelManager,
    config: AppConfig,
    /// Cached signing key and the file it came from.
    identity: Option<(PathBuf, Arc<ServerIdentity>)>,
}

impl ControlPlane {
    async fn identity(&mut self, storage_root: &Path) -> Result<Arc<ServerIdentity>, TunnelError> {
        let path = self.config.identity.key_path(storage_root);
        if let Some((cached, identity)) = &self.identity {
            if *cached == path {
                return Ok(Arc::clone(identity));
            }
        }
        let identity = Arc::new(ServerIdentity::load_or_create(&path).await?);
        info!(wallet = identity.wallet(), key = %path.display(), "Server identity loaded");
        self.identity = Some((path, Arc::clone(&identity)));
        Ok(identity)
    }

    /// Start the tunnel from the current config. Failures leave the daemon
    /// local-only; they are logged and visible in the tunnel status.
    async fn start_tunnel(&mut self, storage_root: &Path, local_port: u16) {
        let Some(owner) = self.config.identity.owner.clone() else {
            warn!("Tunnel enabled but identity.owner is not set; running local-only");
            return;
        };
        let identity = match self.identity(storage_root).await {
            Ok(identity) => identity,
            Err(e) => {
                error!(error = %e, "Cannot start tunnel without a server identity");
                return;
            }
        };

        let tunnel = &self.config.tunnel;
        let launch = TunnelLaunch {
            identity,
            owner,
            server_addr: tunnel.server_addr.clone(),
            server_port: tunnel.server_port,
            public_domain: tunnel.public_domain.clone(),
            local_port,
            binary: tunnel.binary_path.as_deref().map(expand_home_path),
            grace_period: tunnel.grace_period(),
            verify: tunnel.verify.then(VerifyOptions::default),
        };
        if let Err(e) = self.tunnel.start(launch).await {
            warn!(error = %e, "Tunnel failed to start; continuing local-only");
        }
    }

    /// Follow the tunnel into or out of `Tunneled`.
    fn sync_tunnel_state(&mut self) {
        let running = self.tunnel.is_running();
        let (event, cause) = match self.machine.state() {
            RuntimeState::LocalOnly if running => {
                (RuntimeEvent::TunnelConnected, "tunnel registered".to_string())
            }
            RuntimeState::Tunneled if !running => {
                let status = self.tunnel.status();
                let cause = status
                    .last_error
                    .unwrap_or_else(|| format!("tunnel {}", status.status));
                (RuntimeEvent::TunnelDropped, cause)
            }
            _ => return,
        };
        if let Err(e) = self.machine.transition(event, cause) {
            warn!(error = %e, "Tunnel state change rejected");
        }
    }
}

/// Stopped, or failed with nothing left that could recover it.
fn needs_relaunch(tunnel: &TunnelManager) -> bool {
    match tunnel.status().status {
        TunnelStatus::Stopped => true,
        TunnelStatus::Error => tunnel.is_idle(),
        TunnelStatus::Connecting | TunnelStatus::Connected => false,
    }
}

/// What control handlers and the run loop share.
struct Shared {
    plane: Mutex<ControlPlane>,
    metadata: ServerMetadata,
    storage_root: PathBuf,
    config_path: PathBuf,
    logs: Option<LogReader>,
    started: Instant,
    stop_requested: Notify,
}

impl Shared {
    async fn status(&self) -> StatusResult {
        let plane = self.plane.lock().await;
        StatusResult {
            runtime_state: plane.machine.state(),
            tunnel: plane.tunnel.status(),
            pid: self.metadata.process_id,
            port: self.metadata.port,
            control_address: self.metadata.control_address.clone(),
            root_path: self.metadata.root_path.clone(),
            started_at: self.metadata.started_at,
            version: self.metadata.version.clone(),
        }
    }

    /// First stop wins; later ones report what they found.
    async fn stop(&self) -> Result<StopResult, ControlResponse> {
        let mut plane = self.plane.lock().await;
        let state = plane.machine.state();
        let already_stopping = matches!(state, RuntimeState::Stopping | RuntimeState::Stopped);

        if !already_stopping {
            plane
                .machine
                .transition(RuntimeEvent::StopRequested, "stop command")
                .map_err(|e| ControlResponse::failure(ErrorCode::InvalidTransition, e.to_string()))?;
            self.stop_requested.notify_one();
        }

        Ok(StopResult {
            acknowledged: true,
            runtime_state: plane.machine.state(),
            already_stopping,
        })
    }

    async fn reload(&self) -> Result<ReloadResult, ControlResponse> {
        let config = AppConfig::load_or_default(&self.config_path)
            .await
            .map_err(|e| {
                ControlResponse::failure(
                    ErrorCode::Internal,
                    format!("failed to reload {}: {e}", self.config_path.display()),
                )
            })?;

        let mut plane = self.plane.lock().await;
        let state = plane.machine.state();
        if !state.is_serving() {
            return Err(ControlResponse::failure(
                ErrorCode::InvalidTransition,
                format!("cannot reload while {state}"),
            ));
        }

        let previous = std::mem::replace(&mut plane.config, config);
        let current = &plane.config;
        let mut restart_required = Vec::new();
        if current.server.port != previous.server.port {
            restart_required.push("server.port".to_string());
        }
        if current.server.bind_addr != previous.server.bind_addr {
            restart_required.push("server.bind_addr".to_string());
        }
        if current.tunnel.restart != previous.tunnel.restart {
            restart_required.push("tunnel.restart".to_string());
        }
        let tunnel_changed =
            current.tunnel != previous.tunnel || current.identity != previous.identity;
        let active = current.tunnel_active();
        let enabled = current.tunnel.enabled;

        plane.tunnel.set_enabled(enabled);
        if !active {
            plane.tunnel.stop().await;
        } else if tunnel_changed || needs_relaunch(&plane.tunnel) {
            plane.tunnel.stop().await;
            plane.start_tunnel(&self.storage_root, self.metadata.port).await;
        }
        plane.sync_tunnel_state();

        info!(tunnel_enabled = enabled, ?restart_required, "Configuration reloaded");
        Ok(ReloadResult {
            tunnel_enabled: enabled,
            restart_required,
            tunnel_status: plane.tunnel.status(),
        })
    }

    fn health(&self) -> HealthResult {
        HealthResult {
            status: "ok".to_string(),
            version: self.metadata.version.clone(),
            pid: self.metadata.process_id,
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }

    fn logs(&self, args: &Map<String, Value>) -> Result<LogsResult, ControlResponse> {
        let limit = match args.get("limit") {
            None | Some(Value::Null) => None,
            Some(value) => Some(
                value
                    .as_u64()
                    .and_then(|n| usize::try_from(n).ok())
                    .ok_or_else(|| {
                        ControlResponse::failure(
                            ErrorCode::InvalidArgs,
                            format!("limit must be a non-negative integer, got {value}"),
                        )
                    })?,
            ),
        };

        Ok(match &self.logs {
            Some(reader) => LogsResult {
                entries: reader.entries(limit),
                total: reader.len(),
            },
            None => LogsResult {
                entries: Vec::new(),
                total: 0,
            },
        })
    }
}

impl ControlHandler for Shared {
    fn handle(&self, request: ControlRequest) -> BoxFuture<'_, ControlResponse> {
        Box::pin(async move {
            match request.command.as_str() {
                commands::STATUS => reply(Ok(self.status().await)),
                commands::STOP => reply(self.stop().await),
                commands::RELOAD => reply(self.reload().await),
                commands::HEALTH => reply(Ok(self.health())),
                commands::LOGS => reply(self.logs(&request.args)),
                other => unknown_command(other),
            }
        })
    }
}

fn reply<T: Serialize>(result: Result<T, ControlResponse>) -> ControlResponse {
    match result {
        Ok(value) => match serde_json::to_value(value) {
            Ok(value) => ControlResponse::success(value),
            Err(e) => ControlResponse::failure(ErrorCode::Internal, e.to_string()),
        },
        Err(response) => response,
    }
}

/// A started daemon. Drive it with [`Supervisor::run`].
pub struct Supervisor {
    shared: Arc<Shared>,
    tunnel_rx: mpsc::UnboundedReceiver<TunnelEvent>,
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
    registry: PidRegistry,
    http_addr: SocketAddr,
    control_address: PathBuf,
    tasks: Vec<(&'static str, JoinHandle<io::Result<()>>)>,
    handle_signals: bool,
}

impl Supervisor {
    /// Bring the daemon up to `LocalOnly` (and start the tunnel when
    /// configured).
    ///
    /// Fails with [`SupervisorError::AlreadyRunning`] when the PID file
    /// names a live process. Bind and PID-file failures are fatal.
    pub async fn start(options: SupervisorOptions) -> Result<Self, SupervisorError> {
        let SupervisorOptions {
            storage_root,
            config_path,
            config,
            logs,
            handle_signals,
        } = options;

        let registry = PidRegistry::new(&storage_root);
        let check = registry.check_running_server().await?;
        let stale = match check.metadata {
            Some(existing) if check.running && existing.process_id != std::process::id() => {
                return Err(SupervisorError::AlreadyRunning {
                    pid: existing.process_id,
                    control_address: existing.control_address,
                });
            }
            Some(existing) => Some(existing.process_id),
            None => None,
        };

        let mut machine = RuntimeStateMachine::new();
        machine.subscribe(|t| {
            info!(from = %t.from, to = %t.to, cause = %t.cause, "Runtime state transition");
        });
        let (state_tx, state_rx) = watch::channel(machine.state());
        machine.subscribe(move |t| {
            state_tx.send_replace(t.to);
        });
        machine.transition(RuntimeEvent::StartRequested, "daemon start")?;

        let addr = format!("{}:{}", config.server.bind_addr, config.server.port);
        let http_listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(source) => {
                machine.transition(RuntimeEvent::UnrecoverableError, "HTTP bind failed")?;
                return Err(SupervisorError::Bind { addr, source });
            }
        };
        let http_addr = http_listener.local_addr()?;

        let control_address = resolve_socket_path(&storage_root);
        let control_listener = match ControlListener::bind(&control_address) {
            Ok(listener) => listener,
            Err(source) => {
                machine.transition(RuntimeEvent::UnrecoverableError, "control bind failed")?;
                return Err(SupervisorError::ControlBind {
                    path: control_address,
                    source,
                });
            }
        };
        machine.transition(
            RuntimeEvent::ListenerBound,
            format!("listening on {http_addr}"),
        )?;

        let metadata = ServerMetadata {
            process_id: std::process::id(),
            control_address: control_address.display().to_string(),
            root_path: storage_root.display().to_string(),
            started_at: Utc::now(),
            port: http_addr.port(),
            version: VERSION.to_string(),
        };
        if let Err(e) = record_pid(&registry, stale, &metadata).await {
            control_listener.close();
            machine.transition(RuntimeEvent::UnrecoverableError, format!("PID file: {e}"))?;
            return Err(e.into());
        }

        let (tunnel, tunnel_rx) =
            TunnelManager::new(&storage_root, RestartPolicy::from(&config.tunnel.restart));
        let started = Instant::now();
        let http_state = Arc::new(HttpState {
            runtime: state_rx,
            version: VERSION.to_string(),
            owner: config.identity.owner.clone(),
            started_at: started,
        });

        let shared = Arc::new(Shared {
            plane: Mutex::new(ControlPlane {
                machine,
                tunnel,
                config,
                identity: None,
            }),
            metadata,
            storage_root,
            config_path,
            logs,
            started,
            stop_requested: Notify::new(),
        });

        let (shutdown_tx, _) = broadcast::channel(1);
        let tasks = vec![
            (
                "http",
                tokio::spawn(http::serve(
                    http_listener,
                    http::router(http_state),
                    shutdown_tx.subscribe(),
                )),
            ),
            (
                "control",
                tokio::spawn(control::serve(
                    control_listener,
                    Arc::clone(&shared) as Arc<dyn ControlHandler>,
                    shutdown_tx.subscribe(),
                )),
            ),
        ];

        {
            let mut plane = shared.plane.lock().await;
            let enabled = plane.config.tunnel.enabled;
            plane.tunnel.set_enabled(enabled);
            if enabled {
                plane.start_tunnel(&shared.storage_root, http_addr.port()).await;
            } else {
                info!("Tunnel disabled; running local-only");
            }
        }

        info!(
            pid = shared.metadata.process_id,
            http = %http_addr,
            control = %control_address.display(),
            version = VERSION,
            "Daemon started"
        );

        Ok(Self {
            shared,
            tunnel_rx,
            shutdown_tx,
            registry,
            http_addr,
            control_address,
            tasks,
            handle_signals,
        })
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn control_address(&self) -> &Path {
        &self.control_address
    }

    pub fn metadata(&self) -> &ServerMetadata {
        &self.shared.metadata
    }

    pub async fn state(&self) -> RuntimeState {
        self.shared.plane.lock().await.machine.state()
    }

    /// Run until a stop command or termination signal, then tear down.
    /// Returns the final runtime state.
    pub async fn run(mut self) -> Result<RuntimeState, SupervisorError> {
        let handle_signals = self.handle_signals;
        let signal = termination_signal(handle_signals);
        tokio::pin!(signal);

        loop {
            tokio::select! {
                Some(event) = self.tunnel_rx.recv() => self.on_tunnel_event(event).await,
                _ = self.shared.stop_requested.notified() => {
                    info!("Stop requested over control channel");
                    break;
                }
                name = &mut signal => {
                    info!(signal = name, "Termination signal received");
                    break;
                }
            }
        }

        self.teardown().await
    }

    async fn on_tunnel_event(&self, event: TunnelEvent) {
        let mut plane = self.shared.plane.lock().await;
        let outcome = plane.tunnel.handle_event(event).await;
        plane.sync_tunnel_state();

        if let TunnelOutcome::Exhausted { attempts } = outcome {
            let cause = format!("tunnel restart attempts exhausted after {attempts} tries");
            match plane
                .machine
                .transition(RuntimeEvent::UnrecoverableError, cause)
            {
                Ok(_) => error!(attempts, "Daemon faulted; run `homestead stop` to recover"),
                Err(e) => debug!(error = %e, "Ignoring tunnel exhaustion"),
            }
        }
    }

    async fn teardown(self) -> Result<RuntimeState, SupervisorError> {
        {
            let mut plane = self.shared.plane.lock().await;
            let state = plane.machine.state();
            if matches!(
                state,
                RuntimeState::LocalOnly | RuntimeState::Tunneled | RuntimeState::Faulted
            ) {
                plane
                    .machine
                    .transition(RuntimeEvent::StopRequested, "termination signal")?;
            }
            plane.tunnel.stop().await;
        }

        let _ = self.shutdown_tx.send(ShutdownSignal);
        for (name, task) in self.tasks {
            match task.await {
                Ok(Ok(())) => debug!(task = name, "Listener closed"),
                Ok(Err(e)) => warn!(task = name, error = %e, "Listener exited with error"),
                Err(e) => warn!(task = name, error = %e, "Listener task panicked"),
            }
        }

        if let Err(e) = self.registry.remove().await {
            warn!(error = %e, "Failed to remove PID file");
        }

        let mut plane = self.shared.plane.lock().await;
        if plane.machine.state() == RuntimeState::Stopping {
            plane
                .machine
                .transition(RuntimeEvent::Closed, "listeners and tunnel closed")?;
        }
        info!("Daemon stopped");
        Ok(plane.machine.state())
    }
}

/// Replace a stale PID file with ours. Only called with both listeners
/// held, when the old file is provably stale.
async fn record_pid(
    registry: &PidRegistry,
    stale: Option<u32>,
    metadata: &ServerMetadata,
) -> Result<(), PidError> {
    if let Some(pid) = stale {
        info!(pid, "Removing stale PID file");
        registry.remove().await?;
    }
    registry.write(metadata).await
}

/// Resolves on SIGINT or SIGTERM; never resolves when disabled.
async fn termination_signal(enabled: bool) -> &'static str {
    if !enabled {
        return std::future::pending().await;
    }
    wait_for_signal().await
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            _ = term.recv() => "SIGTERM",
        },
        Err(e) => {
            warn!(error = %e, "Cannot install SIGTERM handler; only Ctrl-C stops the daemon");
            let _ = tokio::signal::ctrl_c().await;
            "SIGINT"
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "Ctrl-C"
}
