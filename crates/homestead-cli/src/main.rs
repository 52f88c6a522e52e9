#![deny(unsafe_code)]

//! Homestead CLI: starts the personal server daemon and talks to it over
//! the local control channel.

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use homestead_config::{AppConfig, default_config_path, resolve_root_path};
use homestead_core::ipc::ControlClientError;
use homestead_core::ipc::protocol::StatusResult;
use homestead_core::logging::DEFAULT_CAPACITY;
use homestead_core::{
    ControlClient, DaemonizeOptions, LogCollector, LogReader, PidRegistry, Supervisor,
    SupervisorOptions, build_info, daemonize, is_daemonized, resolve_socket_path,
};

/// Homestead: a personal server that keeps your data local.
#[derive(Parser)]
#[command(name = "homestead", version, about, long_about = None)]
struct Cli {
    /// Storage root (default: $HOMESTEAD_ROOT_PATH, else ~/.homestead).
    #[arg(long, global = true)]
    root: Option<String>,

    /// Path to configuration file (default: {root}/config.toml).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Control request timeout in milliseconds (default: control.timeout_ms).
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon.
    Start {
        /// Run in the foreground instead of detaching.
        #[arg(long)]
        foreground: bool,
    },

    /// Stop a running daemon.
    Stop,

    /// Show daemon status.
    Status {
        /// Print the raw status as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Re-read the configuration file in the running daemon.
    Reload,

    /// Show recent daemon log entries.
    Logs {
        /// Number of entries to show.
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Validate and display configuration.
    Config {
        /// Show the resolved configuration.
        #[arg(long)]
        show: bool,
    },
}

/// Paths and settings every command needs.
struct Invocation {
    root: PathBuf,
    config_path: PathBuf,
    config: AppConfig,
    timeout: Duration,
}

impl Invocation {
    fn client(&self) -> ControlClient {
        ControlClient::new(resolve_socket_path(&self.root), self.timeout)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let root = resolve_root_path(cli.root.as_deref());
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| default_config_path(&root));
    let config = AppConfig::load_or_default(&config_path)
        .await
        .with_context(|| format!("invalid configuration at {}", config_path.display()))?;
    let timeout = cli
        .timeout_ms
        .map_or_else(|| config.control.timeout(), Duration::from_millis);

    let logs = init_tracing(cli.verbose, &config.logging.level);
    debug!(root = %root.display(), config = %config_path.display(), "Resolved paths");

    let ctx = Invocation {
        root,
        config_path,
        config,
        timeout,
    };

    match cli.command {
        Commands::Start { foreground } => {
            if foreground || is_daemonized() {
                cmd_run(ctx, logs).await
            } else {
                cmd_start(&ctx, cli.verbose).await
            }
        }
        Commands::Stop => cmd_stop(&ctx).await,
        Commands::Status { json } => cmd_status(&ctx, json).await,
        Commands::Reload => cmd_reload(&ctx).await,
        Commands::Logs { limit } => cmd_logs(&ctx, limit).await,
        Commands::Config { show } => cmd_config(&ctx, show),
    }
}

/// Registry with an env filter, a terminal formatter, and the in-memory
/// collector that backs `homestead logs`.
fn init_tracing(verbose: u8, config_level: &str) -> LogReader {
    let level = match verbose {
        0 => config_level,
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let collector = LogCollector::new(DEFAULT_CAPACITY);
    let reader = collector.reader();

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(collector)
        .init();
    reader
}

/// Detach a daemon and wait until it answers on the control channel.
async fn cmd_start(ctx: &Invocation, verbose: u8) -> Result<()> {
    let check = PidRegistry::new(&ctx.root).check_running_server().await?;
    if let Some(metadata) = check.metadata.filter(|_| check.running) {
        println!("Daemon is already running (pid {})", metadata.process_id);
        return Ok(());
    }

    let mut args: Vec<OsString> = vec![
        "--root".into(),
        ctx.root.clone().into(),
        "--config".into(),
        ctx.config_path.clone().into(),
    ];
    if verbose > 0 {
        args.push(format!("-{}", "v".repeat(usize::from(verbose))).into());
    }
    args.extend(["start".into(), "--foreground".into()]);

    let outcome = daemonize(&DaemonizeOptions {
        storage_root: ctx.root.clone(),
        args,
    })?;
    if !outcome.parent_should_exit {
        bail!("daemonize returned in the child process");
    }

    let client = ctx.client();
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Ok(health) = client.health().await {
            println!(
                "Daemon started (pid {}, version {})",
                health.pid, health.version
            );
            println!("Logs: {}", outcome.log_path.display());
            return Ok(());
        }
        if Instant::now() >= deadline {
            bail!(
                "daemon did not come up within 10s; see {}",
                outcome.log_path.display()
            );
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Run the supervisor in this process until it stops.
async fn cmd_run(ctx: Invocation, logs: LogReader) -> Result<()> {
    info!(version = %build_info::version_string(), "Starting Homestead");
    let options = SupervisorOptions::new(ctx.root, ctx.config_path, ctx.config).with_logs(logs);
    let supervisor = Supervisor::start(options).await?;
    let state = supervisor.run().await?;
    info!(%state, "Exiting");
    Ok(())
}

async fn cmd_stop(ctx: &Invocation) -> Result<()> {
    let client = ctx.client();
    match client.stop().await {
        Ok(result) if result.already_stopping => {
            println!("Daemon is already stopping ({})", result.runtime_state);
        }
        Ok(result) => {
            debug!(state = %result.runtime_state, "Stop acknowledged");
            wait_for_exit(ctx).await?;
            println!("Daemon stopped");
        }
        Err(ControlClientError::ConnectionRefused { .. }) => {
            let registry = PidRegistry::new(&ctx.root);
            let check = registry.check_running_server().await?;
            match check.metadata {
                Some(metadata) if check.running => bail!(
                    "daemon (pid {}) is running but not answering at {}",
                    metadata.process_id,
                    metadata.control_address
                ),
                Some(_) => {
                    registry.remove().await?;
                    println!("Daemon is not running (removed stale PID file)");
                }
                None => println!("Daemon is not running"),
            }
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Poll until the daemon removes its PID file.
async fn wait_for_exit(ctx: &Invocation) -> Result<()> {
    let registry = PidRegistry::new(&ctx.root);
    let deadline = Instant::now() + ctx.timeout + ctx.config.tunnel.grace_period();
    while registry.read().await?.is_some() {
        if Instant::now() >= deadline {
            bail!("daemon acknowledged stop but is still running");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    Ok(())
}

async fn cmd_status(ctx: &Invocation, json: bool) -> Result<()> {
    let status = match ctx.client().status().await {
        Ok(status) => status,
        Err(ControlClientError::ConnectionRefused { .. }) => {
            if json {
                println!("{}", serde_json::json!({ "running": false }));
            } else {
                println!("Daemon is not running");
            }
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print!("{}", render_status(&status));
    }
    Ok(())
}

fn render_status(status: &StatusResult) -> String {
    let tunnel = &status.tunnel;
    let mut out = format!(
        "State:    {}\nPID:      {}\nVersion:  {}\nPort:     {}\nStarted:  {}\nRoot:     {}\nControl:  {}\nTunnel:   {}{}\n",
        status.runtime_state,
        status.pid,
        status.version,
        status.port,
        status.started_at.to_rfc3339(),
        status.root_path,
        status.control_address,
        tunnel.status,
        if tunnel.enabled { "" } else { " (disabled)" },
    );
    if let Some(url) = &tunnel.public_url {
        out.push_str(&format!("URL:      {url}\n"));
    }
    if let Some(error) = &tunnel.last_error {
        out.push_str(&format!("Error:    {error}\n"));
    }
    out
}

async fn cmd_reload(ctx: &Invocation) -> Result<()> {
    let result = ctx.client().reload().await?;
    println!(
        "Configuration reloaded (tunnel {}, {})",
        if result.tunnel_enabled { "enabled" } else { "disabled" },
        result.tunnel_status.status
    );
    if !result.restart_required.is_empty() {
        println!(
            "Restart required for: {}",
            result.restart_required.join(", ")
        );
    }
    Ok(())
}

async fn cmd_logs(ctx: &Invocation, limit: usize) -> Result<()> {
    let result = ctx.client().logs(Some(limit)).await?;
    for entry in &result.entries {
        println!(
            "{} {:>5} {}: {}",
            entry.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            entry.level,
            entry.target,
            entry.message
        );
    }
    debug!(shown = result.entries.len(), total = result.total, "Logs fetched");
    Ok(())
}

fn cmd_config(ctx: &Invocation, show: bool) -> Result<()> {
    if show {
        let toml_str = toml::to_string_pretty(&ctx.config).context("TOML error")?;
        println!("{toml_str}");
    } else if ctx.config_path.exists() {
        println!(
            "Configuration at '{}' is valid.",
            ctx.config_path.display()
        );
    } else {
        println!(
            "No configuration at '{}'; using defaults.",
            ctx.config_path.display()
        );
    }
    if ctx.config.tunnel.enabled && !ctx.config.tunnel_active() {
        println!("Note: tunnel is enabled but identity.owner is not set; the daemon will run local-only.");
    }
    Ok(())
}
