#![forbid(unsafe_code)]

//! `term-supervisor` daemon binary.
//!
//! Loads configuration, starts the terminal server under the lifecycle
//! orchestrator, polls its health, and serves the control socket until
//! SIGINT or SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use term_supervisor::config::SupervisorConfig;
use term_supervisor::control::{
    Category, CommandTerminalLauncher, ControlSocketRouter, SystemHandler, TerminalHandler,
};
use term_supervisor::lifecycle::{
    spawn_health_monitor, LifecycleEvent, LifecycleOrchestrator, SystemPortInspector,
    SystemSignaller,
};
use term_supervisor::supervisor::ProcessSupervisor;
use term_supervisor::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "term-supervisor", about = "Terminal server supervisor", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the server port from the configuration file.
    #[arg(long)]
    port: Option<u16>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("term-supervisor bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(&args))
}

async fn run(args: &Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = SupervisorConfig::load_from_path(&args.config)?;
    if let Some(port) = args.port {
        if port == 0 {
            return Err(AppError::Config("--port must be greater than zero".into()));
        }
        config.server.port = port;
    }
    config.load_local_auth_token()?;
    info!(port = config.server.port, binary = %config.server.binary.display(), "configuration loaded");

    // ── Build the lifecycle stack ───────────────────────
    let supervisor = ProcessSupervisor::new(config.launch_config()?);
    let inspector = Arc::new(SystemPortInspector::new(config.server.bind_address.clone()));
    let orchestrator = Arc::new(LifecycleOrchestrator::new(
        supervisor,
        inspector,
        Arc::new(SystemSignaller),
        config.recovery_policy(),
    ));

    let ct = CancellationToken::new();
    let events_handle = tokio::spawn(log_lifecycle_events(
        orchestrator.subscribe(),
        ct.clone(),
    ));

    if let Err(err) = orchestrator.start().await {
        error!(%err, "terminal server did not start; control plane stays up");
    }
    let health_handle = spawn_health_monitor(&orchestrator);

    // ── Control plane ───────────────────────────────────
    let router = Arc::new(ControlSocketRouter::new(config.router_config()));
    router
        .register_handler(Category::System, Arc::new(SystemHandler::new()))
        .await;
    if let Some(ref program) = config.control.terminal_program {
        let launcher = CommandTerminalLauncher::new(program, config.control.terminal_args.clone());
        router
            .register_handler(Category::Terminal, Arc::new(TerminalHandler::new(launcher)))
            .await;
    } else {
        info!("no terminal_program configured; terminal requests will be rejected");
    }

    let router_handle = tokio::spawn(Arc::clone(&router).run(ct.clone()));
    info!("term-supervisor ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    if let Err(err) = orchestrator.shutdown().await {
        error!(%err, "error while stopping terminal server");
    }
    router.shutdown().await;

    let _ = tokio::join!(router_handle, health_handle, events_handle);
    info!("term-supervisor shut down");

    Ok(())
}

async fn log_lifecycle_events(
    mut events: tokio::sync::broadcast::Receiver<LifecycleEvent>,
    ct: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = ct.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(LifecycleEvent::GaveUp(err)) => {
                error!(%err, "automatic restart disabled until the next manual start");
            }
            Ok(LifecycleEvent::PortConflict(conflict)) => {
                warn!(
                    port = conflict.target_port,
                    owner = %conflict.owner_name(),
                    "terminal server port is taken by another application"
                );
            }
            Ok(event) => tracing::debug!(?event, "lifecycle event"),
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "lifecycle event log lagged");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
