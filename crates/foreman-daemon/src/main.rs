//! Foreman Daemon
//!
//! Schedules backlog features onto supervised worker processes and serves
//! live state to observers over HTTP and WebSocket.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use foreman_core::config::load_config;
use foreman_core::tracing_init::{LogFormat, init_tracing};
use foreman_daemon::broadcast::EventHub;
use foreman_daemon::orchestration::Orchestrator;
use foreman_daemon::server::{self, AppState, ObserverSettings};
use foreman_daemon::storage::Database;
use foreman_daemon::subprocess::ProcessLauncher;

#[derive(Parser, Debug)]
#[command(name = "foreman-daemon")]
#[command(version, about = "Foreman daemon - drives a feature backlog through worker processes")]
struct Args {
    /// Project directory holding `.foreman/settings.json`
    #[arg(long, env = "FOREMAN_PROJECT_DIR")]
    project_dir: Option<PathBuf>,

    /// HTTP bind address (overrides config)
    #[arg(long, env = "FOREMAN_ADDR")]
    addr: Option<SocketAddr>,

    /// Database file path (overrides config)
    #[arg(long, env = "FOREMAN_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Worker executable (overrides config)
    #[arg(long, env = "FOREMAN_WORKER_COMMAND")]
    worker_command: Option<PathBuf>,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long, env = "FOREMAN_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format: pretty, compact or json.
    #[arg(long, env = "FOREMAN_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    /// Start with scheduling stopped; send `start` to begin.
    #[arg(long)]
    idle: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let project_dir = match args.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let mut config = load_config(Some(&project_dir))?;
    if let Some(addr) = args.addr {
        config.server.addr = addr;
    }
    if let Some(path) = &args.db_path {
        config.daemon.database_path = Some(path.clone());
    }
    if let Some(command) = &args.worker_command {
        config.worker.command.clone_from(command);
    }
    if let Some(level) = &args.log_level {
        config.daemon.log_level.clone_from(level);
    }
    config.validate()?;

    let format = args.log_format.unwrap_or(if config.daemon.log_json {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    });
    init_tracing(&format!("foreman_daemon={}", config.daemon.log_level), format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.server.addr,
        project_dir = %project_dir.display(),
        worker = %config.worker.command.display(),
        "Starting foreman-daemon"
    );

    let db_path = match &config.daemon.database_path {
        Some(path) => path.clone(),
        None => default_db_path()?,
    };
    info!(path = %db_path.display(), "Opening database");
    let db = Database::open(&db_path).await?;

    let recovered = db.release_all_claims().await?;
    if recovered > 0 {
        warn!(count = recovered, "Released claims left by a previous run");
    }

    let hub = EventHub::new(server::hub_config(&config.server));
    let launcher = Arc::new(ProcessLauncher::new(
        &config.worker,
        config.orchestrator.terminate_timeout(),
    ));
    let orchestrator = Orchestrator::new(db, hub, launcher, &config);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let loop_handle = {
        let orchestrator = orchestrator.clone();
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { orchestrator.run(shutdown_rx).await })
    };

    let app = server::router(AppState {
        orchestrator: orchestrator.clone(),
        observers: ObserverSettings::from(&config.server),
    });
    let listener = tokio::net::TcpListener::bind(config.server.addr).await?;
    let server_handle = tokio::spawn(server::serve(listener, app, shutdown_rx));

    if args.idle {
        info!("Started idle, waiting for a start command");
    } else {
        orchestrator.start().await;
    }

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // `true` unsets $NOTIFY_SOCKET so workers don't inherit it.
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    orchestrator.hard_stop().await;
    let _ = shutdown_tx.send(true);
    let _ = loop_handle.await;
    match server_handle.await {
        Ok(Err(e)) => warn!(error = %e, "HTTP server error"),
        Err(e) => warn!(error = %e, "HTTP server task failed"),
        Ok(Ok(())) => {}
    }

    info!("Daemon stopped");
    Ok(())
}

/// Default database path: the config directory, else `~/.foreman/foreman.db`.
fn default_db_path() -> anyhow::Result<PathBuf> {
    if let Some(path) = foreman_core::config::database_path() {
        return Ok(path);
    }
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?;
    Ok(home.join(".foreman").join("foreman.db"))
}
