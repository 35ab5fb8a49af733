//! tunman Daemon
//!
//! Keeps a reverse SSH tunnel to a remote host alive, rebuilding it when the
//! config file changes and relaunching it after transport failures.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use tunman_core::config::{default_config_path, load_config};
use tunman_daemon::{ChangeGate, ConfigWatcher, TunnelSupervisor};

#[derive(Parser, Debug)]
#[command(name = "tunman-daemon")]
#[command(version, about = "tunman daemon - reverse SSH tunnel keeper")]
struct Args {
    /// Config file path (TOML, or JSON for any other extension).
    /// Defaults to `<config_dir>/tunman/config.toml`.
    #[arg(long, env = "TUNMAN_CONFIG")]
    config: Option<PathBuf>,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "info", env = "TUNMAN_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "TUNMAN_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tunman_core::tracing_init::init_tracing(&args.log_level, args.log_json);

    let config_path = match args.config {
        Some(path) => path,
        None => default_config_path()
            .ok_or_else(|| anyhow::anyhow!("Cannot determine config directory"))?,
    };
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "Starting tunman-daemon"
    );
    let config = load_config(&config_path)?;

    let shutdown = CancellationToken::new();
    let gate = Arc::new(ChangeGate::new(config.tunman));

    let (updates_tx, updates_rx) = mpsc::channel(8);
    let gate_handle = {
        let gate = Arc::clone(&gate);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { gate.run(updates_rx, shutdown).await })
    };
    let watcher = ConfigWatcher::spawn(config_path, updates_tx, shutdown.clone());

    let supervisor = TunnelSupervisor::from_config(Arc::clone(&gate), &config.daemon);
    let mut supervisor_handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { supervisor.run(shutdown).await })
    };

    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;

    let finished = loop {
        #[cfg(unix)]
        let sigterm_future = sigterm.recv();
        #[cfg(not(unix))]
        let sigterm_future = std::future::pending::<Option<()>>();
        #[cfg(unix)]
        let sighup_future = sighup.recv();
        #[cfg(not(unix))]
        let sighup_future = std::future::pending::<Option<()>>();

        tokio::select! {
            result = &mut supervisor_handle => break Some(result),
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C shutdown signal");
                break None;
            }
            _ = sigterm_future => {
                info!("Received SIGTERM shutdown signal");
                break None;
            }
            _ = sighup_future => {
                info!("Received SIGHUP, reloading config");
                watcher.request_reload();
            }
        }
    };

    shutdown.cancel();
    let result = match finished {
        Some(result) => result,
        None => supervisor_handle.await,
    };
    watcher.join().await;
    let _ = gate_handle.await;

    result??;
    info!("Daemon stopped");
    Ok(())
}
