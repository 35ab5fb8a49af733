//! Configuration file watcher.
//!
//! Reloads the config file whenever it changes on disk (or a reload is
//! requested explicitly) and forwards the tunnel section to the gate.

use std::path::{Path, PathBuf};

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tunman_core::TunnelSettings;
use tunman_core::config::load_config;

/// Handle for a running config watcher. Dropping it stops file notifications.
pub struct ConfigWatcher {
    _watcher: Option<RecommendedWatcher>,
    reload: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl ConfigWatcher {
    /// Start watching `path`, sending each successfully loaded snapshot on `updates`.
    ///
    /// If the filesystem watch cannot be installed the watcher still serves
    /// explicit reload requests.
    pub fn spawn(
        path: PathBuf,
        updates: mpsc::Sender<TunnelSettings>,
        shutdown: CancellationToken,
    ) -> Self {
        let (reload, triggers) = mpsc::channel(1);
        let watcher = match install_watch(&path, reload.clone()) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Config file watch unavailable");
                None
            }
        };
        let task = tokio::spawn(reload_loop(path, triggers, updates, shutdown));
        Self {
            _watcher: watcher,
            reload,
            task,
        }
    }

    /// Request a reload, e.g. on SIGHUP. Coalesces with a pending request.
    pub fn request_reload(&self) {
        let _ = self.reload.try_send(());
    }

    /// Wait for the reload task to finish (after shutdown).
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

fn install_watch(path: &Path, reload: mpsc::Sender<()>) -> notify::Result<RecommendedWatcher> {
    let file_name = path.file_name().map(ToOwned::to_owned);
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        match res {
            Ok(event) => {
                let relevant = matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                ) && event
                    .paths
                    .iter()
                    .any(|p| p.file_name() == file_name.as_deref());
                if relevant {
                    let _ = reload.try_send(());
                }
            }
            Err(e) => warn!(error = %e, "Config watch error"),
        }
    })?;
    // Watch the directory: editors commonly replace the file rather than write it.
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    info!(path = %path.display(), "Watching config file");
    Ok(watcher)
}

async fn reload_loop(
    path: PathBuf,
    mut triggers: mpsc::Receiver<()>,
    updates: mpsc::Sender<TunnelSettings>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            trigger = triggers.recv() => {
                if trigger.is_none() {
                    break;
                }
                let Some(settings) = reload(&path) else {
                    continue;
                };
                if updates.send(settings).await.is_err() {
                    debug!("Settings channel closed");
                    break;
                }
            }
        }
    }
    debug!("Config watcher stopped");
}

/// Load the tunnel section of the config file, logging failures.
pub fn reload(path: &Path) -> Option<TunnelSettings> {
    match load_config(path) {
        Ok(config) => {
            info!(path = %path.display(), "Reloaded config file");
            Some(config.tunman)
        }
        Err(e) => {
            error!(error = %e, "Failed to reload config, keeping current settings");
            None
        }
    }
}
