//! Change detection for tunnel settings.
//!
//! The gate keeps the most recently observed snapshot and the cancellation
//! token of the active generation. A snapshot that differs from the current
//! one replaces it and cancels the generation; the supervisor picks the new
//! snapshot up on its next iteration.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::info;

use tunman_core::TunnelSettings;

/// Cancellation scope of one snapshot's tunnel attempt.
///
/// Always a child of the shutdown token, so shutdown cancels it too.
#[derive(Debug, Clone)]
pub struct Generation {
    token: CancellationToken,
}

impl Generation {
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Holds the current settings snapshot and invalidates generations on change.
pub struct ChangeGate {
    snapshot: watch::Sender<Arc<TunnelSettings>>,
    generation: Mutex<Option<CancellationToken>>,
}

impl ChangeGate {
    pub fn new(initial: TunnelSettings) -> Self {
        let (snapshot, _) = watch::channel(Arc::new(initial));
        Self {
            snapshot,
            generation: Mutex::new(None),
        }
    }

    /// The most recently applied snapshot.
    pub fn current(&self) -> Arc<TunnelSettings> {
        Arc::clone(&self.snapshot.borrow())
    }

    /// Apply an incoming snapshot. Returns `true` if it differed from the
    /// current one (and the active generation was cancelled).
    pub fn apply(&self, settings: TunnelSettings) -> bool {
        info!("Settings change event raised");
        let changed = self.snapshot.send_if_modified(|current| {
            if **current == settings {
                false
            } else {
                *current = Arc::new(settings);
                true
            }
        });
        if !changed {
            info!("Did not detect any changes, ignoring");
            return false;
        }
        info!("Settings changed, invalidating active generation");
        self.invalidate();
        true
    }

    /// Start a new generation derived from `shutdown`, cancelling any previous one.
    pub fn begin_generation(&self, shutdown: &CancellationToken) -> Generation {
        let token = shutdown.child_token();
        let previous = self
            .generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }
        Generation { token }
    }

    /// Cancel the active generation, if any.
    pub fn invalidate(&self) {
        let active = self
            .generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(token) = active {
            token.cancel();
        }
    }

    /// Apply snapshots from `updates` until the channel closes or shutdown.
    pub async fn run(&self, mut updates: mpsc::Receiver<TunnelSettings>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                update = updates.recv() => match update {
                    Some(settings) => {
                        self.apply(settings);
                    }
                    None => break,
                },
            }
        }
        info!("Settings gate stopped");
    }
}
