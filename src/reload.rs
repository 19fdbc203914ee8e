//! Runtime reload: a coalescing trigger channel plus the coordinator that
//! re-reads the config and rewires scheduler and store.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{CliOverrides, ConfigError, load_config};
use crate::scheduler::Scheduler;
use crate::state::Store;

/// Single-slot reload trigger. Senders never block; a request arriving while
/// one is already pending is coalesced into it.
pub fn reload_channel() -> (ReloadHandle, mpsc::Receiver<()>) {
    let (tx, rx) = mpsc::channel(1);
    (ReloadHandle { tx }, rx)
}

#[derive(Clone)]
pub struct ReloadHandle {
    tx: mpsc::Sender<()>,
}

impl ReloadHandle {
    /// Request a reload. Drops the request silently when one is pending.
    pub fn request(&self) {
        let _ = self.tx.try_send(());
    }
}

/// Re-reads the config on each trigger and applies it.
pub struct ReloadManager {
    path: PathBuf,
    overrides: CliOverrides,
    scheduler: Arc<Scheduler>,
    store: Arc<Store>,
}

impl ReloadManager {
    pub fn new(
        path: impl Into<PathBuf>,
        overrides: CliOverrides,
        scheduler: Arc<Scheduler>,
        store: Arc<Store>,
    ) -> Self {
        Self {
            path: path.into(),
            overrides,
            scheduler,
            store,
        }
    }

    /// Reload once. A load error leaves the running configuration untouched.
    ///
    /// On success the scheduler is rewired before the store forgets removed
    /// targets (so dying loops cannot write to names the store still deems
    /// unknown), and the classification timeout changes last.
    pub fn reload(&self) -> Result<(), ConfigError> {
        let config = load_config(&self.path, &self.overrides)?;

        self.scheduler
            .update_config(config.global.clone(), &config.targets);
        self.store.update_targets(&config.targets);
        self.store.update_timeout(config.global.timeout);

        tracing::info!(
            targets = config.targets.len(),
            "configuration reloaded from {}",
            self.path.display()
        );
        Ok(())
    }

    /// Serve reload triggers until cancellation.
    pub async fn run(&self, mut trigger: mpsc::Receiver<()>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = trigger.recv() => {
                    if received.is_none() {
                        break;
                    }
                    if let Err(e) = self.reload() {
                        tracing::warn!("reload failed, keeping previous config: {e}");
                    }
                }
            }
        }
    }
}
