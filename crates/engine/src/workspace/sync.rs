// Sync status signalling over a watch channel. External sync engines drive
// the controller; consumers await the barrier before destructive operations.

use anyhow::{anyhow, Result};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Remote exchange still in flight (or no sync engine attached yet).
    Syncing,
    /// Every local update has been acknowledged remotely.
    Synced,
}

/// Write side: owned by whatever drives synchronization for the workspace.
#[derive(Debug)]
pub struct SyncController {
    tx: watch::Sender<SyncStatus>,
}

impl SyncController {
    pub fn set_status(&self, status: SyncStatus) {
        let _ = self.tx.send(status);
    }

    pub fn mark_synced(&self) {
        self.set_status(SyncStatus::Synced);
    }

    pub fn mark_syncing(&self) {
        self.set_status(SyncStatus::Syncing);
    }
}

/// Read side: cheap to clone, carried by the workspace.
#[derive(Debug, Clone)]
pub struct SyncHandle {
    rx: watch::Receiver<SyncStatus>,
}

impl SyncHandle {
    pub fn status(&self) -> SyncStatus {
        *self.rx.borrow()
    }

    /// Wait until the workspace reports `Synced`.
    ///
    /// Returns immediately when already synced. Errs when the controller is
    /// dropped while still syncing, since the barrier can then never pass.
    /// Callers bound the wait by wrapping the future (e.g. `tokio::time::timeout`).
    pub async fn wait_for_synced(&self) -> Result<()> {
        let mut rx = self.rx.clone();
        rx.wait_for(|status| *status == SyncStatus::Synced)
            .await
            .map(|_| ())
            .map_err(|_| anyhow!("sync channel closed before the workspace finished syncing"))
    }
}

/// Create a linked controller/handle pair with the given initial status.
pub fn sync_channel(initial: SyncStatus) -> (SyncController, SyncHandle) {
    let (tx, rx) = watch::channel(initial);
    (SyncController { tx }, SyncHandle { rx })
}
