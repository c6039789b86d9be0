//! Backup-row running heartbeat
//!
//! While a backup runs, its index row carries a heartbeat timestamp so crash
//! recovery can distinguish abandoned rows from active ones. The updater is
//! its own task on a fixed cadence and stops when asked.

use crate::dao::BackupDao;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

/// Periodic heartbeat task for one backup row
pub struct RunningUpdater {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl RunningUpdater {
    /// Spawn the heartbeat for `backup_id`
    pub fn spawn(dao: Arc<dyn BackupDao>, backup_id: i64, interval: Duration) -> Self {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = dao.update_file_backup_running(backup_id).await {
                            warn!("updating running heartbeat for backup {backup_id}: {e}");
                        }
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        Self { stop_tx, handle }
    }

    /// Stop the heartbeat and wait for the task to exit
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.handle.await;
    }
}
