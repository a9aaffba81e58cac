//! Periodic background sync with every discovered device.

use crate::coordinator::SyncCoordinator;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Controls a running auto-sync loop. Dropping the handle stops the loop.
pub struct AutoSyncHandle {
    stop: Arc<watch::Sender<bool>>,
    task: JoinHandle<()>,
}

impl AutoSyncHandle {
    /// Stops the loop. Syncs already started run to completion.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_running(&self) -> bool {
        !*self.stop.borrow() && !self.task.is_finished()
    }

    pub(crate) fn stop_signal(&self) -> Weak<watch::Sender<bool>> {
        Arc::downgrade(&self.stop)
    }
}

impl Drop for AutoSyncHandle {
    fn drop(&mut self) {
        self.stop.send_replace(true);
    }
}

/// Every `interval`, starts a background sync with each discovered device.
/// Devices already connecting or syncing are skipped for that cycle.
pub(crate) fn spawn(coordinator: SyncCoordinator, interval: Duration) -> AutoSyncHandle {
    let (stop, mut stopped) = watch::channel(false);

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("[SYNC] Auto-sync started (every {:?})", interval);

        loop {
            tokio::select! {
                _ = stopped.wait_for(|s| *s) => break,
                _ = ticker.tick() => {
                    let devices = coordinator.discovered_devices();
                    debug!("[SYNC] Auto-sync cycle over {} device(s)", devices.len());
                    for device in devices {
                        let coordinator = coordinator.clone();
                        tokio::spawn(async move {
                            let info = device.device_info;
                            match coordinator.background_sync(&info).await {
                                None => {}
                                Some(Ok(summary)) => debug!(
                                    "[SYNC] Auto-sync with {} moved {} item(s)",
                                    info.device_id, summary.items_transferred
                                ),
                                Some(Err(e)) => warn!("[SYNC] Auto-sync with {} failed: {}", info.device_id, e),
                            }
                        });
                    }
                }
            }
        }
        info!("[SYNC] Auto-sync stopped");
    });

    AutoSyncHandle {
        stop: Arc::new(stop),
        task,
    }
}
