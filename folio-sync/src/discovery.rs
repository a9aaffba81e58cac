//! Discovery session: turns transport events into a live device set.
//!
//! The session runs as its own task and owns its registry outright. It
//! shares nothing with syncs or store reads except the broadcast cell it
//! publishes into.

use crate::broadcast::ReplayBroadcast;
use crate::transport::DiscoveryEvent;
use folio_types::{DeviceId, DeviceInfo, DiscoveredDevice, Timestamp};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Deduplicated set of peers seen in the current session.
#[derive(Debug)]
pub struct DeviceRegistry {
    local: DeviceId,
    devices: HashMap<DeviceId, (DiscoveredDevice, Instant)>,
}

impl DeviceRegistry {
    pub fn new(local: DeviceId) -> Self {
        Self {
            local,
            devices: HashMap::new(),
        }
    }

    /// Records an announcement; the latest one for a device wins.
    ///
    /// Returns whether the visible set changed. Our own announcements are
    /// ignored.
    pub fn observe(&mut self, info: DeviceInfo, heard_at: Instant) -> bool {
        if info.device_id == self.local {
            return false;
        }
        match self.devices.get_mut(&info.device_id) {
            Some((existing, last_heard)) => {
                *last_heard = heard_at;
                let changed = existing.device_info != info || !existing.is_reachable;
                existing.device_info = info;
                existing.is_reachable = true;
                changed
            }
            None => {
                let id = info.device_id.clone();
                self.devices
                    .insert(id, (DiscoveredDevice::new(info, Timestamp::now()), heard_at));
                true
            }
        }
    }

    pub fn remove(&mut self, device_id: &DeviceId) -> bool {
        self.devices.remove(device_id).is_some()
    }

    /// Drops devices not heard from within `max_age` of `now`.
    pub fn expire(&mut self, now: Instant, max_age: Duration) -> Vec<DeviceId> {
        let stale: Vec<DeviceId> = self
            .devices
            .iter()
            .filter(|(_, (_, heard))| now.saturating_duration_since(*heard) > max_age)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            self.devices.remove(id);
        }
        stale
    }

    pub fn get(&self, device_id: &DeviceId) -> Option<&DiscoveredDevice> {
        self.devices.get(device_id).map(|(d, _)| d)
    }

    /// Current devices, sorted by id.
    pub fn snapshot(&self) -> Vec<DiscoveredDevice> {
        let mut devices: Vec<DiscoveredDevice> =
            self.devices.values().map(|(d, _)| d.clone()).collect();
        devices.sort_by(|a, b| a.device_id().cmp(b.device_id()));
        devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Spawns the session task. It ends when the transport closes `events` or
/// the handle is aborted; `on_closed` runs only in the first case.
pub(crate) fn spawn_session(
    local: DeviceId,
    mut events: mpsc::Receiver<DiscoveryEvent>,
    devices: ReplayBroadcast<Vec<DiscoveredDevice>>,
    expiry: Duration,
    sweep_interval: Duration,
    on_closed: impl FnOnce() + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut registry = DeviceRegistry::new(local);
        let mut sweep = tokio::time::interval(sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("[SYNC] Discovery session started");

        loop {
            tokio::select! {
                event = events.recv() => {
                    let changed = match event {
                        Some(DiscoveryEvent::Announced(info)) => {
                            debug!("[SYNC] Announcement from {} ({})", info.device_id, info.device_name);
                            registry.observe(info, Instant::now())
                        }
                        Some(DiscoveryEvent::Lost(id)) => {
                            debug!("[SYNC] Device {} withdrew", id);
                            registry.remove(&id)
                        }
                        None => {
                            debug!("[SYNC] Discovery transport closed its event stream");
                            break;
                        }
                    };
                    if changed {
                        devices.publish(registry.snapshot());
                    }
                }
                _ = sweep.tick() => {
                    let expired = registry.expire(Instant::now(), expiry);
                    if !expired.is_empty() {
                        info!("[SYNC] {} device(s) expired: {:?}", expired.len(), expired);
                        devices.publish(registry.snapshot());
                    }
                }
            }
        }

        devices.publish(Vec::new());
        on_closed();
    })
}
