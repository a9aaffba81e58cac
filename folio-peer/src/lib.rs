//! Building blocks for the `folio-peer` command-line peer.
//!
//! The binary syncs a JSON library file with one other device. Instead of a
//! LAN broadcast it uses [`StaticDiscovery`], which keeps announcing the peer
//! given on the command line, and it persists the library through
//! [`MemoryDataStore`] snapshots.

use anyhow::{Context, Result};
use async_trait::async_trait;
use folio_sync::{
    ConflictResolutionStrategy, CoordinatorConfig, DiscoveryEvent, DiscoveryTransport,
    MemoryDataStore, RetryConfig, SyncResult,
};
use folio_types::{DeviceId, DeviceInfo, DeviceType};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// How often [`StaticDiscovery`] re-announces its peers.
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(5);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Discovery ───────────────────────────────────────────────────────

/// Manual discovery: a fixed peer list, re-announced on a timer so the
/// coordinator never expires it.
pub struct StaticDiscovery {
    peers: Vec<DeviceInfo>,
    interval: Duration,
    announcer: Mutex<Option<JoinHandle<()>>>,
    broadcasting: Mutex<Option<DeviceInfo>>,
}

impl StaticDiscovery {
    pub fn new(peers: Vec<DeviceInfo>) -> Self {
        Self {
            peers,
            interval: ANNOUNCE_INTERVAL,
            announcer: Mutex::new(None),
            broadcasting: Mutex::new(None),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// The local device while broadcasting. Nothing goes on the wire.
    pub fn broadcasting(&self) -> Option<DeviceInfo> {
        lock(&self.broadcasting).clone()
    }
}

impl Drop for StaticDiscovery {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.announcer).take() {
            task.abort();
        }
    }
}

#[async_trait]
impl DiscoveryTransport for StaticDiscovery {
    async fn start_broadcasting(&self, local: &DeviceInfo) -> SyncResult<()> {
        *lock(&self.broadcasting) = Some(local.clone());
        Ok(())
    }

    async fn stop_broadcasting(&self) -> SyncResult<()> {
        lock(&self.broadcasting).take();
        Ok(())
    }

    async fn start_discovery(&self) -> SyncResult<mpsc::Receiver<DiscoveryEvent>> {
        let (tx, rx) = mpsc::channel(self.peers.len().max(1) * 4);
        let peers = self.peers.clone();
        let interval = self.interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                for peer in &peers {
                    debug!("Announcing static peer {}", peer.device_id);
                    if tx.send(DiscoveryEvent::Announced(peer.clone())).await.is_err() {
                        return;
                    }
                }
            }
        });

        if let Some(previous) = lock(&self.announcer).replace(task) {
            previous.abort();
        }
        info!("Static discovery started with {} peer(s)", self.peers.len());
        Ok(rx)
    }

    async fn stop_discovery(&self) -> SyncResult<()> {
        if let Some(task) = lock(&self.announcer).take() {
            task.abort();
        }
        Ok(())
    }
}

/// Describes a peer known only by id and address. Its name and version
/// are replaced by what it reports during the handshake.
pub fn static_peer(device_id: DeviceId, addr: SocketAddr, app_version: &str) -> DeviceInfo {
    DeviceInfo::new(
        device_id.clone(),
        device_id.to_string(),
        DeviceType::Unknown,
        app_version,
        addr.ip(),
        addr.port(),
    )
}

// ── Configuration ───────────────────────────────────────────────────

/// Optional JSON config file. Every field may be left out.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct PeerConfig {
    pub conflict_strategy: Option<String>,
    pub handshake_timeout_secs: Option<u64>,
    pub manifest_timeout_secs: Option<u64>,
    pub transfer_timeout_secs: Option<u64>,
    pub retry_attempts: Option<u32>,
    pub require_trusted_devices: Option<bool>,
    /// Peers trusted on startup.
    pub trusted_devices: Vec<String>,
}

impl PeerConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Invalid peer config")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_json(&json)
    }

    /// Overlays the set fields on `config`.
    pub fn apply(&self, mut config: CoordinatorConfig) -> Result<CoordinatorConfig> {
        if let Some(strategy) = &self.conflict_strategy {
            let strategy: ConflictResolutionStrategy =
                strategy.parse().map_err(anyhow::Error::msg)?;
            config = config.with_conflict_strategy(strategy);
        }
        if let Some(secs) = self.handshake_timeout_secs {
            config = config.with_handshake_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.manifest_timeout_secs {
            config = config.with_manifest_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.transfer_timeout_secs {
            config = config.with_transfer_timeout(Duration::from_secs(secs));
        }
        if let Some(attempts) = self.retry_attempts {
            let retry = RetryConfig {
                max_attempts: attempts.max(1),
                ..config.retry.clone()
            };
            config = config.with_retry(retry);
        }
        if let Some(required) = self.require_trusted_devices {
            config = config.with_trusted_devices_only(required);
        }
        Ok(config)
    }

    /// Parsed `trusted_devices`.
    pub fn trusted_ids(&self) -> Result<Vec<DeviceId>> {
        self.trusted_devices
            .iter()
            .map(|id| DeviceId::new(id.as_str()).with_context(|| format!("Invalid trusted device id {id:?}")))
            .collect()
    }
}

// ── Library file ────────────────────────────────────────────────────

/// Loads the library snapshot at `path`. A missing file is an empty library.
pub fn load_library(path: &Path) -> Result<MemoryDataStore> {
    if !path.exists() {
        info!("No library at {}, starting empty", path.display());
        return Ok(MemoryDataStore::new());
    }
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read library {}", path.display()))?;
    MemoryDataStore::from_json(&json)
        .with_context(|| format!("Failed to load library {}", path.display()))
}

/// Writes the store back to `path`, replacing the file in one rename.
pub async fn save_library(store: &MemoryDataStore, path: &Path) -> Result<()> {
    let json = store.to_json().await?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to replace library {}", path.display()))?;
    Ok(())
}
