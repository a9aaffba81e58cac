//! Sync coordinator — owns discovery, connections and sync runs.
//!
//! The coordinator is the only component that does I/O. The diff engine,
//! conflict resolver and role negotiator are pure; the store, discovery
//! transport and transfer channels are injected collaborators.
//!
//! Concurrency rules:
//! - discovery runs in its own task and never takes a lock a sync or a
//!   store read needs
//! - at most one connection per remote device; connects to the same device
//!   are serialized and a second connect returns the first connection
//! - sync runs on one connection queue behind each other; runs with
//!   different devices do not share a lock
//! - `cancel_sync` bumps an epoch that every run captured before queueing,
//!   so it reaches running and queued runs alike
//! - a run that fails or is cancelled closes its connection, because the
//!   peer's position in the message sequence is no longer known

use crate::autosync::{self, AutoSyncHandle};
use crate::broadcast::{ReplayBroadcast, Subscription};
use crate::config::CoordinatorConfig;
use crate::conflict::{Conflict, ConflictResolutionStrategy, ConflictResolver, Resolution};
use crate::debounce::Debouncer;
use crate::diff::ManifestDiffEngine;
use crate::discovery::spawn_session;
use crate::error::{SyncError, SyncResult, check_versions};
use crate::protocol::{
    DataAckMessage, ErrorMessage, HelloAckMessage, HelloMessage, PROTOCOL_VERSION,
    TransferMessage,
};
use crate::retry::{retry_if, retry_with_backoff};
use crate::role::{Role, RoleNegotiator};
use crate::status::{SyncStatus, SyncStatusPublisher};
use crate::store::{
    LocalDataStore, SyncLogEntry, SyncLogStatus, SyncMetadataRecord, TrustedDevice,
};
use crate::transport::{ChannelProvider, DiscoveryTransport, TransferChannel};
use crate::trust::{AllowAllTrust, TrustPolicy, TrustedDevicesOnly};
use folio_types::{
    BookSyncData, BookmarkData, DeviceId, DeviceInfo, DiscoveredDevice, ItemId,
    ReadingProgressData, SyncData, SyncManifest, SyncPayload, Timestamp,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{OwnedMutexGuard, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long an aborting side waits for the peer to read its reason.
const ABORT_LINGER: Duration = Duration::from_secs(2);

/// How long a failed send waits for the peer's abort reason.
const ABORT_PEEK: Duration = Duration::from_millis(250);

/// A live, negotiated link to one remote device.
#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
    pub device_id: DeviceId,
    pub device_name: String,
    /// Fixed for the lifetime of the connection.
    pub role: Role,
    /// The peer as it described itself during the handshake.
    pub remote: DeviceInfo,
    pub established_at: Timestamp,
    session: u64,
}

/// Outcome of a successful sync run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSummary {
    pub device_id: DeviceId,
    pub duration: Duration,
    /// Items sent plus items written locally.
    pub items_transferred: usize,
    pub items_sent: usize,
    pub items_received: usize,
    pub conflicts: usize,
}

struct ConnectionEntry {
    connection: Connection,
    channel: Arc<dyn TransferChannel>,
}

type DeviceLocks = Mutex<HashMap<DeviceId, Arc<tokio::sync::Mutex<()>>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn device_lock(locks: &DeviceLocks, id: &DeviceId) -> Arc<tokio::sync::Mutex<()>> {
    Arc::clone(lock(locks).entry(id.clone()).or_default())
}

/// Resolves once the cancel epoch moves past `epoch`.
async fn cancelled(mut rx: watch::Receiver<u64>, epoch: u64) {
    if rx.wait_for(|current| *current != epoch).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Counts a run from the moment it queues until it has reported.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

enum SyncInput<'a> {
    /// Swap manifests over the channel first.
    Exchange,
    /// Manifests the caller already exchanged.
    Manifests(&'a SyncManifest, &'a SyncManifest),
}

struct Inner {
    config: CoordinatorConfig,
    store: Arc<dyn LocalDataStore>,
    discovery: Arc<dyn DiscoveryTransport>,
    channels: Arc<dyn ChannelProvider>,
    trust: Arc<dyn TrustPolicy>,
    status: SyncStatusPublisher,
    devices: ReplayBroadcast<Vec<DiscoveredDevice>>,
    /// Also serializes start/stop of discovery.
    discovery_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    discovering: AtomicBool,
    connections: Mutex<HashMap<DeviceId, ConnectionEntry>>,
    current: Mutex<Option<DeviceId>>,
    next_session: AtomicU64,
    connect_locks: DeviceLocks,
    sync_locks: DeviceLocks,
    metadata_locks: DeviceLocks,
    cancel_epoch: watch::Sender<u64>,
    in_flight: AtomicUsize,
    progress_debouncer: Debouncer<String>,
    auto_sync: Mutex<Vec<Weak<watch::Sender<bool>>>>,
}

/// Handle to the sync engine. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<Inner>,
}

impl SyncCoordinator {
    /// Creates a coordinator. The trust policy follows
    /// `config.require_trusted_devices`.
    pub fn new(
        config: CoordinatorConfig,
        store: Arc<dyn LocalDataStore>,
        discovery: Arc<dyn DiscoveryTransport>,
        channels: Arc<dyn ChannelProvider>,
    ) -> Self {
        let trust: Arc<dyn TrustPolicy> = if config.require_trusted_devices {
            Arc::new(TrustedDevicesOnly::new(Arc::clone(&store)))
        } else {
            Arc::new(AllowAllTrust)
        };
        Self::with_trust_policy(config, store, discovery, channels, trust)
    }

    /// Creates a coordinator with a custom trust policy.
    pub fn with_trust_policy(
        config: CoordinatorConfig,
        store: Arc<dyn LocalDataStore>,
        discovery: Arc<dyn DiscoveryTransport>,
        channels: Arc<dyn ChannelProvider>,
        trust: Arc<dyn TrustPolicy>,
    ) -> Self {
        let (cancel_epoch, _) = watch::channel(0);
        let progress_debouncer = Debouncer::new(config.debounce_window);
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                discovery,
                channels,
                trust,
                status: SyncStatusPublisher::new(),
                devices: ReplayBroadcast::new(Vec::new()),
                discovery_task: tokio::sync::Mutex::new(None),
                discovering: AtomicBool::new(false),
                connections: Mutex::new(HashMap::new()),
                current: Mutex::new(None),
                next_session: AtomicU64::new(1),
                connect_locks: Mutex::new(HashMap::new()),
                sync_locks: Mutex::new(HashMap::new()),
                metadata_locks: Mutex::new(HashMap::new()),
                cancel_epoch,
                in_flight: AtomicUsize::new(0),
                progress_debouncer,
                auto_sync: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    pub fn local_device(&self) -> &DeviceInfo {
        &self.inner.config.local_device
    }

    // ── Discovery ───────────────────────────────────────────────────

    /// Starts announcing this device and listening for peers. A no-op if
    /// discovery is already running.
    pub async fn start_discovery(&self) -> SyncResult<()> {
        let mut task = self.inner.discovery_task.lock().await;
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            debug!("[SYNC] Discovery already running");
            return Ok(());
        }

        let local = &self.inner.config.local_device;
        self.inner.discovery.start_broadcasting(local).await?;
        let events = match self.inner.discovery.start_discovery().await {
            Ok(events) => events,
            Err(e) => {
                warn!("[SYNC] Failed to start discovery: {}", e);
                let _ = self.inner.discovery.stop_broadcasting().await;
                return Err(e);
            }
        };

        self.inner.discovering.store(true, Ordering::SeqCst);
        self.inner
            .status
            .publish_when(|s| !s.is_active(), SyncStatus::Discovering);
        let ended = Arc::downgrade(&self.inner);
        *task = Some(spawn_session(
            local.device_id.clone(),
            events,
            self.inner.devices.clone(),
            self.inner.config.discovery_expiry,
            self.inner.config.discovery_sweep_interval,
            move || {
                if let Some(inner) = ended.upgrade() {
                    info!("[SYNC] Discovery ended by the transport");
                    SyncCoordinator { inner }.discovery_ended();
                }
            },
        ));
        info!("[SYNC] Discovery started for {}", local.device_id);
        Ok(())
    }

    /// Stops discovery and clears the device set. A no-op if not running.
    pub async fn stop_discovery(&self) -> SyncResult<()> {
        let mut task = self.inner.discovery_task.lock().await;
        let Some(handle) = task.take() else {
            debug!("[SYNC] Discovery not running");
            return Ok(());
        };

        handle.abort();
        self.inner.discovering.store(false, Ordering::SeqCst);
        self.inner.devices.publish(Vec::new());
        let stopped = self.inner.discovery.stop_discovery().await;
        let unannounced = self.inner.discovery.stop_broadcasting().await;
        self.inner
            .status
            .publish_when(|s| *s == SyncStatus::Discovering, SyncStatus::Idle);
        info!("[SYNC] Discovery stopped");
        stopped.and(unannounced)
    }

    fn discovery_ended(&self) {
        self.inner.discovering.store(false, Ordering::SeqCst);
        self.inner
            .status
            .publish_when(|s| *s == SyncStatus::Discovering, SyncStatus::Idle);
    }

    pub fn is_discovering(&self) -> bool {
        self.inner.discovering.load(Ordering::SeqCst)
    }

    /// Live device set: the current set first, then every change.
    pub fn observe_discovered_devices(&self) -> Subscription<Vec<DiscoveredDevice>> {
        self.inner.devices.subscribe()
    }

    pub fn discovered_devices(&self) -> Vec<DiscoveredDevice> {
        self.inner.devices.current()
    }

    // ── Connections ─────────────────────────────────────────────────

    /// Checks versions and trust, negotiates roles, opens the channel and
    /// runs the handshake. Returns the existing connection if one is live.
    pub async fn connect_to_device(&self, device: &DeviceInfo) -> SyncResult<Connection> {
        let connect_lock = device_lock(&self.inner.connect_locks, &device.device_id);
        let _guard = connect_lock.lock().await;

        if let Some(existing) = self.connection_for(&device.device_id) {
            debug!("[SYNC] Reusing connection to {}", device.device_id);
            return Ok(existing);
        }

        self.inner.status.publish(SyncStatus::Connecting {
            device_name: device.device_name.clone(),
        });
        info!(device_id = %device.device_id, "[SYNC] Connecting to {} ({})", device.device_name, device.socket_addr());

        match self.establish(device).await {
            Ok(connection) => {
                info!(
                    device_id = %connection.device_id,
                    "[SYNC] Connected to {} as {}",
                    connection.device_name, connection.role
                );
                self.settle();
                Ok(connection)
            }
            Err(e) => {
                warn!(device_id = %device.device_id, "[SYNC] Connection to {} failed: {}", device.device_name, e);
                self.inner.status.publish(SyncStatus::Failed {
                    device_name: Some(device.device_name.clone()),
                    error: e.clone(),
                });
                self.settle();
                Err(e)
            }
        }
    }

    async fn establish(&self, device: &DeviceInfo) -> SyncResult<Connection> {
        let config = &self.inner.config;
        let local = &config.local_device;

        check_versions(&local.app_version, &device.app_version)?;
        self.inner.trust.authorize(device).await?;
        let role = RoleNegotiator::negotiate(&local.device_id, &device.device_id, true)?;

        let channel = self.inner.channels.open_channel(device);
        retry_with_backoff(&config.retry, "connect", || {
            let channel = Arc::clone(&channel);
            let device = device.clone();
            async move { channel.connect(&device, role).await }
        })
        .await
        .map_err(|e| self.classify_connect_error(device, e))?;

        let handshake = async {
            match role {
                Role::Client => self.client_handshake(&channel, device).await,
                Role::Server => self.server_handshake(&channel, device).await,
            }
        };
        let remote = match tokio::time::timeout(config.handshake_timeout, handshake).await {
            Ok(Ok(remote)) => remote,
            Ok(Err(e)) => {
                let _ = channel.disconnect().await;
                return Err(e);
            }
            Err(_) => {
                let _ = channel.disconnect().await;
                return Err(SyncError::ConnectionFailed(format!(
                    "handshake with {} timed out",
                    device.device_id
                )));
            }
        };

        let connection = Connection {
            device_id: remote.device_id.clone(),
            device_name: remote.device_name.clone(),
            role,
            remote,
            established_at: Timestamp::now(),
            session: self.inner.next_session.fetch_add(1, Ordering::SeqCst),
        };
        lock(&self.inner.connections).insert(
            connection.device_id.clone(),
            ConnectionEntry {
                connection: connection.clone(),
                channel,
            },
        );
        *lock(&self.inner.current) = Some(connection.device_id.clone());
        Ok(connection)
    }

    /// A failed dial to a device discovery no longer lists means it left.
    fn classify_connect_error(&self, device: &DeviceInfo, error: SyncError) -> SyncError {
        let vanished = self.is_discovering()
            && !self
                .inner
                .devices
                .current()
                .iter()
                .any(|d| d.device_id() == &device.device_id);
        match error {
            SyncError::ConnectionFailed(_) if vanished => {
                SyncError::DeviceNotFound(device.device_id.to_string())
            }
            other => other,
        }
    }

    async fn client_handshake(
        &self,
        channel: &Arc<dyn TransferChannel>,
        expected: &DeviceInfo,
    ) -> SyncResult<DeviceInfo> {
        let local = &self.inner.config.local_device;
        debug!("[SYNC] Sending Hello to {}", expected.device_id);
        self.send(channel, TransferMessage::Hello(HelloMessage::new(local.clone())))
            .await?;

        let ack = match channel.receive().await? {
            TransferMessage::HelloAck(ack) => ack,
            TransferMessage::Error(e) => return Err(e.into_error()),
            other => {
                return Err(SyncError::ConnectionFailed(format!(
                    "expected HelloAck, got {}",
                    other.kind()
                )));
            }
        };
        if !ack.accepted {
            let rejection = ack
                .rejection
                .unwrap_or_else(|| ErrorMessage::authentication("rejected by peer"));
            warn!("[SYNC] Peer {} rejected handshake: {}", expected.device_id, rejection.message);
            return Err(rejection.into_error());
        }

        let verdict = self.vet_peer(&ack.device, expected, ack.protocol_version).await;
        if let Err(e) = &verdict {
            let _ = channel
                .send(TransferMessage::Error(ErrorMessage::from_error(e)))
                .await;
        }
        verdict.map(|_| ack.device)
    }

    async fn server_handshake(
        &self,
        channel: &Arc<dyn TransferChannel>,
        expected: &DeviceInfo,
    ) -> SyncResult<DeviceInfo> {
        let local = &self.inner.config.local_device;
        let hello = match channel.receive().await? {
            TransferMessage::Hello(hello) => hello,
            TransferMessage::Error(e) => return Err(e.into_error()),
            other => {
                return Err(SyncError::ConnectionFailed(format!(
                    "expected Hello, got {}",
                    other.kind()
                )));
            }
        };
        debug!("[SYNC] Received Hello from {}", hello.device.device_id);

        match self
            .vet_peer(&hello.device, expected, hello.protocol_version)
            .await
        {
            Ok(()) => {
                self.send(
                    channel,
                    TransferMessage::HelloAck(HelloAckMessage::accept(local.clone())),
                )
                .await?;
                Ok(hello.device)
            }
            Err(e) => {
                let rejection = match &e {
                    SyncError::ConnectionFailed(_) => {
                        ErrorMessage::version_mismatch(PROTOCOL_VERSION, hello.protocol_version)
                    }
                    other => ErrorMessage::from_error(other),
                };
                let _ = channel
                    .send(TransferMessage::HelloAck(HelloAckMessage::reject(
                        local.clone(),
                        rejection,
                    )))
                    .await;
                Err(e)
            }
        }
    }

    /// Checks the peer's own description against what we dialed.
    async fn vet_peer(
        &self,
        peer: &DeviceInfo,
        expected: &DeviceInfo,
        protocol_version: u32,
    ) -> SyncResult<()> {
        if protocol_version != PROTOCOL_VERSION {
            return Err(SyncError::ConnectionFailed(format!(
                "protocol version mismatch: expected {PROTOCOL_VERSION}, got {protocol_version}"
            )));
        }
        if peer.device_id != expected.device_id {
            return Err(SyncError::AuthenticationFailed(format!(
                "expected {}, but {} answered",
                expected.device_id, peer.device_id
            )));
        }
        check_versions(&self.inner.config.local_device.app_version, &peer.app_version)?;
        self.inner.trust.authorize(peer).await
    }

    /// Tears the connection down and returns to the resting state.
    pub async fn disconnect_from_device(&self, connection: &Connection) -> SyncResult<()> {
        let result = match self.remove_connection(connection) {
            Some(entry) => {
                info!(device_id = %connection.device_id, "[SYNC] Disconnected from {}", connection.device_name);
                entry.channel.disconnect().await
            }
            None => {
                debug!("[SYNC] {} was not connected", connection.device_id);
                Ok(())
            }
        };
        self.settle();
        result
    }

    fn remove_connection(&self, connection: &Connection) -> Option<ConnectionEntry> {
        let entry = {
            let mut connections = lock(&self.inner.connections);
            match connections.get(&connection.device_id) {
                Some(entry) if entry.connection.session == connection.session => {
                    connections.remove(&connection.device_id)
                }
                _ => None,
            }
        };
        if entry.is_some() {
            let mut current = lock(&self.inner.current);
            if current.as_ref() == Some(&connection.device_id) {
                *current = None;
            }
        }
        entry
    }

    async fn drop_connection(&self, connection: &Connection) {
        if let Some(entry) = self.remove_connection(connection) {
            debug!("[SYNC] Closing connection to {}", connection.device_id);
            let _ = entry.channel.disconnect().await;
        }
    }

    /// The connection most recently established, if still live.
    pub fn current_connection(&self) -> Option<Connection> {
        let current = lock(&self.inner.current).clone()?;
        self.connection_for(&current)
    }

    pub fn connection_for(&self, device_id: &DeviceId) -> Option<Connection> {
        lock(&self.inner.connections)
            .get(device_id)
            .map(|e| e.connection.clone())
    }

    /// All live connections, sorted by device id.
    pub fn connections(&self) -> Vec<Connection> {
        let mut all: Vec<Connection> = lock(&self.inner.connections)
            .values()
            .map(|e| e.connection.clone())
            .collect();
        all.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        all
    }

    fn channel_for(&self, connection: &Connection) -> SyncResult<Arc<dyn TransferChannel>> {
        match lock(&self.inner.connections).get(&connection.device_id) {
            Some(entry) if entry.connection.session == connection.session => {
                Ok(Arc::clone(&entry.channel))
            }
            _ => Err(SyncError::ConnectionFailed(format!(
                "not connected to {}",
                connection.device_id
            ))),
        }
    }

    // ── Manifests ───────────────────────────────────────────────────

    /// Snapshot of every local item: books, reading progress, bookmarks.
    pub async fn build_local_manifest(&self) -> SyncResult<SyncManifest> {
        let payloads = self.local_payloads().await?;
        let mut items: Vec<_> = payloads.values().map(SyncPayload::manifest_item).collect();
        items.sort_by(|a, b| a.item_id.cmp(&b.item_id));
        Ok(SyncManifest::new(
            self.inner.config.local_device.device_id.clone(),
            Timestamp::now(),
            items,
        )?)
    }

    async fn local_payloads(&self) -> SyncResult<HashMap<ItemId, SyncPayload>> {
        let store = &self.inner.store;
        let (books, progress, bookmarks) = tokio::try_join!(
            store.get_books(),
            store.get_reading_progress(),
            store.get_bookmarks()
        )?;

        let payloads = books
            .into_iter()
            .map(SyncPayload::Book)
            .chain(progress.into_iter().map(SyncPayload::Progress))
            .chain(bookmarks.into_iter().map(SyncPayload::Bookmark));
        Ok(payloads.map(|p| (p.item_id(), p)).collect())
    }

    /// Sends the local manifest and receives the peer's. The client sends
    /// first.
    pub async fn exchange_manifests(
        &self,
        connection: &Connection,
    ) -> SyncResult<(SyncManifest, SyncManifest)> {
        let channel = self.channel_for(connection)?;
        let sync_lock = device_lock(&self.inner.sync_locks, &connection.device_id);
        let _guard = sync_lock.lock().await;

        match self.swap_manifests(connection, &channel).await {
            Ok(manifests) => Ok(manifests),
            Err(e) => {
                warn!(device_id = %connection.device_id, "[SYNC] Manifest exchange failed: {}", e);
                self.drop_connection(connection).await;
                self.inner.status.publish(SyncStatus::Failed {
                    device_name: Some(connection.device_name.clone()),
                    error: e.clone(),
                });
                self.settle();
                Err(e)
            }
        }
    }

    async fn swap_manifests(
        &self,
        connection: &Connection,
        channel: &Arc<dyn TransferChannel>,
    ) -> SyncResult<(SyncManifest, SyncManifest)> {
        let local = self.build_local_manifest().await?;
        let timeout = self.inner.config.manifest_timeout;

        let remote = if connection.role.sends_first() {
            self.send(channel, TransferMessage::Manifest(local.clone()))
                .await?;
            self.receive_manifest(channel, timeout).await?
        } else {
            let remote = self.receive_manifest(channel, timeout).await?;
            self.send(channel, TransferMessage::Manifest(local.clone()))
                .await?;
            remote
        };

        remote.validate()?;
        if remote.device_id != connection.device_id {
            return Err(SyncError::TransferFailed(format!(
                "manifest from {} on the connection to {}",
                remote.device_id, connection.device_id
            )));
        }
        debug!(
            "[SYNC] Manifests exchanged with {}: {} local, {} remote items",
            connection.device_id,
            local.len(),
            remote.len()
        );
        Ok((local, remote))
    }

    async fn receive_manifest(
        &self,
        channel: &Arc<dyn TransferChannel>,
        timeout: Duration,
    ) -> SyncResult<SyncManifest> {
        match self.receive(channel, timeout, "manifest").await? {
            TransferMessage::Manifest(m) => Ok(m),
            other => Err(SyncError::TransferFailed(format!(
                "expected Manifest, got {}",
                other.kind()
            ))),
        }
    }

    // ── Sync runs ───────────────────────────────────────────────────

    /// Diffs, resolves and transfers. Runs on the same connection queue;
    /// `cancel_sync` ends queued and running syncs.
    pub async fn perform_sync(
        &self,
        connection: &Connection,
        local: &SyncManifest,
        remote: &SyncManifest,
    ) -> SyncResult<SyncSummary> {
        self.perform_sync_with_overrides(connection, local, remote, &HashMap::new())
            .await
    }

    /// Like [`SyncCoordinator::perform_sync`], with user decisions for
    /// conflicts the strategy leaves to manual input.
    pub async fn perform_sync_with_overrides(
        &self,
        connection: &Connection,
        local: &SyncManifest,
        remote: &SyncManifest,
        overrides: &HashMap<ItemId, Resolution>,
    ) -> SyncResult<SyncSummary> {
        self.run_queued(connection, SyncInput::Manifests(local, remote), overrides)
            .await
    }

    /// Connects if needed, exchanges manifests and syncs, holding the
    /// connection's sync lock throughout.
    pub async fn sync_with_device(&self, device: &DeviceInfo) -> SyncResult<SyncSummary> {
        let connection = self.connect_to_device(device).await?;
        self.run_queued(&connection, SyncInput::Exchange, &HashMap::new())
            .await
    }

    /// Auto-sync entry point: skips the device instead of waiting when it is
    /// already connecting or syncing.
    pub(crate) async fn background_sync(
        &self,
        device: &DeviceInfo,
    ) -> Option<SyncResult<SyncSummary>> {
        if let Err(e) = self.inner.trust.authorize(device).await {
            debug!("[SYNC] Auto-sync skipping {}: {}", device.device_id, e);
            return None;
        }

        let connection = match self.connection_for(&device.device_id) {
            Some(connection) => connection,
            None => {
                let connect_lock = device_lock(&self.inner.connect_locks, &device.device_id);
                if connect_lock.try_lock().is_err() {
                    debug!("[SYNC] Auto-sync skipping {}: connect in progress", device.device_id);
                    return None;
                }
                match self.connect_to_device(device).await {
                    Ok(connection) => connection,
                    Err(e) => return Some(Err(e)),
                }
            }
        };

        let epoch = *self.inner.cancel_epoch.borrow();
        let flight = InFlight::enter(&self.inner.in_flight);
        let sync_lock = device_lock(&self.inner.sync_locks, &connection.device_id);
        let Ok(guard) = sync_lock.try_lock_owned() else {
            debug!("[SYNC] Auto-sync skipping {}: sync in progress", device.device_id);
            return None;
        };
        Some(
            self.run_locked(&connection, SyncInput::Exchange, &HashMap::new(), epoch, guard, flight)
                .await,
        )
    }

    async fn run_queued(
        &self,
        connection: &Connection,
        input: SyncInput<'_>,
        overrides: &HashMap<ItemId, Resolution>,
    ) -> SyncResult<SyncSummary> {
        // Captured before queueing so a cancel also reaches waiting runs.
        let epoch = *self.inner.cancel_epoch.borrow();
        let flight = InFlight::enter(&self.inner.in_flight);
        let sync_lock = device_lock(&self.inner.sync_locks, &connection.device_id);

        // Cancel first: a cancel and the lock release land together.
        let guard = tokio::select! {
            biased;
            _ = cancelled(self.inner.cancel_epoch.subscribe(), epoch) => {
                debug!("[SYNC] Queued sync with {} cancelled", connection.device_id);
                return self
                    .finish(connection, Instant::now(), Err(SyncError::Cancelled), 0, flight)
                    .await;
            }
            guard = sync_lock.lock_owned() => guard,
        };
        self.run_locked(connection, input, overrides, epoch, guard, flight)
            .await
    }

    async fn run_locked(
        &self,
        connection: &Connection,
        input: SyncInput<'_>,
        overrides: &HashMap<ItemId, Resolution>,
        epoch: u64,
        _guard: OwnedMutexGuard<()>,
        flight: InFlight<'_>,
    ) -> SyncResult<SyncSummary> {
        let started = Instant::now();
        if *self.inner.cancel_epoch.borrow() != epoch {
            debug!("[SYNC] Sync with {} cancelled before it started", connection.device_id);
            return self
                .finish(connection, started, Err(SyncError::Cancelled), 0, flight)
                .await;
        }
        let channel = match self.channel_for(connection) {
            Ok(channel) => channel,
            Err(e) => return self.finish(connection, started, Err(e), 0, flight).await,
        };

        info!(device_id = %connection.device_id, "[SYNC] Sync with {} started", connection.device_name);
        self.report_progress(connection, 0.0, "manifest");

        let mut sent = 0;
        let result = tokio::select! {
            biased;
            _ = cancelled(self.inner.cancel_epoch.subscribe(), epoch) => Err(SyncError::Cancelled),
            result = self.pipeline(connection, &channel, input, overrides, &mut sent) => result,
        };

        if result.is_err() {
            self.drop_connection(connection).await;
        }
        self.finish(connection, started, result, sent, flight).await
    }

    async fn pipeline(
        &self,
        connection: &Connection,
        channel: &Arc<dyn TransferChannel>,
        input: SyncInput<'_>,
        overrides: &HashMap<ItemId, Resolution>,
        sent: &mut usize,
    ) -> SyncResult<SyncSummary> {
        let config = &self.inner.config;
        let local_id = &config.local_device.device_id;
        let remote_id = &connection.device_id;

        let exchanged;
        let (local, remote) = match input {
            SyncInput::Manifests(local, remote) => (local, remote),
            SyncInput::Exchange => {
                exchanged = self.swap_manifests(connection, channel).await?;
                (&exchanged.0, &exchanged.1)
            }
        };
        if &remote.device_id != remote_id {
            return Err(SyncError::TransferFailed(format!(
                "manifest belongs to {}, not {}",
                remote.device_id, remote_id
            )));
        }

        // ── Plan
        let plan = ManifestDiffEngine::with_workers(config.diff_workers).plan(local, remote);
        debug!(
            "[SYNC] Plan with {}: push {}, pull {}, up to date {}, conflicts {}",
            remote_id,
            plan.to_push.len(),
            plan.to_pull.len(),
            plan.up_to_date.len(),
            plan.conflicts.len()
        );
        let local_payloads = self.local_payloads().await?;
        let conflicts: Vec<Conflict> = plan
            .conflicts
            .iter()
            .cloned()
            .map(|pair| {
                let local_payload = local_payloads.get(pair.item_id()).cloned();
                Conflict::new(pair, local_id.clone(), remote_id.clone())
                    .with_payloads(local_payload, None)
            })
            .collect();

        let strategy = config.conflict_strategy;
        if strategy == ConflictResolutionStrategy::Manual {
            let pending = ConflictResolver::apply_overrides(
                &conflicts,
                ConflictResolver::resolve(&conflicts, strategy),
                overrides,
            );
            let unresolved = ConflictResolver::unresolved(&conflicts, &pending);
            if !unresolved.is_empty() {
                return Err(self
                    .abort(channel, unresolved_error(&unresolved))
                    .await);
            }
        }
        self.report_progress(connection, 0.25, "planning");

        // ── Transfer
        let outgoing_payloads: Vec<SyncPayload> = plan
            .to_push
            .iter()
            .chain(conflicts.iter().map(Conflict::item_id))
            .filter_map(|id| {
                let payload = local_payloads.get(id).cloned();
                if payload.is_none() {
                    warn!("[SYNC] {} vanished from the local store during sync", id);
                }
                payload
            })
            .collect();
        let outgoing = SyncData::from_payloads(local_id.clone(), Timestamp::now(), outgoing_payloads);
        let outgoing_count = outgoing.item_count();

        let transfer_timeout = config.transfer_timeout;
        let incoming = if connection.role.sends_first() {
            self.send(channel, TransferMessage::Data(outgoing)).await?;
            *sent = outgoing_count;
            self.report_progress(connection, 0.5, "receiving");
            self.receive_data(channel, transfer_timeout).await?
        } else {
            let incoming = self.receive_data(channel, transfer_timeout).await?;
            self.report_progress(connection, 0.5, "sending");
            self.send(channel, TransferMessage::Data(outgoing)).await?;
            *sent = outgoing_count;
            incoming
        };
        self.report_progress(connection, 0.75, "applying");

        if !incoming.verify_checksum() {
            return Err(self
                .abort(channel, SyncError::TransferFailed("sync data checksum mismatch".into()))
                .await);
        }
        if &incoming.metadata.device_id != remote_id {
            return Err(self
                .abort(
                    channel,
                    SyncError::TransferFailed(format!(
                        "data from {} on the connection to {}",
                        incoming.metadata.device_id, remote_id
                    )),
                )
                .await);
        }

        // ── Resolve and apply
        let mut remote_payloads: HashMap<ItemId, SyncPayload> = incoming
            .payloads()
            .into_iter()
            .map(|p| (p.item_id(), p))
            .collect();

        let mut to_apply: Vec<SyncPayload> = Vec::new();
        for id in &plan.to_pull {
            match remote_payloads.remove(id) {
                Some(payload) => to_apply.push(payload),
                None => warn!("[SYNC] Peer {} did not send {}", remote_id, id),
            }
        }

        let conflicts: Vec<Conflict> = conflicts
            .into_iter()
            .map(|mut c| {
                c.remote_payload = remote_payloads.get(c.item_id()).cloned();
                c
            })
            .collect();
        let resolutions = ConflictResolver::apply_overrides(
            &conflicts,
            ConflictResolver::resolve(&conflicts, strategy),
            overrides,
        );
        let unresolved = ConflictResolver::unresolved(&conflicts, &resolutions);
        if !unresolved.is_empty() {
            return Err(self.abort(channel, unresolved_error(&unresolved)).await);
        }
        for (conflict, resolution) in conflicts.iter().zip(resolutions) {
            match resolution {
                Resolution::KeepLocal | Resolution::NeedsManualInput => {}
                Resolution::KeepRemote => match &conflict.remote_payload {
                    Some(payload) => to_apply.push(payload.clone()),
                    None => warn!("[SYNC] Peer {} did not send {}", remote_id, conflict.item_id()),
                },
                Resolution::Merged(payload) => to_apply.push(payload),
            }
        }

        let batch = SyncData::from_payloads(remote_id.clone(), Timestamp::now(), to_apply);
        let applied = match self.apply_batch(&batch).await {
            Ok(applied) => applied,
            Err(e) => return Err(self.abort(channel, e).await),
        };
        self.report_progress(connection, 1.0, "finishing");

        // ── Acknowledge
        let ack = DataAckMessage {
            received_count: incoming.item_count(),
            applied_count: applied,
        };
        let peer_ack = if connection.role.sends_first() {
            self.send(channel, TransferMessage::DataAck(ack)).await?;
            self.receive_ack(channel, transfer_timeout).await?
        } else {
            let peer_ack = self.receive_ack(channel, transfer_timeout).await?;
            self.send(channel, TransferMessage::DataAck(ack)).await?;
            peer_ack
        };
        if peer_ack.received_count != outgoing_count {
            warn!(
                "[SYNC] Peer {} acknowledged {} of {} items",
                remote_id, peer_ack.received_count, outgoing_count
            );
        }

        Ok(SyncSummary {
            device_id: remote_id.clone(),
            duration: Duration::ZERO,
            items_transferred: outgoing_count + applied,
            items_sent: outgoing_count,
            items_received: applied,
            conflicts: conflicts.len(),
        })
    }

    async fn receive_data(
        &self,
        channel: &Arc<dyn TransferChannel>,
        timeout: Duration,
    ) -> SyncResult<SyncData> {
        match self.receive(channel, timeout, "data").await? {
            TransferMessage::Data(data) => Ok(data),
            other => Err(SyncError::TransferFailed(format!(
                "expected Data, got {}",
                other.kind()
            ))),
        }
    }

    async fn receive_ack(
        &self,
        channel: &Arc<dyn TransferChannel>,
        timeout: Duration,
    ) -> SyncResult<DataAckMessage> {
        match self.receive(channel, timeout, "acknowledgement").await? {
            TransferMessage::DataAck(ack) => Ok(ack),
            other => Err(SyncError::TransferFailed(format!(
                "expected DataAck, got {}",
                other.kind()
            ))),
        }
    }

    /// Records the outcome, publishes the terminal status, then settles.
    async fn finish(
        &self,
        connection: &Connection,
        started: Instant,
        result: SyncResult<SyncSummary>,
        sent: usize,
        flight: InFlight<'_>,
    ) -> SyncResult<SyncSummary> {
        let duration = started.elapsed();
        let now = Timestamp::now();
        let result = result.map(|summary| SyncSummary { duration, ..summary });

        let (status, items, error_message) = match &result {
            Ok(summary) => {
                info!(
                    device_id = %connection.device_id,
                    "[SYNC] Sync with {} completed: {} sent, {} received in {:?}",
                    connection.device_name, summary.items_sent, summary.items_received, duration
                );
                if let Err(e) = self.record_success(&connection.remote, now).await {
                    warn!("[SYNC] Failed to record sync metadata: {}", e);
                }
                self.inner.status.publish(SyncStatus::Completed {
                    device_name: connection.device_name.clone(),
                    items_synced: summary.items_transferred,
                    duration,
                });
                (SyncLogStatus::Completed, summary.items_transferred, None)
            }
            Err(e) => {
                if e.is_cancelled() {
                    info!(device_id = %connection.device_id, "[SYNC] Sync with {} cancelled", connection.device_name);
                } else {
                    warn!(device_id = %connection.device_id, "[SYNC] Sync with {} failed: {}", connection.device_name, e);
                }
                self.inner.status.publish(SyncStatus::Failed {
                    device_name: Some(connection.device_name.clone()),
                    error: e.clone(),
                });
                let status = if e.is_cancelled() {
                    SyncLogStatus::Cancelled
                } else {
                    SyncLogStatus::Failed
                };
                (status, sent, Some(e.to_string()))
            }
        };

        let entry = SyncLogEntry {
            sync_id: Uuid::new_v4(),
            device_id: connection.device_id.clone(),
            status,
            items_synced: items,
            duration_ms: duration.as_millis() as u64,
            error_message,
            timestamp: now,
        };
        if let Err(e) = self.inner.store.insert_sync_log(entry).await {
            warn!("[SYNC] Failed to write sync log: {}", e);
        }

        drop(flight);
        self.settle();
        result
    }

    async fn record_success(&self, remote: &DeviceInfo, at: Timestamp) -> SyncResult<()> {
        self.upsert_metadata(&remote.device_id, Some(remote), at)
            .await?;
        let store = &self.inner.store;
        if let Some(mut trusted) = store.get_trusted_device(&remote.device_id).await? {
            trusted.mark_synced(at);
            store.add_trusted_device(trusted).await?;
        }
        Ok(())
    }

    /// Cancels running and queued syncs. A no-op when nothing is in flight.
    pub fn cancel_sync(&self) {
        if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
            debug!("[SYNC] cancel_sync with nothing in flight");
            return;
        }
        info!("[SYNC] Cancelling in-flight syncs");
        self.inner.cancel_epoch.send_modify(|epoch| *epoch += 1);
    }

    /// Whether any sync is running or queued.
    pub fn is_syncing(&self) -> bool {
        self.inner.in_flight.load(Ordering::SeqCst) > 0
    }

    // ── Status ──────────────────────────────────────────────────────

    pub fn observe_sync_status(&self) -> Subscription<SyncStatus> {
        self.inner.status.subscribe()
    }

    pub fn current_status(&self) -> SyncStatus {
        self.inner.status.current()
    }

    fn report_progress(&self, connection: &Connection, progress: f32, item: &str) {
        self.inner.status.publish(SyncStatus::syncing(
            connection.device_name.clone(),
            progress,
            Some(item.to_string()),
        ));
    }

    /// Returns to `Discovering` or `Idle` once no sync is in flight.
    fn settle(&self) {
        if self.inner.in_flight.load(Ordering::SeqCst) > 0 {
            return;
        }
        let resting = if self.is_discovering() {
            SyncStatus::Discovering
        } else {
            SyncStatus::Idle
        };
        self.inner.status.publish(resting);
    }

    // ── Store access ────────────────────────────────────────────────

    pub async fn get_books_to_sync(&self) -> SyncResult<Vec<BookSyncData>> {
        self.inner.store.get_books().await
    }

    pub async fn get_reading_progress(&self) -> SyncResult<Vec<ReadingProgressData>> {
        self.inner.store.get_reading_progress().await
    }

    pub async fn get_bookmarks(&self) -> SyncResult<Vec<BookmarkData>> {
        self.inner.store.get_bookmarks().await
    }

    /// Applies `data` atomically after checking its checksum and free space.
    pub async fn apply_sync(&self, data: &SyncData) -> SyncResult<usize> {
        if !data.verify_checksum() {
            return Err(SyncError::TransferFailed("sync data checksum mismatch".into()));
        }
        self.apply_batch(data).await
    }

    async fn apply_batch(&self, data: &SyncData) -> SyncResult<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        if let Some(available) = self.inner.store.available_space().await? {
            let required = data.estimated_size();
            if required > available {
                return Err(SyncError::InsufficientStorage {
                    required,
                    available,
                });
            }
        }
        self.inner.store.apply_sync(data).await
    }

    /// Saves reading progress after the debounce window. Repeated calls for
    /// the same book within the window collapse into one write of the
    /// latest value.
    pub fn update_reading_progress(&self, progress: ReadingProgressData) {
        let store = Arc::clone(&self.inner.store);
        let key = progress.book_id.clone();
        self.inner.progress_debouncer.schedule(key, async move {
            if let Err(e) = store.save_reading_progress(&progress).await {
                warn!("[SYNC] Failed to save reading progress for {}: {}", progress.book_id, e);
            }
        });
    }

    pub async fn get_last_sync_time(&self, device_id: &DeviceId) -> SyncResult<Option<Timestamp>> {
        Ok(self
            .inner
            .store
            .get_sync_metadata(device_id)
            .await?
            .map(|m| m.last_sync_time))
    }

    /// Records a sync time. An older timestamp never replaces a newer one.
    pub async fn update_last_sync_time(&self, device_id: &DeviceId, at: Timestamp) -> SyncResult<()> {
        self.upsert_metadata(device_id, None, at).await
    }

    async fn upsert_metadata(
        &self,
        device_id: &DeviceId,
        device: Option<&DeviceInfo>,
        at: Timestamp,
    ) -> SyncResult<()> {
        let metadata_lock = device_lock(&self.inner.metadata_locks, device_id);
        let _guard = metadata_lock.lock().await;

        let store = &self.inner.store;
        let now = Timestamp::now();
        let mut record = match store.get_sync_metadata(device_id).await? {
            Some(record) => record,
            None => SyncMetadataRecord {
                device_id: device_id.clone(),
                device_name: device_id.to_string(),
                device_type: Default::default(),
                last_sync_time: Timestamp::EPOCH,
                created_at: now,
                updated_at: now,
            },
        };

        let newer = at > record.last_sync_time;
        if let Some(device) = device {
            record.device_name = device.device_name.clone();
            record.device_type = device.device_type;
        } else if !newer {
            debug!("[SYNC] Ignoring stale sync time {} for {}", at, device_id);
            return Ok(());
        }
        if newer {
            record.last_sync_time = at;
        }
        record.updated_at = now;
        store.upsert_sync_metadata(record).await
    }

    // ── Trust and diagnostics ───────────────────────────────────────

    pub async fn trust_device(&self, device: &DeviceInfo) -> SyncResult<()> {
        info!("[SYNC] Trusting {} ({})", device.device_name, device.device_id);
        self.inner
            .store
            .add_trusted_device(TrustedDevice::from_device(device, Timestamp::now()))
            .await
    }

    pub async fn untrust_device(&self, device_id: &DeviceId) -> SyncResult<bool> {
        info!("[SYNC] Removing trust for {}", device_id);
        self.inner.store.remove_trusted_device(device_id).await
    }

    pub async fn trusted_devices(&self) -> SyncResult<Vec<TrustedDevice>> {
        self.inner.store.get_trusted_devices().await
    }

    pub async fn sync_logs(&self, device_id: &DeviceId) -> SyncResult<Vec<SyncLogEntry>> {
        self.inner.store.get_sync_logs(device_id).await
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Starts the periodic background sync with every discovered device.
    pub fn start_auto_sync(&self) -> AutoSyncHandle {
        let handle = autosync::spawn(self.clone(), self.inner.config.auto_sync_interval);
        let mut loops = lock(&self.inner.auto_sync);
        loops.retain(|stop| stop.strong_count() > 0);
        loops.push(handle.stop_signal());
        handle
    }

    /// Stops auto-sync and discovery, cancels syncs and closes every
    /// connection. Pending progress writes still land.
    pub async fn shutdown(&self) -> SyncResult<()> {
        info!("[SYNC] Coordinator shutting down");
        let loops: Vec<_> = lock(&self.inner.auto_sync).drain(..).collect();
        for stop in loops.iter().filter_map(Weak::upgrade) {
            stop.send_replace(true);
        }
        self.cancel_sync();
        let stopped = self.stop_discovery().await;

        let entries: Vec<ConnectionEntry> = lock(&self.inner.connections)
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        lock(&self.inner.current).take();
        for entry in entries {
            let _ = entry.channel.disconnect().await;
        }
        self.settle();
        stopped
    }

    // ── Channel helpers ─────────────────────────────────────────────

    /// Sends with retries while the channel stays usable. When the send
    /// fails for good, a pending `Error` from the peer explains why.
    async fn send(&self, channel: &Arc<dyn TransferChannel>, message: TransferMessage) -> SyncResult<()> {
        let kind = message.kind();
        let sent = retry_if(
            &self.inner.config.retry,
            kind,
            |e| e.is_transient() && channel.is_connected(),
            || {
                let channel = Arc::clone(channel);
                let message = message.clone();
                async move { channel.send(message).await }
            },
        )
        .await;
        match sent {
            Ok(()) => Ok(()),
            Err(e) => match peer_abort_reason(channel).await {
                Some(reason) => Err(reason),
                None => Err(e),
            },
        }
    }

    async fn receive(
        &self,
        channel: &Arc<dyn TransferChannel>,
        timeout: Duration,
        what: &str,
    ) -> SyncResult<TransferMessage> {
        let message = tokio::time::timeout(timeout, channel.receive())
            .await
            .map_err(|_| SyncError::TransferFailed(format!("timed out waiting for {what}")))??;
        match message {
            TransferMessage::Error(e) => {
                warn!("[SYNC] Peer aborted: {}", e.message);
                Err(e.into_error())
            }
            other => Ok(other),
        }
    }

    /// Tells the peer why this side is giving up, then returns the error.
    ///
    /// The channel stays open until the peer hangs up or aborts too, so the
    /// reason is read before the connection drops.
    async fn abort(&self, channel: &Arc<dyn TransferChannel>, error: SyncError) -> SyncError {
        if channel
            .send(TransferMessage::Error(ErrorMessage::from_error(&error)))
            .await
            .is_err()
        {
            return error;
        }
        let drained = tokio::time::timeout(ABORT_LINGER, async {
            loop {
                match channel.receive().await {
                    Ok(TransferMessage::Error(_)) | Err(_) => break,
                    Ok(other) => debug!("[SYNC] Discarding {} after abort", other.kind()),
                }
            }
        })
        .await;
        if drained.is_err() {
            debug!("[SYNC] Peer kept the channel open after abort");
        }
        error
    }
}

/// Reads the peer's abort reason if one is already waiting.
async fn peer_abort_reason(channel: &Arc<dyn TransferChannel>) -> Option<SyncError> {
    match tokio::time::timeout(ABORT_PEEK, channel.receive()).await {
        Ok(Ok(TransferMessage::Error(e))) => {
            warn!("[SYNC] Peer aborted: {}", e.message);
            Some(e.into_error())
        }
        _ => None,
    }
}

fn unresolved_error(ids: &[ItemId]) -> SyncError {
    let listed: Vec<&str> = ids.iter().map(ItemId::as_str).collect();
    SyncError::ConflictResolutionFailed(format!(
        "{} conflict(s) need manual resolution: {}",
        ids.len(),
        listed.join(", ")
    ))
}
