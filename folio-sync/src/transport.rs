//! Transport layer abstraction.
//!
//! The coordinator never touches sockets or discovery protocols directly.
//! It consumes two collaborators:
//! - [`DiscoveryTransport`] announces this device and reports peers
//! - [`TransferChannel`] moves messages once two peers are addressed
//!
//! A [`ChannelProvider`] hands out one fresh channel per connection so
//! connections to different devices never share state.

use crate::error::SyncResult;
use crate::protocol::TransferMessage;
use crate::role::Role;
use async_trait::async_trait;
use folio_types::{DeviceId, DeviceInfo};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// A change in the set of reachable peers.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    /// A peer announced itself (first time or again).
    Announced(DeviceInfo),
    /// A peer withdrew its announcement.
    Lost(DeviceId),
}

/// LAN broadcast and listen.
#[async_trait]
pub trait DiscoveryTransport: Send + Sync {
    /// Starts announcing `local` on the network.
    async fn start_broadcasting(&self, local: &DeviceInfo) -> SyncResult<()>;

    /// Stops announcing.
    async fn stop_broadcasting(&self) -> SyncResult<()>;

    /// Starts listening. Events arrive on the returned receiver until
    /// [`DiscoveryTransport::stop_discovery`] is called.
    async fn start_discovery(&self) -> SyncResult<mpsc::Receiver<DiscoveryEvent>>;

    /// Stops listening and closes the event receiver.
    async fn stop_discovery(&self) -> SyncResult<()>;
}

/// Point-to-point message pipe to one peer.
#[async_trait]
pub trait TransferChannel: Send + Sync {
    /// Opens the pipe. A `Server` waits for the peer; a `Client` dials it.
    async fn connect(&self, remote: &DeviceInfo, role: Role) -> SyncResult<()>;

    async fn send(&self, message: TransferMessage) -> SyncResult<()>;

    /// Waits for the next message from the peer.
    async fn receive(&self) -> SyncResult<TransferMessage>;

    /// Fraction of the message currently being sent, 0.0 to 1.0.
    fn progress(&self) -> watch::Receiver<f32>;

    async fn disconnect(&self) -> SyncResult<()>;

    fn is_connected(&self) -> bool;
}

/// Creates transfer channels.
pub trait ChannelProvider: Send + Sync {
    fn open_channel(&self, remote: &DeviceInfo) -> Arc<dyn TransferChannel>;
}

/// In-process transports for testing.
pub mod mock {
    use super::*;
    use crate::error::SyncError;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Mutex, MutexGuard};
    use std::time::Duration;

    fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
        m.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Discovery ───────────────────────────────────────────────────

    #[derive(Default)]
    struct DiscoveryState {
        broadcasting: Option<DeviceInfo>,
        listener: Option<mpsc::Sender<DiscoveryEvent>>,
        start_count: usize,
        fail_next_start: Option<SyncError>,
    }

    /// Discovery driven by the test: peers appear when the test announces them.
    #[derive(Clone, Default)]
    pub struct MockDiscovery {
        state: Arc<Mutex<DiscoveryState>>,
    }

    impl MockDiscovery {
        pub fn new() -> Self {
            Self::default()
        }

        /// Delivers an announcement to the active listener, if any.
        pub fn announce(&self, device: DeviceInfo) -> bool {
            self.emit(DiscoveryEvent::Announced(device))
        }

        /// Delivers a withdrawal to the active listener, if any.
        pub fn lose(&self, device_id: DeviceId) -> bool {
            self.emit(DiscoveryEvent::Lost(device_id))
        }

        fn emit(&self, event: DiscoveryEvent) -> bool {
            let state = lock(&self.state);
            match &state.listener {
                Some(tx) => tx.try_send(event).is_ok(),
                None => false,
            }
        }

        /// The device currently being broadcast.
        pub fn broadcasting(&self) -> Option<DeviceInfo> {
            lock(&self.state).broadcasting.clone()
        }

        pub fn is_listening(&self) -> bool {
            lock(&self.state)
                .listener
                .as_ref()
                .is_some_and(|tx| !tx.is_closed())
        }

        /// How many times discovery was started.
        pub fn start_count(&self) -> usize {
            lock(&self.state).start_count
        }

        /// Makes the next `start_discovery` fail with `error`.
        pub fn fail_next_start(&self, error: SyncError) {
            lock(&self.state).fail_next_start = Some(error);
        }
    }

    #[async_trait]
    impl DiscoveryTransport for MockDiscovery {
        async fn start_broadcasting(&self, local: &DeviceInfo) -> SyncResult<()> {
            lock(&self.state).broadcasting = Some(local.clone());
            Ok(())
        }

        async fn stop_broadcasting(&self) -> SyncResult<()> {
            lock(&self.state).broadcasting = None;
            Ok(())
        }

        async fn start_discovery(&self) -> SyncResult<mpsc::Receiver<DiscoveryEvent>> {
            let mut state = lock(&self.state);
            if let Some(error) = state.fail_next_start.take() {
                return Err(error);
            }
            let (tx, rx) = mpsc::channel(256);
            state.listener = Some(tx);
            state.start_count += 1;
            Ok(rx)
        }

        async fn stop_discovery(&self) -> SyncResult<()> {
            lock(&self.state).listener = None;
            Ok(())
        }
    }

    // ── Transfer ────────────────────────────────────────────────────

    type Pipe = (
        mpsc::UnboundedSender<TransferMessage>,
        mpsc::UnboundedReceiver<TransferMessage>,
    );

    /// One side's half of a rendezvous, parked until the peer connects.
    struct ParkedEnd {
        /// Device expected to pick this end up.
        for_device: DeviceId,
        /// Role the first side claimed.
        first_role: Role,
        pipe: Pipe,
    }

    #[derive(Default)]
    struct NetworkState {
        online: HashSet<DeviceId>,
        parked: HashMap<(DeviceId, DeviceId), ParkedEnd>,
        roles: HashMap<DeviceId, Vec<(DeviceId, Role)>>,
        fail_connects: usize,
        fail_sends: usize,
        send_delay: Duration,
        sent: usize,
    }

    /// In-process network joining channels by device-id pair.
    ///
    /// Each peer gets its provider from [`MockNetwork::provider`]. When two
    /// peers connect to each other, their channels are joined regardless of
    /// order. Connecting with the same role on both sides fails, the way a
    /// real pair of listeners (or dialers) would never meet.
    #[derive(Clone, Default)]
    pub struct MockNetwork {
        state: Arc<Mutex<NetworkState>>,
    }

    impl MockNetwork {
        pub fn new() -> Self {
            Self::default()
        }

        /// Brings `local` online and returns its channel provider.
        pub fn provider(&self, local: DeviceId) -> MockChannelProvider {
            lock(&self.state).online.insert(local.clone());
            MockChannelProvider {
                network: self.clone(),
                local,
            }
        }

        /// Takes a device off the network. Later connects to it fail.
        pub fn set_offline(&self, device: &DeviceId) {
            lock(&self.state).online.remove(device);
        }

        /// The next `n` connect attempts fail with `ConnectionFailed`.
        pub fn fail_next_connects(&self, n: usize) {
            lock(&self.state).fail_connects = n;
        }

        /// The next `n` sends fail with `TransferFailed`.
        pub fn fail_next_sends(&self, n: usize) {
            lock(&self.state).fail_sends = n;
        }

        /// Delays every send by `delay`.
        pub fn set_send_delay(&self, delay: Duration) {
            lock(&self.state).send_delay = delay;
        }

        /// Messages delivered so far.
        pub fn sent_count(&self) -> usize {
            lock(&self.state).sent
        }

        /// Roles `device` connected with, per peer, in order.
        pub fn roles_of(&self, device: &DeviceId) -> Vec<(DeviceId, Role)> {
            lock(&self.state).roles.get(device).cloned().unwrap_or_default()
        }

        fn rendezvous(&self, local: &DeviceId, remote: &DeviceId, role: Role) -> SyncResult<Pipe> {
            let mut state = lock(&self.state);
            if state.fail_connects > 0 {
                state.fail_connects -= 1;
                return Err(SyncError::ConnectionFailed("injected connect failure".into()));
            }
            if !state.online.contains(remote) {
                return Err(SyncError::ConnectionFailed(format!("{remote} is unreachable")));
            }

            let key = if local < remote {
                (local.clone(), remote.clone())
            } else {
                (remote.clone(), local.clone())
            };

            let pipe = match state.parked.remove(&key) {
                Some(parked) if &parked.for_device == local => {
                    if parked.first_role == role {
                        return Err(SyncError::ConnectionFailed(format!(
                            "both peers connected as {role}"
                        )));
                    }
                    parked.pipe
                }
                // Nobody waiting, or our own stale end: start a fresh rendezvous.
                _ => {
                    let (a_tx, a_rx) = mpsc::unbounded_channel();
                    let (b_tx, b_rx) = mpsc::unbounded_channel();
                    state.parked.insert(
                        key,
                        ParkedEnd {
                            for_device: remote.clone(),
                            first_role: role,
                            pipe: (b_tx, a_rx),
                        },
                    );
                    (a_tx, b_rx)
                }
            };

            state
                .roles
                .entry(local.clone())
                .or_default()
                .push((remote.clone(), role));
            Ok(pipe)
        }

        /// Applies send-side failure injection. Returns the delay to wait.
        fn before_send(&self) -> SyncResult<Duration> {
            let mut state = lock(&self.state);
            if state.fail_sends > 0 {
                state.fail_sends -= 1;
                return Err(SyncError::TransferFailed("injected send failure".into()));
            }
            Ok(state.send_delay)
        }

        fn record_sent(&self) {
            lock(&self.state).sent += 1;
        }
    }

    /// Provider bound to one device on a [`MockNetwork`].
    #[derive(Clone)]
    pub struct MockChannelProvider {
        network: MockNetwork,
        local: DeviceId,
    }

    impl ChannelProvider for MockChannelProvider {
        fn open_channel(&self, _remote: &DeviceInfo) -> Arc<dyn TransferChannel> {
            Arc::new(MockChannel::new(self.network.clone(), self.local.clone()))
        }
    }

    /// One side of an in-process connection.
    pub struct MockChannel {
        network: MockNetwork,
        local: DeviceId,
        tx: Mutex<Option<mpsc::UnboundedSender<TransferMessage>>>,
        rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<TransferMessage>>>,
        connected: AtomicBool,
        closed: watch::Sender<bool>,
        progress: watch::Sender<f32>,
    }

    impl MockChannel {
        pub fn new(network: MockNetwork, local: DeviceId) -> Self {
            let (progress, _) = watch::channel(0.0);
            let (closed, _) = watch::channel(false);
            Self {
                network,
                local,
                tx: Mutex::new(None),
                rx: tokio::sync::Mutex::new(None),
                connected: AtomicBool::new(false),
                closed,
                progress,
            }
        }
    }

    #[async_trait]
    impl TransferChannel for MockChannel {
        async fn connect(&self, remote: &DeviceInfo, role: Role) -> SyncResult<()> {
            let (tx, rx) = self
                .network
                .rendezvous(&self.local, &remote.device_id, role)?;
            *lock(&self.tx) = Some(tx);
            *self.rx.lock().await = Some(rx);
            self.closed.send_replace(false);
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn send(&self, message: TransferMessage) -> SyncResult<()> {
            if !self.is_connected() {
                return Err(SyncError::TransferFailed("channel not connected".into()));
            }
            let delay = self.network.before_send()?;
            self.progress.send_replace(0.0);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let sent = match lock(&self.tx).as_ref() {
                Some(tx) => tx.send(message).is_ok(),
                None => false,
            };
            if !sent {
                // The peer is gone for good; nothing can be resent.
                self.connected.store(false, Ordering::SeqCst);
                return Err(SyncError::TransferFailed("peer closed the channel".into()));
            }
            self.network.record_sent();
            self.progress.send_replace(1.0);
            Ok(())
        }

        async fn receive(&self) -> SyncResult<TransferMessage> {
            let mut closed = self.closed.subscribe();
            let mut guard = self.rx.lock().await;
            let rx = guard
                .as_mut()
                .ok_or_else(|| SyncError::TransferFailed("channel not connected".into()))?;
            tokio::select! {
                message = rx.recv() => {
                    message.ok_or_else(|| SyncError::TransferFailed("peer closed the channel".into()))
                }
                _ = closed.wait_for(|c| *c) => {
                    Err(SyncError::TransferFailed("channel disconnected".into()))
                }
            }
        }

        fn progress(&self) -> watch::Receiver<f32> {
            self.progress.subscribe()
        }

        async fn disconnect(&self) -> SyncResult<()> {
            self.connected.store(false, Ordering::SeqCst);
            lock(&self.tx).take();
            self.closed.send_replace(true);
            self.rx.lock().await.take();
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }
}
