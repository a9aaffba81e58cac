//! Peer-to-peer LAN sync engine for folio.
//!
//! Two devices on the same network find each other, agree on who drives the
//! exchange, compare manifests of their libraries, settle conflicting edits
//! and move the missing items in both directions.
//!
//! # Architecture
//!
//! Everything that decides is pure and synchronous: the manifest diff, the
//! conflict resolver and role negotiation. Everything that talks is behind a
//! trait: the discovery transport, the transfer channel and the local data
//! store. The [`SyncCoordinator`] is the only component that sequences I/O.
//!
//! ## Components
//!
//! - **Discovery**: announces this device and keeps the live set of peers
//! - **Role**: deterministic SERVER/CLIENT split from the two device ids
//! - **Diff**: classifies every item as push, pull, up to date or conflict
//! - **Conflict**: applies the configured resolution strategy
//! - **Protocol / Codec**: length-prefixed JSON frames over a channel
//! - **Status**: replaying stream of the engine's observable state
//! - **Coordinator**: connects, exchanges, resolves, transfers and records
//!
//! ## Sync Process
//!
//! 1. **Discovery**: peers announce themselves; stale ones expire
//! 2. **Handshake**: versions and trust are checked before any data moves
//! 3. **Manifest exchange**: the CLIENT sends first, then the SERVER
//! 4. **Plan**: diff the manifests and resolve conflicts
//! 5. **Transfer**: each side sends what the other lacks, then applies
//!    what it received in one atomic batch
//!
//! # Example
//!
//! ```no_run
//! use folio_sync::{
//!     CoordinatorConfig, MemoryDataStore, SyncCoordinator, TcpChannelProvider, DEFAULT_PORT,
//!     transport::mock::MockDiscovery,
//! };
//! use folio_types::{DeviceInfo, DeviceType};
//! use std::sync::Arc;
//!
//! # async fn run() -> folio_sync::SyncResult<()> {
//! let local = DeviceInfo::new(
//!     "laptop".parse().unwrap(),
//!     "My Laptop",
//!     DeviceType::Desktop,
//!     "1.4.0",
//!     "192.168.1.20".parse().unwrap(),
//!     DEFAULT_PORT,
//! );
//! let coordinator = SyncCoordinator::new(
//!     CoordinatorConfig::new(local),
//!     Arc::new(MemoryDataStore::new()),
//!     Arc::new(MockDiscovery::new()),
//!     Arc::new(TcpChannelProvider::new(([0, 0, 0, 0], DEFAULT_PORT).into())),
//! );
//! coordinator.start_discovery().await?;
//! # Ok(())
//! # }
//! ```

mod autosync;
pub mod broadcast;
pub mod codec;
pub mod config;
pub mod conflict;
mod coordinator;
pub mod debounce;
pub mod diff;
pub mod discovery;
mod error;
pub mod protocol;
mod retry;
pub mod role;
pub mod status;
pub mod store;
pub mod tcp;
pub mod transport;
pub mod trust;

pub use autosync::AutoSyncHandle;
pub use broadcast::{ReplayBroadcast, Subscription};
pub use config::{CoordinatorConfig, RetryConfig};
pub use conflict::{Conflict, ConflictResolutionStrategy, ConflictResolver, Resolution};
pub use coordinator::{Connection, SyncCoordinator, SyncSummary};
pub use diff::{ConflictPair, ManifestDiffEngine, TransferPlan};
pub use discovery::DeviceRegistry;
pub use error::{RetryClass, SyncError, SyncResult};
pub use protocol::{
    DataAckMessage, ErrorMessage, HelloAckMessage, HelloMessage, PROTOCOL_VERSION,
    TransferMessage,
};
pub use retry::{retry_if, retry_with_backoff};
pub use role::{Role, RoleNegotiator};
pub use status::{SyncStatus, SyncStatusPublisher};
pub use store::memory::{LibrarySnapshot, MemoryDataStore};
pub use store::{
    LocalDataStore, SyncLogEntry, SyncLogStatus, SyncMetadataRecord, TrustedDevice,
};
pub use tcp::{DEFAULT_PORT, TcpChannel, TcpChannelProvider};
pub use transport::{ChannelProvider, DiscoveryEvent, DiscoveryTransport, TransferChannel};
pub use trust::{AllowAllTrust, TrustPolicy, TrustedDevicesOnly};
