//! Core type definitions for folio LAN sync.
//!
//! This crate defines the plain data exchanged between two reading-app
//! installations during a sync:
//! - Device and item identifiers
//! - Millisecond timestamps
//! - Device descriptions as announced on the LAN
//! - Manifests (what each side has) and payloads (the data itself)
//!
//! Nothing here performs I/O; the sync engine lives in `folio-sync`.

mod data;
mod device;
mod ids;
mod manifest;
mod timestamp;

pub use data::{
    BookSyncData, BookmarkData, ReadingProgressData, SYNC_DATA_VERSION, SyncData, SyncMetadata,
    SyncPayload,
};
pub use device::{AppVersion, DeviceInfo, DeviceType, DiscoveredDevice};
pub use ids::{DeviceId, ItemId};
pub use manifest::{SyncItemType, SyncManifest, SyncManifestItem};
pub use timestamp::Timestamp;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("duplicate manifest item: {0}")]
    DuplicateItem(ItemId),

    #[error("invalid version string: {0}")]
    InvalidVersion(String),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
}
