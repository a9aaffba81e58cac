//! Local persistence consumed by the sync core.
//!
//! The app's real database implements [`LocalDataStore`]; the core only
//! needs the library reads, an all-or-nothing apply, and the small amount
//! of sync bookkeeping below.

pub mod memory;

use crate::error::SyncResult;
use async_trait::async_trait;
use folio_types::{
    BookSyncData, BookmarkData, DeviceId, DeviceInfo, DeviceType, ReadingProgressData, SyncData,
    Timestamp,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A peer the user paired with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustedDevice {
    pub device_id: DeviceId,
    pub device_name: String,
    pub paired_at: Timestamp,
    /// When we last completed a sync with this peer.
    pub last_synced: Option<Timestamp>,
}

impl TrustedDevice {
    pub fn from_device(device: &DeviceInfo, paired_at: Timestamp) -> Self {
        Self {
            device_id: device.device_id.clone(),
            device_name: device.device_name.clone(),
            paired_at,
            last_synced: None,
        }
    }

    pub fn mark_synced(&mut self, at: Timestamp) {
        self.last_synced = Some(at);
    }
}

/// Per-peer sync bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetadataRecord {
    pub device_id: DeviceId,
    pub device_name: String,
    pub device_type: DeviceType,
    pub last_sync_time: Timestamp,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncLogStatus {
    Completed,
    Failed,
    Cancelled,
}

/// One row of the append-only sync log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLogEntry {
    pub sync_id: Uuid,
    pub device_id: DeviceId,
    pub status: SyncLogStatus,
    pub items_synced: usize,
    pub duration_ms: u64,
    pub error_message: Option<String>,
    pub timestamp: Timestamp,
}

/// Storage the sync core reads from and writes to.
#[async_trait]
pub trait LocalDataStore: Send + Sync {
    async fn get_books(&self) -> SyncResult<Vec<BookSyncData>>;

    async fn get_reading_progress(&self) -> SyncResult<Vec<ReadingProgressData>>;

    async fn get_bookmarks(&self) -> SyncResult<Vec<BookmarkData>>;

    /// Writes every payload in `data` or none of them. Returns the number of
    /// items written.
    async fn apply_sync(&self, data: &SyncData) -> SyncResult<usize>;

    async fn save_reading_progress(&self, progress: &ReadingProgressData) -> SyncResult<()>;

    /// Free bytes for incoming data, if the store can tell.
    async fn available_space(&self) -> SyncResult<Option<u64>> {
        Ok(None)
    }

    // ── Trusted devices ─────────────────────────────────────────────

    async fn get_trusted_devices(&self) -> SyncResult<Vec<TrustedDevice>>;

    /// Inserts or replaces by device id.
    async fn add_trusted_device(&self, device: TrustedDevice) -> SyncResult<()>;

    /// Returns whether a device was removed.
    async fn remove_trusted_device(&self, device_id: &DeviceId) -> SyncResult<bool>;

    async fn get_trusted_device(&self, device_id: &DeviceId) -> SyncResult<Option<TrustedDevice>> {
        Ok(self
            .get_trusted_devices()
            .await?
            .into_iter()
            .find(|d| &d.device_id == device_id))
    }

    // ── Sync metadata and log ───────────────────────────────────────

    async fn get_sync_metadata(&self, device_id: &DeviceId) -> SyncResult<Option<SyncMetadataRecord>>;

    async fn upsert_sync_metadata(&self, record: SyncMetadataRecord) -> SyncResult<()>;

    async fn insert_sync_log(&self, entry: SyncLogEntry) -> SyncResult<()>;

    /// Log entries for one device, oldest first.
    async fn get_sync_logs(&self, device_id: &DeviceId) -> SyncResult<Vec<SyncLogEntry>>;
}
