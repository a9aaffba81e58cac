//! In-memory [`LocalDataStore`] with JSON snapshots.
//!
//! Applies build the new state on a copy and swap it in, so a failed apply
//! leaves the store exactly as it was.

use super::{LocalDataStore, SyncLogEntry, SyncMetadataRecord, TrustedDevice};
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use folio_types::{
    BookSyncData, BookmarkData, DeviceId, ReadingProgressData, SyncData, SyncPayload,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::RwLock;

/// Everything the store holds. Also the on-disk snapshot format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LibrarySnapshot {
    pub books: BTreeMap<String, BookSyncData>,
    pub reading_progress: BTreeMap<String, ReadingProgressData>,
    pub bookmarks: BTreeMap<String, BookmarkData>,
    pub trusted_devices: BTreeMap<DeviceId, TrustedDevice>,
    pub sync_metadata: BTreeMap<DeviceId, SyncMetadataRecord>,
    pub sync_logs: Vec<SyncLogEntry>,
}

impl LibrarySnapshot {
    pub fn with_books(mut self, books: impl IntoIterator<Item = BookSyncData>) -> Self {
        for b in books {
            self.books.insert(b.book_id.clone(), b);
        }
        self
    }

    pub fn with_progress(mut self, progress: impl IntoIterator<Item = ReadingProgressData>) -> Self {
        for p in progress {
            self.reading_progress.insert(p.book_id.clone(), p.normalized());
        }
        self
    }

    pub fn with_bookmarks(mut self, bookmarks: impl IntoIterator<Item = BookmarkData>) -> Self {
        for b in bookmarks {
            self.bookmarks.insert(b.bookmark_id.clone(), b);
        }
        self
    }
}

#[derive(Debug, Default)]
struct Faults {
    fail_next_apply_after: Option<usize>,
    fail_reads: bool,
    available_space: Option<u64>,
}

/// A [`LocalDataStore`] kept in memory.
#[derive(Debug, Default)]
pub struct MemoryDataStore {
    state: RwLock<LibrarySnapshot>,
    faults: Mutex<Faults>,
    progress_writes: AtomicUsize,
    applies: AtomicUsize,
}

impl MemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: LibrarySnapshot) -> Self {
        Self {
            state: RwLock::new(snapshot),
            ..Self::default()
        }
    }

    /// Loads a snapshot. Missing fields default, but the document itself
    /// must be a JSON object.
    pub fn from_json(json: &str) -> SyncResult<Self> {
        let invalid = |e: serde_json::Error| SyncError::Storage(format!("invalid library snapshot: {e}"));
        let value: serde_json::Value = serde_json::from_str(json).map_err(invalid)?;
        if !value.is_object() {
            return Err(SyncError::Storage(
                "invalid library snapshot: expected a JSON object".into(),
            ));
        }
        let snapshot: LibrarySnapshot = serde_json::from_value(value).map_err(invalid)?;
        Ok(Self::from_snapshot(snapshot))
    }

    pub async fn snapshot(&self) -> LibrarySnapshot {
        self.state.read().await.clone()
    }

    pub async fn to_json(&self) -> SyncResult<String> {
        serde_json::to_string_pretty(&*self.state.read().await)
            .map_err(|e| SyncError::Storage(format!("cannot encode library snapshot: {e}")))
    }

    fn faults(&self) -> MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The next apply writes `after` items to its working copy, then fails.
    pub fn fail_next_apply_after(&self, after: usize) {
        self.faults().fail_next_apply_after = Some(after);
    }

    /// Every library read fails while set.
    pub fn set_fail_reads(&self, fail: bool) {
        self.faults().fail_reads = fail;
    }

    pub fn set_available_space(&self, bytes: Option<u64>) {
        self.faults().available_space = bytes;
    }

    /// Calls to `save_reading_progress` so far.
    pub fn progress_write_count(&self) -> usize {
        self.progress_writes.load(Ordering::SeqCst)
    }

    /// Successful `apply_sync` calls so far.
    pub fn apply_count(&self) -> usize {
        self.applies.load(Ordering::SeqCst)
    }

    fn check_reads(&self) -> SyncResult<()> {
        if self.faults().fail_reads {
            return Err(SyncError::Storage("library unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl LocalDataStore for MemoryDataStore {
    async fn get_books(&self) -> SyncResult<Vec<BookSyncData>> {
        self.check_reads()?;
        Ok(self.state.read().await.books.values().cloned().collect())
    }

    async fn get_reading_progress(&self) -> SyncResult<Vec<ReadingProgressData>> {
        self.check_reads()?;
        Ok(self
            .state
            .read()
            .await
            .reading_progress
            .values()
            .cloned()
            .collect())
    }

    async fn get_bookmarks(&self) -> SyncResult<Vec<BookmarkData>> {
        self.check_reads()?;
        Ok(self.state.read().await.bookmarks.values().cloned().collect())
    }

    async fn apply_sync(&self, data: &SyncData) -> SyncResult<usize> {
        if !data.verify_checksum() {
            return Err(SyncError::TransferFailed(
                "sync data checksum mismatch".into(),
            ));
        }
        let (fail_after, available_space) = {
            let mut faults = self.faults();
            (faults.fail_next_apply_after.take(), faults.available_space)
        };
        if let Some(available) = available_space {
            let required = data.estimated_size();
            if required > available {
                return Err(SyncError::InsufficientStorage { required, available });
            }
        }

        let mut state = self.state.write().await;
        let mut next = state.clone();
        let mut written = 0;
        for payload in data.payloads() {
            if fail_after == Some(written) {
                return Err(SyncError::Storage(format!("write failed after {written} items")));
            }
            match payload {
                SyncPayload::Book(b) => {
                    next.books.insert(b.book_id.clone(), b);
                }
                SyncPayload::Progress(p) => {
                    next.reading_progress.insert(p.book_id.clone(), p.normalized());
                }
                SyncPayload::Bookmark(b) => {
                    next.bookmarks.insert(b.bookmark_id.clone(), b);
                }
            }
            written += 1;
        }
        if fail_after.is_some() {
            return Err(SyncError::Storage(format!("write failed after {written} items")));
        }

        *state = next;
        self.applies.fetch_add(1, Ordering::SeqCst);
        Ok(written)
    }

    async fn save_reading_progress(&self, progress: &ReadingProgressData) -> SyncResult<()> {
        self.state
            .write()
            .await
            .reading_progress
            .insert(progress.book_id.clone(), progress.clone().normalized());
        self.progress_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn available_space(&self) -> SyncResult<Option<u64>> {
        Ok(self.faults().available_space)
    }

    async fn get_trusted_devices(&self) -> SyncResult<Vec<TrustedDevice>> {
        Ok(self
            .state
            .read()
            .await
            .trusted_devices
            .values()
            .cloned()
            .collect())
    }

    async fn add_trusted_device(&self, device: TrustedDevice) -> SyncResult<()> {
        self.state
            .write()
            .await
            .trusted_devices
            .insert(device.device_id.clone(), device);
        Ok(())
    }

    async fn remove_trusted_device(&self, device_id: &DeviceId) -> SyncResult<bool> {
        Ok(self
            .state
            .write()
            .await
            .trusted_devices
            .remove(device_id)
            .is_some())
    }

    async fn get_trusted_device(&self, device_id: &DeviceId) -> SyncResult<Option<TrustedDevice>> {
        Ok(self.state.read().await.trusted_devices.get(device_id).cloned())
    }

    async fn get_sync_metadata(&self, device_id: &DeviceId) -> SyncResult<Option<SyncMetadataRecord>> {
        Ok(self.state.read().await.sync_metadata.get(device_id).cloned())
    }

    async fn upsert_sync_metadata(&self, record: SyncMetadataRecord) -> SyncResult<()> {
        self.state
            .write()
            .await
            .sync_metadata
            .insert(record.device_id.clone(), record);
        Ok(())
    }

    async fn insert_sync_log(&self, entry: SyncLogEntry) -> SyncResult<()> {
        self.state.write().await.sync_logs.push(entry);
        Ok(())
    }

    async fn get_sync_logs(&self, device_id: &DeviceId) -> SyncResult<Vec<SyncLogEntry>> {
        Ok(self
            .state
            .read()
            .await
            .sync_logs
            .iter()
            .filter(|e| &e.device_id == device_id)
            .cloned()
            .collect())
    }
}
