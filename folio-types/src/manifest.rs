//! Manifests: one device's snapshot of what it can sync.

use crate::{DeviceId, Error, ItemId, Result, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Kind of a syncable item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncItemType {
    Book,
    Progress,
    Bookmark,
}

impl fmt::Display for SyncItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Book => "book",
            Self::Progress => "progress",
            Self::Bookmark => "bookmark",
        };
        f.write_str(s)
    }
}

/// One entry in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncManifestItem {
    pub item_id: ItemId,
    pub item_type: SyncItemType,
    /// Content fingerprint. Equal hashes mean equal content.
    pub hash: String,
    pub last_modified: Timestamp,
}

impl SyncManifestItem {
    pub fn new(
        item_id: ItemId,
        item_type: SyncItemType,
        hash: impl Into<String>,
        last_modified: Timestamp,
    ) -> Self {
        Self {
            item_id,
            item_type,
            hash: hash.into(),
            last_modified,
        }
    }
}

/// Snapshot of every syncable item on one device.
///
/// Item ids are unique within a manifest. Item order carries no meaning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncManifest {
    pub device_id: DeviceId,
    pub timestamp: Timestamp,
    items: Vec<SyncManifestItem>,
}

impl SyncManifest {
    /// Builds a manifest, rejecting duplicate item ids.
    pub fn new(
        device_id: DeviceId,
        timestamp: Timestamp,
        items: Vec<SyncManifestItem>,
    ) -> Result<Self> {
        let manifest = Self {
            device_id,
            timestamp,
            items,
        };
        manifest.validate()?;
        Ok(manifest)
    }

    /// An empty manifest for `device_id`.
    pub fn empty(device_id: DeviceId, timestamp: Timestamp) -> Self {
        Self {
            device_id,
            timestamp,
            items: Vec::new(),
        }
    }

    /// Checks item-id uniqueness. Manifests decoded off the wire bypass
    /// [`SyncManifest::new`], so receivers call this explicitly.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::with_capacity(self.items.len());
        for item in &self.items {
            if !seen.insert(&item.item_id) {
                return Err(Error::DuplicateItem(item.item_id.clone()));
            }
        }
        Ok(())
    }

    pub fn items(&self) -> &[SyncManifestItem] {
        &self.items
    }

    pub fn item_ids(&self) -> impl Iterator<Item = &ItemId> {
        self.items.iter().map(|i| &i.item_id)
    }

    /// Looks an item up by id. Linear; use [`SyncManifest::index`] for bulk lookups.
    pub fn get(&self, item_id: &ItemId) -> Option<&SyncManifestItem> {
        self.items.iter().find(|i| &i.item_id == item_id)
    }

    /// Id-keyed view over the items.
    pub fn index(&self) -> HashMap<&ItemId, &SyncManifestItem> {
        self.items.iter().map(|i| (&i.item_id, i)).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
