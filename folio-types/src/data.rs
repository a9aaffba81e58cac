//! Sync payloads: the data a manifest item stands for.

use crate::{DeviceId, ItemId, SyncItemType, SyncManifestItem, Timestamp};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};

/// Version stamped into [`SyncMetadata`] by this build.
pub const SYNC_DATA_VERSION: u32 = 1;

/// A library entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookSyncData {
    /// Global id, stable across devices (derived from source and url).
    pub book_id: String,
    pub title: String,
    pub author: String,
    pub cover_url: Option<String>,
    pub source_id: i64,
    pub source_url: String,
    #[serde(default)]
    pub favorite: bool,
    pub added_at: Timestamp,
    pub updated_at: Timestamp,
    pub file_hash: Option<String>,
}

/// Where the reader is in a book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingProgressData {
    pub book_id: String,
    pub chapter_id: String,
    pub chapter_index: u32,
    /// Scroll or page offset within the chapter.
    pub offset: u32,
    /// Fraction of the book read, 0.0 to 1.0.
    #[serde(deserialize_with = "fraction_or_zero")]
    pub progress: f32,
    pub last_read_at: Timestamp,
}

impl ReadingProgressData {
    /// Orders positions within a book: chapter first, then offset.
    #[must_use]
    pub fn position(&self) -> (u32, u32) {
        (self.chapter_index, self.offset)
    }

    /// Clamps `progress` into 0.0..=1.0. NaN becomes 0.0, since JSON has no
    /// way to store it.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.progress = if self.progress.is_nan() {
            0.0
        } else {
            self.progress.clamp(0.0, 1.0)
        };
        self
    }
}

/// A non-finite progress was written out as `null`; read it back as 0.0.
fn fraction_or_zero<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f32, D::Error> {
    Ok(Option::<f32>::deserialize(deserializer)?.unwrap_or(0.0))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookmarkData {
    pub bookmark_id: String,
    pub book_id: String,
    pub chapter_id: String,
    pub position: u32,
    pub note: Option<String>,
    pub created_at: Timestamp,
}

/// One item's data, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncPayload {
    Book(BookSyncData),
    Progress(ReadingProgressData),
    Bookmark(BookmarkData),
}

impl SyncPayload {
    #[must_use]
    pub fn item_id(&self) -> ItemId {
        match self {
            Self::Book(b) => ItemId::book(&b.book_id),
            Self::Progress(p) => ItemId::progress(&p.book_id),
            Self::Bookmark(b) => ItemId::bookmark(&b.bookmark_id),
        }
    }

    #[must_use]
    pub fn item_type(&self) -> SyncItemType {
        match self {
            Self::Book(_) => SyncItemType::Book,
            Self::Progress(_) => SyncItemType::Progress,
            Self::Bookmark(_) => SyncItemType::Bookmark,
        }
    }

    #[must_use]
    pub fn last_modified(&self) -> Timestamp {
        match self {
            Self::Book(b) => b.updated_at,
            Self::Progress(p) => p.last_read_at,
            Self::Bookmark(b) => b.created_at,
        }
    }

    /// SHA-256 of the payload's JSON form, hex encoded.
    #[must_use]
    pub fn content_hash(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }

    /// The manifest entry describing this payload.
    #[must_use]
    pub fn manifest_item(&self) -> SyncManifestItem {
        SyncManifestItem::new(
            self.item_id(),
            self.item_type(),
            self.content_hash(),
            self.last_modified(),
        )
    }
}

/// Header of a [`SyncData`] batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetadata {
    pub device_id: DeviceId,
    pub timestamp: Timestamp,
    pub version: u32,
    /// SHA-256 over the three payload lists.
    pub checksum: String,
}

/// A batch of payloads applied atomically by the receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncData {
    pub books: Vec<BookSyncData>,
    pub reading_progress: Vec<ReadingProgressData>,
    pub bookmarks: Vec<BookmarkData>,
    pub metadata: SyncMetadata,
}

impl SyncData {
    /// Groups payloads by kind and seals them with a checksum.
    pub fn from_payloads(
        device_id: DeviceId,
        timestamp: Timestamp,
        payloads: impl IntoIterator<Item = SyncPayload>,
    ) -> Self {
        let mut books = Vec::new();
        let mut reading_progress = Vec::new();
        let mut bookmarks = Vec::new();
        for payload in payloads {
            match payload {
                SyncPayload::Book(b) => books.push(b),
                SyncPayload::Progress(p) => reading_progress.push(p),
                SyncPayload::Bookmark(b) => bookmarks.push(b),
            }
        }

        let checksum = checksum_of(&books, &reading_progress, &bookmarks);
        Self {
            books,
            reading_progress,
            bookmarks,
            metadata: SyncMetadata {
                device_id,
                timestamp,
                version: SYNC_DATA_VERSION,
                checksum,
            },
        }
    }

    /// Whether the payload lists still match the sealed checksum.
    #[must_use]
    pub fn verify_checksum(&self) -> bool {
        checksum_of(&self.books, &self.reading_progress, &self.bookmarks) == self.metadata.checksum
    }

    /// Flattens the batch back into tagged payloads.
    #[must_use]
    pub fn payloads(&self) -> Vec<SyncPayload> {
        self.books
            .iter()
            .cloned()
            .map(SyncPayload::Book)
            .chain(self.reading_progress.iter().cloned().map(SyncPayload::Progress))
            .chain(self.bookmarks.iter().cloned().map(SyncPayload::Bookmark))
            .collect()
    }

    #[must_use]
    pub fn item_count(&self) -> usize {
        self.books.len() + self.reading_progress.len() + self.bookmarks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.item_count() == 0
    }

    /// Serialized size in bytes, used for the free-space check before applying.
    #[must_use]
    pub fn estimated_size(&self) -> u64 {
        serde_json::to_vec(self).map(|v| v.len() as u64).unwrap_or(0)
    }
}

fn checksum_of(
    books: &[BookSyncData],
    progress: &[ReadingProgressData],
    bookmarks: &[BookmarkData],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(books).unwrap_or_default());
    hasher.update(serde_json::to_vec(progress).unwrap_or_default());
    hasher.update(serde_json::to_vec(bookmarks).unwrap_or_default());
    hex::encode(hasher.finalize())
}
