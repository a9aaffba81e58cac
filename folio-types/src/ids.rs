//! Identifier types used throughout folio sync.
//!
//! Device ids are opaque strings chosen by each installation. Item ids are
//! composite strings that stay unique across both peers' domains.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stable identifier of one app installation.
///
/// Ordering is lexicographic on the underlying string. Role negotiation and
/// conflict tie-breaks both rely on this ordering being identical on every
/// peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Creates a device ID, rejecting empty or whitespace-only input.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidId("device id must not be empty".into()));
        }
        if trimmed.len() == id.len() {
            Ok(Self(id))
        } else {
            Ok(Self(trimmed.to_string()))
        }
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DeviceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl AsRef<str> for DeviceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identifier of one syncable item, unique across both peers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    /// Creates an item ID from a raw composite string.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(Error::InvalidId("item id must not be empty".into()));
        }
        Ok(Self(id))
    }

    /// Item id of a library book, keyed by its global (source + url) id.
    #[must_use]
    pub fn book(book_id: &str) -> Self {
        Self(format!("book:{book_id}"))
    }

    /// Item id of the reading position for a book. One per book.
    #[must_use]
    pub fn progress(book_id: &str) -> Self {
        Self(format!("progress:{book_id}"))
    }

    /// Item id of a single bookmark.
    #[must_use]
    pub fn bookmark(bookmark_id: &str) -> Self {
        Self(format!("bookmark:{bookmark_id}"))
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ItemId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}
