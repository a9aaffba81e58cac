//! Conflict resolution.
//!
//! Both peers resolve the same conflicts independently, each from its own
//! point of view. Every rule here is symmetric: swapping local and remote
//! swaps `KeepLocal` and `KeepRemote` and leaves a `Merged` payload
//! unchanged, so the two sides converge without another round trip.

use crate::diff::ConflictPair;
use folio_types::{
    BookSyncData, DeviceId, ItemId, ReadingProgressData, SyncManifestItem, SyncPayload,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// How conflicting edits are settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictResolutionStrategy {
    /// Later `last_modified` wins; exact ties go to the smaller origin device id.
    #[default]
    LatestTimestamp,
    LocalWins,
    RemoteWins,
    /// Type-specific merge, falling back to `LatestTimestamp`.
    Merge,
    /// Every conflict waits for the user.
    Manual,
}

impl fmt::Display for ConflictResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::LatestTimestamp => "latest",
            Self::LocalWins => "local",
            Self::RemoteWins => "remote",
            Self::Merge => "merge",
            Self::Manual => "manual",
        };
        f.write_str(s)
    }
}

impl FromStr for ConflictResolutionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "latest" | "latest_timestamp" => Ok(Self::LatestTimestamp),
            "local" | "local_wins" => Ok(Self::LocalWins),
            "remote" | "remote_wins" => Ok(Self::RemoteWins),
            "merge" => Ok(Self::Merge),
            "manual" => Ok(Self::Manual),
            other => Err(format!("unknown conflict strategy: {other}")),
        }
    }
}

/// Outcome for one conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    KeepLocal,
    KeepRemote,
    Merged(SyncPayload),
    NeedsManualInput,
}

impl Resolution {
    pub fn is_manual(&self) -> bool {
        matches!(self, Self::NeedsManualInput)
    }
}

/// A conflict with everything a strategy may look at.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    pub local: SyncManifestItem,
    pub remote: SyncManifestItem,
    /// Device the local version came from.
    pub local_device: DeviceId,
    /// Device the remote version came from.
    pub remote_device: DeviceId,
    /// Needed by `Merge`; without it the merge falls back to timestamps.
    pub local_payload: Option<SyncPayload>,
    pub remote_payload: Option<SyncPayload>,
}

impl Conflict {
    pub fn new(pair: ConflictPair, local_device: DeviceId, remote_device: DeviceId) -> Self {
        Self {
            local: pair.local,
            remote: pair.remote,
            local_device,
            remote_device,
            local_payload: None,
            remote_payload: None,
        }
    }

    pub fn with_payloads(
        mut self,
        local: Option<SyncPayload>,
        remote: Option<SyncPayload>,
    ) -> Self {
        self.local_payload = local;
        self.remote_payload = remote;
        self
    }

    pub fn item_id(&self) -> &ItemId {
        &self.local.item_id
    }
}

/// Stateless resolver.
pub struct ConflictResolver;

impl ConflictResolver {
    /// Resolves each conflict independently. Output is index-aligned with input.
    pub fn resolve(conflicts: &[Conflict], strategy: ConflictResolutionStrategy) -> Vec<Resolution> {
        conflicts
            .iter()
            .map(|c| Self::resolve_one(c, strategy))
            .collect()
    }

    pub fn resolve_one(conflict: &Conflict, strategy: ConflictResolutionStrategy) -> Resolution {
        match strategy {
            ConflictResolutionStrategy::LatestTimestamp => latest_timestamp(conflict),
            ConflictResolutionStrategy::LocalWins => Resolution::KeepLocal,
            ConflictResolutionStrategy::RemoteWins => Resolution::KeepRemote,
            ConflictResolutionStrategy::Merge => merge(conflict),
            ConflictResolutionStrategy::Manual => Resolution::NeedsManualInput,
        }
    }

    /// Replaces resolutions with caller-supplied ones, keyed by item id.
    pub fn apply_overrides(
        conflicts: &[Conflict],
        resolutions: Vec<Resolution>,
        overrides: &HashMap<ItemId, Resolution>,
    ) -> Vec<Resolution> {
        conflicts
            .iter()
            .zip(resolutions)
            .map(|(c, r)| overrides.get(c.item_id()).cloned().unwrap_or(r))
            .collect()
    }

    /// Ids whose resolution is still `NeedsManualInput`.
    pub fn unresolved(conflicts: &[Conflict], resolutions: &[Resolution]) -> Vec<ItemId> {
        conflicts
            .iter()
            .zip(resolutions)
            .filter(|(_, r)| r.is_manual())
            .map(|(c, _)| c.item_id().clone())
            .collect()
    }
}

/// Whether the local side wins a plain timestamp comparison.
fn local_is_newer(c: &Conflict) -> bool {
    match c.local.last_modified.cmp(&c.remote.last_modified) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => match c.local_device.cmp(&c.remote_device) {
            Ordering::Less => true,
            Ordering::Greater => false,
            // Same origin device on both sides; settle on the content hash.
            Ordering::Equal => c.local.hash <= c.remote.hash,
        },
    }
}

fn latest_timestamp(c: &Conflict) -> Resolution {
    if local_is_newer(c) {
        Resolution::KeepLocal
    } else {
        Resolution::KeepRemote
    }
}

fn merge(c: &Conflict) -> Resolution {
    let merged = match (&c.local_payload, &c.remote_payload) {
        (Some(SyncPayload::Progress(l)), Some(SyncPayload::Progress(r))) => {
            SyncPayload::Progress(merge_progress(l, r, local_is_newer(c)))
        }
        (Some(SyncPayload::Book(l)), Some(SyncPayload::Book(r))) => {
            SyncPayload::Book(merge_book(l, r, local_is_newer(c)))
        }
        _ => return latest_timestamp(c),
    };

    if c.local_payload.as_ref() == Some(&merged) {
        Resolution::KeepLocal
    } else if c.remote_payload.as_ref() == Some(&merged) {
        Resolution::KeepRemote
    } else {
        Resolution::Merged(merged)
    }
}

/// Furthest position wins; the read time is the later of the two.
fn merge_progress(
    local: &ReadingProgressData,
    remote: &ReadingProgressData,
    local_is_newer: bool,
) -> ReadingProgressData {
    let local_ahead = match local.position().cmp(&remote.position()) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => local_is_newer,
    };
    let mut merged = if local_ahead { local.clone() } else { remote.clone() };
    merged.last_read_at = local.last_read_at.max(remote.last_read_at);
    merged
}

/// Newer metadata, earliest `added_at`, favorite if either side set it.
fn merge_book(local: &BookSyncData, remote: &BookSyncData, local_is_newer: bool) -> BookSyncData {
    let mut merged = if local_is_newer { local.clone() } else { remote.clone() };
    merged.added_at = local.added_at.min(remote.added_at);
    merged.favorite = local.favorite || remote.favorite;
    merged.updated_at = local.updated_at.max(remote.updated_at);
    merged
}
