//! Sync status state machine and its publisher.

use crate::broadcast::{ReplayBroadcast, Subscription};
use crate::error::SyncError;
use std::time::Duration;
use tracing::debug;

/// Observable state of the sync engine.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncStatus {
    Idle,
    Discovering,
    Connecting {
        device_name: String,
    },
    Syncing {
        device_name: String,
        /// 0.0 to 1.0.
        progress: f32,
        current_item: Option<String>,
    },
    Completed {
        device_name: String,
        items_synced: usize,
        duration: Duration,
    },
    Failed {
        device_name: Option<String>,
        error: SyncError,
    },
}

impl SyncStatus {
    /// Builds a `Syncing` value with progress clamped to 0.0..=1.0.
    pub fn syncing(device_name: impl Into<String>, progress: f32, current_item: Option<String>) -> Self {
        let progress = if progress.is_nan() { 0.0 } else { progress.clamp(0.0, 1.0) };
        Self::Syncing {
            device_name: device_name.into(),
            progress,
            current_item,
        }
    }

    /// `Completed` and `Failed` end a sync run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }

    /// A connection or sync is underway.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting { .. } | Self::Syncing { .. })
    }

    pub fn progress(&self) -> Option<f32> {
        match self {
            Self::Syncing { progress, .. } => Some(*progress),
            _ => None,
        }
    }
}

/// Single-writer, multi-reader status holder starting at `Idle`.
///
/// Consecutive duplicates are dropped so subscribers only see transitions.
#[derive(Clone)]
pub struct SyncStatusPublisher {
    inner: ReplayBroadcast<SyncStatus>,
}

impl Default for SyncStatusPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStatusPublisher {
    pub fn new() -> Self {
        Self {
            inner: ReplayBroadcast::new(SyncStatus::Idle),
        }
    }

    pub fn publish(&self, status: SyncStatus) {
        let published = self
            .inner
            .publish_if(|current| (current != &status).then(|| status.clone()));
        if published {
            debug!("[SYNC] Status -> {:?}", status);
        }
    }

    /// Publishes `status` only while the current value satisfies `guard`.
    pub fn publish_when(&self, guard: impl FnOnce(&SyncStatus) -> bool, status: SyncStatus) -> bool {
        self.inner
            .publish_if(|current| (guard(current) && current != &status).then(|| status.clone()))
    }

    pub fn current(&self) -> SyncStatus {
        self.inner.current()
    }

    pub fn subscribe(&self) -> Subscription<SyncStatus> {
        self.inner.subscribe()
    }
}
