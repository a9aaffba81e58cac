//! Manifest diffing.
//!
//! Classifies every item id in the union of two manifests into exactly one
//! of four buckets. The classification of one id never depends on another,
//! so large manifests are split into id-hash buckets and diffed on scoped
//! threads; the merged result is sorted and therefore independent of the
//! worker count.

use folio_types::{ItemId, SyncManifest, SyncManifestItem};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};

/// Manifests whose combined item count is below this are always diffed on
/// the calling thread. Shared ids count once per side.
pub const PARALLEL_THRESHOLD: usize = 2048;

/// An item present on both sides with different content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictPair {
    pub local: SyncManifestItem,
    pub remote: SyncManifestItem,
}

impl ConflictPair {
    pub fn item_id(&self) -> &ItemId {
        &self.local.item_id
    }
}

/// What has to move in each direction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransferPlan {
    /// Only the local side has these.
    pub to_push: Vec<ItemId>,
    /// Only the remote side has these.
    pub to_pull: Vec<ItemId>,
    /// Same hash on both sides.
    pub up_to_date: Vec<ItemId>,
    /// Different hash on both sides.
    pub conflicts: Vec<ConflictPair>,
}

impl TransferPlan {
    /// Number of distinct ids the plan classifies.
    pub fn total(&self) -> usize {
        self.to_push.len() + self.to_pull.len() + self.up_to_date.len() + self.conflicts.len()
    }

    /// Nothing to move and nothing to resolve.
    pub fn is_noop(&self) -> bool {
        self.to_push.is_empty() && self.to_pull.is_empty() && self.conflicts.is_empty()
    }

    fn merge(&mut self, other: TransferPlan) {
        self.to_push.extend(other.to_push);
        self.to_pull.extend(other.to_pull);
        self.up_to_date.extend(other.up_to_date);
        self.conflicts.extend(other.conflicts);
    }

    fn sort(&mut self) {
        self.to_push.sort();
        self.to_pull.sort();
        self.up_to_date.sort();
        self.conflicts
            .sort_by(|a, b| a.local.item_id.cmp(&b.local.item_id));
    }
}

/// Pure manifest comparison.
#[derive(Debug, Clone, Copy)]
pub struct ManifestDiffEngine {
    workers: usize,
    threshold: usize,
}

impl Default for ManifestDiffEngine {
    fn default() -> Self {
        Self::with_workers(1)
    }
}

impl ManifestDiffEngine {
    pub fn with_workers(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            threshold: PARALLEL_THRESHOLD,
        }
    }

    /// Overrides the combined item count at which [`ManifestDiffEngine::plan`]
    /// goes parallel.
    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    /// Whether [`ManifestDiffEngine::plan`] splits this pair across workers:
    /// more than one worker and `local.len() + remote.len()` at or above the
    /// threshold.
    pub fn runs_parallel(&self, local: &SyncManifest, remote: &SyncManifest) -> bool {
        self.workers > 1 && local.len() + remote.len() >= self.threshold
    }

    /// Diffs in parallel or sequentially, per [`ManifestDiffEngine::runs_parallel`].
    pub fn plan(&self, local: &SyncManifest, remote: &SyncManifest) -> TransferPlan {
        if self.runs_parallel(local, remote) {
            Self::diff_parallel(local, remote, self.workers)
        } else {
            Self::diff(local, remote)
        }
    }

    /// Sequential diff. Every bucket is sorted by item id.
    pub fn diff(local: &SyncManifest, remote: &SyncManifest) -> TransferPlan {
        let remote_index = remote.index();
        let local_items: Vec<&SyncManifestItem> = local.items().iter().collect();
        let remote_only: Vec<&SyncManifestItem> = {
            let local_index = local.index();
            remote
                .items()
                .iter()
                .filter(|r| !local_index.contains_key(&r.item_id))
                .collect()
        };

        let mut plan = classify(&local_items, &remote_index, &remote_only);
        plan.sort();
        plan
    }

    /// Diff split across `workers` scoped threads by a hash of the item id.
    ///
    /// Produces exactly the same plan as [`ManifestDiffEngine::diff`].
    pub fn diff_parallel(
        local: &SyncManifest,
        remote: &SyncManifest,
        workers: usize,
    ) -> TransferPlan {
        let workers = workers.max(1);
        if workers == 1 {
            return Self::diff(local, remote);
        }

        let local_index = local.index();
        let remote_index = remote.index();

        let mut local_buckets: Vec<Vec<&SyncManifestItem>> = vec![Vec::new(); workers];
        for item in local.items() {
            local_buckets[bucket_of(&item.item_id, workers)].push(item);
        }
        let mut remote_only_buckets: Vec<Vec<&SyncManifestItem>> = vec![Vec::new(); workers];
        for item in remote.items() {
            if !local_index.contains_key(&item.item_id) {
                remote_only_buckets[bucket_of(&item.item_id, workers)].push(item);
            }
        }

        let remote_index = &remote_index;
        let partials: Vec<TransferPlan> = std::thread::scope(|scope| {
            let handles: Vec<_> = local_buckets
                .iter()
                .zip(remote_only_buckets.iter())
                .map(|(locals, remotes)| {
                    scope.spawn(move || classify(locals, remote_index, remotes))
                })
                .collect();

            handles
                .into_iter()
                .map(|h| match h.join() {
                    Ok(plan) => plan,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect()
        });

        let mut plan = TransferPlan::default();
        for partial in partials {
            plan.merge(partial);
        }
        plan.sort();
        plan
    }
}

/// Classifies one slice of the id space.
fn classify(
    locals: &[&SyncManifestItem],
    remote_index: &HashMap<&ItemId, &SyncManifestItem>,
    remote_only: &[&SyncManifestItem],
) -> TransferPlan {
    let mut plan = TransferPlan::default();
    for local in locals {
        match remote_index.get(&local.item_id) {
            None => plan.to_push.push(local.item_id.clone()),
            Some(remote) if remote.hash == local.hash => {
                plan.up_to_date.push(local.item_id.clone())
            }
            Some(remote) => plan.conflicts.push(ConflictPair {
                local: (*local).clone(),
                remote: (*remote).clone(),
            }),
        }
    }
    plan.to_pull
        .extend(remote_only.iter().map(|r| r.item_id.clone()));
    plan
}

fn bucket_of(id: &ItemId, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    id.hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}

/// Every id the two manifests mention, sorted.
pub fn union_ids(local: &SyncManifest, remote: &SyncManifest) -> BTreeSet<ItemId> {
    local
        .item_ids()
        .chain(remote.item_ids())
        .cloned()
        .collect()
}
