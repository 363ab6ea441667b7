//! Point-in-time clones of the penciller.
//!
//! A snapshot owns a detached copy of the manifest (its entries keep the
//! underlying readers alive through their shared handles) plus a frozen
//! view of the L0 cache. Writes and compactions in the parent are
//! invisible to it; the parent's pending-delete protocol keeps every file
//! the snapshot can see on disk until the registration is released or
//! lapses.

use anyhow::{bail, Result};
use keycodec::{endkey_passed, magic_hash, EndKey, Key, KeyHash, Record, Value};
use sst::SstPointer;
use std::time::Duration;

use crate::cache::{merge_batches_in_range, LevelZeroCache, PushedBatch};
use crate::manifest::{Manifest, MAX_LEVELS};
use crate::reader::{fetch_from_levels, KeyFolder};
use crate::PencillerError;

/// How a snapshot materializes the L0 cache at registration.
#[derive(Debug, Clone)]
pub enum SnapshotMode {
    /// Full clone of cache and hash index. Serves point and range reads.
    Full,
    /// Batches without the hash index. Range reads only; cheaper to take
    /// when the holder will only iterate.
    NoLookup,
    /// The cache is merge-intersected with `[start, end]` up front and
    /// only the resulting run is kept. Range reads only.
    Range { start: Key, end: EndKey },
}

pub(crate) enum CacheView {
    Indexed(LevelZeroCache),
    Batches(Vec<PushedBatch>),
    Tree(Vec<Record>),
}

/// A registered clone. Dropping it does not release the registration;
/// call [`Penciller::release_snapshot`](crate::Penciller::release_snapshot)
/// with [`holder_id`](PencillerSnapshot::holder_id), or let the deadline
/// lapse.
pub struct PencillerSnapshot {
    holder: u64,
    observed_sqn: u64,
    manifest: Manifest,
    view: CacheView,
    slow_fetch: Duration,
}

impl PencillerSnapshot {
    pub(crate) fn new(
        holder: u64,
        observed_sqn: u64,
        manifest: Manifest,
        view: CacheView,
        slow_fetch: Duration,
    ) -> Self {
        Self {
            holder,
            observed_sqn,
            manifest,
            view,
            slow_fetch,
        }
    }

    /// The registration id to release against the parent.
    #[must_use]
    pub fn holder_id(&self) -> u64 {
        self.holder
    }

    /// The manifest generation this snapshot observes.
    #[must_use]
    pub fn observed_sqn(&self) -> u64 {
        self.observed_sqn
    }

    /// Point lookup against the frozen view.
    pub fn fetch(&self, key: &[u8]) -> Result<Option<Value>> {
        self.fetch_with_hash(key, magic_hash(key))
    }

    /// Point lookup with a precomputed hash. Only a [`SnapshotMode::Full`]
    /// clone carries the index a point lookup needs.
    pub fn fetch_with_hash(&self, key: &[u8], hash: KeyHash) -> Result<Option<Value>> {
        let Some(h) = hash.lookup() else {
            bail!(PencillerError::KeyNotHashable);
        };
        let cache = match &self.view {
            CacheView::Indexed(cache) => cache,
            CacheView::Batches(_) | CacheView::Tree(_) => {
                bail!(PencillerError::RangeOnlySnapshot)
            }
        };
        if let Some(value) = cache.lookup(key, h) {
            return Ok(Some(value.clone()));
        }
        fetch_from_levels(&self.manifest, key, hash, self.slow_fetch)
    }

    /// `true` when the frozen view's record for `key` has SQN ≤ `sqn`.
    /// A missing key is `false`: a newer tombstone may have erased it.
    pub fn check_sqn(&self, key: &[u8], sqn: u64) -> Result<bool> {
        Ok(self.fetch(key)?.map_or(false, |v| v.sqn <= sqn))
    }

    /// Folds the dominant records of `[start, end]` into `acc`.
    ///
    /// Tombstones are passed to `f` like live records; most callers skip
    /// them. `max = None` is unbounded.
    pub fn fetch_keys<Acc, F>(
        &self,
        start: &[u8],
        end: &EndKey,
        acc: Acc,
        f: F,
        max: Option<usize>,
    ) -> Result<Acc>
    where
        F: FnMut(Acc, Record) -> Acc,
    {
        let imm: Vec<Record> = match &self.view {
            CacheView::Indexed(cache) => cache.merged_in_range(start, end),
            CacheView::Batches(batches) => merge_batches_in_range(batches, start, end),
            CacheView::Tree(records) => records
                .iter()
                .filter(|(k, _)| k.as_slice() >= start && !endkey_passed(end, k))
                .cloned()
                .collect(),
        };

        let mut level_pointers = Vec::with_capacity(MAX_LEVELS);
        for level in 0..MAX_LEVELS {
            let pointers = self
                .manifest
                .range_lookup(level, start, end)
                .into_iter()
                .map(|e| SstPointer::new(e.owner, start, end))
                .collect();
            level_pointers.push(pointers);
        }

        let mut folder = KeyFolder::new(imm, level_pointers, end.clone());
        folder.fold(acc, f, max)
    }

    /// The first dominant record at or after `start` within the bound.
    pub fn fetch_next_key(&self, start: &[u8], end: &EndKey) -> Result<Option<Record>> {
        self.fetch_keys(start, end, None, |_, record| Some(record), Some(1))
    }
}

impl std::fmt::Debug for PencillerSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match self.view {
            CacheView::Indexed(_) => "full",
            CacheView::Batches(_) => "no-lookup",
            CacheView::Tree(_) => "range",
        };
        f.debug_struct("PencillerSnapshot")
            .field("holder", &self.holder)
            .field("observed_sqn", &self.observed_sqn)
            .field("mode", &mode)
            .finish()
    }
}
