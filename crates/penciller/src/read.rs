//! Public read surface: point lookups, SQN checks, range folds, and
//! snapshot registration.
//!
//! Point lookups run inside the penciller; their latency is bounded by a
//! single file probe per level. Range folds never run against live state.
//! `fetch_keys` registers a short-lived range snapshot, folds it, and
//! releases it, so a slow fold can never hold up pushes or compaction
//! adoption.

use anyhow::{bail, Result};
use keycodec::{magic_hash, EndKey, Key, KeyHash, Record, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use crate::cache::PushedBatch;
use crate::reader::fetch_from_levels;
use crate::snapshot::{CacheView, PencillerSnapshot, SnapshotMode};
use crate::{PencillerError, Penciller};

impl Penciller {
    /// Looks up the live record for `key`, hashing it first.
    pub fn fetch(&mut self, key: &[u8]) -> Result<Option<Value>> {
        self.fetch_with_hash(key, magic_hash(key))
    }

    /// Looks up the live record for `key` with a precomputed hash.
    ///
    /// Returns the highest-SQN record across cache and levels, tombstones
    /// included, or `None` when no level holds the key. A `NoLookup` hash
    /// fails with [`PencillerError::KeyNotHashable`].
    pub fn fetch_with_hash(&mut self, key: &[u8], hash: KeyHash) -> Result<Option<Value>> {
        self.pump();
        let Some(h) = hash.lookup() else {
            bail!(PencillerError::KeyNotHashable);
        };
        if let Some(value) = self.cache.lookup(key, h) {
            return Ok(Some(value.clone()));
        }
        fetch_from_levels(&self.manifest, key, hash, self.cfg.slow_fetch)
    }

    /// `true` when the live record for `key` carries SQN ≤ `sqn`.
    ///
    /// A missing key is `false`: absence may be a garbage-collected newer
    /// tombstone, so the conservative answer is that the caller's record
    /// is not current.
    pub fn check_sqn(&mut self, key: &[u8], sqn: u64) -> Result<bool> {
        Ok(self.fetch(key)?.map_or(false, |v| v.sqn <= sqn))
    }

    /// Folds the dominant records of `[start, end]` into `acc`.
    ///
    /// Runs against an internally registered range snapshot, which is
    /// released before returning. Tombstones are handed to `f` like any
    /// record. `max = None` is unbounded.
    pub fn fetch_keys<Acc, F>(
        &mut self,
        start: &[u8],
        end: &EndKey,
        acc: Acc,
        f: F,
        max: Option<usize>,
    ) -> Result<Acc>
    where
        F: FnMut(Acc, Record) -> Acc,
    {
        let snapshot = self.register_snapshot(
            SnapshotMode::Range {
                start: start.to_vec(),
                end: end.clone(),
            },
            None,
            false,
        )?;
        let result = snapshot.fetch_keys(start, end, acc, f, max);
        self.release_snapshot(snapshot.holder_id());
        result
    }

    /// The first dominant record at or after `start` within the bound.
    pub fn fetch_next_key(&mut self, start: &[u8], end: &EndKey) -> Result<Option<Record>> {
        self.fetch_keys(start, end, None, |_, record| Some(record), Some(1))
    }

    /// Registers a point-in-time clone.
    ///
    /// `overlay` is the caller's own unpushed tree; when given it is folded
    /// into the clone's view as the newest batch, so the snapshot covers
    /// data the penciller has not seen yet. The registration pins every
    /// file visible at the current generation until released or lapsed.
    pub fn register_snapshot(
        &mut self,
        mode: SnapshotMode,
        overlay: Option<BTreeMap<Key, Value>>,
        long_running: bool,
    ) -> Result<PencillerSnapshot> {
        self.pump();
        let timeout = if long_running {
            self.cfg.long_snapshot_timeout
        } else {
            self.cfg.snapshot_timeout
        };
        let holder = self.next_holder;
        self.next_holder += 1;
        self.manifest.add_snapshot(holder, Instant::now() + timeout);

        let view = match &mode {
            SnapshotMode::Full => {
                let mut cache = self.cache.clone();
                if let Some(tree) = overlay {
                    cache.push_batch(tree);
                }
                CacheView::Indexed(cache)
            }
            SnapshotMode::NoLookup => {
                let mut batches = self.cache.batches().to_vec();
                if let Some(tree) = overlay {
                    batches.push(batch_from_tree(tree));
                }
                CacheView::Batches(batches)
            }
            SnapshotMode::Range { start, end } => {
                let mut batches = self.cache.batches().to_vec();
                if let Some(tree) = overlay {
                    batches.push(batch_from_tree(tree));
                }
                CacheView::Tree(crate::cache::merge_batches_in_range(&batches, start, end))
            }
        };

        log::debug!(
            "snapshot {} registered at generation {}",
            holder,
            self.manifest.manifest_sqn()
        );
        Ok(PencillerSnapshot::new(
            holder,
            self.manifest.manifest_sqn(),
            self.manifest.detached_copy(),
            view,
            self.cfg.slow_fetch,
        ))
    }

    /// Releases a snapshot registration and sweeps any files it was the
    /// last holder pinning.
    pub fn release_snapshot(&mut self, holder: u64) {
        self.manifest.release_snapshot(holder);
        log::debug!("snapshot {} released", holder);
        self.sweep_deletes();
    }

    /// Answers a file's deletion poll: `true` removes the file, `false`
    /// means ask again later (a merge is in flight or a snapshot still
    /// pins it).
    pub fn confirm_delete(&mut self, filename: &str) -> bool {
        self.pump();
        if self.work_ongoing {
            return false;
        }
        if self.manifest.ready_to_delete(filename) {
            match sst::delete_confirmed(&self.files_dir, filename) {
                Ok(()) => log::debug!("confirmed delete of {}", filename),
                Err(e) => log::warn!("could not delete {}: {}", filename, e),
            }
            true
        } else {
            false
        }
    }
}

fn batch_from_tree(tree: BTreeMap<Key, Value>) -> PushedBatch {
    let min_sqn = tree.values().map(|v| v.sqn).min().unwrap_or(u64::MAX);
    let max_sqn = tree.values().map(|v| v.sqn).max().unwrap_or(0);
    PushedBatch {
        tree: Arc::new(tree),
        min_sqn,
        max_sqn,
    }
}
