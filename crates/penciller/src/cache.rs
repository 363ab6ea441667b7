//! Level-zero cache: the staging area for pushed batches.
//!
//! Each accepted push lands as one immutable batch (an ordered tree shared
//! behind an `Arc`); a merged 256-bucket hash-position index lets point
//! lookups skip batches that cannot hold the key. Batches live until the
//! whole cache is folded into a written level-zero file, at which point the
//! cache is cleared in one go.

use keycodec::{endkey_passed, magic_hash, EndKey, Key, KeyHash, Record, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Bucket count of the hash-position index. Bucket selection is the low
/// byte of the magic hash.
const CACHE_BUCKETS: usize = 256;

/// One pushed batch. `min_sqn`/`max_sqn` bound the SQNs inside; the tree
/// itself is immutable once pushed.
#[derive(Debug, Clone)]
pub struct PushedBatch {
    pub tree: Arc<BTreeMap<Key, Value>>,
    pub min_sqn: u64,
    pub max_sqn: u64,
}

/// The staging cache plus its hash index. Batches are stored oldest first;
/// lookups walk candidate positions newest first, so the first hit is the
/// highest-SQN record without comparing SQNs.
#[derive(Debug, Clone, Default)]
pub struct LevelZeroCache {
    batches: Vec<PushedBatch>,
    /// bucket -> (batch position, full magic hash) pairs.
    index: Vec<Vec<(u32, u32)>>,
    size: usize,
}

impl LevelZeroCache {
    pub fn new() -> Self {
        Self {
            batches: Vec::new(),
            index: vec![Vec::new(); CACHE_BUCKETS],
            size: 0,
        }
    }

    /// Appends a pushed batch, indexing every point-lookable key. Returns
    /// the batch's SQN range.
    pub fn push_batch(&mut self, tree: BTreeMap<Key, Value>) -> (u64, u64) {
        let mut min_sqn = u64::MAX;
        let mut max_sqn = 0;
        let pos = self.batches.len() as u32;
        for (key, value) in &tree {
            min_sqn = min_sqn.min(value.sqn);
            max_sqn = max_sqn.max(value.sqn);
            if let KeyHash::Lookup(h) = magic_hash(key) {
                self.index[(h & 0xFF) as usize].push((pos, h));
            }
        }
        self.size += tree.len();
        let batch = PushedBatch {
            tree: Arc::new(tree),
            min_sqn,
            max_sqn,
        };
        let bounds = (batch.min_sqn, batch.max_sqn);
        self.batches.push(batch);
        bounds
    }

    /// Point lookup through the hash index. Newest batch wins.
    pub fn lookup(&self, key: &[u8], hash: u32) -> Option<&Value> {
        let bucket = &self.index[(hash & 0xFF) as usize];
        // Positions were appended in push order, so walking backwards
        // visits newer batches first.
        for &(pos, h) in bucket.iter().rev() {
            if h != hash {
                continue;
            }
            if let Some(value) = self.batches[pos as usize].tree.get(key) {
                return Some(value);
            }
        }
        None
    }

    /// Total key count across batches (duplicates counted per batch).
    #[must_use]
    pub fn len_keys(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Borrow of the batches, oldest first.
    #[must_use]
    pub fn batches(&self) -> &[PushedBatch] {
        &self.batches
    }

    /// Shared handles to every batch tree, newest first. This is the slot
    /// order the level-zero builder pulls in.
    #[must_use]
    pub fn slots_newest_first(&self) -> Vec<Arc<BTreeMap<Key, Value>>> {
        self.batches.iter().rev().map(|b| Arc::clone(&b.tree)).collect()
    }

    /// Drops every batch and index entry. The ledger SQN lives with the
    /// penciller, not here, so clearing is safe after a flush.
    pub fn clear(&mut self) {
        self.batches.clear();
        for bucket in &mut self.index {
            bucket.clear();
        }
        self.size = 0;
    }

    /// Materializes the cache into one sorted run restricted to
    /// `[start, end]`, resolving duplicate keys to the highest SQN.
    #[must_use]
    pub fn merged_in_range(&self, start: &[u8], end: &EndKey) -> Vec<Record> {
        merge_batches_in_range(&self.batches, start, end)
    }
}

/// Merge-intersects a batch list with `[start, end]`, highest SQN winning
/// per key. Shared by the cache and by snapshot views that hold bare
/// batch lists.
pub fn merge_batches_in_range(
    batches: &[PushedBatch],
    start: &[u8],
    end: &EndKey,
) -> Vec<Record> {
    let mut merged: BTreeMap<&[u8], &Value> = BTreeMap::new();
    for batch in batches {
        for (key, value) in batch.tree.range(start.to_vec()..) {
            if endkey_passed(end, key) {
                break;
            }
            match merged.get(key.as_slice()) {
                Some(existing) if existing.sqn >= value.sqn => {}
                _ => {
                    merged.insert(key.as_slice(), value);
                }
            }
        }
    }
    merged
        .into_iter()
        .map(|(k, v)| (k.to_vec(), v.clone()))
        .collect()
}
