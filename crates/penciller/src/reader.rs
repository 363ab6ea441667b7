//! Merged read path: point lookups across cache and levels, and the
//! keyfolder that drives range folds.
//!
//! A point lookup is a first-match walk. The cache is probed through its
//! hash index (newest batch wins), then each level from L0 down; the first
//! file whose range covers the key and whose probe hits ends the walk,
//! because anything deeper can only hold lower SQNs for that key.
//!
//! A range fold is a k-way merge. The in-memory run and one stream per
//! level advance together; at each step the smallest front key is emitted
//! with its dominant record and every shadowed record for that key is
//! discarded from its stream. Level streams are lazy pointer chains that
//! fault records in a few at a time.

use anyhow::Result;
use keycodec::{endkey_passed, key_dominates, Dominance, EndKey, Key, KeyHash, Record, Value};
use sst::SstPointer;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::manifest::{Manifest, MAX_LEVELS};

/// Records resolved per pointer expansion. Faulting a few at a time
/// amortizes the block read without holding a whole file in memory.
pub const ITERATOR_SCANWIDTH: usize = 4;

/// Walks the levels for `key`, given that the cache already missed.
///
/// `hash` must be a lookup hash; the caller gates `NoLookup` before any
/// level work happens. Probes slower than `slow_fetch` are logged.
pub fn fetch_from_levels(
    manifest: &Manifest,
    key: &[u8],
    hash: KeyHash,
    slow_fetch: Duration,
) -> Result<Option<Value>> {
    for level in 0..MAX_LEVELS {
        let Some(entry) = manifest.key_lookup(level, key) else {
            continue;
        };
        let started = Instant::now();
        let found = entry.owner.get(key, hash)?;
        let elapsed = started.elapsed();
        if elapsed > slow_fetch {
            log::warn!(
                "slow fetch: {:?} probing {} at level {}",
                elapsed,
                entry.filename,
                level
            );
        }
        if let Some(value) = found {
            return Ok(Some(value));
        }
    }
    Ok(None)
}

/// One level's stream within a fold: a small resolved front plus the lazy
/// pointer chain behind it.
struct LevelStream {
    front: VecDeque<Record>,
    pointers: VecDeque<SstPointer>,
}

impl LevelStream {
    fn refill(&mut self) -> Result<()> {
        while self.front.is_empty() {
            let Some(pointer) = self.pointers.pop_front() else {
                return Ok(());
            };
            let (records, rest) = pointer.expand(ITERATOR_SCANWIDTH)?;
            self.front.extend(records);
            if let Some(p) = rest {
                self.pointers.push_front(p);
            }
        }
        Ok(())
    }
}

/// K-way merge over an in-memory run and per-level pointer streams.
///
/// Emits each key at most once, carrying the record with the highest SQN
/// present in any source at fold time; shadowed records are dropped from
/// their streams as the fold passes their key. The in-memory run wins
/// equal-SQN ties against files, and a shallower level wins them against a
/// deeper one.
pub struct KeyFolder {
    imm: VecDeque<Record>,
    levels: Vec<LevelStream>,
    end: EndKey,
}

impl KeyFolder {
    /// Builds a folder from an in-memory run (already sorted and
    /// restricted to the fold range) and one pointer list per level,
    /// shallowest level first.
    pub fn new(imm: Vec<Record>, level_pointers: Vec<Vec<SstPointer>>, end: EndKey) -> Self {
        Self {
            imm: imm.into(),
            levels: level_pointers
                .into_iter()
                .map(|pointers| LevelStream {
                    front: VecDeque::new(),
                    pointers: pointers.into(),
                })
                .collect(),
            end,
        }
    }

    /// The next dominant record in key order, `None` when the range is
    /// exhausted. Tombstones are emitted like any other record; the caller
    /// decides their meaning.
    pub fn next_record(&mut self) -> Result<Option<Record>> {
        for stream in &mut self.levels {
            stream.refill()?;
        }

        // Smallest key across the in-memory front and every level front.
        let mut min_key: Option<Key> = self.imm.front().map(|r| r.0.clone());
        for stream in &self.levels {
            if let Some(record) = stream.front.front() {
                let smaller = match &min_key {
                    Some(k) => record.0 < *k,
                    None => true,
                };
                if smaller {
                    min_key = Some(record.0.clone());
                }
            }
        }
        let Some(key) = min_key else {
            return Ok(None);
        };
        if endkey_passed(&self.end, &key) {
            return Ok(None);
        }

        // Pop the key from every source holding it. The winner starts as
        // the in-memory record (freshest source) and is challenged by each
        // level in shallow-to-deep order.
        let mut winner: Option<Record> = match self.imm.front() {
            Some(r) if r.0 == key => self.imm.pop_front(),
            _ => None,
        };
        for stream in &mut self.levels {
            let holds_key = matches!(stream.front.front(), Some(r) if r.0 == key);
            if !holds_key {
                continue;
            }
            let challenger = stream.front.pop_front().expect("front checked above");
            winner = Some(match winner {
                None => challenger,
                Some(current) => match key_dominates(&current, &challenger) {
                    Dominance::RightDominant => challenger,
                    _ => current,
                },
            });
        }

        Ok(winner)
    }

    /// Folds records into `acc` until the range, the sources, or `max`
    /// runs out. `max = None` is unbounded; `max = Some(1)` implements
    /// find-next-key.
    pub fn fold<Acc, F>(&mut self, mut acc: Acc, mut f: F, max: Option<usize>) -> Result<Acc>
    where
        F: FnMut(Acc, Record) -> Acc,
    {
        let mut emitted = 0usize;
        while let Some(record) = self.next_record()? {
            acc = f(acc, record);
            emitted += 1;
            if max.map_or(false, |m| emitted >= m) {
                break;
            }
        }
        Ok(acc)
    }
}
