//! Admission and the level-zero flush state machine.
//!
//! A push is admitted unless a flush is in flight or compaction has a
//! backlog; both refusals are flow control, not errors, and the bookie
//! holds the batch and retries. After admission the cache size is checked
//! against the configured threshold and, when everything lines up (no
//! resident level-zero file, no compaction ongoing, jitter willing), a
//! background level-zero build is started over the frozen batches.

use anyhow::{bail, Result};
use keycodec::{Key, Value};
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::mpsc::channel;
use std::sync::Arc;

use crate::manifest::level_zero_filename;
use crate::{PencillerError, PendingL0, Penciller};

/// Outcome of a push. `Returned` asks the caller to hold the batch and
/// retry once the penciller has drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushResult {
    Accepted,
    Returned,
}

impl Penciller {
    /// Offers a batch of journal-durable records to the cache.
    ///
    /// An empty batch is accepted as a no-op. A batch whose highest SQN
    /// falls behind the ledger SQN fails with
    /// [`PencillerError::SqnRegression`]; the journal assigns SQNs in
    /// order and a regression means the caller is broken.
    pub fn push_mem(&mut self, tree: BTreeMap<Key, Value>) -> Result<PushResult> {
        self.pump();
        if self.flushing() {
            log::debug!("push returned: level-zero flush in flight");
            return Ok(PushResult::Returned);
        }
        if self.work_backlog() {
            log::debug!("push returned: compaction backlog");
            return Ok(PushResult::Returned);
        }
        if tree.is_empty() {
            return Ok(PushResult::Accepted);
        }

        let batch_max = tree.values().map(|v| v.sqn).max().unwrap_or(0);
        if batch_max < self.ledger_sqn {
            bail!(PencillerError::SqnRegression {
                pushed: batch_max,
                ledger: self.ledger_sqn,
            });
        }

        let (_, max_sqn) = self.cache.push_batch(tree);
        self.ledger_sqn = max_sqn;
        self.maybe_flush();
        Ok(PushResult::Accepted)
    }

    fn maybe_flush(&mut self) {
        let size = self.cache.len_keys();
        if size <= self.cfg.max_cache_size {
            return;
        }
        // A resident level-zero file must be compacted down first, and a
        // running merge holds a manifest copy an adoption would race.
        if self.manifest.level0_present() || self.work_ongoing {
            return;
        }
        if !self.flush_jitter(size) {
            return;
        }
        self.start_flush();
    }

    /// The coin toss between the soft and hard ceilings. Staggering
    /// flushes across sibling nodes stops a cluster from hitting its disks
    /// in lockstep.
    fn flush_jitter(&mut self, size: usize) -> bool {
        if !self.cfg.coin_toss_flush {
            return true;
        }
        size > self.cfg.super_max_cache_size || self.rng.gen_range(0..5) == 0
    }

    fn start_flush(&mut self) {
        let filename = level_zero_filename(self.manifest.manifest_sqn() + 1);
        let slots = self.cache.slots_newest_first();
        let n_slots = slots.len();
        log::info!(
            "level-zero flush starting: {} ({} slots, {} keys)",
            filename,
            n_slots,
            self.cache.len_keys()
        );
        let (tx, rx) = channel();
        let join = sst::spawn_levelzero(
            self.files_dir.clone(),
            filename.clone(),
            n_slots,
            move |slot| Arc::clone(&slots[slot]),
            tx,
        );
        self.pending_l0 = Some(PendingL0 { filename, rx, join });
    }
}
