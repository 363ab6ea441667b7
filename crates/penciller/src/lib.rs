//! # Penciller - Ordered-Keys Layer of the Ledger
//!
//! The penciller maintains an ordered, leveled view of keys whose recent
//! updates are already durable in the upstream journal. It accepts batched
//! in-memory snapshots from the journal owner (the bookie), answers point
//! and range reads against the merged view of cache plus on-disk files,
//! and compacts between levels in the background.
//!
//! ## Architecture
//!
//! ```text
//! Bookie
//!   |
//!   v  push_mem (ok | returned)
//! ┌─────────────────────────────────────────────────┐
//! │                  PENCILLER                      │
//! │                                                 │
//! │ push.rs  → L0 cache (batches + hash index)      │
//! │               |                                 │
//! │               |  (size > max, L0 free, quiet?)  │
//! │               v                                 │
//! │        level-zero builder (thread)              │
//! │               |   notify                        │
//! │               v                                 │
//! │        manifest L0 entry                        │
//! │               |                                 │
//! │               v   clerk (thread)                │
//! │        L1 .. L7 merges, committed at the        │
//! │        .pnd → .crr rename                       │
//! │                                                 │
//! │ read.rs  → cache → L0 → L1 → ... (first match)  │
//! │ snapshots → pinned frozen views                 │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Responsibilities
//!
//! | Module        | Purpose                                              |
//! |---------------|------------------------------------------------------|
//! | `lib.rs`      | `Penciller` struct, open/recovery, pump, close, `Drop` |
//! | [`manifest`]  | Leveled file index, generations, snapshots, pending deletes |
//! | [`cache`]     | Pushed-batch staging and the 256-bucket hash index   |
//! | [`reader`]    | Point fetch across levels and the keyfolder merge    |
//! | [`clerk`]     | Background compaction worker                         |
//! | [`snapshot`]  | Pinned point-in-time clones                          |
//! | [`error`]     | Typed outcomes (`PencillerError`)                    |
//!
//! ## Durability Contract
//!
//! An accepted push is ordered but not yet durable here; a crash may lose
//! a contiguous suffix of recent sequence numbers, which the journal
//! replays. Everything at or below [`persisted_sqn`](Penciller::persisted_sqn)
//! is in files. Manifest changes commit atomically at a file rename, so
//! recovery always sees a consistent generation.

mod cache;
mod clerk;
mod error;
pub mod manifest;
mod push;
mod read;
mod reader;
mod snapshot;

pub use config::PencillerConfig;
pub use error::PencillerError;
pub use push::PushResult;
pub use reader::ITERATOR_SCANWIDTH;
pub use snapshot::{PencillerSnapshot, SnapshotMode};

use anyhow::Result;
use cache::LevelZeroCache;
use clerk::{Clerk, ClerkDone};
use keycodec::{EndKey, Key};
use manifest::{level_zero_filename, Manifest};
use rand::{rngs::StdRng, SeedableRng};
use sst::{LevelZeroResult, SstWriter};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::thread::JoinHandle;
use std::time::Instant;

/// Subdirectory of the root holding committed manifest generations.
const MANIFEST_SUBDIR: &str = "ledger/ledger_manifest";
/// Subdirectory of the root holding the sorted files.
const FILES_SUBDIR: &str = "ledger/ledger_files";

/// An in-flight level-zero build.
pub(crate) struct PendingL0 {
    pub(crate) filename: String,
    pub(crate) rx: Receiver<LevelZeroResult>,
    pub(crate) join: JoinHandle<()>,
}

/// The single-writer coordinator owning all mutable state.
///
/// Every public operation first drains completion messages from the
/// background actors (the level-zero builder and the compaction clerk),
/// then runs straight-line over owned state. The `&mut self` receivers are
/// the serialization point; there are no locks.
pub struct Penciller {
    #[allow(dead_code)]
    root: PathBuf,
    manifest_dir: PathBuf,
    files_dir: PathBuf,
    cfg: PencillerConfig,
    manifest: Manifest,
    cache: LevelZeroCache,
    /// Highest SQN ever accepted into the cache.
    ledger_sqn: u64,
    /// Highest SQN known to be in files on disk.
    persisted_sqn: u64,
    /// `persisted_sqn` as computed at open, frozen for the bookie's replay
    /// decision.
    startup_sqn: u64,
    pending_l0: Option<PendingL0>,
    clerk: Option<Clerk>,
    work_ongoing: bool,
    work_backlog: bool,
    closing: bool,
    rng: StdRng,
    next_holder: u64,
}

impl Penciller {
    /// Opens (or creates) a penciller rooted at `root`.
    ///
    /// # Recovery Steps
    ///
    /// 1. Create the manifest and file directories if absent.
    /// 2. Sweep uncommitted `.pnd` manifest blobs.
    /// 3. Load the newest intact committed generation (falling back on
    ///    integrity failures, per configuration).
    /// 4. Probe for a level-zero file written after that generation and
    ///    fold it in.
    /// 5. Compute the startup SQN from the file footers.
    /// 6. Start the compaction clerk and dispatch any overdue work.
    pub fn open(root: impl AsRef<Path>, cfg: PencillerConfig) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let manifest_dir = root.join(MANIFEST_SUBDIR);
        let files_dir = root.join(FILES_SUBDIR);

        let mut manifest = Manifest::open(
            manifest_dir.clone(),
            files_dir.clone(),
            cfg.strict_manifest_recovery,
        )?;
        manifest.probe_level_zero()?;
        let startup_sqn = manifest.max_file_sqn();

        let clerk = Clerk::start(
            files_dir.clone(),
            cfg.compaction_seed,
            cfg.merge_file_max_keys,
        );
        let rng = StdRng::seed_from_u64(cfg.compaction_seed ^ 0x70656e63);

        let mut penciller = Self {
            root,
            manifest_dir,
            files_dir,
            manifest,
            cache: LevelZeroCache::new(),
            ledger_sqn: startup_sqn,
            persisted_sqn: startup_sqn,
            startup_sqn,
            pending_l0: None,
            clerk: Some(clerk),
            work_ongoing: false,
            work_backlog: false,
            closing: false,
            rng,
            cfg,
            next_holder: 1,
        };
        penciller.prompt_clerk();
        Ok(penciller)
    }

    // -- message pump -------------------------------------------------------

    /// Drains completions from the background actors and sweeps deletable
    /// files. Called implicitly at the head of every public operation;
    /// callers with idle periods may also call it directly.
    pub fn tick(&mut self) {
        self.pump();
        self.sweep_deletes();
    }

    pub(crate) fn pump(&mut self) {
        self.poll_l0();
        self.poll_clerk();
        let now = Instant::now();
        for holder in self.manifest.drop_expired_snapshots(now) {
            log::warn!("snapshot registration {} lapsed and was dropped", holder);
        }
    }

    fn poll_l0(&mut self) {
        let finished = match &self.pending_l0 {
            Some(pending) => match pending.rx.try_recv() {
                Ok(result) => Some(Some(result)),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => Some(None),
            },
            None => None,
        };
        let Some(result) = finished else {
            return;
        };
        let pending = self.pending_l0.take().expect("checked above");
        let _ = pending.join.join();
        match result {
            Some(Ok(build)) => {
                if let Err(e) = self.apply_l0(&build.filename) {
                    // The cache is kept; the next over-threshold push
                    // retries the flush under the same filename.
                    log::error!(
                        "failed to adopt level-zero file {}: {:#}",
                        build.filename,
                        e
                    );
                }
            }
            Some(Err(e)) => {
                log::error!(
                    "level-zero build {} failed: {:#}",
                    pending.filename,
                    e
                );
            }
            None => {
                log::error!("level-zero builder for {} vanished", pending.filename);
            }
        }
    }

    fn apply_l0(&mut self, filename: &str) -> Result<()> {
        let entry = manifest::ManifestEntry::open(&self.files_dir, filename)?;
        let new_sqn = self.manifest.manifest_sqn() + 1;
        self.manifest.insert(0, entry, new_sqn);
        self.persisted_sqn = self.ledger_sqn;
        self.cache.clear();
        log::info!(
            "level-zero file {} adopted at generation {}",
            filename,
            new_sqn
        );
        self.prompt_clerk();
        Ok(())
    }

    fn poll_clerk(&mut self) {
        loop {
            let done = match &self.clerk {
                Some(clerk) => clerk.try_recv_done(),
                None => None,
            };
            match done {
                Some(ClerkDone::ManifestChange(new_manifest)) => {
                    self.apply_manifest_change(new_manifest);
                }
                Some(ClerkDone::Failed { level, error }) => {
                    log::error!("compaction of level {} failed: {:#}", level, error);
                    self.work_ongoing = false;
                }
                None => break,
            }
        }
    }

    fn apply_manifest_change(&mut self, new_manifest: Manifest) {
        self.manifest.merge_from_clerk(new_manifest);
        match self.manifest.commit_pending() {
            Ok(()) => log::info!(
                "manifest generation {} committed",
                self.manifest.manifest_sqn()
            ),
            Err(e) => log::error!(
                "manifest generation {} adopted but not committed: {:#}",
                self.manifest.manifest_sqn(),
                e
            ),
        }
        self.work_ongoing = false;
        self.sweep_deletes();
        self.prompt_clerk();
    }

    pub(crate) fn prompt_clerk(&mut self) {
        if self.closing || self.work_ongoing {
            return;
        }
        let (over_levels, excess) = self.manifest.check_for_work();
        if excess == 0 {
            self.work_backlog = false;
            return;
        }
        let backlog = excess > self.cfg.backlog_tolerance;
        if backlog && !self.work_backlog {
            log::warn!(
                "compaction backlog: {} excess files, returning pushes",
                excess
            );
        }
        self.work_backlog = backlog;
        if let Some(clerk) = &self.clerk {
            let level = over_levels[0];
            log::debug!("dispatching level {} to the clerk", level);
            clerk.dispatch(level, self.manifest.detached_copy());
            self.work_ongoing = true;
        }
    }

    pub(crate) fn sweep_deletes(&mut self) {
        if self.work_ongoing {
            return;
        }
        for filename in self.manifest.take_ready_deletes() {
            match sst::delete_confirmed(&self.files_dir, &filename) {
                Ok(()) => log::debug!("deleted superseded file {}", filename),
                Err(e) => log::warn!("could not delete {}: {}", filename, e),
            }
        }
    }

    // -- accessors ----------------------------------------------------------

    /// Highest SQN found in persisted files at open. The bookie replays
    /// its journal from here.
    #[must_use]
    pub fn get_startup_sqn(&self) -> u64 {
        self.startup_sqn
    }

    /// Highest SQN currently known to be in files.
    #[must_use]
    pub fn persisted_sqn(&self) -> u64 {
        self.persisted_sqn
    }

    /// Highest SQN ever accepted.
    #[must_use]
    pub fn ledger_sqn(&self) -> u64 {
        self.ledger_sqn
    }

    /// Current manifest generation.
    #[must_use]
    pub fn manifest_sqn(&self) -> u64 {
        self.manifest.manifest_sqn()
    }

    /// `true` while a level-zero build is in flight (pushes return).
    #[must_use]
    pub fn flushing(&self) -> bool {
        self.pending_l0.is_some()
    }

    /// `true` while the compaction backlog gates pushes.
    #[must_use]
    pub fn work_backlog(&self) -> bool {
        self.work_backlog
    }

    /// `true` when a level-zero file is resident in the manifest.
    #[must_use]
    pub fn level0_present(&self) -> bool {
        self.manifest.level0_present()
    }

    /// Keys currently staged in the cache.
    #[must_use]
    pub fn cache_key_count(&self) -> usize {
        self.cache.len_keys()
    }

    /// Entry count per level.
    #[must_use]
    pub fn level_sizes(&self) -> [usize; manifest::MAX_LEVELS] {
        let mut sizes = [0usize; manifest::MAX_LEVELS];
        for (level, size) in sizes.iter_mut().enumerate() {
            *size = self.manifest.level_size(level);
        }
        sizes
    }

    /// Key ranges of a level's entries, in manifest order. Exposed for
    /// invariant checks.
    #[must_use]
    pub fn level_ranges(&self, level: usize) -> Vec<(Key, Key)> {
        self.manifest
            .entries(level)
            .iter()
            .map(|e| (e.start_key.clone(), e.end_key.clone()))
            .collect()
    }

    /// Filenames of a level's entries, in manifest order.
    #[must_use]
    pub fn level_files(&self, level: usize) -> Vec<String> {
        self.manifest
            .entries(level)
            .iter()
            .map(|e| e.filename.clone())
            .collect()
    }

    /// Deepest non-empty level.
    #[must_use]
    pub fn basement(&self) -> usize {
        self.manifest.basement()
    }

    /// Live snapshot registrations.
    #[must_use]
    pub fn snapshot_count(&self) -> usize {
        self.manifest.snapshot_count()
    }

    /// Files awaiting deletion.
    #[must_use]
    pub fn pending_delete_count(&self) -> usize {
        self.manifest.pending_delete_count()
    }

    /// `true` when `filename` awaits deletion.
    #[must_use]
    pub fn is_pending_delete(&self, filename: &str) -> bool {
        self.manifest.is_pending_delete(filename)
    }

    // -- shutdown -----------------------------------------------------------

    /// Controlled shutdown.
    ///
    /// A pending level-zero build is waited for and adopted. After that,
    /// a non-empty cache with no resident level-zero file is written out
    /// synchronously; otherwise cached memory is discarded (the journal
    /// replays it). Finally the clerk is stopped and joined.
    pub fn close(&mut self) -> Result<()> {
        if self.closing {
            return Ok(());
        }
        self.closing = true;

        if let Some(pending) = self.pending_l0.take() {
            let result = pending.rx.recv();
            let _ = pending.join.join();
            match result {
                Ok(Ok(build)) => {
                    if let Err(e) = self.apply_l0(&build.filename) {
                        log::error!(
                            "could not adopt {} during close: {:#}",
                            build.filename,
                            e
                        );
                    }
                }
                Ok(Err(e)) => {
                    log::error!("level-zero build failed during close: {:#}", e)
                }
                Err(_) => log::error!("level-zero builder vanished during close"),
            }
        }
        self.poll_clerk();

        let mut final_write = Ok(());
        if !self.cache.is_empty() && !self.manifest.level0_present() {
            let filename = level_zero_filename(self.manifest.manifest_sqn() + 1);
            let merged = self.cache.merged_in_range(b"", &EndKey::Open);
            let count = merged.len();
            match SstWriter::write(&self.files_dir, &filename, count, merged.into_iter()) {
                Ok(_) => {
                    self.persisted_sqn = self.ledger_sqn;
                    log::info!(
                        "cache written synchronously to {} at close ({} keys)",
                        filename,
                        count
                    );
                }
                Err(e) => final_write = Err(e),
            }
        } else if !self.cache.is_empty() {
            log::warn!(
                "discarding {} cached keys at close; journal replay restores them",
                self.cache.len_keys()
            );
        }
        self.cache.clear();

        if let Some(clerk) = self.clerk.take() {
            clerk.close();
        }
        final_write
    }

    /// Closes and hands back the data directories for teardown.
    pub fn doom(&mut self) -> Result<(PathBuf, PathBuf)> {
        self.close()?;
        Ok((self.manifest_dir.clone(), self.files_dir.clone()))
    }
}

impl std::fmt::Debug for Penciller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Penciller")
            .field("manifest_sqn", &self.manifest.manifest_sqn())
            .field("ledger_sqn", &self.ledger_sqn)
            .field("persisted_sqn", &self.persisted_sqn)
            .field("cache_keys", &self.cache.len_keys())
            .field("flushing", &self.pending_l0.is_some())
            .field("work_ongoing", &self.work_ongoing)
            .field("work_backlog", &self.work_backlog)
            .field("level_sizes", &self.level_sizes())
            .finish()
    }
}

/// Best-effort close on drop. Errors are swallowed; anything lost is in
/// the journal.
impl Drop for Penciller {
    fn drop(&mut self) {
        if !self.closing {
            let _ = self.close();
        }
    }
}

#[cfg(test)]
mod tests;
