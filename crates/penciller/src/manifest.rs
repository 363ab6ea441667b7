//! # Manifest - Leveled File Index
//!
//! The authoritative mapping from level to ordered file entries, plus the
//! bookkeeping that rides along with it: the generation counter, the
//! snapshot registry, and the pending-delete set.
//!
//! ## File Format
//!
//! One blob per committed generation at
//! `<root>/ledger/ledger_manifest/nonzero_<sqn>.crr`:
//!
//! ```text
//! [crc32 of body: u32 LE][body: bincode of PersistedManifest]
//! ```
//!
//! where the body holds only `{levels, manifest_sqn, basement}`. The
//! snapshot registry and pending-delete set are volatile and never
//! serialized; a snapshot's copy of the manifest has no right to them
//! either, so copies hand them back blanked.
//!
//! ## Crash Safety
//!
//! The writer produces `nonzero_<sqn>.pnd` first; the rename to `.crr` is
//! the commit point. A half-written `.pnd` is garbage and is swept at the
//! next open. Loading tries committed generations newest first and falls
//! back on any integrity failure, so an interrupted commit can never
//! shadow an older intact generation.
//!
//! ## Level Zero
//!
//! L0 is deliberately absent from the persisted body. Its presence is
//! re-detected at open by probing the file area for
//! `<manifest_sqn + 1>_0_0.sst`, the name the next level-zero flush would
//! have used.

use anyhow::{bail, Context, Result};
use bincode::{Decode, Encode};
use keycodec::{endkey_passed, EndKey, Key};
use rand::{rngs::StdRng, Rng};
use sst::SstReader;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Number of levels, L0 included.
pub const MAX_LEVELS: usize = 8;

/// Per-level file-count ceilings used by the work check. L1 and below grow
/// by powers of eight; L0's ceiling is zero so a resident level-zero file
/// always counts as compactable work (a ceiling of one would let it block
/// every future flush).
pub const LEVEL_CEILINGS: [usize; MAX_LEVELS] =
    [0, 8, 64, 512, 4_096, 32_768, 262_144, 2_097_152];

/// Committed generations retained on disk beyond the newest.
const KEEP_GENERATIONS: usize = 8;

const COMMITTED_EXT: &str = "crr";
const PENDING_EXT: &str = "pnd";
const GENERATION_PREFIX: &str = "nonzero_";

/// One file tracked by the manifest. The key range is inclusive on both
/// ends. `owner` is the shared live reader; the manifest holds the
/// reference used for I/O and snapshots pin their own clones.
#[derive(Debug, Clone)]
pub struct ManifestEntry {
    pub start_key: Key,
    pub end_key: Key,
    pub filename: String,
    pub owner: Arc<SstReader>,
}

impl ManifestEntry {
    /// Opens `filename` in `files_dir` and builds its entry from the
    /// reader's own key range.
    pub fn open(files_dir: &Path, filename: &str) -> Result<Self> {
        let reader = Arc::new(SstReader::open(files_dir, filename)?);
        Ok(Self::from_reader(filename.to_string(), reader))
    }

    /// Wraps an already-open reader.
    pub fn from_reader(filename: String, reader: Arc<SstReader>) -> Self {
        Self {
            start_key: reader.start_key().to_vec(),
            end_key: reader.end_key().to_vec(),
            filename,
            owner: reader,
        }
    }

    fn contains(&self, key: &[u8]) -> bool {
        self.start_key.as_slice() <= key && key <= self.end_key.as_slice()
    }

    fn intersects(&self, start: &[u8], end: &EndKey) -> bool {
        self.end_key.as_slice() >= start && !endkey_passed(end, &self.start_key)
    }
}

/// A registered snapshot holder: who, the generation it observed, and when
/// its registration lapses.
#[derive(Debug, Clone)]
pub struct SnapshotRegistration {
    pub holder: u64,
    pub observed_sqn: u64,
    pub deadline: Instant,
}

// Persisted shape. Owners are rebuilt from filenames at load.
#[derive(Encode, Decode)]
struct PersistedEntry {
    start_key: Vec<u8>,
    end_key: Vec<u8>,
    filename: String,
}

#[derive(Encode, Decode)]
struct PersistedManifest {
    levels: Vec<Vec<PersistedEntry>>,
    manifest_sqn: u64,
    basement: u32,
}

/// The leveled manifest. All mutation helpers are straight-line over the
/// in-memory state; persistence is explicit through
/// [`save_pending`](Manifest::save_pending) and
/// [`commit_pending`](Manifest::commit_pending).
#[derive(Debug, Clone)]
pub struct Manifest {
    manifest_dir: PathBuf,
    files_dir: PathBuf,
    levels: Vec<Vec<ManifestEntry>>,
    manifest_sqn: u64,
    basement: usize,
    snapshots: Vec<SnapshotRegistration>,
    pending_deletes: HashMap<String, u64>,
}

impl Manifest {
    fn empty(manifest_dir: PathBuf, files_dir: PathBuf) -> Self {
        Self {
            manifest_dir,
            files_dir,
            levels: vec![Vec::new(); MAX_LEVELS],
            manifest_sqn: 0,
            basement: 0,
            snapshots: Vec::new(),
            pending_deletes: HashMap::new(),
        }
    }

    /// Loads the newest intact committed generation, or starts empty.
    ///
    /// Stale `.pnd` files are deleted first. Candidates are tried from the
    /// highest generation down; a CRC mismatch, a decode failure, or an
    /// unopenable referenced file each disqualify a candidate with a logged
    /// error. When every candidate fails: an error in strict mode,
    /// otherwise an empty manifest (the upstream journal replays).
    pub fn open(manifest_dir: PathBuf, files_dir: PathBuf, strict: bool) -> Result<Self> {
        fs::create_dir_all(&manifest_dir)?;
        fs::create_dir_all(&files_dir)?;

        let mut candidates: Vec<(u64, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&manifest_dir)? {
            let entry = entry?;
            let path = entry.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n,
                None => continue,
            };
            if name.ends_with(&format!(".{}", PENDING_EXT)) {
                // A pending file that never committed is garbage.
                let _ = fs::remove_file(&path);
                continue;
            }
            if let Some(sqn) = parse_generation(name) {
                candidates.push((sqn, path));
            }
        }
        candidates.sort_by(|a, b| b.0.cmp(&a.0));

        let found_any = !candidates.is_empty();
        for (sqn, path) in &candidates {
            match Self::load_generation(&manifest_dir, &files_dir, path) {
                Ok(manifest) => {
                    log::info!(
                        "manifest generation {} loaded ({} files)",
                        sqn,
                        manifest.file_count()
                    );
                    return Ok(manifest);
                }
                Err(e) => {
                    log::error!(
                        "manifest generation {} unreadable, trying older: {:#}",
                        sqn,
                        e
                    );
                }
            }
        }

        if found_any && strict {
            bail!(crate::PencillerError::CorruptManifest);
        }
        if found_any {
            log::warn!("every manifest generation failed to load; starting empty");
        }
        Ok(Self::empty(manifest_dir, files_dir))
    }

    fn load_generation(
        manifest_dir: &Path,
        files_dir: &Path,
        path: &Path,
    ) -> Result<Self> {
        let bytes = fs::read(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if bytes.len() < 4 {
            bail!("manifest file too small");
        }
        let stored_crc = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let body = &bytes[4..];
        if crc32fast::hash(body) != stored_crc {
            bail!("manifest body failed its CRC check");
        }
        let (persisted, _): (PersistedManifest, usize) =
            bincode::decode_from_slice(body, bincode::config::standard())?;
        if persisted.levels.len() != MAX_LEVELS {
            bail!(
                "manifest body has {} levels, expected {}",
                persisted.levels.len(),
                MAX_LEVELS
            );
        }

        let mut manifest = Self::empty(manifest_dir.to_path_buf(), files_dir.to_path_buf());
        manifest.manifest_sqn = persisted.manifest_sqn;
        for (level, persisted_entries) in persisted.levels.into_iter().enumerate() {
            for pe in persisted_entries {
                let entry = ManifestEntry::open(files_dir, &pe.filename)?;
                manifest.levels[level].push(entry);
            }
            manifest.levels[level].sort_by(|a, b| a.start_key.cmp(&b.start_key));
        }
        manifest.recompute_basement();
        Ok(manifest)
    }

    /// Probes the file area for the level-zero file the next flush would
    /// have written and, if found, inserts it (advancing the generation).
    /// Returns `true` when a level-zero file was picked up.
    pub fn probe_level_zero(&mut self) -> Result<bool> {
        let filename = level_zero_filename(self.manifest_sqn + 1);
        if !self.files_dir.join(&filename).exists() {
            return Ok(false);
        }
        let entry = ManifestEntry::open(&self.files_dir, &filename)?;
        let new_sqn = self.manifest_sqn + 1;
        self.insert(0, entry, new_sqn);
        log::info!("level-zero file {} recovered into manifest", filename);
        Ok(true)
    }

    // -- queries ------------------------------------------------------------

    /// The entry at `level` whose range contains `key`, if any. L0 is
    /// scanned whole; deeper levels are disjoint and sorted, so a binary
    /// search bounds the single candidate.
    pub fn key_lookup(&self, level: usize, key: &[u8]) -> Option<&ManifestEntry> {
        let entries = &self.levels[level];
        if level == 0 {
            return entries.iter().find(|e| e.contains(key));
        }
        let idx = entries.partition_point(|e| e.start_key.as_slice() <= key);
        let candidate = idx.checked_sub(1)?;
        let entry = &entries[candidate];
        entry.contains(key).then_some(entry)
    }

    /// All entries at `level` intersecting `[start, end]`, in key order.
    pub fn range_lookup(&self, level: usize, start: &[u8], end: &EndKey) -> Vec<ManifestEntry> {
        self.levels[level]
            .iter()
            .filter(|e| e.intersects(start, end))
            .cloned()
            .collect()
    }

    /// `true` when a level-zero file is resident.
    #[must_use]
    pub fn level0_present(&self) -> bool {
        !self.levels[0].is_empty()
    }

    /// Number of entries at `level`.
    #[must_use]
    pub fn level_size(&self, level: usize) -> usize {
        self.levels[level].len()
    }

    /// Borrow of a level's entries, for iteration by the read path.
    #[must_use]
    pub fn entries(&self, level: usize) -> &[ManifestEntry] {
        &self.levels[level]
    }

    /// Deepest non-empty level, 0 when all levels are empty.
    #[must_use]
    pub fn basement(&self) -> usize {
        self.basement
    }

    /// Current generation counter.
    #[must_use]
    pub fn manifest_sqn(&self) -> u64 {
        self.manifest_sqn
    }

    /// Highest SQN across every file the manifest references.
    #[must_use]
    pub fn max_file_sqn(&self) -> u64 {
        self.levels
            .iter()
            .flatten()
            .map(|e| e.owner.max_sqn())
            .max()
            .unwrap_or(0)
    }

    fn file_count(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    /// Levels over their ceiling and the total excess across them.
    pub fn check_for_work(&self) -> (Vec<usize>, usize) {
        let mut over = Vec::new();
        let mut excess = 0;
        for (level, entries) in self.levels.iter().enumerate() {
            let ceiling = LEVEL_CEILINGS[level];
            if entries.len() > ceiling {
                over.push(level);
                excess += entries.len() - ceiling;
            }
        }
        (over, excess)
    }

    /// Picks the compaction victim at `level` uniformly at random. The
    /// random choice avoids worst-case accumulation under adversarial
    /// write patterns; the caller seeds the generator.
    pub fn mergefile_selector(&self, level: usize, rng: &mut StdRng) -> ManifestEntry {
        let entries = &self.levels[level];
        entries[rng.gen_range(0..entries.len())].clone()
    }

    // -- mutation -----------------------------------------------------------

    /// Inserts `entry` at `level` and advances the generation to `new_sqn`.
    pub fn insert(&mut self, level: usize, entry: ManifestEntry, new_sqn: u64) {
        debug_assert!(level != 0 || self.levels[0].is_empty(), "L0 holds one entry");
        self.levels[level].push(entry);
        self.levels[level].sort_by(|a, b| a.start_key.cmp(&b.start_key));
        self.basement = self.basement.max(level);
        self.manifest_sqn = new_sqn;
    }

    /// Removes a contiguous run of `count` entries at `level` starting at
    /// the entry whose `start_key` equals `first_start`. Each removed
    /// filename lands in the pending-delete set at `new_sqn`.
    pub fn remove_run(
        &mut self,
        level: usize,
        first_start: &[u8],
        count: usize,
        new_sqn: u64,
    ) -> Result<()> {
        let entries = &mut self.levels[level];
        let idx = entries
            .iter()
            .position(|e| e.start_key.as_slice() == first_start)
            .with_context(|| format!("no entry at level {} starting at the given key", level))?;
        if idx + count > entries.len() {
            bail!("removal run overshoots level {}", level);
        }
        for removed in entries.drain(idx..idx + count) {
            self.pending_deletes.insert(removed.filename, new_sqn);
        }
        self.manifest_sqn = new_sqn;
        self.recompute_basement();
        Ok(())
    }

    /// Moves one entry from `level` to `level + 1` without marking it for
    /// deletion; the file itself is untouched.
    pub fn switch_to_next(&mut self, level: usize, filename: &str, new_sqn: u64) -> Result<()> {
        let entries = &mut self.levels[level];
        let idx = entries
            .iter()
            .position(|e| e.filename == filename)
            .with_context(|| format!("no entry {} at level {}", filename, level))?;
        let entry = entries.remove(idx);
        self.insert(level + 1, entry, new_sqn);
        self.recompute_basement();
        Ok(())
    }

    fn recompute_basement(&mut self) {
        self.basement = self
            .levels
            .iter()
            .enumerate()
            .rev()
            .find(|(_, entries)| !entries.is_empty())
            .map(|(level, _)| level)
            .unwrap_or(0);
    }

    // -- snapshots and pending deletes --------------------------------------

    /// Registers a snapshot holder against the current generation.
    pub fn add_snapshot(&mut self, holder: u64, deadline: Instant) {
        self.snapshots.push(SnapshotRegistration {
            holder,
            observed_sqn: self.manifest_sqn,
            deadline,
        });
    }

    /// Releases a holder's registration. Unknown holders are a no-op (the
    /// registration may have lapsed already).
    pub fn release_snapshot(&mut self, holder: u64) {
        self.snapshots.retain(|s| s.holder != holder);
    }

    /// Drops lapsed registrations, returning the holders removed.
    pub fn drop_expired_snapshots(&mut self, now: Instant) -> Vec<u64> {
        let mut dropped = Vec::new();
        self.snapshots.retain(|s| {
            if s.deadline <= now {
                dropped.push(s.holder);
                false
            } else {
                true
            }
        });
        dropped
    }

    /// Number of live registrations.
    #[must_use]
    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }

    /// The oldest generation any live snapshot observes. With no snapshots
    /// registered nothing is pinned, so the current generation is returned
    /// (a removal SQN can never exceed the generation that removed it).
    #[must_use]
    pub fn min_snapshot_sqn(&self) -> u64 {
        self.snapshots
            .iter()
            .map(|s| s.observed_sqn)
            .min()
            .unwrap_or(self.manifest_sqn)
    }

    /// `true` when `filename` was superseded and no snapshot can still
    /// observe it. A positive answer removes it from the pending set, so
    /// the caller must follow through with the physical delete.
    pub fn ready_to_delete(&mut self, filename: &str) -> bool {
        match self.pending_deletes.get(filename) {
            Some(&removed_at) if self.min_snapshot_sqn() >= removed_at => {
                self.pending_deletes.remove(filename);
                true
            }
            _ => false,
        }
    }

    /// Drains every pending filename that is clear to delete.
    pub fn take_ready_deletes(&mut self) -> Vec<String> {
        let floor = self.min_snapshot_sqn();
        let ready: Vec<String> = self
            .pending_deletes
            .iter()
            .filter(|(_, &removed_at)| floor >= removed_at)
            .map(|(f, _)| f.clone())
            .collect();
        for f in &ready {
            self.pending_deletes.remove(f);
        }
        ready
    }

    /// Number of filenames awaiting deletion.
    #[must_use]
    pub fn pending_delete_count(&self) -> usize {
        self.pending_deletes.len()
    }

    /// `true` when `filename` is in the pending-delete set.
    #[must_use]
    pub fn is_pending_delete(&self, filename: &str) -> bool {
        self.pending_deletes.contains_key(filename)
    }

    /// A copy for a snapshot or for the compaction clerk. The registry and
    /// the pending-delete set stay behind; the copy may not mutate global
    /// state it does not own.
    #[must_use]
    pub fn detached_copy(&self) -> Manifest {
        let mut copy = self.clone();
        copy.snapshots.clear();
        copy.pending_deletes.clear();
        copy
    }

    /// Adopts a manifest the clerk built from a
    /// [`detached_copy`](Manifest::detached_copy), folding this manifest's
    /// registry and pending set back in. The clerk's copy accumulated the
    /// pending entries for the files its merge superseded.
    pub fn merge_from_clerk(&mut self, mut clerk_manifest: Manifest) {
        clerk_manifest.snapshots = std::mem::take(&mut self.snapshots);
        for (filename, sqn) in self.pending_deletes.drain() {
            clerk_manifest.pending_deletes.entry(filename).or_insert(sqn);
        }
        *self = clerk_manifest;
    }

    // -- persistence --------------------------------------------------------

    fn generation_path(&self, sqn: u64, ext: &str) -> PathBuf {
        self.manifest_dir
            .join(format!("{}{}.{}", GENERATION_PREFIX, sqn, ext))
    }

    /// Serializes the current state to `nonzero_<sqn>.pnd`. Not yet
    /// visible to recovery; [`commit_pending`](Manifest::commit_pending)
    /// performs the rename that commits.
    pub fn save_pending(&self) -> Result<PathBuf> {
        // Level zero is never serialized: its presence is re-detected at
        // open through the filesystem probe.
        let persisted = PersistedManifest {
            levels: self
                .levels
                .iter()
                .enumerate()
                .map(|(level, entries)| {
                    if level == 0 {
                        return Vec::new();
                    }
                    entries
                        .iter()
                        .map(|e| PersistedEntry {
                            start_key: e.start_key.clone(),
                            end_key: e.end_key.clone(),
                            filename: e.filename.clone(),
                        })
                        .collect()
                })
                .collect(),
            manifest_sqn: self.manifest_sqn,
            basement: self.basement as u32,
        };
        let body = bincode::encode_to_vec(&persisted, bincode::config::standard())?;
        let mut bytes = Vec::with_capacity(4 + body.len());
        bytes.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        bytes.extend_from_slice(&body);

        let path = self.generation_path(self.manifest_sqn, PENDING_EXT);
        fs::write(&path, &bytes)
            .with_context(|| format!("failed to write {}", path.display()))?;
        let f = fs::File::open(&path)?;
        f.sync_all()?;
        Ok(path)
    }

    /// Renames the pending generation into place. This is the commit
    /// point: recovery sees either the previous generation or this one,
    /// never a torn state. Generations older than the retention window are
    /// garbage-collected afterwards.
    pub fn commit_pending(&self) -> Result<()> {
        let pending = self.generation_path(self.manifest_sqn, PENDING_EXT);
        let committed = self.generation_path(self.manifest_sqn, COMMITTED_EXT);
        fs::rename(&pending, &committed).with_context(|| {
            format!(
                "failed to commit manifest generation {}",
                self.manifest_sqn
            )
        })?;
        if let Ok(d) = fs::File::open(&self.manifest_dir) {
            let _ = d.sync_all();
        }
        self.gc_old_generations();
        Ok(())
    }

    fn gc_old_generations(&self) {
        let Ok(dir) = fs::read_dir(&self.manifest_dir) else {
            return;
        };
        let mut committed: Vec<(u64, PathBuf)> = dir
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let path = e.path();
                let name = path.file_name()?.to_str()?.to_string();
                parse_generation(&name).map(|sqn| (sqn, path))
            })
            .collect();
        committed.sort_by(|a, b| b.0.cmp(&a.0));
        for (sqn, path) in committed.into_iter().skip(KEEP_GENERATIONS) {
            log::debug!("removing old manifest generation {}", sqn);
            let _ = fs::remove_file(path);
        }
    }
}

/// Basename of the level-zero file written at generation `sqn`.
pub fn level_zero_filename(sqn: u64) -> String {
    format!("{}_0_0.sst", sqn)
}

/// Basename of merge output file `n` landing at `level` in generation `sqn`.
pub fn merge_filename(sqn: u64, level: usize, n: usize) -> String {
    format!("{}_{}_{}.sst", sqn, level, n)
}

fn parse_generation(name: &str) -> Option<u64> {
    let rest = name.strip_prefix(GENERATION_PREFIX)?;
    let sqn = rest.strip_suffix(&format!(".{}", COMMITTED_EXT))?;
    sqn.parse().ok()
}
