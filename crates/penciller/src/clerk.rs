//! The compaction clerk: a single background worker that turns a level
//! over its ceiling into a committed manifest generation.
//!
//! The penciller dispatches `(level, detached manifest copy)` over a
//! channel; the clerk picks a victim file, merges it with everything it
//! overlaps one level down, writes the output files and the new manifest
//! generation as a pending blob, and posts the result back. Committing
//! (the rename) stays with the penciller, so a clerk failure of any kind
//! leaves the old manifest generation intact.

use anyhow::{Context, Result};
use keycodec::EndKey;
use rand::{rngs::StdRng, SeedableRng};
use sst::{SstPointer, SstReader, SstWriter};
use std::path::PathBuf;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::manifest::{merge_filename, Manifest, ManifestEntry};
use crate::reader::KeyFolder;

/// Longest the clerk sits idle between checks for work.
const MAX_WORK_WAIT: Duration = Duration::from_secs(300);

/// Work and shutdown messages for the clerk.
pub(crate) enum ClerkWork {
    /// Merge one file from `level` into `level + 1`, starting from a
    /// detached copy of the manifest.
    Merge { level: usize, manifest: Manifest },
    Close,
}

/// What the clerk posts back.
pub(crate) enum ClerkDone {
    /// A new manifest generation, already saved as pending.
    ManifestChange(Manifest),
    /// The merge failed; the old manifest is untouched.
    Failed { level: usize, error: anyhow::Error },
}

/// Handle to the clerk thread held by the penciller.
pub(crate) struct Clerk {
    work_tx: Sender<ClerkWork>,
    done_rx: Receiver<ClerkDone>,
    join: Option<JoinHandle<()>>,
}

impl Clerk {
    /// Spawns the worker. `seed` fixes the victim selection order for
    /// reproducible compaction in tests.
    pub fn start(files_dir: PathBuf, seed: u64, merge_file_max_keys: usize) -> Self {
        let (work_tx, work_rx) = channel::<ClerkWork>();
        let (done_tx, done_rx) = channel::<ClerkDone>();
        let join = thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(seed);
            loop {
                match work_rx.recv_timeout(MAX_WORK_WAIT) {
                    Ok(ClerkWork::Merge { level, manifest }) => {
                        let result =
                            run_merge(&files_dir, level, manifest, &mut rng, merge_file_max_keys);
                        let done = match result {
                            Ok(manifest) => ClerkDone::ManifestChange(manifest),
                            Err(error) => ClerkDone::Failed { level, error },
                        };
                        if done_tx.send(done).is_err() {
                            break;
                        }
                    }
                    Ok(ClerkWork::Close) => break,
                    Err(RecvTimeoutError::Timeout) => {
                        log::trace!("clerk idle, no work dispatched");
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        });
        Self {
            work_tx,
            done_rx,
            join: Some(join),
        }
    }

    pub fn dispatch(&self, level: usize, manifest: Manifest) {
        let _ = self.work_tx.send(ClerkWork::Merge { level, manifest });
    }

    pub fn try_recv_done(&self) -> Option<ClerkDone> {
        self.done_rx.try_recv().ok()
    }

    /// Asks the worker to stop and waits for it.
    pub fn close(mut self) {
        let _ = self.work_tx.send(ClerkWork::Close);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// One merge: victim at `level`, overlaps at `level + 1`, output at
/// `level + 1`, new generation saved as pending.
fn run_merge(
    files_dir: &PathBuf,
    level: usize,
    mut manifest: Manifest,
    rng: &mut StdRng,
    merge_file_max_keys: usize,
) -> Result<Manifest> {
    let new_sqn = manifest.manifest_sqn() + 1;
    let src = if level == 0 {
        // L0 holds one file and its range may overlap anything below.
        manifest
            .entries(0)
            .first()
            .cloned()
            .context("dispatched L0 merge with no level-zero file")?
    } else {
        manifest.mergefile_selector(level, rng)
    };
    let end = EndKey::Inclusive(src.end_key.clone());
    let overlaps = manifest.range_lookup(level + 1, &src.start_key, &end);

    if overlaps.is_empty() {
        log::info!(
            "compaction: switching {} from level {} to {}",
            src.filename,
            level,
            level + 1
        );
        manifest.switch_to_next(level, &src.filename, new_sqn)?;
        manifest.save_pending()?;
        return Ok(manifest);
    }

    log::info!(
        "compaction: merging {} (level {}) with {} file(s) at level {}",
        src.filename,
        level,
        overlaps.len(),
        level + 1
    );

    // Tombstones can be dropped only when the output lands in the basement
    // with nothing beneath it to shadow.
    let to_basement = level + 1 >= manifest.basement();

    let new_entries = write_merged(
        files_dir,
        &src,
        &overlaps,
        new_sqn,
        level + 1,
        merge_file_max_keys,
        to_basement,
    )?;

    manifest.remove_run(level, &src.start_key, 1, new_sqn)?;
    manifest.remove_run(level + 1, &overlaps[0].start_key, overlaps.len(), new_sqn)?;
    for entry in new_entries {
        manifest.insert(level + 1, entry, new_sqn);
    }
    manifest.save_pending()?;
    Ok(manifest)
}

/// Streams the dominant records of `src` plus `overlaps` into files of at
/// most `max_keys` records each, returning the new entries in key order.
fn write_merged(
    files_dir: &PathBuf,
    src: &ManifestEntry,
    overlaps: &[ManifestEntry],
    new_sqn: u64,
    target_level: usize,
    max_keys: usize,
    drop_tombstones: bool,
) -> Result<Vec<ManifestEntry>> {
    // The victim is the upper (fresher) stream, so it wins equal-SQN ties.
    let upper = vec![SstPointer::whole(Arc::clone(&src.owner))];
    let lower = overlaps
        .iter()
        .map(|e| SstPointer::whole(Arc::clone(&e.owner)))
        .collect();
    let mut folder = KeyFolder::new(Vec::new(), vec![upper, lower], EndKey::Open);

    let mut entries = Vec::new();
    let mut chunk = Vec::with_capacity(max_keys.min(4096));
    let mut n = 0usize;
    while let Some(record) = folder.next_record()? {
        if drop_tombstones && record.1.is_tombstone() {
            continue;
        }
        chunk.push(record);
        if chunk.len() >= max_keys {
            entries.push(flush_chunk(files_dir, new_sqn, target_level, n, &mut chunk)?);
            n += 1;
        }
    }
    if !chunk.is_empty() {
        entries.push(flush_chunk(files_dir, new_sqn, target_level, n, &mut chunk)?);
    }
    Ok(entries)
}

fn flush_chunk(
    files_dir: &PathBuf,
    new_sqn: u64,
    target_level: usize,
    n: usize,
    chunk: &mut Vec<keycodec::Record>,
) -> Result<ManifestEntry> {
    let filename = merge_filename(new_sqn, target_level, n);
    let expected = chunk.len();
    SstWriter::write(files_dir, &filename, expected, chunk.drain(..))?;
    let reader = Arc::new(SstReader::open(files_dir, &filename)?);
    Ok(ManifestEntry::from_reader(filename, reader))
}
