//! Background construction of a level-zero file from frozen cache slots.
//!
//! The penciller freezes its cache, spawns the builder, and keeps serving
//! reads; the builder pulls one slot at a time through the fetch callback,
//! merges them with highest-SQN-wins resolution, writes the file, and
//! reports the result on the notify channel. The penciller applies the
//! completion the next time it pumps its inbox.

use anyhow::Result;
use keycodec::{Key, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::writer::SstWriter;

/// Completion report for a finished level-zero build.
#[derive(Debug, Clone)]
pub struct LevelZeroBuild {
    /// Basename of the file that was written.
    pub filename: String,
    /// Smallest key in the file.
    pub start_key: Key,
    /// Largest key in the file.
    pub end_key: Key,
}

/// What arrives on the notify channel: the build report, or the error that
/// stopped it. A failed build leaves no file behind.
pub type LevelZeroResult = Result<LevelZeroBuild>;

/// Spawns a worker thread that builds `dir/filename` from `n_slots` cache
/// slots.
///
/// `fetch` is called once per slot index, newest slot first; each call
/// returns a shared handle to that slot's ordered tree. Pulling slots one
/// at a time keeps any copying bounded by a single slot rather than the
/// whole cache.
///
/// The result is sent on `done`. A send failure (receiver gone) is ignored;
/// the penciller that wanted the file has already shut down.
pub fn spawn_levelzero<F>(
    dir: PathBuf,
    filename: String,
    n_slots: usize,
    fetch: F,
    done: Sender<LevelZeroResult>,
) -> JoinHandle<()>
where
    F: Fn(usize) -> Arc<BTreeMap<Key, Value>> + Send + 'static,
{
    thread::spawn(move || {
        log::debug!("level-zero build starting: {} ({} slots)", filename, n_slots);
        let result = build(&dir, &filename, n_slots, &fetch);
        match &result {
            Ok(b) => log::info!("level-zero build complete: {}", b.filename),
            Err(e) => log::error!("level-zero build failed for {}: {:#}", filename, e),
        }
        let _ = done.send(result);
    })
}

fn build<F>(dir: &PathBuf, filename: &str, n_slots: usize, fetch: &F) -> LevelZeroResult
where
    F: Fn(usize) -> Arc<BTreeMap<Key, Value>>,
{
    let mut merged: BTreeMap<Key, Value> = BTreeMap::new();
    for slot in 0..n_slots {
        let tree = fetch(slot);
        for (k, v) in tree.iter() {
            match merged.get(k) {
                Some(existing) if existing.sqn >= v.sqn => {}
                _ => {
                    merged.insert(k.clone(), v.clone());
                }
            }
        }
    }

    let expected = merged.len();
    let (start_key, end_key) = SstWriter::write(dir, filename, expected, merged.into_iter())?;
    Ok(LevelZeroBuild {
        filename: filename.to_string(),
        start_key,
        end_key,
    })
}
