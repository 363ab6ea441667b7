use crate::{Penciller, PushResult};
use config::PencillerConfig;
use keycodec::{Key, Value};
use std::collections::BTreeMap;
use std::time::Duration;

/// A config sized for tests: tiny cache, deterministic flushes and
/// compaction victims, small merge output files.
pub fn test_config() -> PencillerConfig {
    PencillerConfig {
        max_cache_size: 10,
        super_max_cache_size: 40,
        coin_toss_flush: false,
        merge_file_max_keys: 64,
        compaction_seed: 42,
        ..PencillerConfig::default()
    }
}

pub fn key(i: u64) -> Key {
    format!("k{:06}", i).into_bytes()
}

/// A batch assigning consecutive SQNs from `first_sqn` in key order.
/// Returns the tree and the SQN one past the batch.
pub fn batch(indices: impl IntoIterator<Item = u64>, first_sqn: u64) -> (BTreeMap<Key, Value>, u64) {
    let mut tree = BTreeMap::new();
    let mut sqn = first_sqn;
    for i in indices {
        tree.insert(key(i), Value::active(sqn, format!("v{}", i).into_bytes()));
        sqn += 1;
    }
    (tree, sqn)
}

pub fn single(k: &[u8], sqn: u64) -> BTreeMap<Key, Value> {
    let mut tree = BTreeMap::new();
    tree.insert(k.to_vec(), Value::active(sqn, b"v".to_vec()));
    tree
}

/// Pushes with the bookie's retry discipline: a returned batch is held and
/// offered again after a pump.
pub fn push_retrying(p: &mut Penciller, tree: BTreeMap<Key, Value>) {
    for _ in 0..5_000 {
        match p.push_mem(tree.clone()).expect("push failed") {
            PushResult::Accepted => return,
            PushResult::Returned => {
                p.tick();
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }
    panic!("push kept being returned");
}

/// Pumps until `cond` holds or a generous deadline passes.
pub fn wait_until(p: &mut Penciller, cond: impl Fn(&Penciller) -> bool) -> bool {
    for _ in 0..2_500 {
        p.tick();
        if cond(p) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}

/// Pushes `indices` in chunks of five, starting at `first_sqn`, and
/// returns the next unused SQN.
pub fn fill(p: &mut Penciller, indices: &[u64], first_sqn: u64) -> u64 {
    let mut sqn = first_sqn;
    for chunk in indices.chunks(5) {
        let (tree, next) = batch(chunk.iter().copied(), sqn);
        push_retrying(p, tree);
        sqn = next;
    }
    sqn
}

/// Waits for the penciller to drain: no flush in flight, empty cache, and
/// every level within its ceiling.
pub fn settle(p: &mut Penciller) {
    let settled = wait_until(p, |p| {
        let sizes = p.level_sizes();
        let calm = sizes
            .iter()
            .zip(crate::manifest::LEVEL_CEILINGS.iter())
            .all(|(size, ceiling)| size <= ceiling);
        !p.flushing() && calm
    });
    assert!(settled, "penciller failed to settle: {:?}", p);
}
