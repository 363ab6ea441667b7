use crate::manifest::LEVEL_CEILINGS;
use crate::tests::helpers::*;
use crate::Penciller;
use anyhow::Result;
use config::PencillerConfig;
use keycodec::{EndKey, Record, Value};
use std::collections::BTreeMap;
use tempfile::tempdir;

fn sst_files_on_disk(p: &std::path::Path) -> usize {
    std::fs::read_dir(p.join("ledger/ledger_files"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.path()
                .extension()
                .map(|x| x == "sst")
                .unwrap_or(false)
        })
        .count()
}

#[test]
fn flushed_level_zero_is_compacted_down() -> Result<()> {
    let dir = tempdir()?;
    let mut p = Penciller::open(dir.path(), test_config())?;

    fill(&mut p, &(0..15u64).collect::<Vec<_>>(), 1);
    settle(&mut p);

    assert!(!p.level0_present(), "L0 must not linger");
    assert!(p.basement() >= 1, "data moved into the levels");
    for i in 0..15u64 {
        assert!(p.fetch(&key(i))?.is_some(), "key {} lost in compaction", i);
    }
    Ok(())
}

#[test]
fn overwrite_merge_supersedes_old_files_and_sweeps_them() -> Result<()> {
    let dir = tempdir()?;
    let mut p = Penciller::open(dir.path(), test_config())?;

    // Wave one lands in the levels.
    let next_sqn = fill(&mut p, &(0..15u64).collect::<Vec<_>>(), 1);
    settle(&mut p);
    let old_files = p.level_files(p.basement());
    assert!(!old_files.is_empty());

    // Wave two overwrites the same keys and must merge, not switch.
    fill(&mut p, &(0..15u64).collect::<Vec<_>>(), next_sqn);
    settle(&mut p);

    for i in 0..15u64 {
        let v = p.fetch(&key(i))?.expect("key survived the merge");
        assert!(v.sqn >= next_sqn, "key {} still has its old sqn", i);
    }

    // With no snapshots registered the superseded files are swept.
    assert!(
        wait_until(&mut p, |p| p.pending_delete_count() == 0),
        "pending deletes never drained"
    );
    let live: usize = p.level_sizes().iter().sum();
    assert_eq!(
        sst_files_on_disk(dir.path()),
        live,
        "only manifest-referenced files remain on disk"
    );
    Ok(())
}

#[test]
fn levels_stay_sorted_and_disjoint_under_load() -> Result<()> {
    let dir = tempdir()?;
    let cfg = PencillerConfig {
        merge_file_max_keys: 8,
        ..test_config()
    };
    let mut p = Penciller::open(dir.path(), cfg)?;

    // Several flush cycles over an interleaved key pattern, forcing
    // multi-file merge output through the small file cap.
    let mut sqn = 1;
    let mut pushed = std::collections::BTreeSet::new();
    for wave in 0..4u64 {
        let indices: Vec<u64> = (0..60).map(|i| (i * 7 + wave) % 120).collect();
        pushed.extend(indices.iter().copied());
        sqn = fill(&mut p, &indices, sqn);
        settle(&mut p);
    }

    for level in 1..LEVEL_CEILINGS.len() {
        let ranges = p.level_ranges(level);
        for pair in ranges.windows(2) {
            let (_, prev_end) = (&pair[0].0, &pair[0].1);
            let (next_start, _) = (&pair[1].0, &pair[1].1);
            assert!(
                prev_end < next_start,
                "level {} entries overlap or are unsorted: {:?}",
                level,
                ranges
            );
        }
        assert!(
            p.level_sizes()[level] <= LEVEL_CEILINGS[level],
            "level {} still over its ceiling after settling",
            level
        );
    }

    // Every pushed key still readable.
    for i in pushed {
        assert!(p.fetch(&key(i))?.is_some(), "key {} went missing", i);
    }
    Ok(())
}

#[test]
fn tombstones_are_dropped_once_they_reach_the_basement() -> Result<()> {
    let dir = tempdir()?;
    let mut p = Penciller::open(dir.path(), test_config())?;

    // A live wave settles into the basement.
    let next_sqn = fill(&mut p, &(0..15u64).collect::<Vec<_>>(), 1);
    settle(&mut p);

    // Delete one key; the tombstone must flush and merge down.
    let mut tree = BTreeMap::new();
    tree.insert(key(3), Value::tombstone(next_sqn));
    push_retrying(&mut p, tree);
    let filler: Vec<u64> = (200..214).collect();
    fill(&mut p, &filler, next_sqn + 1);
    settle(&mut p);

    assert!(
        p.fetch(&key(3))?.map_or(true, |v| v.is_tombstone()),
        "deleted key must not come back alive"
    );

    // Once merged into the basement the tombstone itself is gone: a fold
    // across the range sees neither the old value nor the marker.
    let records = p.fetch_keys(
        &key(3),
        &EndKey::Inclusive(key(3)),
        Vec::new(),
        |mut acc: Vec<Record>, r| {
            acc.push(r);
            acc
        },
        None,
    )?;
    assert!(
        records.is_empty(),
        "tombstone should be garbage-collected at the basement: {:?}",
        records
    );
    Ok(())
}

#[test]
fn switch_keeps_the_same_file_when_nothing_overlaps() -> Result<()> {
    let dir = tempdir()?;
    let mut p = Penciller::open(dir.path(), test_config())?;

    fill(&mut p, &(0..15u64).collect::<Vec<_>>(), 1);
    settle(&mut p);

    // A single flush cycle with no deeper data is a switch: the level-zero
    // file keeps its name one level down and nothing is marked deleted.
    let files: Vec<String> = (1..LEVEL_CEILINGS.len())
        .flat_map(|l| p.level_files(l))
        .collect();
    assert_eq!(files.len(), 1);
    assert!(files[0].ends_with("_0_0.sst"), "level-zero name preserved");
    assert_eq!(p.pending_delete_count(), 0);
    Ok(())
}
