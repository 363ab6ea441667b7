use crate::reader::KeyFolder;
use crate::tests::helpers::*;
use crate::{Penciller, PencillerError};
use anyhow::Result;
use keycodec::{EndKey, Key, Record, Value};
use sst::{SstPointer, SstReader, SstWriter};
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::tempdir;

#[test]
fn index_keys_are_refused_by_point_lookup() -> Result<()> {
    let dir = tempdir()?;
    let mut p = Penciller::open(dir.path(), test_config())?;

    let idx_key = b"#idx#bucket/field/term/obj".to_vec();
    let mut tree = BTreeMap::new();
    tree.insert(idx_key.clone(), Value::active(1, vec![]));
    p.push_mem(tree)?;

    let err = p.fetch(&idx_key).expect_err("index keys do not hash");
    assert_eq!(
        err.downcast_ref::<PencillerError>(),
        Some(&PencillerError::KeyNotHashable)
    );

    // The same key is reachable through a range fold.
    let found = p.fetch_keys(
        b"#idx#",
        &EndKey::Open,
        Vec::new(),
        |mut acc: Vec<Record>, r| {
            acc.push(r);
            acc
        },
        None,
    )?;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].0, idx_key);
    Ok(())
}

#[test]
fn range_fold_emits_each_key_once_with_highest_sqn() -> Result<()> {
    let dir = tempdir()?;
    let mut p = Penciller::open(dir.path(), test_config())?;

    let (tree, next) = batch([1, 2, 3], 1);
    p.push_mem(tree)?;
    // Overwrite key 2 in a later batch.
    p.push_mem(single(&key(2), next))?;

    let records = p.fetch_keys(
        &key(0),
        &EndKey::Inclusive(key(9)),
        Vec::new(),
        |mut acc: Vec<Record>, r| {
            acc.push(r);
            acc
        },
        None,
    )?;

    let got: Vec<(Key, u64)> = records.into_iter().map(|(k, v)| (k, v.sqn)).collect();
    assert_eq!(
        got,
        vec![(key(1), 1), (key(2), next), (key(3), 3)],
        "ascending keys, shadowed sqn dropped"
    );
    Ok(())
}

#[test]
fn range_fold_spans_cache_and_levels() -> Result<()> {
    let dir = tempdir()?;
    let mut p = Penciller::open(dir.path(), test_config())?;

    // First wave lands in files.
    let next_sqn = fill(&mut p, &(0..15u64).collect::<Vec<_>>(), 1);
    settle(&mut p);
    // Second wave overwrites a few keys and stays cached.
    let (tree, _) = batch([3, 4], next_sqn);
    push_retrying(&mut p, tree);

    let records = p.fetch_keys(
        &key(0),
        &EndKey::Inclusive(key(6)),
        Vec::new(),
        |mut acc: Vec<Record>, r| {
            acc.push(r);
            acc
        },
        None,
    )?;
    assert_eq!(records.len(), 7, "keys 0..=6 exactly once each");
    assert!(records.windows(2).all(|w| w[0].0 < w[1].0), "ascending order");
    let by_key: BTreeMap<Key, u64> = records.into_iter().map(|(k, v)| (k, v.sqn)).collect();
    assert_eq!(by_key[&key(3)], next_sqn, "cache shadows files");
    assert_eq!(by_key[&key(4)], next_sqn + 1);
    assert_eq!(by_key[&key(5)], 6, "untouched key keeps its file sqn");
    Ok(())
}

#[test]
fn tombstones_are_emitted_to_the_fold_fn() -> Result<()> {
    let dir = tempdir()?;
    let mut p = Penciller::open(dir.path(), test_config())?;

    let mut tree = BTreeMap::new();
    tree.insert(key(1), Value::active(1, vec![]));
    tree.insert(key(2), Value::tombstone(2));
    p.push_mem(tree)?;

    let records = p.fetch_keys(
        &key(0),
        &EndKey::Open,
        Vec::new(),
        |mut acc: Vec<Record>, r| {
            acc.push(r);
            acc
        },
        None,
    )?;
    assert_eq!(records.len(), 2);
    assert!(records[1].1.is_tombstone());
    Ok(())
}

#[test]
fn fetch_next_key_walks_strictly_ascending() -> Result<()> {
    let dir = tempdir()?;
    let mut p = Penciller::open(dir.path(), test_config())?;

    let (tree, _) = batch([0, 1, 2, 3, 4, 5, 6, 7, 8, 9], 1);
    p.push_mem(tree)?;

    let mut seen: Vec<Key> = Vec::new();
    let mut start: Key = Vec::new();
    while let Some((k, _)) = p.fetch_next_key(&start, &EndKey::Open)? {
        if let Some(last) = seen.last() {
            assert!(k > *last, "strictly ascending, no duplicates");
        }
        // Successor key: smallest key greater than k.
        start = k.clone();
        start.push(0);
        seen.push(k);
    }
    assert_eq!(seen.len(), 10);
    assert_eq!(seen[0], key(0));
    assert_eq!(seen[9], key(9));
    Ok(())
}

// Keyfolder behaviour over hand-built query arrays.

fn file_with(dir: &std::path::Path, name: &str, records: Vec<(Vec<u8>, Value)>) -> Arc<SstReader> {
    let n = records.len();
    SstWriter::write(dir, name, n, records.into_iter()).unwrap();
    Arc::new(SstReader::open(dir, name).unwrap())
}

#[test]
fn keyfolder_resolves_level_ties_by_highest_sqn() -> Result<()> {
    let dir = tempdir()?;
    // Level 2 holds K1@5 and K5@4, level 3 holds K3@3, level 5 holds K5@2.
    let f2 = file_with(
        dir.path(),
        "2.sst",
        vec![
            (b"K1".to_vec(), Value::active(5, vec![])),
            (b"K5".to_vec(), Value::active(4, vec![])),
        ],
    );
    let f3 = file_with(
        dir.path(),
        "3.sst",
        vec![(b"K3".to_vec(), Value::active(3, vec![]))],
    );
    let f5 = file_with(
        dir.path(),
        "5.sst",
        vec![(b"K5".to_vec(), Value::active(2, vec![]))],
    );

    let levels = vec![
        vec![SstPointer::whole(f2)],
        vec![SstPointer::whole(f3)],
        vec![SstPointer::whole(f5)],
    ];
    let mut folder = KeyFolder::new(Vec::new(), levels, EndKey::Open);

    let mut out = Vec::new();
    while let Some((k, v)) = folder.next_record()? {
        out.push((k, v.sqn));
    }
    assert_eq!(
        out,
        vec![
            (b"K1".to_vec(), 5),
            (b"K3".to_vec(), 3),
            (b"K5".to_vec(), 4),
        ],
        "K5 keeps the higher of its two sqns and the loser is dropped"
    );
    Ok(())
}

#[test]
fn keyfolder_in_memory_run_shadows_files() -> Result<()> {
    let dir = tempdir()?;
    let file = file_with(
        dir.path(),
        "q.sst",
        vec![
            (b"K1".to_vec(), Value::active(5, vec![])),
            (b"K3".to_vec(), Value::active(3, vec![])),
            (b"K5".to_vec(), Value::active(2, vec![])),
        ],
    );

    let imm: Vec<Record> = vec![
        (b"K1".to_vec(), Value::active(8, vec![])),
        (b"K6".to_vec(), Value::active(7, vec![])),
        (b"K8".to_vec(), Value::active(9, vec![])),
    ];
    let mut folder = KeyFolder::new(
        imm,
        vec![vec![SstPointer::whole(file)]],
        EndKey::Inclusive(b"K6".to_vec()),
    );

    let mut out = Vec::new();
    while let Some((k, v)) = folder.next_record()? {
        out.push((k, v.sqn));
    }
    assert_eq!(
        out,
        vec![
            (b"K1".to_vec(), 8),
            (b"K3".to_vec(), 3),
            (b"K5".to_vec(), 2),
            (b"K6".to_vec(), 7),
        ],
        "in-memory K1 wins, K8 is past the bound"
    );
    Ok(())
}

#[test]
fn keyfolder_respects_max_emission() -> Result<()> {
    let dir = tempdir()?;
    let file = file_with(
        dir.path(),
        "m.sst",
        vec![
            (b"a".to_vec(), Value::active(1, vec![])),
            (b"b".to_vec(), Value::active(2, vec![])),
            (b"c".to_vec(), Value::active(3, vec![])),
        ],
    );
    let mut folder = KeyFolder::new(Vec::new(), vec![vec![SstPointer::whole(file)]], EndKey::Open);
    let collected = folder.fold(
        Vec::new(),
        |mut acc: Vec<Record>, r| {
            acc.push(r);
            acc
        },
        Some(2),
    )?;
    assert_eq!(collected.len(), 2);
    Ok(())
}
