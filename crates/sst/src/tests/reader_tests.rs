use crate::tests::record;
use crate::{SstPointer, SstReader, SstWriter};
use anyhow::Result;
use keycodec::{magic_hash, EndKey, KeyHash, Value};
use std::sync::Arc;
use tempfile::tempdir;

fn write_and_open(dir: &std::path::Path, n: u64) -> Result<Arc<SstReader>> {
    let records: Vec<_> = (0..n).map(|i| record(i, i + 1)).collect();
    SstWriter::write(dir, "7_2_0.sst", n as usize, records.into_iter())?;
    Ok(Arc::new(SstReader::open(dir, "7_2_0.sst")?))
}

#[test]
fn open_exposes_range_count_and_max_sqn() -> Result<()> {
    let dir = tempdir()?;
    let reader = write_and_open(dir.path(), 100)?;
    assert_eq!(reader.start_key(), b"k000000");
    assert_eq!(reader.end_key(), b"k000099");
    assert_eq!(reader.len(), 100);
    assert_eq!(reader.max_sqn(), 100);
    Ok(())
}

#[test]
fn get_finds_present_keys_and_misses_absent_ones() -> Result<()> {
    let dir = tempdir()?;
    let reader = write_and_open(dir.path(), 40)?;

    let key = b"k000017";
    let value = reader.get(key, magic_hash(key))?.expect("key present");
    assert_eq!(value.sqn, 18);

    let missing = b"k999999";
    assert!(reader.get(missing, magic_hash(missing))?.is_none());
    Ok(())
}

#[test]
fn get_returns_tombstones_rather_than_hiding_them() -> Result<()> {
    let dir = tempdir()?;
    let records = vec![
        (b"alive".to_vec(), Value::active(1, b"m".to_vec())),
        (b"dead".to_vec(), Value::tombstone(2)),
    ];
    SstWriter::write(dir.path(), "3_1_0.sst", 2, records.into_iter())?;
    let reader = SstReader::open(dir.path(), "3_1_0.sst")?;

    let v = reader.get(b"dead", magic_hash(b"dead"))?.unwrap();
    assert!(v.is_tombstone());
    Ok(())
}

#[test]
fn get_with_wrong_hash_can_shortcut_but_never_lies() -> Result<()> {
    // A hash that was never inserted may be gated out; what matters is
    // that a present key probed with its own hash is always found.
    let dir = tempdir()?;
    let reader = write_and_open(dir.path(), 10)?;
    for i in 0..10u64 {
        let key = format!("k{:06}", i).into_bytes();
        assert!(reader.get(&key, magic_hash(&key))?.is_some());
    }
    Ok(())
}

#[test]
fn get_without_hash_skips_the_gate() -> Result<()> {
    let dir = tempdir()?;
    let reader = write_and_open(dir.path(), 10)?;
    let key = b"k000003";
    assert!(reader.get(key, KeyHash::NoLookup)?.is_some());
    Ok(())
}

#[test]
fn pointer_expansion_walks_a_range_in_order() -> Result<()> {
    let dir = tempdir()?;
    let reader = write_and_open(dir.path(), 30)?;

    let mut pointer = Some(SstPointer::new(
        Arc::clone(&reader),
        b"k000010",
        &EndKey::inclusive(b"k000019"),
    ));
    let mut seen = Vec::new();
    while let Some(p) = pointer {
        let (records, rest) = p.expand(4)?;
        seen.extend(records.into_iter().map(|(k, _)| k));
        pointer = rest;
    }
    let expected: Vec<_> = (10..20u64)
        .map(|i| format!("k{:06}", i).into_bytes())
        .collect();
    assert_eq!(seen, expected);
    Ok(())
}

#[test]
fn pointer_with_start_past_end_key_is_empty() -> Result<()> {
    let dir = tempdir()?;
    let reader = write_and_open(dir.path(), 5)?;
    let (records, rest) =
        SstPointer::new(Arc::clone(&reader), b"k999999", &EndKey::Open).expand(4)?;
    assert!(records.is_empty());
    assert!(rest.is_none());
    Ok(())
}

#[test]
fn whole_file_pointer_covers_every_record() -> Result<()> {
    let dir = tempdir()?;
    let reader = write_and_open(dir.path(), 9)?;
    let (records, rest) = SstPointer::whole(Arc::clone(&reader)).expand(100)?;
    assert_eq!(records.len(), 9);
    assert!(rest.is_none());
    Ok(())
}

#[test]
fn open_rejects_truncated_files() -> Result<()> {
    let dir = tempdir()?;
    write_and_open(dir.path(), 20)?;
    let path = dir.path().join("7_2_0.sst");
    let bytes = std::fs::read(&path)?;
    std::fs::write(&path, &bytes[..bytes.len() / 2])?;
    assert!(SstReader::open(dir.path(), "7_2_0.sst").is_err());
    Ok(())
}

#[test]
fn corrupted_record_fails_crc_on_read() -> Result<()> {
    let dir = tempdir()?;
    write_and_open(dir.path(), 20)?;
    let path = dir.path().join("7_2_0.sst");
    let mut bytes = std::fs::read(&path)?;
    // Flip a byte early in the data section, past the first record's CRC.
    bytes[12] ^= 0xFF;
    std::fs::write(&path, &bytes)?;

    let reader = SstReader::open(dir.path(), "7_2_0.sst")?;
    let key = b"k000000";
    assert!(reader.get(key, magic_hash(key)).is_err());
    Ok(())
}
