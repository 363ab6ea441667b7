use anyhow::{bail, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use keycodec::{encode_value, magic_hash, Key, KeyHash, Record};
use std::fs::{rename, OpenOptions};
use std::io::{BufWriter, Seek, Write};
use std::path::Path;

use crate::format::write_footer;
use crate::gate::HashGate;

/// Writes a sorted record stream to disk as an immutable SST file.
///
/// The writer is stateless; all work happens in the single static method
/// [`write`](SstWriter::write). The write is crash-safe: data goes to a
/// temporary file, is fsynced, and is then atomically renamed to the final
/// name.
pub struct SstWriter {}

impl SstWriter {
    /// Writes `iter` to `dir/filename`, returning the file's key range.
    ///
    /// # Arguments
    ///
    /// * `dir` - directory the file lands in (created by the caller).
    /// * `filename` - final basename, conventionally `<sqn>_<level>_<n>.sst`.
    /// * `expected_count` - estimated record count, used to size the hash
    ///   gate. Over-estimating is safe.
    /// * `iter` - records in strictly ascending key order, at most one
    ///   record per key. The caller is responsible for deduplication.
    ///
    /// # Errors
    ///
    /// Returns an error if the iterator yields no records, if keys arrive
    /// out of order, or on any I/O failure.
    pub fn write<I>(
        dir: &Path,
        filename: &str,
        expected_count: usize,
        iter: I,
    ) -> Result<(Key, Key)>
    where
        I: Iterator<Item = Record>,
    {
        let path = dir.join(filename);
        let tmp_path = path.with_extension("sst.tmp");
        let raw_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut file = BufWriter::new(raw_file);

        let mut gate = HashGate::with_capacity(expected_count.max(1));
        let mut index: Vec<(Key, u64)> = Vec::new();
        let mut max_sqn: u64 = 0;
        let mut record_buf: Vec<u8> = Vec::with_capacity(256);

        for (key, value) in iter {
            if let Some((last, _)) = index.last() {
                if *last >= key {
                    bail!("SST writer given out-of-order key");
                }
            }
            max_sqn = max_sqn.max(value.sqn);

            record_buf.clear();
            record_buf.write_u32::<LittleEndian>(key.len() as u32)?;
            record_buf.extend_from_slice(&key);
            encode_value(&value, &mut record_buf);

            let mut hasher = Crc32::new();
            hasher.update(&record_buf);
            let crc = hasher.finalize();

            let offset = file.stream_position()?;
            file.write_u32::<LittleEndian>(crc)?;
            file.write_all(&record_buf)?;

            if let KeyHash::Lookup(h) = magic_hash(&key) {
                gate.insert(h);
            }
            index.push((key, offset));
        }

        if index.is_empty() {
            drop(file);
            let _ = std::fs::remove_file(&tmp_path);
            bail!("refusing to write an empty SST file");
        }

        let gate_offset = file.stream_position()?;
        gate.write_to(&mut file)?;

        let index_offset = file.stream_position()?;
        for (key, data_offset) in &index {
            file.write_u32::<LittleEndian>(key.len() as u32)?;
            file.write_all(key)?;
            file.write_u64::<LittleEndian>(*data_offset)?;
        }

        write_footer(&mut file, max_sqn, gate_offset, index_offset)?;

        file.flush()?;
        file.into_inner()?.sync_all()?;
        rename(&tmp_path, &path)?;

        // Make the rename durable; on ext4/XFS a crash after rename but
        // before a directory sync can lose the entry.
        if let Ok(d) = std::fs::File::open(dir) {
            let _ = d.sync_all();
        }

        let start_key = index.first().map(|(k, _)| k.clone()).unwrap_or_default();
        let end_key = index.last().map(|(k, _)| k.clone()).unwrap_or_default();
        Ok((start_key, end_key))
    }
}
