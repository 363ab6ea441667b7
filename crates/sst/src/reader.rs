use anyhow::{bail, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use crc32fast::Hasher as Crc32;
use keycodec::{decode_value, endkey_passed, EndKey, Key, KeyHash, Record, Value};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::format::{read_footer, Footer};
use crate::gate::HashGate;
use crate::MAX_KEY_BYTES;

/// Reads an immutable SST file.
///
/// On [`open`](SstReader::open) the whole index is loaded into memory as a
/// sorted `Vec<(Key, u64)>` (key and data-section offset) along with the
/// hash gate. The sorted vector serves both point lookups (binary search)
/// and positional range pointers.
///
/// One file handle is kept for the reader's lifetime, behind a `Mutex` so
/// `get` works through a shared reference. Readers are shared as
/// `Arc<SstReader>` between the live manifest and any pinning snapshots;
/// the handle closes when the last holder drops.
pub struct SstReader {
    #[allow(dead_code)]
    path: PathBuf,
    filename: String,
    /// Sorted key → data offset pairs.
    index: Vec<(Key, u64)>,
    gate: HashGate,
    file: Mutex<BufReader<File>>,
    footer: Footer,
}

impl SstReader {
    /// Opens `dir/filename` and loads its index and hash gate.
    ///
    /// # Errors
    ///
    /// Returns an error when the footer is malformed, the index is corrupt,
    /// the file holds no records, or I/O fails.
    pub fn open(dir: &Path, filename: &str) -> Result<Self> {
        let path = dir.join(filename);
        let mut f = File::open(&path)
            .with_context(|| format!("failed to open SST file {}", path.display()))?;
        let filesize = f.metadata()?.len();

        let footer = read_footer(&mut f)?;

        f.seek(SeekFrom::Start(footer.gate_offset))?;
        let gate = HashGate::read_from(&mut f)?;

        f.seek(SeekFrom::Start(footer.index_offset))?;
        let index_end = filesize - crate::format::FOOTER_BYTES;
        let mut index: Vec<(Key, u64)> = Vec::new();
        while f.stream_position()? < index_end {
            let key_len = f.read_u32::<LittleEndian>()? as usize;
            if key_len > MAX_KEY_BYTES {
                bail!(
                    "corrupt index: key_len {} exceeds maximum {}",
                    key_len,
                    MAX_KEY_BYTES
                );
            }
            let mut key = vec![0u8; key_len];
            f.read_exact(&mut key)?;
            let data_offset = f.read_u64::<LittleEndian>()?;
            if let Some((last, _)) = index.last() {
                if *last >= key {
                    bail!("corrupt index: keys out of order");
                }
            }
            index.push((key, data_offset));
        }
        if index.is_empty() {
            bail!("SST file {} holds no records", filename);
        }

        f.seek(SeekFrom::Start(0))?;
        Ok(Self {
            path,
            filename: filename.to_string(),
            index,
            gate,
            file: Mutex::new(BufReader::new(f)),
            footer,
        })
    }

    /// Point lookup for a single key.
    ///
    /// When `hash` carries a lookup hash the gate is consulted first; a
    /// negative gate means the key is definitely absent and no I/O happens.
    /// Returns `Ok(Some(value))` for present keys (tombstones included),
    /// `Ok(None)` when the key is not in this file.
    pub fn get(&self, key: &[u8], hash: KeyHash) -> Result<Option<Value>> {
        if let KeyHash::Lookup(h) = hash {
            if !self.gate.may_contain(h) {
                return Ok(None);
            }
        }
        let pos = match self.index.binary_search_by(|(k, _)| k.as_slice().cmp(key)) {
            Ok(p) => p,
            Err(_) => return Ok(None),
        };
        let (found_key, value) = self.read_record_at(self.index[pos].1)?;
        if found_key != key {
            bail!("index pointed at mismatching key in {}", self.filename);
        }
        Ok(Some(value))
    }

    /// Reads and CRC-verifies one record at `offset`.
    fn read_record_at(&self, offset: u64) -> Result<Record> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| anyhow::anyhow!("reader lock poisoned: {}", e))?;
        f.seek(SeekFrom::Start(offset))?;

        let stored_crc = f.read_u32::<LittleEndian>()?;
        let key_len = f.read_u32::<LittleEndian>()? as usize;
        if key_len > MAX_KEY_BYTES {
            bail!(
                "corrupt record: key_len {} exceeds maximum {}",
                key_len,
                MAX_KEY_BYTES
            );
        }
        let mut key = vec![0u8; key_len];
        f.read_exact(&mut key)?;
        let value = decode_value(&mut *f)?;

        let mut body = Vec::with_capacity(4 + key.len() + 32);
        body.extend_from_slice(&(key_len as u32).to_le_bytes());
        body.extend_from_slice(&key);
        keycodec::encode_value(&value, &mut body);
        let mut hasher = Crc32::new();
        hasher.update(&body);
        if hasher.finalize() != stored_crc {
            bail!(
                "CRC mismatch at offset {} in {} (data corruption)",
                offset,
                self.filename
            );
        }
        Ok((key, value))
    }

    /// Smallest key in the file.
    #[must_use]
    pub fn start_key(&self) -> &[u8] {
        &self.index[0].0
    }

    /// Largest key in the file.
    #[must_use]
    pub fn end_key(&self) -> &[u8] {
        &self.index[self.index.len() - 1].0
    }

    /// Highest SQN of any record in the file, straight from the footer.
    #[must_use]
    pub fn max_sqn(&self) -> u64 {
        self.footer.max_sqn
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// `true` when the file holds no records. Open files never are; kept
    /// for symmetry with `len`.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// The file's basename.
    #[must_use]
    pub fn filename(&self) -> &str {
        &self.filename
    }

}

impl std::fmt::Debug for SstReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SstReader")
            .field("filename", &self.filename)
            .field("records", &self.index.len())
            .field("max_sqn", &self.footer.max_sqn)
            .finish()
    }
}

/// A lazy cursor into one SST file's records within a key range.
///
/// Expanding a pointer faults in up to `width` concrete records and hands
/// back the remainder as a new pointer, so a k-way merge holds at most a
/// few records per source in memory.
#[derive(Debug, Clone)]
pub struct SstPointer {
    reader: Arc<SstReader>,
    pos: usize,
    end: EndKey,
}

impl SstPointer {
    /// A lazy pointer to `reader`'s records in `[start, end]`.
    ///
    /// The pointer starts at the first key ≥ `start` and stops once a key
    /// passes `end`. Resolving it costs one record read per expanded entry.
    #[must_use]
    pub fn new(reader: Arc<SstReader>, start: &[u8], end: &EndKey) -> Self {
        let pos = reader.index.partition_point(|(k, _)| k.as_slice() < start);
        Self {
            reader,
            pos,
            end: end.clone(),
        }
    }

    /// A pointer covering the whole file.
    #[must_use]
    pub fn whole(reader: Arc<SstReader>) -> Self {
        Self {
            reader,
            pos: 0,
            end: EndKey::Open,
        }
    }

    /// Resolves up to `width` records from the front of the pointer.
    ///
    /// Returns the records plus `Some(pointer)` when more remain, `None`
    /// when the file or the range is exhausted.
    pub fn expand(mut self, width: usize) -> Result<(Vec<Record>, Option<SstPointer>)> {
        let mut out = Vec::with_capacity(width.min(8));
        while out.len() < width {
            if self.pos >= self.reader.index.len() {
                return Ok((out, None));
            }
            let (key, offset) = {
                let (k, o) = &self.reader.index[self.pos];
                (k.clone(), *o)
            };
            if endkey_passed(&self.end, &key) {
                return Ok((out, None));
            }
            let (read_key, value) = self.reader.read_record_at(offset)?;
            debug_assert_eq!(read_key, key);
            out.push((read_key, value));
            self.pos += 1;
        }
        let more = self.pos < self.reader.index.len()
            && !endkey_passed(&self.end, &self.reader.index[self.pos].0);
        Ok((out, if more { Some(self) } else { None }))
    }
}
