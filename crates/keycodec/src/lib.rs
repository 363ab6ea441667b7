//! # Keycodec - Ledger Key/Value Model and Codec
//!
//! The shared data model for the penciller and its SST files, plus the
//! comparisons the merged read path is built on.
//!
//! ## Key properties
//! - **Keys are opaque byte strings** in total bytewise order. Keys with the
//!   reserved `#idx#` prefix are index entries: they are never point-looked
//!   and their [`magic_hash`] is [`KeyHash::NoLookup`].
//! - **Values carry a sequence number** (SQN) assigned by the upstream
//!   journal. A higher SQN shadows a lower one for the same key. The rest of
//!   the value (status, cached hash, metadata) is opaque payload to the
//!   layers above.
//! - **Tombstones are values**, not absences. A tombstone at SQN `s` shadows
//!   any live value at SQN ≤ `s` during reads and merges.
//!
//! ## Example
//! ```rust
//! use keycodec::{magic_hash, KeyHash, Value};
//!
//! let v = Value::active(7, b"meta".to_vec());
//! assert_eq!(v.sqn, 7);
//! assert!(matches!(magic_hash(b"bucket1/keyA"), KeyHash::Lookup(_)));
//! assert!(matches!(magic_hash(b"#idx#bucket1/f"), KeyHash::NoLookup));
//! ```

use anyhow::{bail, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use std::cmp::Ordering;
use std::io::Read;

/// An opaque, totally ordered ledger key.
pub type Key = Vec<u8>;

/// Reserved prefix marking index entries. Such keys are reachable through
/// range folds only and decline to hash.
pub const INDEX_PREFIX: &[u8] = b"#idx#";

/// Upper bound on metadata decoded from disk (1 MiB). Prevents OOM on
/// corrupt length fields.
const MAX_METADATA_BYTES: usize = 1024 * 1024;

/// Liveness status of a ledger value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    /// A live value, optionally with an expiry timestamp.
    Active {
        /// Expiry as seconds since the epoch, `None` for no expiry.
        ttl: Option<u64>,
    },
    /// A deletion marker. Shadows older values at equal or lower SQN.
    Tombstone,
}

/// The value half of a ledger record.
///
/// The penciller core reads only [`sqn`](Value::sqn) (through
/// [`strip_to_sqn`]); `status`, `hash`, and `metadata` travel through the
/// system untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value {
    /// Monotonic logical timestamp assigned by the upstream journal.
    pub sqn: u64,
    /// Live-or-tombstone status.
    pub status: Status,
    /// Cached magic hash of the key, when the writer had it to hand.
    pub hash: Option<u32>,
    /// Opaque payload metadata (object size, index term, and the like).
    pub metadata: Vec<u8>,
}

impl Value {
    /// A live value with no expiry.
    pub fn active(sqn: u64, metadata: Vec<u8>) -> Self {
        Self {
            sqn,
            status: Status::Active { ttl: None },
            hash: None,
            metadata,
        }
    }

    /// A deletion marker.
    pub fn tombstone(sqn: u64) -> Self {
        Self {
            sqn,
            status: Status::Tombstone,
            hash: None,
            metadata: Vec::new(),
        }
    }

    /// Returns `true` for deletion markers.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        matches!(self.status, Status::Tombstone)
    }
}

/// Extracts the sequence number from a value.
///
/// This is the only part of a value the penciller core interprets.
#[must_use]
pub fn strip_to_sqn(value: &Value) -> u64 {
    value.sqn
}

/// A single ledger record.
pub type Record = (Key, Value);

// ---------------------------------------------------------------------------
// Magic hash
// ---------------------------------------------------------------------------

/// Outcome of hashing a key for point lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyHash {
    /// A 32-bit hash usable for cache buckets and SST hash gates.
    Lookup(u32),
    /// The key declines to hash and cannot be point-looked.
    NoLookup,
}

impl KeyHash {
    /// Returns the hash for point-lookable keys, `None` otherwise.
    #[must_use]
    pub fn lookup(self) -> Option<u32> {
        match self {
            KeyHash::Lookup(h) => Some(h),
            KeyHash::NoLookup => None,
        }
    }
}

/// Hashes a key for the point-lookup path.
///
/// Index entries (keys carrying [`INDEX_PREFIX`]) return
/// [`KeyHash::NoLookup`]; everything else gets a 32-bit multiplicative
/// hash. The same function feeds the L0 cache index and the per-file hash
/// gates, so a record written with one is always findable with the other.
#[must_use]
pub fn magic_hash(key: &[u8]) -> KeyHash {
    if key.starts_with(INDEX_PREFIX) {
        return KeyHash::NoLookup;
    }
    let mut h: u32 = 5381;
    for &b in key {
        h = h.wrapping_mul(33) ^ u32::from(b);
    }
    KeyHash::Lookup(h)
}

// ---------------------------------------------------------------------------
// Range bounds
// ---------------------------------------------------------------------------

/// Upper bound of a key range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndKey {
    /// No upper bound.
    Open,
    /// Inclusive upper bound.
    Inclusive(Key),
}

impl EndKey {
    /// Inclusive bound from a borrowed key.
    pub fn inclusive(key: &[u8]) -> Self {
        EndKey::Inclusive(key.to_vec())
    }
}

/// Returns `true` when `key` lies beyond the range's upper bound.
#[must_use]
pub fn endkey_passed(end: &EndKey, key: &[u8]) -> bool {
    match end {
        EndKey::Open => false,
        EndKey::Inclusive(e) => key > e.as_slice(),
    }
}

// ---------------------------------------------------------------------------
// Dominance
// ---------------------------------------------------------------------------

/// Result of comparing two records during a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dominance {
    /// The left key sorts first; emit left, keep right.
    LeftFirst,
    /// The right key sorts first; emit right, keep left.
    RightFirst,
    /// Same key, left record wins; the right record is shadowed.
    LeftDominant,
    /// Same key, right record wins; the left record is shadowed.
    RightDominant,
}

/// Merge comparator for two records.
///
/// Ordering is by key; on equal keys the higher SQN wins, with the left
/// side winning a tie at equal SQN. Merges place their newer source on the
/// left (the in-memory cache against files, an upper level against the one
/// below), so equal-SQN ties resolve toward fresher data.
#[must_use]
pub fn key_dominates(left: &Record, right: &Record) -> Dominance {
    match left.0.cmp(&right.0) {
        Ordering::Less => Dominance::LeftFirst,
        Ordering::Greater => Dominance::RightFirst,
        Ordering::Equal => {
            if left.1.sqn >= right.1.sqn {
                Dominance::LeftDominant
            } else {
                Dominance::RightDominant
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Binary value codec
// ---------------------------------------------------------------------------

// Status tags on disk.
const TAG_TOMBSTONE: u8 = 0;
const TAG_ACTIVE: u8 = 1;
const TAG_ACTIVE_TTL: u8 = 2;

/// Appends the binary encoding of `value` to `buf`.
///
/// Layout (little-endian):
///
/// ```text
/// [sqn: u64][status: u8][ttl: u64 when status = 2]
/// [has_hash: u8][hash: u32 when has_hash = 1]
/// [meta_len: u32][metadata]
/// ```
pub fn encode_value(value: &Value, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&value.sqn.to_le_bytes());
    match value.status {
        Status::Tombstone => buf.push(TAG_TOMBSTONE),
        Status::Active { ttl: None } => buf.push(TAG_ACTIVE),
        Status::Active { ttl: Some(t) } => {
            buf.push(TAG_ACTIVE_TTL);
            buf.extend_from_slice(&t.to_le_bytes());
        }
    }
    match value.hash {
        Some(h) => {
            buf.push(1);
            buf.extend_from_slice(&h.to_le_bytes());
        }
        None => buf.push(0),
    }
    buf.extend_from_slice(&(value.metadata.len() as u32).to_le_bytes());
    buf.extend_from_slice(&value.metadata);
}

/// Decodes one value from `r`.
///
/// # Errors
///
/// Returns an error on truncated input, an unknown status tag, or a
/// metadata length past the corruption guard.
pub fn decode_value<R: Read>(r: &mut R) -> Result<Value> {
    let sqn = r.read_u64::<LittleEndian>()?;
    let status = match r.read_u8()? {
        TAG_TOMBSTONE => Status::Tombstone,
        TAG_ACTIVE => Status::Active { ttl: None },
        TAG_ACTIVE_TTL => Status::Active {
            ttl: Some(r.read_u64::<LittleEndian>()?),
        },
        other => bail!("unknown value status tag {}", other),
    };
    let hash = match r.read_u8()? {
        0 => None,
        1 => Some(r.read_u32::<LittleEndian>()?),
        other => bail!("unknown hash flag {}", other),
    };
    let meta_len = r.read_u32::<LittleEndian>()? as usize;
    if meta_len > MAX_METADATA_BYTES {
        bail!(
            "corrupt value: metadata length {} exceeds maximum {}",
            meta_len,
            MAX_METADATA_BYTES
        );
    }
    let mut metadata = vec![0u8; meta_len];
    r.read_exact(&mut metadata)?;
    Ok(Value {
        sqn,
        status,
        hash,
        metadata,
    })
}
