//! Per-file hash gate: a small bitmap over the keys' magic hashes that lets
//! point lookups skip files which definitely do not hold the key.
//!
//! Three probe positions are derived from the single 32-bit magic hash by
//! rotation, so the gate needs no access to key bytes. Index entries carry
//! no hash and are never inserted; they are only reachable through range
//! scans, which bypass the gate.

use anyhow::{bail, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// Bits allocated per expected key. Ten bits with three probes keeps the
/// false-positive rate around one percent.
const BITS_PER_KEY: usize = 10;

/// Smallest gate allocated, so tiny files still get a usable bitmap.
const MIN_BITS: usize = 64;

/// Largest gate accepted when reading back from disk (guards corrupt sizes).
const MAX_BITS: usize = 1 << 30;

/// A fixed-size bitmap keyed by magic hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashGate {
    /// Bit count; always a power of two so probes mask rather than mod.
    nbits: u32,
    bits: Vec<u8>,
}

impl HashGate {
    /// Creates a gate sized for `expected` keys.
    #[must_use]
    pub fn with_capacity(expected: usize) -> Self {
        let nbits = (expected.saturating_mul(BITS_PER_KEY))
            .next_power_of_two()
            .clamp(MIN_BITS, MAX_BITS) as u32;
        Self {
            nbits,
            bits: vec![0u8; nbits as usize / 8],
        }
    }

    fn probes(hash: u32) -> [u32; 3] {
        [hash, hash.rotate_left(11), hash.rotate_left(22)]
    }

    /// Records a key's magic hash.
    pub fn insert(&mut self, hash: u32) {
        let mask = self.nbits - 1;
        for p in Self::probes(hash) {
            let bit = p & mask;
            self.bits[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    /// Returns `false` only when no key with this hash was inserted.
    #[must_use]
    pub fn may_contain(&self, hash: u32) -> bool {
        let mask = self.nbits - 1;
        Self::probes(hash).iter().all(|p| {
            let bit = p & mask;
            self.bits[(bit / 8) as usize] & (1 << (bit % 8)) != 0
        })
    }

    /// Serializes the gate as `[nbits: u32][bitmap bytes]`.
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.nbits)?;
        w.write_all(&self.bits)
    }

    /// Reads a gate written by [`write_to`](HashGate::write_to).
    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let nbits = r.read_u32::<LittleEndian>()?;
        if !nbits.is_power_of_two() || nbits < MIN_BITS as u32 || nbits > MAX_BITS as u32 {
            bail!("corrupt hash gate: bad bit count {}", nbits);
        }
        let mut bits = vec![0u8; nbits as usize / 8];
        r.read_exact(&mut bits)?;
        Ok(Self { nbits, bits })
    }
}
