//! # SST - Immutable Sorted Ledger Files
//!
//! On-disk sorted string tables for the penciller. A file is written once
//! (by a flush or a level merge) and read many times, by the live manifest
//! and by any snapshots pinning it.
//!
//! ## File Layout
//!
//! ```text
//! [DATA]   repeated: crc32(u32) | key_len(u32) | key | value bytes
//! [GATE]   hash gate bitmap built from the keys' magic hashes
//! [INDEX]  repeated: key_len(u32) | key | data_offset(u64), ascending keys
//! [FOOTER] max_sqn(u64) | gate_offset(u64) | index_offset(u64) | magic(u32)
//! ```
//!
//! The per-record CRC32 covers everything after itself (key_len through the
//! end of the value), catching silent disk corruption on reads. The footer
//! stores the file's maximum SQN so startup recovery never scans data.
//!
//! ## Crash Safety
//!
//! Files are written to `<name>.sst.tmp`, fsynced, and renamed into place;
//! a crash mid-write leaves a temp file that recovery ignores.
//!
//! ## Reading
//!
//! [`SstReader::open`] loads the index and the hash gate into memory and
//! keeps one file handle for the reader's lifetime. Point lookups are a
//! gate check plus one seek; range scans hand out [`SstPointer`]s that
//! fault records in a few at a time.

mod format;
mod gate;
mod levelzero;
mod reader;
mod writer;

pub use gate::HashGate;
pub use levelzero::{spawn_levelzero, LevelZeroBuild, LevelZeroResult};
pub use reader::{SstPointer, SstReader};
pub use writer::SstWriter;

use std::path::Path;

/// Maximum key size read back from disk (64 KiB). Guards against corrupt
/// length fields.
pub(crate) const MAX_KEY_BYTES: usize = 64 * 1024;

/// Removes a file once the pending-delete protocol has cleared it.
///
/// The caller is responsible for having checked that no live manifest and
/// no registered snapshot can still observe the file.
pub fn delete_confirmed(dir: &Path, filename: &str) -> std::io::Result<()> {
    std::fs::remove_file(dir.join(filename))
}

#[cfg(test)]
mod tests;
