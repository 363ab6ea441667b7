//! Footer constants and read/write helpers for the ledger SST format.
//!
//! The footer is fixed-size and lives at the end of the file:
//!
//! ```text
//! [max_sqn: u64 LE][gate_offset: u64 LE][index_offset: u64 LE][magic: u32 LE]
//! ```
//!
//! The magic doubles as a format version; a future layout change gets a new
//! magic and a match arm here rather than an in-band version byte.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Seek, SeekFrom, Write};

/// Magic number identifying ledger SST files (ASCII "LSST").
pub const SST_MAGIC: u32 = 0x4C53_5354;

/// Footer size in bytes: 8 (`max_sqn`) + 8 (`gate_offset`) + 8 (`index_offset`) + 4 (`magic`).
pub const FOOTER_BYTES: u64 = 8 + 8 + 8 + 4;

/// Parsed SST footer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    /// Highest SQN of any record in the file.
    pub max_sqn: u64,
    /// Byte offset of the hash-gate section.
    pub gate_offset: u64,
    /// Byte offset of the index section.
    pub index_offset: u64,
}

/// Writes the footer to `w`.
pub fn write_footer<W: Write>(
    w: &mut W,
    max_sqn: u64,
    gate_offset: u64,
    index_offset: u64,
) -> io::Result<()> {
    w.write_u64::<LittleEndian>(max_sqn)?;
    w.write_u64::<LittleEndian>(gate_offset)?;
    w.write_u64::<LittleEndian>(index_offset)?;
    w.write_u32::<LittleEndian>(SST_MAGIC)?;
    Ok(())
}

/// Reads and validates the footer, leaving the cursor at end of file.
pub fn read_footer<R: Read + Seek>(r: &mut R) -> io::Result<Footer> {
    let filesize = r.seek(SeekFrom::End(0))?;
    if filesize < FOOTER_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "file too small for SST footer",
        ));
    }
    r.seek(SeekFrom::End(-(FOOTER_BYTES as i64)))?;
    let max_sqn = r.read_u64::<LittleEndian>()?;
    let gate_offset = r.read_u64::<LittleEndian>()?;
    let index_offset = r.read_u64::<LittleEndian>()?;
    let magic = r.read_u32::<LittleEndian>()?;
    if magic != SST_MAGIC {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown SST magic: {:#x}", magic),
        ));
    }
    if gate_offset >= filesize || index_offset >= filesize || gate_offset > index_offset {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "SST footer offsets out of range",
        ));
    }
    Ok(Footer {
        max_sqn,
        gate_offset,
        index_offset,
    })
}
