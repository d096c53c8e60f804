//! Table binary format constants and header/entry read/write helpers.
//!
//! ## Header (8 bytes)
//!
//! ```text
//! [magic: u32 LE = "SIT1"][format_version: u32 LE]
//! ```
//!
//! ## Entry (20 bytes)
//!
//! ```text
//! [stream: u32 LE][version: i64 LE][position: i64 LE]
//! ```
//!
//! ## Trailer (4 bytes)
//!
//! ```text
//! [crc32: u32 LE]   covers header + every entry
//! ```

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use memtable::{IndexEntry, IndexError, Result};
use std::io::{self, Read, Write};
use std::path::Path;

/// Magic number identifying table files (ASCII "SIT1").
pub const TABLE_MAGIC: u32 = 0x5349_5431;

/// Current on-disk format version.
pub const TABLE_FORMAT_VERSION: u32 = 1;

/// Size of the header: 4 (`magic`) + 4 (`format_version`).
pub const HEADER_BYTES: u64 = 4 + 4;

/// Size of one entry: 4 (`stream`) + 8 (`version`) + 8 (`position`).
pub const ENTRY_BYTES: u64 = 4 + 8 + 8;

/// Size of the trailing checksum.
pub const CHECKSUM_BYTES: u64 = 4;

/// Byte offset of entry `index` within the file.
#[inline]
pub fn entry_offset(index: u64) -> u64 {
    HEADER_BYTES + index * ENTRY_BYTES
}

/// Writes the table header to `w`.
pub fn write_header<W: Write>(w: &mut W) -> io::Result<()> {
    w.write_u32::<LittleEndian>(TABLE_MAGIC)?;
    w.write_u32::<LittleEndian>(TABLE_FORMAT_VERSION)?;
    Ok(())
}

/// Reads and validates the header. A wrong marker or an unknown format
/// version is an [`IndexError::InvalidFormat`], never a silent fallback.
pub fn read_header<R: Read>(r: &mut R, path: &Path) -> Result<()> {
    let magic = r.read_u32::<LittleEndian>()?;
    if magic != TABLE_MAGIC {
        return Err(IndexError::InvalidFormat {
            path: path.to_path_buf(),
            reason: format!("unknown table magic: {:#010x}", magic),
        });
    }
    let version = r.read_u32::<LittleEndian>()?;
    if version != TABLE_FORMAT_VERSION {
        return Err(IndexError::InvalidFormat {
            path: path.to_path_buf(),
            reason: format!(
                "unsupported table format version {} (expected {})",
                version, TABLE_FORMAT_VERSION
            ),
        });
    }
    Ok(())
}

/// Serializes one entry into `w`.
pub fn write_entry<W: Write>(w: &mut W, entry: &IndexEntry) -> io::Result<()> {
    w.write_u32::<LittleEndian>(entry.stream)?;
    w.write_i64::<LittleEndian>(entry.version)?;
    w.write_i64::<LittleEndian>(entry.position)?;
    Ok(())
}

/// Deserializes one entry from `r`.
pub fn read_entry<R: Read>(r: &mut R) -> io::Result<IndexEntry> {
    let stream = r.read_u32::<LittleEndian>()?;
    let version = r.read_i64::<LittleEndian>()?;
    let position = r.read_i64::<LittleEndian>()?;
    Ok(IndexEntry {
        stream,
        version,
        position,
    })
}

/// Derives the entry count from the file size, rejecting files whose body is
/// not a whole number of entries.
pub fn entry_count(filesize: u64, path: &Path) -> Result<u64> {
    if filesize < HEADER_BYTES {
        return Err(IndexError::InvalidFormat {
            path: path.to_path_buf(),
            reason: format!("file too small for table header ({} bytes)", filesize),
        });
    }
    if filesize < HEADER_BYTES + CHECKSUM_BYTES {
        return Err(IndexError::CorruptIndex {
            path: path.to_path_buf(),
            reason: "missing checksum trailer".to_string(),
        });
    }
    let body = filesize - HEADER_BYTES - CHECKSUM_BYTES;
    if body % ENTRY_BYTES != 0 {
        return Err(IndexError::CorruptIndex {
            path: path.to_path_buf(),
            reason: format!("entry section of {} bytes is not a multiple of {}", body, ENTRY_BYTES),
        });
    }
    Ok(body / ENTRY_BYTES)
}
