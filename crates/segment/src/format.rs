//! Segment binary format constants and footer read/write helpers.
//!
//! The footer is always the **last 32 bytes** of a segment file:
//!
//! ```text
//! [ts_offset: u64][param_offset: u64][value_offset: u64][crc32: u32][magic: u32]
//! ```
//!
//! The checksum covers every byte of the file before the `crc32` field,
//! including the three column offsets.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Result as IoResult, Write};

/// Magic number identifying segment files (ASCII "SEG1").
pub const SEGMENT_MAGIC: u32 = 0x5345_4731;

/// Current on-disk format version.
pub const FORMAT_VERSION: u8 = 1;

/// Row layout tag for narrow rows: one `(timestamp, parameter_id, value)` per row.
pub const LAYOUT_NARROW: u8 = 1;

/// Size of the footer in bytes: three `u64` offsets, `crc32` and `magic`.
pub const FOOTER_BYTES: u64 = 8 * 3 + 4 + 4;

/// Bytes at the end of the footer that are not covered by the checksum.
pub(crate) const UNCHECKED_TAIL: usize = 4 + 4;

/// Column offsets and checksum stored at the end of every segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub ts_offset: u64,
    pub param_offset: u64,
    pub value_offset: u64,
    pub crc: u32,
}

/// Returns the byte offset where the footer starts: `filesize - 32`.
pub fn footer_pos(filesize: u64) -> u64 {
    filesize.saturating_sub(FOOTER_BYTES)
}

/// Writes the three column offsets, i.e. the checksummed part of the footer.
pub fn write_offsets<W: Write>(
    w: &mut W,
    ts_offset: u64,
    param_offset: u64,
    value_offset: u64,
) -> IoResult<()> {
    w.write_u64::<LittleEndian>(ts_offset)?;
    w.write_u64::<LittleEndian>(param_offset)?;
    w.write_u64::<LittleEndian>(value_offset)?;
    Ok(())
}

/// Writes the unchecked tail of the footer (`crc32` + `magic`).
pub fn write_tail<W: Write>(w: &mut W, crc: u32) -> IoResult<()> {
    w.write_u32::<LittleEndian>(crc)?;
    w.write_u32::<LittleEndian>(SEGMENT_MAGIC)?;
    Ok(())
}

/// Parses the footer from the last [`FOOTER_BYTES`] of `buf`, returning the
/// footer and its magic. The caller guarantees `buf` is at least that long.
pub fn read_footer(buf: &[u8]) -> IoResult<(Footer, u32)> {
    let start = footer_pos(buf.len() as u64) as usize;
    let mut r = &buf[start..];
    let ts_offset = r.read_u64::<LittleEndian>()?;
    let param_offset = r.read_u64::<LittleEndian>()?;
    let value_offset = r.read_u64::<LittleEndian>()?;
    let crc = r.read_u32::<LittleEndian>()?;
    let magic = r.read_u32::<LittleEndian>()?;
    Ok((
        Footer {
            ts_offset,
            param_offset,
            value_offset,
            crc,
        },
        magic,
    ))
}

/// CRC32 over `data`.
pub fn checksum(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}
