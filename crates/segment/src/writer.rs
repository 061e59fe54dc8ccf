use byteorder::{LittleEndian, WriteBytesExt};
use rowtable::RowTable;
use std::collections::BTreeMap;
use std::fs::{rename, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::format::{checksum, write_offsets, write_tail, FORMAT_VERSION, SEGMENT_MAGIC};
use crate::{SegmentError, SegmentHeader};

/// Writes the contents of a [`RowTable`] to disk as an immutable segment file.
///
/// The writer is stateless. The write is crash-safe: data is first written to
/// a temporary file next to the target, fsynced, and then atomically renamed
/// to the final path.
pub struct SegmentWriter {}

impl SegmentWriter {
    /// Returns the staging path used while `path` is being written.
    pub fn tmp_path(path: &Path) -> PathBuf {
        path.with_extension("seg.tmp")
    }

    /// Flushes `table` to a new segment file at `path`, returning the number
    /// of rows written.
    ///
    /// # Crash Safety
    ///
    /// Writes to `<path>.seg.tmp`, calls `sync_all()` when `sync` is set, then
    /// renames. If the process crashes mid-write the temp file is left behind;
    /// it is not a committed segment and readers never look at it.
    pub fn write_from_table(
        path: &Path,
        header: &SegmentHeader,
        table: &RowTable,
        sync: bool,
    ) -> Result<u64, SegmentError> {
        let buf = encode(header, table)?;

        let tmp_path = Self::tmp_path(path);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(&buf)?;
        file.flush()?;
        if sync {
            file.sync_all()?;
        }
        drop(file);

        rename(&tmp_path, path)?;

        Ok(table.len() as u64)
    }
}

/// Serializes a whole segment into memory.
fn encode(header: &SegmentHeader, table: &RowTable) -> Result<Vec<u8>, SegmentError> {
    let mut buf = Vec::new();

    // HEADER
    buf.write_u32::<LittleEndian>(SEGMENT_MAGIC)?;
    buf.write_u8(FORMAT_VERSION)?;
    buf.write_u8(header.layout)?;
    write_str(&mut buf, &header.plant_id)?;
    write_str(&mut buf, &header.machine_id)?;
    buf.write_i32::<LittleEndian>(header.year)?;
    buf.write_u8(header.month)?;
    buf.write_u64::<LittleEndian>(table.len() as u64)?;

    // TIMESTAMP COLUMN
    let ts_offset = buf.len() as u64;
    for (key, _) in table.iter() {
        buf.write_i64::<LittleEndian>(key.timestamp)?;
    }

    // PARAMETER COLUMN: sorted dictionary, then one code per row
    let param_offset = buf.len() as u64;
    let mut dict: BTreeMap<&str, u32> = BTreeMap::new();
    for (key, _) in table.iter() {
        dict.entry(key.parameter_id.as_str()).or_insert(0);
    }
    for (code, slot) in dict.values_mut().enumerate() {
        *slot = code as u32;
    }
    buf.write_u32::<LittleEndian>(dict.len() as u32)?;
    for name in dict.keys() {
        write_str(&mut buf, name)?;
    }
    for (key, _) in table.iter() {
        buf.write_u32::<LittleEndian>(dict[key.parameter_id.as_str()])?;
    }

    // VALUE COLUMN
    let value_offset = buf.len() as u64;
    for (_, entry) in table.iter() {
        buf.write_f64::<LittleEndian>(entry.value)?;
    }

    // FOOTER
    write_offsets(&mut buf, ts_offset, param_offset, value_offset)?;
    let crc = checksum(&buf);
    write_tail(&mut buf, crc)?;

    Ok(buf)
}

fn write_str(buf: &mut Vec<u8>, s: &str) -> Result<(), SegmentError> {
    buf.write_u32::<LittleEndian>(s.len() as u32)?;
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}
