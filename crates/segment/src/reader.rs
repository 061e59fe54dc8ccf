use byteorder::{LittleEndian, ReadBytesExt};
use rowtable::Row;
use std::fs;
use std::path::{Path, PathBuf};

use crate::format::{
    checksum, read_footer, FOOTER_BYTES, FORMAT_VERSION, LAYOUT_NARROW, SEGMENT_MAGIC,
    UNCHECKED_TAIL,
};
use crate::{SegmentError, SegmentHeader};

/// Reads a whole segment file into memory.
///
/// A partition is assumed to fit in memory, so [`open`](SegmentReader::open)
/// loads, verifies and decodes every column at once. Rows are returned in the
/// order they were written, i.e. ascending `(timestamp, parameter_id)`.
pub struct SegmentReader {
    path: PathBuf,
    header: SegmentHeader,
    rows: Vec<Row>,
}

impl SegmentReader {
    /// Opens a segment file, verifies it and decodes its rows.
    ///
    /// # Validation
    ///
    /// - The file must be at least 32 bytes (footer size).
    /// - Footer and header magic must equal `0x5345_4731` ("SEG1").
    /// - The CRC32 must match the file contents.
    /// - Version and layout must be ones this build understands.
    /// - Column offsets and dictionary codes must be in range.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SegmentError> {
        let path_buf = path.as_ref().to_path_buf();
        let bytes = fs::read(&path_buf)?;
        let filesize = bytes.len() as u64;

        if filesize < FOOTER_BYTES {
            return Err(SegmentError::TooSmall(filesize));
        }

        let (footer, magic) = read_footer(&bytes)?;
        if magic != SEGMENT_MAGIC {
            return Err(SegmentError::BadMagic(magic));
        }
        let checked = &bytes[..bytes.len() - UNCHECKED_TAIL];
        if checksum(checked) != footer.crc {
            return Err(SegmentError::Checksum);
        }

        let body_end = (filesize - FOOTER_BYTES) as usize;
        let body = &bytes[..body_end];

        let mut r = body;
        let header_magic = r.read_u32::<LittleEndian>().map_err(truncated)?;
        if header_magic != SEGMENT_MAGIC {
            return Err(SegmentError::BadMagic(header_magic));
        }
        let version = r.read_u8().map_err(truncated)?;
        if version != FORMAT_VERSION {
            return Err(SegmentError::UnsupportedVersion(version));
        }
        let layout = r.read_u8().map_err(truncated)?;
        if layout != LAYOUT_NARROW {
            return Err(SegmentError::UnsupportedLayout(layout));
        }
        let plant_id = read_str(&mut r)?;
        let machine_id = read_str(&mut r)?;
        let year = r.read_i32::<LittleEndian>().map_err(truncated)?;
        let month = r.read_u8().map_err(truncated)?;
        let row_count = r.read_u64::<LittleEndian>().map_err(truncated)? as usize;

        let header = SegmentHeader {
            plant_id,
            machine_id,
            year,
            month,
            layout,
        };

        let timestamps = {
            let mut col = column(body, footer.ts_offset, "timestamp")?;
            let mut out = Vec::with_capacity(row_count.min(body.len() / 8));
            for _ in 0..row_count {
                out.push(col.read_i64::<LittleEndian>().map_err(truncated)?);
            }
            out
        };

        let parameters = {
            let mut col = column(body, footer.param_offset, "parameter")?;
            let dict_len = col.read_u32::<LittleEndian>().map_err(truncated)? as usize;
            let mut dict = Vec::with_capacity(dict_len.min(body.len()));
            for _ in 0..dict_len {
                dict.push(read_str(&mut col)?);
            }
            let mut out = Vec::with_capacity(row_count.min(body.len() / 4));
            for _ in 0..row_count {
                let code = col.read_u32::<LittleEndian>().map_err(truncated)? as usize;
                let name = dict.get(code).ok_or_else(|| {
                    SegmentError::Malformed(format!("dictionary code {code} out of range"))
                })?;
                out.push(name.clone());
            }
            out
        };

        let mut values = column(body, footer.value_offset, "value")?;
        let mut rows = Vec::with_capacity(timestamps.len());
        for (timestamp, parameter_id) in timestamps.into_iter().zip(parameters) {
            let value = values.read_f64::<LittleEndian>().map_err(truncated)?;
            rows.push(Row {
                timestamp,
                parameter_id,
                value,
            });
        }

        Ok(Self {
            path: path_buf,
            header,
            rows,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    /// Returns the number of rows in the segment.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

fn column<'a>(body: &'a [u8], offset: u64, name: &str) -> Result<&'a [u8], SegmentError> {
    body.get(offset as usize..).ok_or_else(|| {
        SegmentError::Malformed(format!("{name} column offset {offset} out of range"))
    })
}

fn read_str(r: &mut &[u8]) -> Result<String, SegmentError> {
    let len = r.read_u32::<LittleEndian>().map_err(truncated)? as usize;
    if r.len() < len {
        return Err(SegmentError::Malformed("string runs past end of body".into()));
    }
    let (bytes, rest) = r.split_at(len);
    *r = rest;
    String::from_utf8(bytes.to_vec())
        .map_err(|_| SegmentError::Malformed("string is not valid utf-8".into()))
}

fn truncated(_: std::io::Error) -> SegmentError {
    SegmentError::Malformed("unexpected end of segment body".into())
}
