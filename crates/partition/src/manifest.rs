//! Partition manifest: the list of segment files that make up a partition.
//!
//! ```text
//! magic (u32) "PMF1" | generation (u64) | count (u32) | count × (len (u32) | utf8) | crc32 (u32)
//! ```
//!
//! The manifest is replaced by writing `_manifest.tmp` and renaming it over
//! `_manifest`. That rename is the moment a merge becomes visible.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE: &str = "_manifest";
pub const MANIFEST_TMP_FILE: &str = "_manifest.tmp";

/// Magic number identifying manifest files (ASCII "PMF1").
pub const MANIFEST_MAGIC: u32 = 0x504D_4631;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// Incremented by every committed merge, starting at 1.
    pub generation: u64,
    /// Segment file names relative to the partition directory.
    pub segments: Vec<String>,
}

impl Manifest {
    pub fn path(dir: &Path) -> PathBuf {
        dir.join(MANIFEST_FILE)
    }

    /// Reads the manifest of the partition at `dir`.
    ///
    /// Returns `Ok(None)` when the partition has no manifest. A manifest that
    /// fails validation is an `InvalidData` error.
    pub fn read(dir: &Path) -> io::Result<Option<Self>> {
        let bytes = match fs::read(Self::path(dir)) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        Self::decode(&bytes).map(Some)
    }

    /// Atomically replaces the manifest at `dir` with `self`.
    ///
    /// An error means the rename did not happen and the old manifest is still
    /// in place. Callers make the rename durable with [`sync_dir`].
    pub fn write(&self, dir: &Path, sync: bool) -> io::Result<()> {
        let tmp_path = dir.join(MANIFEST_TMP_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(&self.encode()?)?;
        file.flush()?;
        if sync {
            file.sync_all()?;
        }
        drop(file);

        fs::rename(&tmp_path, Self::path(dir))
    }

    fn encode(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.write_u32::<LittleEndian>(MANIFEST_MAGIC)?;
        buf.write_u64::<LittleEndian>(self.generation)?;
        buf.write_u32::<LittleEndian>(self.segments.len() as u32)?;
        for name in &self.segments {
            buf.write_u32::<LittleEndian>(name.len() as u32)?;
            buf.extend_from_slice(name.as_bytes());
        }
        let mut hasher = Crc32::new();
        hasher.update(&buf);
        let crc = hasher.finalize();
        buf.write_u32::<LittleEndian>(crc)?;
        Ok(buf)
    }

    fn decode(bytes: &[u8]) -> io::Result<Self> {
        if bytes.len() < 4 + 8 + 4 + 4 {
            return Err(invalid("manifest too small"));
        }
        let (body, mut tail) = bytes.split_at(bytes.len() - 4);
        let crc = tail.read_u32::<LittleEndian>()?;
        let mut hasher = Crc32::new();
        hasher.update(body);
        if hasher.finalize() != crc {
            return Err(invalid("manifest checksum mismatch"));
        }

        let mut r = body;
        if r.read_u32::<LittleEndian>()? != MANIFEST_MAGIC {
            return Err(invalid("invalid manifest magic"));
        }
        let generation = r.read_u64::<LittleEndian>()?;
        let count = r.read_u32::<LittleEndian>()? as usize;
        let mut segments = Vec::with_capacity(count.min(body.len()));
        for _ in 0..count {
            let len = r.read_u32::<LittleEndian>()? as usize;
            if r.len() < len {
                return Err(invalid("manifest entry runs past end"));
            }
            let (name, rest) = r.split_at(len);
            r = rest;
            let name = String::from_utf8(name.to_vec())
                .map_err(|_| invalid("manifest entry is not utf-8"))?;
            if name.contains(['/', '\\']) || name == ".." {
                return Err(invalid("manifest entry escapes the partition"));
            }
            segments.push(name);
        }
        if !r.is_empty() {
            return Err(invalid("trailing bytes in manifest"));
        }
        Ok(Self {
            generation,
            segments,
        })
    }
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

/// Makes renames inside `dir` durable.
#[cfg(unix)]
pub fn sync_dir(dir: &Path) -> io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
pub fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}
