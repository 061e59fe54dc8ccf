//! # Ledger
//!
//! Durable record of which source files have already been ingested, keyed by
//! file path and compared by exact modification time.
//!
//! The ledger is an append-only log of upsert records. On [`Ledger::open`]
//! the log is replayed into an in-memory table (later records override
//! earlier ones); [`Ledger::record_processed`] appends a record before it
//! updates the table, so an acknowledged upsert survives a restart.
//!
//! ## Log record layout
//!
//! ```text
//! record_len (u32) | crc32 (u32) | op (u8) | path_len (u32) | path | secs (i64) | nanos (u32)
//! ```
//!
//! `record_len` counts every byte after itself. The checksum covers the body
//! (everything after the crc field).

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, Utc};
use crc32fast::Hasher as Crc32;
use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

const OP_UPSERT: u8 = 0;

/// Smallest valid body: op + path_len + secs + nanos.
const MIN_BODY: usize = 1 + 4 + 8 + 4;

/// `open` compacts the log once it holds more than this many dead records
/// and dead records outnumber live ones.
pub const COMPACT_MIN_DEAD: usize = 64;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt ledger record at byte {offset}")]
    Corrupt { offset: u64 },
    #[error("ledger is unusable after an earlier write failure")]
    Poisoned,
}

/// One ledger entry: a source file and the modification time it was
/// ingested at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub file_path: String,
    pub modified_time: DateTime<Utc>,
}

/// Appends upsert records to the ledger log and optionally fsyncs.
struct LogWriter {
    file: File,
    sync: bool,
}

impl LogWriter {
    fn create(path: &Path, sync: bool) -> Result<Self, LedgerError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)?;
        Ok(Self { file, sync })
    }

    fn append(&mut self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        let buf = encode(entry)?;
        self.file.write_all(&buf)?;
        self.file.flush()?;

        if self.sync {
            self.file.sync_all()?;
        }
        Ok(())
    }
}

/// Encodes one full record, length prefix and checksum included.
fn encode(entry: &LedgerEntry) -> Result<Vec<u8>, LedgerError> {
    let path = entry.file_path.as_bytes();
    let mut body = Vec::with_capacity(MIN_BODY + path.len());
    body.write_u8(OP_UPSERT)?;
    body.write_u32::<LittleEndian>(path.len() as u32)?;
    body.extend_from_slice(path);
    body.write_i64::<LittleEndian>(entry.modified_time.timestamp())?;
    body.write_u32::<LittleEndian>(entry.modified_time.timestamp_subsec_nanos())?;

    let mut hasher = Crc32::new();
    hasher.update(&body);
    let crc = hasher.finalize();

    let mut buf = Vec::with_capacity(body.len() + 8);
    buf.write_u32::<LittleEndian>(body.len() as u32 + 4 /*crc*/)?;
    buf.write_u32::<LittleEndian>(crc)?;
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Result of replaying a ledger log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayStats {
    /// Complete, valid records seen.
    pub records: usize,
    /// Byte length of the valid prefix of the log.
    pub valid_len: u64,
    /// `true` if the log ended inside a record.
    pub torn_tail: bool,
}

/// Replays every complete record from `reader`, calling `apply` for each.
///
/// A record cut short by the end of the input is reported through
/// [`ReplayStats::torn_tail`] rather than as an error: it is what an
/// interrupted append leaves behind. A complete record that fails its
/// checksum is [`LedgerError::Corrupt`].
pub fn replay<R: Read, F>(mut reader: R, mut apply: F) -> Result<ReplayStats, LedgerError>
where
    F: FnMut(LedgerEntry),
{
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf)?;

    let mut pos = 0usize;
    let mut records = 0usize;
    loop {
        let rest = &buf[pos..];
        if rest.is_empty() {
            break;
        }
        if rest.len() < 8 {
            return Ok(torn(records, pos));
        }
        let mut header = &rest[..8];
        let record_len = header.read_u32::<LittleEndian>()? as usize;
        let crc = header.read_u32::<LittleEndian>()?;
        if record_len < 4 + MIN_BODY {
            return Err(LedgerError::Corrupt { offset: pos as u64 });
        }
        if rest.len() < 4 + record_len {
            return Ok(torn(records, pos));
        }
        let body = &rest[8..4 + record_len];

        let mut hasher = Crc32::new();
        hasher.update(body);
        if hasher.finalize() != crc {
            return Err(LedgerError::Corrupt { offset: pos as u64 });
        }

        let entry = decode_body(body).ok_or(LedgerError::Corrupt { offset: pos as u64 })?;
        apply(entry);
        records += 1;
        pos += 4 + record_len;
    }

    Ok(ReplayStats {
        records,
        valid_len: pos as u64,
        torn_tail: false,
    })
}

fn torn(records: usize, pos: usize) -> ReplayStats {
    ReplayStats {
        records,
        valid_len: pos as u64,
        torn_tail: true,
    }
}

fn decode_body(mut body: &[u8]) -> Option<LedgerEntry> {
    let op = body.read_u8().ok()?;
    if op != OP_UPSERT {
        return None;
    }
    let path_len = body.read_u32::<LittleEndian>().ok()? as usize;
    if body.len() < path_len {
        return None;
    }
    let (path, mut rest) = body.split_at(path_len);
    let file_path = String::from_utf8(path.to_vec()).ok()?;
    let secs = rest.read_i64::<LittleEndian>().ok()?;
    let nanos = rest.read_u32::<LittleEndian>().ok()?;
    if !rest.is_empty() {
        return None;
    }
    let modified_time = DateTime::from_timestamp(secs, nanos)?;
    Some(LedgerEntry {
        file_path,
        modified_time,
    })
}

/// The ingestion ledger.
///
/// Lookups are served from memory. Every mutation goes to the log first; if
/// an append fails the ledger is poisoned and all later calls fail with
/// [`LedgerError::Poisoned`], since the in-memory table can no longer be
/// trusted to match the log.
pub struct Ledger {
    path: PathBuf,
    entries: HashMap<String, DateTime<Utc>>,
    writer: LogWriter,
    /// Records currently in the log file, live or superseded.
    records: usize,
    sync: bool,
    poisoned: bool,
}

impl Ledger {
    /// Opens (or creates) the ledger at `path`.
    ///
    /// # Recovery Steps
    ///
    /// 1. Create parent directories if needed.
    /// 2. Replay the log into the in-memory table.
    /// 3. Truncate a torn final record, if any.
    /// 4. Compact when superseded records dominate.
    pub fn open<P: AsRef<Path>>(path: P, sync: bool) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let mut entries = HashMap::new();
        let stats = match File::open(&path) {
            Ok(file) => replay(file, |e| {
                entries.insert(e.file_path, e.modified_time);
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => ReplayStats {
                records: 0,
                valid_len: 0,
                torn_tail: false,
            },
            Err(e) => return Err(e.into()),
        };

        if stats.torn_tail {
            warn!(
                ledger = %path.display(),
                valid_len = stats.valid_len,
                "truncating torn record at end of ledger"
            );
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(stats.valid_len)?;
            file.sync_all()?;
        }

        let writer = LogWriter::create(&path, sync)?;
        let mut ledger = Self {
            path,
            entries,
            writer,
            records: stats.records,
            sync,
            poisoned: false,
        };

        let dead = ledger.records.saturating_sub(ledger.entries.len());
        if dead > COMPACT_MIN_DEAD && dead > ledger.entries.len() {
            ledger.compact()?;
        }

        debug!(
            ledger = %ledger.path.display(),
            entries = ledger.entries.len(),
            "ledger opened"
        );
        Ok(ledger)
    }

    /// Returns `true` iff `file_identity` was recorded with exactly
    /// `modified_time`. Any other stored time, older or newer, means the
    /// file must be processed again.
    pub fn has_processed(
        &self,
        file_identity: &str,
        modified_time: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        self.check_usable()?;
        Ok(self.entries.get(file_identity) == Some(&modified_time))
    }

    /// Records that `file_identity` was ingested at `modified_time`,
    /// replacing any earlier entry for the same path.
    ///
    /// Calling it again with the same arguments succeeds without touching
    /// the log.
    pub fn record_processed(
        &mut self,
        file_identity: &str,
        modified_time: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        self.check_usable()?;
        if self.entries.get(file_identity) == Some(&modified_time) {
            return Ok(());
        }

        let entry = LedgerEntry {
            file_path: file_identity.to_string(),
            modified_time,
        };
        if let Err(e) = self.writer.append(&entry) {
            self.poisoned = true;
            return Err(e);
        }

        self.entries.insert(entry.file_path, entry.modified_time);
        self.records += 1;
        Ok(())
    }

    /// Returns the stored modification time for `file_identity`, if any.
    pub fn get(&self, file_identity: &str) -> Option<DateTime<Utc>> {
        self.entries.get(file_identity).copied()
    }

    /// Number of distinct files in the ledger.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrites the log so it holds exactly one record per live entry.
    ///
    /// The new log is written to `<ledger>.tmp`, fsynced and renamed over
    /// the old one, so a crash leaves either the old or the new log.
    pub fn compact(&mut self) -> Result<(), LedgerError> {
        self.check_usable()?;
        let tmp_path = tmp_path(&self.path);

        let mut live: Vec<(&String, &DateTime<Utc>)> = self.entries.iter().collect();
        live.sort();

        let mut buf = Vec::new();
        for (file_path, modified_time) in live {
            buf.extend_from_slice(&encode(&LedgerEntry {
                file_path: file_path.clone(),
                modified_time: *modified_time,
            })?);
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(&buf)?;
        file.flush()?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp_path, &self.path)?;
        if self.sync {
            sync_dir(parent_dir(&self.path))?;
        }

        // the old handle points at the replaced inode
        self.writer = match LogWriter::create(&self.path, self.sync) {
            Ok(w) => w,
            Err(e) => {
                self.poisoned = true;
                return Err(e);
            }
        };
        debug!(
            ledger = %self.path.display(),
            dropped = self.records - self.entries.len(),
            "ledger compacted"
        );
        self.records = self.entries.len();
        Ok(())
    }

    fn check_usable(&self) -> Result<(), LedgerError> {
        if self.poisoned {
            Err(LedgerError::Poisoned)
        } else {
            Ok(())
        }
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// Makes a rename inside `dir` durable.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}
