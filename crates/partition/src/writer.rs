use rowtable::{Row, RowTable};
use segment::{SegmentError, SegmentHeader, SegmentReader, SegmentWriter, SEGMENT_EXTENSION};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[cfg(test)]
use parking_lot::Mutex;

use crate::manifest::{sync_dir, Manifest, MANIFEST_FILE, MANIFEST_TMP_FILE};
use crate::{LockTable, MergeError, PartitionKey, Record};

/// Default merge memory ceiling: 2 GB.
pub const DEFAULT_MEMORY_LIMIT: usize = 2_000_000_000;

/// Settings the merge-writer is constructed with.
#[derive(Debug, Clone)]
pub struct WriterOptions {
    /// Root directory of the partition tree.
    pub storage_root: PathBuf,
    /// Ceiling on the approximate in-memory size of one partition merge.
    pub memory_limit: usize,
    /// If `true`, segment and manifest writes are fsynced before they are
    /// renamed into place.
    pub sync: bool,
}

impl WriterOptions {
    pub fn new(storage_root: impl Into<PathBuf>) -> Self {
        Self {
            storage_root: storage_root.into(),
            memory_limit: DEFAULT_MEMORY_LIMIT,
            sync: true,
        }
    }
}

/// What one committed merge did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeSummary {
    pub partition: PartitionKey,
    pub generation: u64,
    /// Distinct rows stored before the merge.
    pub rows_before: usize,
    /// Rows produced from the incoming records, duplicates included.
    pub rows_incoming: usize,
    /// Distinct rows stored after the merge.
    pub rows_after: usize,
}

/// File name of the segment committed by merge `generation`.
pub fn segment_file_name(generation: u64) -> String {
    format!("part-{generation:06}.{SEGMENT_EXTENSION}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailPoint {
    SegmentWrite,
    ManifestSwap,
    /// Stops where `ManifestSwap` does but skips the rollback, leaving the
    /// directory as a killed process would.
    Halt,
    Cleanup,
}

/// Rows currently visible in a partition directory.
#[derive(Default)]
struct Loaded {
    generation: u64,
    segments: usize,
    /// Visible segment files when no manifest lists them yet.
    unlisted: Option<Vec<String>>,
    rows: Vec<Row>,
}

/// Merges record batches into on-disk partitions.
///
/// # Merge Path
///
/// 1. Check the batch targets one partition and every record is valid.
/// 2. Lock the partition directory.
/// 3. Load the rows the partition's manifest lists (or every segment, for a
///    partition without manifest).
/// 4. Apply existing rows at sequence 0 and incoming rows at 1, 2, … to a
///    [`RowTable`], so the newest row wins each dedup key.
/// 5. For a partition without manifest, first write one listing the
///    segments visible now. Then write the merged rows to a fresh segment
///    and swap the manifest to point at it.
/// 6. Remove superseded segments and leftover temp files.
///
/// Nothing a reader can see changes before step 5's manifest rename, and
/// nothing it sees afterwards is old data.
pub struct PartitionWriter {
    options: WriterOptions,
    locks: LockTable,
    #[cfg(test)]
    fail_point: Mutex<Option<FailPoint>>,
}

impl PartitionWriter {
    pub fn new(options: WriterOptions) -> Self {
        Self {
            options,
            locks: LockTable::new(),
            #[cfg(test)]
            fail_point: Mutex::new(None),
        }
    }

    pub fn options(&self) -> &WriterOptions {
        &self.options
    }

    /// Absolute directory of the partition identified by `key`.
    pub fn partition_dir(&self, key: &PartitionKey) -> PathBuf {
        self.options.storage_root.join(key.relative_path())
    }

    /// Merges `records` into their partition and atomically replaces its
    /// stored content.
    ///
    /// Returns `Ok(None)` without writing anything when the batch is empty
    /// or carries no measurements. An empty batch does not touch the
    /// filesystem at all.
    ///
    /// # Errors
    ///
    /// - [`MergeError::MixedPartitionKey`] if the records target more than one
    ///   partition.
    /// - [`MergeError::InvalidRecord`] for a null or non-finite measurement, a
    ///   key that disagrees with its timestamp, or a stored segment in a row
    ///   layout other than narrow.
    /// - [`MergeError::PartitionReadFailed`] if the existing data is unreadable.
    /// - [`MergeError::PartitionTooLarge`] if the merge would exceed the
    ///   memory limit.
    /// - [`MergeError::PartitionWriteFailed`] on I/O failure while writing;
    ///   the partition keeps its previous content.
    pub fn merge_and_write(&self, records: &[Record]) -> Result<Option<MergeSummary>, MergeError> {
        let Some(first) = records.first() else {
            return Ok(None);
        };
        let key = &first.key;
        if let Some(other) = records.iter().find(|r| r.key != *key) {
            return Err(MergeError::MixedPartitionKey {
                expected: key.clone(),
                found: other.key.clone(),
            });
        }
        for (index, record) in records.iter().enumerate() {
            record
                .validate()
                .map_err(|reason| MergeError::InvalidRecord {
                    reason: format!("record {index}: {reason}"),
                })?;
        }

        let dir = self.partition_dir(key);
        let lock = self.locks.lock_for(&dir);
        let _guard = lock.lock();

        let existing = self.load(&dir, key)?;
        let mut table = RowTable::new();
        for row in existing.rows {
            table.put_row(row, 0);
        }
        self.check_memory(key, &table)?;
        let rows_before = table.len();

        let mut seq = 0u64;
        for record in records {
            for row in record.rows() {
                seq += 1;
                table.put_row(row, seq);
            }
            self.check_memory(key, &table)?;
        }
        if seq == 0 {
            debug!(partition = %key, "batch has no measurements; nothing to merge");
            return Ok(None);
        }

        let generation = next_generation(&dir, existing.generation);
        self.commit(&dir, key, &table, generation, existing.unlisted.as_deref())?;

        let summary = MergeSummary {
            partition: key.clone(),
            generation,
            rows_before,
            rows_incoming: seq as usize,
            rows_after: table.len(),
        };
        debug!(
            partition = %key,
            generation,
            replaced_segments = existing.segments,
            rows_before = summary.rows_before,
            rows_incoming = summary.rows_incoming,
            rows_after = summary.rows_after,
            "partition merged"
        );
        Ok(Some(summary))
    }

    /// Returns the distinct rows stored in a partition, in dedup-key order.
    /// An absent partition has no rows.
    pub fn read_partition(&self, key: &PartitionKey) -> Result<Vec<Row>, MergeError> {
        let dir = self.partition_dir(key);
        let lock = self.locks.lock_for(&dir);
        let _guard = lock.lock();

        let loaded = self.load(&dir, key)?;
        let mut table = RowTable::new();
        for row in loaded.rows {
            table.put_row(row, 0);
        }
        Ok(table.rows().collect())
    }

    fn load(&self, dir: &Path, key: &PartitionKey) -> Result<Loaded, MergeError> {
        if !dir.is_dir() {
            return Ok(Loaded {
                unlisted: Some(Vec::new()),
                ..Loaded::default()
            });
        }
        let read_failed = |reason: String| MergeError::PartitionReadFailed {
            partition: key.to_string(),
            reason,
        };

        let (generation, files, listed) = match Manifest::read(dir) {
            Ok(Some(manifest)) => (manifest.generation, manifest.segments, true),
            Ok(None) => (
                0,
                list_segments(dir).map_err(|e| read_failed(e.to_string()))?,
                false,
            ),
            Err(e) => return Err(read_failed(format!("manifest: {e}"))),
        };

        let mut rows = Vec::new();
        for name in &files {
            let reader = SegmentReader::open(dir.join(name)).map_err(|e| match e {
                SegmentError::UnsupportedLayout(layout) => MergeError::InvalidRecord {
                    reason: format!(
                        "segment {name} stores row layout {layout}; only narrow rows can be merged"
                    ),
                },
                other => read_failed(format!("segment {name}: {other}")),
            })?;
            let header = reader.header();
            if header.plant_id != key.plant_id
                || header.machine_id != key.machine_id
                || header.year != key.year
                || u32::from(header.month) != key.month
            {
                return Err(read_failed(format!(
                    "segment {name} belongs to another partition"
                )));
            }
            rows.extend(reader.into_rows());
        }

        Ok(Loaded {
            generation,
            segments: files.len(),
            unlisted: (!listed).then_some(files),
            rows,
        })
    }

    fn check_memory(&self, key: &PartitionKey, table: &RowTable) -> Result<(), MergeError> {
        if table.approx_size() > self.options.memory_limit {
            return Err(MergeError::PartitionTooLarge {
                partition: key.to_string(),
                limit: self.options.memory_limit,
                needed: table.approx_size(),
            });
        }
        Ok(())
    }

    /// Writes the merged table and swaps it in. On error the partition is
    /// left as it was before the call.
    ///
    /// A directory without a manifest gets one listing `unlisted` before the
    /// new segment lands, so a segment whose swap never happened is not
    /// picked up as a fragment.
    fn commit(
        &self,
        dir: &Path,
        key: &PartitionKey,
        table: &RowTable,
        generation: u64,
        unlisted: Option<&[String]>,
    ) -> Result<(), MergeError> {
        let created = !dir.is_dir();
        fs::create_dir_all(dir).map_err(|source| MergeError::PartitionWriteFailed {
            partition: key.to_string(),
            source,
        })?;

        let name = segment_file_name(generation);
        let seg_path = dir.join(&name);
        let staged = match unlisted {
            Some(files) => self.pin(dir, files),
            None => Ok(()),
        }
        .and_then(|()| self.stage(dir, key, table, generation, &seg_path, &name));
        if let Err(source) = staged {
            if !self.halted() {
                rollback(dir, key, &seg_path, created);
            }
            return Err(MergeError::PartitionWriteFailed {
                partition: key.to_string(),
                source,
            });
        }

        if self.options.sync {
            if let Err(e) = sync_dir(dir) {
                warn!(partition = %key, error = %e, "failed to sync partition directory");
            }
        }
        self.sweep(dir, key, &name);
        Ok(())
    }

    /// Writes a generation-0 manifest naming the segments that are visible
    /// right now.
    fn pin(&self, dir: &Path, files: &[String]) -> io::Result<()> {
        Manifest {
            generation: 0,
            segments: files.to_vec(),
        }
        .write(dir, self.options.sync)?;
        if self.options.sync {
            sync_dir(dir)?;
        }
        Ok(())
    }

    fn stage(
        &self,
        dir: &Path,
        key: &PartitionKey,
        table: &RowTable,
        generation: u64,
        seg_path: &Path,
        name: &str,
    ) -> io::Result<()> {
        self.inject(FailPoint::SegmentWrite)?;
        let header =
            SegmentHeader::narrow(&key.plant_id, &key.machine_id, key.year, key.month as u8);
        SegmentWriter::write_from_table(seg_path, &header, table, self.options.sync)
            .map_err(into_io)?;

        self.inject(FailPoint::ManifestSwap)?;
        self.inject(FailPoint::Halt)?;
        Manifest {
            generation,
            segments: vec![name.to_string()],
        }
        .write(dir, self.options.sync)
    }

    /// Deletes segments and temp files the current manifest no longer lists.
    /// Failures only leave invisible files behind, so they are logged.
    fn sweep(&self, dir: &Path, key: &PartitionKey, keep: &str) {
        let result = (|| -> io::Result<usize> {
            self.inject(FailPoint::Cleanup)?;
            let mut removed = 0;
            for entry in fs::read_dir(dir)? {
                let entry = entry?;
                let file_name = entry.file_name();
                let Some(name) = file_name.to_str() else {
                    continue;
                };
                if name == keep || name == MANIFEST_FILE {
                    continue;
                }
                if is_segment_name(name) || name.ends_with(".tmp") {
                    fs::remove_file(entry.path())?;
                    removed += 1;
                }
            }
            Ok(removed)
        })();

        match result {
            Ok(0) => {}
            Ok(removed) => debug!(partition = %key, removed, "removed superseded files"),
            Err(e) => warn!(
                partition = %key,
                error = %e,
                "failed to remove superseded files; they stay invisible"
            ),
        }
    }

    #[cfg(test)]
    fn inject(&self, at: FailPoint) -> io::Result<()> {
        if *self.fail_point.lock() == Some(at) {
            return Err(io::Error::other(format!("injected failure at {at:?}")));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn inject(&self, _at: FailPoint) -> io::Result<()> {
        Ok(())
    }

    #[cfg(test)]
    fn halted(&self) -> bool {
        *self.fail_point.lock() == Some(FailPoint::Halt)
    }

    #[cfg(not(test))]
    fn halted(&self) -> bool {
        false
    }

    #[cfg(test)]
    fn fail_at(&self, at: Option<FailPoint>) {
        *self.fail_point.lock() = at;
    }
}

/// Removes whatever a failed commit left behind. A directory the commit
/// created goes away together with its manifest.
fn rollback(dir: &Path, key: &PartitionKey, seg_path: &Path, created: bool) {
    discard(&SegmentWriter::tmp_path(seg_path));
    discard(seg_path);
    discard(&dir.join(MANIFEST_TMP_FILE));
    if created {
        discard(&dir.join(MANIFEST_FILE));
        if let Err(e) = fs::remove_dir(dir) {
            warn!(
                partition = %key,
                error = %e,
                "failed to remove partition directory after rollback"
            );
        }
    }
}

/// Lowest generation above `current` whose segment name is free.
fn next_generation(dir: &Path, current: u64) -> u64 {
    let mut generation = current + 1;
    while dir.join(segment_file_name(generation)).exists() {
        generation += 1;
    }
    generation
}

fn is_segment_name(name: &str) -> bool {
    Path::new(name)
        .extension()
        .map(|e| e == SEGMENT_EXTENSION)
        .unwrap_or(false)
}

/// Every committed segment in `dir`, in file-name order.
fn list_segments(dir: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if is_segment_name(name) {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove staged file");
        }
    }
}

fn into_io(e: SegmentError) -> io::Error {
    match e {
        SegmentError::Io(e) => e,
        other => io::Error::other(other),
    }
}
