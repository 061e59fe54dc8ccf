//! # Row table
//!
//! An in-memory, sorted merge buffer for one partition of the sensor store.
//!
//! A partition merge loads the rows already on disk, then applies the incoming
//! rows on top of them. The row table holds both in a sorted structure
//! (`BTreeMap`) keyed by [`DedupKey`], so that two rows describing the same
//! observation collapse into one before the partition is rewritten.
//!
//! ## Key properties
//! - **Sorted order**: entries are always in ascending `(timestamp, parameter_id)`
//!   order, so the same inputs always produce the same output file.
//! - **Sequence-number gated**: a write whose sequence number is lower than or
//!   equal to the stored entry's is ignored. Callers give existing rows a lower
//!   sequence than incoming ones to get last-write-wins.
//! - **Approximate size tracking**: tracks key and value bytes so the merge can
//!   enforce a memory ceiling.
//!
//! ## Example
//! ```rust
//! use rowtable::{DedupKey, RowTable};
//!
//! let mut t = RowTable::new();
//! let key = DedupKey::new(1_700_000_000_000_000, "TI-101");
//! t.put(key.clone(), 20.5, 0);
//! t.put(key.clone(), 21.0, 1);
//! assert_eq!(t.get(&key), Some((1, 21.0)));
//! ```

use std::collections::BTreeMap;

/// Bytes counted per entry on top of the parameter id: timestamp (8) + value (8).
pub const ROW_OVERHEAD: usize = 16;

/// Identity of a stored observation within one partition.
///
/// The partition-key fields are constant inside a partition, so the full
/// dedup key `(plant, machine, year, month, timestamp, parameter_id)` reduces
/// to these two fields here.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DedupKey {
    /// Microseconds since the Unix epoch (naive timestamps are read as UTC).
    pub timestamp: i64,
    /// Sensor parameter id, e.g. the column label of the source CSV.
    pub parameter_id: String,
}

impl DedupKey {
    pub fn new(timestamp: i64, parameter_id: impl Into<String>) -> Self {
        Self {
            timestamp,
            parameter_id: parameter_id.into(),
        }
    }
}

/// One stored row in narrow form: a single measurement at a single instant.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub timestamp: i64,
    pub parameter_id: String,
    pub value: f64,
}

impl Row {
    pub fn new(timestamp: i64, parameter_id: impl Into<String>, value: f64) -> Self {
        Self {
            timestamp,
            parameter_id: parameter_id.into(),
            value,
        }
    }

    pub fn key(&self) -> DedupKey {
        DedupKey::new(self.timestamp, self.parameter_id.clone())
    }
}

/// A single entry in the row table, pairing a sequence number with the value.
#[derive(Debug, Clone, PartialEq)]
pub struct RowEntry {
    /// Write order of the entry; higher wins.
    pub seq: u64,
    pub value: f64,
}

/// An ordered, in-memory merge buffer backed by a `BTreeMap`.
#[derive(Debug)]
pub struct RowTable {
    map: BTreeMap<DedupKey, RowEntry>,
    approx_size: usize,
}

impl RowTable {
    /// Creates a new, empty row table.
    pub fn new() -> Self {
        Self {
            map: BTreeMap::new(),
            approx_size: 0,
        }
    }

    /// Inserts a value under `key` with the given sequence number.
    ///
    /// If the key already exists with a **newer or equal** sequence number the
    /// write is ignored and `false` is returned. Otherwise the entry is stored
    /// (replacing any older one) and `true` is returned.
    pub fn put(&mut self, key: DedupKey, value: f64, seq: u64) -> bool {
        match self.map.get(&key) {
            Some(old) if old.seq >= seq => return false,
            Some(_) => {
                // same key, same footprint
            }
            None => {
                self.approx_size = self
                    .approx_size
                    .saturating_add(key.parameter_id.len() + ROW_OVERHEAD);
            }
        }

        self.map.insert(key, RowEntry { seq, value });
        true
    }

    /// Inserts a whole [`Row`] with the given sequence number.
    pub fn put_row(&mut self, row: Row, seq: u64) -> bool {
        let Row {
            timestamp,
            parameter_id,
            value,
        } = row;
        self.put(DedupKey::new(timestamp, parameter_id), value, seq)
    }

    /// Returns `Some((seq, value))` for the key, or `None` if absent.
    pub fn get(&self, key: &DedupKey) -> Option<(u64, f64)> {
        self.map.get(key).map(|e| (e.seq, e.value))
    }

    /// Returns an iterator over all entries in ascending key order.
    pub fn iter(&self) -> impl Iterator<Item = (&DedupKey, &RowEntry)> {
        self.map.iter()
    }

    /// Returns the stored rows in ascending key order.
    pub fn rows(&self) -> impl Iterator<Item = Row> + '_ {
        self.map
            .iter()
            .map(|(k, e)| Row::new(k.timestamp, k.parameter_id.clone(), e.value))
    }

    /// Returns the number of distinct keys.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns the approximate byte size of all keys and values stored.
    ///
    /// Does **not** include `BTreeMap` node overhead.
    pub fn approx_size(&self) -> usize {
        self.approx_size
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn contains_key(&self, key: &DedupKey) -> bool {
        self.map.contains_key(key)
    }

    /// Removes all entries and resets `approx_size` to zero.
    pub fn clear(&mut self) {
        self.map.clear();
        self.approx_size = 0;
    }
}

impl Default for RowTable {
    fn default() -> Self {
        Self::new()
    }
}
