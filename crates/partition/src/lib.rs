//! # Partition merge-writer
//!
//! Stores sensor readings under a hive-style directory tree
//! (`plant_id=…/machine_id=…/year=YYYY/month=MM`) and merges new batches into
//! existing partitions without duplicating rows.
//!
//! [`PartitionWriter::merge_and_write`] takes one partition's records, loads
//! whatever the partition already holds, deduplicates on
//! `(timestamp, parameter_id)` with the incoming row winning, and replaces
//! the partition's content in a single observable step (see [`manifest`]).
//! Merges of the same partition are serialized through a [`LockTable`];
//! different partitions proceed in parallel.
//!
//! Rows are stored in narrow form. A partition is loaded fully into memory
//! during a merge, bounded by [`WriterOptions::memory_limit`].

mod key;
mod lock;
pub mod manifest;
mod record;
mod writer;

use std::io;

use thiserror::Error;

pub use key::{PartitionKey, PARTITION_COLUMNS};
pub use lock::LockTable;
pub use record::Record;
pub use rowtable::Row;
pub use writer::{
    segment_file_name, MergeSummary, PartitionWriter, WriterOptions, DEFAULT_MEMORY_LIMIT,
};

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("batch mixes partitions: expected {expected}, found {found}")]
    MixedPartitionKey {
        expected: PartitionKey,
        found: PartitionKey,
    },
    #[error("invalid record: {reason}")]
    InvalidRecord { reason: String },
    #[error("failed to write partition {partition}: {source}")]
    PartitionWriteFailed {
        partition: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to read partition {partition}: {reason}")]
    PartitionReadFailed { partition: String, reason: String },
    #[error("partition {partition} needs about {needed} bytes to merge, over the {limit}-byte limit")]
    PartitionTooLarge {
        partition: String,
        limit: usize,
        needed: usize,
    },
}
