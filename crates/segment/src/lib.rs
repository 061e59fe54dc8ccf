//! # Segment: columnar partition data file
//!
//! Immutable, on-disk storage files holding the rows of one partition.
//!
//! A partition merge writes exactly one new segment with the merged rows;
//! segments are **write-once, read-many** and are only ever replaced as a
//! whole when the partition's manifest is swapped.
//!
//! ## File layout (v1)
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ HEADER                                                   │
//! │ magic (u32) "SEG1" | version (u8) | layout (u8)          │
//! │ plant_len (u32) | plant | machine_len (u32) | machine    │
//! │ year (i32) | month (u8) | row_count (u64)                │
//! ├──────────────────────────────────────────────────────────┤
//! │ TIMESTAMP COLUMN   row_count × i64 (µs since epoch)      │
//! ├──────────────────────────────────────────────────────────┤
//! │ PARAMETER COLUMN   dict_len (u32)                        │
//! │                    dict_len × (len (u32) | utf8)         │
//! │                    row_count × code (u32)                │
//! ├──────────────────────────────────────────────────────────┤
//! │ VALUE COLUMN       row_count × f64                       │
//! ├──────────────────────────────────────────────────────────┤
//! │ FOOTER (always last 32 bytes)                            │
//! │ ts_offset (u64) | param_offset (u64) | value_offset (u64)│
//! │ crc32 (u32) | magic (u32) "SEG1"                         │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian. Rows are stored in ascending
//! `(timestamp, parameter_id)` order.

mod format;
mod reader;
mod writer;

use std::io;

use thiserror::Error;

pub use format::{FOOTER_BYTES, FORMAT_VERSION, LAYOUT_NARROW, SEGMENT_MAGIC};
pub use reader::SegmentReader;
pub use writer::SegmentWriter;

/// File extension of committed segment files.
pub const SEGMENT_EXTENSION: &str = "seg";

/// Partition identity and row layout recorded at the start of every segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    pub plant_id: String,
    pub machine_id: String,
    pub year: i32,
    pub month: u8,
    pub layout: u8,
}

impl SegmentHeader {
    /// Header for a narrow-layout segment.
    pub fn narrow(
        plant_id: impl Into<String>,
        machine_id: impl Into<String>,
        year: i32,
        month: u8,
    ) -> Self {
        Self {
            plant_id: plant_id.into(),
            machine_id: machine_id.into(),
            year,
            month,
            layout: LAYOUT_NARROW,
        }
    }
}

#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("segment file too small ({0} bytes)")]
    TooSmall(u64),
    #[error("invalid segment magic: {0:x}")]
    BadMagic(u32),
    #[error("unsupported segment version {0}")]
    UnsupportedVersion(u8),
    #[error("unsupported row layout {0}")]
    UnsupportedLayout(u8),
    #[error("segment checksum mismatch")]
    Checksum,
    #[error("malformed segment: {0}")]
    Malformed(String),
}
