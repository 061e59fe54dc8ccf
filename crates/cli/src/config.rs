//! Ingestion settings, loaded from an optional TOML file and then
//! overridden from the command line.

use partition::{WriterOptions, PARTITION_COLUMNS};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// A byte count written either as an integer or as a string with a unit
/// suffix (`"512MiB"`, `"2GB"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "SizeValue")]
pub struct ByteSize(pub usize);

#[derive(Deserialize)]
#[serde(untagged)]
enum SizeValue {
    Bytes(u64),
    Text(String),
}

impl TryFrom<SizeValue> for ByteSize {
    type Error = String;

    fn try_from(value: SizeValue) -> Result<Self, Self::Error> {
        match value {
            SizeValue::Bytes(n) => usize::try_from(n)
                .map(ByteSize)
                .map_err(|_| format!("{n} bytes does not fit in memory")),
            SizeValue::Text(s) => s.parse(),
        }
    }
}

impl std::str::FromStr for ByteSize {
    type Err = String;

    /// Units: `B`, decimal `KB`/`MB`/`GB`/`TB` and binary
    /// `KiB`/`MiB`/`GiB`/`TiB`, case-insensitive. A bare number is bytes.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let split = s
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(s.len());
        let (number, unit) = s.split_at(split);
        let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
            "" | "b" => 1,
            "kb" => 1_000,
            "mb" => 1_000_000,
            "gb" => 1_000_000_000,
            "tb" => 1_000_000_000_000,
            "kib" => 1 << 10,
            "mib" => 1 << 20,
            "gib" => 1 << 30,
            "tib" => 1 << 40,
            other => return Err(format!("unknown size unit {other:?} in {s:?}")),
        };
        let number: f64 = number
            .parse()
            .map_err(|_| format!("expected a size such as \"2GB\", got {s:?}"))?;
        let bytes = number * multiplier as f64;
        if !bytes.is_finite() || bytes < 1.0 || bytes > usize::MAX as f64 {
            return Err(format!("size {s:?} is out of range"));
        }
        Ok(ByteSize(bytes as usize))
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bytes", self.0)
    }
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("partitions")
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from("ingest-ledger.log")
}

fn default_memory_limit() -> ByteSize {
    ByteSize(partition::DEFAULT_MEMORY_LIMIT)
}

fn default_patterns() -> Vec<String> {
    vec!["Cond".into(), "Vib".into(), "Tmp".into()]
}

fn default_partition_columns() -> Vec<String> {
    PARTITION_COLUMNS.iter().map(|c| c.to_string()).collect()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IngestConfig {
    pub storage_root: PathBuf,
    pub ledger_path: PathBuf,
    pub memory_limit: ByteSize,
    /// File-name substrings a CSV must contain to be ingested. Empty means
    /// every CSV.
    pub patterns: Vec<String>,
    /// Fixed; present so a config that expects a different layout fails loudly.
    pub partition_columns: Vec<String>,
    pub workers: usize,
    pub sync: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            storage_root: default_storage_root(),
            ledger_path: default_ledger_path(),
            memory_limit: default_memory_limit(),
            patterns: default_patterns(),
            partition_columns: default_partition_columns(),
            workers: 1,
            sync: true,
        }
    }
}

impl IngestConfig {
    /// Loads `path`, or the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Checks the settings that deserialization alone cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.partition_columns != PARTITION_COLUMNS {
            return Err(ConfigError::Invalid {
                key: "partition_columns",
                reason: format!(
                    "must be {:?}, got {:?}",
                    PARTITION_COLUMNS, self.partition_columns
                ),
            });
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid {
                key: "workers",
                reason: "must be at least 1".into(),
            });
        }
        if self.storage_root.as_os_str().is_empty() {
            return Err(ConfigError::Invalid {
                key: "storage_root",
                reason: "must not be empty".into(),
            });
        }
        if self.ledger_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid {
                key: "ledger_path",
                reason: "must not be empty".into(),
            });
        }
        Ok(())
    }

    pub fn writer_options(&self) -> WriterOptions {
        WriterOptions {
            storage_root: self.storage_root.clone(),
            memory_limit: self.memory_limit.0,
            sync: self.sync,
        }
    }
}
