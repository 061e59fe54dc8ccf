/// Ingestion engine that ties together the Ledger, the CSV reader and the
/// partition merge-writer.
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ledger::{Ledger, LedgerError};
use parking_lot::Mutex;
use partition::{MergeError, PartitionKey, PartitionWriter, Record};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::IngestConfig;
use crate::csv::{ParseError, SensorFile};
use crate::discover::{attribute, find_csv_files};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("ledger unavailable: {0}")]
    LedgerUnavailable(#[source] LedgerError),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error("{0}")]
    Source(String),
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
}

/// What happened to one source file.
#[derive(Debug)]
pub enum FileOutcome {
    /// Already ingested at its current modification time.
    Skipped,
    Ingested {
        records: usize,
        dropped: usize,
        partitions: usize,
    },
    /// Nothing was recorded in the ledger; the file is retried next run.
    Failed(IngestError),
}

/// Where plant and machine ids come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribution {
    /// `<source>/<plant>/<machine>/<file>.csv`
    FromPath,
    Fixed { plant_id: String, machine_id: String },
}

/// Per-file outcomes of one run, in discovery order.
#[derive(Debug, Default)]
pub struct RunReport {
    pub files: Vec<(PathBuf, FileOutcome)>,
}

impl RunReport {
    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::Skipped))
    }

    pub fn ingested(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::Ingested { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::Failed(_)))
    }

    fn count(&self, f: impl Fn(&FileOutcome) -> bool) -> usize {
        self.files.iter().filter(|(_, o)| f(o)).count()
    }
}

/// The ingestion driver.
///
/// # Per-file Path
///
/// 1. Ask the ledger whether the file was ingested at its current mtime; if
///    so, skip it.
/// 2. Parse the file and group its readings by partition key.
/// 3. Merge each group into its partition.
/// 4. Only when every group merged, record the file in the ledger.
///
/// Any error stops the file at the step it occurred in and leaves the
/// ledger untouched, so the next run retries it. Other files are not
/// affected.
pub struct Ingestor {
    config: IngestConfig,
    ledger: Mutex<Ledger>,
    writer: PartitionWriter,
}

impl Ingestor {
    /// Opens the ledger and prepares the merge-writer.
    pub fn new(config: IngestConfig) -> Result<Self, LedgerError> {
        let ledger = Ledger::open(&config.ledger_path, config.sync)?;
        let writer = PartitionWriter::new(config.writer_options());
        Ok(Self {
            config,
            ledger: Mutex::new(ledger),
            writer,
        })
    }

    #[cfg(test)]
    pub fn writer(&self) -> &PartitionWriter {
        &self.writer
    }

    #[cfg(test)]
    pub fn ledger_entry(&self, file: &Path) -> Option<DateTime<Utc>> {
        self.ledger.lock().get(&file_identity(file))
    }

    /// Ingests every matching CSV under `source`, `workers` files at a time.
    pub fn run(&self, source: &Path, attribution: &Attribution) -> Result<RunReport> {
        let source = fs::canonicalize(source)
            .with_context(|| format!("source directory {}", source.display()))?;
        let files = find_csv_files(&source, &self.config.patterns);
        info!(source = %source.display(), files = files.len(), "discovered source files");

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.workers)
            .build()
            .context("failed to build worker pool")?;
        let outcomes: Vec<FileOutcome> = pool.install(|| {
            files
                .par_iter()
                .map(|file| self.ingest_file(&source, file, attribution))
                .collect()
        });

        Ok(RunReport {
            files: files.into_iter().zip(outcomes).collect(),
        })
    }

    /// Runs one file through the per-file path and reports the outcome.
    pub fn ingest_file(&self, source: &Path, file: &Path, attribution: &Attribution) -> FileOutcome {
        let outcome = match self.try_ingest(source, file, attribution) {
            Ok(outcome) => outcome,
            Err(e) => FileOutcome::Failed(e),
        };
        match &outcome {
            FileOutcome::Skipped => info!(file = %file.display(), "skipped (up-to-date)"),
            FileOutcome::Ingested {
                records,
                dropped,
                partitions,
            } => info!(file = %file.display(), records, dropped, partitions, "ingested"),
            FileOutcome::Failed(e) => warn!(file = %file.display(), error = %e, "ingest failed"),
        }
        outcome
    }

    fn try_ingest(
        &self,
        source: &Path,
        file: &Path,
        attribution: &Attribution,
    ) -> Result<FileOutcome, IngestError> {
        let identity = file_identity(file);
        let modified = modified_time(file)?;

        let processed = self
            .ledger
            .lock()
            .has_processed(&identity, modified)
            .map_err(IngestError::LedgerUnavailable)?;
        if processed {
            return Ok(FileOutcome::Skipped);
        }

        let (plant_id, machine_id) = match attribution {
            Attribution::FromPath => attribute(source, file).map_err(IngestError::Source)?,
            Attribution::Fixed {
                plant_id,
                machine_id,
            } => (plant_id.clone(), machine_id.clone()),
        };

        let parsed = SensorFile::open(file)?;
        if parsed.dropped > 0 {
            warn!(file = %file.display(), dropped = parsed.dropped, "dropped invalid data lines");
        }

        let records = parsed.readings.len();
        let dropped = parsed.dropped;
        let groups = group_by_partition(&plant_id, &machine_id, parsed);
        let partitions = groups.len();
        for batch in groups.values() {
            self.writer.merge_and_write(batch)?;
        }

        self.ledger
            .lock()
            .record_processed(&identity, modified)
            .map_err(IngestError::LedgerUnavailable)?;

        Ok(FileOutcome::Ingested {
            records,
            dropped,
            partitions,
        })
    }
}

fn file_identity(file: &Path) -> String {
    file.to_string_lossy().into_owned()
}

fn modified_time(file: &Path) -> Result<DateTime<Utc>, IngestError> {
    fs::metadata(file)
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .map_err(|e| IngestError::Source(format!("cannot stat {}: {e}", file.display())))
}

/// Splits a file's readings into one record batch per partition, keeping
/// source order inside each batch.
fn group_by_partition(
    plant_id: &str,
    machine_id: &str,
    parsed: SensorFile,
) -> BTreeMap<PartitionKey, Vec<Record>> {
    let ids: Vec<String> = parsed.header.parameters.into_iter().map(|p| p.id).collect();
    let mut groups: BTreeMap<PartitionKey, Vec<Record>> = BTreeMap::new();
    for reading in parsed.readings {
        let measurements = ids
            .iter()
            .cloned()
            .zip(reading.values.into_iter().map(Some))
            .collect();
        let record = Record::new(plant_id, machine_id, reading.timestamp, measurements);
        groups.entry(record.key.clone()).or_default().push(record);
    }
    groups
}
