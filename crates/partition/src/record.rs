use chrono::{Datelike, NaiveDateTime};
use rowtable::Row;
use std::collections::HashSet;

use crate::key::PartitionKey;

/// One parsed observation in wide form: every measurement taken at
/// `timestamp`, tagged with the partition it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub key: PartitionKey,
    pub timestamp: NaiveDateTime,
    /// `(parameter_id, value)` pairs in source column order. `None` is a
    /// null cell.
    pub measurements: Vec<(String, Option<f64>)>,
}

impl Record {
    /// Builds a record whose year and month are derived from `timestamp`.
    pub fn new(
        plant_id: impl Into<String>,
        machine_id: impl Into<String>,
        timestamp: NaiveDateTime,
        measurements: Vec<(String, Option<f64>)>,
    ) -> Self {
        Self {
            key: PartitionKey::for_timestamp(plant_id, machine_id, timestamp),
            timestamp,
            measurements,
        }
    }

    /// Microseconds since the Unix epoch, reading the naive timestamp as UTC.
    pub fn timestamp_micros(&self) -> i64 {
        self.timestamp.and_utc().timestamp_micros()
    }

    /// Checks the record can be stored without corrupting its dedup key.
    pub fn validate(&self) -> Result<(), String> {
        self.key.validate()?;
        if self.timestamp.year() != self.key.year || self.timestamp.month() != self.key.month {
            return Err(format!(
                "timestamp {} does not fall in partition {}",
                self.timestamp, self.key
            ));
        }

        let mut seen = HashSet::with_capacity(self.measurements.len());
        for (parameter_id, value) in &self.measurements {
            if parameter_id.is_empty() {
                return Err("measurement with empty parameter id".into());
            }
            if !seen.insert(parameter_id.as_str()) {
                return Err(format!("parameter '{parameter_id}' appears twice"));
            }
            match value {
                None => return Err(format!("parameter '{parameter_id}' is null")),
                Some(v) if !v.is_finite() => {
                    return Err(format!("parameter '{parameter_id}' is not finite ({v})"))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Explodes the record into narrow rows. Null measurements are skipped;
    /// callers validate first.
    pub fn rows(&self) -> impl Iterator<Item = Row> + '_ {
        let ts = self.timestamp_micros();
        self.measurements
            .iter()
            .filter_map(move |(p, v)| v.map(|v| Row::new(ts, p.clone(), v)))
    }
}
