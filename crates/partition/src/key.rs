use chrono::{Datelike, NaiveDateTime};
use std::fmt;
use std::path::PathBuf;

/// Partition columns in path order. Fixed; configuration may only restate it.
pub const PARTITION_COLUMNS: [&str; 4] = ["plant_id", "machine_id", "year", "month"];

/// `(plant_id, machine_id, year, month)`: identifies one on-disk partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    pub plant_id: String,
    pub machine_id: String,
    pub year: i32,
    pub month: u32,
}

impl PartitionKey {
    pub fn new(
        plant_id: impl Into<String>,
        machine_id: impl Into<String>,
        year: i32,
        month: u32,
    ) -> Self {
        Self {
            plant_id: plant_id.into(),
            machine_id: machine_id.into(),
            year,
            month,
        }
    }

    /// The key a reading taken at `timestamp` belongs to.
    pub fn for_timestamp(
        plant_id: impl Into<String>,
        machine_id: impl Into<String>,
        timestamp: NaiveDateTime,
    ) -> Self {
        Self::new(plant_id, machine_id, timestamp.year(), timestamp.month())
    }

    /// Directory of this partition relative to the storage root:
    /// `plant_id=<p>/machine_id=<m>/year=<YYYY>/month=<MM>`.
    pub fn relative_path(&self) -> PathBuf {
        let mut path = PathBuf::new();
        path.push(format!("plant_id={}", self.plant_id));
        path.push(format!("machine_id={}", self.machine_id));
        path.push(format!("year={:04}", self.year));
        path.push(format!("month={:02}", self.month));
        path
    }

    /// Checks that every field fits the directory template unambiguously.
    pub fn validate(&self) -> Result<(), String> {
        check_component("plant_id", &self.plant_id)?;
        check_component("machine_id", &self.machine_id)?;
        if !(0..=9999).contains(&self.year) {
            return Err(format!("year {} is not a 4-digit year", self.year));
        }
        if !(1..=12).contains(&self.month) {
            return Err(format!("month {} is outside 1..=12", self.month));
        }
        Ok(())
    }
}

fn check_component(name: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{name} is empty"));
    }
    if value == "." || value == ".." {
        return Err(format!("{name} '{value}' is not a directory name"));
    }
    if value.contains(['/', '\\', '=']) {
        return Err(format!("{name} '{value}' contains a path separator or '='"));
    }
    Ok(())
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "plant_id={}/machine_id={}/year={:04}/month={:02}",
            self.plant_id, self.machine_id, self.year, self.month
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::path::Path;

    #[test]
    fn relative_path_follows_template() {
        let key = PartitionKey::new("P1", "M1", 2024, 1);
        assert_eq!(
            key.relative_path(),
            Path::new("plant_id=P1/machine_id=M1/year=2024/month=01")
        );
    }

    #[test]
    fn equal_keys_resolve_to_same_path() {
        let a = PartitionKey::new("東京第一工場", "101", 2023, 11);
        let b = PartitionKey::new(String::from("東京第一工場"), "101".to_string(), 2023, 11);
        assert_eq!(
            a.relative_path().as_os_str().as_encoded_bytes(),
            b.relative_path().as_os_str().as_encoded_bytes()
        );
    }

    #[test]
    fn year_is_zero_padded_to_four_digits() {
        let key = PartitionKey::new("P", "M", 999, 12);
        assert_eq!(key.to_string(), "plant_id=P/machine_id=M/year=0999/month=12");
    }

    #[test]
    fn for_timestamp_derives_year_and_month() {
        let ts = NaiveDate::from_ymd_opt(2024, 2, 29)
            .unwrap()
            .and_hms_opt(23, 59, 59)
            .unwrap();
        let key = PartitionKey::for_timestamp("P", "M", ts);
        assert_eq!((key.year, key.month), (2024, 2));
    }

    #[test]
    fn validate_rejects_unsafe_components() {
        for bad in ["", ".", "..", "a/b", "a\\b", "k=v"] {
            let key = PartitionKey::new(bad, "M", 2024, 1);
            assert!(key.validate().is_err(), "plant_id {bad:?} should be rejected");
            let key = PartitionKey::new("P", bad, 2024, 1);
            assert!(key.validate().is_err(), "machine_id {bad:?} should be rejected");
        }
    }

    #[test]
    fn validate_rejects_out_of_range_dates() {
        assert!(PartitionKey::new("P", "M", 2024, 0).validate().is_err());
        assert!(PartitionKey::new("P", "M", 2024, 13).validate().is_err());
        assert!(PartitionKey::new("P", "M", 10_000, 1).validate().is_err());
        assert!(PartitionKey::new("P", "M", -1, 1).validate().is_err());
        assert!(PartitionKey::new("P", "M", 2024, 12).validate().is_ok());
    }

    #[test]
    fn keys_order_by_plant_machine_year_month() {
        let mut keys = vec![
            PartitionKey::new("P", "M", 2024, 2),
            PartitionKey::new("P", "M", 2023, 12),
            PartitionKey::new("P", "A", 2025, 1),
        ];
        keys.sort();
        assert_eq!(keys[0].machine_id, "A");
        assert_eq!((keys[1].year, keys[1].month), (2023, 12));
    }
}
