//! Sensor CSV reader.
//!
//! A sensor export starts with three header lines, each led by a label for
//! the timestamp column:
//!
//! ```text
//! Datetime,TAG-001,TAG-002      <- parameter ids
//! Name,Bearing temp,Vibration   <- parameter names
//! Unit,degC,mm/s                <- units
//! 2024-01-01 00:00:00,36.5,0.12
//! ```
//!
//! Data lines that cannot become a complete reading are dropped and counted,
//! never passed on.

use chrono::NaiveDateTime;
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("missing header line {line} (parameter ids, names, units)")]
    MissingHeader { line: usize },
    #[error("header declares no parameters")]
    NoParameters,
    #[error("parameter id in column {column} is empty")]
    EmptyParameterId { column: usize },
    #[error("parameter id '{0}' appears twice")]
    DuplicateParameterId(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub id: String,
    pub name: String,
    pub unit: String,
}

/// The parameter master of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorHeader {
    pub timestamp_label: String,
    pub parameters: Vec<Parameter>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub timestamp: NaiveDateTime,
    /// One value per header parameter, same order.
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SensorFile {
    pub header: SensorHeader,
    pub readings: Vec<Reading>,
    /// Data lines rejected for a bad timestamp, a missing or non-numeric
    /// value, or the wrong number of cells.
    pub dropped: usize,
}

impl SensorFile {
    pub fn open(path: &Path) -> Result<Self, ParseError> {
        Self::parse(BufReader::new(File::open(path)?))
    }

    pub fn parse<R: BufRead>(reader: R) -> Result<Self, ParseError> {
        let mut lines = reader.lines();
        let header = read_header(&mut lines)?;
        let width = header.parameters.len() + 1;

        let mut readings = Vec::new();
        let mut dropped = 0;
        for (index, line) in lines.enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match parse_data_line(&line, width) {
                Some(reading) => readings.push(reading),
                None => {
                    dropped += 1;
                    debug!(line = index + 4, "dropping unparseable data line");
                }
            }
        }

        Ok(Self {
            header,
            readings,
            dropped,
        })
    }
}

/// Reads only the three header lines of `path`.
pub fn read_header_file(path: &Path) -> Result<SensorHeader, ParseError> {
    let mut lines = BufReader::new(File::open(path)?).lines();
    read_header(&mut lines)
}

fn read_header<I>(lines: &mut I) -> Result<SensorHeader, ParseError>
where
    I: Iterator<Item = io::Result<String>>,
{
    let mut rows: Vec<Vec<String>> = Vec::with_capacity(3);
    for line_no in 1..=3 {
        let line = lines
            .next()
            .ok_or(ParseError::MissingHeader { line: line_no })??;
        let line = if line_no == 1 {
            line.trim_start_matches('\u{feff}').to_string()
        } else {
            line
        };
        rows.push(split_cells(&line).map(str::to_string).collect());
    }

    let ids = &rows[0];
    if ids.len() < 2 {
        return Err(ParseError::NoParameters);
    }
    let cell = |row: usize, col: usize| rows[row].get(col).cloned().unwrap_or_default();

    let mut seen = HashSet::new();
    let mut parameters = Vec::with_capacity(ids.len() - 1);
    for (column, id) in ids.iter().enumerate().skip(1) {
        if id.is_empty() {
            return Err(ParseError::EmptyParameterId { column });
        }
        if !seen.insert(id.as_str()) {
            return Err(ParseError::DuplicateParameterId(id.clone()));
        }
        parameters.push(Parameter {
            id: id.clone(),
            name: cell(1, column),
            unit: cell(2, column),
        });
    }

    Ok(SensorHeader {
        timestamp_label: ids[0].clone(),
        parameters,
    })
}

fn parse_data_line(line: &str, width: usize) -> Option<Reading> {
    let mut cells = split_cells(line);
    let timestamp = parse_timestamp(cells.next()?)?;
    let values = cells
        .map(|c| c.parse::<f64>().ok().filter(|v| v.is_finite()))
        .collect::<Option<Vec<f64>>>()?;
    if values.len() + 1 != width {
        return None;
    }
    Some(Reading { timestamp, values })
}

fn split_cells(line: &str) -> impl Iterator<Item = &str> {
    line.trim_end_matches(['\r', '\n'])
        .split(',')
        .map(|c| c.trim().trim_matches('"'))
}

pub fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    const SAMPLE: &str = "\
Datetime,TAG-001,TAG-002
Name,Bearing temp,Vibration
Unit,degC,mm/s
2024-01-01 00:00:00,36.5,0.12
2024-01-01 00:01:00,36.6,0.13
";

    fn ts(d: u32, h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, d)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn parse_header_and_readings() {
        let file = SensorFile::parse(SAMPLE.as_bytes()).unwrap();
        assert_eq!(file.header.timestamp_label, "Datetime");
        assert_eq!(
            file.header.parameters[1],
            Parameter {
                id: "TAG-002".into(),
                name: "Vibration".into(),
                unit: "mm/s".into(),
            }
        );
        assert_eq!(file.readings.len(), 2);
        assert_eq!(file.readings[0].timestamp, ts(1, 0, 0, 0));
        assert_eq!(file.readings[1].values, vec![36.6, 0.13]);
        assert_eq!(file.dropped, 0);
    }

    #[test]
    fn bad_lines_are_dropped_and_counted() {
        let text = "\
Datetime,A,B
Name,a,b
Unit,u,u
2024-01-01 00:00:00,1,2
not a date,1,2
2024-01-01 00:02:00,,2
2024-01-01 00:03:00,1,x
2024-01-01 00:04:00,1
2024-01-01 00:05:00,1,2,3
2024-01-01 00:06:00,NaN,2

2024-01-01 00:07:00,3,4
";
        let file = SensorFile::parse(text.as_bytes()).unwrap();
        assert_eq!(file.readings.len(), 2);
        assert_eq!(file.readings[1].timestamp, ts(1, 0, 7, 0));
        assert_eq!(file.dropped, 6);
    }

    #[test]
    fn bom_and_crlf_are_handled() {
        let text = "\u{feff}Datetime,A\r\nName,a\r\nUnit,u\r\n2024/01/02 03:04:05,1.5\r\n";
        let file = SensorFile::parse(text.as_bytes()).unwrap();
        assert_eq!(file.header.timestamp_label, "Datetime");
        assert_eq!(file.header.parameters[0].id, "A");
        assert_eq!(file.readings[0].timestamp, ts(2, 3, 4, 5));
        assert_eq!(file.readings[0].values, vec![1.5]);
    }

    #[test]
    fn short_name_and_unit_lines_are_padded() {
        let text = "Datetime,A,B\nName,a\nUnit\n";
        let file = SensorFile::parse(text.as_bytes()).unwrap();
        assert_eq!(file.header.parameters[1].name, "");
        assert_eq!(file.header.parameters[0].unit, "");
        assert!(file.readings.is_empty());
    }

    #[test]
    fn header_errors() {
        assert!(matches!(
            SensorFile::parse("Datetime,A\nName,a\n".as_bytes()),
            Err(ParseError::MissingHeader { line: 3 })
        ));
        assert!(matches!(
            SensorFile::parse("Datetime\nName\nUnit\n".as_bytes()),
            Err(ParseError::NoParameters)
        ));
        assert!(matches!(
            SensorFile::parse("Datetime,A,,B\nn\nu\n".as_bytes()),
            Err(ParseError::EmptyParameterId { column: 2 })
        ));
        assert!(matches!(
            SensorFile::parse("Datetime,A,A\nn\nu\n".as_bytes()),
            Err(ParseError::DuplicateParameterId(id)) if id == "A"
        ));
    }

    #[test]
    fn invalid_utf8_is_an_error() {
        let mut bytes = b"Datetime,A\nName,a\nUnit,u\n2024-01-01 00:00:00,".to_vec();
        bytes.extend_from_slice(&[0xff, 0xfe, b'\n']);
        assert!(matches!(
            SensorFile::parse(bytes.as_slice()),
            Err(ParseError::Io(_))
        ));
    }

    #[test]
    fn timestamp_formats() {
        let expected = ts(3, 12, 30, 0);
        for s in [
            "2024-01-03 12:30:00",
            "2024/01/03 12:30:00",
            "2024-01-03T12:30:00",
            "2024-01-03 12:30",
            "2024/01/03 12:30",
            "2024-01-03T12:30",
        ] {
            assert_eq!(parse_timestamp(s), Some(expected), "{s}");
        }
        let frac = parse_timestamp("2024-01-03 12:30:00.250").unwrap();
        assert_eq!(frac, expected + chrono::Duration::milliseconds(250));
        assert_eq!(parse_timestamp("2024-13-01 00:00:00"), None);
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn read_header_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Vib.csv");
        std::fs::write(&path, SAMPLE).unwrap();
        let header = read_header_file(&path).unwrap();
        assert_eq!(header.parameters.len(), 2);
        assert_eq!(header.parameters[0].name, "Bearing temp");
    }
}
