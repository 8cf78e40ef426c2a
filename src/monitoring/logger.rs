use anyhow::{Context, Result};
use csv::{Writer, WriterBuilder};
use std::fs::{File, OpenOptions};
use std::path::Path;

use crate::data::types::SnapshotRecord;
use crate::execution::persistence::{SnapshotSink, WriteError};

const HEADER: [&str; 5] = ["timestamp", "instrument", "value", "previous_value", "delta"];

/// Append-only CSV audit trail of committed snapshots.
pub struct CsvLogger {
    writer: Writer<File>,
}

impl CsvLogger {
    pub fn new(log_path: String) -> Result<Self> {
        let is_new = !Path::new(&log_path).exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("Failed to open CSV log at {}", log_path))?;

        let mut writer = WriterBuilder::new().has_headers(false).from_writer(file);

        // Create CSV file with headers if it doesn't exist
        if is_new {
            writer.write_record(HEADER)?;
            writer.flush()?;
        }

        Ok(Self { writer })
    }

    /// Log a committed snapshot to CSV
    pub fn log_snapshot(&mut self, record: &SnapshotRecord) -> csv::Result<()> {
        let optional = |v: Option<rust_decimal::Decimal>| v.map(|v| v.to_string()).unwrap_or_default();

        self.writer.write_record([
            record.recorded_at.to_rfc3339(),
            record.instrument.clone(),
            record.value.to_string(),
            optional(record.previous_value),
            optional(record.delta),
        ])?;
        self.writer.flush()?;
        Ok(())
    }
}

impl SnapshotSink for CsvLogger {
    fn name(&self) -> &'static str {
        "csv"
    }

    fn write(&mut self, record: &SnapshotRecord) -> Result<(), WriteError> {
        self.log_snapshot(record)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::local;
    use rust_decimal_macros::dec;

    #[test]
    fn test_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshots.csv").to_str().unwrap().to_string();

        let mut logger = CsvLogger::new(path.clone()).unwrap();
        let at = local(2024, 3, 20, 14, 30, 45);
        logger
            .write(&SnapshotRecord::new("JUL24-AUG24".into(), dec!(100.25), None, at))
            .unwrap();
        logger
            .write(&SnapshotRecord::new("AHD, 3M".into(), dec!(101.00), Some(dec!(100.25)), at))
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "timestamp,instrument,value,previous_value,delta");
        assert!(lines[1].ends_with(",JUL24-AUG24,100.25,,"));
        assert!(lines[2].ends_with(",\"AHD, 3M\",101.00,100.25,0.75"));
    }

    #[test]
    fn test_existing_file_keeps_single_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshots.csv").to_str().unwrap().to_string();
        let at = local(2024, 3, 20, 14, 30, 45);

        CsvLogger::new(path.clone())
            .unwrap()
            .write(&SnapshotRecord::new("JUL24-AUG24".into(), dec!(100.25), None, at))
            .unwrap();
        CsvLogger::new(path.clone())
            .unwrap()
            .write(&SnapshotRecord::new("JUL24-AUG24".into(), dec!(100.50), Some(dec!(100.25)), at))
            .unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        assert_eq!(reader.headers().unwrap().iter().collect::<Vec<_>>(), HEADER.to_vec());
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[1][2], "100.50");
        assert_eq!(&rows[1][4], "0.25");
    }

    #[test]
    fn test_quoted_instrument_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshots.csv").to_str().unwrap().to_string();

        let mut logger = CsvLogger::new(path.clone()).unwrap();
        logger
            .write(&SnapshotRecord::new(
                "AHD \"3M\", CASH".into(),
                dec!(1.5),
                None,
                local(2024, 3, 20, 9, 0, 0),
            ))
            .unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let row = reader.records().next().unwrap().unwrap();
        assert_eq!(&row[1], "AHD \"3M\", CASH");
        assert_eq!(&row[3], "");
    }
}
