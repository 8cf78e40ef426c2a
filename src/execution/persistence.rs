use anyhow::{Context, Result};
use chrono::{DateTime, Local, SecondsFormat, Utc};
use rusqlite::{params, Connection, Row};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use tracing::info;

use crate::data::types::{Instrument, SnapshotRecord};

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("writer closed before record could be queued")]
    Closed,
}

/// Append-only destination for committed snapshot records.
///
/// Called once per confirmed transition, from the writer task.
pub trait SnapshotSink: Send {
    fn name(&self) -> &'static str;

    fn write(&mut self, record: &SnapshotRecord) -> Result<(), WriteError>;
}

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    instrument TEXT NOT NULL,
    value TEXT NOT NULL,
    previous_value TEXT,
    delta TEXT,
    -- UTC, fixed-width RFC 3339 so text order is time order
    recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_snapshots_instrument ON snapshots(instrument, recorded_at);
CREATE INDEX IF NOT EXISTS idx_snapshots_recorded_at ON snapshots(recorded_at);
"#;

/// Activity of one instrument over a reporting window.
#[derive(Debug, Clone, PartialEq)]
pub struct SpreadSummary {
    pub instrument: Instrument,
    pub updates: usize,
    /// Mean of recorded deltas; `None` when only baseline records exist.
    pub avg_change: Option<Decimal>,
    pub min_value: Decimal,
    pub max_value: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseStats {
    pub total_snapshots: usize,
    pub unique_instruments: usize,
    pub oldest_record: Option<DateTime<Local>>,
    pub newest_record: Option<DateTime<Local>>,
}

pub struct SnapshotDatabase {
    conn: Connection,
}

impl SnapshotDatabase {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database at {}", db_path))?;

        conn.execute_batch(SCHEMA_SQL)?;

        Ok(Self { conn })
    }

    /// Insert a committed snapshot
    pub fn insert_snapshot(&self, record: &SnapshotRecord) -> rusqlite::Result<i64> {
        self.conn.execute(
            "INSERT INTO snapshots (instrument, value, previous_value, delta, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.instrument,
                record.value.to_string(),
                record.previous_value.map(|v| v.to_string()),
                record.delta.map(|v| v.to_string()),
                db_timestamp(&record.recorded_at),
            ],
        )?;

        Ok(self.conn.last_insert_rowid())
    }

    #[cfg(test)]
    pub fn count_snapshots(&self) -> Result<usize> {
        let count: usize =
            self.conn
                .query_row("SELECT COUNT(*) FROM snapshots", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Snapshots recorded at or after `since`, oldest first
    pub fn recent_snapshots(&self, since: DateTime<Local>) -> Result<Vec<SnapshotRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT instrument, value, previous_value, delta, recorded_at
             FROM snapshots
             WHERE recorded_at >= ?1
             ORDER BY recorded_at, id",
        )?;

        let rows = stmt.query_map(params![db_timestamp(&since)], read_record)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(|e| e.into())
    }

    /// History of one instrument since `since`, oldest first
    #[cfg(test)]
    pub fn instrument_history(
        &self,
        instrument: &str,
        since: DateTime<Local>,
    ) -> Result<Vec<SnapshotRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT instrument, value, previous_value, delta, recorded_at
             FROM snapshots
             WHERE instrument = ?1 AND recorded_at >= ?2
             ORDER BY recorded_at, id",
        )?;

        let rows = stmt.query_map(params![instrument, db_timestamp(&since)], read_record)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(|e| e.into())
    }

    /// Largest absolute moves recorded, biggest first
    pub fn largest_moves(&self, top_n: usize) -> Result<Vec<SnapshotRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT instrument, value, previous_value, delta, recorded_at
             FROM snapshots
             WHERE delta IS NOT NULL
             ORDER BY ABS(CAST(delta AS REAL)) DESC, id
             LIMIT ?1",
        )?;

        let rows = stmt.query_map(params![top_n as i64], read_record)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(|e| e.into())
    }

    /// Most recent recorded value per instrument
    pub fn latest_values(&self) -> Result<HashMap<Instrument, Decimal>> {
        let mut stmt = self.conn.prepare(
            "SELECT s.instrument, s.value
             FROM snapshots s
             WHERE s.id = (SELECT MAX(id) FROM snapshots WHERE instrument = s.instrument)",
        )?;

        let rows = stmt.query_map([], |row| {
            let instrument: String = row.get(0)?;
            let value = decimal_column(row, 1)?;
            Ok((instrument, value))
        })?;

        rows.collect::<Result<HashMap<_, _>, _>>().map_err(|e| e.into())
    }

    /// Per-instrument update count, mean change and value range since `since`
    pub fn spread_summary(&self, since: DateTime<Local>) -> Result<Vec<SpreadSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT instrument, value, previous_value, delta, recorded_at
             FROM snapshots
             WHERE recorded_at >= ?1
             ORDER BY instrument, id",
        )?;
        let records = stmt
            .query_map(params![db_timestamp(&since)], read_record)?
            .collect::<Result<Vec<_>, _>>()?;

        // Decimals are stored as text, so aggregate here rather than in SQL
        let mut grouped: BTreeMap<Instrument, (SpreadSummary, Decimal, usize)> = BTreeMap::new();
        for record in records {
            let (summary, delta_sum, delta_count) =
                grouped.entry(record.instrument.clone()).or_insert_with(|| {
                    (
                        SpreadSummary {
                            instrument: record.instrument.clone(),
                            updates: 0,
                            avg_change: None,
                            min_value: record.value,
                            max_value: record.value,
                        },
                        Decimal::ZERO,
                        0,
                    )
                });

            summary.updates += 1;
            summary.min_value = summary.min_value.min(record.value);
            summary.max_value = summary.max_value.max(record.value);
            if let Some(delta) = record.delta {
                *delta_sum = delta_sum.saturating_add(delta);
                *delta_count += 1;
            }
        }

        Ok(grouped
            .into_values()
            .map(|(mut summary, delta_sum, delta_count)| {
                if delta_count > 0 {
                    summary.avg_change = delta_sum.checked_div(Decimal::from(delta_count));
                }
                summary
            })
            .collect())
    }

    pub fn database_stats(&self) -> Result<DatabaseStats> {
        let (total, unique, oldest, newest): (usize, usize, Option<String>, Option<String>) =
            self.conn.query_row(
                "SELECT COUNT(*), COUNT(DISTINCT instrument), MIN(recorded_at), MAX(recorded_at)
                 FROM snapshots",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )?;

        Ok(DatabaseStats {
            total_snapshots: total,
            unique_instruments: unique,
            oldest_record: oldest.as_deref().map(parse_timestamp).transpose()?,
            newest_record: newest.as_deref().map(parse_timestamp).transpose()?,
        })
    }
}

impl SnapshotSink for SnapshotDatabase {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn write(&mut self, record: &SnapshotRecord) -> Result<(), WriteError> {
        self.insert_snapshot(record)?;
        Ok(())
    }
}

/// What the recorder wrote during one run, for the shutdown log.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    pub stats: DatabaseStats,
    pub recorded: Vec<SnapshotRecord>,
    pub summaries: Vec<SpreadSummary>,
    pub largest_moves: Vec<SnapshotRecord>,
}

pub fn session_report(db: &SnapshotDatabase, since: DateTime<Local>) -> Result<SessionReport> {
    Ok(SessionReport {
        stats: db.database_stats()?,
        recorded: db.recent_snapshots(since)?,
        summaries: db.spread_summary(since)?,
        largest_moves: db.largest_moves(5)?,
    })
}

/// Load the last recorded value of every instrument so a restart continues
/// from where the previous run left off.
pub fn recover_committed_values(db: &SnapshotDatabase) -> Result<HashMap<Instrument, Decimal>> {
    info!("Recovering committed values...");

    let stats = db.database_stats()?;
    info!(
        total = stats.total_snapshots,
        instruments = stats.unique_instruments,
        oldest = ?stats.oldest_record,
        newest = ?stats.newest_record,
        "database stats"
    );

    let latest = db.latest_values()?;
    info!("Recovered baseline for {} instruments", latest.len());
    Ok(latest)
}

fn read_record(row: &Row<'_>) -> rusqlite::Result<SnapshotRecord> {
    let recorded_at: String = row.get(4)?;
    Ok(SnapshotRecord {
        instrument: row.get(0)?,
        value: decimal_column(row, 1)?,
        previous_value: optional_decimal_column(row, 2)?,
        delta: optional_decimal_column(row, 3)?,
        recorded_at: parse_timestamp(&recorded_at)
            .map_err(|e| conversion_error(4, e))?,
    })
}

fn decimal_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let raw: String = row.get(idx)?;
    Decimal::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn optional_decimal_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| Decimal::from_str(&s).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn db_timestamp(at: &DateTime<Local>) -> String {
    at.with_timezone(&Utc).to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Local>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Local))
}

fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::local;
    use rust_decimal_macros::dec;

    fn record(instrument: &str, value: Decimal, prev: Option<Decimal>, min: u32) -> SnapshotRecord {
        SnapshotRecord::new(instrument.into(), value, prev, local(2024, 3, 20, 9, min, 0))
    }

    fn seeded() -> SnapshotDatabase {
        let mut db = SnapshotDatabase::new(":memory:").expect("Failed to create database");
        db.write(&record("JUL24-AUG24", dec!(100.25), None, 0)).unwrap();
        db.write(&record("JUL24-AUG24", dec!(101.00), Some(dec!(100.25)), 5)).unwrap();
        db.write(&record("SEP24-OCT24", dec!(50.00), None, 6)).unwrap();
        db.write(&record("SEP24-OCT24", dec!(48.50), Some(dec!(50.00)), 10)).unwrap();
        db
    }

    #[test]
    fn test_create_empty() {
        let db = SnapshotDatabase::new(":memory:").expect("Failed to create database");
        assert_eq!(db.count_snapshots().unwrap(), 0);

        let stats = db.database_stats().unwrap();
        assert_eq!(stats.total_snapshots, 0);
        assert_eq!(stats.oldest_record, None);
        assert!(db.latest_values().unwrap().is_empty());
    }

    #[test]
    fn test_insert_and_read_back() {
        let db = seeded();
        assert_eq!(db.count_snapshots().unwrap(), 4);

        let history = db
            .instrument_history("JUL24-AUG24", local(2024, 3, 20, 0, 0, 0))
            .unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].value, dec!(100.25));
        assert_eq!(history[0].previous_value, None);
        assert_eq!(history[1].previous_value, Some(dec!(100.25)));
        assert_eq!(history[1].delta, Some(dec!(0.75)));
        assert_eq!(history[1].recorded_at, local(2024, 3, 20, 9, 5, 0));
    }

    #[test]
    fn test_recent_snapshots() {
        let db = seeded();
        let recent = db.recent_snapshots(local(2024, 3, 20, 9, 5, 0)).unwrap();
        let values: Vec<_> = recent.iter().map(|r| r.value).collect();
        assert_eq!(values, vec![dec!(101.00), dec!(50.00), dec!(48.50)]);
    }

    #[test]
    fn test_largest_moves() {
        let db = seeded();
        let moves = db.largest_moves(10).unwrap();
        assert_eq!(moves.len(), 2);
        assert_eq!(moves[0].delta, Some(dec!(-1.50)));
        assert_eq!(moves[1].delta, Some(dec!(0.75)));
    }

    #[test]
    fn test_stats_and_latest_values() {
        let db = seeded();
        let stats = db.database_stats().unwrap();
        assert_eq!(stats.total_snapshots, 4);
        assert_eq!(stats.unique_instruments, 2);
        assert_eq!(stats.oldest_record, Some(local(2024, 3, 20, 9, 0, 0)));
        assert_eq!(stats.newest_record, Some(local(2024, 3, 20, 9, 10, 0)));

        let latest = recover_committed_values(&db).unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest["JUL24-AUG24"], dec!(101.00));
        assert_eq!(latest["SEP24-OCT24"], dec!(48.50));
    }

    #[test]
    fn test_timestamps_stored_as_utc() {
        let db = seeded();
        let at = local(2024, 3, 20, 9, 0, 0);
        let raw: String = db
            .conn
            .query_row("SELECT recorded_at FROM snapshots ORDER BY id LIMIT 1", [], |row| row.get(0))
            .unwrap();

        assert!(raw.ends_with('Z'));
        assert_eq!(raw, at.with_timezone(&Utc).to_rfc3339_opts(SecondsFormat::Micros, true));
        assert_eq!(parse_timestamp(&raw).unwrap(), at);
    }

    #[test]
    fn test_time_filter_follows_instants_not_text() {
        let mut db = SnapshotDatabase::new(":memory:").unwrap();
        let base = local(2024, 3, 20, 9, 0, 0);
        // Sub-second timestamps must order correctly against whole seconds
        let early = base + chrono::Duration::milliseconds(999);
        let late = base + chrono::Duration::seconds(1);
        db.write(&SnapshotRecord::new("A".into(), dec!(1), None, late)).unwrap();
        db.write(&SnapshotRecord::new("A".into(), dec!(2), Some(dec!(1)), early)).unwrap();

        let recent = db.recent_snapshots(base + chrono::Duration::milliseconds(500)).unwrap();
        let times: Vec<_> = recent.iter().map(|r| r.recorded_at).collect();
        assert_eq!(times, vec![early, late]);

        let stats = db.database_stats().unwrap();
        assert_eq!(stats.oldest_record, Some(early));
        assert_eq!(stats.newest_record, Some(late));
    }

    #[test]
    fn test_spread_summary() {
        let mut db = seeded();
        db.write(&record("JUL24-AUG24", dec!(100.50), Some(dec!(101.00)), 12)).unwrap();

        let summary = db.spread_summary(local(2024, 3, 20, 0, 0, 0)).unwrap();
        assert_eq!(summary.len(), 2);

        assert_eq!(summary[0].instrument, "JUL24-AUG24");
        assert_eq!(summary[0].updates, 3);
        assert_eq!(summary[0].avg_change, Some(dec!(0.125)));
        assert_eq!(summary[0].min_value, dec!(100.25));
        assert_eq!(summary[0].max_value, dec!(101.00));

        assert_eq!(summary[1].instrument, "SEP24-OCT24");
        assert_eq!(summary[1].avg_change, Some(dec!(-1.50)));

        let later = db.spread_summary(local(2024, 3, 20, 9, 11, 0)).unwrap();
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].updates, 1);
    }

    #[test]
    fn test_session_report() {
        let db = seeded();
        let report = session_report(&db, local(2024, 3, 20, 9, 6, 0)).unwrap();

        assert_eq!(report.stats.total_snapshots, 4);
        assert_eq!(report.recorded.len(), 2);
        assert_eq!(report.summaries.len(), 1);
        assert_eq!(report.summaries[0].instrument, "SEP24-OCT24");
        assert_eq!(report.largest_moves[0].delta, Some(dec!(-1.50)));
    }

    #[test]
    fn test_reopen_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshots.db");
        let path = path.to_str().unwrap();

        {
            let mut db = SnapshotDatabase::new(path).unwrap();
            db.write(&record("JUL24-AUG24", dec!(100.25), None, 0)).unwrap();
        }

        let db = SnapshotDatabase::new(path).unwrap();
        assert_eq!(db.count_snapshots().unwrap(), 1);
    }
}
