use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use chrono::DateTime;
use chrono::TimeZone;
use chrono::Utc;
use rusqlite::params;
use rusqlite::Connection;
use rusqlite_migration::Migrations;
use rusqlite_migration::M;

use crate::errors::Classify;
use crate::errors::PipelineResult;
use crate::recovery::open_conn;

use super::Sink;
use super::StatRow;

static MIGRATIONS: OnceLock<Migrations<'static>> = OnceLock::new();

fn get_migrations() -> &'static Migrations<'static> {
    MIGRATIONS.get_or_init(|| {
        Migrations::new(vec![M::up(
            "CREATE TABLE hotel_statistics ( \
             updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP, \
             query_name TEXT NOT NULL, \
             window_start INTEGER NOT NULL, \
             window_end INTEGER NOT NULL, \
             city TEXT NOT NULL, \
             wthr_date TEXT NOT NULL, \
             distinct_hotel_count INTEGER NOT NULL CHECK (distinct_hotel_count >= 0), \
             avg_avg_tmpr_c REAL, \
             max_avg_tmpr_c REAL, \
             min_avg_tmpr_c REAL, \
             avg_avg_tmpr_f REAL, \
             max_avg_tmpr_f REAL, \
             min_avg_tmpr_f REAL, \
             records INTEGER NOT NULL CHECK (records >= 0), \
             epoch INTEGER NOT NULL, \
             PRIMARY KEY (query_name, window_start, window_end, city, wthr_date), \
             CHECK (window_start < window_end) \
             ) STRICT",
        )])
    })
}

#[test]
fn migrations_valid() -> rusqlite_migration::Result<()> {
    get_migrations().validate()
}

/// Durable upsert table of aggregated rows.
///
/// Keyed by `(window_start, window_end, city, wthr_date)` within a
/// query. Writing a row whose key already exists overwrites it, so
/// re-delivered batches are harmless.
pub struct SqliteTableSink {
    conn: Connection,
    query_name: String,
}

impl SqliteTableSink {
    pub fn open(path: &Path, query_name: &str, busy_timeout: Duration) -> PipelineResult<Self> {
        tracing::info!("Opening output table at {path:?}");
        let conn = open_conn(Some(path), busy_timeout, get_migrations())
            .sink_failure(&format!("can't open output DB {path:?}"))?;
        Ok(Self {
            conn,
            query_name: query_name.to_string(),
        })
    }

    pub fn in_memory(query_name: &str) -> PipelineResult<Self> {
        let conn = open_conn(None, Duration::from_secs(5), get_migrations())
            .sink_failure("can't open in-memory output DB")?;
        Ok(Self {
            conn,
            query_name: query_name.to_string(),
        })
    }

    /// Stored rows ordered by window then key, optionally only for one
    /// city.
    pub fn rows(&self, city: Option<&str>, limit: Option<usize>) -> PipelineResult<Vec<StatRow>> {
        let limit = limit.map_or(-1, |limit| limit as i64);
        let mut stmt = self
            .conn
            .prepare(
                "SELECT window_start, window_end, city, wthr_date, distinct_hotel_count, \
                 avg_avg_tmpr_c, max_avg_tmpr_c, min_avg_tmpr_c, \
                 avg_avg_tmpr_f, max_avg_tmpr_f, min_avg_tmpr_f, records \
                 FROM hotel_statistics \
                 WHERE query_name = ?1 AND (?2 IS NULL OR city = ?2) \
                 ORDER BY window_start, window_end, city, wthr_date \
                 LIMIT ?3",
            )
            .sink_failure("error preparing row query")?;
        let rows = stmt
            .query_map(params![self.query_name, city, limit], |row| {
                Ok(StatRow {
                    window_start: from_millis(row.get(0)?, 0)?,
                    window_end: from_millis(row.get(1)?, 1)?,
                    city: row.get(2)?,
                    wthr_date: row.get(3)?,
                    distinct_hotel_count: row.get::<_, i64>(4)? as u64,
                    avg_avg_tmpr_c: row.get(5)?,
                    max_avg_tmpr_c: row.get(6)?,
                    min_avg_tmpr_c: row.get(7)?,
                    avg_avg_tmpr_f: row.get(8)?,
                    max_avg_tmpr_f: row.get(9)?,
                    min_avg_tmpr_f: row.get(10)?,
                    records: row.get::<_, i64>(11)? as u64,
                })
            })
            .sink_failure("error querying rows")?
            .collect::<Result<Vec<_>, _>>()
            .sink_failure("error reading rows")?;
        Ok(rows)
    }

    /// Cities by their largest distinct hotel count in any row,
    /// biggest first.
    pub fn top_cities(&self, limit: usize) -> PipelineResult<Vec<(String, u64)>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT city, MAX(distinct_hotel_count) AS biggest \
                 FROM hotel_statistics \
                 WHERE query_name = ?1 \
                 GROUP BY city \
                 ORDER BY biggest DESC, city \
                 LIMIT ?2",
            )
            .sink_failure("error preparing top cities query")?;
        let cities = stmt
            .query_map(params![self.query_name, limit as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })
            .sink_failure("error querying top cities")?
            .collect::<Result<Vec<_>, _>>()
            .sink_failure("error reading top cities")?;
        Ok(cities)
    }
}

fn from_millis(millis: i64, col: usize) -> rusqlite::Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(col, millis))
}

impl Sink for SqliteTableSink {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn write_batch(&mut self, epoch: u64, rows: &[StatRow]) -> PipelineResult<()> {
        let txn = self
            .conn
            .transaction()
            .sink_failure("error starting output transaction")?;
        for row in rows {
            tracing::trace!("Upserting {row:?}");
            txn.execute(
                "INSERT INTO hotel_statistics (query_name, window_start, window_end, city, \
                 wthr_date, distinct_hotel_count, avg_avg_tmpr_c, max_avg_tmpr_c, \
                 min_avg_tmpr_c, avg_avg_tmpr_f, max_avg_tmpr_f, min_avg_tmpr_f, records, epoch) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14) \
                 ON CONFLICT (query_name, window_start, window_end, city, wthr_date) DO UPDATE \
                 SET distinct_hotel_count = EXCLUDED.distinct_hotel_count, \
                 avg_avg_tmpr_c = EXCLUDED.avg_avg_tmpr_c, \
                 max_avg_tmpr_c = EXCLUDED.max_avg_tmpr_c, \
                 min_avg_tmpr_c = EXCLUDED.min_avg_tmpr_c, \
                 avg_avg_tmpr_f = EXCLUDED.avg_avg_tmpr_f, \
                 max_avg_tmpr_f = EXCLUDED.max_avg_tmpr_f, \
                 min_avg_tmpr_f = EXCLUDED.min_avg_tmpr_f, \
                 records = EXCLUDED.records, \
                 epoch = EXCLUDED.epoch, \
                 updated_at = CURRENT_TIMESTAMP",
                params![
                    self.query_name,
                    row.window_start.timestamp_millis(),
                    row.window_end.timestamp_millis(),
                    row.city,
                    row.wthr_date,
                    row.distinct_hotel_count as i64,
                    row.avg_avg_tmpr_c,
                    row.max_avg_tmpr_c,
                    row.min_avg_tmpr_c,
                    row.avg_avg_tmpr_f,
                    row.max_avg_tmpr_f,
                    row.min_avg_tmpr_f,
                    row.records as i64,
                    epoch as i64,
                ],
            )
            .sink_failure("error upserting row")?;
        }
        txn.commit().sink_failure("error committing output rows")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outputs::tests::row;

    #[test]
    fn upsert_is_idempotent() {
        let mut sink = SqliteTableSink::in_memory("q").unwrap();
        let rows = vec![row("Kyiv", 0, 2), row("Lviv", 0, 4)];
        sink.write_batch(1, &rows).unwrap();
        sink.write_batch(1, &rows).unwrap();

        assert_eq!(sink.rows(None, None).unwrap(), rows);
    }

    #[test]
    fn upsert_overwrites_values() {
        let mut sink = SqliteTableSink::in_memory("q").unwrap();
        sink.write_batch(1, &[row("Kyiv", 0, 2)]).unwrap();
        sink.write_batch(2, &[row("Kyiv", 0, 5)]).unwrap();

        let rows = sink.rows(Some("Kyiv"), None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].distinct_hotel_count, 5);
    }

    #[test]
    fn rows_filter_and_limit() {
        let mut sink = SqliteTableSink::in_memory("q").unwrap();
        sink.write_batch(
            1,
            &[row("Kyiv", 0, 2), row("Kyiv", 1, 3), row("Lviv", 0, 4)],
        )
        .unwrap();

        assert_eq!(sink.rows(Some("Kyiv"), None).unwrap().len(), 2);
        assert_eq!(sink.rows(None, Some(1)).unwrap().len(), 1);
        assert!(sink.rows(Some("Odesa"), None).unwrap().is_empty());
    }

    #[test]
    fn top_cities_by_biggest_count() {
        let mut sink = SqliteTableSink::in_memory("q").unwrap();
        sink.write_batch(
            1,
            &[row("Kyiv", 0, 2), row("Kyiv", 1, 9), row("Lviv", 0, 4)],
        )
        .unwrap();

        assert_eq!(
            sink.top_cities(10).unwrap(),
            vec![("Kyiv".to_string(), 9), ("Lviv".to_string(), 4)]
        );
    }

    #[test]
    fn null_temperatures_round_trip() {
        let mut sink = SqliteTableSink::in_memory("q").unwrap();
        let mut nulls = row("Kyiv", 0, 1);
        nulls.avg_avg_tmpr_c = None;
        nulls.max_avg_tmpr_c = None;
        nulls.min_avg_tmpr_c = None;
        sink.write_batch(1, &[nulls.clone()]).unwrap();

        assert_eq!(sink.rows(None, None).unwrap(), vec![nulls]);
    }
}
