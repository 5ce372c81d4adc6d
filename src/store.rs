//! SQLite cache for raw ring feeds and persistence of pipeline results.

use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use chrono::{DateTime, Days, NaiveDate, Utc};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::features::{ColumnDType, OutputSchema};
use crate::ring::{JsonRecord, TimeSeriesSample};
use crate::table::{Cell, Table};

pub const RAW_TABLE_PREFIX: &str = "raw_";
pub const RUNS_TABLE: &str = "pipeline_runs";
pub const TIMESERIES_TABLE: &str = "sleep_timeseries";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DayRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DayRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        if end < start {
            Self { start: end, end: start }
        } else {
            Self { start, end }
        }
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        self.start <= day && day <= self.end
    }

    pub fn extend_end(self, days: u64) -> Self {
        Self {
            start: self.start,
            end: self.end.checked_add_days(Days::new(days)).unwrap_or(self.end),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("I/O error for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid table name '{0}'")]
    InvalidTableName(String),
    #[error("column '{0}' appears twice (names are case-insensitive)")]
    DuplicateColumn(String),
    #[error("row without a valid 'day' in feed {feed}")]
    MissingDay { feed: String },
}

#[derive(Debug, Error)]
pub enum ReadThroughError<E: std::error::Error + 'static> {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("upstream fetch failed: {0}")]
    Fetch(#[source] E),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheSource {
    Cache,
    Upstream,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub result_table: String,
    pub run_at: String,
    pub schema_version: u32,
    pub schema_fingerprint: String,
    pub row_count: usize,
    pub column_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistOutcome {
    pub run: RunRecord,
    pub previous_fingerprint: Option<String>,
    pub samples_written: usize,
}

impl PersistOutcome {
    pub fn schema_changed(&self) -> bool {
        self.previous_fingerprint
            .as_deref()
            .is_some_and(|prev| prev != self.run.schema_fingerprint)
    }
}

pub struct CacheStore {
    conn: Connection,
}

impl CacheStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA temp_store=MEMORY;
            ",
        )?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS pipeline_runs (
                run_id INTEGER PRIMARY KEY AUTOINCREMENT,
                result_table TEXT NOT NULL,
                run_at TEXT NOT NULL,
                schema_version INTEGER NOT NULL,
                schema_fingerprint TEXT NOT NULL,
                row_count INTEGER NOT NULL,
                column_count INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS sleep_timeseries (
                day TEXT NOT NULL,
                metric_name TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                metric_value REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS sleep_timeseries_day
                ON sleep_timeseries (day, metric_name, timestamp);
            ",
        )?;
        Ok(Self { conn })
    }

    pub fn has_rows_in_range(&self, feed: &str, range: DayRange) -> Result<bool, StoreError> {
        let table = raw_table_name(feed)?;
        if !table_exists(&self.conn, &table)? {
            return Ok(false);
        }

        let sql = format!(
            "SELECT 1 FROM {} WHERE day BETWEEN ?1 AND ?2 LIMIT 1",
            quote_ident(&table)
        );
        let hit = self
            .conn
            .query_row(&sql, params![day_text(range.start), day_text(range.end)], |_| Ok(()))
            .optional()?;
        Ok(hit.is_some())
    }

    pub fn read_range(&self, feed: &str, range: DayRange) -> Result<Vec<JsonRecord>, StoreError> {
        let table = raw_table_name(feed)?;
        if !table_exists(&self.conn, &table)? {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT * FROM {} WHERE day BETWEEN ?1 AND ?2 ORDER BY day ASC, rowid ASC",
            quote_ident(&table)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let names: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();
        let mut rows = stmt.query(params![day_text(range.start), day_text(range.end)])?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut record = JsonRecord::new();
            for (idx, name) in names.iter().enumerate() {
                if let Some(value) = json_from_sql(row.get_ref(idx)?) {
                    record.insert(name.clone(), value);
                }
            }
            out.push(record);
        }
        Ok(out)
    }

    // Not idempotent: re-appending a range duplicates rows.
    pub fn append_rows(&mut self, feed: &str, records: &[JsonRecord]) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let table = raw_table_name(feed)?;

        let tx = self.conn.transaction()?;
        if !table_exists(&tx, &table)? {
            tx.execute_batch(&format!("CREATE TABLE {} (day TEXT NOT NULL);", quote_ident(&table)))?;
        }

        let mut known: Vec<String> = table_columns(&tx, &table)?;
        for record in records {
            for key in record.keys() {
                if !known.iter().any(|existing| existing.eq_ignore_ascii_case(key)) {
                    tx.execute_batch(&format!(
                        "ALTER TABLE {} ADD COLUMN {};",
                        quote_ident(&table),
                        quote_ident(key)
                    ))?;
                    known.push(key.clone());
                }
            }
        }

        for record in records {
            if !record.get("day").is_some_and(Value::is_string) {
                return Err(StoreError::MissingDay {
                    feed: feed.to_string(),
                });
            }
            let keys: Vec<&String> = record.keys().collect();
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote_ident(&table),
                keys.iter().map(|k| quote_ident(k)).collect::<Vec<_>>().join(", "),
                (1..=keys.len()).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", ")
            );
            let values: Vec<SqlValue> = keys.iter().map(|k| sql_from_json(&record[k.as_str()])).collect();
            tx.execute(&sql, params_from_iter(values.iter()))?;
        }
        tx.commit()?;

        info!(
            component = "store",
            event = "store.append",
            table = %table,
            rows = records.len()
        );
        Ok(records.len())
    }

    // Result table, run record and per-day samples share one transaction.
    pub fn persist_run(
        &mut self,
        result_table: &str,
        table: &Table,
        schema: &OutputSchema,
        samples: &[TimeSeriesSample],
    ) -> Result<PersistOutcome, StoreError> {
        validate_table_name(result_table)?;
        let mut seen: HashSet<String> = HashSet::new();
        for column in &table.columns {
            if !seen.insert(column.to_ascii_lowercase()) {
                return Err(StoreError::DuplicateColumn(column.clone()));
            }
        }

        let tx = self.conn.transaction()?;
        let previous_fingerprint: Option<String> = tx
            .query_row(
                "SELECT schema_fingerprint FROM pipeline_runs
                 WHERE result_table = ?1 ORDER BY run_id DESC LIMIT 1",
                params![result_table],
                |row| row.get(0),
            )
            .optional()?;

        let column_defs: Vec<String> = table
            .columns
            .iter()
            .enumerate()
            .map(|(idx, name)| {
                let dtype = schema.columns.get(idx).map(|c| c.dtype);
                format!("{} {}", quote_ident(name), sql_type(dtype))
            })
            .collect();
        tx.execute_batch(&format!(
            "DROP TABLE IF EXISTS {table}; CREATE TABLE {table} ({defs});",
            table = quote_ident(result_table),
            defs = column_defs.join(", ")
        ))?;

        if !table.columns.is_empty() {
            let sql = format!(
                "INSERT INTO {} VALUES ({})",
                quote_ident(result_table),
                (1..=table.columns.len())
                    .map(|i| format!("?{i}"))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            let mut stmt = tx.prepare(&sql)?;
            for row in &table.rows {
                stmt.execute(params_from_iter(row.iter().map(sql_from_cell)))?;
            }
        }

        let days: BTreeSet<NaiveDate> = samples.iter().map(|s| s.day).collect();
        {
            let mut delete = tx.prepare("DELETE FROM sleep_timeseries WHERE day = ?1")?;
            for day in &days {
                delete.execute(params![day_text(*day)])?;
            }
            let mut insert = tx.prepare(
                "INSERT INTO sleep_timeseries (day, metric_name, timestamp, metric_value)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for sample in samples {
                insert.execute(params![
                    day_text(sample.day),
                    sample.metric,
                    sample.timestamp.to_rfc3339(),
                    sample.value
                ])?;
            }
        }

        let run = RunRecord {
            result_table: result_table.to_string(),
            run_at: Utc::now().to_rfc3339(),
            schema_version: schema.version,
            schema_fingerprint: schema.fingerprint.clone(),
            row_count: table.len(),
            column_count: table.columns.len(),
        };
        tx.execute(
            "INSERT INTO pipeline_runs
                (result_table, run_at, schema_version, schema_fingerprint, row_count, column_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run.result_table,
                run.run_at,
                run.schema_version,
                run.schema_fingerprint,
                run.row_count as i64,
                run.column_count as i64
            ],
        )?;
        tx.commit()?;

        let outcome = PersistOutcome {
            run,
            previous_fingerprint,
            samples_written: samples.len(),
        };
        if outcome.schema_changed() {
            warn!(
                component = "store",
                event = "store.schema.changed",
                table = result_table,
                previous = outcome.previous_fingerprint.as_deref().unwrap_or_default(),
                current = %outcome.run.schema_fingerprint
            );
        }
        info!(
            component = "store",
            event = "store.persist",
            table = result_table,
            rows = outcome.run.row_count,
            columns = outcome.run.column_count,
            samples = outcome.samples_written
        );
        Ok(outcome)
    }

    pub fn read_table(&self, name: &str) -> Result<Option<Table>, StoreError> {
        validate_table_name(name)?;
        if !table_exists(&self.conn, name)? {
            return Ok(None);
        }

        let mut stmt = self
            .conn
            .prepare(&format!("SELECT * FROM {} ORDER BY rowid ASC", quote_ident(name)))?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();
        let mut table = Table::new(columns);
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let mut cells = Vec::with_capacity(table.columns.len());
            for idx in 0..table.columns.len() {
                cells.push(cell_from_sql(row.get_ref(idx)?));
            }
            table.push_row(cells);
        }
        Ok(Some(table))
    }

    pub fn read_timeseries(&self, day: NaiveDate) -> Result<Vec<TimeSeriesSample>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT metric_name, timestamp, metric_value FROM sleep_timeseries
             WHERE day = ?1 ORDER BY metric_name ASC, timestamp ASC",
        )?;
        let rows = stmt.query_map(params![day_text(day)], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (metric, timestamp, value) = row?;
            match DateTime::parse_from_rfc3339(&timestamp) {
                Ok(timestamp) => out.push(TimeSeriesSample {
                    day,
                    metric,
                    timestamp,
                    value,
                }),
                Err(err) => warn!(
                    component = "store",
                    event = "store.timeseries.bad_timestamp",
                    day = %day,
                    raw = %timestamp,
                    error = %err
                ),
            }
        }
        Ok(out)
    }

    pub fn timeseries_days(&self) -> Result<Vec<NaiveDate>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT day FROM sleep_timeseries ORDER BY day DESC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for raw in rows {
            if let Ok(day) = NaiveDate::parse_from_str(&raw?, "%Y-%m-%d") {
                out.push(day);
            }
        }
        Ok(out)
    }

    pub fn last_run(&self, result_table: &str) -> Result<Option<RunRecord>, StoreError> {
        let run = self
            .conn
            .query_row(
                "SELECT result_table, run_at, schema_version, schema_fingerprint, row_count, column_count
                 FROM pipeline_runs WHERE result_table = ?1 ORDER BY run_id DESC LIMIT 1",
                params![result_table],
                |row| {
                    Ok(RunRecord {
                        result_table: row.get(0)?,
                        run_at: row.get(1)?,
                        schema_version: row.get(2)?,
                        schema_fingerprint: row.get(3)?,
                        row_count: row.get::<_, i64>(4)? as usize,
                        column_count: row.get::<_, i64>(5)? as usize,
                    })
                },
            )
            .optional()?;
        Ok(run)
    }
}

pub fn read_through<E, F>(
    store: &mut CacheStore,
    feed: &str,
    range: DayRange,
    fetch: F,
) -> Result<(Vec<JsonRecord>, CacheSource), ReadThroughError<E>>
where
    E: std::error::Error + 'static,
    F: FnOnce() -> Result<Vec<JsonRecord>, E>,
{
    if store.has_rows_in_range(feed, range)? {
        let records = store.read_range(feed, range)?;
        info!(
            component = "store",
            event = "store.cache.hit",
            feed,
            start = %range.start,
            end = %range.end,
            rows = records.len()
        );
        return Ok((records, CacheSource::Cache));
    }

    info!(
        component = "store",
        event = "store.cache.miss",
        feed,
        start = %range.start,
        end = %range.end
    );
    let records = fetch().map_err(ReadThroughError::Fetch)?;
    if !records.is_empty() {
        store.append_rows(feed, &records)?;
    }
    Ok((records, CacheSource::Upstream))
}

pub fn raw_table_name(feed: &str) -> Result<String, StoreError> {
    let name = format!("{RAW_TABLE_PREFIX}{feed}");
    validate_table_name(&name)?;
    Ok(name)
}

fn validate_table_name(name: &str) -> Result<(), StoreError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with("sqlite_");
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidTableName(name.to_string()))
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn day_text(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

fn sql_type(dtype: Option<ColumnDType>) -> &'static str {
    match dtype {
        Some(ColumnDType::Integer) => "INTEGER",
        Some(ColumnDType::Real) => "REAL",
        Some(ColumnDType::Date) | Some(ColumnDType::Text) => "TEXT",
        Some(ColumnDType::Mixed) | None => "",
    }
}

fn sql_from_cell(cell: &Cell) -> SqlValue {
    match cell {
        Cell::Null => SqlValue::Null,
        Cell::Integer(v) => SqlValue::Integer(*v),
        Cell::Real(v) if v.is_finite() => SqlValue::Real(*v),
        Cell::Real(_) => SqlValue::Null,
        Cell::Text(v) => SqlValue::Text(v.clone()),
        Cell::Date(v) => SqlValue::Text(day_text(*v)),
    }
}

fn cell_from_sql(value: ValueRef<'_>) -> Cell {
    match value {
        ValueRef::Null => Cell::Null,
        ValueRef::Integer(v) => Cell::Integer(v),
        ValueRef::Real(v) => Cell::Real(v),
        ValueRef::Text(bytes) => Cell::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Cell::Text(hex::encode(bytes)),
    }
}

fn sql_from_json(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Number(number) => match number.as_i64() {
            Some(v) => SqlValue::Integer(v),
            None => number.as_f64().map(SqlValue::Real).unwrap_or(SqlValue::Null),
        },
        Value::String(text) => SqlValue::Text(text.clone()),
        nested => SqlValue::Text(nested.to_string()),
    }
}

fn json_from_sql(value: ValueRef<'_>) -> Option<Value> {
    match value {
        ValueRef::Null | ValueRef::Blob(_) => None,
        ValueRef::Integer(v) => Some(Value::from(v)),
        ValueRef::Real(v) => serde_json::Number::from_f64(v).map(Value::Number),
        ValueRef::Text(bytes) => {
            let text = String::from_utf8_lossy(bytes).into_owned();
            let trimmed = text.trim_start();
            if trimmed.starts_with('{') || trimmed.starts_with('[') {
                if let Ok(nested) = serde_json::from_str::<Value>(&text) {
                    return Some(nested);
                }
            }
            Some(Value::String(text))
        }
    }
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool, StoreError> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1 LIMIT 1",
            params![table],
            |_| Ok(()),
        )
        .optional()?;
    Ok(exists.is_some())
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>, StoreError> {
    let pragma = format!("PRAGMA table_info({})", quote_ident(table));
    let mut stmt = conn.prepare(&pragma)?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    let mut out = Vec::new();
    for name in rows {
        out.push(name?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, d).expect("valid test date")
    }

    fn record(value: Value) -> JsonRecord {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn reversed_range_is_normalised() {
        let range = DayRange::new(day(5), day(1));
        assert_eq!(range.start, day(1));
        assert!(range.contains(day(3)));
        assert!(!range.contains(day(6)));
        assert_eq!(range.extend_end(1).end, day(6));
    }

    #[test]
    fn append_then_read_restores_nested_values() {
        let mut store = CacheStore::open_in_memory().expect("store");
        let rows = vec![
            record(json!({"day": "2025-01-02", "score": 80, "contributors": {"a": 1}})),
            record(json!({"day": "2025-01-03", "score": 70.5, "extra": "x"})),
        ];
        assert_eq!(store.append_rows("daily_sleep", &rows).expect("append"), 2);

        assert!(store
            .has_rows_in_range("daily_sleep", DayRange::new(day(1), day(2)))
            .expect("probe"));
        assert!(!store
            .has_rows_in_range("daily_sleep", DayRange::new(day(4), day(9)))
            .expect("probe"));

        let back = store
            .read_range("daily_sleep", DayRange::new(day(1), day(31)))
            .expect("read");
        assert_eq!(back.len(), 2);
        assert_eq!(back[0]["contributors"], json!({"a": 1}));
        assert_eq!(back[0]["score"], json!(80));
        assert!(!back[0].contains_key("extra"));
        assert_eq!(back[1]["extra"], json!("x"));
    }

    #[test]
    fn missing_table_probes_as_empty() {
        let store = CacheStore::open_in_memory().expect("store");
        assert!(!store
            .has_rows_in_range("sleep", DayRange::new(day(1), day(2)))
            .expect("probe"));
        assert!(store
            .read_range("sleep", DayRange::new(day(1), day(2)))
            .expect("read")
            .is_empty());
    }

    #[test]
    fn invalid_feed_names_are_rejected() {
        let store = CacheStore::open_in_memory().expect("store");
        let err = store
            .has_rows_in_range("sleep; DROP TABLE x", DayRange::new(day(1), day(2)))
            .expect_err("must reject");
        assert!(matches!(err, StoreError::InvalidTableName(_)));
    }

    #[test]
    fn records_without_day_are_rejected() {
        let mut store = CacheStore::open_in_memory().expect("store");
        let err = store
            .append_rows("sleep", &[record(json!({"score": 1}))])
            .expect_err("day is required");
        assert!(matches!(err, StoreError::MissingDay { .. }));
    }

    #[test]
    fn read_through_fetches_once_then_hits_cache() {
        let mut store = CacheStore::open_in_memory().expect("store");
        let range = DayRange::new(day(1), day(3));

        let (rows, source) = read_through::<std::io::Error, _>(&mut store, "sleep", range, || {
            Ok(vec![record(json!({"day": "2025-01-02", "type": "long_sleep"}))])
        })
        .expect("miss should fetch");
        assert_eq!(source, CacheSource::Upstream);
        assert_eq!(rows.len(), 1);

        let (rows, source) = read_through::<std::io::Error, _>(&mut store, "sleep", range, || {
            panic!("cache hit must not fetch")
        })
        .expect("hit should read");
        assert_eq!(source, CacheSource::Cache);
        assert_eq!(rows[0]["type"], json!("long_sleep"));
    }

    #[test]
    fn read_through_surfaces_fetch_errors_without_caching() {
        let mut store = CacheStore::open_in_memory().expect("store");
        let range = DayRange::new(day(1), day(3));
        let err = read_through(&mut store, "sleep", range, || {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "offline"))
        })
        .expect_err("fetch error must surface");
        assert!(matches!(err, ReadThroughError::Fetch(_)));
        assert!(!store.has_rows_in_range("sleep", range).expect("probe"));
    }
}
