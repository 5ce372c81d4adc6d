//! Calendar features and the output schema fingerprint.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::pivot::DATE_COLUMN;
use crate::table::{Cell, Table};

pub const OUTPUT_SCHEMA_VERSION: u32 = 1;

pub const DAY_OF_WEEK_COLUMN: &str = "day_of_week";
pub const IS_WEEKEND_COLUMN: &str = "is_weekend";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnDType {
    Date,
    Integer,
    Real,
    Text,
    Mixed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputColumn {
    pub name: String,
    pub dtype: ColumnDType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSchema {
    pub version: u32,
    pub fingerprint: String,
    pub columns: Vec<OutputColumn>,
}

// Monday = 0 .. Sunday = 6.
pub fn day_of_week(date: NaiveDate) -> i64 {
    i64::from(date.weekday().num_days_from_monday())
}

pub fn is_weekend(date: NaiveDate) -> bool {
    day_of_week(date) >= 5
}

pub fn add_calendar_features(table: &Table) -> Table {
    let Some(date_idx) = table.column_index(DATE_COLUMN) else {
        warn!(
            component = "features",
            event = "features.calendar.skipped",
            reason = "missing_date_column",
            columns = table.columns.len()
        );
        return table.clone();
    };

    // Existing feature columns are rebuilt rather than duplicated.
    let base = table.without_columns(&[DAY_OF_WEEK_COLUMN, IS_WEEKEND_COLUMN]);
    let date_idx = base.column_index(DATE_COLUMN).unwrap_or(date_idx);

    let mut columns = Vec::with_capacity(base.columns.len() + 2);
    columns.push(base.columns[date_idx].clone());
    columns.push(DAY_OF_WEEK_COLUMN.to_string());
    columns.push(IS_WEEKEND_COLUMN.to_string());
    columns.extend(
        base.columns
            .iter()
            .enumerate()
            .filter(|(idx, _)| *idx != date_idx)
            .map(|(_, name)| name.clone()),
    );

    let mut out = Table::new(columns);
    let mut undated = 0usize;
    for row in &base.rows {
        let date_cell = row[date_idx].clone();
        let (dow, weekend) = match date_cell.as_date() {
            Some(date) => (
                Cell::Integer(day_of_week(date)),
                Cell::Integer(i64::from(is_weekend(date))),
            ),
            None => {
                undated += 1;
                (Cell::Null, Cell::Null)
            }
        };

        let mut cells = Vec::with_capacity(row.len() + 2);
        cells.push(date_cell);
        cells.push(dow);
        cells.push(weekend);
        cells.extend(
            row.iter()
                .enumerate()
                .filter(|(idx, _)| *idx != date_idx)
                .map(|(_, cell)| cell.clone()),
        );
        out.push_row(cells);
    }

    if undated > 0 {
        warn!(
            component = "features",
            event = "features.calendar.undated_rows",
            undated
        );
    }

    out
}

pub fn build_output_schema(table: &Table) -> OutputSchema {
    let columns: Vec<OutputColumn> = table
        .columns
        .iter()
        .enumerate()
        .map(|(idx, name)| OutputColumn {
            name: name.clone(),
            dtype: column_dtype(table, idx),
        })
        .collect();

    let fingerprint = schema_fingerprint(OUTPUT_SCHEMA_VERSION, &columns);

    info!(
        component = "features",
        event = "features.schema.built",
        version = OUTPUT_SCHEMA_VERSION,
        column_count = columns.len(),
        fingerprint = fingerprint
    );

    OutputSchema {
        version: OUTPUT_SCHEMA_VERSION,
        fingerprint,
        columns,
    }
}

fn column_dtype(table: &Table, idx: usize) -> ColumnDType {
    let mut found: Option<ColumnDType> = None;
    for row in &table.rows {
        let dtype = match &row[idx] {
            Cell::Null => continue,
            Cell::Integer(_) => ColumnDType::Integer,
            Cell::Real(_) => ColumnDType::Real,
            Cell::Text(_) => ColumnDType::Text,
            Cell::Date(_) => ColumnDType::Date,
        };
        found = match found {
            None => Some(dtype),
            Some(prev) if prev == dtype => Some(prev),
            Some(ColumnDType::Integer) if dtype == ColumnDType::Real => Some(ColumnDType::Real),
            Some(ColumnDType::Real) if dtype == ColumnDType::Integer => Some(ColumnDType::Real),
            Some(_) => return ColumnDType::Mixed,
        };
    }
    found.unwrap_or(ColumnDType::Mixed)
}

fn schema_fingerprint(version: u32, columns: &[OutputColumn]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{version};"));
    hasher.update("columns:");
    for column in columns {
        hasher.update(column.name.as_bytes());
        hasher.update(format!(":{:?};", column.dtype));
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid test date")
    }

    fn wide() -> Table {
        let mut table = Table::new(vec!["date".into(), "Mood_Mood".into(), "Symptom_Cough".into()]);
        // 2025-01-04 is a Saturday, 2025-01-06 a Monday.
        table.push_row(vec![Cell::Date(date(2025, 1, 4)), Cell::Real(3.0), Cell::Real(0.0)]);
        table.push_row(vec![Cell::Date(date(2025, 1, 6)), Cell::Real(4.0), Cell::Real(1.0)]);
        table
    }

    #[test]
    fn weekday_numbering_starts_monday() {
        assert_eq!(day_of_week(date(2025, 1, 6)), 0);
        assert_eq!(day_of_week(date(2025, 1, 12)), 6);
        assert!(is_weekend(date(2025, 1, 11)));
        assert!(!is_weekend(date(2025, 1, 10)));
    }

    #[test]
    fn features_are_second_and_third_columns() {
        let out = add_calendar_features(&wide());
        assert_eq!(
            out.columns,
            vec!["date", "day_of_week", "is_weekend", "Mood_Mood", "Symptom_Cough"]
        );
        assert_eq!(out.rows[0][1], Cell::Integer(5));
        assert_eq!(out.rows[0][2], Cell::Integer(1));
        assert_eq!(out.rows[1][1], Cell::Integer(0));
        assert_eq!(out.rows[1][2], Cell::Integer(0));
        assert_eq!(out.rows[1][3], Cell::Real(4.0));
    }

    #[test]
    fn reapplying_features_is_stable() {
        let once = add_calendar_features(&wide());
        let twice = add_calendar_features(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn table_without_date_is_returned_unchanged() {
        let mut table = Table::new(vec!["x".into()]);
        table.push_row(vec![Cell::Integer(1)]);
        assert_eq!(add_calendar_features(&table), table);
    }

    #[test]
    fn fingerprint_tracks_column_set() {
        let a = build_output_schema(&add_calendar_features(&wide()));
        let b = build_output_schema(&add_calendar_features(&wide()));
        assert_eq!(a.fingerprint, b.fingerprint);
        assert_eq!(a.fingerprint.len(), 64);
        assert_eq!(a.columns[0].dtype, ColumnDType::Date);
        assert_eq!(a.columns[1].dtype, ColumnDType::Integer);

        let narrower = build_output_schema(&wide().without_columns(&["Symptom_Cough"]));
        assert_ne!(a.fingerprint, narrower.fingerprint);
    }
}
