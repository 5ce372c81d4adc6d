//! Long-to-wide reshape of canonical rows.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::normalize::CanonicalEntry;
use crate::table::{Cell, Table};

pub const DATE_COLUMN: &str = "date";

pub const RESERVED_COLUMNS: [&str; 3] = [DATE_COLUMN, "day_of_week", "is_weekend"];

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ColumnKey {
    pub category: String,
    pub detail: String,
}

impl ColumnKey {
    pub const SEPARATOR: char = '_';

    pub fn new(category: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            detail: detail.into(),
        }
    }

    pub fn display_name(&self) -> String {
        format!("{}{}{}", self.category, Self::SEPARATOR, self.detail)
            .trim()
            .to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WideRow {
    pub date: NaiveDate,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WideTable {
    pub columns: Vec<ColumnKey>,
    pub rows: Vec<WideRow>,
}

impl WideTable {
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(ColumnKey::display_name).collect()
    }

    pub fn value(&self, date: NaiveDate, key: &ColumnKey) -> Option<f64> {
        let col = self.columns.iter().position(|c| c == key)?;
        self.rows
            .iter()
            .find(|row| row.date == date)
            .and_then(|row| row.values.get(col).copied())
    }

    pub fn to_table(&self) -> Table {
        let mut columns = Vec::with_capacity(self.columns.len() + 1);
        columns.push(DATE_COLUMN.to_string());
        columns.extend(self.column_names());

        let mut table = Table::new(columns);
        for row in &self.rows {
            let mut cells = Vec::with_capacity(row.values.len() + 1);
            cells.push(Cell::Date(row.date));
            cells.extend(row.values.iter().copied().map(Cell::Real));
            table.push_row(cells);
        }
        table
    }
}

#[derive(Debug, Error)]
pub enum PivotError {
    #[error("columns {first:?} and {second:?} both render as '{name}'")]
    ColumnNameCollision {
        name: String,
        first: ColumnKey,
        second: ColumnKey,
    },
    #[error("column {key:?} renders as reserved name '{name}'")]
    ReservedColumnName { name: String, key: ColumnKey },
}

// Shared keys are summed; absent combinations are 0.
pub fn pivot(entries: &[CanonicalEntry]) -> Result<WideTable, PivotError> {
    let keys: BTreeSet<ColumnKey> = entries
        .iter()
        .map(|entry| ColumnKey::new(entry.category.clone(), entry.detail.clone()))
        .collect();
    let columns: Vec<ColumnKey> = keys.into_iter().collect();
    check_display_names(&columns)?;

    let index: HashMap<&ColumnKey, usize> =
        columns.iter().enumerate().map(|(i, key)| (key, i)).collect();

    let mut by_date: BTreeMap<NaiveDate, Vec<f64>> = BTreeMap::new();
    for entry in entries {
        let key = ColumnKey::new(entry.category.clone(), entry.detail.clone());
        let Some(&col) = index.get(&key) else {
            continue;
        };
        let values = by_date
            .entry(entry.date)
            .or_insert_with(|| vec![0.0; columns.len()]);
        values[col] += entry.value;
    }

    let rows: Vec<WideRow> = by_date
        .into_iter()
        .map(|(date, values)| WideRow { date, values })
        .collect();

    info!(
        component = "pivot",
        event = "pivot.finish",
        input_rows = entries.len(),
        dates = rows.len(),
        columns = columns.len()
    );

    Ok(WideTable { columns, rows })
}

pub fn melt(table: &WideTable) -> Vec<CanonicalEntry> {
    table
        .rows
        .iter()
        .flat_map(|row| {
            table
                .columns
                .iter()
                .zip(row.values.iter())
                .map(move |(key, value)| CanonicalEntry {
                    date: row.date,
                    category: key.category.clone(),
                    detail: key.detail.clone(),
                    value: *value,
                })
        })
        .collect()
}

fn check_display_names(columns: &[ColumnKey]) -> Result<(), PivotError> {
    let mut seen: HashMap<String, &ColumnKey> = HashMap::new();
    for key in columns {
        let name = key.display_name();
        if RESERVED_COLUMNS.contains(&name.as_str()) {
            return Err(PivotError::ReservedColumnName {
                name,
                key: key.clone(),
            });
        }
        if let Some(first) = seen.get(&name) {
            return Err(PivotError::ColumnNameCollision {
                name,
                first: (*first).clone(),
                second: key.clone(),
            });
        }
        seen.insert(name, key);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, d).expect("valid test date")
    }

    fn entry(d: u32, category: &str, detail: &str, value: f64) -> CanonicalEntry {
        CanonicalEntry {
            date: day(d),
            category: category.to_string(),
            detail: detail.to_string(),
            value,
        }
    }

    #[test]
    fn missing_combinations_are_zero() {
        let wide = pivot(&[entry(1, "Mood", "Mood", 4.0), entry(2, "Symptom", "Cough", 1.0)])
            .expect("pivot should succeed");

        assert_eq!(wide.column_names(), vec!["Mood_Mood", "Symptom_Cough"]);
        assert_eq!(wide.rows.len(), 2);
        assert_eq!(wide.rows[0].values, vec![4.0, 0.0]);
        assert_eq!(wide.rows[1].values, vec![0.0, 1.0]);
    }

    #[test]
    fn shared_keys_are_summed() {
        let wide = pivot(&[
            entry(1, "Med/Supplements", "Zinc", 10.0),
            entry(1, "Med/Supplements", "Zinc", 10.0),
        ])
        .expect("pivot should succeed");
        assert_eq!(
            wide.value(day(1), &ColumnKey::new("Med/Supplements", "Zinc")),
            Some(20.0)
        );
    }

    #[test]
    fn separator_collisions_are_fatal() {
        let err = pivot(&[entry(1, "A_B", "C", 1.0), entry(1, "A", "B_C", 1.0)])
            .expect_err("colliding display names must be rejected");
        assert!(matches!(err, PivotError::ColumnNameCollision { ref name, .. } if name == "A_B_C"));
    }

    #[test]
    fn reserved_names_are_rejected() {
        let err = pivot(&[entry(1, "is", "weekend", 1.0)]).expect_err("reserved name");
        assert!(matches!(err, PivotError::ReservedColumnName { .. }));
    }

    #[test]
    fn melt_then_resum_reproduces_aggregates() {
        let input = vec![
            entry(1, "Lifestyle", "Work", 3.0),
            entry(1, "Lifestyle", "Work", 0.5),
            entry(1, "Mood", "Mood", 4.25),
            entry(3, "Symptom", "Cough", 1.0),
        ];
        let wide = pivot(&input).expect("pivot should succeed");

        let mut expected: BTreeMap<(NaiveDate, String, String), f64> = BTreeMap::new();
        for e in &input {
            *expected
                .entry((e.date, e.category.clone(), e.detail.clone()))
                .or_insert(0.0) += e.value;
        }

        let mut resummed: BTreeMap<(NaiveDate, String, String), f64> = BTreeMap::new();
        for e in melt(&wide) {
            if e.value != 0.0 {
                *resummed.entry((e.date, e.category, e.detail)).or_insert(0.0) += e.value;
            }
        }
        assert_eq!(resummed, expected);
    }

    #[test]
    fn wide_table_converts_to_dated_table() {
        let wide = pivot(&[entry(2, "Mood", "Mood", 3.0)]).expect("pivot should succeed");
        let table = wide.to_table();
        assert_eq!(table.columns, vec!["date", "Mood_Mood"]);
        assert_eq!(table.rows[0][0], Cell::Date(day(2)));
        assert_eq!(table.rows[0][1], Cell::Real(3.0));
    }

    #[test]
    fn empty_input_pivots_to_empty_table() {
        let wide = pivot(&[]).expect("empty pivot should succeed");
        assert!(wide.columns.is_empty());
        assert!(wide.rows.is_empty());
    }
}
