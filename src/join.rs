//! Offset-date left join of the daily journal table against ring daily rows.

use std::collections::HashMap;

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::table::{Cell, Table};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinConfig {
    pub left_key: String,
    pub right_key: String,
    pub right_day_column: String,
    pub type_column: String,
    pub primary_type: String,
    pub drop_columns: Vec<String>,
    pub collision_suffix: String,
    pub max_missing_cells: usize,
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            left_key: "date".to_string(),
            right_key: "day_minus_one".to_string(),
            right_day_column: "day".to_string(),
            type_column: "type".to_string(),
            primary_type: "long_sleep".to_string(),
            drop_columns: [
                "id",
                "sleep_id",
                "day",
                "timestamp",
                "sleep_timestamp",
                "sleep_score_delta",
                "sleep_algorithm_version",
                "type",
                "day_minus_one",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            collision_suffix: "_ring".to_string(),
            max_missing_cells: 9,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JoinReport {
    pub left_rows: usize,
    pub matched_rows: usize,
    pub ineligible_right_rows: usize,
    pub duplicate_right_days: Vec<NaiveDate>,
    pub dropped_sparse_rows: usize,
    pub output_rows: usize,
}

#[derive(Debug, Error)]
pub enum JoinError {
    #[error("left table has no '{0}' column")]
    MissingLeftKey(String),
}

// First eligible right row per day wins.
pub fn join_ring_daily(
    left: &Table,
    right: &Table,
    cfg: &JoinConfig,
) -> Result<(Table, JoinReport), JoinError> {
    let left_key_idx = left
        .column_index(&cfg.left_key)
        .ok_or_else(|| JoinError::MissingLeftKey(cfg.left_key.clone()))?;

    let mut report = JoinReport {
        left_rows: left.len(),
        ..JoinReport::default()
    };

    let right_keys = right_key_dates(right, cfg);
    let eligible = eligible_rows(right, cfg);

    let mut index: HashMap<NaiveDate, usize> = HashMap::new();
    for (row_idx, key) in right_keys.iter().enumerate() {
        if !eligible[row_idx] {
            report.ineligible_right_rows += 1;
            continue;
        }
        let Some(key) = key else {
            continue;
        };
        if index.contains_key(key) {
            report.duplicate_right_days.push(*key);
        } else {
            index.insert(*key, row_idx);
        }
    }

    let kept_right: Vec<usize> = right
        .columns
        .iter()
        .enumerate()
        .filter(|(_, name)| !cfg.drop_columns.iter().any(|drop| drop == *name))
        .map(|(idx, _)| idx)
        .collect();

    let mut columns = left.columns.clone();
    for idx in &kept_right {
        let name = &right.columns[*idx];
        if left.has_column(name) {
            columns.push(format!("{name}{}", cfg.collision_suffix));
        } else {
            columns.push(name.clone());
        }
    }

    let mut out = Table::new(columns);
    for row in &left.rows {
        let matched = row[left_key_idx]
            .as_date()
            .and_then(|date| index.get(&date))
            .map(|right_idx| &right.rows[*right_idx]);

        let mut cells = row.clone();
        match matched {
            Some(right_row) => {
                report.matched_rows += 1;
                cells.extend(kept_right.iter().map(|idx| right_row[*idx].clone()));
            }
            None => cells.extend(kept_right.iter().map(|_| Cell::Null)),
        }

        if Table::missing_cells(&cells) > cfg.max_missing_cells {
            report.dropped_sparse_rows += 1;
            continue;
        }
        out.push_row(cells);
    }
    report.output_rows = out.len();

    for day in &report.duplicate_right_days {
        warn!(
            component = "join",
            event = "join.right.duplicate_day",
            day = %day,
            resolution = "first_wins"
        );
    }

    info!(
        component = "join",
        event = "join.finish",
        left_rows = report.left_rows,
        right_rows = right.len(),
        matched_rows = report.matched_rows,
        ineligible_right_rows = report.ineligible_right_rows,
        dropped_sparse_rows = report.dropped_sparse_rows,
        output_rows = report.output_rows
    );

    Ok((out, report))
}

fn right_key_dates(right: &Table, cfg: &JoinConfig) -> Vec<Option<NaiveDate>> {
    if let Some(idx) = right.column_index(&cfg.right_key) {
        return right.rows.iter().map(|row| row[idx].as_date()).collect();
    }

    if let Some(idx) = right.column_index(&cfg.right_day_column) {
        return right
            .rows
            .iter()
            .map(|row| row[idx].as_date().and_then(|day| day.checked_sub_days(Days::new(1))))
            .collect();
    }

    if !right.columns.is_empty() {
        warn!(
            component = "join",
            event = "join.right.key_missing",
            right_key = %cfg.right_key,
            day_column = %cfg.right_day_column,
            right_rows = right.len()
        );
    }
    vec![None; right.len()]
}

fn eligible_rows(right: &Table, cfg: &JoinConfig) -> Vec<bool> {
    match right.column_index(&cfg.type_column) {
        Some(idx) => right
            .rows
            .iter()
            .map(|row| matches!(&row[idx], Cell::Text(kind) if *kind == cfg.primary_type))
            .collect(),
        None => {
            if !right.is_empty() {
                warn!(
                    component = "join",
                    event = "join.right.type_missing",
                    type_column = %cfg.type_column,
                    right_rows = right.len()
                );
            }
            vec![true; right.len()]
        }
    }
}
