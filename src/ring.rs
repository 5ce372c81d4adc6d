//! Shaping of ring-vendor JSON records into a flat daily table plus
//! per-night sensor samples.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Days, Duration as ChronoDuration, FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::table::{Cell, Table};

pub type JsonRecord = serde_json::Map<String, Value>;

pub const DAY_FIELD: &str = "day";
pub const DAY_MINUS_ONE_FIELD: &str = "day_minus_one";
pub const DAILY_SLEEP_PREFIX: &str = "daily_sleep_";
pub const READINESS_PREFIX: &str = "readiness_";
pub const SLEEP_COLLISION_PREFIX: &str = "sleep_";

pub const TIME_SERIES_FIELDS: [&str; 4] =
    ["hrv", "heart_rate", "movement_30_sec", "sleep_phase_5_min"];

const DEFAULT_SERIES_INTERVAL_SECONDS: f64 = 300.0;
// Compact code strings carry one code per 30-second bucket from bedtime.
const CODE_BUCKET_SECONDS: i64 = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesSample {
    pub day: NaiveDate,
    pub metric: String,
    pub timestamp: DateTime<FixedOffset>,
    pub value: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct DailyFeed<'a> {
    pub prefix: &'a str,
    pub records: &'a [JsonRecord],
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RingShapeReport {
    pub daily_records: usize,
    pub sleep_records: usize,
    pub unmatched_sleep_records: usize,
    pub output_rows: usize,
    pub samples: usize,
    pub skipped_series: usize,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RingDaily {
    pub table: Table,
    pub samples: Vec<TimeSeriesSample>,
    pub report: RingShapeReport,
}

pub fn metric_name(field: &str) -> &str {
    match field {
        "movement_30_sec" => "movement",
        "sleep_phase_5_min" => "sleep_phase",
        other => other,
    }
}


pub fn flatten_daily_record(record: &JsonRecord, prefix: &str) -> JsonRecord {
    let mut out = JsonRecord::new();
    for (key, value) in record {
        match key.as_str() {
            "contributors" => {
                if let Value::Object(contributors) = value {
                    for (name, inner) in contributors {
                        out.insert(format!("{prefix}{name}"), inner.clone());
                    }
                }
            }
            "id" | DAY_FIELD | "timestamp" => {
                out.insert(key.clone(), value.clone());
            }
            _ if key.starts_with(prefix) => {
                out.insert(key.clone(), value.clone());
            }
            _ => {
                out.insert(format!("{prefix}{key}"), value.clone());
            }
        }
    }
    out
}

pub fn flatten_sleep_record(record: &JsonRecord) -> (JsonRecord, Vec<TimeSeriesSample>, usize) {
    let mut out = JsonRecord::new();
    for (key, value) in record {
        if TIME_SERIES_FIELDS.contains(&key.as_str()) {
            continue;
        }
        match key.as_str() {
            "readiness" => {
                if let Value::Object(readiness) = value {
                    if let Some(Value::Object(contributors)) = readiness.get("contributors") {
                        for (name, inner) in contributors {
                            out.insert(format!("{READINESS_PREFIX}{name}"), inner.clone());
                        }
                    }
                    for (name, inner) in readiness {
                        if name != "contributors" {
                            out.insert(format!("{READINESS_PREFIX}{name}"), inner.clone());
                        }
                    }
                }
            }
            "latency" => {
                out.insert("latency_duration".to_string(), value.clone());
            }
            _ => {
                out.insert(key.clone(), value.clone());
            }
        }
    }

    let mut samples = Vec::new();
    let mut skipped = 0usize;
    let day = record.get(DAY_FIELD).and_then(json_date);
    let bedtime_start = record
        .get("bedtime_start")
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok());

    for field in TIME_SERIES_FIELDS {
        let Some(content) = record.get(field) else {
            continue;
        };
        if content.is_null() {
            continue;
        }
        match (day, unpack_series(content, bedtime_start)) {
            (Some(day), Some(points)) => {
                samples.extend(points.into_iter().map(|(timestamp, value)| TimeSeriesSample {
                    day,
                    metric: metric_name(field).to_string(),
                    timestamp,
                    value,
                }))
            }
            _ => skipped += 1,
        }
    }

    (out, samples, skipped)
}

pub fn unpack_series(
    content: &Value,
    bedtime_start: Option<DateTime<FixedOffset>>,
) -> Option<Vec<(DateTime<FixedOffset>, f64)>> {
    match content {
        Value::Object(series) => {
            let start = series
                .get("timestamp")
                .and_then(Value::as_str)
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())?;
            let interval = series
                .get("interval")
                .and_then(Value::as_f64)
                .filter(|v| *v > 0.0)
                .unwrap_or(DEFAULT_SERIES_INTERVAL_SECONDS);
            let items = series.get("items").and_then(Value::as_array)?;

            Some(
                items
                    .iter()
                    .enumerate()
                    .filter_map(|(idx, item)| {
                        let value = item.as_f64()?;
                        let offset_ms = (idx as f64 * interval * 1_000.0).round() as i64;
                        Some((start + ChronoDuration::milliseconds(offset_ms), value))
                    })
                    .collect(),
            )
        }
        Value::String(codes) => {
            let start = bedtime_start?;
            Some(
                codes
                    .chars()
                    .enumerate()
                    .filter_map(|(idx, code)| {
                        let value = code.to_digit(10)?;
                        Some((
                            start + ChronoDuration::seconds(idx as i64 * CODE_BUCKET_SECONDS),
                            f64::from(value),
                        ))
                    })
                    .collect(),
            )
        }
        _ => None,
    }
}

// Sleep keys that collide with daily keys get the `sleep_` prefix.
pub fn build_ring_daily_table(
    daily_sleep: &[JsonRecord],
    sleep: &[JsonRecord],
    extra_feeds: &[DailyFeed<'_>],
) -> RingDaily {
    let mut report = RingShapeReport {
        daily_records: daily_sleep.len(),
        sleep_records: sleep.len(),
        ..RingShapeReport::default()
    };

    let mut samples = Vec::new();
    let mut sleep_by_day: BTreeMap<NaiveDate, Vec<JsonRecord>> = BTreeMap::new();
    for record in sleep {
        let (flat, points, skipped) = flatten_sleep_record(record);
        samples.extend(points);
        report.skipped_series += skipped;
        match flat.get(DAY_FIELD).and_then(json_date) {
            Some(day) => sleep_by_day.entry(day).or_default().push(flat),
            None => report.unmatched_sleep_records += 1,
        }
    }

    let extras: Vec<(BTreeMap<NaiveDate, JsonRecord>, &str)> = extra_feeds
        .iter()
        .map(|feed| {
            let mut by_day = BTreeMap::new();
            for record in feed.records {
                if let Some(day) = record.get(DAY_FIELD).and_then(json_date) {
                    by_day
                        .entry(day)
                        .or_insert_with(|| flatten_daily_record(record, feed.prefix));
                }
            }
            (by_day, feed.prefix)
        })
        .collect();

    let mut matched_days: HashSet<NaiveDate> = HashSet::new();
    let mut merged: Vec<JsonRecord> = Vec::new();
    for record in daily_sleep {
        let mut base = flatten_daily_record(record, DAILY_SLEEP_PREFIX);
        let day = base.get(DAY_FIELD).and_then(json_date);

        if let Some(day) = day {
            for (by_day, _) in &extras {
                if let Some(extra) = by_day.get(&day) {
                    for (key, value) in extra {
                        if key == "id" || key == "timestamp" || base.contains_key(key) {
                            continue;
                        }
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }

        match day.and_then(|d| sleep_by_day.get(&d).map(|rows| (d, rows))) {
            Some((day, rows)) => {
                matched_days.insert(day);
                for sleep_row in rows {
                    let mut row = base.clone();
                    for (key, value) in sleep_row {
                        if key == DAY_FIELD {
                            continue;
                        }
                        if row.contains_key(key) {
                            row.insert(format!("{SLEEP_COLLISION_PREFIX}{key}"), value.clone());
                        } else {
                            row.insert(key.clone(), value.clone());
                        }
                    }
                    merged.push(row);
                }
            }
            None => merged.push(base),
        }
    }

    report.unmatched_sleep_records += sleep_by_day
        .iter()
        .filter(|(day, _)| !matched_days.contains(*day))
        .map(|(_, rows)| rows.len())
        .sum::<usize>();

    let mut table = records_to_table(&merged);
    append_day_minus_one(&mut table);
    report.output_rows = table.len();
    report.samples = samples.len();

    if report.unmatched_sleep_records > 0 || report.skipped_series > 0 {
        warn!(
            component = "ring",
            event = "ring.shape.partial",
            unmatched_sleep_records = report.unmatched_sleep_records,
            skipped_series = report.skipped_series
        );
    }

    info!(
        component = "ring",
        event = "ring.shape.finish",
        daily_records = report.daily_records,
        sleep_records = report.sleep_records,
        output_rows = report.output_rows,
        samples = report.samples
    );

    RingDaily {
        table,
        samples,
        report,
    }
}

pub fn records_to_table(records: &[JsonRecord]) -> Table {
    let mut columns: Vec<String> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    for record in records {
        for key in record.keys() {
            if seen.insert(key.as_str()) {
                columns.push(key.clone());
            }
        }
    }

    let mut table = Table::new(columns);
    for record in records {
        let row = table
            .columns
            .iter()
            .map(|column| match record.get(column) {
                None => Cell::Null,
                Some(value) if column == DAY_FIELD => {
                    json_date(value).map(Cell::Date).unwrap_or_else(|| Cell::from_json(value))
                }
                Some(value) => Cell::from_json(value),
            })
            .collect();
        table.push_row(row);
    }
    table
}

fn append_day_minus_one(table: &mut Table) {
    let Some(day_idx) = table.column_index(DAY_FIELD) else {
        return;
    };
    if table.has_column(DAY_MINUS_ONE_FIELD) {
        return;
    }
    table.columns.push(DAY_MINUS_ONE_FIELD.to_string());
    for row in &mut table.rows {
        let shifted = row[day_idx]
            .as_date()
            .and_then(|day| day.checked_sub_days(Days::new(1)))
            .map(Cell::Date)
            .unwrap_or(Cell::Null);
        row.push(shifted);
    }
}

fn json_date(value: &Value) -> Option<NaiveDate> {
    let raw = value.as_str()?;
    NaiveDate::parse_from_str(raw.get(..10)?, "%Y-%m-%d").ok()
}
