//! Symptom-tracker CSV export ingest.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::OnceLock;

use chrono::NaiveDate;
use csv::{ReaderBuilder, StringRecord};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

const FALLBACK_DATE_FORMATS: [&str; 8] = [
    "%d %b %Y",
    "%d %B %Y",
    "%b %d %Y",
    "%B %d %Y",
    "%Y-%m-%d",
    "%d/%m/%Y",
    "%d-%m-%Y",
    "%Y/%m/%d",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEntry {
    pub row: usize,
    pub date: Option<NaiveDate>,
    pub date_raw: String,
    pub category: String,
    pub detail: String,
    pub rating_or_amount: Option<String>,
    pub notes: Option<String>,
}

impl RawEntry {
    pub fn rating_as_f64(&self) -> Option<f64> {
        self.rating_or_amount
            .as_deref()
            .and_then(|raw| raw.trim().parse::<f64>().ok())
            .filter(|value| value.is_finite())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestConfig {
    pub date_format: Option<String>,
    pub excluded_category: String,
    pub sleep_category: String,
    pub synced_marker: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            date_format: None,
            excluded_category: "Health measurements".to_string(),
            sleep_category: "Sleep".to_string(),
            synced_marker: "(Synced)".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IngestReport {
    pub rows_read: usize,
    pub excluded_rows: usize,
    pub synced_sleep_rows: usize,
    pub unparseable_dates: Vec<UnparseableDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnparseableDate {
    pub row: usize,
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportBatch {
    pub entries: Vec<RawEntry>,
    pub report: IngestReport,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("export has no data rows")]
    EmptyExport,
    #[error("export is missing required column '{0}'")]
    MissingColumn(&'static str),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

struct ColumnLayout {
    date: usize,
    category: usize,
    detail: usize,
    rating: Option<usize>,
    notes: Option<usize>,
}

impl ColumnLayout {
    fn from_headers(headers: &StringRecord) -> Result<Self, IngestError> {
        let find = |names: &[&str]| {
            headers.iter().position(|header| {
                let header = header.trim().trim_start_matches('\u{feff}');
                names.iter().any(|name| header.eq_ignore_ascii_case(name))
            })
        };

        Ok(Self {
            date: find(&["date", "date formatted"]).ok_or(IngestError::MissingColumn("date"))?,
            category: find(&["category"]).ok_or(IngestError::MissingColumn("category"))?,
            detail: find(&["detail"]).ok_or(IngestError::MissingColumn("detail"))?,
            rating: find(&["rating/amount", "rating", "amount"]),
            notes: find(&["notes"]),
        })
    }
}

pub fn read_export_path(path: &Path, cfg: &IngestConfig) -> Result<ExportBatch, IngestError> {
    let file = File::open(path).map_err(|source| IngestError::Io {
        path: path.display().to_string(),
        source,
    })?;
    info!(
        component = "bearable",
        event = "ingest.open",
        path = %path.display()
    );
    read_export(file, cfg)
}

pub fn read_export<R: Read>(reader: R, cfg: &IngestConfig) -> Result<ExportBatch, IngestError> {
    let mut csv_reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);
    let layout = ColumnLayout::from_headers(csv_reader.headers()?)?;

    let mut report = IngestReport::default();
    let mut entries = Vec::new();

    for (idx, record) in csv_reader.records().enumerate() {
        let record = record?;
        let row = idx + 1;
        report.rows_read += 1;

        let field = |col: usize| record.get(col).unwrap_or("").to_string();
        let optional = |col: Option<usize>| {
            col.and_then(|c| record.get(c))
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };

        let category = field(layout.category).trim().to_string();
        if category == cfg.excluded_category {
            report.excluded_rows += 1;
            continue;
        }

        let rating_or_amount = optional(layout.rating);
        let notes = optional(layout.notes);
        if category == cfg.sleep_category
            && (rating_or_amount.is_some() || notes.as_deref() == Some(cfg.synced_marker.as_str()))
        {
            report.synced_sleep_rows += 1;
            continue;
        }

        let date_raw = field(layout.date);
        let date = parse_export_date(&date_raw, cfg.date_format.as_deref());
        if date.is_none() {
            report.unparseable_dates.push(UnparseableDate {
                row,
                raw: date_raw.clone(),
            });
        }

        entries.push(RawEntry {
            row,
            date,
            date_raw,
            category,
            detail: field(layout.detail),
            rating_or_amount,
            notes,
        });
    }

    if report.rows_read == 0 {
        return Err(IngestError::EmptyExport);
    }

    for bad in &report.unparseable_dates {
        warn!(
            component = "bearable",
            event = "ingest.date.unparseable",
            row = bad.row,
            raw = %bad.raw
        );
    }

    info!(
        component = "bearable",
        event = "ingest.finish",
        rows_read = report.rows_read,
        rows_kept = entries.len(),
        excluded_rows = report.excluded_rows,
        synced_sleep_rows = report.synced_sleep_rows,
        unparseable_dates = report.unparseable_dates.len()
    );

    Ok(ExportBatch { entries, report })
}

pub fn strip_ordinal_suffix(raw: &str) -> String {
    static ORDINAL: OnceLock<Regex> = OnceLock::new();
    let re = ORDINAL.get_or_init(|| {
        Regex::new(r"(\d+)(st|nd|rd|th)").expect("ordinal regex must compile")
    });
    re.replace_all(raw, "$1").into_owned()
}

pub fn parse_export_date(raw: &str, explicit_format: Option<&str>) -> Option<NaiveDate> {
    let cleaned = strip_ordinal_suffix(raw.trim());
    let cleaned = cleaned.replace(',', " ");
    let cleaned = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.is_empty() {
        return None;
    }

    if let Some(format) = explicit_format {
        if let Ok(date) = NaiveDate::parse_from_str(&cleaned, format) {
            return Some(date);
        }
    }

    // Exports sometimes carry a trailing clock time; retry on the date part.
    let date_part = date_prefix(&cleaned);
    for candidate in [cleaned.as_str(), date_part.as_str()] {
        for format in FALLBACK_DATE_FORMATS {
            if let Ok(date) = NaiveDate::parse_from_str(candidate, format) {
                return Some(date);
            }
        }
    }
    None
}

fn date_prefix(cleaned: &str) -> String {
    cleaned
        .split_whitespace()
        .take_while(|token| !token.contains(':'))
        .collect::<Vec<_>>()
        .join(" ")
}
