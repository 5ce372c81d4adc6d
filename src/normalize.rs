//! Per-category normalization of raw export rows into canonical
//! `(date, category, detail, value)` rows.

use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bearable::RawEntry;
use crate::rules::{
    FactorMap, RuleTable, TransformMode, COUNT_RETAIN_CATEGORY, COUNT_RETAIN_DETAIL,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEntry {
    pub date: NaiveDate,
    pub category: String,
    pub detail: String,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnmappedCategoryPolicy {
    Strict,
    Lenient,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizeConfig {
    pub unmapped_policy: UnmappedCategoryPolicy,
    pub detail_delimiter: String,
    pub presence_value: f64,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            unmapped_policy: UnmappedCategoryPolicy::Lenient,
            detail_delimiter: " | ".to_string(),
            presence_value: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    UndatedRow {
        row: usize,
        raw: String,
    },
    UnmappedCategory {
        category: String,
        rows: usize,
    },
    UnmappedFactorLevel {
        row: usize,
        category: String,
        factor: String,
        level: String,
    },
    NonNumericRating {
        row: usize,
        category: String,
        raw: String,
    },
    EmptyAggregate {
        date: NaiveDate,
        category: String,
    },
    EmptyDetail {
        row: usize,
        category: String,
    },
    DuplicateKey(DuplicateKey),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateKey {
    pub date: NaiveDate,
    pub category: String,
    pub detail: String,
    pub value: f64,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NormalizeReport {
    pub input_rows: usize,
    pub output_rows: usize,
    pub undated_rows: usize,
    pub removed_rows: usize,
    pub diagnostics: Vec<Diagnostic>,
}

impl NormalizeReport {
    pub fn duplicates(&self) -> impl Iterator<Item = &DuplicateKey> {
        self.diagnostics.iter().filter_map(|d| match d {
            Diagnostic::DuplicateKey(key) => Some(key),
            _ => None,
        })
    }

    pub fn unmapped_categories(&self) -> impl Iterator<Item = &str> {
        self.diagnostics.iter().filter_map(|d| match d {
            Diagnostic::UnmappedCategory { category, .. } => Some(category.as_str()),
            _ => None,
        })
    }
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("category '{category}' ({rows} rows) has no rule")]
    UnmappedCategory { category: String, rows: usize },
}

pub fn normalize_entries(
    raw: &[RawEntry],
    rules: &RuleTable,
    cfg: &NormalizeConfig,
) -> Result<(Vec<CanonicalEntry>, NormalizeReport), NormalizeError> {
    let mut report = NormalizeReport {
        input_rows: raw.len(),
        ..NormalizeReport::default()
    };

    // Distinct categories in first-seen order.
    let mut order: Vec<&str> = Vec::new();
    let mut by_category: HashMap<&str, Vec<Dated<'_>>> = HashMap::new();
    for entry in raw {
        let Some(date) = entry.date else {
            report.undated_rows += 1;
            report.diagnostics.push(Diagnostic::UndatedRow {
                row: entry.row,
                raw: entry.date_raw.clone(),
            });
            continue;
        };
        let key = entry.category.as_str();
        if !by_category.contains_key(key) {
            order.push(key);
        }
        by_category.entry(key).or_default().push(Dated { date, entry });
    }

    let fallback = TransformMode::Preserve;
    let mut out = Vec::new();
    for category in order {
        let rows = by_category.remove(category).unwrap_or_default();
        let mode = match rules.get(category) {
            Some(mode) => mode,
            None => match cfg.unmapped_policy {
                UnmappedCategoryPolicy::Strict => {
                    return Err(NormalizeError::UnmappedCategory {
                        category: category.to_string(),
                        rows: rows.len(),
                    });
                }
                UnmappedCategoryPolicy::Lenient => {
                    report.diagnostics.push(Diagnostic::UnmappedCategory {
                        category: category.to_string(),
                        rows: rows.len(),
                    });
                    &fallback
                }
            },
        };

        debug!(
            component = "normalize",
            event = "normalize.category.dispatch",
            category,
            mode = mode.as_str(),
            rows = rows.len()
        );

        match mode {
            TransformMode::Map { factors } => {
                apply_map(&rows, factors, cfg, &mut out, &mut report.diagnostics)
            }
            TransformMode::Symptom => apply_symptom(&rows, cfg, &mut out, &mut report.diagnostics),
            TransformMode::EnergyMood => {
                apply_energy_mood(category, &rows, &mut out, &mut report.diagnostics)
            }
            TransformMode::CountRetain => apply_count_retain(&rows, &mut out),
            TransformMode::Remove => report.removed_rows += rows.len(),
            TransformMode::Preserve => {
                apply_preserve(&rows, cfg, &mut out, &mut report.diagnostics)
            }
        }
    }

    report.diagnostics.extend(
        detect_duplicate_keys(&out)
            .into_iter()
            .map(Diagnostic::DuplicateKey),
    );
    report.output_rows = out.len();

    for diagnostic in &report.diagnostics {
        log_diagnostic(diagnostic);
    }

    info!(
        component = "normalize",
        event = "normalize.finish",
        input_rows = report.input_rows,
        output_rows = report.output_rows,
        undated_rows = report.undated_rows,
        removed_rows = report.removed_rows,
        diagnostics = report.diagnostics.len()
    );

    Ok((out, report))
}

pub fn detect_duplicate_keys(entries: &[CanonicalEntry]) -> Vec<DuplicateKey> {
    let mut counts: BTreeMap<(NaiveDate, &str, &str, u64), usize> = BTreeMap::new();
    for entry in entries {
        *counts
            .entry((
                entry.date,
                entry.category.as_str(),
                entry.detail.as_str(),
                entry.value.to_bits(),
            ))
            .or_insert(0) += 1;
    }

    counts
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|((date, category, detail, bits), count)| DuplicateKey {
            date,
            category: category.to_string(),
            detail: detail.to_string(),
            value: f64::from_bits(bits),
            count,
        })
        .collect()
}

pub fn strip_pictographs(text: &str) -> String {
    static PICTOGRAPHS: OnceLock<Regex> = OnceLock::new();
    let re = PICTOGRAPHS.get_or_init(|| {
        Regex::new(concat!(
            "[",
            "\u{1F000}-\u{1FAFF}",
            "\u{2600}-\u{27BF}",
            "\u{2300}-\u{23FF}",
            "\u{2B00}-\u{2BFF}",
            "\u{24C2}",
            "\u{200D}",
            "\u{20E3}",
            "\u{FE0E}\u{FE0F}",
            "\u{E0020}-\u{E007F}",
            "]+",
        ))
        .expect("pictograph regex must compile")
    });
    re.replace_all(text, "").trim().to_string()
}

pub fn strip_trailing_qualifier(detail: &str) -> String {
    static QUALIFIER: OnceLock<Regex> = OnceLock::new();
    let re = QUALIFIER.get_or_init(|| {
        Regex::new(r"\s*\([^()]*\)\s*$").expect("qualifier regex must compile")
    });
    re.replace(detail.trim(), "").trim().to_string()
}

struct Dated<'a> {
    date: NaiveDate,
    entry: &'a RawEntry,
}

fn numeric_or_presence(
    entry: &RawEntry,
    cfg: &NormalizeConfig,
    diagnostics: &mut Vec<Diagnostic>,
) -> f64 {
    match entry.rating_or_amount.as_deref() {
        None => cfg.presence_value,
        Some(raw) => entry.rating_as_f64().unwrap_or_else(|| {
            diagnostics.push(Diagnostic::NonNumericRating {
                row: entry.row,
                category: entry.category.clone(),
                raw: raw.to_string(),
            });
            cfg.presence_value
        }),
    }
}

fn apply_map(
    rows: &[Dated<'_>],
    factors: &FactorMap,
    cfg: &NormalizeConfig,
    out: &mut Vec<CanonicalEntry>,
    diagnostics: &mut Vec<Diagnostic>,
) {
    for Dated { date, entry } in rows {
        let cleaned = strip_pictographs(&entry.detail);
        let default_value = numeric_or_presence(entry, cfg, diagnostics);

        if cleaned.is_empty() {
            diagnostics.push(Diagnostic::EmptyDetail {
                row: entry.row,
                category: entry.category.clone(),
            });
            out.push(CanonicalEntry {
                date: *date,
                category: entry.category.clone(),
                detail: String::new(),
                value: default_value,
            });
            continue;
        }

        for segment in cleaned.split(cfg.detail_delimiter.as_str()) {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }

            let mut detail = segment.to_string();
            let mut value = default_value;
            if let Some((name, level)) = split_factor_level(segment, factors) {
                match factors.get(name).and_then(|levels| levels.get(level)) {
                    Some(score) => {
                        detail = name.to_string();
                        value = *score as f64;
                    }
                    None => diagnostics.push(Diagnostic::UnmappedFactorLevel {
                        row: entry.row,
                        category: entry.category.clone(),
                        factor: name.to_string(),
                        level: level.to_string(),
                    }),
                }
            }

            out.push(CanonicalEntry {
                date: *date,
                category: entry.category.clone(),
                detail,
                value,
            });
        }
    }
}

// Factor names may contain hyphens ("Self-care - A lot"); each hyphen is tried
// from the right until the left side names a known factor.
fn split_factor_level<'a>(segment: &'a str, factors: &FactorMap) -> Option<(&'a str, &'a str)> {
    segment
        .char_indices()
        .rev()
        .filter(|(_, c)| *c == '-')
        .map(|(idx, _)| (segment[..idx].trim(), segment[idx + 1..].trim()))
        .find(|(name, _)| factors.contains_key(*name))
}

fn apply_symptom(
    rows: &[Dated<'_>],
    cfg: &NormalizeConfig,
    out: &mut Vec<CanonicalEntry>,
    diagnostics: &mut Vec<Diagnostic>,
) {
    let mut first: BTreeMap<(NaiveDate, String), f64> = BTreeMap::new();
    for Dated { date, entry } in rows {
        let detail = strip_trailing_qualifier(&entry.detail);
        if first.contains_key(&(*date, detail.clone())) {
            continue;
        }
        let value = numeric_or_presence(entry, cfg, diagnostics);
        first.insert((*date, detail), value);
    }

    let category = rows.first().map(|r| r.entry.category.clone()).unwrap_or_default();
    out.extend(
        first
            .into_iter()
            .map(|((date, detail), value)| CanonicalEntry {
                date,
                category: category.clone(),
                detail,
                value,
            }),
    );
}

fn apply_energy_mood(
    category: &str,
    rows: &[Dated<'_>],
    out: &mut Vec<CanonicalEntry>,
    diagnostics: &mut Vec<Diagnostic>,
) {
    // date -> (sum, numeric count)
    let mut groups: BTreeMap<NaiveDate, (f64, usize)> = BTreeMap::new();
    for Dated { date, entry } in rows {
        let slot = groups.entry(*date).or_insert((0.0, 0));
        match entry.rating_as_f64() {
            Some(value) => {
                slot.0 += value;
                slot.1 += 1;
            }
            None => {
                if let Some(raw) = entry.rating_or_amount.as_deref() {
                    diagnostics.push(Diagnostic::NonNumericRating {
                        row: entry.row,
                        category: category.to_string(),
                        raw: raw.to_string(),
                    });
                }
            }
        }
    }

    for (date, (sum, count)) in groups {
        if count == 0 {
            diagnostics.push(Diagnostic::EmptyAggregate {
                date,
                category: category.to_string(),
            });
            continue;
        }
        out.push(CanonicalEntry {
            date,
            category: category.to_string(),
            detail: category.to_string(),
            value: sum / count as f64,
        });
    }
}

fn apply_count_retain(rows: &[Dated<'_>], out: &mut Vec<CanonicalEntry>) {
    let mut counts: BTreeMap<NaiveDate, usize> = BTreeMap::new();
    for row in rows {
        *counts.entry(row.date).or_insert(0) += 1;
    }
    out.extend(counts.into_iter().map(|(date, count)| CanonicalEntry {
        date,
        category: COUNT_RETAIN_CATEGORY.to_string(),
        detail: COUNT_RETAIN_DETAIL.to_string(),
        value: count as f64,
    }));
}

fn apply_preserve(
    rows: &[Dated<'_>],
    cfg: &NormalizeConfig,
    out: &mut Vec<CanonicalEntry>,
    diagnostics: &mut Vec<Diagnostic>,
) {
    for Dated { date, entry } in rows {
        let value = numeric_or_presence(entry, cfg, diagnostics);
        out.push(CanonicalEntry {
            date: *date,
            category: entry.category.clone(),
            detail: entry.detail.trim().to_string(),
            value,
        });
    }
}

fn log_diagnostic(diagnostic: &Diagnostic) {
    match diagnostic {
        Diagnostic::UndatedRow { row, raw } => warn!(
            component = "normalize",
            event = "normalize.row.undated",
            row,
            raw = %raw
        ),
        Diagnostic::UnmappedCategory { category, rows } => warn!(
            component = "normalize",
            event = "normalize.category.unmapped",
            category = %category,
            rows,
            fallback = "preserve"
        ),
        Diagnostic::UnmappedFactorLevel {
            row,
            category,
            factor,
            level,
        } => warn!(
            component = "normalize",
            event = "normalize.factor_level.unmapped",
            row,
            category = %category,
            factor = %factor,
            level = %level
        ),
        Diagnostic::NonNumericRating { row, category, raw } => warn!(
            component = "normalize",
            event = "normalize.rating.non_numeric",
            row,
            category = %category,
            raw = %raw
        ),
        Diagnostic::EmptyAggregate { date, category } => warn!(
            component = "normalize",
            event = "normalize.aggregate.empty",
            date = %date,
            category = %category
        ),
        Diagnostic::EmptyDetail { row, category } => warn!(
            component = "normalize",
            event = "normalize.detail.empty",
            row,
            category = %category,
            fallback = "category_only"
        ),
        Diagnostic::DuplicateKey(key) => warn!(
            component = "normalize",
            event = "normalize.duplicate_key",
            date = %key.date,
            category = %key.category,
            detail = %key.detail,
            value = key.value,
            count = key.count
        ),
    }
}
