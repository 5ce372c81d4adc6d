//! One ETL run: export ingest, normalization, pivot, calendar features,
//! ring join and persistence.

use std::env;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::bearable::{read_export_path, ExportBatch, IngestConfig, IngestError, IngestReport};
use crate::features::{add_calendar_features, build_output_schema, OutputSchema};
use crate::join::{join_ring_daily, JoinConfig, JoinError, JoinReport};
use crate::normalize::{
    normalize_entries, NormalizeConfig, NormalizeError, NormalizeReport, UnmappedCategoryPolicy,
};
use crate::observability::parse_bool;
use crate::oura::{OuraClient, OuraConfig, OuraEndpoint, OuraError};
use crate::pivot::{pivot, PivotError, WideTable};
use crate::ring::{
    build_ring_daily_table, DailyFeed, JsonRecord, RingDaily, RingShapeReport, TimeSeriesSample,
};
use crate::rules::{RuleError, RuleTable};
use crate::store::{
    read_through, CacheSource, CacheStore, DayRange, PersistOutcome, ReadThroughError, StoreError,
};
use crate::table::Table;

const ENV_PREFIX: &str = "HEALTHLAKE_";

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub export_path: PathBuf,
    pub store_path: PathBuf,
    pub rules_path: Option<PathBuf>,
    pub result_table: String,
    pub ring_start: Option<NaiveDate>,
    pub ring_end: Option<NaiveDate>,
    pub extra_feeds: Vec<OuraEndpoint>,
    pub ingest: IngestConfig,
    pub normalize: NormalizeConfig,
    pub join: JoinConfig,
    pub oura: OuraConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            export_path: PathBuf::from("data/bearable-export.csv"),
            store_path: PathBuf::from("data/healthlake.sqlite"),
            rules_path: None,
            result_table: "daily_health".to_string(),
            ring_start: None,
            ring_end: None,
            extra_feeds: Vec::new(),
            ingest: IngestConfig::default(),
            normalize: NormalizeConfig::default(),
            join: JoinConfig::default(),
            oura: OuraConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, PipelineError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, PipelineError> {
        let var = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|raw| raw.trim().to_string())
                .filter(|raw| !raw.is_empty())
        };
        let mut cfg = Self::default();

        if let Some(path) = var("EXPORT_PATH") {
            cfg.export_path = PathBuf::from(path);
        }
        if let Some(path) = var("STORE_PATH") {
            cfg.store_path = PathBuf::from(path);
        }
        cfg.rules_path = var("RULES_PATH").map(PathBuf::from);
        if let Some(table) = var("RESULT_TABLE") {
            cfg.result_table = table;
        }
        if let Some(strict) = var("STRICT_CATEGORIES").as_deref().and_then(parse_bool) {
            cfg.normalize.unmapped_policy = if strict {
                UnmappedCategoryPolicy::Strict
            } else {
                UnmappedCategoryPolicy::Lenient
            };
        }
        cfg.ingest.date_format = var("DATE_FORMAT");
        cfg.ring_start = var("RING_START")
            .map(|raw| parse_day("RING_START", &raw))
            .transpose()?;
        cfg.ring_end = var("RING_END")
            .map(|raw| parse_day("RING_END", &raw))
            .transpose()?;

        if let Some(raw) = var("RING_EXTRA_FEEDS") {
            cfg.extra_feeds = raw
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(|name| {
                    OuraEndpoint::parse(name).ok_or_else(|| PipelineError::InvalidConfig {
                        key: "RING_EXTRA_FEEDS",
                        message: format!("unknown feed '{name}'"),
                    })
                })
                .collect::<Result<_, _>>()?;
        }

        if let Some(base) = var("OURA_BASE_URL") {
            cfg.oura.base_url = if base.ends_with('/') {
                base
            } else {
                format!("{base}/")
            };
        }
        cfg.oura.token = match (var("OURA_TOKEN"), var("OURA_TOKEN_FILE")) {
            (Some(token), _) => Some(token),
            (None, Some(path)) => {
                let raw = std::fs::read_to_string(&path).map_err(|err| {
                    PipelineError::InvalidConfig {
                        key: "OURA_TOKEN_FILE",
                        message: format!("{path}: {err}"),
                    }
                })?;
                Some(raw.trim().to_string()).filter(|token| !token.is_empty())
            }
            (None, None) => None,
        };

        Ok(cfg)
    }
}

fn parse_day(key: &'static str, raw: &str) -> Result<NaiveDate, PipelineError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|err| PipelineError::InvalidConfig {
        key,
        message: format!("'{raw}': {err}"),
    })
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration {key}: {message}")]
    InvalidConfig { key: &'static str, message: String },
    #[error(transparent)]
    Rules(#[from] RuleError),
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error(transparent)]
    Pivot(#[from] PivotError),
    #[error(transparent)]
    Join(#[from] JoinError),
    #[error(transparent)]
    Oura(#[from] OuraError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("export has {rows} rows but none survive normalization with a date")]
    NoUsableRows { rows: usize },
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct PipelineReport {
    pub ingest: IngestReport,
    pub normalize: NormalizeReport,
    pub ring: RingShapeReport,
    pub join: JoinReport,
    pub ring_feeds: Vec<FeedReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedReport {
    pub feed: &'static str,
    pub rows: usize,
    pub source: Option<CacheSource>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutput {
    pub wide: WideTable,
    pub table: Table,
    pub schema: OutputSchema,
    pub samples: Vec<TimeSeriesSample>,
    pub report: PipelineReport,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineRun {
    pub output: PipelineOutput,
    pub persisted: PersistOutcome,
}

pub fn transform_export(
    batch: &ExportBatch,
    ring: RingDaily,
    rules: &RuleTable,
    cfg: &PipelineConfig,
) -> Result<PipelineOutput, PipelineError> {
    let (entries, normalize_report) = normalize_entries(&batch.entries, rules, &cfg.normalize)?;
    if entries.is_empty() {
        return Err(PipelineError::NoUsableRows {
            rows: batch.entries.len(),
        });
    }

    let wide = pivot(&entries)?;
    let daily = add_calendar_features(&wide.to_table());
    let (table, join_report) = join_ring_daily(&daily, &ring.table, &cfg.join)?;
    let schema = build_output_schema(&table);

    Ok(PipelineOutput {
        wide,
        table,
        schema,
        samples: ring.samples,
        report: PipelineReport {
            ingest: batch.report.clone(),
            normalize: normalize_report,
            ring: ring.report,
            join: join_report,
            ring_feeds: Vec::new(),
        },
    })
}

pub fn run_pipeline(cfg: &PipelineConfig) -> Result<PipelineRun, PipelineError> {
    let client = match cfg.oura.token {
        Some(_) => Some(OuraClient::new(cfg.oura.clone())?),
        None => None,
    };
    run_pipeline_with_client(cfg, client.as_ref())
}

pub fn run_pipeline_with_client(
    cfg: &PipelineConfig,
    client: Option<&OuraClient>,
) -> Result<PipelineRun, PipelineError> {
    info!(
        component = "pipeline",
        event = "pipeline.start",
        export_path = %cfg.export_path.display(),
        store_path = %cfg.store_path.display(),
        result_table = %cfg.result_table,
        ring_client = client.is_some()
    );

    let rules = load_rules(cfg.rules_path.as_deref())?;
    let batch = read_export_path(&cfg.export_path, &cfg.ingest)?;
    let mut store = CacheStore::open(&cfg.store_path)?;

    let (ring, feed_reports) = match ring_range(cfg, &batch) {
        Some(range) => load_ring(&mut store, client, range, &cfg.extra_feeds)?,
        None => {
            warn!(
                component = "pipeline",
                event = "pipeline.ring.skipped",
                reason = "no_dated_rows"
            );
            (RingDaily::default(), Vec::new())
        }
    };

    let mut output = transform_export(&batch, ring, &rules, cfg)?;
    output.report.ring_feeds = feed_reports;

    let persisted = store.persist_run(
        &cfg.result_table,
        &output.table,
        &output.schema,
        &output.samples,
    )?;

    info!(
        component = "pipeline",
        event = "pipeline.finish",
        rows_read = output.report.ingest.rows_read,
        canonical_rows = output.report.normalize.output_rows,
        wide_columns = output.wide.columns.len(),
        ring_rows = output.report.ring.output_rows,
        matched_rows = output.report.join.matched_rows,
        dropped_sparse_rows = output.report.join.dropped_sparse_rows,
        output_rows = output.table.len(),
        samples = output.samples.len(),
        schema_changed = persisted.schema_changed()
    );

    Ok(PipelineRun { output, persisted })
}

fn load_rules(path: Option<&Path>) -> Result<RuleTable, PipelineError> {
    match path {
        Some(path) => Ok(RuleTable::from_path(path)?),
        None => Ok(RuleTable::bearable_default()),
    }
}

// Explicit bounds win; otherwise the export span, end moved one day for the
// next-morning ring row.
fn ring_range(cfg: &PipelineConfig, batch: &ExportBatch) -> Option<DayRange> {
    let dates = batch.entries.iter().filter_map(|entry| entry.date);
    let span_start = dates.clone().min();
    let span_end = dates.max().and_then(|end| end.succ_opt());

    let start = cfg.ring_start.or(span_start)?;
    let end = cfg.ring_end.or(span_end)?;
    Some(DayRange::new(start, end))
}

fn load_ring(
    store: &mut CacheStore,
    client: Option<&OuraClient>,
    range: DayRange,
    extra_feeds: &[OuraEndpoint],
) -> Result<(RingDaily, Vec<FeedReport>), PipelineError> {
    let mut feeds = vec![OuraEndpoint::DailySleep, OuraEndpoint::Sleep];
    feeds.extend(
        extra_feeds
            .iter()
            .copied()
            .filter(|feed| !matches!(feed, OuraEndpoint::DailySleep | OuraEndpoint::Sleep)),
    );

    let mut fetched: Vec<(OuraEndpoint, Vec<JsonRecord>)> = Vec::new();
    let mut reports = Vec::new();
    let mut upstream_failed = false;

    for feed in feeds {
        let result = read_through(store, feed.as_str(), range, || match client {
            Some(client) => client.fetch_collection(feed, range),
            None => Err(OuraError::MissingToken),
        });
        match result {
            Ok((records, source)) => {
                reports.push(FeedReport {
                    feed: feed.as_str(),
                    rows: records.len(),
                    source: Some(source),
                    error: None,
                });
                fetched.push((feed, records));
            }
            Err(ReadThroughError::Store(err)) => return Err(err.into()),
            Err(ReadThroughError::Fetch(err)) => {
                warn!(
                    component = "pipeline",
                    event = "pipeline.ring.fetch_failed",
                    feed = feed.as_str(),
                    start = %range.start,
                    end = %range.end,
                    error = %err
                );
                upstream_failed = true;
                reports.push(FeedReport {
                    feed: feed.as_str(),
                    rows: 0,
                    source: None,
                    error: Some(err.to_string()),
                });
            }
        }
    }

    if upstream_failed {
        warn!(
            component = "pipeline",
            event = "pipeline.ring.unavailable",
            start = %range.start,
            end = %range.end
        );
        return Ok((RingDaily::default(), reports));
    }

    let records_of = |wanted: OuraEndpoint| {
        fetched
            .iter()
            .find(|(feed, _)| *feed == wanted)
            .map(|(_, records)| records.as_slice())
            .unwrap_or_default()
    };
    let prefixes: Vec<(OuraEndpoint, String)> = fetched
        .iter()
        .map(|(feed, _)| (*feed, format!("{}_", feed.as_str())))
        .filter(|(feed, _)| !matches!(feed, OuraEndpoint::DailySleep | OuraEndpoint::Sleep))
        .collect();
    let extras: Vec<DailyFeed<'_>> = prefixes
        .iter()
        .map(|(feed, prefix)| DailyFeed {
            prefix: prefix.as_str(),
            records: records_of(*feed),
        })
        .collect();

    let ring = build_ring_daily_table(
        records_of(OuraEndpoint::DailySleep),
        records_of(OuraEndpoint::Sleep),
        &extras,
    );
    Ok((ring, reports))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::bearable::read_export;
    use crate::table::Cell;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (format!("{ENV_PREFIX}{k}"), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn batch(csv: &str) -> ExportBatch {
        read_export(csv.as_bytes(), &IngestConfig::default()).expect("export should parse")
    }

    #[test]
    fn config_defaults_without_env() {
        let cfg = PipelineConfig::from_lookup(lookup(&[])).expect("config");
        assert_eq!(cfg, PipelineConfig::default());
        assert_eq!(cfg.result_table, "daily_health");
        assert!(cfg.oura.token.is_none());
    }

    #[test]
    fn config_reads_prefixed_variables() {
        let cfg = PipelineConfig::from_lookup(lookup(&[
            ("EXPORT_PATH", "/tmp/export.csv"),
            ("RESULT_TABLE", "health_v2"),
            ("STRICT_CATEGORIES", "yes"),
            ("RING_START", "2025-01-01"),
            ("RING_EXTRA_FEEDS", "daily_activity, daily_stress"),
            ("OURA_TOKEN", "  secret  "),
            ("OURA_BASE_URL", "http://localhost:9000/v2/usercollection"),
        ]))
        .expect("config");

        assert_eq!(cfg.export_path, PathBuf::from("/tmp/export.csv"));
        assert_eq!(cfg.result_table, "health_v2");
        assert_eq!(cfg.normalize.unmapped_policy, UnmappedCategoryPolicy::Strict);
        assert_eq!(cfg.ring_start, NaiveDate::from_ymd_opt(2025, 1, 1));
        assert_eq!(
            cfg.extra_feeds,
            vec![OuraEndpoint::DailyActivity, OuraEndpoint::DailyStress]
        );
        assert_eq!(cfg.oura.token.as_deref(), Some("secret"));
        assert_eq!(cfg.oura.base_url, "http://localhost:9000/v2/usercollection/");
    }

    #[test]
    fn config_rejects_bad_dates_and_feeds() {
        let err = PipelineConfig::from_lookup(lookup(&[("RING_END", "Jan 5")]))
            .expect_err("bad date");
        assert!(matches!(err, PipelineError::InvalidConfig { key: "RING_END", .. }));

        let err = PipelineConfig::from_lookup(lookup(&[("RING_EXTRA_FEEDS", "steps")]))
            .expect_err("bad feed");
        assert!(matches!(err, PipelineError::InvalidConfig { key: "RING_EXTRA_FEEDS", .. }));
    }

    #[test]
    fn transform_builds_wide_row_from_factor_text() {
        let batch = batch(
            "date,category,detail,rating/amount,notes\n\
             1st Jan 2025,Lifestyle,Work - A lot | Stress - None,,\n",
        );
        let out = transform_export(
            &batch,
            RingDaily::default(),
            &RuleTable::bearable_default(),
            &PipelineConfig::default(),
        )
        .expect("transform");

        assert_eq!(
            out.table.columns,
            vec!["date", "day_of_week", "is_weekend", "Lifestyle_Stress", "Lifestyle_Work"]
        );
        let day = NaiveDate::from_ymd_opt(2025, 1, 1).expect("date");
        assert_eq!(out.table.rows[0][0], Cell::Date(day));
        assert_eq!(out.table.cell(0, "Lifestyle_Work"), Some(&Cell::Real(3.0)));
        assert_eq!(out.table.cell(0, "Lifestyle_Stress"), Some(&Cell::Real(0.0)));
        assert_eq!(out.schema.columns.len(), 5);
    }

    #[test]
    fn undated_only_export_is_fatal() {
        let batch = batch(
            "date,category,detail,rating/amount,notes\n\
             someday,Mood,Mood,3,\n",
        );
        let err = transform_export(
            &batch,
            RingDaily::default(),
            &RuleTable::bearable_default(),
            &PipelineConfig::default(),
        )
        .expect_err("nothing usable");
        assert!(matches!(err, PipelineError::NoUsableRows { rows: 1 }));
    }

    #[test]
    fn ring_range_defaults_to_export_span_plus_one_day() {
        let batch = batch(
            "date,category,detail,rating/amount,notes\n\
             3rd Jan 2025,Mood,Mood,3,\n\
             1st Jan 2025,Mood,Mood,4,\n",
        );
        let range = ring_range(&PipelineConfig::default(), &batch).expect("range");
        assert_eq!(range.start, NaiveDate::from_ymd_opt(2025, 1, 1).expect("date"));
        assert_eq!(range.end, NaiveDate::from_ymd_opt(2025, 1, 4).expect("date"));

        let cfg = PipelineConfig {
            ring_end: NaiveDate::from_ymd_opt(2025, 2, 1),
            ..PipelineConfig::default()
        };
        let range = ring_range(&cfg, &batch).expect("range");
        assert_eq!(range.end, NaiveDate::from_ymd_opt(2025, 2, 1).expect("date"));
    }
}
