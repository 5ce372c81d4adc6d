//! Personal health-data lake core.
//!
//! Current implemented scope:
//! - symptom-tracker export ingest, rule-driven normalization and pivot
//! - calendar features and the offset-date join against ring daily data
//! - ring-vendor client with a SQLite read-through cache
//! - result persistence and the dashboard over it

mod bearable;
mod dashboard;
mod features;
mod join;
mod normalize;
mod observability;
mod oura;
mod pipeline;
mod pivot;
mod ring;
mod rules;
mod store;
mod table;

pub use bearable::{
    parse_export_date, read_export, read_export_path, strip_ordinal_suffix, ExportBatch,
    IngestConfig, IngestError, IngestReport, RawEntry, UnparseableDate,
};
pub use dashboard::{
    available_metrics, build_snapshot, dashboard_router, demo_data, render_dashboard_html,
    DashboardData, DashboardQuery, DashboardSnapshot, DashboardSource, InMemoryDashboardSource,
    SqliteDashboardSource, TimeseriesResponse, DASHBOARD_METRICS,
};
pub use features::{
    add_calendar_features, build_output_schema, day_of_week, is_weekend, ColumnDType,
    OutputColumn, OutputSchema, DAY_OF_WEEK_COLUMN, IS_WEEKEND_COLUMN, OUTPUT_SCHEMA_VERSION,
};
pub use join::{join_ring_daily, JoinConfig, JoinError, JoinReport};
pub use normalize::{
    detect_duplicate_keys, normalize_entries, strip_pictographs, strip_trailing_qualifier,
    CanonicalEntry, Diagnostic, DuplicateKey, NormalizeConfig, NormalizeError, NormalizeReport,
    UnmappedCategoryPolicy,
};
pub use observability::{
    init_logging, log_app_start, log_dashboard_bind, log_dashboard_source, log_run_summary,
    logging_config_from_env, parse_bool, DashboardSourceChoice, LogFormat, LoggingConfig,
    LoggingInitError,
};
pub use oura::{
    HttpFetcher, OuraClient, OuraConfig, OuraEndpoint, OuraError, ReqwestBlockingFetcher,
    OURA_BASE_URL,
};
pub use pipeline::{
    run_pipeline, run_pipeline_with_client, transform_export, FeedReport, PipelineConfig,
    PipelineError, PipelineOutput, PipelineReport, PipelineRun,
};
pub use pivot::{
    melt, pivot, ColumnKey, PivotError, WideRow, WideTable, DATE_COLUMN, RESERVED_COLUMNS,
};
pub use ring::{
    build_ring_daily_table, flatten_daily_record, flatten_sleep_record, metric_name,
    records_to_table, unpack_series, DailyFeed, JsonRecord, RingDaily, RingShapeReport,
    TimeSeriesSample, DAILY_SLEEP_PREFIX, DAY_MINUS_ONE_FIELD, READINESS_PREFIX,
    TIME_SERIES_FIELDS,
};
pub use rules::{
    CategoryRule, FactorMap, RuleError, RuleTable, TransformMode, COUNT_RETAIN_CATEGORY,
    COUNT_RETAIN_DETAIL,
};
pub use store::{
    raw_table_name, read_through, CacheSource, CacheStore, DayRange, PersistOutcome,
    ReadThroughError, RunRecord, StoreError,
};
pub use table::{Cell, Table};
