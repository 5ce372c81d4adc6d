//! Logging setup for the pipeline and dashboard binaries, plus the run and
//! server lifecycle events they emit.

use std::net::SocketAddr;
use std::path::Path;

use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::pipeline::PipelineRun;

const ENV_PREFIX: &str = "HEALTHLAKE_LOG_";

const DASHBOARD_ROUTES: &str = "/dashboard,/dashboard/snapshot,/dashboard/timeseries";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "pretty" => Some(Self::Pretty),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
        }
    }
}

impl LoggingConfig {
    // Unknown format or target values keep the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let mut config = Self::default();

        if let Some(level) = var("LEVEL") {
            let trimmed = level.trim();
            if !trimmed.is_empty() {
                config.level = trimmed.to_string();
            }
        }
        if let Some(format) = var("FORMAT").as_deref().and_then(LogFormat::parse) {
            config.format = format;
        }
        if let Some(include_target) = var("TARGET").as_deref().and_then(parse_bool) {
            config.include_target = include_target;
        }

        config
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

pub fn logging_config_from_env() -> LoggingConfig {
    LoggingConfig::from_lookup(|key| std::env::var(key).ok())
}

pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let env_filter =
        EnvFilter::try_new(config.level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(config.include_target)
        .with_ansi(matches!(config.format, LogFormat::Pretty));

    match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
    }

    Ok(())
}

pub fn log_app_start(component: &'static str, config: &LoggingConfig) {
    info!(
        component,
        event = "app.start",
        log_level = %config.level,
        log_format = ?config.format,
        include_target = config.include_target
    );
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DashboardSourceChoice<'a> {
    Demo { reason: &'a str },
    Sqlite { store_path: &'a Path, result_table: &'a str },
}

pub fn log_dashboard_source(choice: DashboardSourceChoice<'_>) {
    match choice {
        DashboardSourceChoice::Demo { reason } => info!(
            component = "dashboard_server",
            event = "dashboard.source.selected",
            source = "demo",
            reason
        ),
        DashboardSourceChoice::Sqlite {
            store_path,
            result_table,
        } => info!(
            component = "dashboard_server",
            event = "dashboard.source.selected",
            source = "sqlite",
            store_path = %store_path.display(),
            result_table
        ),
    }
}

pub fn log_dashboard_bind(bound_addr: SocketAddr) {
    info!(
        component = "dashboard_server",
        event = "dashboard.bind",
        bind_addr = %bound_addr,
        routes = DASHBOARD_ROUTES
    );
}

pub fn log_run_summary(run: &PipelineRun) {
    let report = &run.output.report;
    let record = &run.persisted.run;

    for feed in &report.ring_feeds {
        match &feed.error {
            Some(error) => warn!(
                component = "health_pipeline",
                event = "pipeline.run.feed",
                feed = feed.feed,
                status = "unavailable",
                error = %error
            ),
            None => info!(
                component = "health_pipeline",
                event = "pipeline.run.feed",
                feed = feed.feed,
                status = "ok",
                rows = feed.rows,
                source = ?feed.source
            ),
        }
    }

    info!(
        component = "health_pipeline",
        event = "pipeline.run.summary",
        result_table = %record.result_table,
        rows = record.row_count,
        columns = record.column_count,
        excluded_rows = report.ingest.excluded_rows,
        synced_sleep_rows = report.ingest.synced_sleep_rows,
        diagnostics = report.normalize.diagnostics.len(),
        matched_ring_rows = report.join.matched_rows,
        dropped_sparse_rows = report.join.dropped_sparse_rows,
        samples = run.persisted.samples_written,
        schema_fingerprint = %record.schema_fingerprint,
        schema_changed = run.persisted.schema_changed()
    );
}

pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
