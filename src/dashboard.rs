//! Dashboard over the persisted daily table and per-night sensor samples.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, TimeZone, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::pivot::DATE_COLUMN;
use crate::ring::TimeSeriesSample;
use crate::store::CacheStore;
use crate::table::{Cell, Table};

pub const DASHBOARD_METRICS: [&str; 8] = [
    "daily_sleep_score",
    "readiness_score",
    "deep_sleep_duration",
    "rem_sleep_duration",
    "total_sleep_duration",
    "efficiency",
    "latency_duration",
    "resting_heart_rate",
];

const CHART_WIDTH: f64 = 640.0;
const CHART_HEIGHT: f64 = 120.0;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DashboardData {
    pub table: Table,
    pub samples: Vec<TimeSeriesSample>,
}

pub trait DashboardSource: Send + Sync + 'static {
    fn daily_table(&self) -> Table;
    fn timeseries(&self, day: NaiveDate) -> Vec<TimeSeriesSample>;
}

#[derive(Clone)]
pub struct InMemoryDashboardSource {
    inner: Arc<RwLock<DashboardData>>,
}

impl InMemoryDashboardSource {
    pub fn new(data: DashboardData) -> Self {
        Self {
            inner: Arc::new(RwLock::new(data)),
        }
    }

    pub fn demo() -> Self {
        Self::new(demo_data())
    }

    pub fn replace(&self, data: DashboardData) {
        let mut guard = self
            .inner
            .write()
            .expect("in-memory dashboard lock should not be poisoned");
        *guard = data;
    }
}

impl DashboardSource for InMemoryDashboardSource {
    fn daily_table(&self) -> Table {
        self.inner
            .read()
            .expect("in-memory dashboard lock should not be poisoned")
            .table
            .clone()
    }

    fn timeseries(&self, day: NaiveDate) -> Vec<TimeSeriesSample> {
        self.inner
            .read()
            .expect("in-memory dashboard lock should not be poisoned")
            .samples
            .iter()
            .filter(|sample| sample.day == day)
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct SqliteDashboardSource {
    store_path: PathBuf,
    result_table: String,
}

impl SqliteDashboardSource {
    pub fn new(store_path: impl Into<PathBuf>, result_table: impl Into<String>) -> Self {
        Self {
            store_path: store_path.into(),
            result_table: result_table.into(),
        }
    }
}

impl DashboardSource for SqliteDashboardSource {
    fn daily_table(&self) -> Table {
        let result = CacheStore::open(&self.store_path)
            .and_then(|store| store.read_table(&self.result_table));
        match result {
            Ok(Some(table)) => table,
            Ok(None) => {
                warn!(
                    component = "dashboard",
                    event = "dashboard.source.degraded",
                    reason = "table_missing",
                    table = %self.result_table
                );
                Table::default()
            }
            Err(err) => {
                warn!(
                    component = "dashboard",
                    event = "dashboard.source.degraded",
                    reason = "store_error",
                    table = %self.result_table,
                    error = %err
                );
                Table::default()
            }
        }
    }

    fn timeseries(&self, day: NaiveDate) -> Vec<TimeSeriesSample> {
        let result = CacheStore::open(&self.store_path).and_then(|store| store.read_timeseries(day));
        result.unwrap_or_else(|err| {
            warn!(
                component = "dashboard",
                event = "dashboard.source.degraded",
                reason = "store_error",
                day = %day,
                error = %err
            );
            Vec::new()
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DashboardQuery {
    pub metrics: Vec<String>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl DashboardQuery {
    pub fn from_pairs(pairs: &[(String, String)]) -> Result<Self, String> {
        let mut query = Self::default();
        for (key, value) in pairs {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            match key.as_str() {
                "metric" => {
                    if !query.metrics.iter().any(|m| m == value) {
                        query.metrics.push(value.to_string());
                    }
                }
                "from" => query.from = Some(parse_query_day("from", value)?),
                "to" => query.to = Some(parse_query_day("to", value)?),
                _ => {}
            }
        }
        Ok(query)
    }
}

fn parse_query_day(key: &str, raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| format!("query parameter '{key}' must be YYYY-MM-DD, got '{raw}'"))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardSnapshot {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
    pub available_metrics: Vec<String>,
    pub selected_metrics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeseriesResponse {
    pub day: NaiveDate,
    pub metrics: Vec<String>,
    pub samples: Vec<TimeSeriesSample>,
}

pub fn available_metrics(table: &Table) -> Vec<String> {
    DASHBOARD_METRICS
        .iter()
        .filter(|metric| table.has_column(metric))
        .map(|metric| (*metric).to_string())
        .collect()
}

pub fn build_snapshot(table: &Table, query: &DashboardQuery) -> DashboardSnapshot {
    let available = available_metrics(table);
    let selected: Vec<String> = if query.metrics.is_empty() {
        available.clone()
    } else {
        query
            .metrics
            .iter()
            .filter(|metric| table.has_column(metric) && metric.as_str() != DATE_COLUMN)
            .cloned()
            .collect()
    };

    let date_idx = table.column_index(DATE_COLUMN);
    let row_date = |row: &Vec<Cell>| date_idx.and_then(|idx| row[idx].as_date());
    let windowed = query.from.is_some() || query.to.is_some();

    let mut rows: Vec<&Vec<Cell>> = table
        .rows
        .iter()
        .filter(|row| match row_date(*row) {
            Some(date) => {
                query.from.map_or(true, |from| date >= from)
                    && query.to.map_or(true, |to| date <= to)
            }
            None => !windowed,
        })
        .collect();
    rows.sort_by(|a, b| row_date(*b).cmp(&row_date(*a)));

    DashboardSnapshot {
        columns: table.columns.clone(),
        rows: rows.into_iter().cloned().collect(),
        available_metrics: available,
        selected_metrics: selected,
    }
}

pub fn dashboard_router(source: Arc<dyn DashboardSource>) -> Router {
    Router::new()
        .route("/dashboard", get(get_dashboard_html))
        .route("/dashboard/snapshot", get(get_dashboard_snapshot))
        .route("/dashboard/timeseries", get(get_dashboard_timeseries))
        .with_state(DashboardAppState { source })
}

pub fn render_dashboard_html(snapshot: &DashboardSnapshot, query: &DashboardQuery) -> String {
    let now_utc = Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();

    let mut out = String::new();
    out.push_str("<!DOCTYPE html><html><head><meta charset=\"utf-8\">\n");
    out.push_str("<meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n");
    out.push_str("<title>Health Dashboard</title>\n");
    out.push_str("<style>:root{--bg:#f3f1ec;--card:#ffffff;--ink:#1c2326;--muted:#5f6a73;--line:#d9dee2;--head:#23404a;--accent:#2f7d6d}*{box-sizing:border-box}body{margin:0;color:var(--ink);font-family:\"Avenir Next\",\"Segoe UI\",sans-serif;background:linear-gradient(160deg,var(--bg),#e6eef0);min-height:100vh}.shell{max-width:1400px;margin:0 auto;padding:24px 18px}.hero{background:linear-gradient(135deg,#1d3a44 0%,#2f6370 100%);color:#f5fafb;border-radius:16px;padding:18px 20px}.hero h1{margin:0 0 8px;font-size:1.5rem}.hero-meta{display:flex;gap:16px;flex-wrap:wrap;font-size:.9rem;color:#d8e9ed}.card{margin-top:16px;background:var(--card);border:1px solid #cdd5da;border-radius:16px;padding:14px;box-shadow:0 10px 24px rgba(26,35,42,.10)}.metrics label{margin-right:14px;font-size:.85rem}.chart h2{font-size:.95rem;margin:4px 0}.chart svg{width:100%;max-width:640px;height:120px;background:#f8fbfb;border-radius:8px}.chart polyline{fill:none;stroke:var(--accent);stroke-width:2}.empty{color:var(--muted);font-size:.85rem}.table-wrap{overflow:auto;max-height:70vh}table{width:100%;border-collapse:collapse}thead th{position:sticky;top:0;background:var(--head);color:#f2f7f9;font-size:.75rem;padding:8px;white-space:nowrap}tbody td{font-size:.82rem;padding:7px 8px;border-bottom:1px solid var(--line);white-space:nowrap}tbody tr:nth-child(even){background:#fafcfc}</style>\n");
    out.push_str("</head><body><main class=\"shell\">\n");
    out.push_str("<section class=\"hero\"><h1>Health Dashboard</h1><div class=\"hero-meta\">");
    out.push_str(&format!("<span>Days: {}</span>", snapshot.rows.len()));
    out.push_str(&format!("<span>Columns: {}</span>", snapshot.columns.len()));
    out.push_str(&format!(
        "<span>Generated: {}</span>",
        escape_html(&now_utc)
    ));
    out.push_str("</div></section>\n");

    out.push_str("<section class=\"card metrics\"><form method=\"get\" action=\"/dashboard\">");
    if snapshot.available_metrics.is_empty() {
        out.push_str("<p class=\"empty\">No sleep metrics in the daily table yet.</p>");
    }
    for metric in &snapshot.available_metrics {
        let checked = if snapshot.selected_metrics.contains(metric) {
            " checked"
        } else {
            ""
        };
        out.push_str(&format!(
            "<label><input type=\"checkbox\" name=\"metric\" value=\"{m}\"{checked}> {m}</label>",
            m = escape_html(metric)
        ));
    }
    out.push_str(&format!(
        "<label>from <input type=\"date\" name=\"from\" value=\"{}\"></label>",
        query.from.map(|d| d.to_string()).unwrap_or_default()
    ));
    out.push_str(&format!(
        "<label>to <input type=\"date\" name=\"to\" value=\"{}\"></label>",
        query.to.map(|d| d.to_string()).unwrap_or_default()
    ));
    out.push_str("<button type=\"submit\">Show</button></form></section>\n");

    for metric in &snapshot.selected_metrics {
        out.push_str("<section class=\"card chart\"><h2>");
        out.push_str(&escape_html(metric));
        out.push_str("</h2>");
        out.push_str(&sparkline_svg(&metric_points(snapshot, metric)));
        out.push_str("</section>\n");
    }

    out.push_str("<section class=\"card\"><div class=\"table-wrap\"><table id=\"daily-table\">\n<thead><tr>");
    for column in &snapshot.columns {
        out.push_str("<th>");
        out.push_str(&escape_html(column));
        out.push_str("</th>");
    }
    out.push_str("</tr></thead><tbody>\n");
    for (idx, row) in snapshot.rows.iter().enumerate() {
        out.push_str(&format!("<tr data-row=\"{idx}\">"));
        for cell in row {
            out.push_str("<td>");
            if cell.is_null() {
                out.push('-');
            } else {
                out.push_str(&escape_html(&cell.to_string()));
            }
            out.push_str("</td>");
        }
        out.push_str("</tr>\n");
    }
    out.push_str("</tbody></table></div></section>");
    out.push_str("</main></body></html>\n");
    out
}

fn metric_points(snapshot: &DashboardSnapshot, metric: &str) -> Vec<(NaiveDate, f64)> {
    let date_idx = snapshot.columns.iter().position(|c| c == DATE_COLUMN);
    let metric_idx = snapshot.columns.iter().position(|c| c == metric);
    let (Some(date_idx), Some(metric_idx)) = (date_idx, metric_idx) else {
        return Vec::new();
    };

    let mut points: Vec<(NaiveDate, f64)> = snapshot
        .rows
        .iter()
        .filter_map(|row| Some((row[date_idx].as_date()?, row[metric_idx].as_f64()?)))
        .filter(|(_, value)| value.is_finite())
        .collect();
    points.sort_by_key(|(date, _)| *date);
    points
}

fn sparkline_svg(points: &[(NaiveDate, f64)]) -> String {
    if points.is_empty() {
        return "<p class=\"empty\">No values in range.</p>".to_string();
    }

    let (min, max) = points
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), (_, v)| {
            (lo.min(*v), hi.max(*v))
        });
    let span = max - min;
    let step = if points.len() > 1 {
        CHART_WIDTH / (points.len() - 1) as f64
    } else {
        0.0
    };

    let coords: Vec<String> = points
        .iter()
        .enumerate()
        .map(|(idx, (_, value))| {
            let x = idx as f64 * step;
            let y = if span > 0.0 {
                CHART_HEIGHT - (value - min) / span * CHART_HEIGHT
            } else {
                CHART_HEIGHT / 2.0
            };
            format!("{x:.1},{y:.1}")
        })
        .collect();

    format!(
        "<svg viewBox=\"0 0 {CHART_WIDTH} {CHART_HEIGHT}\" preserveAspectRatio=\"none\" role=\"img\"><polyline points=\"{}\"/></svg><p class=\"empty\">{} to {}, min {min:.1}, max {max:.1}</p>",
        coords.join(" "),
        points[0].0,
        points[points.len() - 1].0
    )
}

pub fn demo_data() -> DashboardData {
    let mut table = Table::new(
        [
            DATE_COLUMN,
            "day_of_week",
            "is_weekend",
            "Mood_Mood",
            "daily_sleep_score",
            "readiness_score",
            "total_sleep_duration",
            "resting_heart_rate",
        ]
        .into_iter()
        .map(str::to_string)
        .collect(),
    );

    let first = NaiveDate::from_ymd_opt(2025, 1, 6).unwrap_or_default();
    let mut samples = Vec::new();
    for offset in 0..7i64 {
        let date = first + ChronoDuration::days(offset);
        let weekday = crate::features::day_of_week(date);
        table.push_row(vec![
            Cell::Date(date),
            Cell::Integer(weekday),
            Cell::Integer(i64::from(crate::features::is_weekend(date))),
            Cell::Real(3.0 + (offset % 3) as f64 * 0.5),
            Cell::Integer(72 + offset * 2),
            Cell::Integer(80 - offset),
            Cell::Integer(25_200 + offset * 600),
            Cell::Integer(54 + offset % 2),
        ]);

        let bedtime = Utc
            .from_utc_datetime(&date.and_hms_opt(22, 30, 0).unwrap_or_default())
            .fixed_offset();
        samples.extend(demo_night(date, bedtime));
    }

    DashboardData { table, samples }
}

fn demo_night(day: NaiveDate, bedtime: DateTime<chrono::FixedOffset>) -> Vec<TimeSeriesSample> {
    (0..12)
        .map(|idx| TimeSeriesSample {
            day,
            metric: "heart_rate".to_string(),
            timestamp: bedtime + ChronoDuration::seconds(300 * idx),
            value: 58.0 - (idx % 4) as f64,
        })
        .collect()
}

pub(crate) fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

#[derive(Clone)]
struct DashboardAppState {
    source: Arc<dyn DashboardSource>,
}

async fn load_table(state: &DashboardAppState) -> Table {
    let source = Arc::clone(&state.source);
    tokio::task::spawn_blocking(move || source.daily_table())
        .await
        .unwrap_or_else(|err| {
            warn!(
                component = "dashboard",
                event = "dashboard.source.degraded",
                reason = "task_failed",
                error = %err
            );
            Table::default()
        })
}

fn bad_request(message: String) -> Response {
    warn!(
        component = "dashboard",
        event = "http.request.rejected",
        reason = %message
    );
    (StatusCode::BAD_REQUEST, message).into_response()
}

async fn get_dashboard_html(
    State(state): State<DashboardAppState>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Response {
    let query = match DashboardQuery::from_pairs(&pairs) {
        Ok(query) => query,
        Err(message) => return bad_request(message),
    };
    let snapshot = build_snapshot(&load_table(&state).await, &query);
    info!(
        component = "dashboard",
        event = "http.dashboard.request",
        rows = snapshot.rows.len(),
        selected_metrics = snapshot.selected_metrics.len()
    );
    Html(render_dashboard_html(&snapshot, &query)).into_response()
}

async fn get_dashboard_snapshot(
    State(state): State<DashboardAppState>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Response {
    let query = match DashboardQuery::from_pairs(&pairs) {
        Ok(query) => query,
        Err(message) => return bad_request(message),
    };
    let snapshot = build_snapshot(&load_table(&state).await, &query);
    info!(
        component = "dashboard",
        event = "http.snapshot.request",
        rows = snapshot.rows.len(),
        selected_metrics = snapshot.selected_metrics.len()
    );
    Json(snapshot).into_response()
}

async fn get_dashboard_timeseries(
    State(state): State<DashboardAppState>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Response {
    let raw_day = pairs
        .iter()
        .find(|(key, _)| key == "day")
        .map(|(_, value)| value.trim().to_string());
    let day = match raw_day.as_deref().map(|raw| parse_query_day("day", raw)) {
        Some(Ok(day)) => day,
        Some(Err(message)) => return bad_request(message),
        None => return bad_request("query parameter 'day' is required".to_string()),
    };

    let source = Arc::clone(&state.source);
    let samples = tokio::task::spawn_blocking(move || source.timeseries(day))
        .await
        .unwrap_or_default();

    let mut metrics: Vec<String> = samples.iter().map(|s| s.metric.clone()).collect();
    metrics.sort();
    metrics.dedup();

    info!(
        component = "dashboard",
        event = "http.timeseries.request",
        day = %day,
        samples = samples.len()
    );
    Json(TimeseriesResponse {
        day,
        metrics,
        samples,
    })
    .into_response()
}
