use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::NaiveDate;
use healthlake::{
    run_pipeline_with_client, CacheSource, CacheStore, Cell, HttpFetcher, OuraClient, OuraConfig,
    OuraError, PipelineConfig, PipelineError, UnmappedCategoryPolicy,
};
use serde_json::json;

const BASE_URL: &str = "https://ring.test/v2/usercollection/";

const EXPORT: &str = "\
date,category,detail,rating/amount,notes
1st Jan 2025,Lifestyle,Work - A lot | Stress - None,,
1st Jan 2025,Mood,Mood,4,
1st Jan 2025,Mood,Mood,2,
2nd Jan 2025,Mood,Mood,2,
2nd Jan 2025,Sleep,7h 30m,7.5,(Synced)
2nd Jan 2025,Health measurements,Weight,70,
";

#[derive(Clone, Default)]
struct MockFetcher {
    responses: HashMap<String, Result<Vec<u8>, u16>>,
    calls: Arc<AtomicUsize>,
}

impl MockFetcher {
    fn with_json(mut self, endpoint: &str, body: serde_json::Value) -> Self {
        self.responses
            .insert(url(endpoint), Ok(serde_json::to_vec(&body).unwrap()));
        self
    }

    fn with_status(mut self, endpoint: &str, status: u16) -> Self {
        self.responses.insert(url(endpoint), Err(status));
        self
    }
}

impl HttpFetcher for MockFetcher {
    fn get_bytes(&self, url: &str, bearer_token: &str) -> Result<Vec<u8>, OuraError> {
        assert_eq!(bearer_token, "token-123");
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.responses.get(url) {
            Some(Ok(bytes)) => Ok(bytes.clone()),
            Some(Err(status)) => Err(OuraError::HttpStatus {
                url: url.to_string(),
                status: *status,
            }),
            None => Err(OuraError::HttpStatus {
                url: url.to_string(),
                status: 404,
            }),
        }
    }
}

fn url(endpoint: &str) -> String {
    format!("{BASE_URL}{endpoint}?start_date=2025-01-01&end_date=2025-01-03")
}

fn oura_config() -> OuraConfig {
    OuraConfig {
        base_url: BASE_URL.to_string(),
        token: Some("token-123".to_string()),
        retry_backoff_ms: 1,
        ..OuraConfig::default()
    }
}

fn client(fetcher: MockFetcher) -> OuraClient {
    OuraClient::with_fetcher(oura_config(), Box::new(fetcher)).unwrap()
}

fn ring_fetcher() -> MockFetcher {
    MockFetcher::default()
        .with_json(
            "daily_sleep",
            json!({
                "data": [{
                    "id": "d-1",
                    "day": "2025-01-02",
                    "score": 81,
                    "timestamp": "2025-01-02T00:00:00+00:00",
                    "contributors": {"deep_sleep": 70}
                }],
                "next_token": null
            }),
        )
        .with_json(
            "sleep",
            json!({
                "data": [
                    {
                        "id": "s-1",
                        "day": "2025-01-02",
                        "type": "long_sleep",
                        "total_sleep_duration": 27000,
                        "latency": 600,
                        "bedtime_start": "2025-01-01T23:00:00+00:00",
                        "readiness": {"score": 77, "contributors": {"hrv_balance": 80}},
                        "heart_rate": {
                            "interval": 300.0,
                            "items": [55, null, 54],
                            "timestamp": "2025-01-01T23:00:00.000+00:00"
                        }
                    },
                    {
                        "id": "s-2",
                        "day": "2025-01-02",
                        "type": "sleep",
                        "total_sleep_duration": 1200
                    }
                ]
            }),
        )
}

fn config(dir: &Path) -> PipelineConfig {
    let export_path = dir.join("export.csv");
    std::fs::write(&export_path, EXPORT).unwrap();
    PipelineConfig {
        export_path,
        store_path: dir.join("store").join("healthlake.sqlite"),
        oura: oura_config(),
        ..PipelineConfig::default()
    }
}

fn date(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 1, d).unwrap()
}

#[test]
fn full_run_joins_previous_evening_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let fetcher = ring_fetcher();
    let calls = Arc::clone(&fetcher.calls);

    let run = run_pipeline_with_client(&cfg, Some(&client(fetcher))).unwrap();
    let table = &run.output.table;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(run.output.report.ingest.excluded_rows, 1);
    assert_eq!(run.output.report.ingest.synced_sleep_rows, 1);
    assert_eq!(table.len(), 2);
    assert_eq!(&table.columns[..3], ["date", "day_of_week", "is_weekend"]);
    for dropped in ["id", "sleep_id", "day", "timestamp", "type", "day_minus_one"] {
        assert!(!table.has_column(dropped), "{dropped} should be dropped");
    }

    // 2025-01-01 is a Wednesday; it meets the ring row dated 2025-01-02.
    assert_eq!(table.rows[0][0], Cell::Date(date(1)));
    assert_eq!(table.cell(0, "day_of_week"), Some(&Cell::Integer(2)));
    assert_eq!(table.cell(0, "Lifestyle_Work"), Some(&Cell::Real(3.0)));
    assert_eq!(table.cell(0, "Lifestyle_Stress"), Some(&Cell::Real(0.0)));
    assert_eq!(table.cell(0, "Mood_Mood"), Some(&Cell::Real(3.0)));
    assert_eq!(table.cell(0, "daily_sleep_score"), Some(&Cell::Integer(81)));
    assert_eq!(table.cell(0, "total_sleep_duration"), Some(&Cell::Integer(27000)));
    assert_eq!(table.cell(0, "latency_duration"), Some(&Cell::Integer(600)));
    assert_eq!(table.cell(0, "readiness_hrv_balance"), Some(&Cell::Integer(80)));

    // No ring row for the morning after the last journal day.
    assert_eq!(table.cell(1, "Lifestyle_Work"), Some(&Cell::Real(0.0)));
    assert_eq!(table.cell(1, "daily_sleep_score"), Some(&Cell::Null));
    assert_eq!(run.output.report.join.matched_rows, 1);
    assert_eq!(run.output.report.join.ineligible_right_rows, 1);

    assert_eq!(run.persisted.run.row_count, 2);
    assert_eq!(run.persisted.samples_written, 2);
    assert!(run.persisted.previous_fingerprint.is_none());

    let store = CacheStore::open(&cfg.store_path).unwrap();
    let persisted = store.read_table("daily_health").unwrap().unwrap();
    assert_eq!(persisted.columns, table.columns);
    assert_eq!(persisted.len(), 2);
    assert_eq!(persisted.cell(0, "date"), Some(&Cell::Text("2025-01-01".into())));
    assert_eq!(store.read_timeseries(date(2)).unwrap().len(), 2);
    assert_eq!(
        store.last_run("daily_health").unwrap().unwrap().schema_fingerprint,
        run.output.schema.fingerprint
    );
}

#[test]
fn second_run_reads_ring_feeds_from_cache() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let first = run_pipeline_with_client(&cfg, Some(&client(ring_fetcher()))).unwrap();

    let offline = MockFetcher::default();
    let calls = Arc::clone(&offline.calls);
    let second = run_pipeline_with_client(&cfg, Some(&client(offline))).unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(second
        .output
        .report
        .ring_feeds
        .iter()
        .all(|feed| feed.source == Some(CacheSource::Cache)));
    assert_eq!(second.output.table, first.output.table);
    assert_eq!(
        second.persisted.previous_fingerprint.as_deref(),
        Some(first.output.schema.fingerprint.as_str())
    );
    assert!(!second.persisted.schema_changed());

    // Cached rows survive without a client at all.
    let third = run_pipeline_with_client(&cfg, None).unwrap();
    assert_eq!(third.output.table, first.output.table);
}

#[test]
fn upstream_failure_runs_without_ring_data() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let fetcher = ring_fetcher().with_status("sleep", 503);
    let calls = Arc::clone(&fetcher.calls);

    let run = run_pipeline_with_client(&cfg, Some(&client(fetcher))).unwrap();

    // daily_sleep once, sleep three times (two retries).
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    let failed: Vec<_> = run
        .output
        .report
        .ring_feeds
        .iter()
        .filter(|feed| feed.error.is_some())
        .map(|feed| feed.feed)
        .collect();
    assert_eq!(failed, vec!["sleep"]);
    assert_eq!(
        run.output.table.columns,
        vec![
            "date",
            "day_of_week",
            "is_weekend",
            "Lifestyle_Stress",
            "Lifestyle_Work",
            "Mood_Mood"
        ]
    );
    assert_eq!(run.output.report.join.matched_rows, 0);
    assert_eq!(run.persisted.samples_written, 0);
}

#[test]
fn strict_mode_aborts_before_writing() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    std::fs::write(
        &cfg.export_path,
        "date,category,detail,rating/amount,notes\n3rd Jan 2025,Hobbies,Chess,,\n",
    )
    .unwrap();
    cfg.normalize.unmapped_policy = UnmappedCategoryPolicy::Strict;

    let err = run_pipeline_with_client(&cfg, None).unwrap_err();
    assert!(matches!(err, PipelineError::Normalize(_)));

    let store = CacheStore::open(&cfg.store_path).unwrap();
    assert!(store.read_table("daily_health").unwrap().is_none());
    assert!(store.last_run("daily_health").unwrap().is_none());
}

#[test]
fn missing_export_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = PipelineConfig {
        export_path: dir.path().join("absent.csv"),
        store_path: dir.path().join("store.sqlite"),
        ..PipelineConfig::default()
    };
    let err = run_pipeline_with_client(&cfg, None).unwrap_err();
    assert!(matches!(err, PipelineError::Ingest(_)));
}
