//! Ring-vendor REST client: bearer auth, date-range collections, pagination.

use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::ring::JsonRecord;
use crate::store::DayRange;

pub const OURA_BASE_URL: &str = "https://api.ouraring.com/v2/usercollection/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OuraEndpoint {
    Sleep,
    DailySleep,
    SleepTime,
    DailyActivity,
    DailyReadiness,
    DailyResilience,
    DailySpo2,
    DailyStress,
}

impl OuraEndpoint {
    pub const ALL: [OuraEndpoint; 8] = [
        Self::Sleep,
        Self::DailySleep,
        Self::SleepTime,
        Self::DailyActivity,
        Self::DailyReadiness,
        Self::DailyResilience,
        Self::DailySpo2,
        Self::DailyStress,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sleep => "sleep",
            Self::DailySleep => "daily_sleep",
            Self::SleepTime => "sleep_time",
            Self::DailyActivity => "daily_activity",
            Self::DailyReadiness => "daily_readiness",
            Self::DailyResilience => "daily_resilience",
            Self::DailySpo2 => "daily_spo2",
            Self::DailyStress => "daily_stress",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|endpoint| endpoint.as_str() == raw.trim())
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct OuraConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub http_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub max_pages: usize,
}

impl Default for OuraConfig {
    fn default() -> Self {
        Self {
            base_url: OURA_BASE_URL.to_string(),
            token: None,
            http_timeout_ms: 15_000,
            max_retries: 2,
            retry_backoff_ms: 200,
            max_pages: 100,
        }
    }
}

impl fmt::Debug for OuraConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OuraConfig")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("http_timeout_ms", &self.http_timeout_ms)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("max_pages", &self.max_pages)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum OuraError {
    #[error("no API token configured")]
    MissingToken,
    #[error("invalid request URL {url}: {message}")]
    InvalidUrl { url: String, message: String },
    #[error("HTTP client build error: {0}")]
    HttpClientBuild(String),
    #[error("HTTP request failed for {url}: {message}")]
    HttpRequest { url: String, message: String },
    #[error("unexpected HTTP status {status} for {url}")]
    HttpStatus { url: String, status: u16 },
    #[error("invalid payload from {url}: {message}")]
    InvalidPayload { url: String, message: String },
    #[error("{endpoint} exceeded {pages} pages")]
    PageLimit { endpoint: &'static str, pages: usize },
}

impl OuraError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::HttpRequest { .. } => true,
            Self::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

pub trait HttpFetcher: Send + Sync {
    fn get_bytes(&self, url: &str, bearer_token: &str) -> Result<Vec<u8>, OuraError>;
}

pub struct ReqwestBlockingFetcher {
    client: reqwest::blocking::Client,
}

impl ReqwestBlockingFetcher {
    pub fn new(timeout_ms: u64) -> Result<Self, OuraError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|err| OuraError::HttpClientBuild(err.to_string()))?;
        Ok(Self { client })
    }
}

impl HttpFetcher for ReqwestBlockingFetcher {
    fn get_bytes(&self, url: &str, bearer_token: &str) -> Result<Vec<u8>, OuraError> {
        let response = self
            .client
            .get(url)
            .bearer_auth(bearer_token)
            .send()
            .map_err(|err| OuraError::HttpRequest {
                url: url.to_string(),
                message: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(OuraError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        response
            .bytes()
            .map(|bytes| bytes.to_vec())
            .map_err(|err| OuraError::HttpRequest {
                url: url.to_string(),
                message: err.to_string(),
            })
    }
}

#[derive(Debug, Deserialize)]
struct CollectionPage {
    #[serde(default)]
    data: Vec<JsonRecord>,
    #[serde(default)]
    next_token: Option<String>,
}

pub struct OuraClient {
    cfg: OuraConfig,
    token: String,
    fetcher: Box<dyn HttpFetcher>,
}

impl OuraClient {
    pub fn new(cfg: OuraConfig) -> Result<Self, OuraError> {
        let fetcher = ReqwestBlockingFetcher::new(cfg.http_timeout_ms)?;
        Self::with_fetcher(cfg, Box::new(fetcher))
    }

    pub fn with_fetcher(cfg: OuraConfig, fetcher: Box<dyn HttpFetcher>) -> Result<Self, OuraError> {
        let token = cfg
            .token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(OuraError::MissingToken)?
            .to_string();
        Ok(Self {
            cfg,
            token,
            fetcher,
        })
    }

    pub fn collection_url(
        &self,
        endpoint: OuraEndpoint,
        range: DayRange,
        next_token: Option<&str>,
    ) -> Result<String, OuraError> {
        let base = format!("{}{}", self.cfg.base_url, endpoint.as_str());
        let start = range.start.format("%Y-%m-%d").to_string();
        let end = range.end.format("%Y-%m-%d").to_string();
        let mut params = vec![("start_date", start.as_str()), ("end_date", end.as_str())];
        if let Some(token) = next_token {
            params.push(("next_token", token));
        }

        reqwest::Url::parse_with_params(&base, &params)
            .map(|url| url.to_string())
            .map_err(|err| OuraError::InvalidUrl {
                url: base,
                message: err.to_string(),
            })
    }

    pub fn fetch_collection(
        &self,
        endpoint: OuraEndpoint,
        range: DayRange,
    ) -> Result<Vec<JsonRecord>, OuraError> {
        info!(
            component = "oura",
            event = "oura.fetch.start",
            endpoint = endpoint.as_str(),
            start = %range.start,
            end = %range.end
        );

        let mut records = Vec::new();
        let mut next_token: Option<String> = None;
        let mut pages = 0usize;

        loop {
            if pages >= self.cfg.max_pages {
                return Err(OuraError::PageLimit {
                    endpoint: endpoint.as_str(),
                    pages,
                });
            }

            let url = self.collection_url(endpoint, range, next_token.as_deref())?;
            let bytes = retry(&self.cfg, endpoint, || self.fetcher.get_bytes(&url, &self.token))?;
            let page: CollectionPage =
                serde_json::from_slice(&bytes).map_err(|err| OuraError::InvalidPayload {
                    url: url.clone(),
                    message: err.to_string(),
                })?;
            pages += 1;

            debug!(
                component = "oura",
                event = "oura.fetch.page",
                endpoint = endpoint.as_str(),
                page = pages,
                records = page.data.len()
            );
            records.extend(page.data);

            match page.next_token {
                Some(token) if !token.is_empty() => next_token = Some(token),
                _ => break,
            }
        }

        info!(
            component = "oura",
            event = "oura.fetch.finish",
            endpoint = endpoint.as_str(),
            pages,
            records = records.len()
        );

        Ok(records)
    }
}

fn retry<T>(
    cfg: &OuraConfig,
    endpoint: OuraEndpoint,
    mut f: impl FnMut() -> Result<T, OuraError>,
) -> Result<T, OuraError> {
    let mut attempt: u32 = 0;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= cfg.max_retries || !err.is_retryable() => return Err(err),
            Err(err) => {
                attempt = attempt.saturating_add(1);
                let shift = attempt.saturating_sub(1).min(10);
                let sleep_ms = cfg.retry_backoff_ms.saturating_mul(1u64 << shift);
                warn!(
                    component = "oura",
                    event = "oura.fetch.retry",
                    endpoint = endpoint.as_str(),
                    attempt,
                    sleep_ms,
                    error = %err
                );
                std::thread::sleep(Duration::from_millis(sleep_ms));
            }
        }
    }
}
