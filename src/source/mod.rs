use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeDelta, Utc};
use serde::Deserialize;
use tracing::debug;

use crate::config::SourceConfig;
use crate::signal::Metric;

/// One reading of one metric at one source timestamp.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawSample {
    pub timestamp: DateTime<Utc>,
    pub metric: Metric,
    pub value: f64,
}

impl RawSample {
    pub fn new(timestamp: DateTime<Utc>, metric: Metric, value: f64) -> Self {
        Self {
            timestamp,
            metric,
            value,
        }
    }
}

/// Half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// Returns the UTC calendar day covered by a partition date.
    pub fn for_date(date: NaiveDate) -> Self {
        let start = date.and_time(chrono::NaiveTime::MIN).and_utc();
        Self {
            start,
            end: start + TimeDelta::days(1),
        }
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t < self.end
    }
}

/// Callback type for recording source request metrics.
/// The callback receives (outcome, duration).
pub type MetricsCallback = Box<dyn Fn(&str, Duration) + Send + Sync>;

/// Reads raw samples from the source store.
pub trait SourceReader: Send + Sync {
    /// Fetches samples for `window` restricted to `metrics`, ordered by timestamp.
    ///
    /// An empty vector means the source holds no data in range.
    fn fetch(
        &self,
        window: TimeWindow,
        metrics: &[Metric],
    ) -> impl std::future::Future<Output = Result<Vec<RawSample>>> + Send;
}

/// HTTP client for the source read API.
pub struct HttpSourceReader {
    http: reqwest::Client,
    endpoint: String,
    metrics: Option<MetricsCallback>,
}

impl HttpSourceReader {
    /// Create a new source client. Every request is bounded by `cfg.timeout`.
    pub fn new(cfg: &SourceConfig) -> Result<Self> {
        let timeout = if cfg.timeout.is_zero() {
            Duration::from_secs(30)
        } else {
            cfg.timeout
        };

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            endpoint: cfg.endpoint.trim_end_matches('/').to_string(),
            metrics: None,
        })
    }

    /// Set a metrics callback for recording request stats.
    pub fn with_metrics(mut self, cb: MetricsCallback) -> Self {
        self.metrics = Some(cb);
        self
    }

    fn record_request(&self, outcome: &str, duration: Duration) {
        if let Some(ref cb) = self.metrics {
            cb(outcome, duration);
        }
    }

    async fn get_data(&self, window: TimeWindow, metrics: &[Metric]) -> Result<DataApiResponse> {
        let start = Instant::now();
        let url = format!("{}/data", self.endpoint);
        let params = query_params(window, metrics);

        let response = match self
            .http
            .get(&url)
            .header("Accept", "application/json")
            .query(&params[..])
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                let outcome = if e.is_timeout() { "timeout" } else { "error" };
                self.record_request(outcome, start.elapsed());
                return Err(e).with_context(|| format!("requesting {url}"));
            }
        };

        let status_code = response.status();

        if !status_code.is_success() {
            let body = response.text().await.unwrap_or_default();
            self.record_request("error", start.elapsed());
            bail!("unexpected status {} from {}: {}", status_code, url, body);
        }

        let result: DataApiResponse = match response.json().await {
            Ok(result) => result,
            Err(e) => {
                self.record_request("error", start.elapsed());
                return Err(e).with_context(|| format!("decoding response from {url}"));
            }
        };

        self.record_request("success", start.elapsed());

        Ok(result)
    }
}

impl SourceReader for HttpSourceReader {
    async fn fetch(&self, window: TimeWindow, metrics: &[Metric]) -> Result<Vec<RawSample>> {
        debug!(start = %window.start, end = %window.end, "fetching source data");

        let resp = self
            .get_data(window, metrics)
            .await
            .context("fetching source data")?;

        if let Some(count) = resp.count {
            if count != resp.data.len() {
                debug!(
                    count,
                    rows = resp.data.len(),
                    "source count differs from returned rows"
                );
            }
        }

        rows_to_samples(&resp.data, window, metrics)
    }
}

// --- JSON response structures ---

#[derive(Deserialize)]
struct DataApiResponse {
    #[serde(default)]
    data: Vec<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    count: Option<usize>,
}

/// Builds the `start`, `end` and `variables` query parameters.
fn query_params(window: TimeWindow, metrics: &[Metric]) -> [(&'static str, String); 3] {
    let variables = metrics
        .iter()
        .map(|m| m.as_str())
        .collect::<Vec<_>>()
        .join(",");

    [
        ("start", window.start.to_rfc3339_opts(SecondsFormat::Secs, true)),
        ("end", window.end.to_rfc3339_opts(SecondsFormat::Secs, true)),
        ("variables", variables),
    ]
}

/// Flattens wide source rows into timestamp-ordered samples.
///
/// Null, missing and non-finite values produce no sample. Rows outside the
/// window are discarded.
fn rows_to_samples(
    rows: &[serde_json::Map<String, serde_json::Value>],
    window: TimeWindow,
    metrics: &[Metric],
) -> Result<Vec<RawSample>> {
    let mut samples = Vec::with_capacity(rows.len() * metrics.len());
    let mut outside = 0usize;

    for (idx, row) in rows.iter().enumerate() {
        let raw_ts = row
            .get("timestamp")
            .and_then(|v| v.as_str())
            .with_context(|| format!("row {idx} has no string timestamp"))?;

        let timestamp = parse_timestamp(raw_ts)
            .with_context(|| format!("parsing timestamp {raw_ts:?} in row {idx}"))?;

        if !window.contains(timestamp) {
            outside += 1;
            continue;
        }

        for &metric in metrics {
            let Some(value) = row.get(metric.as_str()).and_then(|v| v.as_f64()) else {
                continue;
            };
            if value.is_finite() {
                samples.push(RawSample::new(timestamp, metric, value));
            }
        }
    }

    if outside > 0 {
        debug!(outside, "discarded source rows outside the requested window");
    }

    samples.sort_by_key(|s| (s.timestamp, s.metric));

    Ok(samples)
}

/// Parses an RFC 3339 timestamp, or a naive ISO 8601 timestamp taken as UTC.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
        .with_context(|| format!("unrecognized timestamp format: {s:?}"))?;

    Ok(naive.and_utc())
}
