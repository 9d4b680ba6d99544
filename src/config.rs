use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, NaiveTime};
use serde::Deserialize;

use crate::signal::Metric;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Top-level configuration for the sensor ETL.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Source read API configuration.
    #[serde(default)]
    pub source: SourceConfig,

    /// Aggregation and load knobs.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Target store (ClickHouse) configuration.
    #[serde(default)]
    pub target: TargetConfig,

    /// Partition trigger configuration.
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Source read API configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Base URL of the source API (e.g., "http://localhost:8000").
    #[serde(default)]
    pub endpoint: String,

    /// Request timeout. Exceeding it fails the partition. Default: 30s.
    #[serde(default = "default_source_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Aggregation and load knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Aggregation bucket width. Default: 10m.
    #[serde(default = "default_bucket_width", with = "humantime_serde")]
    pub bucket_width: Duration,

    /// Rows per load batch. Default: 1000.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Metrics to extract and aggregate. Default: [wind_speed, power].
    #[serde(default = "default_metrics")]
    pub metrics: Vec<Metric>,
}

/// ClickHouse connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    /// ClickHouse native protocol address (host:port).
    #[serde(default)]
    pub endpoint: String,

    /// Target database name. Default: "default".
    #[serde(default = "default_database")]
    pub database: String,

    /// ClickHouse username.
    #[serde(default)]
    pub username: String,

    /// ClickHouse password.
    #[serde(default)]
    pub password: String,

    /// Skip loading a partition whose fact rows already exist. Default: false.
    #[serde(default)]
    pub skip_loaded_partitions: bool,

    /// Schema migration configuration.
    #[serde(default)]
    pub migrations: MigrationsConfig,
}

/// Schema migration behavior configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct MigrationsConfig {
    /// Run migrations when the scheduler starts. Default: false.
    #[serde(default)]
    pub enabled: bool,
}

/// Partition trigger configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ScheduleConfig {
    /// Daily catch-up trigger.
    #[serde(default)]
    pub daily: DailyTriggerConfig,

    /// Backfill trigger over a fixed partition range.
    #[serde(default)]
    pub backfill: BackfillTriggerConfig,
}

/// Daily catch-up trigger: processes the previous UTC day once per day.
#[derive(Debug, Clone, Deserialize)]
pub struct DailyTriggerConfig {
    /// Enable the daily trigger. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// UTC wall-clock time of day to fire, "HH:MM". Default: "01:00".
    #[serde(default = "default_daily_at")]
    pub at: String,
}

/// Backfill trigger: periodically processes every partition in
/// [start_date, end_date] that has not yet completed in this process.
#[derive(Debug, Clone, Deserialize)]
pub struct BackfillTriggerConfig {
    /// Enable the backfill trigger. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Time between backfill passes. Default: 1h.
    #[serde(default = "default_backfill_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// First partition date (inclusive).
    #[serde(default)]
    pub start_date: Option<NaiveDate>,

    /// Last partition date (inclusive).
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_source_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_bucket_width() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_batch_size() -> usize {
    1000
}

fn default_metrics() -> Vec<Metric> {
    vec![Metric::WindSpeed, Metric::Power]
}

fn default_database() -> String {
    "default".to_string()
}

fn default_true() -> bool {
    true
}

fn default_daily_at() -> String {
    "01:00".to_string()
}

fn default_backfill_interval() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            source: SourceConfig::default(),
            pipeline: PipelineConfig::default(),
            target: TargetConfig::default(),
            schedule: ScheduleConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            timeout: default_source_timeout(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            bucket_width: default_bucket_width(),
            batch_size: default_batch_size(),
            metrics: default_metrics(),
        }
    }
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            database: default_database(),
            username: String::new(),
            password: String::new(),
            skip_loaded_partitions: false,
            migrations: MigrationsConfig::default(),
        }
    }
}

impl Default for DailyTriggerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            at: default_daily_at(),
        }
    }
}

impl Default for BackfillTriggerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: default_backfill_interval(),
            start_date: None,
            end_date: None,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Parses a YAML file without validating it, so callers can apply
    /// overrides first.
    pub fn read(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.source.endpoint.is_empty() {
            bail!("source.endpoint is required");
        }

        if self.source.timeout.is_zero() {
            bail!("source.timeout must be positive");
        }

        if self.target.endpoint.is_empty() {
            bail!("target.endpoint is required");
        }

        self.pipeline.validate()?;

        if self.schedule.daily.enabled {
            parse_time_of_day(&self.schedule.daily.at)
                .context("invalid schedule.daily.at")?;
        }

        let backfill = &self.schedule.backfill;
        if backfill.enabled {
            if backfill.interval.is_zero() {
                bail!("schedule.backfill.interval must be positive");
            }

            let (Some(start), Some(end)) = (backfill.start_date, backfill.end_date) else {
                bail!("schedule.backfill.start_date and end_date are required when enabled");
            };

            if start > end {
                bail!("schedule.backfill.start_date {start} is after end_date {end}");
            }
        }

        Ok(())
    }
}

impl PipelineConfig {
    /// Validates the aggregation and load knobs.
    pub fn validate(&self) -> Result<()> {
        if self.bucket_width.subsec_nanos() != 0 {
            bail!(
                "pipeline.bucket_width {:?} must be a whole number of seconds",
                self.bucket_width
            );
        }

        let width_secs = self.bucket_width.as_secs();
        if width_secs == 0 {
            bail!("pipeline.bucket_width must be positive");
        }

        // Buckets anchored to the epoch never straddle a day boundary only if
        // the width divides a day.
        if SECONDS_PER_DAY % width_secs != 0 {
            bail!(
                "pipeline.bucket_width {:?} must divide 24h evenly",
                self.bucket_width
            );
        }

        if self.batch_size == 0 {
            bail!("pipeline.batch_size must be positive");
        }

        if self.metrics.is_empty() {
            bail!("pipeline.metrics must not be empty");
        }

        let mut seen = HashSet::new();
        for metric in &self.metrics {
            if !seen.insert(*metric) {
                bail!("metric appears more than once in pipeline.metrics: {metric}");
            }
        }

        Ok(())
    }

    /// Bucket width in whole minutes, for descriptions.
    pub fn bucket_minutes(&self) -> u64 {
        self.bucket_width.as_secs() / 60
    }
}

impl TargetConfig {
    /// Builds a clickhouse-rs compatible TCP DSN from configuration.
    ///
    /// Format: `tcp://[user[:pass]@]host:port/database?options`
    pub fn dsn(&self) -> String {
        let mut dsn = "tcp://".to_string();

        if !self.username.is_empty() {
            dsn.push_str(&self.username);
            if !self.password.is_empty() {
                dsn.push(':');
                dsn.push_str(&self.password);
            }
            dsn.push('@');
        }

        dsn.push_str(&self.endpoint);
        dsn.push('/');
        dsn.push_str(&self.database);
        dsn.push_str("?compression=lz4&pool_min=1&pool_max=4");

        dsn
    }
}

/// Parses an "HH:MM" UTC time of day.
pub fn parse_time_of_day(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M").with_context(|| format!("expected HH:MM, got {s:?}"))
}
