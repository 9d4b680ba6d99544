//! Per-partition orchestration.
//!
//! A partition is one UTC calendar day. [`PartitionRunner::run_partition`]
//! drives extract → aggregate → normalize → resolve → load for that day and
//! always returns a [`PartitionResult`]; faults become a status, never an
//! error past this boundary.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::health::HealthMetrics;
use crate::pipeline::{aggregate, normalize, resolve, summarize_by_metric, Loader, Summary};
use crate::signal::{Metric, SignalRegistry};
use crate::source::{SourceReader, TimeWindow};
use crate::store::TargetStore;

/// Pipeline stage, used to attribute a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Opening the target store, before any data is read.
    Connecting,
    Extracting,
    Aggregating,
    Normalizing,
    Resolving,
    Loading,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Extracting => "extracting",
            Self::Aggregating => "aggregating",
            Self::Normalizing => "normalizing",
            Self::Resolving => "resolving",
            Self::Loading => "loading",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal status of a partition run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PartitionStatus {
    /// Rows were loaded, or the partition was already loaded and skipped.
    Success {
        /// Descriptive statistics of the raw input per metric.
        input_stats: BTreeMap<Metric, Summary>,
    },
    /// The source returned nothing for the day.
    NoData,
    /// Input existed but no row resolved to a registered signal.
    NoValidData,
    /// A stage failed.
    Error { stage: Stage, detail: String },
}

impl PartitionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::NoData => "no_data",
            Self::NoValidData => "no_valid_data",
            Self::Error { .. } => "error",
        }
    }
}

/// Outcome of one partition run. Built once and returned, never updated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionResult {
    pub partition_date: NaiveDate,
    #[serde(flatten)]
    pub status: PartitionStatus,
    pub records_extracted: usize,
    pub buckets_processed: usize,
    pub records_inserted: usize,
    /// Distinct generated signal names missing from the registry, sorted.
    pub unresolved_signals: Vec<String>,
    /// Fact rows already present when the load was skipped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preexisting_rows: Option<u64>,
    pub duration_ms: u64,
}

impl PartitionResult {
    fn new(partition_date: NaiveDate) -> Self {
        Self {
            partition_date,
            status: PartitionStatus::NoData,
            records_extracted: 0,
            buckets_processed: 0,
            records_inserted: 0,
            unresolved_signals: Vec::new(),
            preexisting_rows: None,
            duration_ms: 0,
        }
    }

    /// Builds an error result for a partition that could not start, e.g.
    /// because the registry snapshot failed to load.
    pub fn failed(partition_date: NaiveDate, stage: Stage, err: &anyhow::Error) -> Self {
        Self {
            status: PartitionStatus::Error {
                stage,
                detail: format!("{err:#}"),
            },
            ..Self::new(partition_date)
        }
    }

    pub fn status_str(&self) -> &'static str {
        self.status.as_str()
    }

    /// True for `success` and `no_data`, the outcomes a one-shot run exits 0 on.
    pub fn is_ok(&self) -> bool {
        matches!(
            self.status,
            PartitionStatus::Success { .. } | PartitionStatus::NoData
        )
    }

    pub fn is_error(&self) -> bool {
        matches!(self.status, PartitionStatus::Error { .. })
    }

    pub fn error_detail(&self) -> Option<&str> {
        match &self.status {
            PartitionStatus::Error { detail, .. } => Some(detail),
            _ => None,
        }
    }
}

/// A stage fault, carried to the top of `run_partition`.
struct StageFailure {
    stage: Stage,
    source: anyhow::Error,
}

fn at(stage: Stage) -> impl FnOnce(anyhow::Error) -> StageFailure {
    move |source| StageFailure { stage, source }
}

/// Runs partitions against one source and one target store.
pub struct PartitionRunner<S, T> {
    source: S,
    store: T,
    pipeline: PipelineConfig,
    skip_loaded: bool,
    health: Option<Arc<HealthMetrics>>,
}

impl<S: SourceReader, T: TargetStore> PartitionRunner<S, T> {
    pub fn new(source: S, store: T, pipeline: PipelineConfig) -> Self {
        Self {
            source,
            store,
            pipeline,
            skip_loaded: false,
            health: None,
        }
    }

    /// Skip loading a partition whose day already has fact rows.
    pub fn with_skip_loaded(mut self, skip: bool) -> Self {
        self.skip_loaded = skip;
        self
    }

    pub fn with_health(mut self, health: Option<Arc<HealthMetrics>>) -> Self {
        self.health = health;
        self
    }

    pub fn store(&self) -> &T {
        &self.store
    }

    /// Reads a fresh registry snapshot from the target store.
    pub async fn load_registry(&self) -> Result<Arc<SignalRegistry>> {
        let registry = self
            .store
            .fetch_registry()
            .await
            .context("loading signal registry")?;

        debug!(signals = registry.len(), "signal registry loaded");

        Ok(Arc::new(registry))
    }

    /// Processes one calendar day against the given registry snapshot.
    pub async fn run_partition(
        &self,
        date: NaiveDate,
        registry: &SignalRegistry,
    ) -> PartitionResult {
        let started = Instant::now();
        let mut result = PartitionResult::new(date);

        info!(partition = %date, "partition started");

        let status = match self.execute(date, registry, &mut result).await {
            Ok(status) => status,
            Err(StageFailure { stage, source }) => {
                error!(
                    partition = %date,
                    stage = %stage,
                    error = %format!("{source:#}"),
                    "partition failed"
                );
                PartitionStatus::Error {
                    stage,
                    detail: format!("{source:#}"),
                }
            }
        };
        result.status = status;

        let elapsed = started.elapsed();
        result.duration_ms = elapsed.as_millis() as u64;

        info!(
            partition = %date,
            status = result.status_str(),
            extracted = result.records_extracted,
            buckets = result.buckets_processed,
            inserted = result.records_inserted,
            duration_ms = result.duration_ms,
            "partition finished"
        );

        self.record(&result, elapsed.as_secs_f64());

        result
    }

    async fn execute(
        &self,
        date: NaiveDate,
        registry: &SignalRegistry,
        result: &mut PartitionResult,
    ) -> Result<PartitionStatus, StageFailure> {
        let window = TimeWindow::for_date(date);

        debug!(partition = %date, stage = %Stage::Extracting, "stage started");
        let samples = self
            .source
            .fetch(window, &self.pipeline.metrics)
            .await
            .map_err(at(Stage::Extracting))?;

        result.records_extracted = samples.len();
        if samples.is_empty() {
            info!(partition = %date, "no source data for partition");
            return Ok(PartitionStatus::NoData);
        }

        debug!(partition = %date, stage = %Stage::Aggregating, "stage started");
        let aggregation = aggregate(&samples, self.pipeline.bucket_width);
        let input_stats = summarize_by_metric(&samples);
        result.buckets_processed = aggregation.buckets;

        debug!(partition = %date, stage = %Stage::Normalizing, "stage started");
        let rows = normalize(&aggregation.stats);

        debug!(partition = %date, stage = %Stage::Resolving, "stage started");
        let resolution = resolve(&rows, registry);
        result.unresolved_signals = resolution.unresolved;

        if !result.unresolved_signals.is_empty() {
            warn!(
                partition = %date,
                unresolved = ?result.unresolved_signals,
                "dropping rows for unregistered signals"
            );
        }

        if resolution.records.is_empty() {
            warn!(partition = %date, rows = rows.len(), "no rows resolved to a registered signal");
            return Ok(PartitionStatus::NoValidData);
        }

        debug!(partition = %date, stage = %Stage::Loading, "stage started");
        if self.skip_loaded {
            let existing = self
                .store
                .count_rows(window)
                .await
                .map_err(at(Stage::Loading))?;

            if existing > 0 {
                warn!(partition = %date, existing, "partition already loaded, skipping insert");
                result.preexisting_rows = Some(existing);
                return Ok(PartitionStatus::Success { input_stats });
            }
        }

        let loader =
            Loader::new(&self.store, self.pipeline.batch_size).with_health(self.health.clone());

        match loader.load(&resolution.records).await {
            Ok(inserted) => {
                result.records_inserted = inserted;
                Ok(PartitionStatus::Success { input_stats })
            }
            Err(e) => {
                result.records_inserted = e.committed;
                Err(StageFailure {
                    stage: Stage::Loading,
                    source: e.into(),
                })
            }
        }
    }

    fn record(&self, result: &PartitionResult, seconds: f64) {
        let Some(health) = &self.health else {
            return;
        };

        health
            .partitions_total
            .with_label_values(&[result.status_str()])
            .inc();
        health
            .records_extracted
            .inc_by(result.records_extracted as f64);
        health.records_inserted.inc_by(result.records_inserted as f64);
        health
            .unresolved_signals
            .inc_by(result.unresolved_signals.len() as f64);
        health.partition_duration.observe(seconds);

        if matches!(result.status, PartitionStatus::Success { .. }) {
            let start = TimeWindow::for_date(result.partition_date).start;
            health.last_success_partition.set(start.timestamp() as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::Signal;
    use crate::source::RawSample;
    use crate::store::LoadRecord;
    use anyhow::bail;
    use chrono::{DateTime, TimeDelta, Utc};
    use parking_lot::Mutex;

    struct FakeSource {
        samples: Vec<RawSample>,
        fail: bool,
    }

    impl SourceReader for FakeSource {
        async fn fetch(&self, window: TimeWindow, metrics: &[Metric]) -> Result<Vec<RawSample>> {
            if self.fail {
                bail!("operation timed out");
            }
            Ok(self
                .samples
                .iter()
                .filter(|s| window.contains(s.timestamp) && metrics.contains(&s.metric))
                .copied()
                .collect())
        }
    }

    #[derive(Default)]
    struct FakeStore {
        registry: Vec<(&'static str, u32)>,
        rows: Mutex<Vec<LoadRecord>>,
        fail_on_batch: Option<usize>,
        batches: Mutex<usize>,
    }

    impl TargetStore for FakeStore {
        async fn fetch_registry(&self) -> Result<SignalRegistry> {
            Ok(SignalRegistry::from_pairs(self.registry.iter().copied()))
        }

        async fn insert_batch(&self, batch: &[LoadRecord]) -> Result<()> {
            let mut batches = self.batches.lock();
            if self.fail_on_batch == Some(*batches) {
                bail!("table data is read-only");
            }
            *batches += 1;
            self.rows.lock().extend_from_slice(batch);
            Ok(())
        }

        async fn count_rows(&self, window: TimeWindow) -> Result<u64> {
            Ok(self
                .rows
                .lock()
                .iter()
                .filter(|r| window.contains(r.timestamp))
                .count() as u64)
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 8, 10).unwrap()
    }

    fn midnight() -> DateTime<Utc> {
        TimeWindow::for_date(date()).start
    }

    /// One sample per minute for `minutes` minutes, for wind speed and power.
    fn samples(minutes: i64) -> Vec<RawSample> {
        (0..minutes)
            .flat_map(|m| {
                let t = midnight() + TimeDelta::minutes(m);
                [
                    RawSample::new(t, Metric::WindSpeed, 5.0 + (m % 10) as f64),
                    RawSample::new(t, Metric::Power, 100.0 + m as f64),
                ]
            })
            .collect()
    }

    fn full_registry() -> Vec<(&'static str, u32)> {
        Signal::all_for(&[Metric::WindSpeed, Metric::Power])
            .into_iter()
            .enumerate()
            .map(|(i, s)| (s.name(), i as u32 + 1))
            .collect()
    }

    fn runner(source: FakeSource, store: FakeStore) -> PartitionRunner<FakeSource, FakeStore> {
        PartitionRunner::new(source, store, PipelineConfig::default())
    }

    #[tokio::test]
    async fn test_success_loads_all_signals() {
        let runner = runner(
            FakeSource {
                samples: samples(60),
                fail: false,
            },
            FakeStore {
                registry: full_registry(),
                ..Default::default()
            },
        );
        let registry = runner.load_registry().await.expect("registry should load");

        let result = runner.run_partition(date(), &registry).await;
        assert_eq!(result.status_str(), "success");
        assert_eq!(result.records_extracted, 120);
        assert_eq!(result.buckets_processed, 6);
        // 6 buckets × 2 metrics × 4 stats.
        assert_eq!(result.records_inserted, 48);
        assert_eq!(runner.store().rows.lock().len(), 48);
        assert!(result.unresolved_signals.is_empty());
        assert!(result.is_ok());

        let PartitionStatus::Success { input_stats } = &result.status else {
            panic!("expected success");
        };
        assert_eq!(input_stats[&Metric::WindSpeed].count, 60);
        assert_eq!(input_stats[&Metric::WindSpeed].min, 5.0);
        assert_eq!(input_stats[&Metric::Power].max, 159.0);
    }

    #[tokio::test]
    async fn test_empty_source_is_no_data() {
        let runner = runner(
            FakeSource {
                samples: Vec::new(),
                fail: false,
            },
            FakeStore {
                registry: full_registry(),
                ..Default::default()
            },
        );
        let registry = runner.load_registry().await.expect("registry should load");

        let result = runner.run_partition(date(), &registry).await;
        assert_eq!(result.status, PartitionStatus::NoData);
        assert_eq!(result.records_inserted, 0);
        assert!(result.is_ok());
        assert_eq!(*runner.store().batches.lock(), 0);
    }

    #[tokio::test]
    async fn test_unregistered_signals_are_no_valid_data() {
        let runner = runner(
            FakeSource {
                samples: samples(10),
                fail: false,
            },
            FakeStore {
                registry: vec![("rotor_rpm_mean", 1)],
                ..Default::default()
            },
        );
        let registry = runner.load_registry().await.expect("registry should load");

        let result = runner.run_partition(date(), &registry).await;
        assert_eq!(result.status, PartitionStatus::NoValidData);
        assert_eq!(result.records_extracted, 20);
        assert_eq!(result.records_inserted, 0);
        assert_eq!(result.unresolved_signals.len(), 8);
        assert!(!result.is_ok());
        assert!(!result.is_error());
    }

    #[tokio::test]
    async fn test_partial_registry_loads_resolved_rows() {
        let runner = runner(
            FakeSource {
                samples: samples(10),
                fail: false,
            },
            FakeStore {
                registry: vec![("power_mean", 5), ("power_max", 7)],
                ..Default::default()
            },
        );
        let registry = runner.load_registry().await.expect("registry should load");

        let result = runner.run_partition(date(), &registry).await;
        assert_eq!(result.status_str(), "success");
        assert_eq!(result.records_inserted, 2);
        assert_eq!(result.unresolved_signals.len(), 6);
    }

    #[tokio::test]
    async fn test_source_failure_is_extracting_error() {
        let runner = runner(
            FakeSource {
                samples: Vec::new(),
                fail: true,
            },
            FakeStore::default(),
        );

        let result = runner
            .run_partition(date(), &SignalRegistry::default())
            .await;
        assert!(result.is_error());
        assert!(matches!(
            result.status,
            PartitionStatus::Error {
                stage: Stage::Extracting,
                ..
            }
        ));
        assert!(result
            .error_detail()
            .is_some_and(|d| d.contains("timed out")));
    }

    #[tokio::test]
    async fn test_load_failure_reports_committed_rows() {
        let mut pipeline = PipelineConfig::default();
        pipeline.batch_size = 10;
        let health = Arc::new(HealthMetrics::new(":0").expect("metrics should register"));
        let runner = PartitionRunner::new(
            FakeSource {
                samples: samples(60),
                fail: false,
            },
            FakeStore {
                registry: full_registry(),
                fail_on_batch: Some(2),
                ..Default::default()
            },
            pipeline,
        )
        .with_health(Some(Arc::clone(&health)));
        let registry = runner.load_registry().await.expect("registry should load");

        let result = runner.run_partition(date(), &registry).await;
        assert!(matches!(
            result.status,
            PartitionStatus::Error {
                stage: Stage::Loading,
                ..
            }
        ));
        assert_eq!(result.records_inserted, 20);
        assert_eq!(
            health.partitions_total.with_label_values(&["error"]).get() as u64,
            1
        );
        assert_eq!(health.load_batch_errors.get() as u64, 1);
    }

    #[tokio::test]
    async fn test_skip_loaded_partition() {
        let runner = runner(
            FakeSource {
                samples: samples(30),
                fail: false,
            },
            FakeStore {
                registry: full_registry(),
                ..Default::default()
            },
        )
        .with_skip_loaded(true);
        let registry = runner.load_registry().await.expect("registry should load");

        let first = runner.run_partition(date(), &registry).await;
        assert_eq!(first.records_inserted, 24);
        assert_eq!(first.preexisting_rows, None);

        let second = runner.run_partition(date(), &registry).await;
        assert_eq!(second.status_str(), "success");
        assert_eq!(second.records_inserted, 0);
        assert_eq!(second.preexisting_rows, Some(24));
        assert_eq!(runner.store().rows.lock().len(), 24);
    }

    #[tokio::test]
    async fn test_append_only_without_skip() {
        let runner = runner(
            FakeSource {
                samples: samples(30),
                fail: false,
            },
            FakeStore {
                registry: full_registry(),
                ..Default::default()
            },
        );
        let registry = runner.load_registry().await.expect("registry should load");

        runner.run_partition(date(), &registry).await;
        runner.run_partition(date(), &registry).await;
        assert_eq!(runner.store().rows.lock().len(), 48);
    }

    #[test]
    fn test_result_serializes_with_status_tag() {
        let result = PartitionResult::failed(
            date(),
            Stage::Resolving,
            &anyhow::anyhow!("connection refused"),
        );
        let json = serde_json::to_value(&result).expect("should serialize");

        assert_eq!(json["partition_date"], "2025-08-10");
        assert_eq!(json["status"], "error");
        assert_eq!(json["stage"], "resolving");
        assert_eq!(json["detail"], "connection refused");
        assert_eq!(json["records_inserted"], 0);
        assert!(json.get("preexisting_rows").is_none());
    }

    #[test]
    fn test_connect_failure_is_not_attributed_to_extraction() {
        let err = anyhow::anyhow!("connection refused").context("opening ClickHouse connection");
        let result = PartitionResult::failed(date(), Stage::Connecting, &err);
        let json = serde_json::to_value(&result).expect("should serialize");

        assert!(result.is_error());
        assert_eq!(json["stage"], "connecting");
        assert_eq!(
            json["detail"],
            "opening ClickHouse connection: connection refused"
        );
        assert_eq!(json["records_extracted"], 0);
    }
}
