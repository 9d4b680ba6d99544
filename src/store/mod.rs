pub mod clickhouse;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::signal::SignalRegistry;
use crate::source::TimeWindow;

/// A resolved fact row, the only shape written to the target fact table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadRecord {
    pub timestamp: DateTime<Utc>,
    pub signal_id: u32,
    pub value: f64,
}

/// Target store consumed by the partition pipeline.
pub trait TargetStore: Send + Sync {
    /// Reads the full signal name → id registry.
    fn fetch_registry(&self) -> impl std::future::Future<Output = Result<SignalRegistry>> + Send;

    /// Appends one batch of fact rows. Either the whole batch is committed or
    /// an error is returned.
    fn insert_batch(
        &self,
        batch: &[LoadRecord],
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Counts fact rows whose timestamp falls in `window`.
    fn count_rows(
        &self,
        window: TimeWindow,
    ) -> impl std::future::Future<Output = Result<u64>> + Send;
}
