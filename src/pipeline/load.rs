use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::debug;

use crate::health::HealthMetrics;
use crate::store::{LoadRecord, TargetStore};

/// A batch failed to insert. Batches before it stay committed.
#[derive(Error, Debug)]
#[error("inserting batch {batch} ({committed} rows already committed)")]
pub struct LoadError {
    /// Rows committed before the failing batch.
    pub committed: usize,
    /// Zero-based index of the failing batch.
    pub batch: usize,
    pub source: anyhow::Error,
}

/// Writes fact rows to a target store in bounded batches.
pub struct Loader<'a, T> {
    store: &'a T,
    batch_size: usize,
    health: Option<Arc<HealthMetrics>>,
}

impl<'a, T: TargetStore> Loader<'a, T> {
    /// Creates a loader. A zero `batch_size` is treated as 1.
    pub fn new(store: &'a T, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            health: None,
        }
    }

    pub fn with_health(mut self, health: Option<Arc<HealthMetrics>>) -> Self {
        self.health = health;
        self
    }

    /// Appends `records` in order and returns the number of rows written.
    ///
    /// The first failing batch aborts the rest.
    pub async fn load(&self, records: &[LoadRecord]) -> Result<usize, LoadError> {
        let mut committed = 0usize;

        for (batch, chunk) in records.chunks(self.batch_size).enumerate() {
            let started = Instant::now();
            let result = self.store.insert_batch(chunk).await;

            if let Some(health) = &self.health {
                health
                    .load_batch_duration
                    .observe(started.elapsed().as_secs_f64());
                health.load_batch_size.observe(chunk.len() as f64);
            }

            if let Err(source) = result {
                if let Some(health) = &self.health {
                    health.load_batch_errors.inc();
                }

                return Err(LoadError {
                    committed,
                    batch,
                    source,
                });
            }

            committed += chunk.len();
            debug!(batch, rows = chunk.len(), committed, "batch committed");
        }

        Ok(committed)
    }
}
