//! In-process partition triggers.
//!
//! Two triggers feed a single serial loop: a daily trigger that processes the
//! previous UTC day at a fixed time, and a backfill trigger that periodically
//! walks a configured date range. Shutdown is observed between partitions
//! only; a partition in flight always runs to completion.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, TimeDelta, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{parse_time_of_day, ScheduleConfig};
use crate::partition::{PartitionResult, PartitionRunner, PartitionStatus, Stage};
use crate::source::SourceReader;
use crate::store::TargetStore;

/// Returns the first instant strictly after `now` at time-of-day `at` (UTC).
pub fn next_daily_run(now: DateTime<Utc>, at: NaiveTime) -> DateTime<Utc> {
    let today = now.date_naive().and_time(at).and_utc();
    if today > now {
        today
    } else {
        today + TimeDelta::days(1)
    }
}

/// The partition the daily trigger processes when it fires at `now`.
pub fn previous_day(now: DateTime<Utc>) -> NaiveDate {
    now.date_naive() - TimeDelta::days(1)
}

/// Every date in `[start, end]`, ascending. Empty when `start > end`.
pub fn date_range(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    start.iter_days().take_while(|d| *d <= end).collect()
}

/// Runs `dates` serially against one freshly loaded registry snapshot.
///
/// Dates in `completed` are skipped, and successful dates are added to it.
/// Stops early, without starting another partition, once `cancel` fires.
pub async fn run_dates<S, T>(
    runner: &PartitionRunner<S, T>,
    dates: &[NaiveDate],
    completed: &mut HashSet<NaiveDate>,
    cancel: &CancellationToken,
) -> Vec<PartitionResult>
where
    S: SourceReader,
    T: TargetStore,
{
    let pending: Vec<NaiveDate> = dates
        .iter()
        .copied()
        .filter(|d| !completed.contains(d))
        .collect();

    if pending.is_empty() {
        return Vec::new();
    }

    let registry = match runner.load_registry().await {
        Ok(registry) => registry,
        Err(e) => {
            error!(error = %format!("{e:#}"), partitions = pending.len(), "registry load failed");
            return pending
                .into_iter()
                .map(|d| PartitionResult::failed(d, Stage::Resolving, &e))
                .collect();
        }
    };

    let mut results = Vec::with_capacity(pending.len());
    for date in pending {
        if cancel.is_cancelled() {
            info!(next = %date, "shutdown requested, stopping before next partition");
            break;
        }

        let result = runner.run_partition(date, &registry).await;
        if matches!(result.status, PartitionStatus::Success { .. }) {
            completed.insert(date);
        }
        results.push(result);
    }

    results
}

/// Drives the daily and backfill triggers until cancelled.
pub struct Scheduler<S, T> {
    runner: PartitionRunner<S, T>,
    cfg: ScheduleConfig,
    completed: HashSet<NaiveDate>,
    cancel: CancellationToken,
}

impl<S: SourceReader, T: TargetStore> Scheduler<S, T> {
    pub fn new(
        runner: PartitionRunner<S, T>,
        cfg: ScheduleConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            runner,
            cfg,
            completed: HashSet::new(),
            cancel,
        }
    }

    /// Runs until the cancellation token fires.
    pub async fn run(&mut self) -> Result<()> {
        let daily_at = if self.cfg.daily.enabled {
            Some(parse_time_of_day(&self.cfg.daily.at)?)
        } else {
            None
        };
        let backfill_enabled = self.cfg.backfill.enabled;

        if daily_at.is_none() && !backfill_enabled {
            bail!("no schedule trigger is enabled");
        }

        let backfill_every = if backfill_enabled {
            self.cfg.backfill.interval
        } else {
            Duration::from_secs(3600)
        };
        let mut backfill_ticker = tokio::time::interval(backfill_every);
        backfill_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut next_daily = daily_at.map(|at| next_daily_run(Utc::now(), at));
        let cancel = self.cancel.clone();

        info!(
            daily = ?next_daily,
            backfill = backfill_enabled,
            backfill_interval = ?backfill_every,
            "scheduler started"
        );

        loop {
            let until_daily = next_daily
                .map(|t| (t - Utc::now()).to_std().unwrap_or(Duration::ZERO))
                .unwrap_or(Duration::from_secs(86_400));

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(until_daily), if next_daily.is_some() => {
                    let date = previous_day(Utc::now());
                    info!(partition = %date, "daily trigger fired");
                    self.run_trigger(&[date]).await;
                    next_daily = daily_at.map(|at| next_daily_run(Utc::now(), at));
                }
                _ = backfill_ticker.tick(), if backfill_enabled => {
                    let dates = self.backfill_dates();
                    info!(partitions = dates.len(), "backfill trigger fired");
                    self.run_trigger(&dates).await;
                }
            }
        }

        info!(completed = self.completed.len(), "scheduler stopped");

        Ok(())
    }

    fn backfill_dates(&self) -> Vec<NaiveDate> {
        match (self.cfg.backfill.start_date, self.cfg.backfill.end_date) {
            (Some(start), Some(end)) => date_range(start, end),
            _ => Vec::new(),
        }
    }

    async fn run_trigger(&mut self, dates: &[NaiveDate]) {
        let results = run_dates(&self.runner, dates, &mut self.completed, &self.cancel).await;

        let failed = results.iter().filter(|r| r.is_error()).count();
        if failed > 0 {
            warn!(failed, ran = results.len(), "trigger finished with failed partitions");
        }
    }
}
