use std::fmt::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clickhouse_rs::Pool;
use serde::Serialize;

use crate::config::TargetConfig;
use crate::health::HealthMetrics;
use crate::signal::{Signal, SignalRegistry};
use crate::source::TimeWindow;

use super::{LoadRecord, TargetStore};

/// A row of the `signal` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignalRow {
    pub id: u32,
    pub name: String,
    pub description: String,
}

/// Outcome of seeding the signal table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeedReport {
    /// Newly inserted rows, in insertion order.
    pub added: Vec<SignalRow>,
    /// Number of requested names that were already registered.
    pub existing: usize,
}

/// Row counts of the two pipeline tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TableCounts {
    pub signals: u64,
    pub facts: u64,
}

/// Per-signal aggregate over all stored fact rows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalSummary {
    pub name: String,
    pub count: u64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
}

/// Fact rows stored for one calendar day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyCount {
    pub date: String,
    pub count: u64,
}

/// Overview of the fact table.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreSummary {
    pub total_rows: u64,
    /// Earliest stored timestamp; `None` when the table is empty.
    pub first_timestamp: Option<String>,
    pub last_timestamp: Option<String>,
    pub signals: Vec<SignalSummary>,
    pub daily: Vec<DailyCount>,
}

/// Target store backed by ClickHouse over the native protocol.
///
/// Expects the `signal` and `data` tables created by the embedded migrations.
pub struct ClickHouseStore {
    pool: Pool,
    health: Option<Arc<HealthMetrics>>,
}

impl ClickHouseStore {
    /// Opens the connection pool and verifies connectivity with a ping.
    pub async fn connect(cfg: &TargetConfig, health: Option<Arc<HealthMetrics>>) -> Result<Self> {
        let pool = Pool::new(cfg.dsn());

        let mut handle = pool
            .get_handle()
            .await
            .context("opening ClickHouse connection")?;

        handle.ping().await.context("pinging ClickHouse")?;

        tracing::info!(
            endpoint = %cfg.endpoint,
            database = %cfg.database,
            "ClickHouse store connected"
        );

        if let Some(h) = &health {
            h.clickhouse_connected.set(1.0);
        }

        Ok(Self { pool, health })
    }

    /// Returns the connection pool, shared with the migrator.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Lists every registered signal ordered by id.
    pub async fn list_signals(&self) -> Result<Vec<SignalRow>> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for signal query")?;

        let block = handle
            .query("SELECT id, name, description FROM signal ORDER BY id")
            .fetch_all()
            .await
            .context("querying signal table")?;

        let mut rows = Vec::with_capacity(block.row_count());
        for row in block.rows() {
            rows.push(SignalRow {
                id: row.get("id").context("reading signal id")?,
                name: row.get("name").context("reading signal name")?,
                description: row
                    .get("description")
                    .context("reading signal description")?,
            });
        }

        Ok(rows)
    }

    /// Registers every signal in `signals` whose name is not present yet.
    ///
    /// New ids continue from the current maximum. This is a provisioning
    /// step; partition runs never call it.
    pub async fn seed_signals(&self, signals: &[Signal], bucket_minutes: u64) -> Result<SeedReport> {
        let existing = self.list_signals().await?;
        let report = plan_seed(&existing, signals, bucket_minutes);

        if report.added.is_empty() {
            tracing::info!(existing = report.existing, "signal registry already seeded");
            return Ok(report);
        }

        let sql = insert_signals_sql(&report.added);
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for signal insert")?;

        handle
            .execute(sql.as_str())
            .await
            .context("inserting signal rows")?;

        tracing::info!(
            added = report.added.len(),
            existing = report.existing,
            "signal registry seeded"
        );

        Ok(report)
    }

    /// Returns the row counts of the signal and fact tables.
    pub async fn table_counts(&self) -> Result<TableCounts> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for table counts")?;

        let block = handle
            .query(
                "SELECT (SELECT count() FROM signal) AS signals, \
                 (SELECT count() FROM data) AS facts",
            )
            .fetch_all()
            .await
            .context("querying table counts")?;

        match block.rows().next() {
            Some(row) => Ok(TableCounts {
                signals: row.get("signals").context("reading signal count")?,
                facts: row.get("facts").context("reading fact count")?,
            }),
            None => Ok(TableCounts::default()),
        }
    }

    /// Summarizes the fact table: totals, time range, per-signal and per-day.
    pub async fn summary(&self) -> Result<StoreSummary> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for summary")?;

        let totals = handle
            .query(
                "SELECT count() AS total, toString(min(timestamp)) AS first, \
                 toString(max(timestamp)) AS last FROM data",
            )
            .fetch_all()
            .await
            .context("querying fact totals")?;

        let mut summary = StoreSummary::default();
        if let Some(row) = totals.rows().next() {
            summary.total_rows = row.get("total").context("reading total")?;
            if summary.total_rows > 0 {
                summary.first_timestamp = Some(row.get("first").context("reading first")?);
                summary.last_timestamp = Some(row.get("last").context("reading last")?);
            }
        }

        if summary.total_rows == 0 {
            return Ok(summary);
        }

        let per_signal = handle
            .query(
                "SELECT s.name AS name, count() AS n, avg(d.value) AS avg, \
                 min(d.value) AS min, max(d.value) AS max \
                 FROM data AS d INNER JOIN signal AS s ON d.signal_id = s.id \
                 GROUP BY s.name ORDER BY s.name",
            )
            .fetch_all()
            .await
            .context("querying per-signal summary")?;

        for row in per_signal.rows() {
            summary.signals.push(SignalSummary {
                name: row.get("name").context("reading signal name")?,
                count: row.get("n").context("reading count")?,
                avg: row.get("avg").context("reading avg")?,
                min: row.get("min").context("reading min")?,
                max: row.get("max").context("reading max")?,
            });
        }

        let daily = handle
            .query(
                "SELECT toString(toDate(timestamp)) AS day, count() AS n \
                 FROM data GROUP BY day ORDER BY day",
            )
            .fetch_all()
            .await
            .context("querying daily distribution")?;

        for row in daily.rows() {
            summary.daily.push(DailyCount {
                date: row.get("day").context("reading day")?,
                count: row.get("n").context("reading count")?,
            });
        }

        Ok(summary)
    }

    fn record_connected(&self, ok: bool) {
        if let Some(h) = &self.health {
            h.clickhouse_connected.set(if ok { 1.0 } else { 0.0 });
        }
    }
}

impl TargetStore for ClickHouseStore {
    async fn fetch_registry(&self) -> Result<SignalRegistry> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for registry query")?;

        let block = handle
            .query("SELECT id, name FROM signal")
            .fetch_all()
            .await
            .context("querying signal registry")?;

        let mut pairs = Vec::with_capacity(block.row_count());
        for row in block.rows() {
            let id: u32 = row.get("id").context("reading signal id")?;
            let name: String = row.get("name").context("reading signal name")?;
            pairs.push((name, id));
        }

        Ok(SignalRegistry::from_pairs(pairs))
    }

    async fn insert_batch(&self, batch: &[LoadRecord]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let sql = insert_facts_sql(batch);

        let mut handle = match self.pool.get_handle().await {
            Ok(handle) => handle,
            Err(e) => {
                self.record_connected(false);
                return Err(e).context("getting handle for fact insert");
            }
        };

        if let Err(e) = handle.execute(sql.as_str()).await {
            self.record_connected(false);
            return Err(e).context("sending fact batch");
        }

        self.record_connected(true);

        Ok(())
    }

    async fn count_rows(&self, window: TimeWindow) -> Result<u64> {
        let sql = count_rows_sql(window);

        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for row count")?;

        let block = handle
            .query(sql.as_str())
            .fetch_all()
            .await
            .context("counting partition rows")?;

        match block.rows().next() {
            Some(row) => row.get("n").context("reading row count"),
            None => Ok(0),
        }
    }
}

/// Works out which signals still need registering and assigns their ids.
fn plan_seed(existing: &[SignalRow], signals: &[Signal], bucket_minutes: u64) -> SeedReport {
    let mut next_id = existing.iter().map(|r| r.id).max().unwrap_or(0) + 1;
    let mut report = SeedReport::default();

    for signal in signals {
        let name = signal.name();
        if existing.iter().any(|r| r.name == name) || report.added.iter().any(|r| r.name == name) {
            report.existing += 1;
            continue;
        }

        report.added.push(SignalRow {
            id: next_id,
            name: name.to_string(),
            description: signal.description(bucket_minutes),
        });
        next_id += 1;
    }

    report
}

fn insert_facts_sql(batch: &[LoadRecord]) -> String {
    let mut sql = String::with_capacity(64 + batch.len() * 48);
    sql.push_str("INSERT INTO data (timestamp, signal_id, value) VALUES ");

    for (idx, r) in batch.iter().enumerate() {
        if idx > 0 {
            sql.push_str(", ");
        }
        let _ = write!(
            sql,
            "({}, {}, {})",
            format_datetime(r.timestamp),
            r.signal_id,
            r.value
        );
    }

    sql
}

fn insert_signals_sql(rows: &[SignalRow]) -> String {
    let mut sql = String::with_capacity(64 + rows.len() * 96);
    sql.push_str("INSERT INTO signal (id, name, description) VALUES ");

    for (idx, r) in rows.iter().enumerate() {
        if idx > 0 {
            sql.push_str(", ");
        }
        let _ = write!(
            sql,
            "({}, '{}', '{}')",
            r.id,
            escape_sql(&r.name),
            escape_sql(&r.description)
        );
    }

    sql
}

fn count_rows_sql(window: TimeWindow) -> String {
    format!(
        "SELECT count() AS n FROM data WHERE timestamp >= {} AND timestamp < {}",
        format_datetime(window.start),
        format_datetime(window.end)
    )
}

/// Formats a timestamp as a quoted ClickHouse DateTime64(3) literal.
fn format_datetime(t: DateTime<Utc>) -> String {
    format!("'{}'", t.format("%Y-%m-%d %H:%M:%S%.3f"))
}

/// Escapes a string value for SQL insertion (single-quote escaping).
fn escape_sql(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}
