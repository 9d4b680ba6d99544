use std::collections::HashSet;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use sensor_etl::config::Config;
use sensor_etl::health::HealthMetrics;
use sensor_etl::migrate::{ClickHouseMigrator, Migrator};
use sensor_etl::partition::{PartitionResult, PartitionRunner, PartitionStatus, Stage};
use sensor_etl::schedule::{date_range, run_dates, Scheduler};
use sensor_etl::signal::Signal;
use sensor_etl::source::HttpSourceReader;
use sensor_etl::store::clickhouse::ClickHouseStore;

/// Partitioned sensor data aggregation and load pipeline.
#[derive(Parser)]
#[command(name = "sensor-etl", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Overrides `log_level` from the configuration file.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Process a single partition and exit.
    Run {
        /// Partition date, YYYY-MM-DD (UTC).
        #[arg(long, value_parser = parse_date_arg)]
        date: NaiveDate,

        #[command(flatten)]
        overrides: EndpointOverrides,

        /// Print the result as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Process every partition in an inclusive date range, serially.
    Backfill {
        /// First partition date, YYYY-MM-DD.
        #[arg(long, value_parser = parse_date_arg)]
        start: NaiveDate,

        /// Last partition date, YYYY-MM-DD.
        #[arg(long, value_parser = parse_date_arg)]
        end: NaiveDate,

        #[command(flatten)]
        overrides: EndpointOverrides,

        /// Print results as JSON lines.
        #[arg(long)]
        json: bool,
    },
    /// Run the daily and backfill triggers until interrupted.
    Schedule,
    /// Apply schema migrations and seed the signal registry.
    Prepare,
    /// Print a JSON summary of the stored fact rows.
    Summary,
    /// Manage schema migrations.
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },
    /// Print version information and exit.
    Version,
}

#[derive(Subcommand)]
enum MigrateAction {
    /// Apply all pending migrations.
    Up,
    /// Roll back the last applied migration.
    Down,
    /// Show the applied schema version.
    Status,
}

#[derive(clap::Args)]
struct EndpointOverrides {
    /// Override source.endpoint.
    #[arg(long)]
    source_url: Option<String>,

    /// Override target.endpoint.
    #[arg(long)]
    target_endpoint: Option<String>,
}

impl EndpointOverrides {
    fn apply(&self, cfg: &mut Config) {
        if let Some(url) = &self.source_url {
            cfg.source.endpoint = url.clone();
        }
        if let Some(endpoint) = &self.target_endpoint {
            cfg.target.endpoint = endpoint.clone();
        }
    }
}

/// Rejected `YYYY-MM-DD` argument.
#[derive(Error, Debug, PartialEq, Eq)]
enum DateArgError {
    #[error("expected a date as YYYY-MM-DD, got {0:?}")]
    Malformed(String),

    #[error("{0:?} is not a valid calendar date")]
    Invalid(String),
}

fn parse_date_arg(s: &str) -> Result<NaiveDate, DateArgError> {
    let shape_ok = s.len() == 10
        && s.bytes()
            .enumerate()
            .all(|(i, b)| if i == 4 || i == 7 { b == b'-' } else { b.is_ascii_digit() });

    if !shape_ok {
        return Err(DateArgError::Malformed(s.to_string()));
    }

    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| DateArgError::Invalid(s.to_string()))
}

/// Build-time version info, injected via RUSTFLAGS.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    if let Command::Version = &cli.command {
        println!("sensor-etl {}", version::full());
        return Ok(ExitCode::SUCCESS);
    }

    let mut cfg = match &cli.config {
        Some(path) => Config::read(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    let log_level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("invalid log level: {log_level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    match &cli.command {
        Command::Run { overrides, .. } | Command::Backfill { overrides, .. } => {
            overrides.apply(&mut cfg);
        }
        _ => {}
    }

    cfg.validate().context("invalid configuration")?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting sensor-etl",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { dispatch(cli.command, cfg).await })
}

async fn dispatch(command: Command, cfg: Config) -> Result<ExitCode> {
    match command {
        Command::Run { date, json, .. } => run_one(cfg, date, json).await,
        Command::Backfill {
            start, end, json, ..
        } => backfill(cfg, start, end, json).await,
        Command::Schedule => schedule(cfg).await.map(|()| ExitCode::SUCCESS),
        Command::Prepare => prepare(cfg).await.map(|()| ExitCode::SUCCESS),
        Command::Summary => summary(cfg).await.map(|()| ExitCode::SUCCESS),
        Command::Migrate { action } => migrate(cfg, action).await.map(|()| ExitCode::SUCCESS),
        Command::Version => Ok(ExitCode::SUCCESS),
    }
}

async fn build_runner(
    cfg: &Config,
    health: Option<Arc<HealthMetrics>>,
) -> Result<PartitionRunner<HttpSourceReader, ClickHouseStore>> {
    let mut source = HttpSourceReader::new(&cfg.source)?;
    if let Some(h) = &health {
        let h = Arc::clone(h);
        source = source.with_metrics(Box::new(move |outcome, elapsed| {
            h.source_request_duration
                .with_label_values(&[outcome])
                .observe(elapsed.as_secs_f64());
        }));
    }

    let store = ClickHouseStore::connect(&cfg.target, health.clone()).await?;

    Ok(PartitionRunner::new(source, store, cfg.pipeline.clone())
        .with_skip_loaded(cfg.target.skip_loaded_partitions)
        .with_health(health))
}

async fn run_one(cfg: Config, date: NaiveDate, json: bool) -> Result<ExitCode> {
    let result = match build_runner(&cfg, None).await {
        Ok(runner) => match runner.load_registry().await {
            Ok(registry) => runner.run_partition(date, &registry).await,
            Err(e) => PartitionResult::failed(date, Stage::Resolving, &e),
        },
        Err(e) => PartitionResult::failed(date, Stage::Connecting, &e),
    };

    print_result(&result, json)?;

    Ok(if result.is_ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn backfill(cfg: Config, start: NaiveDate, end: NaiveDate, json: bool) -> Result<ExitCode> {
    if start > end {
        bail!("--start {start} is after --end {end}");
    }

    let runner = build_runner(&cfg, None).await?;
    let dates = date_range(start, end);
    let cancel = shutdown_token();

    let results = run_dates(&runner, &dates, &mut HashSet::new(), &cancel).await;
    for result in &results {
        print_result(result, json)?;
    }

    let failed = results.iter().filter(|r| r.is_error()).count();
    tracing::info!(
        partitions = dates.len(),
        ran = results.len(),
        failed,
        "backfill finished"
    );

    Ok(if failed == 0 && results.len() == dates.len() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn schedule(cfg: Config) -> Result<()> {
    let health = Arc::new(HealthMetrics::new(&cfg.health.addr)?);
    health.start().await?;

    let runner = build_runner(&cfg, Some(Arc::clone(&health))).await?;

    if cfg.target.migrations.enabled {
        ClickHouseMigrator::new(runner.store().pool().clone())
            .up()
            .await
            .context("running migrations")?;
    }

    let cancel = shutdown_token();
    let mut scheduler = Scheduler::new(runner, cfg.schedule.clone(), cancel);
    let result = scheduler.run().await;

    health.stop().await?;
    tracing::info!("sensor-etl stopped");

    result
}

async fn prepare(cfg: Config) -> Result<()> {
    let store = ClickHouseStore::connect(&cfg.target, None).await?;

    let applied = ClickHouseMigrator::new(store.pool().clone())
        .up()
        .await
        .context("running migrations")?;

    let signals = Signal::all_for(&cfg.pipeline.metrics);
    let report = store
        .seed_signals(&signals, cfg.pipeline.bucket_minutes())
        .await
        .context("seeding signal registry")?;

    println!("migrations applied: {applied}");
    println!(
        "signals added: {}, already present: {}",
        report.added.len(),
        report.existing
    );
    println!();
    println!("{:>4}  {:<28} description", "id", "name");
    for row in store.list_signals().await? {
        println!("{:>4}  {:<28} {}", row.id, row.name, row.description);
    }

    let counts = store.table_counts().await?;
    println!();
    println!("signal rows: {}", counts.signals);
    println!("data rows:   {}", counts.facts);

    Ok(())
}

async fn summary(cfg: Config) -> Result<()> {
    let store = ClickHouseStore::connect(&cfg.target, None).await?;
    let summary = store.summary().await?;

    println!(
        "{}",
        serde_json::to_string_pretty(&summary).context("encoding summary")?
    );

    Ok(())
}

async fn migrate(cfg: Config, action: MigrateAction) -> Result<()> {
    let store = ClickHouseStore::connect(&cfg.target, None).await?;
    let migrator = ClickHouseMigrator::new(store.pool().clone());

    match action {
        MigrateAction::Up => {
            let applied = migrator.up().await?;
            println!("migrations applied: {applied}");
        }
        MigrateAction::Down => migrator.down().await?,
        MigrateAction::Status => {
            let status = migrator.status().await?;
            let state = if status.is_current() {
                "up to date"
            } else if status.dirty {
                "dirty"
            } else {
                "pending"
            };
            println!(
                "version: {} (latest {}), {state}",
                status.version, status.latest
            );
        }
    }

    Ok(())
}

/// Returns a token cancelled on SIGINT or SIGTERM.
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    tracing::warn!(error = %e, "registering SIGTERM handler");
                    let _ = ctrl_c.await;
                    tracing::info!("received SIGINT, shutting down");
                    token.cancel();
                    return;
                }
            };

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        token.cancel();
    });

    cancel
}

fn print_result(result: &PartitionResult, json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string(result).context("encoding partition result")?
        );
        return Ok(());
    }

    println!("partition {}: {}", result.partition_date, result.status_str());
    println!("  records extracted: {}", result.records_extracted);
    println!("  buckets processed: {}", result.buckets_processed);
    println!("  records inserted:  {}", result.records_inserted);

    if let Some(existing) = result.preexisting_rows {
        println!("  load skipped, {existing} rows already present");
    }

    if !result.unresolved_signals.is_empty() {
        println!(
            "  unresolved signals: {}",
            result.unresolved_signals.join(", ")
        );
    }

    match &result.status {
        PartitionStatus::Success { input_stats } => {
            for (metric, s) in input_stats {
                let stddev = s
                    .stddev
                    .map_or_else(|| "n/a".to_string(), |v| format!("{v:.4}"));
                println!(
                    "  {metric}: n={} mean={:.4} min={:.4} max={:.4} stddev={stddev}",
                    s.count, s.mean, s.min, s.max
                );
            }
        }
        PartitionStatus::Error { stage, detail } => {
            println!("  failed while {stage}: {detail}");
        }
        PartitionStatus::NoData | PartitionStatus::NoValidData => {}
    }

    println!("  duration: {}ms", result.duration_ms);

    Ok(())
}
