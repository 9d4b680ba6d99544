use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "sensor_etl";

/// Prometheus metrics for pipeline health.
///
/// All metrics use the "sensor_etl" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Completed partition runs by terminal status.
    pub partitions_total: CounterVec,
    /// Raw samples read from the source.
    pub records_extracted: Counter,
    /// Fact rows committed to the target store.
    pub records_inserted: Counter,
    /// Signal names dropped because the registry lacks them.
    pub unresolved_signals: Counter,
    /// Fact batches that failed to insert.
    pub load_batch_errors: Counter,
    /// Whether the last target store operation succeeded (1=yes, 0=no).
    pub clickhouse_connected: Gauge,
    /// Source request duration by outcome (success/error/timeout).
    pub source_request_duration: HistogramVec,
    /// Duration of a single fact batch insert.
    pub load_batch_duration: Histogram,
    /// Rows per fact batch.
    pub load_batch_size: Histogram,
    /// Wall time of one partition run.
    pub partition_duration: Histogram,
    /// Unix time (seconds) of the start of the last successfully loaded partition.
    pub last_success_partition: Gauge,
}

impl HealthMetrics {
    /// Creates and registers all metrics. `addr` is the listen address for
    /// [`HealthMetrics::start`]; `:port` binds every interface.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let partitions_total = CounterVec::new(
            Opts::new("partitions_total", "Partition runs by terminal status.")
                .namespace(NAMESPACE),
            &["status"],
        )?;
        let records_extracted = Counter::with_opts(
            Opts::new(
                "records_extracted_total",
                "Total raw samples read from the source.",
            )
            .namespace(NAMESPACE),
        )?;
        let records_inserted = Counter::with_opts(
            Opts::new(
                "records_inserted_total",
                "Total fact rows written to the target store.",
            )
            .namespace(NAMESPACE),
        )?;
        let unresolved_signals = Counter::with_opts(
            Opts::new(
                "unresolved_signals_total",
                "Total signal names dropped for lack of a registry entry.",
            )
            .namespace(NAMESPACE),
        )?;
        let load_batch_errors = Counter::with_opts(
            Opts::new(
                "load_batch_errors_total",
                "Total fact batches that failed to insert.",
            )
            .namespace(NAMESPACE),
        )?;
        let clickhouse_connected = Gauge::with_opts(
            Opts::new(
                "clickhouse_connected",
                "Whether the last ClickHouse operation succeeded.",
            )
            .namespace(NAMESPACE),
        )?;
        let source_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "source_request_duration_seconds",
                "Source API request duration by outcome.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0]),
            &["outcome"],
        )?;
        let load_batch_duration = Histogram::with_opts(
            HistogramOpts::new(
                "load_batch_duration_seconds",
                "Duration of a single fact batch insert.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        let load_batch_size = Histogram::with_opts(
            HistogramOpts::new("load_batch_size", "Number of rows per fact batch.")
                .namespace(NAMESPACE)
                .buckets(vec![1.0, 10.0, 100.0, 500.0, 1000.0, 5000.0, 10000.0]),
        )?;
        let partition_duration = Histogram::with_opts(
            HistogramOpts::new(
                "partition_duration_seconds",
                "Wall time of one partition run.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
        )?;
        let last_success_partition = Gauge::with_opts(
            Opts::new(
                "last_success_partition_timestamp_seconds",
                "Start of the last successfully loaded partition.",
            )
            .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(partitions_total.clone()))?;
        registry.register(Box::new(records_extracted.clone()))?;
        registry.register(Box::new(records_inserted.clone()))?;
        registry.register(Box::new(unresolved_signals.clone()))?;
        registry.register(Box::new(load_batch_errors.clone()))?;
        registry.register(Box::new(clickhouse_connected.clone()))?;
        registry.register(Box::new(source_request_duration.clone()))?;
        registry.register(Box::new(load_batch_duration.clone()))?;
        registry.register(Box::new(load_batch_size.clone()))?;
        registry.register(Box::new(partition_duration.clone()))?;
        registry.register(Box::new(last_success_partition.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            partitions_total,
            records_extracted,
            records_inserted,
            unresolved_signals,
            load_batch_errors,
            clickhouse_connected,
            source_request_duration,
            load_batch_duration,
            load_batch_size,
            partition_duration,
            last_success_partition,
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }

    /// Renders the registry in Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        encode_registry(&self.registry)
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;

    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_use_namespace() {
        let health = HealthMetrics::new(":0").expect("metrics should register");
        health.partitions_total.with_label_values(&["success"]).inc();
        health.records_inserted.inc_by(2500.0);
        health
            .source_request_duration
            .with_label_values(&["timeout"])
            .observe(30.0);

        let text = health.encode().expect("should encode");
        assert!(text.contains("sensor_etl_partitions_total{status=\"success\"} 1"));
        assert!(text.contains("sensor_etl_records_inserted_total 2500"));
        assert!(text.contains("sensor_etl_source_request_duration_seconds_count{outcome=\"timeout\"} 1"));
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let health = HealthMetrics::new("127.0.0.1:0").expect("metrics should register");
        health.start().await.expect("server should bind");
        health.stop().await.expect("stop should succeed");
        // Stopping twice is a no-op.
        health.stop().await.expect("second stop should succeed");
    }
}
