//! ---
//! ramdir_section: "03-persistence-logging"
//! ramdir_subsection: "module"
//! ramdir_type: "source"
//! ramdir_scope: "code"
//! ramdir_description: "Metrics collection and export utilities."
//! ramdir_version: "v0.0.0-prealpha"
//! ramdir_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across crates.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let addr = std_listener.local_addr().unwrap_or(addr);
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;

    info!(address = %addr, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = app.into_make_service();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

/// Prometheus scrape endpoint.
async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        ),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("text/plain"),
                )],
                String::from("metrics encoding error"),
            )
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Return the bound address for convenience.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Metrics recorded by the daemon process itself.
#[derive(Clone)]
pub struct DaemonMetrics {
    starts_total: IntCounter,
    config_load_seconds: Histogram,
}

impl DaemonMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let starts_total = IntCounter::with_opts(Opts::new(
            "r_ramdird_starts_total",
            "Total number of times the mirror daemon has initialised",
        ))?;
        registry.register(Box::new(starts_total.clone()))?;

        let buckets = prometheus::exponential_buckets(0.001, 2.0, 16)
            .context("failed to construct histogram buckets")?;
        let config_load_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "r_ramdird_config_load_seconds",
                "Time spent loading and validating configuration",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(config_load_seconds.clone()))?;

        Ok(Self {
            starts_total,
            config_load_seconds,
        })
    }

    pub fn inc_start(&self) {
        self.starts_total.inc();
    }

    pub fn observe_config_load(&self, seconds: f64) {
        self.config_load_seconds.observe(seconds);
    }
}

impl std::fmt::Debug for DaemonMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonMetrics").finish_non_exhaustive()
    }
}

/// Per-resource lifecycle and checkpoint instrumentation.
#[derive(Clone)]
pub struct LifecycleMetrics {
    checkpoints: IntCounterVec,
    checkpoint_failures: IntCounterVec,
    checkpoint_duration: HistogramVec,
    unit_state: IntGaugeVec,
}

impl LifecycleMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let checkpoints = IntCounterVec::new(
            Opts::new(
                "r_ramdir_checkpoints_total",
                "Successful checkpoints of a memory copy to its persistent path",
            ),
            &["resource", "forced"],
        )?;
        registry.register(Box::new(checkpoints.clone()))?;

        let checkpoint_failures = IntCounterVec::new(
            Opts::new(
                "r_ramdir_checkpoint_failures_total",
                "Checkpoint attempts that failed, by reason",
            ),
            &["resource", "reason"],
        )?;
        registry.register(Box::new(checkpoint_failures.clone()))?;

        let buckets = prometheus::exponential_buckets(0.001, 2.0, 16)
            .context("failed to construct histogram buckets")?;
        let checkpoint_duration = HistogramVec::new(
            HistogramOpts::new(
                "r_ramdir_checkpoint_duration_seconds",
                "Time spent mirroring a memory copy to disk",
            )
            .buckets(buckets),
            &["resource"],
        )?;
        registry.register(Box::new(checkpoint_duration.clone()))?;

        let unit_state = IntGaugeVec::new(
            Opts::new(
                "r_ramdir_unit_state",
                "Lifecycle state ordinal of each managed resource",
            ),
            &["resource"],
        )?;
        registry.register(Box::new(unit_state.clone()))?;

        Ok(Self {
            checkpoints,
            checkpoint_failures,
            checkpoint_duration,
            unit_state,
        })
    }

    pub fn record_checkpoint(&self, resource: &str, forced: bool, seconds: f64) {
        let forced = if forced { "true" } else { "false" };
        self.checkpoints
            .with_label_values(&[resource, forced])
            .inc();
        self.checkpoint_duration
            .with_label_values(&[resource])
            .observe(seconds);
    }

    pub fn record_checkpoint_failure(&self, resource: &str, reason: &str) {
        self.checkpoint_failures
            .with_label_values(&[resource, reason])
            .inc();
    }

    pub fn set_unit_state(&self, resource: &str, ordinal: i64) {
        self.unit_state.with_label_values(&[resource]).set(ordinal);
    }
}

impl std::fmt::Debug for LifecycleMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleMetrics").finish_non_exhaustive()
    }
}

pub use prometheus;

#[cfg(test)]
mod tests {
    use super::*;

    fn counter_value(registry: &Registry, name: &str) -> f64 {
        registry
            .gather()
            .iter()
            .find(|family| family.get_name() == name)
            .map(|family| {
                family
                    .get_metric()
                    .iter()
                    .map(|metric| metric.get_counter().get_value())
                    .sum()
            })
            .unwrap_or_default()
    }

    #[test]
    fn lifecycle_metrics_capture_checkpoints() {
        let registry = new_registry();
        let metrics = LifecycleMetrics::new(registry.clone()).unwrap();

        metrics.record_checkpoint("rrd", false, 0.02);
        metrics.record_checkpoint("rrd", true, 0.5);
        metrics.record_checkpoint_failure("rrd", "unsafe_empty_source");
        metrics.set_unit_state("rrd", 4);

        assert_eq!(counter_value(&registry, "r_ramdir_checkpoints_total"), 2.0);
        assert_eq!(
            counter_value(&registry, "r_ramdir_checkpoint_failures_total"),
            1.0
        );
        let state = registry
            .gather()
            .into_iter()
            .find(|family| family.get_name() == "r_ramdir_unit_state")
            .and_then(|family| family.get_metric().first().map(|m| m.get_gauge().get_value()))
            .unwrap();
        assert_eq!(state, 4.0);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = new_registry();
        LifecycleMetrics::new(registry.clone()).unwrap();
        assert!(LifecycleMetrics::new(registry).is_err());
    }

    #[test]
    fn daemon_metrics_count_starts() {
        let registry = new_registry();
        let metrics = DaemonMetrics::new(registry.clone()).unwrap();
        metrics.inc_start();
        metrics.observe_config_load(0.01);
        assert_eq!(counter_value(&registry, "r_ramdird_starts_total"), 1.0);
    }

    #[tokio::test]
    async fn scrape_is_served_as_prometheus_text() {
        let registry = new_registry();
        let metrics = LifecycleMetrics::new(registry.clone()).unwrap();
        metrics.record_checkpoint("rrd", true, 0.1);

        let response = metrics_handler(registry).await.into_response();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            prometheus::TEXT_FORMAT
        );
    }

    #[tokio::test]
    async fn http_server_binds_and_shuts_down() {
        let registry = new_registry();
        let server = spawn_http_server(registry, "127.0.0.1:0".parse().unwrap()).unwrap();
        assert_ne!(server.addr().port(), 0);
        server.shutdown().await.unwrap();
    }
}
