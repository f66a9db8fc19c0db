// gridwatch/src/metrics.rs
//
// Process-wide metrics, one handle per process.
//
// Families exposed (names and labels are the fleet's dashboard contract):
//
//   analytics_messages_processed_total{pipeline}       Counter
//   analytics_pipeline_errors_total{pipeline}          Counter
//   analytics_anomalies_detected_total{device_id, metric_type}  Counter
//   analytics_aggregation_mean{device_id, metric_type} Gauge
//   analytics_aggregation_count{device_id, metric_type} Gauge
//   analytics_alerts_triggered_total{pipeline, severity, rule}  Counter
//   iot_telemetry_received_total{device_type, sensor_type}      Counter
//   iot_telemetry_stored_total{device_type}            Counter
//   iot_alerts_generated_total{alert_type, severity}   Counter
//   iot_threshold_checks_total{sensor_type}            Counter
//   iot_alerts_stored_total{alert_type, severity}      Counter
//   iot_alerts_active{device_id, alert_type}           Gauge
//   iot_kpis_computed_total{kpi_name}                  Counter
//   iot_kpi_job_duration_seconds                       Histogram
//   iot_processing_errors_total{worker, error_type}    Counter
//
// device_id-labelled families scale with the fleet size; cardinality is
// bounded by the number of devices a replica's partitions carry.
//
// Exposed over HTTP: GET /metrics (text exposition format) and
// GET /health. Short-lived jobs push the registry to the pushgateway
// instead of being scraped.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::proto::MetricFamily;
use prometheus::{
    Encoder, GaugeVec, Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

pub struct Metrics {
    registry: Registry,

    // Analytics pipeline workers
    pub messages_processed: IntCounterVec,
    pub pipeline_errors:    IntCounterVec,
    pub anomalies_detected: IntCounterVec,
    pub aggregation_mean:   GaugeVec,
    pub aggregation_count:  GaugeVec,
    pub alerts_triggered:   IntCounterVec,

    // Fleet persistence and stream workers
    pub telemetry_received: IntCounterVec,
    pub telemetry_stored:   IntCounterVec,
    pub alerts_generated:   IntCounterVec,
    pub threshold_checks:   IntCounterVec,
    pub alerts_stored:      IntCounterVec,
    pub alerts_active:      GaugeVec,
    pub kpis_computed:      IntCounterVec,
    pub kpi_job_duration:   Histogram,
    pub processing_errors:  IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>> {
        let registry = Registry::new();

        let metrics = Metrics {
            messages_processed: counter(
                &registry,
                "analytics_messages_processed_total",
                "Messages handled, per pipeline",
                &["pipeline"],
            )?,
            pipeline_errors: counter(
                &registry,
                "analytics_pipeline_errors_total",
                "Message handling failures, per pipeline",
                &["pipeline"],
            )?,
            anomalies_detected: counter(
                &registry,
                "analytics_anomalies_detected_total",
                "Readings flagged anomalous",
                &["device_id", "metric_type"],
            )?,
            aggregation_mean: gauge(
                &registry,
                "analytics_aggregation_mean",
                "Rolling window mean per series",
                &["device_id", "metric_type"],
            )?,
            aggregation_count: gauge(
                &registry,
                "analytics_aggregation_count",
                "Rolling window sample count per series",
                &["device_id", "metric_type"],
            )?,
            alerts_triggered: counter(
                &registry,
                "analytics_alerts_triggered_total",
                "Alerts raised by the analytics pipelines",
                &["pipeline", "severity", "rule"],
            )?,
            telemetry_received: counter(
                &registry,
                "iot_telemetry_received_total",
                "Telemetry messages received",
                &["device_type", "sensor_type"],
            )?,
            telemetry_stored: counter(
                &registry,
                "iot_telemetry_stored_total",
                "Telemetry rows stored",
                &["device_type"],
            )?,
            alerts_generated: counter(
                &registry,
                "iot_alerts_generated_total",
                "Alerts published to the alerts topic",
                &["alert_type", "severity"],
            )?,
            threshold_checks: counter(
                &registry,
                "iot_threshold_checks_total",
                "Threshold checks performed",
                &["sensor_type"],
            )?,
            alerts_stored: counter(
                &registry,
                "iot_alerts_stored_total",
                "Alerts stored to the time-series store",
                &["alert_type", "severity"],
            )?,
            alerts_active: gauge(
                &registry,
                "iot_alerts_active",
                "Devices that have alerted since process start",
                &["device_id", "alert_type"],
            )?,
            kpis_computed: counter(
                &registry,
                "iot_kpis_computed_total",
                "KPI rows computed",
                &["kpi_name"],
            )?,
            kpi_job_duration: {
                let h = Histogram::with_opts(HistogramOpts::new(
                    "iot_kpi_job_duration_seconds",
                    "KPI job duration",
                ))?;
                registry.register(Box::new(h.clone()))?;
                h
            },
            processing_errors: counter(
                &registry,
                "iot_processing_errors_total",
                "Processing errors, per worker and class",
                &["worker", "error_type"],
            )?,
            registry,
        };
        Ok(Arc::new(metrics))
    }

    /// Text exposition format of everything registered.
    pub fn render(&self) -> Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8(buf)?)
    }

    pub fn gather(&self) -> Vec<MetricFamily> {
        self.registry.gather()
    }
}

fn counter(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<IntCounterVec> {
    let c = IntCounterVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

fn gauge(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> Result<GaugeVec> {
    let g = GaugeVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(g.clone()))?;
    Ok(g)
}

// ── Scrape endpoint ───────────────────────────────────────────────────────────

/// Bind the scrape endpoint. Binding is separate from serving so a taken
/// port fails the worker at startup instead of silently running blind.
pub async fn bind_endpoint(port: u16) -> Result<TcpListener> {
    TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind metrics port {port}"))
}

/// Serve GET /metrics and GET /health until the shutdown signal flips.
pub async fn serve(
    listener: TcpListener,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(render_metrics))
        .route("/health", get(health))
        .with_state(metrics);

    info!(port = listener.local_addr().map(|a| a.port()).unwrap_or(0), "metrics endpoint up");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}

async fn render_metrics(State(metrics): State<Arc<Metrics>>) -> Response {
    match metrics.render() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn health() -> &'static str {
    "OK"
}

// ── Pushgateway ───────────────────────────────────────────────────────────────

/// Push the whole registry to the pushgateway; used by one-shot jobs that
/// exit before a scrape would land. The underlying client is blocking, so
/// it runs on the blocking pool.
pub async fn push(metrics: Arc<Metrics>, job: &str, gateway_url: &str) -> Result<()> {
    let families = metrics.gather();
    let job = job.to_string();
    let url = gateway_url.to_string();
    tokio::task::spawn_blocking(move || {
        prometheus::push_metrics(&job, HashMap::new(), &url, families, None)
    })
    .await??;
    Ok(())
}
