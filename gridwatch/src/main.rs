// gridwatch/src/main.rs
//
// gridwatch - stream analytics fabric for IoT device fleet telemetry
//
// One binary, one role per process; a deployment runs the same image
// once per role and scales each role independently on consumer lag:
//
//   anomaly           z-score + absolute-bound detection over telemetry
//   aggregator        rolling per-device window statistics
//   alerter           configurable rule evaluation
//   stream            threshold / rate-of-change / stuck-sensor alerts
//   alert-writer      alerts topic -> store (idempotent upsert)
//   telemetry-writer  telemetry topic -> store (batched)
//   kpi-job           watermark-driven KPI computation (one-shot)
//
// Usage:
//   gridwatch --role stream
//   gridwatch --role anomaly --metrics-port 9100
//   gridwatch --role kpi-job        # scheduled by the deployment

mod broker;
mod config;
mod db;
mod error;
mod events;
mod jobs;
mod metrics;
mod pipelines;
mod runtime;
mod state;
mod workers;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::Settings;
use metrics::Metrics;
use runtime::WorkerRuntime;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "gridwatch",
    about   = "Stream analytics fabric for IoT device fleet telemetry",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    #[arg(long, value_enum, help = "Worker role this process runs")]
    role: Role,

    #[arg(long, help = "Override the role's metrics endpoint port")]
    metrics_port: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Role {
    Anomaly,
    Aggregator,
    Alerter,
    Stream,
    AlertWriter,
    TelemetryWriter,
    KpiJob,
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::from_env()?;
    init_tracing(&settings)?;

    let metrics = Metrics::new()?;
    info!(service = %settings.service_name, role = ?cli.role, "gridwatch starting");

    match cli.role {
        Role::KpiJob => {
            info!("starting kpi-job");
            let result = jobs::kpi::run(&settings, &metrics).await;
            // Push whatever the run recorded, success or not; the
            // pushgateway being down must not mask the job's own outcome.
            if let Err(e) =
                metrics::push(metrics.clone(), "kpi-job", &settings.pushgateway_url).await
            {
                warn!(error = %e, "pushgateway push failed");
            }
            result
        }
        role => {
            let mut worker = workers::build(role, &settings, cli.metrics_port)?;
            let mut runtime = WorkerRuntime::new(settings, metrics);
            runtime.run(worker.as_mut()).await
        }
    }
}

fn init_tracing(settings: &Settings) -> Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("gridwatch={}", settings.log_level).parse()?);
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if settings.log_json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
    Ok(())
}
