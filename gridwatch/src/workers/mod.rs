// gridwatch/src/workers/mod.rs
//
// One module per worker role; the registry below maps the CLI role onto
// a constructed worker. Every role shares the runtime in runtime.rs and
// differs only in its spec, its pipeline state, and what it does with
// each record.

pub mod aggregate;
pub mod alert_writer;
pub mod alerter;
pub mod anomaly;
pub mod stream;
pub mod telemetry_writer;

use anyhow::{bail, Result};

use crate::config::Settings;
use crate::runtime::PipelineWorker;
use crate::Role;

pub fn build(
    role: Role,
    settings: &Settings,
    metrics_port: Option<u16>,
) -> Result<Box<dyn PipelineWorker>> {
    let mut worker: Box<dyn PipelineWorker> = match role {
        Role::Anomaly => Box::new(anomaly::AnomalyWorker::new(settings)),
        Role::Aggregator => Box::new(aggregate::AggregationWorker::new(settings)),
        Role::Alerter => Box::new(alerter::AlerterWorker::new(settings)?),
        Role::Stream => Box::new(stream::StreamWorker::new(settings)),
        Role::AlertWriter => Box::new(alert_writer::AlertWriterWorker::new(settings)),
        Role::TelemetryWriter => Box::new(telemetry_writer::TelemetryWriterWorker::new(settings)),
        Role::KpiJob => bail!("kpi-job is a one-shot job, not a stream worker"),
    };
    if let Some(port) = metrics_port {
        worker.spec_mut().metrics_port = port;
    }
    Ok(worker)
}
