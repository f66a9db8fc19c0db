// gridwatch/src/workers/aggregate.rs
//
// Aggregation worker: rolling window statistics per series, exported as
// gauges for dashboards and trend panels, plus a periodic fleet summary
// in the log. State is in-memory only; a restarted replica rebuilds its
// windows from live traffic.

use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use crate::broker::StartFrom;
use crate::config::Settings;
use crate::error::ProcessingError;
use crate::events::MetricPoint;
use crate::pipelines::aggregate::{Aggregator, DEFAULT_WINDOW_SECS};
use crate::runtime::{Disposition, PipelineWorker, WorkerContext, WorkerSpec};

const SUMMARY_INTERVAL: Duration = Duration::from_secs(30);

pub struct AggregationWorker {
    spec:         WorkerSpec,
    aggregator:   Aggregator,
    last_summary: Instant,
}

impl AggregationWorker {
    pub fn new(settings: &Settings) -> Self {
        Self::with_window(settings, DEFAULT_WINDOW_SECS)
    }

    pub fn with_window(settings: &Settings, window_secs: i64) -> Self {
        Self {
            spec: WorkerSpec {
                name:          "aggregator",
                topic:         settings.telemetry_topic.clone(),
                group_id:      settings.group_id("analytics-aggregator"),
                metrics_port:  8083,
                start_from:    StartFrom::Latest,
                filter_field:  None,
                filter_values: None,
                min_replicas:  0,
                max_replicas:  3,
                lag_threshold: 200,
            },
            aggregator:   Aggregator::new(window_secs),
            last_summary: Instant::now(),
        }
    }

    fn log_summary(&self) {
        let summary = self.aggregator.summary();
        info!(
            worker = self.spec.name,
            total_devices = summary.total_devices,
            total_readings = summary.total_readings,
            "fleet summary",
        );
    }
}

#[async_trait]
impl PipelineWorker for AggregationWorker {
    fn spec(&self) -> &WorkerSpec {
        &self.spec
    }

    fn spec_mut(&mut self) -> &mut WorkerSpec {
        &mut self.spec
    }

    async fn process(
        &mut self,
        raw: &Value,
        ctx: &WorkerContext,
    ) -> Result<Disposition, ProcessingError> {
        let Some(point) = MetricPoint::from_json(raw) else {
            return Ok(Disposition::Commit);
        };

        let snapshot = self.aggregator.process(&point);

        ctx.metrics
            .aggregation_mean
            .with_label_values(&[&snapshot.device_id, &snapshot.metric_type])
            .set(snapshot.mean);
        ctx.metrics
            .aggregation_count
            .with_label_values(&[&snapshot.device_id, &snapshot.metric_type])
            .set(snapshot.count as f64);

        Ok(Disposition::Commit)
    }

    async fn tick(&mut self, _ctx: &WorkerContext) -> Result<Disposition, ProcessingError> {
        if self.last_summary.elapsed() >= SUMMARY_INTERVAL {
            self.log_summary();
            self.last_summary = Instant::now();
        }
        Ok(Disposition::Hold)
    }

    async fn teardown(&mut self, _ctx: &WorkerContext) -> Result<()> {
        self.log_summary();
        Ok(())
    }
}
