// gridwatch/src/workers/anomaly.rs
//
// Anomaly detection worker: telemetry topic -> z-score + absolute-bound
// detection -> metrics and logs. Scales 0..N on consumer lag; the
// detector warms up per series, so a fresh replica spends its first
// min_samples readings per series silent.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::broker::StartFrom;
use crate::config::Settings;
use crate::error::ProcessingError;
use crate::events::MetricPoint;
use crate::pipelines::anomaly::AnomalyDetector;
use crate::runtime::{Disposition, PipelineWorker, WorkerContext, WorkerSpec};

pub struct AnomalyWorker {
    spec:     WorkerSpec,
    detector: AnomalyDetector,
}

impl AnomalyWorker {
    pub fn new(settings: &Settings) -> Self {
        Self {
            spec: WorkerSpec {
                name:          "anomaly-detector",
                topic:         settings.telemetry_topic.clone(),
                group_id:      settings.group_id("analytics-anomaly"),
                metrics_port:  8082,
                start_from:    StartFrom::Latest,
                filter_field:  None,
                filter_values: None,
                min_replicas:  0,
                max_replicas:  5,
                lag_threshold: 100,
            },
            detector: AnomalyDetector::with_defaults(),
        }
    }
}

#[async_trait]
impl PipelineWorker for AnomalyWorker {
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
        // Readings with no scalar interpretation carry nothing to score.
        let Some(point) = MetricPoint::from_json(raw) else {
            return Ok(Disposition::Commit);
        };

        let outcome = self.detector.process(&point);

        if outcome.is_anomaly {
            ctx.metrics
                .anomalies_detected
                .with_label_values(&[&outcome.device_id, &outcome.metric_type])
                .inc();
        }
        for alert in &outcome.alerts {
            ctx.metrics
                .alerts_triggered
                .with_label_values(&[self.spec.name, alert.severity.as_str(), &alert.rule])
                .inc();
            warn!(
                worker = self.spec.name,
                severity = alert.severity.as_str(),
                rule = %alert.rule,
                device_id = %alert.source,
                "{}",
                alert.message,
            );
        }
        Ok(Disposition::Commit)
    }
}
