// gridwatch/src/workers/alerter.rs
//
// Rule evaluation worker: the configurable rule set runs over every
// reading and raises alerts into metrics and logs. Keeps one replica
// minimum so rule alerts never wait on a scale-from-zero.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::broker::StartFrom;
use crate::config::Settings;
use crate::error::ProcessingError;
use crate::events::{MetricPoint, Severity};
use crate::pipelines::rules::{RuleError, RuleSet};
use crate::runtime::{Disposition, PipelineWorker, WorkerContext, WorkerSpec};

pub struct AlerterWorker {
    spec:  WorkerSpec,
    rules: RuleSet,
}

impl AlerterWorker {
    pub fn new(settings: &Settings) -> Result<Self> {
        Ok(Self {
            spec: WorkerSpec {
                name:          "alerter",
                topic:         settings.telemetry_topic.clone(),
                group_id:      settings.group_id("analytics-alerter"),
                metrics_port:  8084,
                start_from:    StartFrom::Latest,
                filter_field:  None,
                filter_values: None,
                min_replicas:  1,
                max_replicas:  3,
                lag_threshold: 50,
            },
            rules: default_rules()?,
        })
    }
}

/// The fleet's standing rules. Production deployments replace these from
/// configuration; the set stays hot-editable through enable/disable.
fn default_rules() -> Result<RuleSet, RuleError> {
    let mut rules = RuleSet::new();
    rules.add_threshold_rule(
        "high_temperature",
        "temperature",
        80.0,
        ">",
        Severity::Warning,
        Some("Temperature exceeds 80C".to_string()),
    )?;
    rules.add_threshold_rule(
        "critical_temperature",
        "temperature",
        100.0,
        ">",
        Severity::Critical,
        Some("Temperature exceeds 100C".to_string()),
    )?;
    rules.add_range_rule(
        "humidity_out_of_range",
        "humidity",
        20.0,
        80.0,
        Severity::Warning,
        Some("Humidity outside optimal range (20-80%)".to_string()),
    );
    rules.add_threshold_rule(
        "low_pressure",
        "pressure",
        900.0,
        "<",
        Severity::Warning,
        Some("Pressure below 900 hPa".to_string()),
    )?;
    Ok(rules)
}

#[async_trait]
impl PipelineWorker for AlerterWorker {
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

        let outcome = self.rules.evaluate(&point);
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
