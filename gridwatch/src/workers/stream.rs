// gridwatch/src/workers/stream.rs
//
// Stream rule worker: telemetry topic -> per-reading checks -> alerts
// topic.
//
// Checks, in order per reading:
//   1. threshold breach  - against the configured (device_type,
//      sensor_type) bounds, critical over warning
//   2. rate of change    - |value - previous| beyond RATE_THRESHOLD
//   3. stuck sensor      - the last STUCK_COUNT values all equal
//
// State is keyed by (device_id, sensor_id) and relies on per-device
// ordering: the log partitions by device id and this replica is the only
// consumer of its partitions. Thresholds load once at startup.

use std::collections::{HashMap, VecDeque};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::broker::{LogProducer, StartFrom};
use crate::config::Settings;
use crate::db;
use crate::error::ProcessingError;
use crate::events::{lookup_threshold, Alert, AlertKind, Severity, Telemetry, ThresholdMap};
use crate::runtime::{Disposition, PipelineWorker, WorkerContext, WorkerSpec};

pub const STUCK_COUNT: usize = 5;
pub const RATE_THRESHOLD: f64 = 10.0;

// ── Detection state ───────────────────────────────────────────────────────────

/// The per-reading checks, separated from the broker and store so the
/// detection logic tests without either.
pub struct StreamProcessor {
    thresholds:     ThresholdMap,
    last_value:     HashMap<(String, String), f64>,
    history:        HashMap<(String, String), VecDeque<f64>>,
    stuck_count:    usize,
    rate_threshold: f64,
}

impl StreamProcessor {
    pub fn new(thresholds: ThresholdMap) -> Self {
        Self {
            thresholds,
            last_value: HashMap::new(),
            history: HashMap::new(),
            stuck_count: STUCK_COUNT,
            rate_threshold: RATE_THRESHOLD,
        }
    }

    /// Run every check against one reading and return the alerts to
    /// publish. Readings with no scalar interpretation produce nothing
    /// and leave the state untouched.
    pub fn process(&mut self, reading: &Telemetry) -> Vec<Alert> {
        let Some(value) = reading.metric_scalar() else {
            return Vec::new();
        };
        let key = (reading.device_id.clone(), reading.sensor_id.clone());
        let mut alerts = Vec::new();

        // 1. Threshold breach
        if let Some(threshold) =
            lookup_threshold(&self.thresholds, &reading.device_type, &reading.sensor_type)
        {
            if let (Some((kind, severity)), Some(limit)) =
                (threshold.check(value), threshold.limit())
            {
                alerts.push(make_alert(
                    reading,
                    kind.as_str(),
                    severity,
                    format!(
                        "{} value {:.2} exceeds limit {}",
                        reading.sensor_type, value, limit
                    ),
                    value,
                    Some(limit),
                ));
            }
        }

        // 2. Rate of change
        if let Some(previous) = self.last_value.get(&key) {
            let delta = (value - previous).abs();
            if delta > self.rate_threshold {
                alerts.push(make_alert(
                    reading,
                    AlertKind::RapidChange.as_str(),
                    Severity::Warning,
                    format!(
                        "{} changed by {:.2} in one reading",
                        reading.sensor_type, delta
                    ),
                    value,
                    Some(self.rate_threshold),
                ));
            }
        }

        // 3. Stuck sensor
        let history = self.history.entry(key.clone()).or_default();
        history.push_back(value);
        if history.len() > self.stuck_count {
            history.pop_front();
        }
        if history.len() == self.stuck_count && history.iter().all(|v| *v == history[0]) {
            alerts.push(make_alert(
                reading,
                AlertKind::StuckSensor.as_str(),
                Severity::Warning,
                format!(
                    "{} stuck at {:.2} for {} readings",
                    reading.sensor_id, value, self.stuck_count
                ),
                value,
                None,
            ));
        }

        self.last_value.insert(key, value);
        alerts
    }
}

fn make_alert(
    reading: &Telemetry,
    alert_type: &str,
    severity: Severity,
    message: String,
    value: f64,
    threshold: Option<f64>,
) -> Alert {
    Alert {
        alert_id:    Uuid::new_v4().to_string(),
        device_id:   reading.device_id.clone(),
        device_type: reading.device_type.clone(),
        alert_type:  alert_type.to_string(),
        severity,
        message,
        threshold,
        value:       Some(value),
        created_at:  Utc::now(),
    }
}

// ── Worker ────────────────────────────────────────────────────────────────────

pub struct StreamWorker {
    spec:      WorkerSpec,
    processor: Option<StreamProcessor>,
    producer:  Option<LogProducer>,
}

impl StreamWorker {
    pub fn new(settings: &Settings) -> Self {
        Self {
            spec: WorkerSpec {
                name:          "stream-worker",
                topic:         settings.telemetry_topic.clone(),
                group_id:      settings.group_id("stream-worker"),
                metrics_port:  settings.metrics_port,
                start_from:    StartFrom::Committed,
                filter_field:  None,
                filter_values: None,
                min_replicas:  1,
                max_replicas:  5,
                lag_threshold: 100,
            },
            processor: None,
            producer:  None,
        }
    }
}

#[async_trait]
impl PipelineWorker for StreamWorker {
    fn spec(&self) -> &WorkerSpec {
        &self.spec
    }

    fn spec_mut(&mut self) -> &mut WorkerSpec {
        &mut self.spec
    }

    async fn setup(&mut self, ctx: &WorkerContext) -> Result<()> {
        let pool = db::connect(&ctx.settings).await?;
        let thresholds = db::load_thresholds(&pool)
            .await
            .context("failed to load thresholds")?;
        pool.close().await;
        info!(count = thresholds.len(), "thresholds loaded");

        self.processor = Some(StreamProcessor::new(thresholds));
        self.producer = Some(LogProducer::connect(&ctx.settings.brokers)?);
        Ok(())
    }

    async fn process(
        &mut self,
        raw: &Value,
        ctx: &WorkerContext,
    ) -> Result<Disposition, ProcessingError> {
        let processor = self
            .processor
            .as_mut()
            .ok_or(ProcessingError::Internal("stream processor"))?;

        let reading: Telemetry = serde_json::from_value(raw.clone())?;
        if reading.metric_scalar().is_none() {
            return Ok(Disposition::Commit);
        }
        ctx.metrics
            .threshold_checks
            .with_label_values(&[&reading.sensor_type])
            .inc();

        let alerts = processor.process(&reading);
        if alerts.is_empty() {
            return Ok(Disposition::Commit);
        }

        let producer = self
            .producer
            .as_ref()
            .ok_or(ProcessingError::Internal("alert producer"))?;
        for alert in &alerts {
            // Keyed by device id so downstream consumers see one device's
            // alerts in order.
            producer
                .send_json(&ctx.settings.alerts_topic, &alert.device_id, alert)
                .await?;
            ctx.metrics
                .alerts_generated
                .with_label_values(&[&alert.alert_type, alert.severity.as_str()])
                .inc();
            info!(
                alert_id = %alert.alert_id,
                device_id = %alert.device_id,
                alert_type = %alert.alert_type,
                severity = alert.severity.as_str(),
                value = alert.value,
                "alert generated",
            );
        }
        Ok(Disposition::Commit)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Threshold;
    use serde_json::json;

    fn reading(device_type: &str, sensor_type: &str, value: serde_json::Value) -> Telemetry {
        serde_json::from_value(json!({
            "deviceId": "d1",
            "deviceType": device_type,
            "sensorId": "s1",
            "sensorType": sensor_type,
            "timestamp": "2024-01-15T10:30:00Z",
            "unit": "u",
            "value": value,
        }))
        .expect("valid reading")
    }

    fn scalar(device_type: &str, sensor_type: &str, value: f64) -> Telemetry {
        reading(device_type, sensor_type, json!({"value": value}))
    }

    fn thresholds() -> ThresholdMap {
        let mut map = ThresholdMap::new();
        map.insert(
            (Some("hvac".into()), "temperature".into()),
            Threshold {
                sensor_type:   "temperature".into(),
                device_type:   Some("hvac".into()),
                critical_high: Some(40.0),
                ..Default::default()
            },
        );
        map.insert(
            (None, "temperature".into()),
            Threshold {
                sensor_type:   "temperature".into(),
                critical_high: Some(60.0),
                ..Default::default()
            },
        );
        map
    }

    #[test]
    fn device_type_threshold_takes_precedence() {
        let mut p = StreamProcessor::new(thresholds());

        let hvac = p.process(&scalar("hvac", "temperature", 50.0));
        assert_eq!(hvac.len(), 1);
        assert_eq!(hvac[0].alert_type, "threshold_breach");
        assert_eq!(hvac[0].severity, Severity::Critical);
        assert_eq!(hvac[0].threshold, Some(40.0));

        let mut p = StreamProcessor::new(thresholds());
        let pump = p.process(&scalar("pump", "temperature", 50.0));
        assert!(pump.is_empty());
    }

    #[test]
    fn rate_of_change_fires_once_per_jump() {
        let mut p = StreamProcessor::new(ThresholdMap::new());
        assert!(p.process(&scalar("hvac", "temperature", 20.0)).is_empty());

        let jump = p.process(&scalar("hvac", "temperature", 35.0));
        assert_eq!(jump.len(), 1);
        assert_eq!(jump[0].alert_type, "rapid_change");
        assert_eq!(jump[0].severity, Severity::Warning);
        assert_eq!(jump[0].threshold, Some(RATE_THRESHOLD));

        assert!(p.process(&scalar("hvac", "temperature", 36.0)).is_empty());
    }

    #[test]
    fn stuck_sensor_needs_a_full_window_of_equal_values() {
        let mut p = StreamProcessor::new(ThresholdMap::new());
        let mut stuck_alerts = 0;
        for _ in 0..STUCK_COUNT {
            stuck_alerts += p
                .process(&scalar("hvac", "humidity", 42.0))
                .iter()
                .filter(|a| a.alert_type == "stuck_sensor")
                .count();
        }
        assert_eq!(stuck_alerts, 1);

        // A distinct value resets the condition...
        let distinct = p.process(&scalar("hvac", "humidity", 43.0));
        assert!(distinct.iter().all(|a| a.alert_type != "stuck_sensor"));

        // ...and it takes a full window of the new value to re-arm.
        for _ in 0..STUCK_COUNT - 2 {
            let alerts = p.process(&scalar("hvac", "humidity", 43.0));
            assert!(alerts.iter().all(|a| a.alert_type != "stuck_sensor"));
        }
        let rearmed = p.process(&scalar("hvac", "humidity", 43.0));
        assert!(rearmed.iter().any(|a| a.alert_type == "stuck_sensor"));
    }

    #[test]
    fn vibration_uses_the_rms_scalar() {
        let mut map = ThresholdMap::new();
        map.insert(
            (None, "vibration".into()),
            Threshold {
                sensor_type:   "vibration".into(),
                critical_high: Some(4.0),
                ..Default::default()
            },
        );
        let mut p = StreamProcessor::new(map);

        // (3, 4, 0) has RMS 5.0, over the 4.0 bound.
        let alerts = p.process(&reading("motor", "vibration", json!({"x": 3, "y": 4, "z": 0})));
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, "threshold_breach");
        assert_eq!(alerts[0].value, Some(5.0));
    }

    #[test]
    fn nonscalar_readings_are_dropped_without_state_changes() {
        let mut p = StreamProcessor::new(ThresholdMap::new());
        let alerts = p.process(&reading("hvac", "temperature", json!({"state": "open"})));
        assert!(alerts.is_empty());
        // The dropped reading must not seed rate-of-change state.
        assert!(p.process(&scalar("hvac", "temperature", 20.0)).is_empty());
    }

    #[test]
    fn breach_and_rapid_change_can_stack() {
        let mut p = StreamProcessor::new(thresholds());
        p.process(&scalar("hvac", "temperature", 20.0));
        let alerts = p.process(&scalar("hvac", "temperature", 50.0));
        let kinds: Vec<&str> = alerts.iter().map(|a| a.alert_type.as_str()).collect();
        assert_eq!(kinds, vec!["threshold_breach", "rapid_change"]);
    }
}
