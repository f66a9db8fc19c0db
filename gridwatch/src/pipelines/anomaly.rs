// gridwatch/src/pipelines/anomaly.rs
//
// Z-score anomaly detection with a per-metric absolute-bound guard.
//
// Per (device_id, metric_type) series, in order:
//   1. absolute bounds - checked before any statistics, alive during
//      warm-up, always critical
//   2. z-score - once the series has min_samples and a nonzero std;
//      critical at z >= 1.5x the threshold, warning below
//   3. the running stats absorb the value regardless of the outcome

use std::collections::HashMap;

use crate::events::{AlertKind, MetricPoint, Severity};
use crate::pipelines::{AlertLimit, PipelineAlert};
use crate::state::stats::RunningStats;

pub const DEFAULT_THRESHOLD: f64 = 3.0;
pub const DEFAULT_MIN_SAMPLES: u64 = 10;

pub struct AnomalyDetector {
    threshold:       f64,
    min_samples:     u64,
    absolute_bounds: HashMap<String, (f64, f64)>,
    stats:           HashMap<(String, String), RunningStats>,
}

/// Outcome of one reading: the derived data plus any alerts. z_score,
/// mean and std are present only when the series was warm enough to
/// compute them.
#[derive(Debug, Clone)]
pub struct AnomalyOutcome {
    pub device_id:    String,
    pub metric_type:  String,
    pub value:        f64,
    pub is_anomaly:   bool,
    pub sample_count: u64,
    pub z_score:      Option<f64>,
    pub mean:         Option<f64>,
    pub std:          Option<f64>,
    pub alerts:       Vec<PipelineAlert>,
}

impl AnomalyDetector {
    pub fn new(
        threshold: f64,
        min_samples: u64,
        absolute_bounds: HashMap<String, (f64, f64)>,
    ) -> Self {
        Self {
            threshold,
            min_samples,
            absolute_bounds,
            stats: HashMap::new(),
        }
    }

    /// Fleet defaults: z threshold 3.0, warm-up of 10 samples, hard
    /// physical bounds for the common sensor types.
    pub fn with_defaults() -> Self {
        let bounds = HashMap::from([
            ("temperature".to_string(), (-50.0, 150.0)),
            ("humidity".to_string(), (0.0, 100.0)),
            ("pressure".to_string(), (800.0, 1200.0)),
        ]);
        Self::new(DEFAULT_THRESHOLD, DEFAULT_MIN_SAMPLES, bounds)
    }

    pub fn process(&mut self, point: &MetricPoint) -> AnomalyOutcome {
        let mut alerts = Vec::new();
        let mut is_anomaly = false;

        if let Some(&(lo, hi)) = self.absolute_bounds.get(&point.metric_type) {
            if point.value < lo || point.value > hi {
                alerts.push(PipelineAlert {
                    rule:     AlertKind::AbsoluteBoundViolation.as_str().to_string(),
                    message:  format!(
                        "{} value {} outside bounds [{}, {}]",
                        point.metric_type, point.value, lo, hi
                    ),
                    severity: Severity::Critical,
                    source:   point.device_id.clone(),
                    value:    Some(point.value),
                    limit:    Some(AlertLimit::Bounds(lo, hi)),
                });
                is_anomaly = true;
            }
        }

        let stats = self
            .stats
            .entry((point.device_id.clone(), point.metric_type.clone()))
            .or_default();

        let mut z_score = None;
        let mut mean = None;
        let mut std = None;

        if stats.count() >= self.min_samples && stats.std() > 0.0 {
            let z = (point.value - stats.mean()).abs() / stats.std();
            z_score = Some(z);
            mean = Some(stats.mean());
            std = Some(stats.std());

            if z > self.threshold {
                let severity = if z < self.threshold * 1.5 {
                    Severity::Warning
                } else {
                    Severity::Critical
                };
                alerts.push(PipelineAlert {
                    rule:     AlertKind::StatisticalAnomaly.as_str().to_string(),
                    message:  format!(
                        "{} value {:.2} is {:.1} std devs from mean {:.2}",
                        point.metric_type,
                        point.value,
                        z,
                        stats.mean()
                    ),
                    severity,
                    source:   point.device_id.clone(),
                    value:    Some(point.value),
                    limit:    Some(AlertLimit::Threshold(self.threshold)),
                });
                is_anomaly = true;
            }
        }

        stats.update(point.value);

        AnomalyOutcome {
            device_id:    point.device_id.clone(),
            metric_type:  point.metric_type.clone(),
            value:        point.value,
            is_anomaly,
            sample_count: stats.count(),
            z_score,
            mean,
            std,
            alerts,
        }
    }

    /// Current stats for one series, for introspection and tests.
    pub fn stats_for(&self, device_id: &str, metric_type: &str) -> Option<&RunningStats> {
        self.stats
            .get(&(device_id.to_string(), metric_type.to_string()))
    }

    /// Drop all accumulated series state.
    pub fn reset(&mut self) {
        self.stats.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn point(device_id: &str, metric_type: &str, value: f64) -> MetricPoint {
        MetricPoint {
            device_id:   device_id.to_string(),
            metric_type: metric_type.to_string(),
            value,
            timestamp:   Utc::now(),
        }
    }

    #[test]
    fn every_reading_grows_the_series_by_one() {
        let mut d = AnomalyDetector::with_defaults();
        for i in 1..=25u64 {
            let out = d.process(&point("d1", "temperature", 20.0 + (i % 3) as f64));
            assert_eq!(out.sample_count, i);
        }
    }

    #[test]
    fn absolute_bound_fires_during_warmup() {
        // Scenario: first ever reading is already outside the physical
        // bounds; the guard does not wait for statistics.
        let mut d = AnomalyDetector::with_defaults();
        let out = d.process(&point("d1", "temperature", 200.0));
        assert!(out.is_anomaly);
        assert_eq!(out.alerts.len(), 1);
        let alert = &out.alerts[0];
        assert_eq!(alert.rule, "absolute_bound_violation");
        assert_eq!(alert.severity, Severity::Critical);
        assert_eq!(alert.source, "d1");
        assert_eq!(alert.limit, Some(AlertLimit::Bounds(-50.0, 150.0)));
    }

    #[test]
    fn no_statistical_anomaly_before_min_samples() {
        let mut d = AnomalyDetector::new(3.0, 10, HashMap::new());
        for i in 0..10 {
            let out = d.process(&point("d1", "temperature", 20.0 + (i % 2) as f64));
            assert!(out.alerts.is_empty(), "fired during warm-up at sample {i}");
        }
    }

    #[test]
    fn zscore_escalates_to_critical() {
        // Nine steady readings, a tenth that keeps std nonzero, then a
        // wild outlier: z is far beyond 1.5x the threshold.
        let mut d = AnomalyDetector::with_defaults();
        for i in 0..9 {
            d.process(&point("d1", "temperature", 20.0 + (i % 2) as f64 * 0.5));
        }
        let tenth = d.process(&point("d1", "temperature", 20.0));
        assert!(tenth.alerts.is_empty());

        let out = d.process(&point("d1", "temperature", 100.0));
        assert!(out.is_anomaly);
        assert_eq!(out.alerts.len(), 1);
        assert_eq!(out.alerts[0].rule, "statistical_anomaly");
        assert_eq!(out.alerts[0].severity, Severity::Critical);
        assert!(out.z_score.is_some_and(|z| z > 4.5));
    }

    #[test]
    fn constant_series_never_alerts() {
        // std stays 0, so the z-score branch never arms.
        let mut d = AnomalyDetector::new(3.0, 10, HashMap::new());
        for _ in 0..50 {
            let out = d.process(&point("d1", "humidity", 55.0));
            assert!(out.alerts.is_empty());
        }
    }

    #[test]
    fn series_are_independent_per_device_and_metric() {
        let mut d = AnomalyDetector::new(3.0, 10, HashMap::new());
        for _ in 0..20 {
            d.process(&point("d1", "temperature", 20.0));
        }
        // A different device starts its own warm-up.
        let out = d.process(&point("d2", "temperature", 90.0));
        assert!(out.alerts.is_empty());
        assert_eq!(out.sample_count, 1);
    }

    #[test]
    fn reset_clears_series_state() {
        let mut d = AnomalyDetector::with_defaults();
        d.process(&point("d1", "temperature", 20.0));
        assert!(d.stats_for("d1", "temperature").is_some());
        d.reset();
        assert!(d.stats_for("d1", "temperature").is_none());
    }
}
