// gridwatch/src/pipelines/aggregate.rs
//
// Rolling per-device window statistics and fleet totals. One TimeWindow
// per (device_id, metric_type); totals count every reading ever seen by
// this replica. State is in-memory only, a restart starts cold.

use std::collections::HashMap;

use crate::events::MetricPoint;
use crate::state::window::TimeWindow;

pub const DEFAULT_WINDOW_SECS: i64 = 300;

pub struct Aggregator {
    horizon_secs: i64,
    windows:      HashMap<(String, String), TimeWindow>,
    by_metric:    HashMap<String, u64>,
    by_device:    HashMap<String, u64>,
}

/// Window statistics after one reading.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateSnapshot {
    pub device_id:             String,
    pub metric_type:           String,
    pub window_secs:           i64,
    pub count:                 usize,
    pub sum:                   f64,
    pub mean:                  f64,
    pub min:                   f64,
    pub max:                   f64,
    pub rate_per_second:       f64,
    pub total_readings:        u64,
    pub device_total_readings: u64,
}

/// Fleet-wide totals across every series this replica has seen.
#[derive(Debug, Clone, PartialEq)]
pub struct FleetSummary {
    pub total_devices:  usize,
    pub total_readings: u64,
    pub by_metric:      HashMap<String, u64>,
    pub by_device:      HashMap<String, u64>,
}

impl Aggregator {
    pub fn new(horizon_secs: i64) -> Self {
        Self {
            horizon_secs,
            windows: HashMap::new(),
            by_metric: HashMap::new(),
            by_device: HashMap::new(),
        }
    }

    pub fn process(&mut self, point: &MetricPoint) -> AggregateSnapshot {
        let window = self
            .windows
            .entry((point.device_id.clone(), point.metric_type.clone()))
            .or_insert_with(|| TimeWindow::new(self.horizon_secs));
        let horizon = window.horizon_secs();
        window.add(point.value, Some(point.timestamp));

        let total_readings = {
            let n = self.by_metric.entry(point.metric_type.clone()).or_insert(0);
            *n += 1;
            *n
        };
        let device_total_readings = {
            let n = self.by_device.entry(point.device_id.clone()).or_insert(0);
            *n += 1;
            *n
        };

        let count = window.count();
        AggregateSnapshot {
            device_id:   point.device_id.clone(),
            metric_type: point.metric_type.clone(),
            window_secs: horizon,
            count,
            sum:  window.sum(),
            mean: window.mean(),
            min:  window.min(),
            max:  window.max(),
            rate_per_second: if horizon > 0 {
                count as f64 / horizon as f64
            } else {
                0.0
            },
            total_readings,
            device_total_readings,
        }
    }

    pub fn summary(&self) -> FleetSummary {
        FleetSummary {
            total_devices:  self.by_device.len(),
            total_readings: self.by_metric.values().sum(),
            by_metric:      self.by_metric.clone(),
            by_device:      self.by_device.clone(),
        }
    }

    /// Drop all windows and totals.
    pub fn reset(&mut self) {
        self.windows.clear();
        self.by_metric.clear();
        self.by_device.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    const EPS: f64 = 1e-6;

    fn point_at(device_id: &str, metric_type: &str, value: f64, age_secs: i64) -> MetricPoint {
        MetricPoint {
            device_id:   device_id.to_string(),
            metric_type: metric_type.to_string(),
            value,
            timestamp:   Utc::now() - Duration::seconds(age_secs),
        }
    }

    #[test]
    fn window_stats_accumulate() {
        let mut agg = Aggregator::new(300);
        agg.process(&point_at("d1", "temperature", 10.0, 0));
        agg.process(&point_at("d1", "temperature", 20.0, 0));
        let snap = agg.process(&point_at("d1", "temperature", 30.0, 0));

        assert_eq!(snap.count, 3);
        assert!((snap.sum - 60.0).abs() < EPS);
        assert!((snap.mean - 20.0).abs() < EPS);
        assert_eq!(snap.min, 10.0);
        assert_eq!(snap.max, 30.0);
        assert!((snap.rate_per_second - 3.0 / 300.0).abs() < EPS);
    }

    #[test]
    fn readings_past_the_horizon_leave_the_window() {
        let mut agg = Aggregator::new(300);
        agg.process(&point_at("d1", "temperature", 99.0, 600));
        let snap = agg.process(&point_at("d1", "temperature", 5.0, 0));
        assert_eq!(snap.count, 1);
        assert!((snap.mean - 5.0).abs() < EPS);
        // Totals keep counting expired readings.
        assert_eq!(snap.total_readings, 2);
    }

    #[test]
    fn totals_span_devices_and_metrics() {
        let mut agg = Aggregator::new(300);
        agg.process(&point_at("d1", "temperature", 20.0, 0));
        agg.process(&point_at("d2", "temperature", 21.0, 0));
        let snap = agg.process(&point_at("d1", "humidity", 50.0, 0));

        assert_eq!(snap.total_readings, 1); // first humidity reading
        assert_eq!(snap.device_total_readings, 2); // d1 has two readings

        let summary = agg.summary();
        assert_eq!(summary.total_devices, 2);
        assert_eq!(summary.total_readings, 3);
        assert_eq!(summary.by_metric.get("temperature"), Some(&2));
        assert_eq!(summary.by_device.get("d1"), Some(&2));
    }

    #[test]
    fn windows_are_independent_per_series() {
        let mut agg = Aggregator::new(300);
        agg.process(&point_at("d1", "temperature", 20.0, 0));
        let snap = agg.process(&point_at("d2", "temperature", 80.0, 0));
        assert_eq!(snap.count, 1);
        assert!((snap.mean - 80.0).abs() < EPS);
    }

    #[test]
    fn reset_starts_cold() {
        let mut agg = Aggregator::new(300);
        agg.process(&point_at("d1", "temperature", 20.0, 0));
        agg.reset();
        let summary = agg.summary();
        assert_eq!(summary.total_devices, 0);
        assert_eq!(summary.total_readings, 0);
    }
}
