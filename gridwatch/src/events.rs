// gridwatch/src/events.rs
//
// Shared domain types flowing through the fabric: telemetry readings as
// they travel the event log, the flattened scalar view the analytics
// pipelines consume, alerts, and per-sensor-type thresholds.
//
// Wire format is UTF-8 JSON with camelCase keys; timestamps are ISO-8601
// with a Z suffix. The log partitions both topics by deviceId, so every
// consumer sees one device's readings in order.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Sensor values ─────────────────────────────────────────────────────────────

/// Payload of one reading. Scalar sensors carry a single number under
/// either wire key (`value` or `reading`); vibration sensors carry a
/// 3-axis sample. Anything else is kept as a raw map so sensor-specific
/// extractors can still pick axes out of partial samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SensorValue {
    Vector { x: f64, y: f64, z: f64 },
    Scalar {
        #[serde(alias = "reading")]
        value: f64,
    },
    Other(serde_json::Map<String, serde_json::Value>),
}

impl SensorValue {
    /// Scalar interpretation. Vector and free-form payloads have none.
    pub fn scalar(&self) -> Option<f64> {
        match self {
            SensorValue::Scalar { value } => Some(*value),
            _ => None,
        }
    }

    /// Magnitude of the 3-axis sample; absent axes read as 0.
    pub fn magnitude(&self) -> f64 {
        let (x, y, z) = match self {
            SensorValue::Vector { x, y, z } => (*x, *y, *z),
            SensorValue::Other(map) => (axis(map, "x"), axis(map, "y"), axis(map, "z")),
            SensorValue::Scalar { .. } => (0.0, 0.0, 0.0),
        };
        (x * x + y * y + z * z).sqrt()
    }
}

fn axis(map: &serde_json::Map<String, serde_json::Value>, key: &str) -> f64 {
    map.get(key).and_then(serde_json::Value::as_f64).unwrap_or(0.0)
}

// ── Telemetry ─────────────────────────────────────────────────────────────────

/// One reading as published by the ingestion front-end.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Telemetry {
    pub device_id:   String,
    pub device_type: String,
    pub sensor_id:   String,
    pub sensor_type: String,
    pub timestamp:   DateTime<Utc>,
    pub unit:        String,
    pub value:       SensorValue,
}

impl Telemetry {
    /// Scalar value for scalar sensors. A reading has at most one scalar
    /// interpretation; vibration readings expose an RMS instead.
    pub fn scalar_value(&self) -> Option<f64> {
        self.value.scalar()
    }

    /// RMS over the 3-axis sample, for vibration sensors only.
    pub fn vibration_rms(&self) -> Option<f64> {
        if self.sensor_type != "vibration" {
            return None;
        }
        Some(self.value.magnitude())
    }

    /// The one scalar the detectors work with: RMS for vibration, the
    /// plain scalar otherwise. None means the reading carries nothing the
    /// analytics can use.
    pub fn metric_scalar(&self) -> Option<f64> {
        if self.sensor_type == "vibration" {
            self.vibration_rms()
        } else {
            self.scalar_value()
        }
    }

    /// Column form for the telemetry table.
    pub fn to_row(&self) -> TelemetryRow {
        TelemetryRow {
            time:        self.timestamp,
            device_id:   self.device_id.clone(),
            device_type: self.device_type.clone(),
            sensor_id:   self.sensor_id.clone(),
            sensor_type: self.sensor_type.clone(),
            unit:        self.unit.clone(),
            value:       serde_json::to_value(&self.value).unwrap_or(serde_json::Value::Null),
        }
    }
}

/// A reading flattened to the telemetry table's columns.
#[derive(Debug, Clone)]
pub struct TelemetryRow {
    pub time:        DateTime<Utc>,
    pub device_id:   String,
    pub device_type: String,
    pub sensor_id:   String,
    pub sensor_type: String,
    pub unit:        String,
    pub value:       serde_json::Value,
}

// ── Metric points ─────────────────────────────────────────────────────────────

/// Flattened scalar view of a reading, keyed the way the analytics
/// pipelines track state: one series per (device_id, metric_type).
#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
    pub device_id:   String,
    pub metric_type: String,
    pub value:       f64,
    pub timestamp:   DateTime<Utc>,
}

impl MetricPoint {
    /// Flatten a raw wire reading. A malformed or missing timestamp falls
    /// back to the processing instant; readings with no scalar
    /// interpretation return None and are dropped by the caller.
    pub fn from_json(raw: &serde_json::Value) -> Option<MetricPoint> {
        let device_id = raw.get("deviceId")?.as_str()?.to_string();
        let metric_type = raw.get("sensorType")?.as_str()?.to_string();
        let sensor_value: SensorValue = serde_json::from_value(raw.get("value")?.clone()).ok()?;

        let value = if metric_type == "vibration" {
            sensor_value.magnitude()
        } else {
            sensor_value.scalar()?
        };

        let timestamp = raw
            .get("timestamp")
            .and_then(serde_json::Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Some(MetricPoint { device_id, metric_type, value, timestamp })
    }
}

// ── Alerts ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alert categories raised by the stream worker and the anomaly pipeline.
/// Rule-engine alerts use their rule name as the type instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    ThresholdBreach,
    RapidChange,
    StuckSensor,
    StatisticalAnomaly,
    AbsoluteBoundViolation,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::ThresholdBreach => "threshold_breach",
            AlertKind::RapidChange => "rapid_change",
            AlertKind::StuckSensor => "stuck_sensor",
            AlertKind::StatisticalAnomaly => "statistical_anomaly",
            AlertKind::AbsoluteBoundViolation => "absolute_bound_violation",
        }
    }
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One alert on the alerts topic. Identity is (alert_id, created_at);
/// the persistence worker upserts on that pair, which neutralizes
/// at-least-once duplicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub alert_id:    String,
    pub device_id:   String,
    pub device_type: String,
    pub alert_type:  String,
    pub severity:    Severity,
    pub message:     String,
    #[serde(default)]
    pub threshold:   Option<f64>,
    #[serde(default)]
    pub value:       Option<f64>,
    pub created_at:  DateTime<Utc>,
}

// ── Thresholds ────────────────────────────────────────────────────────────────

/// Per-(device_type, sensor_type) bound set with two severity levels.
/// All four bounds are independent and optional; zero is a valid bound.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Threshold {
    pub sensor_type:   String,
    pub device_type:   Option<String>,
    pub warning_low:   Option<f64>,
    pub warning_high:  Option<f64>,
    pub critical_low:  Option<f64>,
    pub critical_high: Option<f64>,
}

impl Threshold {
    /// Two-level check; critical supersedes warning when both would fire.
    /// Comparison is strict: a value exactly at a bound does not breach.
    pub fn check(&self, value: f64) -> Option<(AlertKind, Severity)> {
        if self.critical_high.is_some_and(|h| value > h) {
            return Some((AlertKind::ThresholdBreach, Severity::Critical));
        }
        if self.critical_low.is_some_and(|l| value < l) {
            return Some((AlertKind::ThresholdBreach, Severity::Critical));
        }
        if self.warning_high.is_some_and(|h| value > h) {
            return Some((AlertKind::ThresholdBreach, Severity::Warning));
        }
        if self.warning_low.is_some_and(|l| value < l) {
            return Some((AlertKind::ThresholdBreach, Severity::Warning));
        }
        None
    }

    /// The bound a breach alert reports, in fixed precedence order.
    pub fn limit(&self) -> Option<f64> {
        self.critical_high
            .or(self.warning_high)
            .or(self.critical_low)
            .or(self.warning_low)
    }
}

/// Threshold table keyed by (device_type, sensor_type); the device_type
/// slot is None for fleet-wide defaults.
pub type ThresholdMap = HashMap<(Option<String>, String), Threshold>;

/// Lookup with (device_type, sensor_type) taking precedence over the
/// sensor-type-only default.
pub fn lookup_threshold<'a>(
    map: &'a ThresholdMap,
    device_type: &str,
    sensor_type: &str,
) -> Option<&'a Threshold> {
    map.get(&(Some(device_type.to_string()), sensor_type.to_string()))
        .or_else(|| map.get(&(None, sensor_type.to_string())))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reading(sensor_type: &str, value: serde_json::Value) -> Telemetry {
        serde_json::from_value(json!({
            "deviceId": "d1",
            "deviceType": "hvac",
            "sensorId": "s1",
            "sensorType": sensor_type,
            "timestamp": "2024-01-15T10:30:00Z",
            "unit": "c",
            "value": value,
        }))
        .expect("valid reading")
    }

    #[test]
    fn parses_wire_telemetry() {
        let t = reading("temperature", json!({"value": 25.5}));
        assert_eq!(t.device_id, "d1");
        assert_eq!(t.sensor_type, "temperature");
        assert_eq!(t.scalar_value(), Some(25.5));
        assert_eq!(t.timestamp.to_rfc3339(), "2024-01-15T10:30:00+00:00");
    }

    #[test]
    fn scalar_accepts_reading_key() {
        let t = reading("power", json!({"reading": 7.0}));
        assert_eq!(t.scalar_value(), Some(7.0));
    }

    #[test]
    fn vibration_rms_is_vector_magnitude() {
        let t = reading("vibration", json!({"x": 3, "y": 4, "z": 0}));
        assert_eq!(t.vibration_rms(), Some(5.0));
        assert_eq!(t.scalar_value(), None);
    }

    #[test]
    fn vibration_rms_defaults_missing_axes() {
        let t = reading("vibration", json!({"x": 1}));
        assert_eq!(t.vibration_rms(), Some(1.0));
    }

    #[test]
    fn vibration_rms_requires_vibration_sensor() {
        let t = reading("temperature", json!({"value": 25.0}));
        assert_eq!(t.vibration_rms(), None);
    }

    #[test]
    fn to_row_keeps_the_value_payload() {
        let t = reading("pressure", json!({"value": 5.5}));
        let row = t.to_row();
        assert_eq!(row.device_type, "hvac");
        assert_eq!(row.value, json!({"value": 5.5}));
    }

    #[test]
    fn metric_point_flattens_vibration() {
        let raw = json!({
            "deviceId": "d1",
            "deviceType": "motor",
            "sensorId": "vib-01",
            "sensorType": "vibration",
            "timestamp": "2024-01-15T10:30:00Z",
            "unit": "g",
            "value": {"x": 3, "y": 4, "z": 0},
        });
        let point = MetricPoint::from_json(&raw).expect("point");
        assert_eq!(point.value, 5.0);
        assert_eq!(point.metric_type, "vibration");
    }

    #[test]
    fn metric_point_falls_back_on_bad_timestamp() {
        let before = Utc::now();
        let raw = json!({
            "deviceId": "d1",
            "sensorType": "temperature",
            "timestamp": "not-a-time",
            "value": {"value": 20.0},
        });
        let point = MetricPoint::from_json(&raw).expect("point");
        assert!(point.timestamp >= before);
    }

    #[test]
    fn metric_point_drops_nonscalar_readings() {
        let raw = json!({
            "deviceId": "d1",
            "sensorType": "temperature",
            "value": {"state": "open"},
        });
        assert!(MetricPoint::from_json(&raw).is_none());
    }

    #[test]
    fn threshold_check_levels() {
        let t = Threshold {
            sensor_type:   "temperature".into(),
            device_type:   Some("hvac".into()),
            warning_low:   Some(10.0),
            warning_high:  Some(30.0),
            critical_low:  Some(0.0),
            critical_high: Some(40.0),
        };
        assert_eq!(t.check(45.0), Some((AlertKind::ThresholdBreach, Severity::Critical)));
        assert_eq!(t.check(35.0), Some((AlertKind::ThresholdBreach, Severity::Warning)));
        assert_eq!(t.check(5.0), Some((AlertKind::ThresholdBreach, Severity::Warning)));
        assert_eq!(t.check(20.0), None);
        // A zero-valued critical bound is still a bound.
        assert_eq!(t.check(-5.0), Some((AlertKind::ThresholdBreach, Severity::Critical)));
    }

    #[test]
    fn threshold_check_is_strict_at_the_bound() {
        let t = Threshold {
            sensor_type:  "pressure".into(),
            warning_high: Some(80.0),
            ..Default::default()
        };
        assert_eq!(t.check(80.0), None);
        assert_eq!(t.check(80.1), Some((AlertKind::ThresholdBreach, Severity::Warning)));
    }

    #[test]
    fn threshold_partial_bounds() {
        let t = Threshold {
            sensor_type:   "humidity".into(),
            warning_high:  Some(80.0),
            critical_high: Some(95.0),
            ..Default::default()
        };
        assert_eq!(t.check(50.0), None);
        assert_eq!(t.check(85.0), Some((AlertKind::ThresholdBreach, Severity::Warning)));
        assert_eq!(t.check(98.0), Some((AlertKind::ThresholdBreach, Severity::Critical)));
        assert_eq!(t.limit(), Some(95.0));
    }

    #[test]
    fn threshold_lookup_prefers_device_type() {
        let mut map = ThresholdMap::new();
        map.insert(
            (Some("hvac".into()), "temperature".into()),
            Threshold { sensor_type: "temperature".into(), device_type: Some("hvac".into()), critical_high: Some(40.0), ..Default::default() },
        );
        map.insert(
            (None, "temperature".into()),
            Threshold { sensor_type: "temperature".into(), critical_high: Some(60.0), ..Default::default() },
        );

        let hvac = lookup_threshold(&map, "hvac", "temperature").expect("hvac threshold");
        assert_eq!(hvac.critical_high, Some(40.0));

        let pump = lookup_threshold(&map, "pump", "temperature").expect("default threshold");
        assert_eq!(pump.critical_high, Some(60.0));

        assert!(lookup_threshold(&map, "pump", "humidity").is_none());
    }

    #[test]
    fn alert_wire_roundtrip() {
        let wire = json!({
            "alertId": "a-1",
            "deviceId": "d1",
            "deviceType": "hvac",
            "alertType": "threshold_breach",
            "severity": "critical",
            "message": "too hot",
            "threshold": 40.0,
            "value": 45.0,
            "createdAt": "2024-01-15T10:30:00Z",
        });
        let alert: Alert = serde_json::from_value(wire).expect("alert");
        assert_eq!(alert.severity, Severity::Critical);
        assert_eq!(alert.created_at.to_rfc3339(), "2024-01-15T10:30:00+00:00");

        let back = serde_json::to_value(&alert).expect("json");
        assert_eq!(back.get("alertId").and_then(|v| v.as_str()), Some("a-1"));
        assert_eq!(back.get("createdAt").and_then(|v| v.as_str()), Some("2024-01-15T10:30:00Z"));
    }
}
