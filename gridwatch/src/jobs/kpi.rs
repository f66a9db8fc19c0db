// gridwatch/src/jobs/kpi.rs
//
// Watermark-driven KPI batch job over persisted telemetry.
//
// Window contract: rows strictly in (watermark, now]. The watermark only
// advances to the max observed row time after every upsert has landed;
// a failed run leaves it unchanged and the next run reprocesses the
// window, with the (device_id, kpi_name, window_start) conflict key
// keeping the rerun idempotent.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::info;

use crate::config::Settings;
use crate::db::{self, KpiRow};
use crate::metrics::Metrics;

pub const JOB_NAME: &str = "kpi_5min";

// ── Pure computation ──────────────────────────────────────────────────────────

/// Scalar interpretation of a persisted value payload: vibration rows
/// collapse to their 3-axis RMS (absent axes read as 0), everything else
/// reads the `value` key. None means the row contributes nothing.
pub fn extract_value(value: &serde_json::Value, sensor_type: &str) -> Option<f64> {
    if sensor_type == "vibration" {
        let axis = |key: &str| value.get(key).and_then(serde_json::Value::as_f64).unwrap_or(0.0);
        let (x, y, z) = (axis("x"), axis("y"), axis("z"));
        return Some((x * x + y * y + z * z).sqrt());
    }
    value.get("value").and_then(serde_json::Value::as_f64)
}

/// KPI set for one sensor group, in upsert order. std_dev is the sample
/// standard deviation and needs two values, as does range; the
/// sensor-specific KPIs follow the fleet's conventions (vibration RMS
/// and crest factor, temperature first-to-last drift, power energy sum).
pub fn compute_kpis(values: &[f64], sensor_type: &str) -> Vec<(&'static str, f64)> {
    if values.is_empty() {
        return Vec::new();
    }
    let n = values.len() as f64;
    let sum: f64 = values.iter().sum();
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    let mut kpis = vec![
        ("avg", sum / n),
        ("min", min),
        ("max", max),
        ("count", values.len() as f64),
    ];

    if values.len() >= 2 {
        kpis.push(("std_dev", sample_std(values)));
        kpis.push(("range", max - min));
    }

    if sensor_type == "vibration" {
        let rms = (values.iter().map(|v| v * v).sum::<f64>() / n).sqrt();
        kpis.push(("rms", rms));
        if rms > 0.0 {
            let peak = values.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
            kpis.push(("crest_factor", peak / rms));
        }
    }

    if sensor_type == "temperature" && values.len() >= 2 {
        kpis.push(("rate_of_change", values[values.len() - 1] - values[0]));
    }

    if sensor_type == "power" {
        kpis.push(("energy", sum));
    }

    kpis
}

fn sample_std(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
}

// ── Runner ────────────────────────────────────────────────────────────────────

pub async fn run(settings: &Settings, metrics: &Arc<Metrics>) -> Result<()> {
    let timer = metrics.kpi_job_duration.start_timer();
    let pool = db::connect(settings).await?;

    let watermark = db::fetch_watermark(&pool, JOB_NAME).await?;
    let now = Utc::now();
    info!(from = %watermark, to = %now, "processing window");

    let rows = db::fetch_telemetry_window(&pool, watermark, now).await?;
    if rows.is_empty() {
        info!("no new telemetry");
        timer.observe_duration();
        return Ok(());
    }

    // Group scalars by sensor; track the window's max row time, which
    // becomes both window_end and the next watermark.
    let mut groups: BTreeMap<(String, String, String, String), Vec<f64>> = BTreeMap::new();
    let mut max_time = watermark;
    for row in &rows {
        if let Some(value) = extract_value(&row.value, &row.sensor_type) {
            groups
                .entry((
                    row.device_id.clone(),
                    row.device_type.clone(),
                    row.sensor_id.clone(),
                    row.sensor_type.clone(),
                ))
                .or_default()
                .push(value);
        }
        if row.time > max_time {
            max_time = row.time;
        }
    }

    let mut kpi_count = 0u64;
    for ((device_id, device_type, _sensor_id, sensor_type), values) in &groups {
        for (kpi_name, kpi_value) in compute_kpis(values, sensor_type) {
            let full_name = format!("{sensor_type}_{kpi_name}");
            db::upsert_kpi(
                &pool,
                &KpiRow {
                    created_at:   now,
                    device_id:    device_id.clone(),
                    device_type:  device_type.clone(),
                    kpi_name:     full_name.clone(),
                    kpi_value,
                    unit:         None,
                    window_start: watermark,
                    window_end:   max_time,
                    sample_count: values.len() as i64,
                },
            )
            .await
            .with_context(|| format!("failed to upsert {full_name}"))?;
            metrics.kpis_computed.with_label_values(&[&full_name]).inc();
            kpi_count += 1;
        }
    }

    // Every upsert landed; only now does the window move forward.
    db::advance_watermark(&pool, JOB_NAME, max_time).await?;
    timer.observe_duration();

    info!(
        kpis_computed = kpi_count,
        readings_processed = rows.len(),
        devices = groups.len(),
        "job completed",
    );
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const EPS: f64 = 1e-3;

    fn kpi(kpis: &[(&'static str, f64)], name: &str) -> Option<f64> {
        kpis.iter().find(|(n, _)| *n == name).map(|(_, v)| *v)
    }

    #[test]
    fn extracts_scalar_values() {
        assert_eq!(extract_value(&json!({"value": 42.5}), "temperature"), Some(42.5));
        assert_eq!(extract_value(&json!({"value": 100}), "power"), Some(100.0));
    }

    #[test]
    fn extracts_vibration_rms() {
        assert_eq!(extract_value(&json!({"x": 3, "y": 4, "z": 0}), "vibration"), Some(5.0));
        assert_eq!(extract_value(&json!({"x": 1, "y": 2, "z": 2}), "vibration"), Some(3.0));
    }

    #[test]
    fn missing_value_key_is_skipped() {
        assert_eq!(extract_value(&json!({"x": 1}), "temperature"), None);
    }

    #[test]
    fn basic_stats() {
        let kpis = compute_kpis(&[10.0, 20.0, 30.0, 40.0, 50.0], "pressure");
        assert_eq!(kpi(&kpis, "avg"), Some(30.0));
        assert_eq!(kpi(&kpis, "min"), Some(10.0));
        assert_eq!(kpi(&kpis, "max"), Some(50.0));
        assert_eq!(kpi(&kpis, "count"), Some(5.0));
        assert_eq!(kpi(&kpis, "range"), Some(40.0));
    }

    #[test]
    fn empty_group_yields_nothing() {
        assert!(compute_kpis(&[], "temperature").is_empty());
    }

    #[test]
    fn single_value_skips_spread_kpis() {
        let kpis = compute_kpis(&[42.0], "temperature");
        assert_eq!(kpi(&kpis, "avg"), Some(42.0));
        assert_eq!(kpi(&kpis, "count"), Some(1.0));
        assert!(kpi(&kpis, "std_dev").is_none());
        assert!(kpi(&kpis, "range").is_none());
        assert!(kpi(&kpis, "rate_of_change").is_none());
    }

    #[test]
    fn sample_std_dev() {
        let kpis = compute_kpis(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0], "pressure");
        let std = kpi(&kpis, "std_dev").expect("std_dev");
        assert!((std - 2.138).abs() < EPS);
    }

    #[test]
    fn vibration_rms_and_crest_factor() {
        // RMS of [1..5] is sqrt(55/5) = sqrt(11); crest factor 5/rms.
        let kpis = compute_kpis(&[1.0, 2.0, 3.0, 4.0, 5.0], "vibration");
        let rms = kpi(&kpis, "rms").expect("rms");
        let crest = kpi(&kpis, "crest_factor").expect("crest_factor");
        let std = kpi(&kpis, "std_dev").expect("std_dev");
        assert!((rms - 3.3166).abs() < EPS);
        assert!((crest - 1.5076).abs() < EPS);
        assert!((std - 1.5811).abs() < EPS);
    }

    #[test]
    fn all_zero_vibration_has_no_crest_factor() {
        let kpis = compute_kpis(&[0.0, 0.0, 0.0], "vibration");
        assert_eq!(kpi(&kpis, "rms"), Some(0.0));
        assert!(kpi(&kpis, "crest_factor").is_none());
    }

    #[test]
    fn temperature_rate_of_change_is_first_to_last() {
        let kpis = compute_kpis(&[20.0, 22.0, 25.0, 28.0, 35.0], "temperature");
        assert_eq!(kpi(&kpis, "rate_of_change"), Some(15.0));
    }

    #[test]
    fn power_energy_is_the_sum() {
        let kpis = compute_kpis(&[100.0, 150.0, 200.0], "power");
        assert_eq!(kpi(&kpis, "energy"), Some(450.0));
    }

    #[test]
    fn kpi_order_is_stable_for_upserts() {
        let names: Vec<&str> = compute_kpis(&[1.0, 2.0], "vibration")
            .iter()
            .map(|(name, _)| *name)
            .collect();
        assert_eq!(
            names,
            vec!["avg", "min", "max", "count", "std_dev", "range", "rms", "crest_factor"],
        );
    }
}
