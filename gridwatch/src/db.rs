// gridwatch/src/db.rs
//
// Time-series store client: thin typed wrappers over the SQL contracts.
// One PgPool per process; the batched telemetry insert runs in a single
// transaction so a failed flush rolls back whole and the consumer keeps
// the batch's offsets.
//
// Idempotence lives in the conflict keys: alerts upsert on
// (alert_id, created_at), KPI rows on (device_id, kpi_name, window_start).

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use crate::config::Settings;
use crate::events::{Alert, TelemetryRow, Threshold, ThresholdMap};

pub async fn connect(settings: &Settings) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(4)
        .connect(&settings.database_url)
        .await
        .context("failed to connect to the time-series store")
}

// ── Thresholds ────────────────────────────────────────────────────────────────

/// Load the threshold table keyed for the (device_type, sensor_type)
/// precedence lookup. Loaded once at worker startup.
pub async fn load_thresholds(pool: &PgPool) -> Result<ThresholdMap> {
    let rows = sqlx::query(
        "SELECT sensor_type, device_type, warning_low, warning_high, critical_low, critical_high
         FROM thresholds",
    )
    .fetch_all(pool)
    .await?;

    let mut map = HashMap::new();
    for row in rows {
        let threshold = Threshold {
            sensor_type:   row.try_get("sensor_type")?,
            device_type:   row.try_get("device_type")?,
            warning_low:   row.try_get("warning_low")?,
            warning_high:  row.try_get("warning_high")?,
            critical_low:  row.try_get("critical_low")?,
            critical_high: row.try_get("critical_high")?,
        };
        map.insert(
            (threshold.device_type.clone(), threshold.sensor_type.clone()),
            threshold,
        );
    }
    Ok(map)
}

// ── Alerts ────────────────────────────────────────────────────────────────────

pub async fn upsert_alert(pool: &PgPool, alert: &Alert) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO alerts
             (created_at, alert_id, device_id, device_type, alert_type, severity, message, threshold, value)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
         ON CONFLICT (alert_id, created_at) DO UPDATE SET
             device_id   = EXCLUDED.device_id,
             device_type = EXCLUDED.device_type,
             alert_type  = EXCLUDED.alert_type,
             severity    = EXCLUDED.severity,
             message     = EXCLUDED.message,
             threshold   = EXCLUDED.threshold,
             value       = EXCLUDED.value",
    )
    .bind(alert.created_at)
    .bind(&alert.alert_id)
    .bind(&alert.device_id)
    .bind(&alert.device_type)
    .bind(&alert.alert_type)
    .bind(alert.severity.as_str())
    .bind(&alert.message)
    .bind(alert.threshold)
    .bind(alert.value)
    .execute(pool)
    .await?;
    Ok(())
}

// ── Telemetry ─────────────────────────────────────────────────────────────────

/// Insert a batch of readings in one transaction.
pub async fn insert_telemetry_batch(
    pool: &PgPool,
    rows: &[TelemetryRow],
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    for row in rows {
        sqlx::query(
            "INSERT INTO telemetry (time, device_id, device_type, sensor_id, sensor_type, unit, value)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(row.time)
        .bind(&row.device_id)
        .bind(&row.device_type)
        .bind(&row.sensor_id)
        .bind(&row.sensor_type)
        .bind(&row.unit)
        .bind(&row.value)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// One persisted reading inside a KPI window.
#[derive(Debug, Clone)]
pub struct TelemetrySample {
    pub device_id:   String,
    pub device_type: String,
    pub sensor_id:   String,
    pub sensor_type: String,
    pub time:        DateTime<Utc>,
    pub value:       serde_json::Value,
}

/// Readings strictly inside (from, to], ordered so each series arrives
/// contiguously and in time order.
pub async fn fetch_telemetry_window(
    pool: &PgPool,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<TelemetrySample>> {
    let rows = sqlx::query(
        "SELECT device_id, device_type, sensor_id, sensor_type, time, value
         FROM telemetry
         WHERE time > $1 AND time <= $2
         ORDER BY device_id, sensor_id, time",
    )
    .bind(from)
    .bind(to)
    .fetch_all(pool)
    .await?;

    let mut samples = Vec::with_capacity(rows.len());
    for row in rows {
        samples.push(TelemetrySample {
            device_id:   row.try_get("device_id")?,
            device_type: row.try_get("device_type")?,
            sensor_id:   row.try_get("sensor_id")?,
            sensor_type: row.try_get("sensor_type")?,
            time:        row.try_get("time")?,
            value:       row.try_get("value")?,
        });
    }
    Ok(samples)
}

// ── Watermarks ────────────────────────────────────────────────────────────────

/// Last processed instant for a job; the epoch before the first run.
pub async fn fetch_watermark(pool: &PgPool, job_name: &str) -> Result<DateTime<Utc>> {
    let row = sqlx::query("SELECT last_processed_at FROM job_watermarks WHERE job_name = $1")
        .bind(job_name)
        .fetch_optional(pool)
        .await?;
    Ok(match row {
        Some(row) => row.try_get("last_processed_at")?,
        None => DateTime::<Utc>::UNIX_EPOCH,
    })
}

pub async fn advance_watermark(
    pool: &PgPool,
    job_name: &str,
    ts: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO job_watermarks (job_name, last_processed_at, updated_at)
         VALUES ($1, $2, NOW())
         ON CONFLICT (job_name) DO UPDATE SET
             last_processed_at = EXCLUDED.last_processed_at,
             updated_at        = NOW()",
    )
    .bind(job_name)
    .bind(ts)
    .execute(pool)
    .await?;
    Ok(())
}

// ── KPIs ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct KpiRow {
    pub created_at:   DateTime<Utc>,
    pub device_id:    String,
    pub device_type:  String,
    pub kpi_name:     String,
    pub kpi_value:    f64,
    pub unit:         Option<String>,
    pub window_start: DateTime<Utc>,
    pub window_end:   DateTime<Utc>,
    pub sample_count: i64,
}

pub async fn upsert_kpi(pool: &PgPool, row: &KpiRow) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO kpis
             (created_at, device_id, device_type, kpi_name, kpi_value, unit, window_start, window_end, sample_count)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
         ON CONFLICT (device_id, kpi_name, window_start) DO UPDATE SET
             created_at   = EXCLUDED.created_at,
             device_type  = EXCLUDED.device_type,
             kpi_value    = EXCLUDED.kpi_value,
             unit         = EXCLUDED.unit,
             window_end   = EXCLUDED.window_end,
             sample_count = EXCLUDED.sample_count",
    )
    .bind(row.created_at)
    .bind(&row.device_id)
    .bind(&row.device_type)
    .bind(&row.kpi_name)
    .bind(row.kpi_value)
    .bind(&row.unit)
    .bind(row.window_start)
    .bind(row.window_end)
    .bind(row.sample_count)
    .execute(pool)
    .await?;
    Ok(())
}
