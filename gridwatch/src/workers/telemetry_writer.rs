// gridwatch/src/workers/telemetry_writer.rs
//
// Telemetry persistence worker: telemetry topic -> telemetry table, in
// batches. A batch flushes at BATCH_SIZE rows or FLUSH_INTERVAL after
// the previous flush, whichever comes first; each flush is one
// transaction. Offsets commit only after a flush lands (Hold until
// then), so a rolled-back batch is redelivered whole.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use tracing::info;

use crate::broker::StartFrom;
use crate::config::Settings;
use crate::db;
use crate::error::ProcessingError;
use crate::events::{Telemetry, TelemetryRow};
use crate::metrics::Metrics;
use crate::runtime::{Disposition, PipelineWorker, WorkerContext, WorkerSpec};

pub const BATCH_SIZE: usize = 100;
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

// ── Batch buffer ──────────────────────────────────────────────────────────────

/// The size-or-age flush policy, separated from I/O. Rows stay in the
/// buffer until a flush succeeds, so a failed flush retries the same
/// batch.
pub struct TelemetryBuffer {
    rows:           Vec<TelemetryRow>,
    last_flush:     Instant,
    batch_size:     usize,
    flush_interval: Duration,
}

impl TelemetryBuffer {
    pub fn new(batch_size: usize, flush_interval: Duration) -> Self {
        Self {
            rows: Vec::new(),
            last_flush: Instant::now(),
            batch_size,
            flush_interval,
        }
    }

    pub fn push(&mut self, row: TelemetryRow) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[TelemetryRow] {
        &self.rows
    }

    /// Size-or-age trigger. An empty buffer never flushes; the age clock
    /// restarts on every successful flush.
    pub fn should_flush(&self) -> bool {
        !self.rows.is_empty()
            && (self.rows.len() >= self.batch_size
                || self.last_flush.elapsed() >= self.flush_interval)
    }

    pub fn mark_flushed(&mut self) {
        self.rows.clear();
        self.last_flush = Instant::now();
    }
}

// ── Worker ────────────────────────────────────────────────────────────────────

pub struct TelemetryWriterWorker {
    spec:   WorkerSpec,
    buffer: TelemetryBuffer,
    pool:   Option<PgPool>,
}

impl TelemetryWriterWorker {
    pub fn new(settings: &Settings) -> Self {
        Self {
            spec: WorkerSpec {
                name:          "telemetry-worker",
                topic:         settings.telemetry_topic.clone(),
                group_id:      settings.group_id("telemetry-worker"),
                metrics_port:  settings.metrics_port,
                start_from:    StartFrom::Committed,
                filter_field:  None,
                filter_values: None,
                min_replicas:  1,
                max_replicas:  5,
                lag_threshold: 200,
            },
            buffer: TelemetryBuffer::new(BATCH_SIZE, FLUSH_INTERVAL),
            pool:   None,
        }
    }

    /// One transaction for the whole buffer; rows and counters only move
    /// after the store confirms the commit.
    async fn flush(&mut self, metrics: &Metrics) -> Result<usize, ProcessingError> {
        if self.buffer.is_empty() {
            return Ok(0);
        }
        let pool = self
            .pool
            .as_ref()
            .ok_or(ProcessingError::Internal("store pool"))?;

        db::insert_telemetry_batch(pool, self.buffer.rows()).await?;

        for row in self.buffer.rows() {
            metrics
                .telemetry_stored
                .with_label_values(&[&row.device_type])
                .inc();
        }
        let stored = self.buffer.len();
        self.buffer.mark_flushed();
        Ok(stored)
    }
}

#[async_trait]
impl PipelineWorker for TelemetryWriterWorker {
    fn spec(&self) -> &WorkerSpec {
        &self.spec
    }

    fn spec_mut(&mut self) -> &mut WorkerSpec {
        &mut self.spec
    }

    async fn setup(&mut self, ctx: &WorkerContext) -> Result<()> {
        self.pool = Some(db::connect(&ctx.settings).await?);
        Ok(())
    }

    async fn process(
        &mut self,
        raw: &Value,
        ctx: &WorkerContext,
    ) -> Result<Disposition, ProcessingError> {
        let reading: Telemetry = serde_json::from_value(raw.clone())?;
        ctx.metrics
            .telemetry_received
            .with_label_values(&[&reading.device_type, &reading.sensor_type])
            .inc();
        self.buffer.push(reading.to_row());

        if self.buffer.should_flush() {
            let stored = self.flush(&ctx.metrics).await?;
            info!(count = stored, "stored batch");
            return Ok(Disposition::Commit);
        }
        Ok(Disposition::Hold)
    }

    async fn tick(&mut self, ctx: &WorkerContext) -> Result<Disposition, ProcessingError> {
        if self.buffer.should_flush() {
            let stored = self.flush(&ctx.metrics).await?;
            info!(count = stored, "stored batch");
            return Ok(Disposition::Commit);
        }
        Ok(Disposition::Hold)
    }

    async fn teardown(&mut self, ctx: &WorkerContext) -> Result<()> {
        let stored = self
            .flush(&ctx.metrics)
            .await
            .context("final flush failed")?;
        if stored > 0 {
            info!(count = stored, "stored final batch");
        }
        if let Some(pool) = self.pool.take() {
            pool.close().await;
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
