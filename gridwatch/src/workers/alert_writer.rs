// gridwatch/src/workers/alert_writer.rs
//
// Alert persistence worker: alerts topic -> alerts table. The upsert on
// (alert_id, created_at) makes the at-least-once redelivery a no-op, so
// a store failure can safely hold the offset for another pass.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use tracing::info;

use crate::broker::StartFrom;
use crate::config::Settings;
use crate::db;
use crate::error::ProcessingError;
use crate::events::Alert;
use crate::runtime::{Disposition, PipelineWorker, WorkerContext, WorkerSpec};

pub struct AlertWriterWorker {
    spec: WorkerSpec,
    pool: Option<PgPool>,
}

impl AlertWriterWorker {
    pub fn new(settings: &Settings) -> Self {
        Self {
            spec: WorkerSpec {
                name:          "alert-worker",
                topic:         settings.alerts_topic.clone(),
                group_id:      settings.group_id("alert-worker"),
                metrics_port:  settings.metrics_port,
                start_from:    StartFrom::Committed,
                filter_field:  None,
                filter_values: None,
                // Always keep one replica; alerts should never wait on a
                // scale-from-zero.
                min_replicas:  1,
                max_replicas:  3,
                lag_threshold: 100,
            },
            pool: None,
        }
    }
}

#[async_trait]
impl PipelineWorker for AlertWriterWorker {
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
        let pool = self
            .pool
            .as_ref()
            .ok_or(ProcessingError::Internal("store pool"))?;

        let alert: Alert = serde_json::from_value(raw.clone())?;
        db::upsert_alert(pool, &alert).await?;

        ctx.metrics
            .alerts_stored
            .with_label_values(&[&alert.alert_type, alert.severity.as_str()])
            .inc();
        ctx.metrics
            .alerts_active
            .with_label_values(&[&alert.device_id, &alert.alert_type])
            .set(1.0);
        info!(
            alert_id = %alert.alert_id,
            device_id = %alert.device_id,
            alert_type = %alert.alert_type,
            severity = alert.severity.as_str(),
            "alert stored",
        );
        Ok(Disposition::Commit)
    }

    async fn teardown(&mut self, _ctx: &WorkerContext) -> Result<()> {
        if let Some(pool) = self.pool.take() {
            pool.close().await;
        }
        Ok(())
    }
}
