// gridwatch/src/config.rs
//
// Environment-driven settings shared by every role. A bad value is a
// fatal startup error; workers log it and exit non-zero rather than run
// half-configured.

use std::env;

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Settings {
    pub service_name:        String,
    pub brokers:             String,
    pub telemetry_topic:     String,
    pub alerts_topic:        String,
    /// Overrides the role's default consumer group when set.
    pub consumer_group:      Option<String>,
    pub database_url:        String,
    pub metrics_port:        u16,
    pub pushgateway_url:     String,
    pub log_level:           String,
    pub log_json:            bool,
    pub shutdown_grace_secs: u64,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!(
                "postgres://{}:{}@{}:{}/{}",
                env_or("DB_USER", "iot"),
                env_or("DB_PASSWORD", "iot"),
                env_or("DB_HOST", "localhost"),
                env_or("DB_PORT", "5432"),
                env_or("DB_NAME", "iot"),
            )
        });

        let metrics_port = env_or("METRICS_PORT", "8000")
            .parse::<u16>()
            .context("METRICS_PORT must be a port number")?;
        let shutdown_grace_secs = env_or("SHUTDOWN_GRACE_SECS", "30")
            .parse::<u64>()
            .context("SHUTDOWN_GRACE_SECS must be a number of seconds")?;

        Ok(Settings {
            service_name: env_or("SERVICE_NAME", "gridwatch"),
            brokers: env_or("KAFKA_BOOTSTRAP_SERVERS", "localhost:9092"),
            telemetry_topic: env_or("KAFKA_TELEMETRY_TOPIC", "iot.telemetry"),
            alerts_topic: env_or("KAFKA_ALERTS_TOPIC", "iot.alerts"),
            consumer_group: env::var("KAFKA_GROUP_ID").ok(),
            database_url,
            metrics_port,
            pushgateway_url: env_or("PUSHGATEWAY_URL", "http://localhost:9091"),
            log_level: env_or("LOG_LEVEL", "info"),
            log_json: env_or("LOG_FORMAT", "text") == "json",
            shutdown_grace_secs,
        })
    }

    /// The consumer group a worker joins: the env override when present,
    /// the role's default otherwise.
    pub fn group_id(&self, default: &str) -> String {
        self.consumer_group.clone().unwrap_or_else(|| default.to_string())
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
