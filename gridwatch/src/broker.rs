// gridwatch/src/broker.rs
//
// Typed consumer/producer over the partitioned event log.
//
// Message format: UTF-8 JSON, no schema registry dependency.
// Key: device id, which pins one device's records to one partition and
// preserves their order for whichever replica owns that partition.
//
// Auto-commit stays off. The worker runtime commits explicitly after a
// message has been handled, so a failed handler leaves the offset in
// place and the log redelivers after a restart or rebalance.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::message::BorrowedMessage;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Offset, TopicPartitionList};
use serde::Serialize;
use tracing::info;

use crate::error::ProcessingError;

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

// ── Start-from policy ─────────────────────────────────────────────────────────

/// Where a consumer group starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFrom {
    /// Replay the topic from the beginning.
    Earliest,
    /// New messages only.
    Latest,
    /// Resume from committed offsets; a group without any replays.
    Committed,
}

impl StartFrom {
    /// The broker-level reset policy. A group with committed offsets
    /// resumes from them regardless of this setting; it only applies to
    /// fresh groups.
    pub fn auto_offset_reset(self) -> &'static str {
        match self {
            StartFrom::Latest => "latest",
            StartFrom::Earliest | StartFrom::Committed => "earliest",
        }
    }
}

// ── Consumer ──────────────────────────────────────────────────────────────────

pub struct LogConsumer {
    inner: StreamConsumer,
    topic: String,
}

impl LogConsumer {
    pub fn connect(
        brokers: &str,
        topic: &str,
        group_id: &str,
        start_from: StartFrom,
    ) -> Result<Self> {
        let inner: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", start_from.auto_offset_reset())
            .create()
            .context("failed to create event log consumer")?;
        inner
            .subscribe(&[topic])
            .with_context(|| format!("failed to subscribe to {topic}"))?;
        info!(topic, group = group_id, "consumer subscribed");
        Ok(Self { inner, topic: topic.to_string() })
    }

    pub async fn recv(&self) -> KafkaResult<BorrowedMessage<'_>> {
        self.inner.recv().await
    }

    /// Commit everything up to and including the given per-partition
    /// offsets.
    pub fn commit(&self, positions: &HashMap<i32, i64>) -> KafkaResult<()> {
        let mut tpl = TopicPartitionList::new();
        for (&partition, &offset) in positions {
            tpl.add_partition_offset(&self.topic, partition, Offset::Offset(offset + 1))?;
        }
        self.inner.commit(&tpl, CommitMode::Async)
    }
}

// ── Producer ──────────────────────────────────────────────────────────────────

pub struct LogProducer {
    inner: FutureProducer,
}

impl LogProducer {
    pub fn connect(brokers: &str) -> Result<Self> {
        let inner: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .create()
            .context("failed to create event log producer")?;
        Ok(Self { inner })
    }

    /// Publish one JSON message under the given partition key and wait
    /// for the broker acknowledgement.
    pub async fn send_json<T: Serialize>(
        &self,
        topic: &str,
        key: &str,
        value: &T,
    ) -> Result<(), ProcessingError> {
        let payload = serde_json::to_vec(value)
            .map_err(|e| ProcessingError::Publish(e.to_string()))?;
        self.inner
            .send(FutureRecord::to(topic).key(key).payload(&payload), SEND_TIMEOUT)
            .await
            .map_err(|(e, _): (KafkaError, _)| ProcessingError::Publish(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_from_maps_to_reset_policy() {
        assert_eq!(StartFrom::Earliest.auto_offset_reset(), "earliest");
        assert_eq!(StartFrom::Latest.auto_offset_reset(), "latest");
        // Committed groups resume from their offsets; the earliest reset
        // only kicks in for a brand-new group.
        assert_eq!(StartFrom::Committed.auto_offset_reset(), "earliest");
    }
}
