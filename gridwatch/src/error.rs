// gridwatch/src/error.rs
//
// Error taxonomy for the per-message path. The class decides what the
// runtime does with the offset: malformed records are counted and skipped
// (they never become processable), everything else holds the offset so
// the log redelivers after a restart or rebalance.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("malformed record: {0}")]
    Malformed(String),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("event log error: {0}")]
    Broker(#[from] rdkafka::error::KafkaError),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("worker not initialized: {0}")]
    Internal(&'static str),
}

impl ProcessingError {
    /// Label value for iot_processing_errors_total{error_type}.
    pub fn kind(&self) -> &'static str {
        match self {
            ProcessingError::Malformed(_) => "malformed",
            ProcessingError::Store(_) => "store",
            ProcessingError::Broker(_) => "broker",
            ProcessingError::Publish(_) => "publish",
            ProcessingError::Internal(_) => "internal",
        }
    }

    /// Transient errors hold the offset for redelivery; malformed records
    /// are skipped instead.
    pub fn is_transient(&self) -> bool {
        !matches!(self, ProcessingError::Malformed(_))
    }
}

impl From<serde_json::Error> for ProcessingError {
    fn from(err: serde_json::Error) -> Self {
        ProcessingError::Malformed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_records_are_skipped_not_retried() {
        let err = ProcessingError::Malformed("missing deviceId".into());
        assert_eq!(err.kind(), "malformed");
        assert!(!err.is_transient());
    }

    #[test]
    fn store_errors_are_transient() {
        let err = ProcessingError::Store(sqlx::Error::PoolClosed);
        assert_eq!(err.kind(), "store");
        assert!(err.is_transient());
    }
}
