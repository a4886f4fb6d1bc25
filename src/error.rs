//! Error types for the ingestion engine.
//!
//! # Error Handling Patterns
//!
//! Two patterns are used, chosen by operation criticality:
//!
//! ## Fail-Fast (Propagate Errors)
//!
//! Used where failure indicates a serious problem:
//! - Storage writes in the drainer
//! - Producer sends before END_OF_PUSH
//! - Offset-record persistence
//! - Protocol violations (unexpected control messages, topic mismatches)
//!
//! ## Best-Effort (Log and Continue)
//!
//! Used where partial failure is acceptable:
//! - Fatal data-validation errors after END_OF_PUSH (logged + counted)
//! - Producer-future waits that time out on demotion (benign, the partition
//!   continues)
//! - Benign upstream offset rewinds
//! - Lag measurement fallbacks
//!
//! # Fatality
//!
//! Errors that fail a partition are staged on the ingestion task
//! (`offer_producer_error` / `set_last_ingestion_error`) and surfaced by the
//! next loop iteration; they never panic a drainer or callback worker. Use
//! [`IngestionError::is_fatal_for_partition`] to classify.

use thiserror::Error;

/// Result type for ingestion operations.
pub type Result<T> = std::result::Result<T, IngestionError>;

/// Errors raised by the ingestion engine and its collaborators.
#[derive(Debug, Clone, Error)]
pub enum IngestionError {
    /// An unexpected control message or record arrived.
    ///
    /// Examples: `StartOfBufferReplay` in leader/follower mode, an `UPDATE`
    /// in a replica that is not producing to the version topic, a record
    /// from a topic the replica is not supposed to consume.
    #[error("protocol violation on partition {partition}: {message}")]
    FatalProtocolViolation { partition: u32, message: String },

    /// Data-integrity validation found an unrecoverable gap or corruption.
    #[error("data validation failure on partition {partition}: {message}")]
    FatalDataValidation { partition: u32, message: String },

    /// Data-integrity validation identified a duplicate message.
    ///
    /// Not a failure: the caller skips the record and increments a counter.
    #[error("duplicate message on partition {partition} at offset {offset}")]
    DuplicateData { partition: u32, offset: i64 },

    /// Upstream offset rewound with a different producer identity and the
    /// rewound data does not match what is already stored.
    #[error("potentially lossy upstream rewind on partition {partition}: {message}")]
    LossyRewind { partition: u32, message: String },

    /// A partition failed to complete ingestion within the bootstrap deadline.
    #[error("push timeout: partitions {partitions:?} did not complete within {timeout_hours}h")]
    PushTimeout {
        partitions: Vec<u32>,
        timeout_hours: u64,
    },

    /// Storage engine failure.
    #[error("storage failure: {0}")]
    Storage(String),

    /// Version-topic producer failure.
    #[error("producer failure: {0}")]
    Producer(String),

    /// Upstream client failure.
    #[error("upstream failure: {0}")]
    Upstream(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Persisted-state encode/decode failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A bounded wait elapsed.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// A role command arrived on a task that is not running.
    #[error("ingestion task for {version_topic} is not running")]
    NotRunning { version_topic: String },

    /// An operation referenced a partition without consumption state.
    #[error("partition {partition} is not subscribed")]
    UnknownPartition { partition: u32 },
}

impl IngestionError {
    /// True if this error must fail the affected partition.
    pub fn is_fatal_for_partition(&self) -> bool {
        matches!(
            self,
            IngestionError::FatalProtocolViolation { .. }
                | IngestionError::FatalDataValidation { .. }
                | IngestionError::LossyRewind { .. }
                | IngestionError::Storage(_)
        )
    }

    /// True if this error fails the whole ingestion task.
    pub fn is_fatal_for_task(&self) -> bool {
        matches!(self, IngestionError::PushTimeout { .. })
    }

    /// True if this error is recorded in metrics but otherwise ignored.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            IngestionError::DuplicateData { .. } | IngestionError::Timeout(_)
        )
    }

    /// Label used for error metrics.
    pub fn as_metric_label(&self) -> &'static str {
        match self {
            IngestionError::FatalProtocolViolation { .. } => "protocol_violation",
            IngestionError::FatalDataValidation { .. } => "data_validation",
            IngestionError::DuplicateData { .. } => "duplicate",
            IngestionError::LossyRewind { .. } => "lossy_rewind",
            IngestionError::PushTimeout { .. } => "push_timeout",
            IngestionError::Storage(_) => "storage",
            IngestionError::Producer(_) => "producer",
            IngestionError::Upstream(_) => "upstream",
            IngestionError::Config(_) => "config",
            IngestionError::Serialization(_) => "serialization",
            IngestionError::Timeout(_) => "timeout",
            IngestionError::NotRunning { .. } => "not_running",
            IngestionError::UnknownPartition { .. } => "unknown_partition",
        }
    }
}

impl From<serde_json::Error> for IngestionError {
    fn from(e: serde_json::Error) -> Self {
        IngestionError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_for_partition() {
        assert!(IngestionError::FatalProtocolViolation {
            partition: 0,
            message: "SOBR".to_string(),
        }
        .is_fatal_for_partition());
        assert!(IngestionError::Storage("disk full".to_string()).is_fatal_for_partition());
        assert!(!IngestionError::DuplicateData {
            partition: 0,
            offset: 42,
        }
        .is_fatal_for_partition());
        assert!(!IngestionError::Timeout("producer future".to_string()).is_fatal_for_partition());
    }

    #[test]
    fn test_fatal_for_task() {
        assert!(IngestionError::PushTimeout {
            partitions: vec![1, 2],
            timeout_hours: 24,
        }
        .is_fatal_for_task());
        assert!(!IngestionError::Storage("oops".to_string()).is_fatal_for_task());
    }

    #[test]
    fn test_benign() {
        assert!(IngestionError::DuplicateData {
            partition: 3,
            offset: 7,
        }
        .is_benign());
        assert!(!IngestionError::LossyRewind {
            partition: 3,
            message: "mismatch".to_string(),
        }
        .is_benign());
    }

    #[test]
    fn test_display_carries_context() {
        let err = IngestionError::FatalProtocolViolation {
            partition: 9,
            message: "received StartOfBufferReplay".to_string(),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("partition 9"));
        assert!(rendered.contains("StartOfBufferReplay"));
    }

    #[test]
    fn test_metric_labels_are_distinct() {
        let labels = [
            IngestionError::Storage(String::new()).as_metric_label(),
            IngestionError::Producer(String::new()).as_metric_label(),
            IngestionError::Upstream(String::new()).as_metric_label(),
            IngestionError::Config(String::new()).as_metric_label(),
        ];
        let unique: std::collections::HashSet<_> = labels.iter().collect();
        assert_eq!(unique.len(), labels.len());
    }
}
