//! # Tributary
//! Leader/follower partition ingestion engine for a distributed, versioned
//! key-value store.
//!
//! For each partition of a store version, exactly one replica acts as LEADER
//! and drives data from an upstream feed (a real-time topic, a stream-
//! reprocessing topic, or a remote version topic) into the canonical
//! **version topic**; all other replicas act as STANDBY and tail the version
//! topic, applying records to local storage. This crate owns the role state
//! machines, upstream selection and mid-stream topic switches, producer-
//! callback-ordered persistence, data-integrity validation against upstream
//! rewinds, bounded-memory backpressure between consumer and storage, and
//! the replication-lag accounting behind readiness reporting.
//!
//! # Goals
//! - Correct recovery across restarts, rebalances, and upstream leader churn
//!   without losing or duplicating committed records
//! - Pluggable collaborators: the storage engine, the upstream log client,
//!   the version-topic producer, and status reporting are all trait seams
//! - Easy to understand code
//!
//! ## Getting started
//!
//! Implement the collaborator traits in [`ingestion::traits`] (or use the
//! in-memory ones behind the `test-utilities` feature) and build a task:
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tributary::config::IngestionConfig;
//! use tributary::ingestion::IngestionTask;
//! use tributary::ingestion::mock::{
//!     InMemoryBroker, InMemoryProducerClient, InMemoryStorageEngine, InMemoryUpstreamClient,
//!     RecordingStatusReporter,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let broker = Arc::new(InMemoryBroker::new());
//!     let config = IngestionConfig {
//!         local_upstream_url: "kafka://local:9092".to_string(),
//!         ..IngestionConfig::default()
//!     };
//!     let producer_broker = broker.clone();
//!     let task = IngestionTask::builder("orders", 1)
//!         .config(config)
//!         .storage(Arc::new(InMemoryStorageEngine::new()))
//!         .upstream(Arc::new(InMemoryUpstreamClient::new(broker)))
//!         .status_reporter(Arc::new(RecordingStatusReporter::new()))
//!         .producer_factory(Box::new(move |chunking| {
//!             let producer = InMemoryProducerClient::new(
//!                 producer_broker.clone(),
//!                 "kafka://local:9092",
//!                 "orders_v1",
//!             );
//!             producer.update_chunking_enabled(chunking);
//!             Ok(Arc::new(producer))
//!         }))
//!         .build()?;
//!
//!     task.subscribe(0)?;
//!     task.run().await;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod ingestion;
pub mod metrics;
pub mod telemetry;
pub mod types;

pub mod prelude {
    //! Main exports for embedding the ingestion engine.
    pub use crate::config::IngestionConfig;
    pub use crate::error::{IngestionError, Result};
    pub use crate::ingestion::{
        ConsumedRecord, ControlMessage, IngestionTask, IngestionTaskBuilder, LeaderFollowerState,
        LeaderSessionIdChecker, MessageEnvelope, MessagePayload, OffsetRecord, ProducerClient,
        StatusReporter, StorageEngine, TopicSwitch, UpdateProcessor, UpstreamClient,
    };
    pub use crate::types::{LOWEST_OFFSET, Offset, ProducerGuid};

    pub use bytes;
}
