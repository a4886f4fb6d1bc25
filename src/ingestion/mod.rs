//! Leader/follower partition ingestion engine.
//!
//! For each partition of a store version, exactly one replica acts as LEADER
//! and drives data from an upstream feed (real-time topic, stream-
//! reprocessing topic, or a remote version topic) into the canonical
//! **version topic**; all other replicas act as STANDBY and tail the version
//! topic, applying records to local storage.
//!
//! # Architecture
//!
//! ```text
//!                 ┌─────────────┐        ┌─────────────┐
//!       RT/SR ───▶│   LEADER    │───────▶│Version Topic│
//!   remote VT     │  (produce)  │        └──────┬──────┘
//!                 └──────┬──────┘               │
//!                        │ producer callback    │ poll
//!                        ▼                      ▼
//!                 ┌─────────────┐        ┌─────────────┐
//!                 │   Drainer   │◀───────│   STANDBY   │
//!                 │   Queues    │        │  (follow)   │
//!                 └──────┬──────┘        └─────────────┘
//!                        ▼
//!                 ┌─────────────┐
//!                 │  Storage +  │
//!                 │OffsetRecord │
//!                 └─────────────┘
//! ```
//!
//! Components, leaves first:
//! - [`offsets`]: durable per-partition checkpoints and per-version state
//! - [`metadata_store`]: read/write-through store for those records
//! - [`metadata_cache`]: TTL-cached upstream end-offset lookups
//! - [`validation`]: per-producer data-integrity validation
//! - [`drainer`]: memory-bounded queues plus the drainer worker pool
//! - [`producer`]: the shared version-topic producer gateway
//! - [`partition_state`]: the per-partition role state machine
//! - [`actions`]: the serialized role/subscription command queue
//! - [`task`]: the ingestion task tying all of it together

pub mod actions;
pub mod completion;
pub mod drainer;
pub mod message;
pub mod metadata_cache;
pub mod metadata_store;
pub mod offsets;
pub mod partition_state;
pub mod producer;
pub mod task;
pub mod traits;
pub mod validation;

#[cfg(any(test, feature = "test-utilities"))]
pub mod mock;

pub use actions::{ConsumerAction, ConsumerActionQueue, ConsumerActionType};
pub use completion::{CompletionSignal, SignalResult};
pub use drainer::{DrainerEntry, DrainerService, MemoryBoundedQueue, RecordApplier};
pub use message::{
    CHUNK_SCHEMA_ID, CHUNKED_VALUE_MANIFEST_SCHEMA_ID, ConsumedRecord, ControlMessage,
    LeaderMetadataFooter, MessageEnvelope, MessagePayload, ProducerMetadata, PutPayload, RecordKey,
    UpdatePayload,
};
pub use metadata_cache::UpstreamMetadataCache;
pub use metadata_store::MetadataStore;
pub use offsets::{
    CompressionStrategy, NON_AA_UPSTREAM_OFFSET_KEY, OffsetRecord, ProducerPosition,
    STORE_VERSION_STATE_KEY, StoreVersionState, TopicSwitch,
};
pub use partition_state::{
    IncrementalPushPolicy, LeaderFollowerState, LeaderSessionIdChecker, PartitionConsumptionState,
    TransientRecord,
};
pub use producer::{
    ChunkedValueManifest, ChunkingInfo, LeaderMetadata, LeaderProducedPayload,
    LeaderProducedRecordContext, ProduceAck, ProduceCompletion, ProduceHandle, ProduceResult,
    ProducerClient, ProducerFactory, ProducerGateway,
};
pub use task::{DelegateResult, IngestionTask, IngestionTaskBuilder};
pub use traits::{StatusReporter, StorageEngine, UpdateProcessor, UpstreamClient};
pub use validation::{DataIntegrityValidator, ValidationOutcome};
