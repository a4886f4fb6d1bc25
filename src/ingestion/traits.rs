//! Trait seams for the engine's external collaborators.
//!
//! The engine owns the leader/follower state machines, validation, and
//! ordering; everything with its own infrastructure lives behind one of
//! these traits:
//!
//! - [`UpstreamClient`]: topic subscribe/seek/poll against one or more
//!   upstream clusters, addressed by URL.
//! - [`StorageEngine`]: the pluggable partitioned key-value store, including
//!   its metadata partition.
//! - [`StatusReporter`]: push/partition status signals consumed by the
//!   readiness checker's surroundings (routers, controllers).
//! - [`UpdateProcessor`]: write-compute delta application; the schema
//!   repositories stay behind this seam.
//!
//! All of them ship an in-memory implementation in
//! [`mock`](crate::ingestion::mock) for tests.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::ingestion::message::{ConsumedRecord, UpdatePayload};
use crate::types::Offset;

/// Client for one or more upstream log clusters.
///
/// A single client instance multiplexes subscriptions across clusters; every
/// subscribe names the cluster URL and `poll` returns records tagged with
/// the URL they came from.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Subscribe to a topic partition at the given offset.
    ///
    /// `offset` is the last consumed offset; consumption resumes at the next
    /// one. `LOWEST_OFFSET` means "from oldest".
    async fn subscribe(&self, topic: &str, partition: u32, offset: Offset, url: &str)
    -> Result<()>;

    /// Unsubscribe from a topic partition on whichever cluster it was
    /// subscribed. A no-op when not subscribed.
    async fn unsubscribe(&self, topic: &str, partition: u32) -> Result<()>;

    /// Poll a batch of records across all current subscriptions.
    async fn poll(&self) -> Result<Vec<ConsumedRecord>>;

    /// Offset one past the last record of a topic partition.
    async fn end_offset(&self, topic: &str, partition: u32, url: &str) -> Result<Offset>;

    /// Offset of the first record at-or-after a timestamp, if any.
    async fn offset_for_timestamp(
        &self,
        topic: &str,
        partition: u32,
        timestamp_ms: i64,
        url: &str,
    ) -> Result<Option<Offset>>;

    /// Client-maintained lag for a subscribed topic partition, when cheap.
    async fn offset_lag(&self, topic: &str, partition: u32) -> Option<i64>;
}

/// The pluggable partitioned key-value store.
///
/// Rows are opaque to the engine apart from the 4-byte schema id header.
/// The metadata partition (id `METADATA_PARTITION_ID`) stores the offset
/// records and the store version state under string keys.
///
/// Implementations guard partition re-open (batch-mode toggles) against
/// concurrent reads with a read-write lock; the engine may issue lookups
/// from the ingestion thread while drainers write.
#[async_trait]
pub trait StorageEngine: Send + Sync {
    async fn put(&self, partition: u32, key: &[u8], value: &[u8]) -> Result<()>;

    /// Put carrying replication metadata alongside the value.
    async fn put_with_replication_metadata(
        &self,
        partition: u32,
        key: &[u8],
        value: &[u8],
        replication_metadata: &[u8],
    ) -> Result<()>;

    async fn get(&self, partition: u32, key: &[u8]) -> Result<Option<Vec<u8>>>;

    async fn delete(&self, partition: u32, key: &[u8]) -> Result<()>;

    /// Switch a partition into batch-write mode for bulk loading.
    async fn begin_batch_write(&self, partition: u32) -> Result<()>;

    /// Leave batch-write mode once the bulk load is complete.
    async fn end_batch_write(&self, partition: u32) -> Result<()>;

    /// Flush a partition; returns the engine's checkpoint metadata.
    async fn sync(&self, partition: u32) -> Result<HashMap<String, String>>;

    async fn put_metadata(&self, key: &str, value: &[u8]) -> Result<()>;

    async fn get_metadata(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn delete_metadata(&self, key: &str) -> Result<()>;

    async fn drop_partition(&self, partition: u32) -> Result<()>;
}

/// Push/partition status signals.
///
/// Reporting is edge triggered: the engine reports each transition once per
/// partition and expects implementations to be idempotent anyway.
#[async_trait]
pub trait StatusReporter: Send + Sync {
    /// A partition finished restoring its checkpoint and started consuming.
    async fn report_started(&self, partition: u32);

    /// `EndOfPush` was processed for a partition.
    async fn report_end_of_push_received(&self, partition: u32);

    /// A `TopicSwitch` control message was received for a partition.
    async fn report_topic_switch_received(&self, partition: u32);

    /// The partition caught up the version-topic base offset; releases the
    /// optional rebalance latch.
    async fn report_catch_up_base_topic_offset_lag(&self, partition: u32);

    /// The partition's lag is within budget; it may serve reads.
    async fn report_completed(&self, partition: u32);

    /// An incremental push started or ended on a partition.
    async fn report_incremental_push(&self, partition: u32, version: &str, started: bool);

    /// The partition failed; `message` carries the rendered error.
    async fn report_error(&self, partition: u32, message: &str);
}

/// Write-compute delta application.
///
/// Given the current value (when present) and an UPDATE payload, produce the
/// new value, or `None` to delete the key. Schema resolution happens behind
/// this seam; the engine only moves bytes.
#[async_trait]
pub trait UpdateProcessor: Send + Sync {
    async fn apply_update(
        &self,
        current_value: Option<&[u8]>,
        current_schema_id: Option<i32>,
        update: &UpdatePayload,
    ) -> Result<Option<Vec<u8>>>;
}
