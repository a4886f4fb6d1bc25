//! Persisted per-partition offsets and per-version state.
//!
//! Two durable records live in the storage engine's metadata partition:
//!
//! - [`OffsetRecord`], one per partition under key `P_<partitionId>`: the
//!   checkpoint a replica restores from on subscribe. It tracks the last
//!   version-topic offset durably applied, which topic the leader is (or last
//!   was) consuming, the per-upstream consumed offsets, and the identity of
//!   the leader that produced the last persisted record.
//! - [`StoreVersionState`], one per version under key `VERSION_METADATA`:
//!   created when the first `StartOfPush` is processed, mutated only by the
//!   ingestion task that owns the version.
//!
//! Both are serialized through a schema-versioned envelope; decoding rejects
//! versions newer than this build understands.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{IngestionError, Result};
use crate::types::{LOWEST_OFFSET, Offset, ProducerGuid};

/// Metadata-partition key of the store version state.
pub const STORE_VERSION_STATE_KEY: &str = "VERSION_METADATA";

/// Upstream-offset map key for the single-source (non-active-active) design.
pub const NON_AA_UPSTREAM_OFFSET_KEY: &str = "NON_AA";

/// Current schema version of the persisted records.
pub const PERSISTED_SCHEMA_VERSION: u32 = 1;

/// Metadata-partition key of a partition's offset record.
pub fn offset_record_key(partition: u32) -> String {
    format!("P_{partition}")
}

/// Last validated position of one producer, checkpointed with the offset
/// record so data-integrity validation survives restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerPosition {
    pub segment_number: i32,
    pub sequence_number: i32,
}

/// Control message ordering a leader to change its upstream feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicSwitch {
    pub source_topic_name: String,
    /// Exactly one source cluster URL in this design; any other length is a
    /// fatal protocol violation at receipt time.
    pub source_kafka_servers: Vec<String>,
    /// Rewind point for the new feed; `<= 0` means "from oldest".
    pub rewind_start_timestamp: i64,
}

/// Value compression applied to this store version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionStrategy {
    #[default]
    NoOp,
    Gzip,
    Zstd,
}

/// Durable per-version state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreVersionState {
    pub schema_version: u32,
    pub chunking_enabled: bool,
    pub compression_strategy: CompressionStrategy,
    pub last_topic_switch: Option<TopicSwitch>,
}

impl StoreVersionState {
    pub fn new(chunking_enabled: bool, compression_strategy: CompressionStrategy) -> Self {
        Self {
            schema_version: PERSISTED_SCHEMA_VERSION,
            chunking_enabled,
            compression_strategy,
            last_topic_switch: None,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let state: StoreVersionState = serde_json::from_slice(bytes)?;
        if state.schema_version > PERSISTED_SCHEMA_VERSION {
            return Err(IngestionError::Serialization(format!(
                "store version state schema {} is newer than supported {}",
                state.schema_version, PERSISTED_SCHEMA_VERSION
            )));
        }
        Ok(state)
    }
}

/// Durable per-partition ingestion checkpoint.
///
/// `local_version_topic_offset` is monotonically non-decreasing on a given
/// host; the upstream offset under [`NON_AA_UPSTREAM_OFFSET_KEY`] is set
/// unconditionally so that observed rewinds propagate to followers instead of
/// being silently discarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetRecord {
    pub schema_version: u32,
    local_version_topic_offset: Offset,
    end_of_push_received: bool,
    leader_topic: Option<String>,
    /// Last-consumed offset per upstream key. Hex producer GUIDs never appear
    /// here; the single reserved key is [`NON_AA_UPSTREAM_OFFSET_KEY`].
    upstream_offsets: HashMap<String, Offset>,
    leader_producer_guid: Option<ProducerGuid>,
    leader_host_id: Option<String>,
    /// Validated producer positions pending with this checkpoint, keyed by
    /// hex producer GUID.
    pending_transformers: HashMap<String, ProducerPosition>,
}

impl Default for OffsetRecord {
    fn default() -> Self {
        Self::new()
    }
}

impl OffsetRecord {
    pub fn new() -> Self {
        Self {
            schema_version: PERSISTED_SCHEMA_VERSION,
            local_version_topic_offset: LOWEST_OFFSET,
            end_of_push_received: false,
            leader_topic: None,
            upstream_offsets: HashMap::new(),
            leader_producer_guid: None,
            leader_host_id: None,
            pending_transformers: HashMap::new(),
        }
    }

    pub fn local_version_topic_offset(&self) -> Offset {
        self.local_version_topic_offset
    }

    /// Advance the local version-topic offset; regressions are ignored to
    /// preserve the monotonicity invariant.
    pub fn set_local_version_topic_offset(&mut self, offset: Offset) {
        if offset > self.local_version_topic_offset {
            self.local_version_topic_offset = offset;
        }
    }

    pub fn end_of_push_received(&self) -> bool {
        self.end_of_push_received
    }

    /// Latched on the first `EndOfPush`; never unset for a live version.
    pub fn set_end_of_push_received(&mut self) {
        self.end_of_push_received = true;
    }

    pub fn leader_topic(&self) -> Option<&str> {
        self.leader_topic.as_deref()
    }

    pub fn set_leader_topic(&mut self, topic: impl Into<String>) {
        self.leader_topic = Some(topic.into());
    }

    /// Last-consumed offset for an upstream key, `LOWEST_OFFSET` when unset.
    pub fn upstream_offset(&self, key: &str) -> Offset {
        self.upstream_offsets
            .get(key)
            .copied()
            .unwrap_or(LOWEST_OFFSET)
    }

    /// Set an upstream offset unconditionally: rewinds are propagated, not
    /// silently discarded, so followers track the true leader.
    pub fn set_upstream_offset(&mut self, key: impl Into<String>, offset: Offset) {
        self.upstream_offsets.insert(key.into(), offset);
    }

    pub fn leader_producer_guid(&self) -> Option<&ProducerGuid> {
        self.leader_producer_guid.as_ref()
    }

    pub fn set_leader_producer_guid(&mut self, guid: ProducerGuid) {
        self.leader_producer_guid = Some(guid);
    }

    pub fn leader_host_id(&self) -> Option<&str> {
        self.leader_host_id.as_deref()
    }

    pub fn set_leader_host_id(&mut self, host: impl Into<String>) {
        self.leader_host_id = Some(host.into());
    }

    /// Record a validated producer position with this checkpoint.
    pub fn record_producer_position(&mut self, guid: &ProducerGuid, position: ProducerPosition) {
        self.pending_transformers.insert(guid.to_hex(), position);
    }

    /// Checkpointed position of a producer, if any.
    pub fn producer_position(&self, guid: &ProducerGuid) -> Option<ProducerPosition> {
        self.pending_transformers.get(&guid.to_hex()).copied()
    }

    /// All checkpointed producer positions, keyed by hex GUID.
    pub fn producer_positions(&self) -> &HashMap<String, ProducerPosition> {
        &self.pending_transformers
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let record: OffsetRecord = serde_json::from_slice(bytes)?;
        if record.schema_version > PERSISTED_SCHEMA_VERSION {
            return Err(IngestionError::Serialization(format!(
                "offset record schema {} is newer than supported {}",
                record.schema_version, PERSISTED_SCHEMA_VERSION
            )));
        }
        Ok(record)
    }

    /// One-line rendering for log messages.
    pub fn to_simplified_string(&self) -> String {
        format!(
            "OffsetRecord(vt_offset={}, leader_topic={:?}, upstream={})",
            self.local_version_topic_offset,
            self.leader_topic,
            self.upstream_offset(NON_AA_UPSTREAM_OFFSET_KEY)
        )
    }
}
