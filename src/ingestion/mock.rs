//! In-memory collaborators for tests.
//!
//! A complete in-memory stand-in for the engine's external world: a broker
//! holding topic partitions across any number of "clusters" (keyed by URL),
//! an upstream client over it, a version-topic producer that appends to the
//! same broker, a storage engine over BTreeMaps, and a status reporter that
//! records every event. Together they let the full ingestion task run
//! end-to-end inside a test process.

#![allow(clippy::type_complexity)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;

use crate::error::{IngestionError, Result};
use crate::ingestion::message::{
    CHUNK_SCHEMA_ID, CHUNKED_VALUE_MANIFEST_SCHEMA_ID, ConsumedRecord, ControlMessage,
    LeaderMetadataFooter, MessageEnvelope, MessagePayload, ProducerMetadata, PutPayload, RecordKey,
    UpdatePayload,
};
use crate::ingestion::producer::{
    ChunkedValueManifest, ChunkingInfo, LeaderMetadata, ProduceAck, ProduceCompletion,
    ProduceHandle, ProduceResult, ProducerClient,
};
use crate::ingestion::traits::{StatusReporter, StorageEngine, UpdateProcessor, UpstreamClient};
use crate::types::{Offset, ProducerGuid};

/// Maximum records returned by one poll call.
const MAX_POLL_RECORDS: usize = 64;

// ============================================================================
// Broker
// ============================================================================

/// One record as stored by the in-memory broker.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub key: RecordKey,
    pub value: MessageEnvelope,
    pub timestamp_ms: i64,
}

#[derive(Debug, Default)]
struct PartitionLog {
    base_offset: Offset,
    records: Vec<StoredRecord>,
}

impl PartitionLog {
    fn end_offset(&self) -> Offset {
        self.base_offset + self.records.len() as Offset
    }
}

#[derive(Debug, Clone)]
struct Subscription {
    url: String,
    next_offset: Offset,
}

/// In-memory multi-cluster broker.
///
/// Topic partitions are keyed by `(url, topic, partition)`; subscriptions by
/// `(topic, partition)` like the real upstream client, which can hold one
/// subscription per topic partition across all clusters.
pub struct InMemoryBroker {
    logs: DashMap<(String, String, u32), PartitionLog>,
    subscriptions: DashMap<(String, u32), Subscription>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            logs: DashMap::new(),
            subscriptions: DashMap::new(),
        }
    }

    /// Set the first offset of a partition; only valid while it is empty.
    pub fn set_base_offset(&self, url: &str, topic: &str, partition: u32, base: Offset) {
        let mut log = self
            .logs
            .entry((url.to_string(), topic.to_string(), partition))
            .or_default();
        assert!(
            log.records.is_empty(),
            "base offset must be set before records are appended"
        );
        log.base_offset = base;
    }

    /// Append a record; returns its offset.
    pub fn append(
        &self,
        url: &str,
        topic: &str,
        partition: u32,
        key: RecordKey,
        value: MessageEnvelope,
    ) -> Offset {
        let mut log = self
            .logs
            .entry((url.to_string(), topic.to_string(), partition))
            .or_default();
        let offset = log.end_offset();
        let timestamp_ms = value.producer_metadata.message_timestamp_ms;
        log.records.push(StoredRecord {
            key,
            value,
            timestamp_ms,
        });
        offset
    }

    /// Snapshot of a partition's records for assertions.
    pub fn records(&self, url: &str, topic: &str, partition: u32) -> Vec<StoredRecord> {
        self.logs
            .get(&(url.to_string(), topic.to_string(), partition))
            .map(|log| log.records.clone())
            .unwrap_or_default()
    }

    pub fn end_offset(&self, url: &str, topic: &str, partition: u32) -> Offset {
        self.logs
            .get(&(url.to_string(), topic.to_string(), partition))
            .map(|log| log.end_offset())
            .unwrap_or(0)
    }

    fn offset_for_timestamp(
        &self,
        url: &str,
        topic: &str,
        partition: u32,
        timestamp_ms: i64,
    ) -> Option<Offset> {
        let log = self
            .logs
            .get(&(url.to_string(), topic.to_string(), partition))?;
        log.records
            .iter()
            .position(|r| r.timestamp_ms >= timestamp_ms)
            .map(|idx| log.base_offset + idx as Offset)
    }

    fn subscribe(&self, topic: &str, partition: u32, offset: Offset, url: &str) {
        let base = self
            .logs
            .get(&(url.to_string(), topic.to_string(), partition))
            .map(|log| log.base_offset)
            .unwrap_or(0);
        self.subscriptions.insert(
            (topic.to_string(), partition),
            Subscription {
                url: url.to_string(),
                next_offset: (offset + 1).max(base),
            },
        );
    }

    fn unsubscribe(&self, topic: &str, partition: u32) {
        self.subscriptions.remove(&(topic.to_string(), partition));
    }

    pub fn is_subscribed(&self, topic: &str, partition: u32) -> bool {
        self.subscriptions
            .contains_key(&(topic.to_string(), partition))
    }

    /// Position a subscription would read next, for assertions.
    pub fn subscription_position(&self, topic: &str, partition: u32) -> Option<Offset> {
        self.subscriptions
            .get(&(topic.to_string(), partition))
            .map(|s| s.next_offset)
    }

    fn envelope_size(envelope: &MessageEnvelope) -> usize {
        match &envelope.payload {
            MessagePayload::Put(put) => put.value.len() + 16,
            MessagePayload::Update(update) => update.update.len() + 16,
            MessagePayload::Delete => 16,
            MessagePayload::Control(_) => 64,
        }
    }

    fn poll(&self) -> Vec<ConsumedRecord> {
        let mut polled = Vec::new();
        for mut entry in self.subscriptions.iter_mut() {
            let (topic, partition) = entry.key().clone();
            let sub = entry.value_mut();
            let log_key = (sub.url.clone(), topic.clone(), partition);
            let Some(log) = self.logs.get(&log_key) else {
                continue;
            };
            // A base offset configured after subscribing moves the start of
            // the log; "from oldest" positions snap forward to it.
            if sub.next_offset < log.base_offset {
                sub.next_offset = log.base_offset;
            }
            while sub.next_offset < log.end_offset() && polled.len() < MAX_POLL_RECORDS {
                let idx = (sub.next_offset - log.base_offset) as usize;
                let stored = &log.records[idx];
                polled.push(ConsumedRecord {
                    url: sub.url.clone(),
                    topic: topic.clone(),
                    partition,
                    offset: sub.next_offset,
                    key: stored.key.clone(),
                    value: stored.value.clone(),
                    serialized_key_size: stored.key.key.len(),
                    serialized_value_size: Self::envelope_size(&stored.value),
                });
                sub.next_offset += 1;
            }
        }
        polled
    }
}

/// [`UpstreamClient`] over an [`InMemoryBroker`].
pub struct InMemoryUpstreamClient {
    broker: Arc<InMemoryBroker>,
}

impl InMemoryUpstreamClient {
    pub fn new(broker: Arc<InMemoryBroker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl UpstreamClient for InMemoryUpstreamClient {
    async fn subscribe(
        &self,
        topic: &str,
        partition: u32,
        offset: Offset,
        url: &str,
    ) -> Result<()> {
        self.broker.subscribe(topic, partition, offset, url);
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str, partition: u32) -> Result<()> {
        self.broker.unsubscribe(topic, partition);
        Ok(())
    }

    async fn poll(&self) -> Result<Vec<ConsumedRecord>> {
        Ok(self.broker.poll())
    }

    async fn end_offset(&self, topic: &str, partition: u32, url: &str) -> Result<Offset> {
        Ok(self.broker.end_offset(url, topic, partition))
    }

    async fn offset_for_timestamp(
        &self,
        topic: &str,
        partition: u32,
        timestamp_ms: i64,
        url: &str,
    ) -> Result<Option<Offset>> {
        Ok(self
            .broker
            .offset_for_timestamp(url, topic, partition, timestamp_ms))
    }

    async fn offset_lag(&self, topic: &str, partition: u32) -> Option<i64> {
        let sub = self
            .broker
            .subscriptions
            .get(&(topic.to_string(), partition))?;
        let end = self.broker.end_offset(&sub.url, topic, partition);
        Some((end - sub.next_offset).max(0))
    }
}

// ============================================================================
// Producer
// ============================================================================

/// Scriptable in-memory version-topic producer.
///
/// Appends produced records to the backing broker's version topic. Tests can
/// hold acknowledgements to simulate in-flight sends, force the reported
/// partition to differ from the target (real-time fan-out), and enable
/// chunking with a byte threshold.
pub struct InMemoryProducerClient {
    broker: Arc<InMemoryBroker>,
    url: String,
    topic: String,
    guid: ProducerGuid,
    chunking_enabled: AtomicBool,
    chunk_size_limit: AtomicUsize,
    hold_acks: AtomicBool,
    held: Mutex<Vec<(ProduceHandle, ProduceAck)>>,
    /// Per-partition (segment, last sequence) counters.
    segments: DashMap<u32, (i32, i32)>,
    ended_segments: Mutex<Vec<(u32, bool)>>,
    closed_partitions: Mutex<Vec<u32>>,
    closed: AtomicBool,
    /// When set, acknowledgements report this partition instead of the real
    /// one, simulating fan-out to a non-leader sub-partition.
    reported_partition_override: Mutex<Option<u32>>,
}

impl InMemoryProducerClient {
    pub fn new(broker: Arc<InMemoryBroker>, url: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            broker,
            url: url.into(),
            topic: topic.into(),
            guid: ProducerGuid([0x1d; 16]),
            chunking_enabled: AtomicBool::new(false),
            chunk_size_limit: AtomicUsize::new(usize::MAX),
            hold_acks: AtomicBool::new(false),
            held: Mutex::new(Vec::new()),
            segments: DashMap::new(),
            ended_segments: Mutex::new(Vec::new()),
            closed_partitions: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            reported_partition_override: Mutex::new(None),
        }
    }

    /// Standalone producer over its own broker, for unit tests.
    pub fn detached() -> Self {
        Self::new(Arc::new(InMemoryBroker::new()), "mock://local", "mock_v1")
    }

    pub fn with_guid(mut self, guid: ProducerGuid) -> Self {
        self.guid = guid;
        self
    }

    /// Chunk values above `limit` bytes once chunking is enabled.
    pub fn set_chunk_size_limit(&self, limit: usize) {
        self.chunk_size_limit.store(limit, Ordering::SeqCst);
    }

    /// Start holding acknowledgements until [`Self::release_held_acks`].
    pub fn hold_acks(&self) {
        self.hold_acks.store(true, Ordering::SeqCst);
    }

    /// Release held acknowledgements in send order and stop holding.
    pub fn release_held_acks(&self) {
        self.hold_acks.store(false, Ordering::SeqCst);
        let held = {
            let mut guard = self.held.lock().expect("held acks lock poisoned");
            std::mem::take(&mut *guard)
        };
        for (handle, ack) in held {
            handle.complete(ack);
        }
    }

    pub fn held_ack_count(&self) -> usize {
        self.held.lock().expect("held acks lock poisoned").len()
    }

    /// Make future acknowledgements claim this partition.
    pub fn override_reported_partition(&self, partition: Option<u32>) {
        *self
            .reported_partition_override
            .lock()
            .expect("override lock poisoned") = partition;
    }

    pub fn ended_segments(&self) -> Vec<(u32, bool)> {
        self.ended_segments
            .lock()
            .expect("segments lock poisoned")
            .clone()
    }

    pub fn closed_partitions(&self) -> Vec<u32> {
        self.closed_partitions
            .lock()
            .expect("closed partitions lock poisoned")
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn next_producer_metadata(&self, partition: u32) -> ProducerMetadata {
        let mut entry = self.segments.entry(partition).or_insert((0, -1));
        entry.1 += 1;
        ProducerMetadata {
            guid: self.guid,
            segment_number: entry.0,
            sequence_number: entry.1,
            message_timestamp_ms: 0,
            upstream_offset: -1,
        }
    }

    fn ack(&self, ack: ProduceAck) -> ProduceCompletion {
        if self.hold_acks.load(Ordering::SeqCst) {
            let (handle, completion) = ProduceCompletion::pair();
            self.held
                .lock()
                .expect("held acks lock poisoned")
                .push((handle, ack));
            completion
        } else {
            ProduceCompletion::ready(ack)
        }
    }

    fn reported_partition(&self, partition: u32) -> u32 {
        self.reported_partition_override
            .lock()
            .expect("override lock poisoned")
            .unwrap_or(partition)
    }

    fn footer(leader_metadata: &LeaderMetadata) -> LeaderMetadataFooter {
        LeaderMetadataFooter {
            host_name: leader_metadata.host_name.clone(),
            upstream_offset: leader_metadata.upstream_offset,
        }
    }

    fn guard_closed(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(IngestionError::Producer("producer is closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ProducerClient for InMemoryProducerClient {
    async fn put(
        &self,
        key: Bytes,
        value: Bytes,
        schema_id: i32,
        partition: u32,
        leader_metadata: LeaderMetadata,
    ) -> Result<ProduceCompletion> {
        self.guard_closed()?;
        let chunk_limit = self.chunk_size_limit.load(Ordering::SeqCst);
        let chunked =
            self.chunking_enabled.load(Ordering::SeqCst) && value.len() > chunk_limit;

        if !chunked {
            let envelope = MessageEnvelope {
                producer_metadata: self.next_producer_metadata(partition),
                leader_metadata: Some(Self::footer(&leader_metadata)),
                payload: MessagePayload::Put(PutPayload {
                    schema_id,
                    value: value.clone(),
                }),
            };
            let offset = self.broker.append(
                &self.url,
                &self.topic,
                partition,
                RecordKey::data(key.clone()),
                envelope,
            );
            return Ok(self.ack(Ok(ProduceResult {
                partition: self.reported_partition(partition),
                offset,
                serialized_key_size: key.len(),
                serialized_value_size: value.len(),
                chunking: None,
            })));
        }

        // Chunked path: individual chunk records first, then the manifest
        // under the top-level key.
        let mut chunks = Vec::new();
        let mut chunk_keys = Vec::new();
        let mut start = 0;
        while start < value.len() {
            let end = (start + chunk_limit).min(value.len());
            let chunk = value.slice(start..end);
            let mut chunk_key = BytesMut::from(&key[..]);
            chunk_key.extend_from_slice(format!("_chunk_{}", chunks.len()).as_bytes());
            let chunk_key = chunk_key.freeze();
            self.broker.append(
                &self.url,
                &self.topic,
                partition,
                RecordKey::data(chunk_key.clone()),
                MessageEnvelope {
                    producer_metadata: self.next_producer_metadata(partition),
                    leader_metadata: Some(Self::footer(&leader_metadata)),
                    payload: MessagePayload::Put(PutPayload {
                        schema_id: CHUNK_SCHEMA_ID,
                        value: chunk.clone(),
                    }),
                },
            );
            chunk_keys.push(chunk_key);
            chunks.push(chunk);
            start = end;
        }
        let manifest = ChunkedValueManifest {
            schema_id,
            keys_with_chunk_id_suffix: chunk_keys,
            total_value_size: value.len(),
        };
        let manifest_bytes = Bytes::from(manifest.to_bytes()?);
        let manifest_offset = self.broker.append(
            &self.url,
            &self.topic,
            partition,
            RecordKey::data(key.clone()),
            MessageEnvelope {
                producer_metadata: self.next_producer_metadata(partition),
                leader_metadata: Some(Self::footer(&leader_metadata)),
                payload: MessagePayload::Put(PutPayload {
                    schema_id: CHUNKED_VALUE_MANIFEST_SCHEMA_ID,
                    value: manifest_bytes,
                }),
            },
        );
        Ok(self.ack(Ok(ProduceResult {
            partition: self.reported_partition(partition),
            offset: manifest_offset,
            serialized_key_size: key.len(),
            serialized_value_size: value.len(),
            chunking: Some(ChunkingInfo {
                top_level_key: key,
                chunks,
                manifest,
            }),
        })))
    }

    async fn put_passthrough(
        &self,
        key: RecordKey,
        envelope: MessageEnvelope,
        partition: u32,
        leader_metadata: LeaderMetadata,
    ) -> Result<ProduceCompletion> {
        self.guard_closed()?;
        let key_size = key.key.len();
        let value_size = InMemoryBroker::envelope_size(&envelope);
        let mut envelope = envelope;
        envelope.leader_metadata = Some(Self::footer(&leader_metadata));
        let offset = self
            .broker
            .append(&self.url, &self.topic, partition, key, envelope);
        Ok(self.ack(Ok(ProduceResult {
            partition: self.reported_partition(partition),
            offset,
            serialized_key_size: key_size,
            serialized_value_size: value_size,
            chunking: None,
        })))
    }

    async fn delete(
        &self,
        key: Bytes,
        partition: u32,
        leader_metadata: LeaderMetadata,
    ) -> Result<ProduceCompletion> {
        self.guard_closed()?;
        let envelope = MessageEnvelope {
            producer_metadata: self.next_producer_metadata(partition),
            leader_metadata: Some(Self::footer(&leader_metadata)),
            payload: MessagePayload::Delete,
        };
        let offset = self.broker.append(
            &self.url,
            &self.topic,
            partition,
            RecordKey::data(key.clone()),
            envelope,
        );
        Ok(self.ack(Ok(ProduceResult {
            partition: self.reported_partition(partition),
            offset,
            serialized_key_size: key.len(),
            serialized_value_size: 0,
            chunking: None,
        })))
    }

    async fn send_control_message(
        &self,
        control: ControlMessage,
        partition: u32,
        leader_metadata: LeaderMetadata,
        passthrough: Option<ProducerMetadata>,
    ) -> Result<ProduceCompletion> {
        self.guard_closed()?;
        let producer_metadata =
            passthrough.unwrap_or_else(|| self.next_producer_metadata(partition));
        let envelope = MessageEnvelope {
            producer_metadata,
            leader_metadata: Some(Self::footer(&leader_metadata)),
            payload: MessagePayload::Control(control),
        };
        let offset = self.broker.append(
            &self.url,
            &self.topic,
            partition,
            RecordKey::control(),
            envelope,
        );
        Ok(self.ack(Ok(ProduceResult {
            partition: self.reported_partition(partition),
            offset,
            serialized_key_size: 0,
            serialized_value_size: 64,
            chunking: None,
        })))
    }

    fn update_chunking_enabled(&self, enabled: bool) {
        self.chunking_enabled.store(enabled, Ordering::SeqCst);
    }

    async fn end_segment(&self, partition: u32, finalize: bool) -> Result<()> {
        self.ended_segments
            .lock()
            .expect("segments lock poisoned")
            .push((partition, finalize));
        if let Some(mut entry) = self.segments.get_mut(&partition) {
            entry.0 += 1;
            entry.1 = -1;
        }
        Ok(())
    }

    async fn close_partition(&self, partition: u32) -> Result<()> {
        self.closed_partitions
            .lock()
            .expect("closed partitions lock poisoned")
            .push(partition);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Storage engine
// ============================================================================

/// [`StorageEngine`] over per-partition BTreeMaps.
///
/// Partition maps are guarded by read-write locks, mirroring the batch-mode
/// re-open discipline real engines need: batch toggles take the write lock,
/// lookups take the read lock.
pub struct InMemoryStorageEngine {
    partitions: DashMap<u32, Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>>,
    metadata: DashMap<String, Vec<u8>>,
    batch_mode: DashMap<u32, bool>,
    fail_writes: AtomicBool,
}

impl Default for InMemoryStorageEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorageEngine {
    pub fn new() -> Self {
        Self {
            partitions: DashMap::new(),
            metadata: DashMap::new(),
            batch_mode: DashMap::new(),
            fail_writes: AtomicBool::new(false),
        }
    }

    fn partition(&self, partition: u32) -> Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>> {
        self.partitions.entry(partition).or_default().clone()
    }

    /// Inject write failures for drainer error-path tests.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Direct read for assertions, bypassing the trait.
    pub fn get_raw(&self, partition: u32, key: &[u8]) -> Option<Vec<u8>> {
        self.partition(partition)
            .read()
            .expect("partition lock poisoned")
            .get(key)
            .cloned()
    }

    /// Direct write for test fixtures.
    pub fn put_raw(&self, partition: u32, key: &[u8], value: &[u8]) {
        self.partition(partition)
            .write()
            .expect("partition lock poisoned")
            .insert(key.to_vec(), value.to_vec());
    }

    pub fn is_batch_mode(&self, partition: u32) -> bool {
        self.batch_mode.get(&partition).map(|v| *v).unwrap_or(false)
    }

    pub fn partition_len(&self, partition: u32) -> usize {
        self.partition(partition)
            .read()
            .expect("partition lock poisoned")
            .len()
    }

    fn guard_writes(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(IngestionError::Storage("injected write failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageEngine for InMemoryStorageEngine {
    async fn put(&self, partition: u32, key: &[u8], value: &[u8]) -> Result<()> {
        self.guard_writes()?;
        self.partition(partition)
            .write()
            .expect("partition lock poisoned")
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    async fn put_with_replication_metadata(
        &self,
        partition: u32,
        key: &[u8],
        value: &[u8],
        _replication_metadata: &[u8],
    ) -> Result<()> {
        self.put(partition, key, value).await
    }

    async fn get(&self, partition: u32, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.get_raw(partition, key))
    }

    async fn delete(&self, partition: u32, key: &[u8]) -> Result<()> {
        self.guard_writes()?;
        self.partition(partition)
            .write()
            .expect("partition lock poisoned")
            .remove(key);
        Ok(())
    }

    async fn begin_batch_write(&self, partition: u32) -> Result<()> {
        self.batch_mode.insert(partition, true);
        Ok(())
    }

    async fn end_batch_write(&self, partition: u32) -> Result<()> {
        self.batch_mode.insert(partition, false);
        Ok(())
    }

    async fn sync(&self, partition: u32) -> Result<HashMap<String, String>> {
        Ok(HashMap::from([(
            "partition".to_string(),
            partition.to_string(),
        )]))
    }

    async fn put_metadata(&self, key: &str, value: &[u8]) -> Result<()> {
        self.metadata.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn get_metadata(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.metadata.get(key).map(|v| v.clone()))
    }

    async fn delete_metadata(&self, key: &str) -> Result<()> {
        self.metadata.remove(key);
        Ok(())
    }

    async fn drop_partition(&self, partition: u32) -> Result<()> {
        self.partitions.remove(&partition);
        self.batch_mode.remove(&partition);
        Ok(())
    }
}

// ============================================================================
// Status reporter
// ============================================================================

/// Everything a [`StatusReporter`] can observe, recorded for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    Started(u32),
    EndOfPushReceived(u32),
    TopicSwitchReceived(u32),
    CatchUpBaseTopicOffsetLag(u32),
    Completed(u32),
    IncrementalPush {
        partition: u32,
        version: String,
        started: bool,
    },
    Error {
        partition: u32,
        message: String,
    },
}

/// Recording [`StatusReporter`].
pub struct RecordingStatusReporter {
    events: Mutex<Vec<StatusEvent>>,
}

impl Default for RecordingStatusReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingStatusReporter {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<StatusEvent> {
        self.events.lock().expect("events lock poisoned").clone()
    }

    pub fn has_completed(&self, partition: u32) -> bool {
        self.events()
            .iter()
            .any(|e| matches!(e, StatusEvent::Completed(p) if *p == partition))
    }

    pub fn has_error(&self, partition: u32) -> bool {
        self.events()
            .iter()
            .any(|e| matches!(e, StatusEvent::Error { partition: p, .. } if *p == partition))
    }

    pub fn error_messages(&self, partition: u32) -> Vec<String> {
        self.events()
            .iter()
            .filter_map(|e| match e {
                StatusEvent::Error {
                    partition: p,
                    message,
                } if *p == partition => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, predicate: impl Fn(&StatusEvent) -> bool) -> usize {
        self.events().iter().filter(|e| predicate(e)).count()
    }
}

#[async_trait]
impl StatusReporter for RecordingStatusReporter {
    async fn report_started(&self, partition: u32) {
        self.events
            .lock()
            .expect("events lock poisoned")
            .push(StatusEvent::Started(partition));
    }

    async fn report_end_of_push_received(&self, partition: u32) {
        self.events
            .lock()
            .expect("events lock poisoned")
            .push(StatusEvent::EndOfPushReceived(partition));
    }

    async fn report_topic_switch_received(&self, partition: u32) {
        self.events
            .lock()
            .expect("events lock poisoned")
            .push(StatusEvent::TopicSwitchReceived(partition));
    }

    async fn report_catch_up_base_topic_offset_lag(&self, partition: u32) {
        self.events
            .lock()
            .expect("events lock poisoned")
            .push(StatusEvent::CatchUpBaseTopicOffsetLag(partition));
    }

    async fn report_completed(&self, partition: u32) {
        self.events
            .lock()
            .expect("events lock poisoned")
            .push(StatusEvent::Completed(partition));
    }

    async fn report_incremental_push(&self, partition: u32, version: &str, started: bool) {
        self.events
            .lock()
            .expect("events lock poisoned")
            .push(StatusEvent::IncrementalPush {
                partition,
                version: version.to_string(),
                started,
            });
    }

    async fn report_error(&self, partition: u32, message: &str) {
        self.events
            .lock()
            .expect("events lock poisoned")
            .push(StatusEvent::Error {
                partition,
                message: message.to_string(),
            });
    }
}

// ============================================================================
// Update processor
// ============================================================================

/// Update payload that deletes the key when applied by
/// [`OverwriteUpdateProcessor`].
pub const DELETE_UPDATE_PAYLOAD: &[u8] = b"__delete__";

/// Trivial [`UpdateProcessor`]: the update bytes replace the value, and the
/// reserved [`DELETE_UPDATE_PAYLOAD`] deletes the key.
pub struct OverwriteUpdateProcessor;

#[async_trait]
impl UpdateProcessor for OverwriteUpdateProcessor {
    async fn apply_update(
        &self,
        _current_value: Option<&[u8]>,
        _current_schema_id: Option<i32>,
        update: &UpdatePayload,
    ) -> Result<Option<Vec<u8>>> {
        if update.update.as_ref() == DELETE_UPDATE_PAYLOAD {
            Ok(None)
        } else {
            Ok(Some(update.update.to_vec()))
        }
    }
}

/// [`UpdateProcessor`] that appends the update bytes to the current value,
/// exercising the read-modify-write path.
pub struct AppendingUpdateProcessor;

#[async_trait]
impl UpdateProcessor for AppendingUpdateProcessor {
    async fn apply_update(
        &self,
        current_value: Option<&[u8]>,
        _current_schema_id: Option<i32>,
        update: &UpdatePayload,
    ) -> Result<Option<Vec<u8>>> {
        let mut value = current_value.map(|v| v.to_vec()).unwrap_or_default();
        value.extend_from_slice(&update.update);
        Ok(Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LOWEST_OFFSET;

    fn data_envelope(value: &'static [u8]) -> MessageEnvelope {
        MessageEnvelope {
            producer_metadata: ProducerMetadata::new(ProducerGuid::ZERO, 0, 0),
            leader_metadata: None,
            payload: MessagePayload::Put(PutPayload {
                schema_id: 1,
                value: Bytes::from_static(value),
            }),
        }
    }

    #[tokio::test]
    async fn test_broker_append_poll_round_trip() {
        let broker = Arc::new(InMemoryBroker::new());
        let upstream = InMemoryUpstreamClient::new(broker.clone());

        broker.append(
            "u",
            "orders_v1",
            0,
            RecordKey::data(&b"a"[..]),
            data_envelope(b"1"),
        );
        broker.append(
            "u",
            "orders_v1",
            0,
            RecordKey::data(&b"b"[..]),
            data_envelope(b"2"),
        );

        upstream.subscribe("orders_v1", 0, LOWEST_OFFSET, "u").await.unwrap();
        let polled = upstream.poll().await.unwrap();
        assert_eq!(polled.len(), 2);
        assert_eq!(polled[0].offset, 0);
        assert_eq!(polled[1].offset, 1);

        // Nothing new to poll.
        assert!(upstream.poll().await.unwrap().is_empty());

        // New appends are picked up from the stored position.
        broker.append(
            "u",
            "orders_v1",
            0,
            RecordKey::data(&b"c"[..]),
            data_envelope(b"3"),
        );
        let polled = upstream.poll().await.unwrap();
        assert_eq!(polled.len(), 1);
        assert_eq!(polled[0].offset, 2);
    }

    #[tokio::test]
    async fn test_broker_base_offset() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.set_base_offset("u", "orders_rt", 0, 50);
        let offset = broker.append(
            "u",
            "orders_rt",
            0,
            RecordKey::data(&b"k"[..]),
            data_envelope(b"v"),
        );
        assert_eq!(offset, 50);
        assert_eq!(broker.end_offset("u", "orders_rt", 0), 51);

        let upstream = InMemoryUpstreamClient::new(broker.clone());
        upstream.subscribe("orders_rt", 0, LOWEST_OFFSET, "u").await.unwrap();
        let polled = upstream.poll().await.unwrap();
        assert_eq!(polled.len(), 1);
        assert_eq!(polled[0].offset, 50);
    }

    #[tokio::test]
    async fn test_subscribe_resumes_after_offset() {
        let broker = Arc::new(InMemoryBroker::new());
        for value in [&b"1"[..], b"2", b"3"] {
            broker.append(
                "u",
                "orders_v1",
                0,
                RecordKey::data(&b"k"[..]),
                MessageEnvelope {
                    producer_metadata: ProducerMetadata::new(ProducerGuid::ZERO, 0, 0),
                    leader_metadata: None,
                    payload: MessagePayload::Put(PutPayload {
                        schema_id: 1,
                        value: Bytes::copy_from_slice(value),
                    }),
                },
            );
        }
        let upstream = InMemoryUpstreamClient::new(broker.clone());
        // Subscribing at offset 1 resumes from offset 2.
        upstream.subscribe("orders_v1", 0, 1, "u").await.unwrap();
        let polled = upstream.poll().await.unwrap();
        assert_eq!(polled.len(), 1);
        assert_eq!(polled[0].offset, 2);
    }

    #[tokio::test]
    async fn test_offset_for_timestamp() {
        let broker = Arc::new(InMemoryBroker::new());
        for ts in [100, 200, 300] {
            let mut env = data_envelope(b"v");
            env.producer_metadata.message_timestamp_ms = ts;
            broker.append("u", "orders_rt", 0, RecordKey::data(&b"k"[..]), env);
        }
        assert_eq!(broker.offset_for_timestamp("u", "orders_rt", 0, 150), Some(1));
        assert_eq!(broker.offset_for_timestamp("u", "orders_rt", 0, 300), Some(2));
        assert_eq!(broker.offset_for_timestamp("u", "orders_rt", 0, 301), None);
    }

    #[tokio::test]
    async fn test_producer_appends_to_version_topic() {
        let broker = Arc::new(InMemoryBroker::new());
        let producer = InMemoryProducerClient::new(broker.clone(), "u", "orders_v1");
        let completion = producer
            .put(
                Bytes::from_static(b"k"),
                Bytes::from_static(b"v"),
                1,
                0,
                LeaderMetadata {
                    upstream_offset: 50,
                    upstream_cluster_id: 0,
                    host_name: "host-a".to_string(),
                },
            )
            .await
            .unwrap();
        let result = completion.wait().await.unwrap();
        assert_eq!(result.offset, 0);

        let records = broker.records("u", "orders_v1", 0);
        assert_eq!(records.len(), 1);
        let footer = records[0].value.leader_metadata.as_ref().unwrap();
        assert_eq!(footer.upstream_offset, 50);
        assert_eq!(footer.host_name, "host-a");
    }

    #[tokio::test]
    async fn test_producer_sequences_per_partition() {
        let producer = InMemoryProducerClient::detached();
        let meta_a = producer.next_producer_metadata(0);
        let meta_b = producer.next_producer_metadata(0);
        let meta_other = producer.next_producer_metadata(1);
        assert_eq!(meta_a.sequence_number, 0);
        assert_eq!(meta_b.sequence_number, 1);
        assert_eq!(meta_other.sequence_number, 0);

        producer.end_segment(0, true).await.unwrap();
        let meta_c = producer.next_producer_metadata(0);
        assert_eq!(meta_c.segment_number, 1);
        assert_eq!(meta_c.sequence_number, 0);
    }

    #[tokio::test]
    async fn test_producer_held_acks_release_in_order() {
        let broker = Arc::new(InMemoryBroker::new());
        let producer = InMemoryProducerClient::new(broker.clone(), "u", "orders_v1");
        producer.hold_acks();

        let first = producer
            .put(
                Bytes::from_static(b"a"),
                Bytes::from_static(b"1"),
                1,
                0,
                LeaderMetadata::unsourced("h"),
            )
            .await
            .unwrap();
        let second = producer
            .put(
                Bytes::from_static(b"b"),
                Bytes::from_static(b"2"),
                1,
                0,
                LeaderMetadata::unsourced("h"),
            )
            .await
            .unwrap();
        assert_eq!(producer.held_ack_count(), 2);

        // Records are already sequenced even though unacknowledged.
        assert_eq!(broker.end_offset("u", "orders_v1", 0), 2);

        producer.release_held_acks();
        assert_eq!(first.wait().await.unwrap().offset, 0);
        assert_eq!(second.wait().await.unwrap().offset, 1);
    }

    #[tokio::test]
    async fn test_producer_chunking() {
        let broker = Arc::new(InMemoryBroker::new());
        let producer = InMemoryProducerClient::new(broker.clone(), "u", "orders_v1");
        producer.update_chunking_enabled(true);
        producer.set_chunk_size_limit(4);

        let completion = producer
            .put(
                Bytes::from_static(b"key"),
                Bytes::from_static(b"0123456789"),
                7,
                0,
                LeaderMetadata::unsourced("h"),
            )
            .await
            .unwrap();
        let result = completion.wait().await.unwrap();
        let chunking = result.chunking.expect("chunked");
        assert_eq!(chunking.chunks.len(), 3);
        assert_eq!(
            chunking.manifest.keys_with_chunk_id_suffix.len(),
            chunking.chunks.len()
        );
        assert_eq!(chunking.manifest.total_value_size, 10);
        // Three chunk records plus the manifest.
        assert_eq!(broker.records("u", "orders_v1", 0).len(), 4);
        // The acknowledged offset is the manifest's.
        assert_eq!(result.offset, 3);
    }

    #[tokio::test]
    async fn test_storage_engine_batch_mode_and_failures() {
        let storage = InMemoryStorageEngine::new();
        storage.begin_batch_write(0).await.unwrap();
        assert!(storage.is_batch_mode(0));
        storage.put(0, b"k", b"v").await.unwrap();
        storage.end_batch_write(0).await.unwrap();
        assert!(!storage.is_batch_mode(0));

        storage.fail_writes(true);
        assert!(storage.put(0, b"k2", b"v2").await.is_err());
        storage.fail_writes(false);
        assert_eq!(storage.get(0, b"k").await.unwrap(), Some(b"v".to_vec()));

        storage.drop_partition(0).await.unwrap();
        assert_eq!(storage.get(0, b"k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_recording_reporter() {
        let reporter = RecordingStatusReporter::new();
        reporter.report_started(1).await;
        reporter.report_completed(1).await;
        reporter.report_error(2, "boom").await;
        assert!(reporter.has_completed(1));
        assert!(!reporter.has_completed(2));
        assert!(reporter.has_error(2));
        assert_eq!(reporter.error_messages(2), vec!["boom".to_string()]);
        assert_eq!(reporter.events().len(), 3);
    }

    #[tokio::test]
    async fn test_update_processors() {
        let overwrite = OverwriteUpdateProcessor;
        let update = UpdatePayload {
            schema_id: 1,
            derived_schema_id: 1,
            update: Bytes::from_static(b"new"),
        };
        assert_eq!(
            overwrite.apply_update(Some(b"old"), Some(1), &update).await.unwrap(),
            Some(b"new".to_vec())
        );
        let delete = UpdatePayload {
            schema_id: 1,
            derived_schema_id: 1,
            update: Bytes::from_static(DELETE_UPDATE_PAYLOAD),
        };
        assert_eq!(
            overwrite.apply_update(Some(b"old"), Some(1), &delete).await.unwrap(),
            None
        );

        let appending = AppendingUpdateProcessor;
        assert_eq!(
            appending.apply_update(Some(b"a"), Some(1), &update).await.unwrap(),
            Some(b"anew".to_vec())
        );
        assert_eq!(
            appending.apply_update(None, None, &update).await.unwrap(),
            Some(b"new".to_vec())
        );
    }
}
