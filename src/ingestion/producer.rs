//! Version-topic producer seam and the shared producer gateway.
//!
//! One producer instance is shared by every partition of an ingestion task.
//! With native replication, many leader partitions can hit it simultaneously
//! during the start of a batch push, so the instance is created lazily under
//! a one-shot initializer and only closed at task shutdown. Per-partition
//! DIV segments are opened on first produce and closed on demotion via
//! [`ProducerClient::end_segment`].
//!
//! # Callback ordering
//!
//! [`ProducerClient`] send methods return a [`ProduceCompletion`] immediately
//! after the record is sequenced; the acknowledgement arrives later. The
//! ingestion task awaits completions in send order (per partition), which is
//! what makes producer-callback-ordered persistence work: chunk and manifest
//! records enter the drainer in exactly the order they were produced.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tokio::sync::oneshot;

use async_trait::async_trait;

use crate::error::{IngestionError, Result};
use crate::ingestion::completion::CompletionSignal;
use crate::ingestion::message::{
    ControlMessage, MessageEnvelope, ProducerMetadata, PutPayload, RecordKey,
};
use crate::types::Offset;

/// Leader-side metadata attached to every produced record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderMetadata {
    /// Offset of the consumed source record; `-1` when not applicable.
    pub upstream_offset: Offset,
    /// Cluster the source record came from; `-1` when unknown.
    pub upstream_cluster_id: i32,
    /// Host producing the record; identifies the leader across pass-through.
    pub host_name: String,
}

impl LeaderMetadata {
    /// Metadata for records with no upstream source (e.g. TopicSwitch).
    pub fn unsourced(host_name: impl Into<String>) -> Self {
        Self {
            upstream_offset: -1,
            upstream_cluster_id: -1,
            host_name: host_name.into(),
        }
    }
}

/// Manifest describing a chunked value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkedValueManifest {
    /// Writer schema of the reassembled value.
    pub schema_id: i32,
    /// Storage keys of the chunks, in order; length equals the chunk count.
    pub keys_with_chunk_id_suffix: Vec<Bytes>,
    pub total_value_size: usize,
}

impl ChunkedValueManifest {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Chunking output attached to a produce acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkingInfo {
    /// The key the manifest is stored under.
    pub top_level_key: Bytes,
    /// Chunk values in order; `manifest.keys_with_chunk_id_suffix[i]` is the
    /// storage key of `chunks[i]`.
    pub chunks: Vec<Bytes>,
    pub manifest: ChunkedValueManifest,
}

/// Acknowledgement of one produced record.
#[derive(Debug, Clone)]
pub struct ProduceResult {
    /// Partition the record actually landed in (the producer partitions
    /// real-time fan-out itself).
    pub partition: u32,
    pub offset: Offset,
    pub serialized_key_size: usize,
    pub serialized_value_size: usize,
    /// Set when the value was chunked; the offset above is the manifest's.
    pub chunking: Option<ChunkingInfo>,
}

/// Ack payload: the result or a rendered producer error.
pub type ProduceAck = std::result::Result<ProduceResult, String>;

/// Receiving half of a pending produce acknowledgement.
#[derive(Debug)]
pub struct ProduceCompletion {
    rx: oneshot::Receiver<ProduceAck>,
}

impl ProduceCompletion {
    /// Create a linked handle/completion pair.
    pub fn pair() -> (ProduceHandle, ProduceCompletion) {
        let (tx, rx) = oneshot::channel();
        (ProduceHandle { tx }, ProduceCompletion { rx })
    }

    /// Completion that is already acknowledged.
    pub fn ready(ack: ProduceAck) -> ProduceCompletion {
        let (handle, completion) = Self::pair();
        handle.complete(ack);
        completion
    }

    /// Await the acknowledgement.
    pub async fn wait(self) -> ProduceAck {
        self.rx
            .await
            .unwrap_or_else(|_| Err("producer dropped the acknowledgement".to_string()))
    }
}

/// Sending half of a pending produce acknowledgement.
#[derive(Debug)]
pub struct ProduceHandle {
    tx: oneshot::Sender<ProduceAck>,
}

impl ProduceHandle {
    pub fn complete(self, ack: ProduceAck) {
        let _ = self.tx.send(ack);
    }
}

/// Downstream version-topic producer (external collaborator).
///
/// Send methods sequence the record synchronously and return a
/// [`ProduceCompletion`] that resolves when the record is acknowledged.
/// Implementations must acknowledge records in send order per partition.
#[async_trait]
pub trait ProducerClient: Send + Sync {
    /// Produce a data record with this producer's own metadata.
    async fn put(
        &self,
        key: Bytes,
        value: Bytes,
        schema_id: i32,
        partition: u32,
        leader_metadata: LeaderMetadata,
    ) -> Result<ProduceCompletion>;

    /// Re-produce a consumed record preserving its upstream producer
    /// metadata (pass-through mode), so downstream validation still holds.
    async fn put_passthrough(
        &self,
        key: RecordKey,
        envelope: MessageEnvelope,
        partition: u32,
        leader_metadata: LeaderMetadata,
    ) -> Result<ProduceCompletion>;

    /// Produce a deletion tombstone.
    async fn delete(
        &self,
        key: Bytes,
        partition: u32,
        leader_metadata: LeaderMetadata,
    ) -> Result<ProduceCompletion>;

    /// Produce a control message, optionally preserving upstream producer
    /// metadata.
    async fn send_control_message(
        &self,
        control: ControlMessage,
        partition: u32,
        leader_metadata: LeaderMetadata,
        passthrough: Option<ProducerMetadata>,
    ) -> Result<ProduceCompletion>;

    /// Toggle value chunking; flipped when StartOfPush announces it.
    fn update_chunking_enabled(&self, enabled: bool);

    /// Close the current DIV segment for a partition.
    async fn end_segment(&self, partition: u32, finalize: bool) -> Result<()>;

    /// Close every segment of a partition (unsubscribe/drop).
    async fn close_partition(&self, partition: u32) -> Result<()>;

    /// Close the producer; only called at task shutdown.
    async fn close(&self) -> Result<()>;
}

/// Payload of a leader-produced record as it goes through the drainer.
#[derive(Debug, Clone)]
pub enum LeaderProducedPayload {
    Put(PutPayload),
    Delete,
    Control(ControlMessage),
}

/// Context tying a produced record back to its consumed source.
///
/// Created before the produce call, completed by the producer callback with
/// the produced offset, applied by the drainer. Individual chunks carry
/// `-1` for both offsets and must not mutate the offset record; only the
/// manifest record does.
#[derive(Debug, Clone)]
pub struct LeaderProducedRecordContext {
    pub consumed_offset: Offset,
    pub produced_offset: Offset,
    pub key: Bytes,
    pub payload: LeaderProducedPayload,
    pub persisted_to_db: CompletionSignal,
}

impl LeaderProducedRecordContext {
    pub fn new_put(consumed_offset: Offset, key: Bytes, put: PutPayload) -> Self {
        Self {
            consumed_offset,
            produced_offset: -1,
            key,
            payload: LeaderProducedPayload::Put(put),
            persisted_to_db: CompletionSignal::new(),
        }
    }

    pub fn new_delete(consumed_offset: Offset, key: Bytes) -> Self {
        Self {
            consumed_offset,
            produced_offset: -1,
            key,
            payload: LeaderProducedPayload::Delete,
            persisted_to_db: CompletionSignal::new(),
        }
    }

    pub fn new_control(consumed_offset: Offset, control: ControlMessage) -> Self {
        Self {
            consumed_offset,
            produced_offset: -1,
            key: Bytes::new(),
            payload: LeaderProducedPayload::Control(control),
            persisted_to_db: CompletionSignal::new(),
        }
    }

    /// Synthetic context for one chunk of a chunked value.
    pub fn new_chunk(key: Bytes, chunk: Bytes) -> Self {
        Self {
            consumed_offset: -1,
            produced_offset: -1,
            key,
            payload: LeaderProducedPayload::Put(PutPayload {
                schema_id: crate::ingestion::message::CHUNK_SCHEMA_ID,
                value: chunk,
            }),
            persisted_to_db: CompletionSignal::new(),
        }
    }

    /// Bytes this context contributes to drainer memory accounting.
    pub fn payload_size(&self) -> usize {
        let value_size = match &self.payload {
            LeaderProducedPayload::Put(put) => put.value.len(),
            LeaderProducedPayload::Delete => 0,
            LeaderProducedPayload::Control(_) => 64,
        };
        self.key.len() + value_size
    }
}

/// Factory producing the lazily-created shared producer.
pub type ProducerFactory =
    Box<dyn Fn(bool) -> Result<std::sync::Arc<dyn ProducerClient>> + Send + Sync>;

/// Lazily-initialized shared producer, one per ingestion task.
///
/// The factory runs at most once, on the first produce; it receives the
/// chunking flag from the store version state when one exists (a leader
/// consuming mid-stream may create the producer before StartOfPush is seen,
/// in which case chunking defaults to off and is corrected by
/// [`ProducerClient::update_chunking_enabled`] when StartOfPush lands).
pub struct ProducerGateway {
    cell: OnceCell<std::sync::Arc<dyn ProducerClient>>,
    factory: ProducerFactory,
}

impl ProducerGateway {
    pub fn new(factory: ProducerFactory) -> Self {
        Self {
            cell: OnceCell::new(),
            factory,
        }
    }

    /// Get the shared producer, creating it on first use.
    pub async fn get_or_init(
        &self,
        chunking_enabled: bool,
    ) -> Result<std::sync::Arc<dyn ProducerClient>> {
        self.cell
            .get_or_try_init(|| async { (self.factory)(chunking_enabled) })
            .await
            .cloned()
    }

    /// The producer, if it was ever created.
    pub fn get(&self) -> Option<std::sync::Arc<dyn ProducerClient>> {
        self.cell.get().cloned()
    }

    /// Close the producer if it was created; called only at task shutdown.
    pub async fn close(&self) -> Result<()> {
        match self.cell.get() {
            Some(client) => client.close().await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for ProducerGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerGateway")
            .field("initialized", &self.cell.get().is_some())
            .finish()
    }
}

/// Error helper for producer failures.
pub fn producer_error(message: impl Into<String>) -> IngestionError {
    IngestionError::Producer(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_produce_completion_round_trip() {
        let (handle, completion) = ProduceCompletion::pair();
        handle.complete(Ok(ProduceResult {
            partition: 2,
            offset: 41,
            serialized_key_size: 3,
            serialized_value_size: 9,
            chunking: None,
        }));
        let ack = completion.wait().await.expect("ok ack");
        assert_eq!(ack.partition, 2);
        assert_eq!(ack.offset, 41);
    }

    #[tokio::test]
    async fn test_dropped_handle_surfaces_as_error() {
        let (handle, completion) = ProduceCompletion::pair();
        drop(handle);
        let ack = completion.wait().await;
        assert!(ack.is_err());
    }

    #[tokio::test]
    async fn test_gateway_initializes_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_factory = calls.clone();
        let gateway = ProducerGateway::new(Box::new(move |chunking| {
            calls_in_factory.fetch_add(1, Ordering::SeqCst);
            assert!(chunking);
            let client: Arc<dyn ProducerClient> =
                Arc::new(crate::ingestion::mock::InMemoryProducerClient::detached());
            Ok(client)
        }));

        let a = gateway.get_or_init(true).await.expect("init");
        let b = gateway.get_or_init(true).await.expect("cached");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(gateway.get().is_some());
    }

    #[tokio::test]
    async fn test_gateway_uninitialized_close_is_noop() {
        let gateway = ProducerGateway::new(Box::new(|_| {
            panic!("factory must not run");
        }));
        assert!(gateway.get().is_none());
        gateway.close().await.expect("noop close");
    }

    #[test]
    fn test_manifest_round_trip() {
        let manifest = ChunkedValueManifest {
            schema_id: 5,
            keys_with_chunk_id_suffix: vec![Bytes::from_static(b"k0"), Bytes::from_static(b"k1")],
            total_value_size: 2048,
        };
        let bytes = manifest.to_bytes().expect("encode");
        let decoded = ChunkedValueManifest::from_bytes(&bytes).expect("decode");
        assert_eq!(decoded, manifest);
    }

    #[test]
    fn test_chunk_context_is_synthetic() {
        let ctx = LeaderProducedRecordContext::new_chunk(
            Bytes::from_static(b"key-chunk-0"),
            Bytes::from_static(b"chunk-bytes"),
        );
        assert_eq!(ctx.consumed_offset, -1);
        assert_eq!(ctx.produced_offset, -1);
        match &ctx.payload {
            LeaderProducedPayload::Put(put) => {
                assert_eq!(put.schema_id, crate::ingestion::message::CHUNK_SCHEMA_ID);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }
}
