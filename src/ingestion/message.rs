//! Record and control-message vocabulary for upstream topics.
//!
//! Every record on a version, real-time, or stream-reprocessing topic is a
//! key plus a [`MessageEnvelope`]. The envelope carries the producer's
//! identity and position (used by data-integrity validation), an optional
//! leader metadata footer (attached by leaders when re-producing consumed
//! records), and the payload: a data operation or a control message.
//!
//! # Storage row format
//!
//! Values are stored with a 4-byte big-endian schema id header followed by
//! the raw serialized value. Chunks and chunked-value manifests use reserved
//! negative schema ids so readers can tell them apart from user data.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::types::{Offset, ProducerGuid};

/// Length of the schema id header prepended to every stored value.
pub const SCHEMA_HEADER_LENGTH: usize = 4;

/// Reserved schema id for individual value chunks.
pub const CHUNK_SCHEMA_ID: i32 = -10;

/// Reserved schema id for chunked-value manifests.
pub const CHUNKED_VALUE_MANIFEST_SCHEMA_ID: i32 = -20;

/// Record key with a control-message marker bit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordKey {
    /// True for control messages; their keys are not user keys.
    pub control: bool,
    pub key: Bytes,
}

impl RecordKey {
    pub fn data(key: impl Into<Bytes>) -> Self {
        Self {
            control: false,
            key: key.into(),
        }
    }

    pub fn control() -> Self {
        Self {
            control: true,
            key: Bytes::new(),
        }
    }

    pub fn is_control_message(&self) -> bool {
        self.control
    }
}

/// Identity and position of the producer that wrote a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerMetadata {
    pub guid: ProducerGuid,
    pub segment_number: i32,
    pub sequence_number: i32,
    pub message_timestamp_ms: i64,
    /// Offset of the source record when this record was re-produced by a
    /// leader in pass-through mode; `-1` otherwise.
    pub upstream_offset: Offset,
}

impl ProducerMetadata {
    pub fn new(guid: ProducerGuid, segment_number: i32, sequence_number: i32) -> Self {
        Self {
            guid,
            segment_number,
            sequence_number,
            message_timestamp_ms: 0,
            upstream_offset: -1,
        }
    }
}

/// Footer attached by a leader replica when producing to the version topic.
///
/// Pass-through re-production preserves the upstream producer's GUID, so the
/// footer's host name is the only reliable identity of the physical leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderMetadataFooter {
    pub host_name: String,
    pub upstream_offset: Offset,
}

/// PUT payload: serialized value plus its writer schema id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutPayload {
    pub schema_id: i32,
    pub value: Bytes,
}

/// UPDATE (write-compute) payload: a delta in the derived update schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatePayload {
    /// Value schema the delta applies to; also the reader schema for the
    /// existing value lookup.
    pub schema_id: i32,
    pub derived_schema_id: i32,
    pub update: Bytes,
}

/// Control message ordering ingestion behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    StartOfPush { chunked: bool },
    EndOfPush,
    StartOfSegment,
    EndOfSegment,
    StartOfIncrementalPush { version: String },
    EndOfIncrementalPush { version: String },
    TopicSwitch(crate::ingestion::offsets::TopicSwitch),
    /// Legacy buffer-replay marker; receiving one in leader/follower mode is
    /// a fatal protocol violation.
    StartOfBufferReplay,
}

impl ControlMessage {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ControlMessage::StartOfPush { .. } => "StartOfPush",
            ControlMessage::EndOfPush => "EndOfPush",
            ControlMessage::StartOfSegment => "StartOfSegment",
            ControlMessage::EndOfSegment => "EndOfSegment",
            ControlMessage::StartOfIncrementalPush { .. } => "StartOfIncrementalPush",
            ControlMessage::EndOfIncrementalPush { .. } => "EndOfIncrementalPush",
            ControlMessage::TopicSwitch(_) => "TopicSwitch",
            ControlMessage::StartOfBufferReplay => "StartOfBufferReplay",
        }
    }

    /// Segment bookkeeping markers get quieter logging than the rest.
    pub fn is_segment_control_message(&self) -> bool {
        matches!(
            self,
            ControlMessage::StartOfSegment | ControlMessage::EndOfSegment
        )
    }
}

/// Payload union of a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessagePayload {
    Put(PutPayload),
    Delete,
    Update(UpdatePayload),
    Control(ControlMessage),
}

impl MessagePayload {
    pub fn type_name(&self) -> &'static str {
        match self {
            MessagePayload::Put(_) => "PUT",
            MessagePayload::Delete => "DELETE",
            MessagePayload::Update(_) => "UPDATE",
            MessagePayload::Control(_) => "CONTROL",
        }
    }
}

/// Full record value as it appears on an upstream topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEnvelope {
    pub producer_metadata: ProducerMetadata,
    pub leader_metadata: Option<LeaderMetadataFooter>,
    pub payload: MessagePayload,
}

impl MessageEnvelope {
    /// Resolve the upstream offset carried by this record, if any.
    ///
    /// The leader metadata footer wins over the producer metadata because
    /// pass-through re-production reuses the upstream producer metadata
    /// verbatim.
    pub fn upstream_offset(&self) -> Option<Offset> {
        if let Some(footer) = &self.leader_metadata {
            if footer.upstream_offset >= 0 {
                return Some(footer.upstream_offset);
            }
        }
        if self.producer_metadata.upstream_offset >= 0 {
            return Some(self.producer_metadata.upstream_offset);
        }
        None
    }
}

/// One record polled from an upstream topic partition.
#[derive(Debug, Clone)]
pub struct ConsumedRecord {
    /// Cluster the record was consumed from.
    pub url: String,
    pub topic: String,
    pub partition: u32,
    pub offset: Offset,
    pub key: RecordKey,
    pub value: MessageEnvelope,
    pub serialized_key_size: usize,
    pub serialized_value_size: usize,
}

impl ConsumedRecord {
    /// Approximate heap footprint used for drainer memory accounting.
    pub fn payload_size(&self) -> usize {
        self.serialized_key_size + self.serialized_value_size
    }
}

/// Prepend the 4-byte schema header to a value for storage.
pub fn prepend_schema_header(schema_id: i32, value: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(SCHEMA_HEADER_LENGTH + value.len());
    buf.put_i32(schema_id);
    buf.put_slice(value);
    buf.freeze()
}

/// Split a stored row into its schema id and raw value.
///
/// Returns `None` for rows shorter than the header.
pub fn split_schema_header(stored: &[u8]) -> Option<(i32, &[u8])> {
    if stored.len() < SCHEMA_HEADER_LENGTH {
        return None;
    }
    let schema_id = i32::from_be_bytes([stored[0], stored[1], stored[2], stored[3]]);
    Some((schema_id, &stored[SCHEMA_HEADER_LENGTH..]))
}
