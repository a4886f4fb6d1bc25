//! Core identifier types and topic-name taxonomy.
//!
//! A store version is materialized as one **version topic** (VT) per version,
//! fed either directly by a push job or by a leader replica re-producing from
//! a real-time or stream-reprocessing upstream. Topic names follow fixed
//! suffix conventions so that components can classify a topic without a
//! metadata lookup:
//!
//! - `orders_v3`: version topic for version 3 of store `orders`
//! - `orders_rt`: real-time topic for store `orders`
//! - `orders_v3_sr`: stream-reprocessing topic feeding version 3

use std::fmt;

use serde::{Deserialize, Serialize};

/// Log offset within a topic partition.
pub type Offset = i64;

/// Sentinel for "no offset consumed yet"; subscribing here means "from oldest".
pub const LOWEST_OFFSET: Offset = -1;

/// Partition id reserved for the storage engine's metadata partition.
pub const METADATA_PARTITION_ID: u32 = 1_000_000_000;

/// Suffix identifying a real-time topic.
pub const REAL_TIME_TOPIC_SUFFIX: &str = "_rt";

/// Suffix identifying a stream-reprocessing topic.
pub const STREAM_REPROCESSING_TOPIC_SUFFIX: &str = "_sr";

/// Infix separating a store name from its version number in a version topic.
pub const VERSION_TOPIC_SEPARATOR: &str = "_v";

/// Identity of a producer instance, carried in every produced record.
///
/// Leaders running in pass-through mode re-emit the upstream producer's GUID
/// unchanged, so a GUID alone does not identify the producing host once
/// pass-through is in play; see the leader metadata footer for that.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProducerGuid(pub [u8; 16]);

impl ProducerGuid {
    /// GUID of all zeroes, used by tests and for "unknown producer".
    pub const ZERO: ProducerGuid = ProducerGuid([0u8; 16]);

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Hex rendering for log messages.
    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(32);
        for b in self.0 {
            s.push_str(&format!("{b:02x}"));
        }
        s
    }

    /// Parse the hex rendering back into a GUID.
    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 32 {
            return None;
        }
        let mut raw = [0u8; 16];
        for (i, byte) in raw.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(ProducerGuid(raw))
    }
}

impl fmt::Debug for ProducerGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProducerGuid({})", self.to_hex())
    }
}

impl fmt::Display for ProducerGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// True if `topic` is a real-time topic.
pub fn is_real_time_topic(topic: &str) -> bool {
    topic.ends_with(REAL_TIME_TOPIC_SUFFIX)
}

/// True if `topic` is a stream-reprocessing topic.
pub fn is_stream_reprocessing_topic(topic: &str) -> bool {
    topic.ends_with(STREAM_REPROCESSING_TOPIC_SUFFIX)
}

/// True if `topic` is a version topic (neither real-time nor reprocessing).
pub fn is_version_topic(topic: &str) -> bool {
    !is_real_time_topic(topic) && !is_stream_reprocessing_topic(topic)
}

/// True if `topic` is a version topic or a stream-reprocessing topic.
///
/// Both carry the full DIV-tracked batch stream, unlike real-time topics.
pub fn is_version_topic_or_stream_reprocessing_topic(topic: &str) -> bool {
    !is_real_time_topic(topic)
}

/// Real-time topic name for a store.
pub fn real_time_topic_name(store: &str) -> String {
    format!("{store}{REAL_TIME_TOPIC_SUFFIX}")
}

/// Version topic name for a store version.
pub fn version_topic_name(store: &str, version: u32) -> String {
    format!("{store}{VERSION_TOPIC_SEPARATOR}{version}")
}

/// Stream-reprocessing topic name for a store version.
pub fn stream_reprocessing_topic_name(store: &str, version: u32) -> String {
    format!("{store}{VERSION_TOPIC_SEPARATOR}{version}{STREAM_REPROCESSING_TOPIC_SUFFIX}")
}

/// Extract the store name out of any of the three topic forms.
pub fn store_name_from_topic(topic: &str) -> &str {
    if let Some(stripped) = topic.strip_suffix(REAL_TIME_TOPIC_SUFFIX) {
        return stripped;
    }
    let base = topic
        .strip_suffix(STREAM_REPROCESSING_TOPIC_SUFFIX)
        .unwrap_or(topic);
    match base.rfind(VERSION_TOPIC_SEPARATOR) {
        Some(idx) => &base[..idx],
        None => base,
    }
}

/// Extract the version number from a version or stream-reprocessing topic.
pub fn version_number_from_topic(topic: &str) -> Option<u32> {
    let base = topic
        .strip_suffix(STREAM_REPROCESSING_TOPIC_SUFFIX)
        .unwrap_or(topic);
    let idx = base.rfind(VERSION_TOPIC_SEPARATOR)?;
    base[idx + VERSION_TOPIC_SEPARATOR.len()..].parse().ok()
}

// ============================================================================
// Amplification math
// ============================================================================
//
// With amplification factor F, every user partition maps onto F contiguous
// sub-partitions of the version topic. Only the first sub-partition of each
// user partition is entitled to produce on the user partition's behalf.

/// User partition owning a given sub-partition.
pub fn user_partition(sub_partition: u32, amplification_factor: u32) -> u32 {
    sub_partition / amplification_factor.max(1)
}

/// The sub-partition entitled to produce for a user partition.
pub fn leader_sub_partition(user_partition: u32, amplification_factor: u32) -> u32 {
    user_partition * amplification_factor.max(1)
}

/// True if `sub_partition` is the producing sub-partition of its user partition.
pub fn is_leader_sub_partition(sub_partition: u32, amplification_factor: u32) -> bool {
    let factor = amplification_factor.max(1);
    sub_partition % factor == 0
}

/// Sub-partition a record from `topic` lands in, given its source partition.
///
/// Real-time topics are partitioned by user partition; everything else is
/// already partitioned by sub-partition.
pub fn sub_partition_for_record(topic: &str, partition: u32, amplification_factor: u32) -> u32 {
    if is_real_time_topic(topic) {
        leader_sub_partition(partition, amplification_factor)
    } else {
        partition
    }
}
