//! TTL-cached upstream metadata lookups.
//!
//! Readiness checking runs for every applied record once end-of-push is
//! received; hitting the upstream cluster for an end offset each time would
//! melt it. Lookups are cached with a short TTL, keyed by cluster URL plus
//! topic partition. Entries are immutable once inserted; writers racing to
//! refresh an expired entry may both consult upstream and the last write
//! wins, which is fine because both observed values are current within a TTL.

use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;

use crate::error::Result;
use crate::ingestion::traits::UpstreamClient;
use crate::types::Offset;

/// Cache key for end-offset lookups.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndOffsetKey {
    url: String,
    topic: String,
    partition: u32,
}

/// Cache key for offset-for-timestamp lookups.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TimestampKey {
    url: String,
    topic: String,
    partition: u32,
    timestamp_ms: i64,
}

/// TTL cache over [`UpstreamClient`] metadata calls.
pub struct UpstreamMetadataCache {
    upstream: Arc<dyn UpstreamClient>,
    end_offsets: Cache<EndOffsetKey, Offset>,
    timestamp_offsets: Cache<TimestampKey, Option<Offset>>,
}

impl UpstreamMetadataCache {
    pub fn new(upstream: Arc<dyn UpstreamClient>, ttl: Duration) -> Self {
        Self {
            upstream,
            end_offsets: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(ttl)
                .build(),
            timestamp_offsets: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// End offset of a topic partition, at most one TTL stale.
    pub async fn end_offset(&self, url: &str, topic: &str, partition: u32) -> Result<Offset> {
        let key = EndOffsetKey {
            url: url.to_string(),
            topic: topic.to_string(),
            partition,
        };
        if let Some(cached) = self.end_offsets.get(&key) {
            return Ok(cached);
        }
        let offset = self.upstream.end_offset(topic, partition, url).await?;
        self.end_offsets.insert(key, offset);
        Ok(offset)
    }

    /// Offset of the first record at-or-after `timestamp_ms`, TTL cached.
    pub async fn offset_for_timestamp(
        &self,
        url: &str,
        topic: &str,
        partition: u32,
        timestamp_ms: i64,
    ) -> Result<Option<Offset>> {
        let key = TimestampKey {
            url: url.to_string(),
            topic: topic.to_string(),
            partition,
            timestamp_ms,
        };
        if let Some(cached) = self.timestamp_offsets.get(&key) {
            return Ok(cached);
        }
        let offset = self
            .upstream
            .offset_for_timestamp(topic, partition, timestamp_ms, url)
            .await?;
        self.timestamp_offsets.insert(key, offset);
        Ok(offset)
    }

    /// Drop all cached entries (tests and topic deletions).
    pub fn invalidate_all(&self) {
        self.end_offsets.invalidate_all();
        self.timestamp_offsets.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::message::{MessagePayload, ProducerMetadata};
    use crate::ingestion::mock::{InMemoryBroker, InMemoryUpstreamClient};
    use crate::types::ProducerGuid;
    use bytes::Bytes;

    fn put_envelope() -> crate::ingestion::message::MessageEnvelope {
        crate::ingestion::message::MessageEnvelope {
            producer_metadata: ProducerMetadata::new(ProducerGuid::ZERO, 0, 0),
            leader_metadata: None,
            payload: MessagePayload::Put(crate::ingestion::message::PutPayload {
                schema_id: 1,
                value: Bytes::from_static(b"v"),
            }),
        }
    }

    #[tokio::test]
    async fn test_end_offset_cached_within_ttl() {
        let broker = Arc::new(InMemoryBroker::new());
        let upstream = Arc::new(InMemoryUpstreamClient::new(broker.clone()));
        let cache = UpstreamMetadataCache::new(upstream, Duration::from_secs(60));

        broker.append(
            "kafka://local",
            "orders_v1",
            0,
            crate::ingestion::message::RecordKey::data(&b"k"[..]),
            put_envelope(),
        );
        assert_eq!(
            cache.end_offset("kafka://local", "orders_v1", 0).await.unwrap(),
            1
        );

        // A new record lands, but the cached value is still served.
        broker.append(
            "kafka://local",
            "orders_v1",
            0,
            crate::ingestion::message::RecordKey::data(&b"k2"[..]),
            put_envelope(),
        );
        assert_eq!(
            cache.end_offset("kafka://local", "orders_v1", 0).await.unwrap(),
            1
        );

        cache.invalidate_all();
        assert_eq!(
            cache.end_offset("kafka://local", "orders_v1", 0).await.unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_entries_keyed_by_cluster_url() {
        let broker = Arc::new(InMemoryBroker::new());
        let upstream = Arc::new(InMemoryUpstreamClient::new(broker.clone()));
        let cache = UpstreamMetadataCache::new(upstream, Duration::from_secs(60));

        broker.append(
            "kafka://a",
            "orders_rt",
            0,
            crate::ingestion::message::RecordKey::data(&b"k"[..]),
            put_envelope(),
        );

        assert_eq!(cache.end_offset("kafka://a", "orders_rt", 0).await.unwrap(), 1);
        assert_eq!(cache.end_offset("kafka://b", "orders_rt", 0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_absent_timestamp_offset_is_cached() {
        let broker = Arc::new(InMemoryBroker::new());
        let upstream = Arc::new(InMemoryUpstreamClient::new(broker.clone()));
        let cache = UpstreamMetadataCache::new(upstream, Duration::from_secs(60));

        let miss = cache
            .offset_for_timestamp("kafka://a", "orders_rt", 0, 10_000)
            .await
            .unwrap();
        assert!(miss.is_none());

        // Appending afterwards does not change the cached miss until expiry.
        let mut env = put_envelope();
        env.producer_metadata.message_timestamp_ms = 20_000;
        broker.append(
            "kafka://a",
            "orders_rt",
            0,
            crate::ingestion::message::RecordKey::data(&b"k"[..]),
            env,
        );
        let still_miss = cache
            .offset_for_timestamp("kafka://a", "orders_rt", 0, 10_000)
            .await
            .unwrap();
        assert!(still_miss.is_none());

        cache.invalidate_all();
        let hit = cache
            .offset_for_timestamp("kafka://a", "orders_rt", 0, 10_000)
            .await
            .unwrap();
        assert_eq!(hit, Some(0));
    }
}
