//! Configuration for an ingestion task.
//!
//! All tunables recognized by the engine live here, with defaults matching
//! production experience. Construct via [`IngestionConfig::default`] and
//! override fields, or deserialize from a config file; always call
//! [`IngestionConfig::validate`] before handing the config to a task.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{IngestionError, Result};

/// Default delay before a replica in transition is promoted to leader (5 min).
pub const DEFAULT_PROMOTION_TO_LEADER_REPLICA_DELAY: Duration = Duration::from_secs(300);

/// Default promotion delay for system stores, which need fast leader failover.
pub const DEFAULT_SYSTEM_STORE_PROMOTION_TO_LEADER_REPLICA_DELAY: Duration =
    Duration::from_secs(30);

/// Default deadline for a partition to complete its bootstrap ingestion (24 h).
pub const DEFAULT_BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Default drainer buffer memory capacity (125 MiB).
pub const DEFAULT_DRAINER_BUFFER_MEMORY_CAPACITY: usize = 125 * 1024 * 1024;

/// Default free-memory delta before blocked enqueuers are woken (10 MiB).
pub const DEFAULT_DRAINER_BUFFER_NOTIFY_DELTA: usize = 10 * 1024 * 1024;

/// Default number of drainer workers.
pub const DEFAULT_DRAINER_POOL_SIZE: usize = 8;

/// Default TTL for cached upstream end-offset lookups.
pub const DEFAULT_UPSTREAM_METADATA_TTL: Duration = Duration::from_secs(1);

/// Default number of applied records between offset-record syncs.
pub const DEFAULT_OFFSET_SYNC_INTERVAL_RECORDS: u64 = 100;

/// Default hybrid offset-lag threshold for ready-to-serve.
pub const DEFAULT_HYBRID_OFFSET_LAG_THRESHOLD: i64 = 1000;

/// Default cap on waits for in-flight producer futures.
pub const DEFAULT_PRODUCER_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

fn default_promotion_delay() -> Duration {
    DEFAULT_PROMOTION_TO_LEADER_REPLICA_DELAY
}

fn default_system_store_promotion_delay() -> Duration {
    DEFAULT_SYSTEM_STORE_PROMOTION_TO_LEADER_REPLICA_DELAY
}

fn default_bootstrap_timeout() -> Duration {
    DEFAULT_BOOTSTRAP_TIMEOUT
}

fn default_buffer_capacity() -> usize {
    DEFAULT_DRAINER_BUFFER_MEMORY_CAPACITY
}

fn default_notify_delta() -> usize {
    DEFAULT_DRAINER_BUFFER_NOTIFY_DELTA
}

fn default_drainer_pool_size() -> usize {
    DEFAULT_DRAINER_POOL_SIZE
}

fn default_metadata_ttl() -> Duration {
    DEFAULT_UPSTREAM_METADATA_TTL
}

fn default_offset_sync_interval() -> u64 {
    DEFAULT_OFFSET_SYNC_INTERVAL_RECORDS
}

fn default_hybrid_lag_threshold() -> i64 {
    DEFAULT_HYBRID_OFFSET_LAG_THRESHOLD
}

fn default_producer_wait_timeout() -> Duration {
    DEFAULT_PRODUCER_WAIT_TIMEOUT
}

fn default_amplification_factor() -> u32 {
    1
}

/// Tunables for one ingestion task.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    /// How long a new leader must observe version-topic inactivity before it
    /// actually starts consuming as leader. Protects against a demoted leader
    /// that is still producing.
    pub promotion_to_leader_replica_delay: Duration,

    /// Same as above but for system stores, which are time sensitive and get
    /// a much shorter quiet period.
    pub system_store_promotion_to_leader_replica_delay: Duration,

    /// Deadline for a subscribed partition to complete its initial ingestion.
    /// Exceeding it fails the task with a push timeout.
    pub bootstrap_timeout: Duration,

    /// Total memory budget for records queued between consumption and the
    /// drainer pool. Enqueue blocks when the budget is exhausted.
    pub drainer_buffer_memory_capacity: usize,

    /// Blocked enqueuers are only woken once at least this many bytes have
    /// been freed. Prevents a stream of small records from starving a large
    /// one. Must be strictly less than the capacity.
    pub drainer_buffer_notify_delta: usize,

    /// Number of drainer workers. Partitions are assigned to workers by
    /// modulo, so per-partition ordering is preserved.
    pub drainer_pool_size: usize,

    /// Whether leaders may consume from a remote fabric.
    pub native_replication_enabled: bool,

    /// Whether UPDATE (write-compute) messages are expected on this version.
    pub write_computation_enabled: bool,

    /// Known upstream clusters, keyed by cluster id.
    pub kafka_cluster_id_to_url_map: HashMap<i32, String>,

    /// URL of the local upstream cluster.
    pub local_upstream_url: String,

    /// TTL for cached upstream end-offset / offset-for-timestamp lookups.
    pub upstream_metadata_ttl: Duration,

    /// Number of applied records between offset-record write-throughs.
    /// Control messages always force a sync.
    pub offset_sync_interval_records: u64,

    /// Offset lag under which a hybrid partition is considered caught up.
    pub hybrid_offset_lag_threshold: i64,

    /// Ratio of version-topic sub-partitions to user partitions.
    pub amplification_factor: u32,

    /// Upper bound on waits for the last in-flight producer future during
    /// demotion and topic switches. A timeout is benign: the future is
    /// cancelled and the partition continues.
    pub producer_wait_timeout: Duration,

    /// True if this version belongs to a system store (fast failover).
    pub is_system_store: bool,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            promotion_to_leader_replica_delay: default_promotion_delay(),
            system_store_promotion_to_leader_replica_delay: default_system_store_promotion_delay(),
            bootstrap_timeout: default_bootstrap_timeout(),
            drainer_buffer_memory_capacity: default_buffer_capacity(),
            drainer_buffer_notify_delta: default_notify_delta(),
            drainer_pool_size: default_drainer_pool_size(),
            native_replication_enabled: false,
            write_computation_enabled: false,
            kafka_cluster_id_to_url_map: HashMap::new(),
            local_upstream_url: String::new(),
            upstream_metadata_ttl: default_metadata_ttl(),
            offset_sync_interval_records: default_offset_sync_interval(),
            hybrid_offset_lag_threshold: default_hybrid_lag_threshold(),
            amplification_factor: default_amplification_factor(),
            producer_wait_timeout: default_producer_wait_timeout(),
            is_system_store: false,
        }
    }
}

impl IngestionConfig {
    /// The promotion quiet period applicable to this store type.
    pub fn new_leader_inactive_time(&self) -> Duration {
        if self.is_system_store {
            self.system_store_promotion_to_leader_replica_delay
        } else {
            self.promotion_to_leader_replica_delay
        }
    }

    /// Reverse lookup: cluster URL to cluster id (`-1` when unknown).
    pub fn cluster_id_for_url(&self, url: &str) -> i32 {
        self.kafka_cluster_id_to_url_map
            .iter()
            .find_map(|(id, u)| (u == url).then_some(*id))
            .unwrap_or(-1)
    }

    /// Validate internal consistency. Call before constructing a task.
    pub fn validate(&self) -> Result<()> {
        if self.local_upstream_url.is_empty() {
            return Err(IngestionError::Config(
                "local_upstream_url must be set".to_string(),
            ));
        }
        if self.drainer_pool_size == 0 {
            return Err(IngestionError::Config(
                "drainer_pool_size must be at least 1".to_string(),
            ));
        }
        if self.drainer_buffer_memory_capacity == 0 {
            return Err(IngestionError::Config(
                "drainer_buffer_memory_capacity must be non-zero".to_string(),
            ));
        }
        if self.drainer_buffer_notify_delta >= self.drainer_buffer_memory_capacity {
            return Err(IngestionError::Config(format!(
                "drainer_buffer_notify_delta ({}) must be smaller than \
                 drainer_buffer_memory_capacity ({})",
                self.drainer_buffer_notify_delta, self.drainer_buffer_memory_capacity
            )));
        }
        if self.amplification_factor == 0 {
            return Err(IngestionError::Config(
                "amplification_factor must be at least 1".to_string(),
            ));
        }
        if self.hybrid_offset_lag_threshold < 0 {
            return Err(IngestionError::Config(
                "hybrid_offset_lag_threshold must be non-negative".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> IngestionConfig {
        IngestionConfig {
            local_upstream_url: "kafka://local:9092".to_string(),
            ..IngestionConfig::default()
        }
    }

    #[test]
    fn test_default_is_valid_once_url_is_set() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_missing_local_url_rejected() {
        let config = IngestionConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_notify_delta_must_be_below_capacity() {
        let mut config = valid_config();
        config.drainer_buffer_memory_capacity = 1024;
        config.drainer_buffer_notify_delta = 1024;
        assert!(config.validate().is_err());

        config.drainer_buffer_notify_delta = 1023;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_drainers_rejected() {
        let mut config = valid_config();
        config.drainer_pool_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_amplification_rejected() {
        let mut config = valid_config();
        config.amplification_factor = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_system_store_uses_short_promotion_delay() {
        let mut config = valid_config();
        assert_eq!(
            config.new_leader_inactive_time(),
            DEFAULT_PROMOTION_TO_LEADER_REPLICA_DELAY
        );
        config.is_system_store = true;
        assert_eq!(
            config.new_leader_inactive_time(),
            DEFAULT_SYSTEM_STORE_PROMOTION_TO_LEADER_REPLICA_DELAY
        );
    }

    #[test]
    fn test_cluster_id_reverse_lookup() {
        let mut config = valid_config();
        config
            .kafka_cluster_id_to_url_map
            .insert(2, "kafka://remote:9092".to_string());
        assert_eq!(config.cluster_id_for_url("kafka://remote:9092"), 2);
        assert_eq!(config.cluster_id_for_url("kafka://nowhere:9092"), -1);
    }
}
