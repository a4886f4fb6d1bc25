//! Prometheus metrics for the ingestion engine.
//!
//! Metrics cover:
//! - Consumption throughput split by replica role (leader vs follower)
//! - Leader production throughput
//! - Data-integrity validation outcomes (success, duplicates, fatal-after-EOP)
//! - Upstream offset rewind classification (benign vs potentially lossy)
//! - Producer failures (fatal and benign)
//! - Drainer queue memory occupancy
//!
//! # Safety
//!
//! All metrics are registered to a custom registry with the "tributary"
//! prefix to avoid name collisions with other libraries using the default
//! Prometheus registry. Registration errors are handled gracefully: if a
//! metric fails to register, an unregistered fallback metric is used instead
//! of panicking.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder, opts,
};
use tracing::warn;

/// Custom Prometheus registry for ingestion metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("tributary".to_string()), None).unwrap_or_else(|_| Registry::new())
});

fn register_int_counter_safe(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("valid counter opts");
    if let Err(e) = registry.register(Box::new(counter.clone())) {
        warn!(metric = name, error = %e, "Failed to register metric; using unregistered fallback");
    }
    counter
}

fn register_int_counter_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntCounterVec {
    let counter = IntCounterVec::new(opts!(name, help), labels).expect("valid counter opts");
    if let Err(e) = registry.register(Box::new(counter.clone())) {
        warn!(metric = name, error = %e, "Failed to register metric; using unregistered fallback");
    }
    counter
}

fn register_int_gauge_safe(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("valid gauge opts");
    if let Err(e) = registry.register(Box::new(gauge.clone())) {
        warn!(metric = name, error = %e, "Failed to register metric; using unregistered fallback");
    }
    gauge
}

/// Declare an IntCounter metric.
macro_rules! define_counter {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounter> =
            Lazy::new(|| register_int_counter_safe(&REGISTRY, $metric_name, $help));
    };
}

/// Declare an IntCounterVec metric with labels.
macro_rules! define_counter_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounterVec> = Lazy::new(|| {
            register_int_counter_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

/// Declare an IntGauge metric.
macro_rules! define_gauge {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntGauge> =
            Lazy::new(|| register_int_gauge_safe(&REGISTRY, $metric_name, $help));
    };
}

define_counter_vec!(
    RECORDS_CONSUMED,
    "records_consumed_total",
    "Records consumed from upstream topics, labeled by replica role",
    ["role"]
);

define_counter_vec!(
    BYTES_CONSUMED,
    "bytes_consumed_total",
    "Bytes consumed from upstream topics, labeled by replica role",
    ["role"]
);

define_counter!(
    RECORDS_PRODUCED,
    "leader_records_produced_total",
    "Records produced to the version topic by leader replicas"
);

define_counter!(
    BYTES_PRODUCED,
    "leader_bytes_produced_total",
    "Bytes produced to the version topic by leader replicas"
);

define_counter!(
    DIV_SUCCESS,
    "div_success_total",
    "Records that passed data-integrity validation"
);

define_counter!(
    DIV_DUPLICATE,
    "div_duplicate_total",
    "Records skipped as duplicates by data-integrity validation"
);

define_counter!(
    DIV_FATAL_POST_EOP,
    "fatal_div_post_eop_total",
    "Fatal data-integrity failures tolerated because end-of-push was already received"
);

define_counter!(
    BENIGN_LEADER_OFFSET_REWIND,
    "benign_leader_offset_rewind_total",
    "Upstream offset rewinds whose payload matched the stored data"
);

define_counter!(
    POTENTIALLY_LOSSY_LEADER_OFFSET_REWIND,
    "potentially_lossy_leader_offset_rewind_total",
    "Upstream offset rewinds whose payload diverged from the stored data"
);

define_counter!(
    LEADER_PRODUCER_FAILURE,
    "leader_producer_failure_total",
    "Version-topic produce attempts that completed with an error"
);

define_counter!(
    BENIGN_LEADER_PRODUCER_FAILURE,
    "benign_leader_producer_failure_total",
    "Bounded waits on producer futures that timed out without data loss"
);

define_counter!(
    PUSH_TIMEOUT,
    "push_timeout_total",
    "Partitions that exceeded the bootstrap ingestion deadline"
);

define_counter_vec!(
    PARTITION_ERRORS,
    "partition_errors_total",
    "Fatal partition errors surfaced by the ingestion loop, labeled by kind",
    ["kind"]
);

define_gauge!(
    DRAINER_QUEUE_MEMORY,
    "drainer_queue_memory_bytes",
    "Bytes currently held in the bounded drainer queues"
);

/// Role label for consumption metrics.
pub const ROLE_LEADER: &str = "leader";
/// Role label for consumption metrics.
pub const ROLE_FOLLOWER: &str = "follower";

/// Record consumption throughput for a role.
pub fn record_consumed(role: &str, records: u64, bytes: u64) {
    RECORDS_CONSUMED.with_label_values(&[role]).inc_by(records);
    BYTES_CONSUMED.with_label_values(&[role]).inc_by(bytes);
}

/// Record leader production throughput.
pub fn record_produced(records: u64, bytes: u64) {
    RECORDS_PRODUCED.inc_by(records);
    BYTES_PRODUCED.inc_by(bytes);
}

/// Export all registered metrics in the Prometheus text format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let before = DIV_DUPLICATE.get();
        DIV_DUPLICATE.inc();
        DIV_DUPLICATE.inc();
        assert_eq!(DIV_DUPLICATE.get(), before + 2);
    }

    #[test]
    fn test_role_labelled_consumption() {
        let before = RECORDS_CONSUMED.with_label_values(&[ROLE_LEADER]).get();
        record_consumed(ROLE_LEADER, 3, 1024);
        assert_eq!(
            RECORDS_CONSUMED.with_label_values(&[ROLE_LEADER]).get(),
            before + 3
        );
    }

    #[test]
    fn test_queue_memory_gauge_is_registered() {
        // The gauge is mutated concurrently by drainer tests, so only its
        // presence in the export is asserted here.
        DRAINER_QUEUE_MEMORY.add(0);
        let text = gather();
        assert!(text.contains("tributary_drainer_queue_memory_bytes"));
    }

    #[test]
    fn test_gather_exports_text_format() {
        DIV_SUCCESS.inc();
        let text = gather();
        assert!(text.contains("tributary_div_success_total"));
    }
}
