//! Per-partition leader/follower state.
//!
//! This module provides the explicit state machine for partition role
//! transitions plus the mutable consumption state each subscribed partition
//! carries:
//! - Offline: partition is not subscribed on this replica
//! - Standby: tailing the local version topic, applying to storage
//! - InTransitionFromStandbyToLeader: promotion requested; keeps consuming
//!   the version topic until the quiet period elapses
//! - PauseTransitionFromStandbyToLeader: promotion parked because the store
//!   is a migration duplicate
//! - Leader: consuming the selected upstream and producing to the version
//!   topic
//!
//! # State Transitions
//!
//! ```text
//! Offline -> Standby -> InTransition -> Leader -> Standby
//!                 \          ^
//!                  \         | (store no longer migration duplicate)
//!                   -> PauseTransition
//! ```
//!
//! Promotion is deferred: the transition states are observed by the
//! long-running task checker once per ingestion loop, never blocked on.
//!
//! # Session-id discipline
//!
//! Every role command captures the partition's session id at submission.
//! A command whose session id is no longer current is skipped, not an error;
//! this prevents a late promotion from reviving a demoted replica.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use bytes::Bytes;

use crate::ingestion::completion::CompletionSignal;
use crate::ingestion::offsets::{OffsetRecord, TopicSwitch};
use crate::types::{LOWEST_OFFSET, Offset};

/// Role of a partition replica within the leader/follower state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LeaderFollowerState {
    /// Not subscribed on this replica.
    #[default]
    Offline,
    /// Tailing the local version topic.
    Standby,
    /// Promotion requested; waiting out the quiet period.
    InTransitionFromStandbyToLeader,
    /// Promotion parked while the store is a migration duplicate.
    PauseTransitionFromStandbyToLeader,
    /// Driving the upstream into the version topic.
    Leader,
}

impl LeaderFollowerState {
    pub fn is_leader(&self) -> bool {
        matches!(self, LeaderFollowerState::Leader)
    }

    pub fn is_standby(&self) -> bool {
        matches!(self, LeaderFollowerState::Standby)
    }

    pub fn is_transitioning(&self) -> bool {
        matches!(
            self,
            LeaderFollowerState::InTransitionFromStandbyToLeader
                | LeaderFollowerState::PauseTransitionFromStandbyToLeader
        )
    }

    /// Human-readable state name for logs and metrics.
    pub fn state_name(&self) -> &'static str {
        match self {
            LeaderFollowerState::Offline => "offline",
            LeaderFollowerState::Standby => "standby",
            LeaderFollowerState::InTransitionFromStandbyToLeader => "in_transition_to_leader",
            LeaderFollowerState::PauseTransitionFromStandbyToLeader => "pause_transition_to_leader",
            LeaderFollowerState::Leader => "leader",
        }
    }
}

/// How incremental pushes reach this version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IncrementalPushPolicy {
    /// Incremental pushes flow through the real-time topic.
    #[default]
    IncrementalPushSameAsRealTime,
    /// Incremental pushes are produced straight to the version topic.
    PushToVersionTopic,
}

/// Last-write cache entry for write-compute, keyed by user key.
///
/// Lives from the moment a leader produces a PUT/DELETE until the drainer
/// applies it; lets a subsequent UPDATE read its base value without racing
/// the drainer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransientRecord {
    /// Upstream offset of the record that wrote this value.
    pub offset: Offset,
    /// `None` records a pending delete.
    pub value: Option<Bytes>,
    pub value_schema_id: i32,
}

/// Checker carried by role commands; valid only while the session that
/// submitted the command is still the latest one.
#[derive(Debug, Clone)]
pub struct LeaderSessionIdChecker {
    session_id: u64,
    latest: Arc<AtomicU64>,
}

impl LeaderSessionIdChecker {
    pub fn new(session_id: u64, latest: Arc<AtomicU64>) -> Self {
        Self { session_id, latest }
    }

    /// Checker that is always valid, for internal transitions.
    pub fn always_valid() -> Self {
        let latest = Arc::new(AtomicU64::new(0));
        Self {
            session_id: 0,
            latest,
        }
    }

    pub fn is_session_id_valid(&self) -> bool {
        self.session_id == self.latest.load(Ordering::Acquire)
    }
}

/// Mutable consumption state of one subscribed partition.
///
/// Role fields are mutated only by the ingestion thread; drainer workers
/// mutate the offset record and complete persist signals; producer-callback
/// workers never touch role fields.
#[derive(Debug)]
pub struct PartitionConsumptionState {
    pub partition: u32,
    pub role: LeaderFollowerState,
    pub offset_record: OffsetRecord,
    pub end_of_push_received: bool,
    pub consume_remotely: bool,
    /// Set while skipping post-EOP records on a remote version topic; must
    /// be cleared whenever `consume_remotely` flips off.
    pub skip_kafka_message: bool,
    pub latest_message_consumption_ts: Instant,
    pub consumption_start_ts: Instant,
    pub pending_topic_switch: Option<TopicSwitch>,
    pub last_leader_persist_future: Option<CompletionSignal>,
    pub last_queued_record_persisted_future: Option<CompletionSignal>,
    transient_records: HashMap<Bytes, TransientRecord>,
    pub latch_released: bool,
    pub incremental_push_policy: IncrementalPushPolicy,
    pub incremental_push_enabled: bool,
    pub hybrid: bool,
    /// Latest session id; bumped on unsubscribe/drop to invalidate stale
    /// role commands.
    pub leader_session_id: Arc<AtomicU64>,
    /// Last real-time offset the leader consumed, used for hybrid lag.
    pub leader_consumed_upstream_rt_offset: Offset,
    /// Readiness was reported for this partition.
    pub complete: bool,
    /// A fatal error was reported; the partition no longer processes records.
    pub errored: bool,
    /// Applied records since the offset record was last written through.
    pub records_since_offset_sync: u64,
}

impl PartitionConsumptionState {
    pub fn new(partition: u32, offset_record: OffsetRecord, hybrid: bool) -> Self {
        let now = Instant::now();
        Self {
            partition,
            role: LeaderFollowerState::Standby,
            offset_record,
            end_of_push_received: false,
            consume_remotely: false,
            skip_kafka_message: false,
            latest_message_consumption_ts: now,
            consumption_start_ts: now,
            pending_topic_switch: None,
            last_leader_persist_future: None,
            last_queued_record_persisted_future: None,
            transient_records: HashMap::new(),
            latch_released: false,
            incremental_push_policy: IncrementalPushPolicy::default(),
            incremental_push_enabled: false,
            hybrid,
            leader_session_id: Arc::new(AtomicU64::new(0)),
            leader_consumed_upstream_rt_offset: LOWEST_OFFSET,
            complete: false,
            errored: false,
            records_since_offset_sync: 0,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.role.is_leader()
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Bump the session id, invalidating checkers handed out earlier.
    pub fn bump_session_id(&self) -> u64 {
        self.leader_session_id.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Checker bound to the current session.
    pub fn session_checker(&self) -> LeaderSessionIdChecker {
        LeaderSessionIdChecker::new(
            self.leader_session_id.load(Ordering::Acquire),
            self.leader_session_id.clone(),
        )
    }

    // ========================================================================
    // Write-compute transient cache
    // ========================================================================

    pub fn set_transient_record(
        &mut self,
        offset: Offset,
        key: &[u8],
        value: Option<Bytes>,
        value_schema_id: i32,
    ) {
        self.transient_records.insert(
            Bytes::copy_from_slice(key),
            TransientRecord {
                offset,
                value,
                value_schema_id,
            },
        );
    }

    pub fn transient_record(&self, key: &[u8]) -> Option<&TransientRecord> {
        self.transient_records.get(key)
    }

    /// Drop the cached entry once the record that wrote it has been drained.
    ///
    /// Entries written by a later offset stay: the cache always reflects the
    /// newest pending write.
    pub fn remove_transient_record_up_to(&mut self, key: &[u8], offset: Offset) {
        if let Some(entry) = self.transient_records.get(key) {
            if entry.offset <= offset {
                self.transient_records.remove(key);
            }
        }
    }

    /// Clear the cache entirely; called on role changes.
    pub fn clear_transient_records(&mut self) {
        self.transient_records.clear();
    }

    pub fn transient_record_count(&self) -> usize {
        self.transient_records.len()
    }
}
