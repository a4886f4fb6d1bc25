//! Consumer action queue.
//!
//! Role changes and subscription changes arrive from the outside (the role
//! assignment source) on arbitrary threads, but the partition state machine
//! is only ever mutated by the ingestion thread. Commands are therefore
//! enqueued as [`ConsumerAction`]s and drained in submission order at the top
//! of every ingestion loop iteration. Actions must be idempotent under
//! re-delivery; long waits never happen inside an action, only in the
//! long-running task checker via deadline comparison.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::ingestion::partition_state::LeaderSessionIdChecker;

/// Kind of a queued consumer action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerActionType {
    /// Start consumption of a partition (Offline -> Standby).
    Subscribe,
    /// Stop consumption and drop in-memory state.
    Unsubscribe,
    /// Clear the partition's persisted offset state.
    Reset,
    /// Begin the deferred promotion to leader.
    StandbyToLeader,
    /// Demote to follower, draining in-flight produces first.
    LeaderToStandby,
    /// Unsubscribe and remove the partition's data and metadata.
    DropPartition,
    /// Stop the whole ingestion task.
    KillConsumption,
}

impl ConsumerActionType {
    pub fn name(&self) -> &'static str {
        match self {
            ConsumerActionType::Subscribe => "SUBSCRIBE",
            ConsumerActionType::Unsubscribe => "UNSUBSCRIBE",
            ConsumerActionType::Reset => "RESET",
            ConsumerActionType::StandbyToLeader => "STANDBY_TO_LEADER",
            ConsumerActionType::LeaderToStandby => "LEADER_TO_STANDBY",
            ConsumerActionType::DropPartition => "DROP_PARTITION",
            ConsumerActionType::KillConsumption => "KILL_CONSUMPTION",
        }
    }
}

/// One queued command for the ingestion loop.
#[derive(Debug, Clone)]
pub struct ConsumerAction {
    pub action_type: ConsumerActionType,
    pub topic: String,
    pub partition: u32,
    /// Session checker captured at submission; stale commands are skipped.
    pub session_checker: Option<LeaderSessionIdChecker>,
}

impl ConsumerAction {
    pub fn new(action_type: ConsumerActionType, topic: impl Into<String>, partition: u32) -> Self {
        Self {
            action_type,
            topic: topic.into(),
            partition,
            session_checker: None,
        }
    }

    pub fn with_checker(mut self, checker: LeaderSessionIdChecker) -> Self {
        self.session_checker = Some(checker);
        self
    }
}

/// FIFO of consumer actions, ordered by submission.
#[derive(Debug, Default)]
pub struct ConsumerActionQueue {
    queue: Mutex<VecDeque<ConsumerAction>>,
}

impl ConsumerActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, action: ConsumerAction) {
        self.queue
            .lock()
            .expect("action queue lock poisoned")
            .push_back(action);
    }

    /// Drain every currently queued action, preserving order.
    pub fn drain(&self) -> Vec<ConsumerAction> {
        self.queue
            .lock()
            .expect("action queue lock poisoned")
            .drain(..)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().expect("action queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order_preserved() {
        let queue = ConsumerActionQueue::new();
        queue.push(ConsumerAction::new(
            ConsumerActionType::Subscribe,
            "orders_v1",
            0,
        ));
        queue.push(ConsumerAction::new(
            ConsumerActionType::StandbyToLeader,
            "orders_v1",
            0,
        ));
        queue.push(ConsumerAction::new(
            ConsumerActionType::Unsubscribe,
            "orders_v1",
            1,
        ));

        let drained = queue.drain();
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[0].action_type, ConsumerActionType::Subscribe);
        assert_eq!(drained[1].action_type, ConsumerActionType::StandbyToLeader);
        assert_eq!(drained[2].action_type, ConsumerActionType::Unsubscribe);
        assert_eq!(drained[2].partition, 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_empty_queue() {
        let queue = ConsumerActionQueue::new();
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn test_action_type_names() {
        assert_eq!(ConsumerActionType::Subscribe.name(), "SUBSCRIBE");
        assert_eq!(ConsumerActionType::DropPartition.name(), "DROP_PARTITION");
        assert_eq!(ConsumerActionType::LeaderToStandby.name(), "LEADER_TO_STANDBY");
    }
}
