//! Memory-bounded drainer queues and the drainer worker pool.
//!
//! Records flow from the consumer (or the producer-callback workers, for
//! leader-produced records) into per-worker FIFO queues, and drainer workers
//! apply them to storage. The queues are accounted in bytes, not entries:
//! `put` blocks while the budget is exhausted, and draining only wakes
//! blocked enqueuers once at least `notify_delta` bytes are free again, so a
//! stream of small records cannot starve a single large one.
//!
//! Partitions are assigned to workers by modulo, which preserves the
//! per-partition ordering contract: consumer order == drainer order ==
//! storage-apply order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::{IngestionError, Result};
use crate::ingestion::completion::CompletionSignal;
use crate::ingestion::message::ConsumedRecord;
use crate::ingestion::producer::LeaderProducedRecordContext;
use crate::metrics;

/// Fixed per-entry overhead charged on top of the payload bytes.
pub const ENTRY_OVERHEAD_BYTES: usize = 256;

/// One queued unit of work for a drainer.
#[derive(Debug)]
pub struct DrainerEntry {
    /// Sub-partition whose storage this entry mutates.
    pub sub_partition: u32,
    /// The source record as consumed from upstream.
    pub record: ConsumedRecord,
    /// Present when a leader produced this record to the version topic; the
    /// drainer then applies the produced payload, not the source payload.
    pub leader_ctx: Option<LeaderProducedRecordContext>,
    /// Completed once the entry is applied (or failed).
    pub queued_signal: CompletionSignal,
}

impl DrainerEntry {
    /// Bytes charged against the queue budget for this entry.
    pub fn size(&self) -> usize {
        let ctx_size = self
            .leader_ctx
            .as_ref()
            .map(|ctx| ctx.payload_size())
            .unwrap_or(0);
        self.record.payload_size() + ctx_size + ENTRY_OVERHEAD_BYTES
    }
}

#[derive(Debug)]
struct QueueState {
    entries: VecDeque<DrainerEntry>,
    used_bytes: usize,
    closed: bool,
}

/// Bounded FIFO accounted in bytes with a notify-delta wakeup policy.
#[derive(Debug)]
pub struct MemoryBoundedQueue {
    capacity: usize,
    notify_delta: usize,
    state: Mutex<QueueState>,
    space_available: Notify,
    data_available: Notify,
}

impl MemoryBoundedQueue {
    /// Panics if `notify_delta >= capacity`; the config validates this first.
    pub fn new(capacity: usize, notify_delta: usize) -> Self {
        assert!(
            notify_delta < capacity,
            "notify_delta ({notify_delta}) must be smaller than capacity ({capacity})"
        );
        Self {
            capacity,
            notify_delta,
            state: Mutex::new(QueueState {
                entries: VecDeque::new(),
                used_bytes: 0,
                closed: false,
            }),
            space_available: Notify::new(),
            data_available: Notify::new(),
        }
    }

    /// Enqueue, blocking while the memory budget is exhausted.
    ///
    /// An entry larger than the whole budget is admitted alone into an empty
    /// queue rather than deadlocking.
    pub async fn put(&self, entry: DrainerEntry) -> Result<()> {
        let size = entry.size();
        let mut entry = Some(entry);
        loop {
            let notified = self.space_available.notified();
            {
                let mut state = self.state.lock().expect("drainer queue lock poisoned");
                if state.closed {
                    return Err(IngestionError::Storage(
                        "drainer queue is closed".to_string(),
                    ));
                }
                if state.used_bytes + size <= self.capacity || state.entries.is_empty() {
                    state.used_bytes += size;
                    state.entries.push_back(entry.take().expect("entry consumed once"));
                    drop(state);
                    metrics::DRAINER_QUEUE_MEMORY.add(size as i64);
                    self.data_available.notify_waiters();
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Dequeue the next entry; `None` once the queue is closed and empty.
    pub async fn take(&self) -> Option<DrainerEntry> {
        loop {
            let notified = self.data_available.notified();
            {
                let mut state = self.state.lock().expect("drainer queue lock poisoned");
                if let Some(entry) = state.entries.pop_front() {
                    let size = entry.size();
                    state.used_bytes = state.used_bytes.saturating_sub(size);
                    let free = self.capacity.saturating_sub(state.used_bytes);
                    drop(state);
                    metrics::DRAINER_QUEUE_MEMORY.sub(size as i64);
                    if free >= self.notify_delta {
                        self.space_available.notify_waiters();
                    }
                    return Some(entry);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Close the queue; pending entries are still drained.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("drainer queue lock poisoned");
        state.closed = true;
        drop(state);
        self.data_available.notify_waiters();
        self.space_available.notify_waiters();
    }

    pub fn used_bytes(&self) -> usize {
        self.state
            .lock()
            .expect("drainer queue lock poisoned")
            .used_bytes
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .expect("drainer queue lock poisoned")
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Applies drained entries to storage; implemented by the ingestion task.
#[async_trait]
pub trait RecordApplier: Send + Sync {
    /// Apply one entry: storage write, offset-record update, readiness check.
    async fn apply_record(&self, entry: DrainerEntry) -> Result<()>;

    /// Stage a drain failure on the owning partition; the next ingestion
    /// loop iteration surfaces it.
    async fn on_drain_failure(&self, sub_partition: u32, error: IngestionError);
}

/// Pool of drainer workers over per-worker bounded queues.
pub struct DrainerService {
    queues: Vec<Arc<MemoryBoundedQueue>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl DrainerService {
    /// Build queues only; call [`DrainerService::start`] to spawn workers.
    ///
    /// The total memory budget is split evenly across workers so one hot
    /// partition cannot consume the budget of the others.
    pub fn new(total_capacity: usize, notify_delta: usize, workers: usize) -> Self {
        let workers = workers.max(1);
        let per_queue_capacity = (total_capacity / workers).max(notify_delta + 1);
        let queues = (0..workers)
            .map(|_| Arc::new(MemoryBoundedQueue::new(per_queue_capacity, notify_delta)))
            .collect();
        Self {
            queues,
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Spawn one worker per queue, applying entries through `applier`.
    pub fn start(&self, applier: Arc<dyn RecordApplier>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut workers = self.workers.lock().expect("drainer workers lock poisoned");
        for (index, queue) in self.queues.iter().enumerate() {
            let queue = queue.clone();
            let applier = applier.clone();
            workers.push(tokio::spawn(async move {
                debug!(drainer = index, "Drainer worker started");
                while let Some(entry) = queue.take().await {
                    let sub_partition = entry.sub_partition;
                    let queued_signal = entry.queued_signal.clone();
                    let persisted = entry
                        .leader_ctx
                        .as_ref()
                        .map(|ctx| ctx.persisted_to_db.clone());
                    match applier.apply_record(entry).await {
                        Ok(()) => {
                            queued_signal.complete_ok();
                            if let Some(persisted) = persisted {
                                persisted.complete_ok();
                            }
                        }
                        Err(e) => {
                            error!(
                                drainer = index,
                                partition = sub_partition,
                                error = %e,
                                "Drainer failed to apply record"
                            );
                            queued_signal.complete_err(e.to_string());
                            if let Some(persisted) = persisted {
                                persisted.complete_err(e.to_string());
                            }
                            applier.on_drain_failure(sub_partition, e).await;
                        }
                    }
                }
                debug!(drainer = index, "Drainer worker stopped");
            }));
        }
        info!(workers = self.queues.len(), "Drainer pool started");
    }

    /// Enqueue an entry onto the worker owning its sub-partition.
    pub async fn enqueue(&self, entry: DrainerEntry) -> Result<()> {
        let index = (entry.sub_partition as usize) % self.queues.len();
        self.queues[index].put(entry).await
    }

    /// Close all queues and wait for the workers to drain and exit.
    pub async fn close(&self) {
        for queue in &self.queues {
            queue.close();
        }
        let workers = {
            let mut guard = self.workers.lock().expect("drainer workers lock poisoned");
            std::mem::take(&mut *guard)
        };
        for worker in workers {
            let _ = worker.await;
        }
    }

    /// Total bytes currently queued across all workers.
    pub fn used_bytes(&self) -> usize {
        self.queues.iter().map(|q| q.used_bytes()).sum()
    }
}
