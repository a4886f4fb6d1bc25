//! The leader/follower partition ingestion task.
//!
//! One task supervises every partition of one store version. It owns the
//! per-partition role state machines and their transitions, upstream
//! selection (local vs remote fabric, real-time vs reprocessing vs version
//! topic) including mid-stream topic switches, producer-callback-ordered
//! persistence of leader-produced records, upstream-rewind detection, and
//! replication-lag accounting for the readiness checker.
//!
//! # State Transition
//!
//! 1. `Offline -> Standby` on SUBSCRIBE: restore the checkpointed state from
//!    the offset record and tail the local version topic.
//! 2. `Standby -> Leader` via a *deferred* transition: the promotion command
//!    only marks the partition in transition; the long-running task checker
//!    promotes it once the version topic has been quiet for the configured
//!    delay, guarding against a demoted leader that is still producing.
//! 3. `Leader -> Standby`: if the leader was consuming the local version
//!    topic, just flip the role; otherwise unsubscribe the leader topic,
//!    drain the in-flight produces (blocking on the last producer
//!    callback's persist signal), and resubscribe the version topic at the
//!    freshly updated offset.
//!
//! # Threads
//!
//! The ingestion loop ([`IngestionTask::run_once`]) owns the action queue,
//! upstream polling, and all role mutations. Drainer workers apply records
//! and update offset records. One producer-callback worker awaits produce
//! acknowledgements in send order and feeds the drainer, which is what makes
//! chunk/manifest persistence ordered per partition.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::IngestionConfig;
use crate::error::{IngestionError, Result};
use crate::ingestion::actions::{ConsumerAction, ConsumerActionQueue, ConsumerActionType};
use crate::ingestion::completion::{CompletionSignal, SignalResult};
use crate::ingestion::drainer::{DrainerEntry, DrainerService, RecordApplier};
use crate::ingestion::message::{
    CHUNKED_VALUE_MANIFEST_SCHEMA_ID, ConsumedRecord, ControlMessage, MessagePayload, PutPayload,
    prepend_schema_header, split_schema_header,
};
use crate::ingestion::metadata_cache::UpstreamMetadataCache;
use crate::ingestion::metadata_store::MetadataStore;
use crate::ingestion::offsets::{
    NON_AA_UPSTREAM_OFFSET_KEY, OffsetRecord, StoreVersionState, TopicSwitch,
};
use crate::ingestion::partition_state::{
    IncrementalPushPolicy, LeaderFollowerState, LeaderSessionIdChecker, PartitionConsumptionState,
};
use crate::ingestion::producer::{
    LeaderMetadata, LeaderProducedPayload, LeaderProducedRecordContext, ProduceCompletion,
    ProducerFactory, ProducerGateway,
};
use crate::ingestion::traits::{StatusReporter, StorageEngine, UpdateProcessor, UpstreamClient};
use crate::ingestion::validation::{DataIntegrityValidator, ValidationOutcome};
use crate::metrics;
use crate::telemetry::RedundantLogFilter;
use crate::types::{
    LOWEST_OFFSET, Offset, is_leader_sub_partition, is_real_time_topic,
    is_stream_reprocessing_topic, is_version_topic_or_stream_reprocessing_topic,
    sub_partition_for_record, user_partition, version_topic_name,
};

/// Outcome of routing one polled record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelegateResult {
    /// Record queued straight to the drainer (follower, or leader on the
    /// local version topic).
    QueuedToDrainer,
    /// Record was produced to the version topic (or intentionally consumed
    /// without production, e.g. segment markers from a real-time topic).
    ProducedToKafka,
    /// Data-integrity validation identified a duplicate; skipped.
    DuplicateMessage,
    /// Record was rejected; a partition error was staged.
    Skipped,
}

/// How a record is sent to the version topic.
enum ProduceKind {
    /// Re-produce the consumed record preserving its producer metadata.
    Passthrough,
    Put {
        key: Bytes,
        value: Bytes,
        schema_id: i32,
    },
    Delete {
        key: Bytes,
    },
    Control {
        control: ControlMessage,
        /// TopicSwitch is produced without upstream sourcing.
        unsourced: bool,
    },
}

/// A produce awaiting acknowledgement, processed in send order.
struct PendingProduce {
    sub_partition: u32,
    source: ConsumedRecord,
    ctx: LeaderProducedRecordContext,
    completion: ProduceCompletion,
}

/// Builder for [`IngestionTask`].
pub struct IngestionTaskBuilder {
    store_name: String,
    version_number: u32,
    config: IngestionConfig,
    storage: Option<Arc<dyn StorageEngine>>,
    upstream: Option<Arc<dyn UpstreamClient>>,
    status: Option<Arc<dyn StatusReporter>>,
    producer_factory: Option<ProducerFactory>,
    update_processor: Option<Arc<dyn UpdateProcessor>>,
    hybrid_store: bool,
    incremental_push_enabled: bool,
    incremental_push_policy: IncrementalPushPolicy,
    host_name: String,
    remote_vt_url: Option<String>,
    is_current_version: bool,
}

impl IngestionTaskBuilder {
    pub fn new(store_name: impl Into<String>, version_number: u32) -> Self {
        Self {
            store_name: store_name.into(),
            version_number,
            config: IngestionConfig::default(),
            storage: None,
            upstream: None,
            status: None,
            producer_factory: None,
            update_processor: None,
            hybrid_store: false,
            incremental_push_enabled: false,
            incremental_push_policy: IncrementalPushPolicy::default(),
            host_name: "localhost".to_string(),
            remote_vt_url: None,
            is_current_version: false,
        }
    }

    pub fn config(mut self, config: IngestionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn storage(mut self, storage: Arc<dyn StorageEngine>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn upstream(mut self, upstream: Arc<dyn UpstreamClient>) -> Self {
        self.upstream = Some(upstream);
        self
    }

    pub fn status_reporter(mut self, status: Arc<dyn StatusReporter>) -> Self {
        self.status = Some(status);
        self
    }

    pub fn producer_factory(mut self, factory: ProducerFactory) -> Self {
        self.producer_factory = Some(factory);
        self
    }

    pub fn update_processor(mut self, processor: Arc<dyn UpdateProcessor>) -> Self {
        self.update_processor = Some(processor);
        self
    }

    pub fn hybrid_store(mut self, hybrid: bool) -> Self {
        self.hybrid_store = hybrid;
        self
    }

    pub fn incremental_push(mut self, enabled: bool, policy: IncrementalPushPolicy) -> Self {
        self.incremental_push_enabled = enabled;
        self.incremental_push_policy = policy;
        self
    }

    pub fn host_name(mut self, host_name: impl Into<String>) -> Self {
        self.host_name = host_name.into();
        self
    }

    /// Source version-topic cluster for native replication.
    pub fn remote_version_topic_url(mut self, url: impl Into<String>) -> Self {
        self.remote_vt_url = Some(url.into());
        self
    }

    pub fn is_current_version(mut self, current: bool) -> Self {
        self.is_current_version = current;
        self
    }

    pub fn build(self) -> Result<IngestionTask> {
        self.config.validate()?;
        let storage = self
            .storage
            .ok_or_else(|| IngestionError::Config("storage engine is required".to_string()))?;
        let upstream = self
            .upstream
            .ok_or_else(|| IngestionError::Config("upstream client is required".to_string()))?;
        let status = self
            .status
            .ok_or_else(|| IngestionError::Config("status reporter is required".to_string()))?;
        let producer_factory = self
            .producer_factory
            .ok_or_else(|| IngestionError::Config("producer factory is required".to_string()))?;

        let version_topic = version_topic_name(&self.store_name, self.version_number);
        let metadata_store = MetadataStore::new(storage.clone(), version_topic.clone());
        let metadata_cache =
            UpstreamMetadataCache::new(upstream.clone(), self.config.upstream_metadata_ttl);
        let drainer = DrainerService::new(
            self.config.drainer_buffer_memory_capacity,
            self.config.drainer_buffer_notify_delta,
            self.config.drainer_pool_size,
        );
        let (callback_tx, callback_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(TaskInner {
            store_name: self.store_name,
            version_number: self.version_number,
            version_topic,
            config: self.config,
            hybrid_store: self.hybrid_store,
            incremental_push_enabled: self.incremental_push_enabled,
            incremental_push_policy: self.incremental_push_policy,
            host_name: self.host_name,
            remote_vt_url: self.remote_vt_url,
            is_current_version: AtomicBool::new(self.is_current_version),
            is_migration_duplicate_store: AtomicBool::new(false),
            storage,
            upstream,
            status,
            update_processor: self.update_processor,
            metadata_store,
            metadata_cache,
            producer: ProducerGateway::new(producer_factory),
            drainer,
            partition_states: DashMap::new(),
            validators: DashMap::new(),
            actions: ConsumerActionQueue::new(),
            partition_errors: DashMap::new(),
            last_ingestion_error: std::sync::Mutex::new(None),
            callback_tx: std::sync::Mutex::new(Some(callback_tx)),
            callback_worker: std::sync::Mutex::new(None),
            log_filter: RedundantLogFilter::default(),
            running: AtomicBool::new(true),
        });

        inner
            .drainer
            .start(Arc::new(ApplierHandle(Arc::downgrade(&inner))));
        let worker = tokio::spawn(run_callback_dispatcher(
            Arc::downgrade(&inner),
            callback_rx,
        ));
        *inner
            .callback_worker
            .lock()
            .expect("callback worker lock poisoned") = Some(worker);

        Ok(IngestionTask { inner })
    }
}

/// Public handle of one store-version ingestion task.
pub struct IngestionTask {
    inner: Arc<TaskInner>,
}

impl IngestionTask {
    pub fn builder(store_name: impl Into<String>, version_number: u32) -> IngestionTaskBuilder {
        IngestionTaskBuilder::new(store_name, version_number)
    }

    pub fn version_topic(&self) -> &str {
        &self.inner.version_topic
    }

    pub fn store_name(&self) -> &str {
        &self.inner.store_name
    }

    pub fn version_number(&self) -> u32 {
        self.inner.version_number
    }

    pub fn is_running(&self) -> bool {
        self.inner.running()
    }

    /// Flip whether this version currently serves read traffic.
    pub fn set_current_version(&self, current: bool) {
        self.inner
            .is_current_version
            .store(current, Ordering::Release);
    }

    /// Flip the migration-duplicate flag; promotions pause while it is set.
    pub fn set_migration_duplicate_store(&self, duplicate: bool) {
        self.inner
            .is_migration_duplicate_store
            .store(duplicate, Ordering::Release);
    }

    fn enqueue_action(&self, action: ConsumerAction) -> Result<()> {
        if !self.inner.running() {
            return Err(IngestionError::NotRunning {
                version_topic: self.inner.version_topic.clone(),
            });
        }
        debug!(
            topic = %self.inner.version_topic,
            partition = action.partition,
            action = action.action_type.name(),
            "Queued consumer action"
        );
        self.inner.actions.push(action);
        Ok(())
    }

    /// Start consumption of a partition (Offline -> Standby).
    pub fn subscribe(&self, partition: u32) -> Result<()> {
        self.enqueue_action(ConsumerAction::new(
            ConsumerActionType::Subscribe,
            &self.inner.version_topic,
            partition,
        ))
    }

    /// Stop consumption of a partition and drop its in-memory state.
    pub fn unsubscribe(&self, partition: u32) -> Result<()> {
        self.enqueue_action(ConsumerAction::new(
            ConsumerActionType::Unsubscribe,
            &self.inner.version_topic,
            partition,
        ))
    }

    /// Clear the partition's persisted offset state.
    pub fn reset_partition(&self, partition: u32) -> Result<()> {
        self.enqueue_action(ConsumerAction::new(
            ConsumerActionType::Reset,
            &self.inner.version_topic,
            partition,
        ))
    }

    /// Request promotion to leader; executed by the checker once quiet.
    pub fn promote_to_leader(&self, partition: u32, checker: LeaderSessionIdChecker) -> Result<()> {
        self.enqueue_action(
            ConsumerAction::new(
                ConsumerActionType::StandbyToLeader,
                &self.inner.version_topic,
                partition,
            )
            .with_checker(checker),
        )
    }

    /// Demote to standby, draining in-flight produces.
    pub fn demote_to_standby(&self, partition: u32, checker: LeaderSessionIdChecker) -> Result<()> {
        self.enqueue_action(
            ConsumerAction::new(
                ConsumerActionType::LeaderToStandby,
                &self.inner.version_topic,
                partition,
            )
            .with_checker(checker),
        )
    }

    /// Unsubscribe and delete the partition's data and metadata.
    pub fn drop_partition(&self, partition: u32) -> Result<()> {
        self.enqueue_action(ConsumerAction::new(
            ConsumerActionType::DropPartition,
            &self.inner.version_topic,
            partition,
        ))
    }

    /// Stop the task.
    pub fn kill(&self) -> Result<()> {
        self.enqueue_action(ConsumerAction::new(
            ConsumerActionType::KillConsumption,
            &self.inner.version_topic,
            0,
        ))
    }

    /// Checker bound to the partition's current leader session.
    pub async fn session_checker(&self, partition: u32) -> LeaderSessionIdChecker {
        match self.inner.partition_state(partition) {
            Some(pcs_arc) => pcs_arc.lock().await.session_checker(),
            None => LeaderSessionIdChecker::always_valid(),
        }
    }

    /// One ingestion loop iteration: actions, long-running checker, poll.
    pub async fn run_once(&self) -> Result<()> {
        if !self.inner.running() {
            return Err(IngestionError::NotRunning {
                version_topic: self.inner.version_topic.clone(),
            });
        }
        self.inner.process_consumer_actions().await;
        self.inner.check_long_running_task_state().await?;
        self.inner.poll_and_delegate().await?;
        self.inner.surface_partition_errors().await;
        Ok(())
    }

    /// Run the ingestion loop until killed or a task-fatal error occurs.
    pub async fn run(&self) {
        info!(topic = %self.inner.version_topic, "Ingestion task started");
        while self.inner.running() {
            if let Err(e) = self.run_once().await {
                if matches!(e, IngestionError::NotRunning { .. }) {
                    break;
                }
                error!(topic = %self.inner.version_topic, error = %e, "Ingestion loop error");
                *self
                    .inner
                    .last_ingestion_error
                    .lock()
                    .expect("error slot lock poisoned") = Some(e.clone());
                if e.is_fatal_for_task() {
                    self.inner.running.store(false, Ordering::Release);
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        info!(topic = %self.inner.version_topic, "Ingestion task stopped");
    }

    /// The last error surfaced by the loop, if any.
    pub fn last_ingestion_error(&self) -> Option<IngestionError> {
        self.inner
            .last_ingestion_error
            .lock()
            .expect("error slot lock poisoned")
            .clone()
    }

    /// Graceful shutdown: sync checkpoints, drain workers, close producer.
    pub async fn close(&self) {
        self.inner.running.store(false, Ordering::Release);
        let partitions: Vec<_> = self
            .inner
            .partition_states
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        for (partition, pcs_arc) in partitions {
            let pcs = pcs_arc.lock().await;
            if let Err(e) = self
                .inner
                .metadata_store
                .persist_offset_record(partition, &pcs.offset_record)
                .await
            {
                warn!(partition, error = %e, "Failed to sync offset record on shutdown");
            }
        }
        self.inner.drainer.close().await;
        // Closing the channel lets the callback worker drain and exit.
        let worker = {
            self.inner
                .callback_tx
                .lock()
                .expect("callback tx lock poisoned")
                .take();
            self.inner
                .callback_worker
                .lock()
                .expect("callback worker lock poisoned")
                .take()
        };
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        if let Err(e) = self.inner.producer.close().await {
            warn!(topic = %self.inner.version_topic, error = %e, "Producer close failed");
        }
        info!(topic = %self.inner.version_topic, "Ingestion task closed");
    }

    // ========================================================================
    // Introspection (primarily for tests and admin surfaces)
    // ========================================================================

    pub async fn partition_role(&self, partition: u32) -> Option<LeaderFollowerState> {
        match self.inner.partition_state(partition) {
            Some(pcs_arc) => Some(pcs_arc.lock().await.role),
            None => None,
        }
    }

    pub async fn offset_record(&self, partition: u32) -> Option<OffsetRecord> {
        match self.inner.partition_state(partition) {
            Some(pcs_arc) => Some(pcs_arc.lock().await.offset_record.clone()),
            None => None,
        }
    }

    pub async fn is_end_of_push_received(&self, partition: u32) -> Option<bool> {
        match self.inner.partition_state(partition) {
            Some(pcs_arc) => Some(pcs_arc.lock().await.end_of_push_received),
            None => None,
        }
    }

    pub async fn is_consuming_remotely(&self, partition: u32) -> Option<bool> {
        match self.inner.partition_state(partition) {
            Some(pcs_arc) => Some(pcs_arc.lock().await.consume_remotely),
            None => None,
        }
    }

    pub async fn is_partition_complete(&self, partition: u32) -> Option<bool> {
        match self.inner.partition_state(partition) {
            Some(pcs_arc) => Some(pcs_arc.lock().await.complete),
            None => None,
        }
    }

    /// Wait until everything queued for a partition has been applied.
    pub async fn wait_for_drained(&self, partition: u32, timeout: Duration) -> bool {
        let signals = match self.inner.partition_state(partition) {
            Some(pcs_arc) => {
                let pcs = pcs_arc.lock().await;
                (
                    pcs.last_queued_record_persisted_future.clone(),
                    pcs.last_leader_persist_future.clone(),
                )
            }
            None => return true,
        };
        if let Some(signal) = signals.1 {
            if signal.wait_timeout(timeout).await.is_none() {
                return false;
            }
        }
        if let Some(signal) = signals.0 {
            if signal.wait_timeout(timeout).await.is_none() {
                return false;
            }
        }
        true
    }

    // ========================================================================
    // Replication lag accounting
    // ========================================================================

    /// Version-topic replication lag of remote-consuming batch leaders.
    pub async fn batch_replication_lag(&self) -> i64 {
        let Some(remote_url) = self.inner.remote_vt_url.clone() else {
            return 0;
        };
        let mut total = 0i64;
        for (partition, pcs_arc) in self.inner.partition_snapshot() {
            let qualifies = {
                let pcs = pcs_arc.lock().await;
                !pcs.end_of_push_received && pcs.consume_remotely && pcs.is_leader()
            };
            if !qualifies {
                continue;
            }
            let remote = self
                .inner
                .metadata_cache
                .end_offset(&remote_url, &self.inner.version_topic, partition)
                .await
                .unwrap_or(0);
            let local = self
                .inner
                .metadata_cache
                .end_offset(
                    &self.inner.config.local_upstream_url,
                    &self.inner.version_topic,
                    partition,
                )
                .await
                .unwrap_or(0);
            total += (remote - local).max(0);
        }
        total
    }

    /// Offset lag summed over leader partitions matching `filter`.
    async fn leader_lag_filtered(
        &self,
        filter: impl Fn(&PartitionConsumptionState) -> bool,
    ) -> i64 {
        let mut total = 0i64;
        for (partition, pcs_arc) in self.inner.partition_snapshot() {
            let lag = {
                let pcs = pcs_arc.lock().await;
                if !pcs.is_leader() || !filter(&pcs) {
                    None
                } else {
                    self.inner.measure_leader_lag(&pcs, partition).await
                }
            };
            total += lag.unwrap_or(0).max(0);
        }
        total
    }

    pub async fn leader_offset_lag(&self) -> i64 {
        self.leader_lag_filtered(|_| true).await
    }

    pub async fn batch_leader_offset_lag(&self) -> i64 {
        self.leader_lag_filtered(|pcs| !pcs.end_of_push_received)
            .await
    }

    pub async fn hybrid_leader_offset_lag(&self) -> i64 {
        self.leader_lag_filtered(|pcs| pcs.end_of_push_received && pcs.hybrid)
            .await
    }

    /// Offset lag summed over follower partitions matching `filter`.
    async fn follower_lag_filtered(
        &self,
        filter: impl Fn(&PartitionConsumptionState) -> bool,
    ) -> i64 {
        let mut total = 0i64;
        for (partition, pcs_arc) in self.inner.partition_snapshot() {
            let qualifies = {
                let pcs = pcs_arc.lock().await;
                !pcs.is_leader()
                    && pcs.offset_record.upstream_offset(NON_AA_UPSTREAM_OFFSET_KEY)
                        != LOWEST_OFFSET
                    && filter(&pcs)
            };
            if !qualifies {
                continue;
            }
            let end = self
                .inner
                .metadata_cache
                .end_offset(
                    &self.inner.config.local_upstream_url,
                    &self.inner.version_topic,
                    partition,
                )
                .await
                .unwrap_or(0);
            let local = match self.inner.partition_state(partition) {
                Some(pcs_arc) => {
                    pcs_arc
                        .lock()
                        .await
                        .offset_record
                        .local_version_topic_offset()
                }
                None => continue,
            };
            total += ((end - 1) - local).max(0);
        }
        total
    }

    pub async fn follower_offset_lag(&self) -> i64 {
        self.follower_lag_filtered(|_| true).await
    }

    pub async fn batch_follower_offset_lag(&self) -> i64 {
        self.follower_lag_filtered(|pcs| !pcs.end_of_push_received)
            .await
    }

    pub async fn hybrid_follower_offset_lag(&self) -> i64 {
        self.follower_lag_filtered(|pcs| pcs.end_of_push_received && pcs.hybrid)
            .await
    }
}

/// Weak applier handle so drainer workers do not keep the task alive.
struct ApplierHandle(std::sync::Weak<TaskInner>);

#[async_trait]
impl RecordApplier for ApplierHandle {
    async fn apply_record(&self, entry: DrainerEntry) -> Result<()> {
        match self.0.upgrade() {
            Some(inner) => inner.apply_record(entry).await,
            None => Ok(()),
        }
    }

    async fn on_drain_failure(&self, sub_partition: u32, error: IngestionError) {
        if let Some(inner) = self.0.upgrade() {
            inner.stage_partition_error(sub_partition, error);
        }
    }
}

/// Awaits produce acknowledgements in send order.
async fn run_callback_dispatcher(
    weak: std::sync::Weak<TaskInner>,
    mut rx: mpsc::UnboundedReceiver<PendingProduce>,
) {
    while let Some(pending) = rx.recv().await {
        let Some(inner) = weak.upgrade() else {
            break;
        };
        inner.handle_produce_completion(pending).await;
    }
}

struct TaskInner {
    store_name: String,
    version_number: u32,
    version_topic: String,
    config: IngestionConfig,
    hybrid_store: bool,
    incremental_push_enabled: bool,
    incremental_push_policy: IncrementalPushPolicy,
    host_name: String,
    remote_vt_url: Option<String>,
    is_current_version: AtomicBool,
    is_migration_duplicate_store: AtomicBool,
    storage: Arc<dyn StorageEngine>,
    upstream: Arc<dyn UpstreamClient>,
    status: Arc<dyn StatusReporter>,
    update_processor: Option<Arc<dyn UpdateProcessor>>,
    metadata_store: MetadataStore,
    metadata_cache: UpstreamMetadataCache,
    producer: ProducerGateway,
    drainer: DrainerService,
    partition_states: DashMap<u32, Arc<Mutex<PartitionConsumptionState>>>,
    validators: DashMap<u32, Arc<Mutex<DataIntegrityValidator>>>,
    actions: ConsumerActionQueue,
    partition_errors: DashMap<u32, IngestionError>,
    last_ingestion_error: std::sync::Mutex<Option<IngestionError>>,
    callback_tx: std::sync::Mutex<Option<mpsc::UnboundedSender<PendingProduce>>>,
    callback_worker: std::sync::Mutex<Option<JoinHandle<()>>>,
    /// Throttles per-record warnings that repeat on every poll.
    log_filter: RedundantLogFilter,
    running: AtomicBool,
}

impl TaskInner {
    fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn partition_state(&self, partition: u32) -> Option<Arc<Mutex<PartitionConsumptionState>>> {
        self.partition_states
            .get(&partition)
            .map(|e| e.value().clone())
    }

    fn partition_snapshot(&self) -> Vec<(u32, Arc<Mutex<PartitionConsumptionState>>)> {
        self.partition_states
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    fn validator(&self, partition: u32) -> Arc<Mutex<DataIntegrityValidator>> {
        self.validators
            .entry(partition)
            .or_insert_with(|| Arc::new(Mutex::new(DataIntegrityValidator::new(partition))))
            .clone()
    }

    fn stage_partition_error(&self, partition: u32, error: IngestionError) {
        metrics::PARTITION_ERRORS
            .with_label_values(&[error.as_metric_label()])
            .inc();
        self.partition_errors.entry(partition).or_insert(error);
    }

    /// Partition of `topic` feeding a given sub-partition.
    fn source_topic_partition(&self, topic: &str, sub_partition: u32) -> u32 {
        if is_real_time_topic(topic) {
            user_partition(sub_partition, self.config.amplification_factor)
        } else {
            sub_partition
        }
    }

    async fn store_version_chunking_enabled(&self) -> bool {
        match self.metadata_store.store_version_state().await {
            Ok(Some(state)) => state.chunking_enabled,
            _ => false,
        }
    }

    // ========================================================================
    // Action processing
    // ========================================================================

    async fn process_consumer_actions(&self) {
        for action in self.actions.drain() {
            let partition = action.partition;
            if let Err(e) = self.process_consumer_action(action).await {
                error!(
                    topic = %self.version_topic,
                    partition,
                    error = %e,
                    "Consumer action failed"
                );
                self.stage_partition_error(partition, e);
            }
        }
    }

    async fn process_consumer_action(&self, action: ConsumerAction) -> Result<()> {
        match action.action_type {
            ConsumerActionType::Subscribe => self.process_subscribe(action.partition).await,
            ConsumerActionType::Unsubscribe => {
                self.process_unsubscribe(action.partition, false).await
            }
            ConsumerActionType::Reset => self.process_reset(action.partition).await,
            ConsumerActionType::StandbyToLeader => self.process_standby_to_leader(action).await,
            ConsumerActionType::LeaderToStandby => self.process_leader_to_standby(action).await,
            ConsumerActionType::DropPartition => {
                self.process_unsubscribe(action.partition, true).await
            }
            ConsumerActionType::KillConsumption => {
                info!(topic = %self.version_topic, "Kill requested; stopping ingestion task");
                self.running.store(false, Ordering::Release);
                Ok(())
            }
        }
    }

    async fn process_subscribe(&self, partition: u32) -> Result<()> {
        if self.partition_states.contains_key(&partition) {
            debug!(
                topic = %self.version_topic,
                partition,
                "Already subscribed; ignoring duplicate SUBSCRIBE"
            );
            return Ok(());
        }
        let offset_record = self.metadata_store.load_offset_record(partition).await?;
        let mut pcs = PartitionConsumptionState::new(partition, offset_record, self.hybrid_store);
        pcs.incremental_push_enabled = self.incremental_push_enabled;
        pcs.incremental_push_policy = self.incremental_push_policy;
        pcs.end_of_push_received = pcs.offset_record.end_of_push_received();
        // Restore the last observed TopicSwitch so a restarted replica that
        // gets promoted knows its real-time source cluster.
        if let Ok(Some(state)) = self.metadata_store.store_version_state().await {
            pcs.pending_topic_switch = state.last_topic_switch.clone();
        }
        let validator = DataIntegrityValidator::restore_from(partition, &pcs.offset_record);
        let start_offset = pcs.offset_record.local_version_topic_offset();

        self.partition_states
            .insert(partition, Arc::new(Mutex::new(pcs)));
        self.validators
            .insert(partition, Arc::new(Mutex::new(validator)));
        self.upstream
            .subscribe(
                &self.version_topic,
                partition,
                start_offset,
                &self.config.local_upstream_url,
            )
            .await?;
        self.status.report_started(partition).await;
        info!(
            topic = %self.version_topic,
            partition,
            offset = start_offset,
            "Subscribed partition as standby"
        );
        Ok(())
    }

    async fn process_unsubscribe(&self, partition: u32, drop_data: bool) -> Result<()> {
        let Some(pcs_arc) = self.partition_state(partition) else {
            if drop_data {
                self.storage.drop_partition(partition).await?;
                self.metadata_store.clear_offset_record(partition).await?;
            }
            return Ok(());
        };

        let (is_leader, leader_topic) = {
            let pcs = pcs_arc.lock().await;
            pcs.bump_session_id();
            (
                pcs.is_leader(),
                pcs.offset_record.leader_topic().map(str::to_string),
            )
        };
        if is_leader {
            if let Some(leader_topic) = &leader_topic {
                self.upstream
                    .unsubscribe(
                        leader_topic,
                        self.source_topic_partition(leader_topic, partition),
                    )
                    .await?;
            }
        } else {
            self.upstream
                .unsubscribe(&self.version_topic, partition)
                .await?;
        }

        self.wait_for_all_messages_processed(partition).await;

        {
            let pcs = pcs_arc.lock().await;
            self.metadata_store
                .persist_offset_record(partition, &pcs.offset_record)
                .await?;
        }
        if let Some(producer) = self.producer.get() {
            producer.close_partition(partition).await?;
        }
        self.partition_states.remove(&partition);
        self.validators.remove(&partition);

        if drop_data {
            self.storage.drop_partition(partition).await?;
            self.metadata_store.clear_offset_record(partition).await?;
            info!(topic = %self.version_topic, partition, "Dropped partition");
        } else {
            info!(topic = %self.version_topic, partition, "Unsubscribed partition");
        }
        Ok(())
    }

    async fn process_reset(&self, partition: u32) -> Result<()> {
        if let Some(pcs_arc) = self.partition_state(partition) {
            let mut pcs = pcs_arc.lock().await;
            pcs.offset_record = OffsetRecord::new();
            pcs.end_of_push_received = false;
            pcs.complete = false;
            pcs.latch_released = false;
            pcs.clear_transient_records();
        }
        if let Some(validator) = self.validators.get(&partition) {
            *validator.lock().await = DataIntegrityValidator::new(partition);
        }
        self.metadata_store.clear_offset_record(partition).await?;
        info!(topic = %self.version_topic, partition, "Reset partition offset state");
        Ok(())
    }

    async fn process_standby_to_leader(&self, action: ConsumerAction) -> Result<()> {
        let partition = action.partition;
        if let Some(checker) = &action.session_checker {
            if !checker.is_session_id_valid() {
                info!(
                    topic = %self.version_topic,
                    partition,
                    "Skipping STANDBY_TO_LEADER: another role was assigned to this replica"
                );
                return Ok(());
            }
        }
        let Some(pcs_arc) = self.partition_state(partition) else {
            return Err(IngestionError::UnknownPartition { partition });
        };
        let mut pcs = pcs_arc.lock().await;
        if pcs.is_leader() {
            info!(
                topic = %self.version_topic,
                partition,
                "Skipping STANDBY_TO_LEADER: replica is the leader already"
            );
            return Ok(());
        }
        if self.is_migration_duplicate_store.load(Ordering::Acquire) {
            pcs.role = LeaderFollowerState::PauseTransitionFromStandbyToLeader;
            info!(
                topic = %self.version_topic,
                partition,
                "Paused transition from standby to leader (migration duplicate store)"
            );
        } else {
            pcs.role = LeaderFollowerState::InTransitionFromStandbyToLeader;
            info!(
                topic = %self.version_topic,
                partition,
                "In transition from standby to leader"
            );
        }
        Ok(())
    }

    async fn process_leader_to_standby(&self, action: ConsumerAction) -> Result<()> {
        let partition = action.partition;
        if let Some(checker) = &action.session_checker {
            if !checker.is_session_id_valid() {
                info!(
                    topic = %self.version_topic,
                    partition,
                    "Skipping LEADER_TO_STANDBY: another role was assigned to this replica"
                );
                return Ok(());
            }
        }
        let Some(pcs_arc) = self.partition_state(partition) else {
            return Err(IngestionError::UnknownPartition { partition });
        };

        let (leader_topic, consume_remotely, already_standby) = {
            let pcs = pcs_arc.lock().await;
            (
                pcs.offset_record.leader_topic().map(str::to_string),
                pcs.consume_remotely,
                pcs.role.is_standby(),
            )
        };
        if already_standby {
            info!(
                topic = %self.version_topic,
                partition,
                "Skipping LEADER_TO_STANDBY: replica is a follower already"
            );
            return Ok(());
        }

        let needs_drain = leader_topic
            .as_deref()
            .map(|lt| lt != self.version_topic || consume_remotely)
            .unwrap_or(false);
        if needs_drain {
            let leader_topic = leader_topic.expect("checked above");
            self.upstream
                .unsubscribe(
                    &leader_topic,
                    self.source_topic_partition(&leader_topic, partition),
                )
                .await?;
            self.wait_for_all_messages_processed(partition).await;

            let resume_offset = {
                let mut pcs = pcs_arc.lock().await;
                pcs.consume_remotely = false;
                // Followers always consume the local version topic.
                pcs.skip_kafka_message = false;
                pcs.offset_record.local_version_topic_offset()
            };
            self.upstream
                .subscribe(
                    &self.version_topic,
                    partition,
                    resume_offset,
                    &self.config.local_upstream_url,
                )
                .await?;
            info!(
                topic = %self.version_topic,
                partition,
                offset = resume_offset,
                "Demoted leader resubscribed to local version topic"
            );
        }

        {
            let mut pcs = pcs_arc.lock().await;
            pcs.role = LeaderFollowerState::Standby;
            pcs.clear_transient_records();
        }
        // Close the current segment so the demoted leader's stream is sealed.
        if let Some(producer) = self.producer.get() {
            producer.end_segment(partition, true).await?;
        }
        info!(topic = %self.version_topic, partition, "Demoted to standby");
        Ok(())
    }

    /// Drain the partition's queued records and its last in-flight produce.
    ///
    /// Waits are bounded; a producer-future timeout is a benign failure:
    /// the future is cancelled, the pointer cleared, and the partition
    /// continues.
    async fn wait_for_all_messages_processed(&self, partition: u32) {
        let Some(pcs_arc) = self.partition_state(partition) else {
            return;
        };
        let (queued, persist) = {
            let pcs = pcs_arc.lock().await;
            (
                pcs.last_queued_record_persisted_future.clone(),
                pcs.last_leader_persist_future.clone(),
            )
        };
        if let Some(signal) = queued {
            if signal
                .wait_timeout(self.config.producer_wait_timeout)
                .await
                .is_none()
            {
                warn!(
                    topic = %self.version_topic,
                    partition,
                    "Timed out waiting for the last queued record to persist"
                );
            }
        }
        if let Some(signal) = persist {
            match signal.wait_timeout(self.config.producer_wait_timeout).await {
                Some(SignalResult::Completed) => {}
                Some(other) => {
                    warn!(
                        topic = %self.version_topic,
                        partition,
                        result = ?other,
                        "Last leader produce did not persist cleanly; continuing"
                    );
                    metrics::BENIGN_LEADER_PRODUCER_FAILURE.inc();
                    pcs_arc.lock().await.last_leader_persist_future = None;
                }
                None => {
                    error!(
                        topic = %self.version_topic,
                        partition,
                        "Timed out waiting for the last leader produce; no data loss"
                    );
                    signal.cancel();
                    metrics::BENIGN_LEADER_PRODUCER_FAILURE.inc();
                    pcs_arc.lock().await.last_leader_persist_future = None;
                }
            }
        }
    }

    // ========================================================================
    // Long-running task checker
    // ========================================================================

    /// Executed once per loop iteration, after the quick actions, so that
    /// long-running transitions never block other partitions' actions. There
    /// are no sleeps here; unfinished transitions are simply re-checked on
    /// the next iteration.
    async fn check_long_running_task_state(&self) -> Result<()> {
        let mut timed_out_partitions = Vec::new();
        for (partition, pcs_arc) in self.partition_snapshot() {
            let role = {
                let pcs = pcs_arc.lock().await;
                if pcs.errored {
                    continue;
                }
                if !pcs.is_complete()
                    && pcs.consumption_start_ts.elapsed() > self.config.bootstrap_timeout
                {
                    timed_out_partitions.push(partition);
                }
                pcs.role
            };
            match role {
                LeaderFollowerState::PauseTransitionFromStandbyToLeader => {
                    if !self.is_migration_duplicate_store.load(Ordering::Acquire) {
                        let mut pcs = pcs_arc.lock().await;
                        pcs.role = LeaderFollowerState::InTransitionFromStandbyToLeader;
                        info!(
                            topic = %self.version_topic,
                            partition,
                            "Resumed transition from standby to leader"
                        );
                    }
                }
                LeaderFollowerState::InTransitionFromStandbyToLeader => {
                    self.maybe_promote_in_transition_partition(&pcs_arc, partition)
                        .await?;
                }
                LeaderFollowerState::Leader => {
                    self.check_leader_state(&pcs_arc, partition).await?;
                }
                LeaderFollowerState::Standby | LeaderFollowerState::Offline => {}
            }
        }

        if !timed_out_partitions.is_empty() {
            metrics::PUSH_TIMEOUT.inc_by(timed_out_partitions.len() as u64);
            let timeout_hours = self.config.bootstrap_timeout.as_secs() / 3600;
            let message = format!(
                "partitions {timed_out_partitions:?} of {} did not complete ingestion within {timeout_hours}h",
                self.version_topic
            );
            error!(topic = %self.version_topic, "{message}");
            for partition in &timed_out_partitions {
                self.status.report_error(*partition, &message).await;
                if let Some(pcs_arc) = self.partition_state(*partition) {
                    pcs_arc.lock().await.errored = true;
                }
            }
            return Err(IngestionError::PushTimeout {
                partitions: timed_out_partitions,
                timeout_hours,
            });
        }
        Ok(())
    }

    /// Promote an in-transition partition once the version topic is quiet.
    ///
    /// It is possible for the consumer to starve a partition long enough
    /// that the old leader is still producing after the quiet period; if
    /// that happens, followers detect the upstream offset rewind by the
    /// producer identity change.
    async fn maybe_promote_in_transition_partition(
        &self,
        pcs_arc: &Arc<Mutex<PartitionConsumptionState>>,
        partition: u32,
    ) -> Result<()> {
        let mut pcs = pcs_arc.lock().await;
        if pcs.latest_message_consumption_ts.elapsed() <= self.config.new_leader_inactive_time() {
            return Ok(());
        }
        info!(
            topic = %self.version_topic,
            partition,
            "Quiet period elapsed; promoting to leader"
        );
        self.upstream
            .unsubscribe(&self.version_topic, partition)
            .await?;
        if pcs.offset_record.leader_topic().is_none() {
            // Never saw a TopicSwitch; the version topic is the leader feed.
            pcs.offset_record.set_leader_topic(self.version_topic.clone());
        }
        if !is_leader_sub_partition(partition, self.config.amplification_factor)
            && pcs.end_of_push_received
        {
            // Non-producing sub-partition after the bulk load: stay standby.
            pcs.role = LeaderFollowerState::Standby;
            let offset = pcs.offset_record.local_version_topic_offset();
            self.upstream
                .subscribe(
                    &self.version_topic,
                    partition,
                    offset,
                    &self.config.local_upstream_url,
                )
                .await?;
        } else {
            self.start_consuming_as_leader(&mut pcs, partition).await?;
        }
        // A pending TopicSwitch only executes after promotion; if the new
        // feed is empty this is the only chance to become ready to serve.
        self.check_ready_to_serve(&mut pcs, partition).await;
        Ok(())
    }

    async fn start_consuming_as_leader(
        &self,
        pcs: &mut PartitionConsumptionState,
        partition: u32,
    ) -> Result<()> {
        if self.config.native_replication_enabled {
            if self.remote_vt_url.is_none() {
                return Err(IngestionError::Config(
                    "native replication is enabled but no remote source address is set".to_string(),
                ));
            }
            if self.should_new_leader_switch_to_remote_consumption(pcs) {
                pcs.consume_remotely = true;
                info!(
                    topic = %self.version_topic,
                    partition,
                    leader_topic = ?pcs.offset_record.leader_topic(),
                    "Enabled remote consumption"
                );
            }
        }

        let source_urls = self.consumption_source_urls(pcs)?;
        if source_urls.len() != 1 {
            return Err(IngestionError::FatalProtocolViolation {
                partition,
                message: format!(
                    "expected exactly one leader source cluster URL, got {source_urls:?}"
                ),
            });
        }
        let source_url = source_urls.into_iter().next().expect("length checked");

        pcs.role = LeaderFollowerState::Leader;
        pcs.clear_transient_records();
        let leader_topic = pcs
            .offset_record
            .leader_topic()
            .expect("leader topic set before promotion")
            .to_string();
        let leader_start_offset = pcs
            .offset_record
            .upstream_offset(NON_AA_UPSTREAM_OFFSET_KEY);
        self.upstream
            .subscribe(
                &leader_topic,
                self.source_topic_partition(&leader_topic, partition),
                leader_start_offset,
                &source_url,
            )
            .await?;
        info!(
            topic = %self.version_topic,
            partition,
            leader_topic = %leader_topic,
            offset = leader_start_offset,
            url = %source_url,
            "Promoted to leader and started consuming"
        );
        Ok(())
    }

    fn should_new_leader_switch_to_remote_consumption(
        &self,
        pcs: &PartitionConsumptionState,
    ) -> bool {
        self.is_consuming_from_remote_version_topic(pcs)
            || self.is_leader_consuming_remote_real_time_topic(pcs)
    }

    fn is_consuming_from_remote_version_topic(&self, pcs: &PartitionConsumptionState) -> bool {
        // The source-fabric leader must not consume remotely, or it would
        // produce duplicate records.
        !pcs.end_of_push_received
            && !self.is_current_version.load(Ordering::Acquire)
            && self.remote_vt_url.as_deref() != Some(self.config.local_upstream_url.as_str())
    }

    fn is_leader_consuming_remote_real_time_topic(&self, pcs: &PartitionConsumptionState) -> bool {
        let Some(leader_topic) = pcs.offset_record.leader_topic() else {
            return false;
        };
        if !is_real_time_topic(leader_topic) {
            return false;
        }
        let urls = self.real_time_source_urls(pcs);
        match urls.len() {
            0 => false,
            1 => urls[0] != self.config.local_upstream_url,
            _ => true,
        }
    }

    fn real_time_source_urls(&self, pcs: &PartitionConsumptionState) -> Vec<String> {
        if !self.config.native_replication_enabled {
            return vec![self.config.local_upstream_url.clone()];
        }
        pcs.pending_topic_switch
            .as_ref()
            .map(|ts| ts.source_kafka_servers.clone())
            .unwrap_or_default()
    }

    fn consumption_source_urls(&self, pcs: &PartitionConsumptionState) -> Result<Vec<String>> {
        if pcs.consume_remotely {
            let leader_topic = pcs.offset_record.leader_topic().unwrap_or_default();
            if is_real_time_topic(leader_topic) {
                let urls = self.real_time_source_urls(pcs);
                if urls.is_empty() {
                    return Err(IngestionError::Config(format!(
                        "expected a real-time source cluster URL for partition {}",
                        pcs.partition
                    )));
                }
                Ok(urls)
            } else {
                Ok(vec![
                    self.remote_vt_url
                        .clone()
                        .ok_or_else(|| {
                            IngestionError::Config(
                                "remote consumption enabled without a remote source address"
                                    .to_string(),
                            )
                        })?,
                ])
            }
        } else {
            Ok(vec![self.config.local_upstream_url.clone()])
        }
    }

    async fn check_leader_state(
        &self,
        pcs_arc: &Arc<Mutex<PartitionConsumptionState>>,
        partition: u32,
    ) -> Result<()> {
        let current_leader_topic = {
            let pcs = pcs_arc.lock().await;
            match pcs.offset_record.leader_topic() {
                Some(topic) => topic.to_string(),
                None => {
                    let message = format!(
                        "missing leader topic for actual leader; {}",
                        pcs.offset_record.to_simplified_string()
                    );
                    return Err(IngestionError::FatalProtocolViolation { partition, message });
                }
            }
        };

        // A leader on a remote feed switches back to the local fabric once
        // the bulk load is over; TopicSwitch is only readable locally.
        let should_switch_local = {
            let pcs = pcs_arc.lock().await;
            self.should_leader_switch_to_local_consumption(&pcs)
        };
        if should_switch_local {
            self.upstream
                .unsubscribe(
                    &current_leader_topic,
                    self.source_topic_partition(&current_leader_topic, partition),
                )
                .await?;
            self.wait_for_all_messages_processed(partition).await;
            let resume_offset = {
                let mut pcs = pcs_arc.lock().await;
                pcs.consume_remotely = false;
                pcs.skip_kafka_message = false;
                pcs.offset_record.local_version_topic_offset()
            };
            self.upstream
                .subscribe(
                    &current_leader_topic,
                    partition,
                    resume_offset,
                    &self.config.local_upstream_url,
                )
                .await?;
            info!(
                topic = %self.version_topic,
                partition,
                leader_topic = %current_leader_topic,
                "Leader switched back to local consumption"
            );
        }

        {
            let mut pcs = pcs_arc.lock().await;
            if !is_leader_sub_partition(partition, self.config.amplification_factor)
                && pcs.end_of_push_received
            {
                self.upstream
                    .unsubscribe(
                        &current_leader_topic,
                        self.source_topic_partition(&current_leader_topic, partition),
                    )
                    .await?;
                pcs.consume_remotely = false;
                pcs.role = LeaderFollowerState::Standby;
                let offset = pcs.offset_record.local_version_topic_offset();
                self.upstream
                    .subscribe(
                        &self.version_topic,
                        partition,
                        offset,
                        &self.config.local_upstream_url,
                    )
                    .await?;
                return Ok(());
            }
        }

        let pending_switch = {
            let pcs = pcs_arc.lock().await;
            match &pcs.pending_topic_switch {
                Some(ts) if ts.source_topic_name != current_leader_topic => Some(ts.clone()),
                _ => None,
            }
        };
        if let Some(topic_switch) = pending_switch {
            let quiet = {
                let pcs = pcs_arc.lock().await;
                pcs.latest_message_consumption_ts.elapsed()
                    > self.config.new_leader_inactive_time()
            };
            let leaving_reprocessing = is_stream_reprocessing_topic(&current_leader_topic)
                && !is_stream_reprocessing_topic(&topic_switch.source_topic_name);
            if quiet || leaving_reprocessing {
                self.leader_execute_topic_switch(pcs_arc, partition, topic_switch)
                    .await?;
            }
        }
        Ok(())
    }

    fn should_leader_switch_to_local_consumption(&self, pcs: &PartitionConsumptionState) -> bool {
        pcs.consume_remotely
            && pcs.end_of_push_received
            && pcs
                .offset_record
                .leader_topic()
                .map(is_version_topic_or_stream_reprocessing_topic)
                .unwrap_or(false)
            && !(pcs.incremental_push_enabled
                && pcs.incremental_push_policy == IncrementalPushPolicy::PushToVersionTopic
                && !self.config.write_computation_enabled)
    }

    // ========================================================================
    // TopicSwitch
    // ========================================================================

    async fn leader_execute_topic_switch(
        &self,
        pcs_arc: &Arc<Mutex<PartitionConsumptionState>>,
        partition: u32,
        topic_switch: TopicSwitch,
    ) -> Result<()> {
        if topic_switch.source_kafka_servers.len() != 1 {
            return Err(IngestionError::FatalProtocolViolation {
                partition,
                message: format!(
                    "expected exactly one source cluster URL in TopicSwitch, got {:?}",
                    topic_switch.source_kafka_servers
                ),
            });
        }
        let new_source_url = topic_switch.source_kafka_servers[0].clone();
        let new_topic = topic_switch.source_topic_name.clone();
        let source_partition = self.source_topic_partition(&new_topic, partition);

        let (current_leader_topic, mut upstream_start_offset) = {
            let pcs = pcs_arc.lock().await;
            (
                pcs.offset_record
                    .leader_topic()
                    .unwrap_or(&self.version_topic)
                    .to_string(),
                pcs.offset_record.upstream_offset(NON_AA_UPSTREAM_OFFSET_KEY),
            )
        };
        if upstream_start_offset < 0 {
            upstream_start_offset = self
                .rewind_start_offset(&new_source_url, &new_topic, source_partition, &topic_switch)
                .await;
        }

        self.upstream
            .unsubscribe(
                &current_leader_topic,
                self.source_topic_partition(&current_leader_topic, partition),
            )
            .await?;
        self.wait_for_all_messages_processed(partition).await;

        {
            let mut pcs = pcs_arc.lock().await;
            if self.config.native_replication_enabled
                && new_source_url != self.config.local_upstream_url
            {
                pcs.consume_remotely = true;
                info!(
                    topic = %self.version_topic,
                    partition,
                    leader_topic = %new_topic,
                    "Enabled remote consumption for switched feed"
                );
            }
            pcs.offset_record.set_leader_topic(new_topic.clone());
            pcs.offset_record
                .set_upstream_offset(NON_AA_UPSTREAM_OFFSET_KEY, upstream_start_offset);
        }

        self.upstream
            .subscribe(
                &new_topic,
                source_partition,
                upstream_start_offset,
                &new_source_url,
            )
            .await?;
        info!(
            topic = %self.version_topic,
            partition,
            from = %current_leader_topic,
            to = %new_topic,
            offset = upstream_start_offset,
            "Leader switched feed topic"
        );

        // If the new feed is empty there will be no message to trigger the
        // readiness check, so run it here.
        let mut pcs = pcs_arc.lock().await;
        self.check_ready_to_serve(&mut pcs, partition).await;
        Ok(())
    }

    /// Start offset for a switched feed when no checkpoint exists.
    ///
    /// The upstream's offset-for-timestamp lookup returns the *next* offset
    /// to consume while subscribe seeks past the given offset, hence the
    /// `- 1`.
    async fn rewind_start_offset(
        &self,
        url: &str,
        topic: &str,
        partition: u32,
        topic_switch: &TopicSwitch,
    ) -> Offset {
        if topic_switch.rewind_start_timestamp <= 0 {
            return LOWEST_OFFSET;
        }
        match self
            .metadata_cache
            .offset_for_timestamp(url, topic, partition, topic_switch.rewind_start_timestamp)
            .await
        {
            Ok(Some(offset)) if offset != LOWEST_OFFSET => offset - 1,
            Ok(_) => LOWEST_OFFSET,
            Err(e) => {
                warn!(
                    topic = %topic,
                    partition,
                    error = %e,
                    "Offset-for-timestamp lookup failed; starting from oldest"
                );
                LOWEST_OFFSET
            }
        }
    }

    /// Handle a TopicSwitch control message as it is drained.
    async fn process_topic_switch(
        &self,
        topic_switch: TopicSwitch,
        pcs_arc: &Arc<Mutex<PartitionConsumptionState>>,
        partition: u32,
    ) -> Result<()> {
        if topic_switch.source_kafka_servers.len() != 1 {
            return Err(IngestionError::FatalProtocolViolation {
                partition,
                message: format!(
                    "expected exactly one source cluster URL in TopicSwitch, got {:?}",
                    topic_switch.source_kafka_servers
                ),
            });
        }
        self.status.report_topic_switch_received(partition).await;
        let source_url = topic_switch.source_kafka_servers[0].clone();
        let new_topic = topic_switch.source_topic_name.clone();
        let source_partition = self.source_topic_partition(&new_topic, partition);
        let upstream_start_offset = self
            .rewind_start_offset(&source_url, &new_topic, source_partition, &topic_switch)
            .await;

        // TopicSwitch is only valid after the version state exists, i.e.
        // after StartOfPush was processed.
        self.metadata_store
            .update_store_version_state(None, |state| {
                if let Some(previous) = &state.last_topic_switch {
                    info!(
                        topic = %self.version_topic,
                        previous_source = %previous.source_topic_name,
                        new_source = %new_topic,
                        "Replacing persisted TopicSwitch"
                    );
                }
                state.last_topic_switch = Some(topic_switch.clone());
            })
            .await
            .map_err(|_| IngestionError::FatalProtocolViolation {
                partition,
                message: "received TopicSwitch before StartOfPush created the version state"
                    .to_string(),
            })?;

        let mut pcs = pcs_arc.lock().await;
        pcs.pending_topic_switch = Some(topic_switch);
        if pcs.is_leader() {
            // The leader must not switch here (drainer thread); it keeps
            // consuming its current feed until the checker executes the
            // switch. Only the rewound upstream position is recorded.
            pcs.offset_record
                .set_upstream_offset(NON_AA_UPSTREAM_OFFSET_KEY, upstream_start_offset);
        } else {
            // Followers track what the leader is about to do so follower
            // lag is measurable while the leader catches up.
            pcs.offset_record.set_leader_topic(new_topic);
            pcs.offset_record
                .set_upstream_offset(NON_AA_UPSTREAM_OFFSET_KEY, upstream_start_offset);
            self.check_ready_to_serve(&mut pcs, partition).await;
        }
        Ok(())
    }

    // ========================================================================
    // Polling & record delegation
    // ========================================================================

    async fn poll_and_delegate(&self) -> Result<()> {
        let records = self.upstream.poll().await?;
        for record in records {
            if !self.running() {
                break;
            }
            let sub_partition = sub_partition_for_record(
                &record.topic,
                record.partition,
                self.config.amplification_factor,
            );
            let Some(pcs_arc) = self.partition_state(sub_partition) else {
                debug!(
                    topic = %record.topic,
                    partition = sub_partition,
                    "Skipping record: partition no longer subscribed"
                );
                continue;
            };
            let proceed = {
                let mut pcs = pcs_arc.lock().await;
                if pcs.errored || !self.should_process_record(&mut pcs, &record) {
                    false
                } else {
                    pcs.latest_message_consumption_ts = Instant::now();
                    let role = if pcs.is_leader() {
                        metrics::ROLE_LEADER
                    } else {
                        metrics::ROLE_FOLLOWER
                    };
                    metrics::record_consumed(role, 1, record.payload_size() as u64);
                    true
                }
            };
            if proceed {
                self.delegate_consumer_record(record, sub_partition, &pcs_arc)
                    .await;
            }
        }
        Ok(())
    }

    fn should_process_record(
        &self,
        pcs: &mut PartitionConsumptionState,
        record: &ConsumedRecord,
    ) -> bool {
        match pcs.role {
            LeaderFollowerState::Leader => {
                let consuming_remote_vt_post_push = pcs.consume_remotely
                    && pcs
                        .offset_record
                        .leader_topic()
                        .map(is_version_topic_or_stream_reprocessing_topic)
                        .unwrap_or(false)
                    && !(pcs.incremental_push_enabled
                        && pcs.incremental_push_policy == IncrementalPushPolicy::PushToVersionTopic
                        && !self.config.write_computation_enabled);
                if consuming_remote_vt_post_push {
                    if pcs.skip_kafka_message {
                        let key = format!("skip-post-eop/{}/{}", record.topic, pcs.partition);
                        if !self.log_filter.is_redundant(&key) {
                            info!(
                                topic = %record.topic,
                                partition = pcs.partition,
                                "Skipping messages after EndOfPush in remote version topic"
                            );
                        }
                        return false;
                    }
                    if record.key.is_control_message()
                        && matches!(
                            record.value.payload,
                            MessagePayload::Control(ControlMessage::EndOfPush)
                        )
                    {
                        // Skip everything after EndOfPush on the remote feed;
                        // the checker flips this off when switching local.
                        pcs.skip_kafka_message = true;
                    }
                }
                let current_leader_topic = pcs
                    .offset_record
                    .leader_topic()
                    .unwrap_or(&self.version_topic);
                if record.topic != current_leader_topic {
                    let key = format!("leader-topic-mismatch/{}/{}", record.topic, pcs.partition);
                    if !self.log_filter.is_redundant(&key) {
                        error!(
                            topic = %record.topic,
                            expected = %current_leader_topic,
                            partition = pcs.partition,
                            "Leader received a record that does not belong to its leader topic"
                        );
                    }
                    return false;
                }
                true
            }
            _ => {
                if record.topic != self.version_topic {
                    self.stage_partition_error(
                        pcs.partition,
                        IngestionError::FatalProtocolViolation {
                            partition: pcs.partition,
                            message: format!(
                                "{} replica received a record from {} instead of {}",
                                pcs.role.state_name(),
                                record.topic,
                                self.version_topic
                            ),
                        },
                    );
                    return false;
                }
                if pcs.offset_record.local_version_topic_offset() >= record.offset {
                    debug!(
                        topic = %record.topic,
                        partition = pcs.partition,
                        offset = record.offset,
                        "Record already processed"
                    );
                    return false;
                }
                true
            }
        }
    }

    fn should_produce_to_version_topic(&self, pcs: &PartitionConsumptionState) -> bool {
        if !pcs.is_leader() {
            return false;
        }
        let leader_topic = pcs.offset_record.leader_topic().unwrap_or_default();
        leader_topic != self.version_topic || pcs.consume_remotely
    }

    async fn delegate_consumer_record(
        &self,
        record: ConsumedRecord,
        sub_partition: u32,
        pcs_arc: &Arc<Mutex<PartitionConsumptionState>>,
    ) -> DelegateResult {
        let mut pcs = pcs_arc.lock().await;
        let produces = self.should_produce_to_version_topic(&pcs);

        if matches!(record.value.payload, MessagePayload::Update(_)) && !produces {
            drop(pcs);
            self.stage_partition_error(
                sub_partition,
                IngestionError::FatalProtocolViolation {
                    partition: sub_partition,
                    message: format!(
                        "received UPDATE in a non-producing replica at offset {} of {}",
                        record.offset, record.topic
                    ),
                },
            );
            return DelegateResult::Skipped;
        }

        if !produces {
            drop(pcs);
            self.enqueue_to_drainer(sub_partition, record, None).await;
            return DelegateResult::QueuedToDrainer;
        }

        // The leader must never consume the local version topic and produce
        // it back to itself.
        if record.url == self.config.local_upstream_url && record.topic == self.version_topic {
            drop(pcs);
            self.stage_partition_error(
                sub_partition,
                IngestionError::FatalProtocolViolation {
                    partition: sub_partition,
                    message: format!(
                        "{} is consuming from the local version topic and producing back to it",
                        self.version_topic
                    ),
                },
            );
            return DelegateResult::Skipped;
        }

        if is_real_time_topic(&record.topic) {
            pcs.leader_consumed_upstream_rt_offset = record.offset;
            // Pass-through covers records consumed before EndOfPush; real-time
            // records are validated inline instead, so ordering between
            // validation and re-production is preserved.
            let validator_arc = self.validator(sub_partition);
            let outcome = validator_arc.lock().await.validate(&record.value);
            match outcome {
                Ok(ValidationOutcome::Valid(position)) => {
                    metrics::DIV_SUCCESS.inc();
                    pcs.offset_record
                        .record_producer_position(&record.value.producer_metadata.guid, position);
                }
                Ok(ValidationOutcome::Duplicate) => {
                    metrics::DIV_DUPLICATE.inc();
                    debug!(
                        topic = %record.topic,
                        partition = sub_partition,
                        offset = record.offset,
                        "Skipping duplicate real-time record"
                    );
                    return DelegateResult::DuplicateMessage;
                }
                Err(e) => {
                    // Fatal validation failures on the real-time feed are
                    // logged and tolerated; the version is already serving.
                    if pcs.end_of_push_received {
                        metrics::DIV_FATAL_POST_EOP.inc();
                    }
                    error!(
                        topic = %record.topic,
                        partition = sub_partition,
                        offset = record.offset,
                        error = %e,
                        "Fatal data validation error on real-time feed"
                    );
                }
            }
        }

        if record.key.is_control_message() {
            let MessagePayload::Control(control) = record.value.payload.clone() else {
                drop(pcs);
                self.stage_partition_error(
                    sub_partition,
                    IngestionError::FatalProtocolViolation {
                        partition: sub_partition,
                        message: format!(
                            "control-marked record without control payload at offset {}",
                            record.offset
                        ),
                    },
                );
                return DelegateResult::Skipped;
            };
            let mut produced = true;
            match &control {
                ControlMessage::StartOfPush { .. } | ControlMessage::EndOfPush => {
                    let ctx = LeaderProducedRecordContext::new_control(
                        record.offset,
                        control.clone(),
                    );
                    self.produce_to_version_topic(
                        &mut pcs,
                        &record,
                        sub_partition,
                        ctx,
                        ProduceKind::Passthrough,
                    )
                    .await;
                }
                ControlMessage::StartOfSegment | ControlMessage::EndOfSegment => {
                    // Segment markers are re-produced from reprocessing and
                    // remote version topics only; markers from a real-time
                    // feed are dropped because the leader rewrites DIV
                    // positions for that stream.
                    if !is_real_time_topic(&record.topic) {
                        let ctx = LeaderProducedRecordContext::new_control(
                            record.offset,
                            control.clone(),
                        );
                        self.produce_to_version_topic(
                            &mut pcs,
                            &record,
                            sub_partition,
                            ctx,
                            ProduceKind::Passthrough,
                        )
                        .await;
                    } else {
                        produced = false;
                    }
                }
                ControlMessage::StartOfBufferReplay => {
                    drop(pcs);
                    self.stage_partition_error(
                        sub_partition,
                        IngestionError::FatalProtocolViolation {
                            partition: sub_partition,
                            message: format!(
                                "received StartOfBufferReplay in leader/follower mode at offset {} of {}",
                                record.offset, record.topic
                            ),
                        },
                    );
                    return DelegateResult::Skipped;
                }
                ControlMessage::StartOfIncrementalPush { .. }
                | ControlMessage::EndOfIncrementalPush { .. } => {
                    let ctx = LeaderProducedRecordContext::new_control(
                        record.offset,
                        control.clone(),
                    );
                    self.produce_to_version_topic(
                        &mut pcs,
                        &record,
                        sub_partition,
                        ctx,
                        ProduceKind::Control {
                            control: control.clone(),
                            unsourced: false,
                        },
                    )
                    .await;
                }
                ControlMessage::TopicSwitch(_) => {
                    // Consumed offset of -1 so the produced record does not
                    // override the upstream offset recorded by the switch
                    // itself.
                    let ctx = LeaderProducedRecordContext::new_control(-1, control.clone());
                    self.produce_to_version_topic(
                        &mut pcs,
                        &record,
                        sub_partition,
                        ctx,
                        ProduceKind::Control {
                            control: control.clone(),
                            unsourced: true,
                        },
                    )
                    .await;
                }
            }
            if !control.is_segment_control_message() {
                info!(
                    topic = %record.topic,
                    partition = sub_partition,
                    offset = record.offset,
                    control = control.name(),
                    produced,
                    "Handled control message as leader"
                );
            }
            DelegateResult::ProducedToKafka
        } else {
            self.process_message_and_maybe_produce(&mut pcs, &record, sub_partition)
                .await;
            DelegateResult::ProducedToKafka
        }
    }

    async fn process_message_and_maybe_produce(
        &self,
        pcs: &mut PartitionConsumptionState,
        record: &ConsumedRecord,
        sub_partition: u32,
    ) {
        match record.value.payload.clone() {
            MessagePayload::Put(put) => {
                if self.config.write_computation_enabled && pcs.end_of_push_received {
                    pcs.set_transient_record(
                        record.offset,
                        &record.key.key,
                        Some(put.value.clone()),
                        put.schema_id,
                    );
                }
                if !pcs.end_of_push_received {
                    // Pass-through mode preserves the upstream producer
                    // metadata so followers can validate the re-produced
                    // stream end to end.
                    let ctx = LeaderProducedRecordContext::new_put(
                        record.offset,
                        record.key.key.clone(),
                        put,
                    );
                    self.produce_to_version_topic(
                        pcs,
                        record,
                        sub_partition,
                        ctx,
                        ProduceKind::Passthrough,
                    )
                    .await;
                } else {
                    let ctx = LeaderProducedRecordContext::new_put(
                        record.offset,
                        record.key.key.clone(),
                        put.clone(),
                    );
                    self.produce_to_version_topic(
                        pcs,
                        record,
                        sub_partition,
                        ctx,
                        ProduceKind::Put {
                            key: record.key.key.clone(),
                            value: put.value,
                            schema_id: put.schema_id,
                        },
                    )
                    .await;
                }
            }
            MessagePayload::Update(update) => {
                self.process_update(pcs, record, sub_partition, update).await;
            }
            MessagePayload::Delete => {
                if self.config.write_computation_enabled && pcs.end_of_push_received {
                    pcs.set_transient_record(record.offset, &record.key.key, None, 0);
                }
                let ctx =
                    LeaderProducedRecordContext::new_delete(record.offset, record.key.key.clone());
                self.produce_to_version_topic(
                    pcs,
                    record,
                    sub_partition,
                    ctx,
                    ProduceKind::Delete {
                        key: record.key.key.clone(),
                    },
                )
                .await;
            }
            MessagePayload::Control(_) => unreachable!("control messages handled by the caller"),
        }
    }

    async fn process_update(
        &self,
        pcs: &mut PartitionConsumptionState,
        record: &ConsumedRecord,
        sub_partition: u32,
        update: crate::ingestion::message::UpdatePayload,
    ) {
        if self.store_version_chunking_enabled().await {
            self.stage_partition_error(
                sub_partition,
                IngestionError::FatalProtocolViolation {
                    partition: sub_partition,
                    message: "UPDATE received on a chunked store version".to_string(),
                },
            );
            return;
        }
        let Some(processor) = &self.update_processor else {
            self.stage_partition_error(
                sub_partition,
                IngestionError::Config(
                    "received UPDATE but write computation is not enabled".to_string(),
                ),
            );
            return;
        };

        // Look up the base value: the transient cache first, then storage
        // decoded with the message's value schema as the reader schema.
        let (current_value, current_schema_id) = match pcs.transient_record(&record.key.key) {
            Some(transient) => (
                transient.value.as_ref().map(|v| v.to_vec()),
                Some(transient.value_schema_id),
            ),
            None => match self.storage.get(sub_partition, &record.key.key).await {
                Ok(Some(row)) => match split_schema_header(&row) {
                    Some((schema_id, value)) => (Some(value.to_vec()), Some(schema_id)),
                    None => (None, None),
                },
                Ok(None) => (None, None),
                Err(e) => {
                    self.stage_partition_error(sub_partition, e);
                    return;
                }
            },
        };

        let updated = match processor
            .apply_update(current_value.as_deref(), current_schema_id, &update)
            .await
        {
            Ok(updated) => updated,
            Err(e) => {
                self.stage_partition_error(sub_partition, e);
                return;
            }
        };

        match updated {
            None => {
                pcs.set_transient_record(record.offset, &record.key.key, None, update.schema_id);
                let ctx =
                    LeaderProducedRecordContext::new_delete(record.offset, record.key.key.clone());
                self.produce_to_version_topic(
                    pcs,
                    record,
                    sub_partition,
                    ctx,
                    ProduceKind::Delete {
                        key: record.key.key.clone(),
                    },
                )
                .await;
            }
            Some(new_value) => {
                let new_value = Bytes::from(new_value);
                pcs.set_transient_record(
                    record.offset,
                    &record.key.key,
                    Some(new_value.clone()),
                    update.schema_id,
                );
                let ctx = LeaderProducedRecordContext::new_put(
                    record.offset,
                    record.key.key.clone(),
                    PutPayload {
                        schema_id: update.schema_id,
                        value: new_value.clone(),
                    },
                );
                self.produce_to_version_topic(
                    pcs,
                    record,
                    sub_partition,
                    ctx,
                    ProduceKind::Put {
                        key: record.key.key.clone(),
                        value: new_value,
                        schema_id: update.schema_id,
                    },
                )
                .await;
            }
        }
    }

    async fn produce_to_version_topic(
        &self,
        pcs: &mut PartitionConsumptionState,
        source: &ConsumedRecord,
        sub_partition: u32,
        ctx: LeaderProducedRecordContext,
        kind: ProduceKind,
    ) {
        let chunking = self.store_version_chunking_enabled().await;
        let client = match self.producer.get_or_init(chunking).await {
            Ok(client) => client,
            Err(e) => {
                ctx.persisted_to_db.complete_err(e.to_string());
                self.stage_partition_error(sub_partition, e);
                return;
            }
        };

        let leader_metadata = match &kind {
            ProduceKind::Control { unsourced: true, .. } => {
                LeaderMetadata::unsourced(self.host_name.clone())
            }
            _ => LeaderMetadata {
                upstream_offset: source.offset,
                upstream_cluster_id: self.config.cluster_id_for_url(&source.url),
                host_name: self.host_name.clone(),
            },
        };
        pcs.last_leader_persist_future = Some(ctx.persisted_to_db.clone());

        let completion = match kind {
            ProduceKind::Passthrough => {
                client
                    .put_passthrough(
                        source.key.clone(),
                        source.value.clone(),
                        sub_partition,
                        leader_metadata,
                    )
                    .await
            }
            ProduceKind::Put {
                key,
                value,
                schema_id,
            } => {
                client
                    .put(key, value, schema_id, sub_partition, leader_metadata)
                    .await
            }
            ProduceKind::Delete { key } => client.delete(key, sub_partition, leader_metadata).await,
            ProduceKind::Control { control, .. } => {
                client
                    .send_control_message(control, sub_partition, leader_metadata, None)
                    .await
            }
        };

        match completion {
            Ok(completion) => {
                let sender = self
                    .callback_tx
                    .lock()
                    .expect("callback tx lock poisoned")
                    .clone();
                let pending = PendingProduce {
                    sub_partition,
                    source: source.clone(),
                    ctx,
                    completion,
                };
                match sender {
                    Some(sender) if sender.send(pending).is_ok() => {}
                    _ => {
                        self.stage_partition_error(
                            sub_partition,
                            IngestionError::Producer(
                                "producer callback worker is not available".to_string(),
                            ),
                        );
                    }
                }
            }
            Err(e) => {
                metrics::LEADER_PRODUCER_FAILURE.inc();
                error!(
                    topic = %self.version_topic,
                    partition = sub_partition,
                    error = %e,
                    "Failed to send record to version topic"
                );
                ctx.persisted_to_db.complete_err(e.to_string());
                if !pcs.end_of_push_received {
                    self.stage_partition_error(sub_partition, e);
                }
            }
        }
    }

    // ========================================================================
    // Producer callbacks
    // ========================================================================

    async fn handle_produce_completion(&self, pending: PendingProduce) {
        let PendingProduce {
            sub_partition,
            source,
            mut ctx,
            completion,
        } = pending;

        let result = match completion.wait().await {
            Ok(result) => result,
            Err(message) => {
                metrics::LEADER_PRODUCER_FAILURE.inc();
                error!(
                    topic = %self.version_topic,
                    partition = sub_partition,
                    source_topic = %source.topic,
                    source_offset = source.offset,
                    error = %message,
                    "Leader failed to send record to version topic"
                );
                let end_of_push_received = match self.partition_state(sub_partition) {
                    Some(pcs_arc) => pcs_arc.lock().await.end_of_push_received,
                    None => true,
                };
                ctx.persisted_to_db.complete_err(message.clone());
                // Before the bulk load completes a produce failure must fail
                // ingestion; afterwards the partition keeps serving.
                if !end_of_push_received {
                    self.stage_partition_error(
                        sub_partition,
                        IngestionError::Producer(message),
                    );
                }
                return;
            }
        };

        // Fan-out from a real-time feed: when the produced partition is not
        // this task's leader sub-partition, followers of that sub-partition
        // will apply the record; nothing to persist locally.
        let foreign_partition = {
            match self.partition_state(sub_partition) {
                Some(pcs_arc) => {
                    let pcs = pcs_arc.lock().await;
                    pcs.is_leader() && result.partition != sub_partition
                }
                None => true,
            }
        };
        if foreign_partition {
            ctx.persisted_to_db.complete_ok();
            return;
        }

        if let Some(chunking) = result.chunking {
            if chunking.manifest.keys_with_chunk_id_suffix.len() != chunking.chunks.len() {
                let message = format!(
                    "chunked value manifest lists {} keys for {} chunks",
                    chunking.manifest.keys_with_chunk_id_suffix.len(),
                    chunking.chunks.len()
                );
                ctx.persisted_to_db.complete_err(message.clone());
                self.stage_partition_error(
                    sub_partition,
                    IngestionError::Producer(message),
                );
                return;
            }
            let mut produced_bytes = 0u64;
            for (chunk_key, chunk) in chunking
                .manifest
                .keys_with_chunk_id_suffix
                .iter()
                .zip(chunking.chunks.iter())
            {
                produced_bytes += (chunk_key.len() + chunk.len()) as u64;
                let chunk_ctx =
                    LeaderProducedRecordContext::new_chunk(chunk_key.clone(), chunk.clone());
                self.enqueue_to_drainer(sub_partition, source.clone(), Some(chunk_ctx))
                    .await;
            }
            let manifest_bytes = match chunking.manifest.to_bytes() {
                Ok(bytes) => Bytes::from(bytes),
                Err(e) => {
                    ctx.persisted_to_db.complete_err(e.to_string());
                    self.stage_partition_error(sub_partition, e);
                    return;
                }
            };
            metrics::record_produced(
                chunking.chunks.len() as u64 + 1,
                produced_bytes + manifest_bytes.len() as u64,
            );
            let manifest_ctx = LeaderProducedRecordContext {
                consumed_offset: ctx.consumed_offset,
                produced_offset: result.offset,
                key: chunking.top_level_key,
                payload: LeaderProducedPayload::Put(PutPayload {
                    schema_id: CHUNKED_VALUE_MANIFEST_SCHEMA_ID,
                    value: manifest_bytes,
                }),
                persisted_to_db: ctx.persisted_to_db.clone(),
            };
            self.enqueue_to_drainer(sub_partition, source, Some(manifest_ctx))
                .await;
        } else {
            ctx.produced_offset = result.offset;
            metrics::record_produced(
                1,
                (result.serialized_key_size + result.serialized_value_size) as u64,
            );
            self.enqueue_to_drainer(sub_partition, source, Some(ctx))
                .await;
        }
    }

    async fn enqueue_to_drainer(
        &self,
        sub_partition: u32,
        record: ConsumedRecord,
        leader_ctx: Option<LeaderProducedRecordContext>,
    ) {
        let signal = CompletionSignal::new();
        if let Some(pcs_arc) = self.partition_state(sub_partition) {
            pcs_arc.lock().await.last_queued_record_persisted_future = Some(signal.clone());
        }
        let entry = DrainerEntry {
            sub_partition,
            record,
            leader_ctx,
            queued_signal: signal,
        };
        if let Err(e) = self.drainer.enqueue(entry).await {
            self.stage_partition_error(sub_partition, e);
        }
    }

    // ========================================================================
    // Drainer application
    // ========================================================================

    async fn apply_record(&self, entry: DrainerEntry) -> Result<()> {
        let sub_partition = entry.sub_partition;
        let Some(pcs_arc) = self.partition_state(sub_partition) else {
            // Unsubscribed while queued; nothing to apply.
            return Ok(());
        };
        match entry.leader_ctx {
            None => {
                self.apply_consumed_record(&pcs_arc, entry.record, sub_partition)
                    .await
            }
            Some(ctx) => {
                self.apply_leader_produced_record(&pcs_arc, entry.record, ctx, sub_partition)
                    .await
            }
        }
    }

    async fn apply_consumed_record(
        &self,
        pcs_arc: &Arc<Mutex<PartitionConsumptionState>>,
        record: ConsumedRecord,
        sub_partition: u32,
    ) -> Result<()> {
        let end_of_push_received = pcs_arc.lock().await.end_of_push_received;
        let validator_arc = self.validator(sub_partition);
        let outcome = validator_arc.lock().await.validate(&record.value);
        let mut validated_position = None;
        match outcome {
            Ok(ValidationOutcome::Valid(position)) => {
                metrics::DIV_SUCCESS.inc();
                validated_position = Some((record.value.producer_metadata.guid, position));
            }
            Ok(ValidationOutcome::Duplicate) => {
                metrics::DIV_DUPLICATE.inc();
                debug!(
                    topic = %record.topic,
                    partition = sub_partition,
                    offset = record.offset,
                    "Skipping duplicate record"
                );
                return Ok(());
            }
            Err(e) => {
                if end_of_push_received {
                    // The version is serving already; tolerate and count.
                    metrics::DIV_FATAL_POST_EOP.inc();
                    error!(
                        topic = %record.topic,
                        partition = sub_partition,
                        offset = record.offset,
                        error = %e,
                        "Fatal data validation error after EndOfPush; continuing"
                    );
                } else {
                    return Err(e);
                }
            }
        }

        // Rewind classification compares the rewound record against what is
        // currently stored, so it has to run before the record is applied.
        // A potentially lossy rewind before EndOfPush fails the partition
        // without applying the record.
        if let Some(new_upstream_offset) = record.value.upstream_offset() {
            let previous_upstream_offset = {
                pcs_arc
                    .lock()
                    .await
                    .offset_record
                    .upstream_offset(NON_AA_UPSTREAM_OFFSET_KEY)
            };
            self.check_and_handle_upstream_offset_rewind(
                pcs_arc,
                &record,
                new_upstream_offset,
                previous_upstream_offset,
                sub_partition,
            )
            .await?;
        }

        match &record.value.payload {
            MessagePayload::Control(control) => {
                self.process_control_message(control.clone(), &record, pcs_arc, sub_partition)
                    .await?;
            }
            MessagePayload::Put(put) => {
                let row = prepend_schema_header(put.schema_id, &put.value);
                self.storage
                    .put(sub_partition, &record.key.key, &row)
                    .await?;
            }
            MessagePayload::Delete => {
                self.storage.delete(sub_partition, &record.key.key).await?;
            }
            MessagePayload::Update(_) => {
                return Err(IngestionError::FatalProtocolViolation {
                    partition: sub_partition,
                    message: format!(
                        "UPDATE reached the drainer of a non-producing replica at offset {}",
                        record.offset
                    ),
                });
            }
        }

        let mut pcs = pcs_arc.lock().await;
        if let Some((guid, position)) = validated_position {
            pcs.offset_record.record_producer_position(&guid, position);
        }
        pcs.offset_record.set_local_version_topic_offset(record.offset);
        if let Some(new_upstream_offset) = record.value.upstream_offset() {
            // Keep updating the upstream offset whether or not a rewind was
            // observed; rewinds happen to the true leader when the old
            // leader does not stop producing, and followers must track it.
            pcs.offset_record
                .set_upstream_offset(NON_AA_UPSTREAM_OFFSET_KEY, new_upstream_offset);
        }
        pcs.offset_record
            .set_leader_producer_guid(record.value.producer_metadata.guid);
        if let Some(footer) = &record.value.leader_metadata {
            pcs.offset_record.set_leader_host_id(footer.host_name.clone());
        }

        self.maybe_sync_offset_record(&mut pcs, record.key.is_control_message(), sub_partition)
            .await?;
        self.check_ready_to_serve(&mut pcs, sub_partition).await;
        Ok(())
    }

    async fn apply_leader_produced_record(
        &self,
        pcs_arc: &Arc<Mutex<PartitionConsumptionState>>,
        record: ConsumedRecord,
        ctx: LeaderProducedRecordContext,
        sub_partition: u32,
    ) -> Result<()> {
        let mut is_control = false;
        match &ctx.payload {
            LeaderProducedPayload::Put(put) => {
                let row = prepend_schema_header(put.schema_id, &put.value);
                self.storage.put(sub_partition, &ctx.key, &row).await?;
            }
            LeaderProducedPayload::Delete => {
                self.storage.delete(sub_partition, &ctx.key).await?;
            }
            LeaderProducedPayload::Control(control) => {
                is_control = true;
                self.process_control_message(control.clone(), &record, pcs_arc, sub_partition)
                    .await?;
            }
        }

        let mut pcs = pcs_arc.lock().await;
        if self.config.write_computation_enabled {
            pcs.remove_transient_record_up_to(&ctx.key, ctx.consumed_offset);
        }
        // Chunks carry -1 for both offsets and must not move the checkpoint;
        // only the manifest does.
        if ctx.produced_offset >= 0 {
            pcs.offset_record
                .set_local_version_topic_offset(ctx.produced_offset);
        }
        if ctx.consumed_offset >= 0 {
            pcs.offset_record
                .set_upstream_offset(NON_AA_UPSTREAM_OFFSET_KEY, ctx.consumed_offset);
        }
        self.maybe_sync_offset_record(&mut pcs, is_control, sub_partition)
            .await?;
        self.check_ready_to_serve(&mut pcs, sub_partition).await;
        Ok(())
    }

    async fn process_control_message(
        &self,
        control: ControlMessage,
        record: &ConsumedRecord,
        pcs_arc: &Arc<Mutex<PartitionConsumptionState>>,
        sub_partition: u32,
    ) -> Result<()> {
        match control {
            ControlMessage::StartOfPush { chunked } => {
                self.metadata_store
                    .update_store_version_state(
                        Some(StoreVersionState::new(chunked, Default::default())),
                        |state| state.chunking_enabled = chunked,
                    )
                    .await?;
                if chunked {
                    if let Some(producer) = self.producer.get() {
                        producer.update_chunking_enabled(true);
                    }
                }
                self.storage.begin_batch_write(sub_partition).await?;
                info!(
                    topic = %self.version_topic,
                    partition = sub_partition,
                    chunked,
                    "Processed StartOfPush"
                );
            }
            ControlMessage::EndOfPush => {
                self.storage.end_batch_write(sub_partition).await?;
                {
                    let mut pcs = pcs_arc.lock().await;
                    pcs.end_of_push_received = true;
                    pcs.offset_record.set_end_of_push_received();
                }
                self.status.report_end_of_push_received(sub_partition).await;
                info!(
                    topic = %self.version_topic,
                    partition = sub_partition,
                    offset = record.offset,
                    "Processed EndOfPush"
                );
            }
            ControlMessage::StartOfSegment | ControlMessage::EndOfSegment => {
                // Segment bookkeeping is fully handled by validation.
            }
            ControlMessage::StartOfIncrementalPush { version } => {
                self.status
                    .report_incremental_push(sub_partition, &version, true)
                    .await;
            }
            ControlMessage::EndOfIncrementalPush { version } => {
                self.status
                    .report_incremental_push(sub_partition, &version, false)
                    .await;
            }
            ControlMessage::TopicSwitch(topic_switch) => {
                self.process_topic_switch(topic_switch, pcs_arc, sub_partition)
                    .await?;
            }
            ControlMessage::StartOfBufferReplay => {
                return Err(IngestionError::FatalProtocolViolation {
                    partition: sub_partition,
                    message: format!(
                        "received StartOfBufferReplay in leader/follower mode at offset {} of {}",
                        record.offset, record.topic
                    ),
                });
            }
        }
        Ok(())
    }

    // ========================================================================
    // Upstream rewind handling
    // ========================================================================

    /// Classify an upstream offset rewind observed on the non-producing path.
    ///
    /// A rewind from a different producer identity means two leaders were
    /// producing simultaneously (split brain). The rewound record is compared
    /// against the stored data: identical data is a benign rewind; diverging
    /// data is potentially lossy, which fails ingestion before EndOfPush and
    /// is tolerated (counted) after it.
    async fn check_and_handle_upstream_offset_rewind(
        &self,
        pcs_arc: &Arc<Mutex<PartitionConsumptionState>>,
        record: &ConsumedRecord,
        new_upstream_offset: Offset,
        previous_upstream_offset: Offset,
        sub_partition: u32,
    ) -> Result<()> {
        if new_upstream_offset >= previous_upstream_offset {
            return Ok(());
        }
        let (guid_changed, host_changed, end_of_push_received) = {
            let pcs = pcs_arc.lock().await;
            // Pass-through re-production reuses the upstream GUID, so the
            // leader host in the metadata footer is the second identity
            // check.
            let guid_changed = pcs
                .offset_record
                .leader_producer_guid()
                .map(|guid| *guid != record.value.producer_metadata.guid)
                .unwrap_or(false);
            let host_changed =
                match (&record.value.leader_metadata, pcs.offset_record.leader_host_id()) {
                    (Some(footer), Some(recorded)) => footer.host_name != recorded,
                    _ => false,
                };
            (guid_changed, host_changed, pcs.end_of_push_received)
        };
        if !guid_changed && !host_changed {
            return Ok(());
        }

        let mut lossy = true;
        let mut detail = String::new();
        match &record.value.payload {
            MessagePayload::Put(put) => {
                if let Ok(Some(stored)) = self.storage.get(sub_partition, &record.key.key).await {
                    if let Some((stored_schema_id, stored_value)) = split_schema_header(&stored) {
                        if stored_schema_id == put.schema_id && stored_value == put.value.as_ref() {
                            lossy = false;
                            detail = "rewound PUT matches the stored value".to_string();
                        }
                    }
                }
            }
            MessagePayload::Delete => {
                if let Ok(None) = self.storage.get(sub_partition, &record.key.key).await {
                    lossy = false;
                    detail = "rewound DELETE target is already deleted".to_string();
                }
            }
            // Control messages and partial updates cannot be compared.
            _ => {}
        }

        let message = format!(
            "partition {sub_partition} received upstream offset {new_upstream_offset} below \
             recorded {previous_upstream_offset}; new producer {}; multiple leaders are producing",
            record.value.producer_metadata.guid
        );
        if lossy {
            metrics::POTENTIALLY_LOSSY_LEADER_OFFSET_REWIND.inc();
            if !end_of_push_received {
                error!(topic = %self.version_topic, "{message}; failing ingestion");
                return Err(IngestionError::LossyRewind {
                    partition: sub_partition,
                    message,
                });
            }
            error!(
                topic = %self.version_topic,
                "{message}; tolerated during streaming ingestion"
            );
        } else {
            metrics::BENIGN_LEADER_OFFSET_REWIND.inc();
            info!(topic = %self.version_topic, "{message}; benign: {detail}");
        }
        Ok(())
    }

    // ========================================================================
    // Checkpointing & readiness
    // ========================================================================

    async fn maybe_sync_offset_record(
        &self,
        pcs: &mut PartitionConsumptionState,
        force: bool,
        sub_partition: u32,
    ) -> Result<()> {
        pcs.records_since_offset_sync += 1;
        if force || pcs.records_since_offset_sync >= self.config.offset_sync_interval_records {
            self.metadata_store
                .persist_offset_record(sub_partition, &pcs.offset_record)
                .await?;
            pcs.records_since_offset_sync = 0;
        }
        Ok(())
    }

    async fn check_ready_to_serve(&self, pcs: &mut PartitionConsumptionState, sub_partition: u32) {
        if pcs.complete || pcs.errored || !pcs.end_of_push_received {
            return;
        }
        let vt_end_offset = match self
            .metadata_cache
            .end_offset(
                &self.config.local_upstream_url,
                &self.version_topic,
                sub_partition,
            )
            .await
        {
            Ok(offset) => offset,
            Err(e) => {
                warn!(
                    topic = %self.version_topic,
                    partition = sub_partition,
                    error = %e,
                    "Failed to read version-topic end offset"
                );
                return;
            }
        };

        let caught_up_base_topic =
            vt_end_offset - 1 <= pcs.offset_record.local_version_topic_offset();
        if caught_up_base_topic && !pcs.latch_released {
            self.status
                .report_catch_up_base_topic_offset_lag(sub_partition)
                .await;
            pcs.latch_released = true;
        }

        let ready = if !pcs.hybrid {
            caught_up_base_topic
        } else {
            match self.measure_hybrid_lag(pcs, sub_partition).await {
                Some(lag) => lag <= self.config.hybrid_offset_lag_threshold,
                None => false,
            }
        };
        if ready {
            pcs.complete = true;
            self.status.report_completed(sub_partition).await;
            info!(
                topic = %self.version_topic,
                partition = sub_partition,
                role = pcs.role.state_name(),
                "Partition is ready to serve"
            );
        }
    }

    /// Hybrid lag: leaders measure against their real-time feed, followers
    /// against the local version topic.
    async fn measure_hybrid_lag(
        &self,
        pcs: &PartitionConsumptionState,
        sub_partition: u32,
    ) -> Option<i64> {
        if pcs.is_leader() {
            self.measure_leader_lag(pcs, sub_partition).await
        } else {
            let end = self
                .metadata_cache
                .end_offset(
                    &self.config.local_upstream_url,
                    &self.version_topic,
                    sub_partition,
                )
                .await
                .ok()?;
            Some(((end - 1) - pcs.offset_record.local_version_topic_offset()).max(0))
        }
    }

    async fn measure_leader_lag(
        &self,
        pcs: &PartitionConsumptionState,
        sub_partition: u32,
    ) -> Option<i64> {
        let leader_topic = pcs.offset_record.leader_topic()?.to_string();
        if is_real_time_topic(&leader_topic) {
            let urls = self.real_time_source_urls(pcs);
            let url = if urls.len() == 1 {
                urls.into_iter().next().expect("length checked")
            } else if urls.contains(&self.config.local_upstream_url) {
                self.config.local_upstream_url.clone()
            } else {
                return None;
            };
            let source_partition = self.source_topic_partition(&leader_topic, sub_partition);
            let end = self
                .metadata_cache
                .end_offset(&url, &leader_topic, source_partition)
                .await
                .ok()?;
            let consumed = pcs
                .leader_consumed_upstream_rt_offset
                .max(pcs.offset_record.upstream_offset(NON_AA_UPSTREAM_OFFSET_KEY));
            Some(((end - 1) - consumed).max(0))
        } else {
            let end = self
                .metadata_cache
                .end_offset(
                    &self.config.local_upstream_url,
                    &self.version_topic,
                    sub_partition,
                )
                .await
                .ok()?;
            Some(((end - 1) - pcs.offset_record.local_version_topic_offset()).max(0))
        }
    }

    // ========================================================================
    // Error surfacing
    // ========================================================================

    async fn surface_partition_errors(&self) {
        let staged: Vec<(u32, IngestionError)> = {
            let keys: Vec<u32> = self.partition_errors.iter().map(|e| *e.key()).collect();
            keys.into_iter()
                .filter_map(|k| self.partition_errors.remove(&k))
                .collect()
        };
        for (partition, error) in staged {
            error!(
                topic = %self.version_topic,
                partition,
                error = %error,
                "Partition failed"
            );
            self.status.report_error(partition, &error.to_string()).await;
            if let Some(pcs_arc) = self.partition_state(partition) {
                pcs_arc.lock().await.errored = true;
            }
            *self
                .last_ingestion_error
                .lock()
                .expect("error slot lock poisoned") = Some(error);
        }
    }
}

impl std::fmt::Debug for IngestionTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionTask")
            .field("version_topic", &self.inner.version_topic)
            .field("running", &self.inner.running())
            .field("partitions", &self.inner.partition_states.len())
            .finish()
    }
}
