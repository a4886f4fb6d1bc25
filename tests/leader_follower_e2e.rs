//! End-to-end tests for the leader/follower ingestion task.
//!
//! These tests drive a full ingestion task over the in-memory collaborators:
//! a batch push tailed as a follower, promotion to leader with a real-time
//! feed, demotion with in-flight produces, chunked values, write-compute,
//! and restart idempotence.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use tributary::config::IngestionConfig;
use tributary::ingestion::message::prepend_schema_header;
use tributary::ingestion::mock::{
    InMemoryBroker, InMemoryProducerClient, InMemoryStorageEngine, InMemoryUpstreamClient,
    OverwriteUpdateProcessor, RecordingStatusReporter, StatusEvent,
};
use tributary::ingestion::{
    CHUNK_SCHEMA_ID, CHUNKED_VALUE_MANIFEST_SCHEMA_ID, ControlMessage, IngestionTask,
    IngestionTaskBuilder, LeaderFollowerState, MessageEnvelope, MessagePayload,
    NON_AA_UPSTREAM_OFFSET_KEY, OffsetRecord, ProducerClient, ProducerMetadata, PutPayload,
    RecordKey, StorageEngine, TopicSwitch, UpdatePayload,
};
use tributary::types::{LOWEST_OFFSET, ProducerGuid};

const LOCAL_URL: &str = "kafka://local:9092";
const STORE: &str = "orders";
const VT: &str = "orders_v1";
const RT: &str = "orders_rt";
const PARTITION: u32 = 3;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Fixture
// ============================================================================

struct Fixture {
    broker: Arc<InMemoryBroker>,
    storage: Arc<InMemoryStorageEngine>,
    reporter: Arc<RecordingStatusReporter>,
    producer: Arc<InMemoryProducerClient>,
    task: IngestionTask,
}

fn fixture(configure: impl FnOnce(&mut IngestionConfig)) -> Fixture {
    fixture_with(configure, |builder| builder)
}

fn fixture_with(
    configure: impl FnOnce(&mut IngestionConfig),
    shape: impl FnOnce(IngestionTaskBuilder) -> IngestionTaskBuilder,
) -> Fixture {
    let broker = Arc::new(InMemoryBroker::new());
    let storage = Arc::new(InMemoryStorageEngine::new());
    let reporter = Arc::new(RecordingStatusReporter::new());
    let producer = Arc::new(InMemoryProducerClient::new(broker.clone(), LOCAL_URL, VT));

    let mut config = IngestionConfig {
        local_upstream_url: LOCAL_URL.to_string(),
        promotion_to_leader_replica_delay: Duration::ZERO,
        system_store_promotion_to_leader_replica_delay: Duration::ZERO,
        upstream_metadata_ttl: Duration::from_millis(1),
        drainer_pool_size: 2,
        ..IngestionConfig::default()
    };
    configure(&mut config);

    let producer_for_factory = producer.clone();
    let builder = IngestionTask::builder(STORE, 1)
        .config(config)
        .storage(storage.clone())
        .upstream(Arc::new(InMemoryUpstreamClient::new(broker.clone())))
        .status_reporter(reporter.clone())
        .host_name("host-self")
        .producer_factory(Box::new(move |chunking| {
            producer_for_factory.update_chunking_enabled(chunking);
            let client: Arc<dyn ProducerClient> = producer_for_factory.clone();
            Ok(client)
        }));
    let task = shape(builder).build().expect("ingestion task builds");

    Fixture {
        broker,
        storage,
        reporter,
        producer,
        task,
    }
}

fn guid(tag: u8) -> ProducerGuid {
    ProducerGuid([tag; 16])
}

fn meta(g: ProducerGuid, segment: i32, sequence: i32) -> ProducerMetadata {
    ProducerMetadata {
        guid: g,
        segment_number: segment,
        sequence_number: sequence,
        message_timestamp_ms: 0,
        upstream_offset: -1,
    }
}

fn put_envelope(g: ProducerGuid, segment: i32, sequence: i32, value: &[u8]) -> MessageEnvelope {
    MessageEnvelope {
        producer_metadata: meta(g, segment, sequence),
        leader_metadata: None,
        payload: MessagePayload::Put(PutPayload {
            schema_id: 1,
            value: Bytes::copy_from_slice(value),
        }),
    }
}

fn control_envelope(
    g: ProducerGuid,
    segment: i32,
    sequence: i32,
    control: ControlMessage,
) -> MessageEnvelope {
    MessageEnvelope {
        producer_metadata: meta(g, segment, sequence),
        leader_metadata: None,
        payload: MessagePayload::Control(control),
    }
}

fn stored_row(schema_id: i32, value: &[u8]) -> Vec<u8> {
    prepend_schema_header(schema_id, value).to_vec()
}

/// Controller/push-job producer writing the batch data to the version topic.
const PUSH_GUID: u8 = 0xaa;
/// User-facing producer writing to the real-time topic.
const RT_GUID: u8 = 0xbb;

/// Seed the version topic with a complete batch push (offsets 99..=102) and
/// tail it as a follower.
async fn run_batch_push(f: &Fixture) {
    f.broker.set_base_offset(LOCAL_URL, VT, PARTITION, 99);
    f.broker.append(
        LOCAL_URL,
        VT,
        PARTITION,
        RecordKey::control(),
        control_envelope(
            guid(PUSH_GUID),
            0,
            0,
            ControlMessage::StartOfPush { chunked: false },
        ),
    );
    f.broker.append(
        LOCAL_URL,
        VT,
        PARTITION,
        RecordKey::data(&b"k"[..]),
        put_envelope(guid(PUSH_GUID), 0, 1, b"v1"),
    );
    f.broker.append(
        LOCAL_URL,
        VT,
        PARTITION,
        RecordKey::data(&b"k"[..]),
        put_envelope(guid(PUSH_GUID), 0, 2, b"v2"),
    );
    f.broker.append(
        LOCAL_URL,
        VT,
        PARTITION,
        RecordKey::control(),
        control_envelope(guid(PUSH_GUID), 0, 3, ControlMessage::EndOfPush),
    );

    f.task.subscribe(PARTITION).expect("subscribe");
    f.task.run_once().await.expect("run_once");
    assert!(f.task.wait_for_drained(PARTITION, DRAIN_TIMEOUT).await);
}

/// Deliver a TopicSwitch to the real-time topic and promote the replica.
async fn switch_to_rt_and_promote(f: &Fixture) {
    f.broker.append(
        LOCAL_URL,
        VT,
        PARTITION,
        RecordKey::control(),
        control_envelope(
            guid(PUSH_GUID),
            0,
            4,
            ControlMessage::TopicSwitch(TopicSwitch {
                source_topic_name: RT.to_string(),
                source_kafka_servers: vec![LOCAL_URL.to_string()],
                rewind_start_timestamp: -1,
            }),
        ),
    );
    f.task.run_once().await.expect("run_once");
    assert!(f.task.wait_for_drained(PARTITION, DRAIN_TIMEOUT).await);

    // Followers track the switch immediately so their lag stays measurable.
    let record = f.task.offset_record(PARTITION).await.expect("offset record");
    assert_eq!(record.leader_topic(), Some(RT));
    // rewindStartTimestamp <= 0 means "from oldest".
    assert_eq!(
        record.upstream_offset(NON_AA_UPSTREAM_OFFSET_KEY),
        LOWEST_OFFSET
    );

    let checker = f.task.session_checker(PARTITION).await;
    f.task
        .promote_to_leader(PARTITION, checker)
        .expect("promote");
    f.task.run_once().await.expect("run_once");
    f.task.run_once().await.expect("run_once");
    assert_eq!(
        f.task.partition_role(PARTITION).await,
        Some(LeaderFollowerState::Leader)
    );
    assert!(f.broker.is_subscribed(RT, PARTITION));
    assert!(!f.broker.is_subscribed(VT, PARTITION));
}

// ============================================================================
// E1: batch push tailed as follower
// ============================================================================

#[tokio::test]
async fn test_batch_push_then_follower() {
    let f = fixture(|_| {});
    run_batch_push(&f).await;

    // Last write wins.
    assert_eq!(
        f.storage.get_raw(PARTITION, b"k"),
        Some(stored_row(1, b"v2"))
    );

    let record = f.task.offset_record(PARTITION).await.expect("offset record");
    assert_eq!(record.local_version_topic_offset(), 102);
    assert_eq!(f.task.is_end_of_push_received(PARTITION).await, Some(true));

    // No producer activity for a pure follower.
    assert_eq!(f.broker.records(LOCAL_URL, VT, PARTITION).len(), 4);
    assert!(f.producer.ended_segments().is_empty());

    // EndOfPush forced an offset-record sync.
    let persisted = f
        .storage
        .get_metadata("P_3")
        .await
        .expect("metadata read")
        .expect("offset record persisted");
    let persisted = OffsetRecord::from_bytes(&persisted).expect("decodes");
    assert_eq!(persisted.local_version_topic_offset(), 102);
    assert!(persisted.end_of_push_received());

    // Batch partition caught up the version topic: completion reported once.
    assert!(f.reporter.has_completed(PARTITION));
    assert_eq!(
        f.reporter
            .count(|e| matches!(e, StatusEvent::Completed(p) if *p == PARTITION)),
        1
    );
    assert_eq!(
        f.reporter
            .count(|e| matches!(e, StatusEvent::CatchUpBaseTopicOffsetLag(p) if *p == PARTITION)),
        1
    );
    assert!(!f.reporter.has_error(PARTITION));
}

// ============================================================================
// E2: promotion with a real-time feed
// ============================================================================

#[tokio::test]
async fn test_promotion_with_real_time_feed() {
    let f = fixture_with(|_| {}, |builder| builder.hybrid_store(true));
    run_batch_push(&f).await;
    switch_to_rt_and_promote(&f).await;

    // A real-time write arrives at upstream offset 50.
    f.broker.set_base_offset(LOCAL_URL, RT, PARTITION, 50);
    f.broker.append(
        LOCAL_URL,
        RT,
        PARTITION,
        RecordKey::data(&b"k"[..]),
        put_envelope(guid(RT_GUID), 0, 0, b"v3"),
    );
    f.task.run_once().await.expect("run_once");
    assert!(f.task.wait_for_drained(PARTITION, DRAIN_TIMEOUT).await);

    // The leader re-produced the record to the version topic; followers see
    // it with the source offset in the leader metadata footer.
    let vt_records = f.broker.records(LOCAL_URL, VT, PARTITION);
    let produced = vt_records.last().expect("produced record");
    let footer = produced
        .value
        .leader_metadata
        .as_ref()
        .expect("leader footer");
    assert_eq!(footer.upstream_offset, 50);
    assert_eq!(footer.host_name, "host-self");
    match &produced.value.payload {
        MessagePayload::Put(put) => assert_eq!(put.value.as_ref(), b"v3"),
        other => panic!("unexpected payload {other:?}"),
    }

    assert_eq!(
        f.storage.get_raw(PARTITION, b"k"),
        Some(stored_row(1, b"v3"))
    );
    let record = f.task.offset_record(PARTITION).await.expect("offset record");
    assert_eq!(record.upstream_offset(NON_AA_UPSTREAM_OFFSET_KEY), 50);
    // SOP..EOP at 99..102, TopicSwitch at 103, produced record at 104.
    assert_eq!(record.local_version_topic_offset(), 104);
    assert!(!f.reporter.has_error(PARTITION));
}

#[tokio::test]
async fn test_promotion_with_empty_real_time_feed_is_ready() {
    let f = fixture_with(|_| {}, |builder| builder.hybrid_store(true));
    run_batch_push(&f).await;
    switch_to_rt_and_promote(&f).await;

    // No real-time traffic at all: lag against the empty feed is zero and
    // the partition serves.
    assert_eq!(f.task.hybrid_leader_offset_lag().await, 0);
    assert_eq!(f.task.is_partition_complete(PARTITION).await, Some(true));
}

// ============================================================================
// E6: demotion drains in-flight produces
// ============================================================================

#[tokio::test]
async fn test_demotion_waits_for_in_flight_produces() {
    let f = fixture_with(|_| {}, |builder| builder.hybrid_store(true));
    run_batch_push(&f).await;
    switch_to_rt_and_promote(&f).await;

    f.broker.set_base_offset(LOCAL_URL, RT, PARTITION, 50);
    f.producer.hold_acks();
    f.broker.append(
        LOCAL_URL,
        RT,
        PARTITION,
        RecordKey::data(&b"k"[..]),
        put_envelope(guid(RT_GUID), 0, 0, b"v3"),
    );
    f.broker.append(
        LOCAL_URL,
        RT,
        PARTITION,
        RecordKey::data(&b"k"[..]),
        put_envelope(guid(RT_GUID), 0, 1, b"v4"),
    );
    f.task.run_once().await.expect("run_once");
    assert_eq!(f.producer.held_ack_count(), 2);
    // Acks are held, so nothing has been persisted yet.
    assert_eq!(
        f.storage.get_raw(PARTITION, b"k"),
        Some(stored_row(1, b"v2"))
    );

    let checker = f.task.session_checker(PARTITION).await;
    f.task
        .demote_to_standby(PARTITION, checker)
        .expect("demote");
    let producer = f.producer.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        producer.release_held_acks();
    });
    // Demotion blocks on the last leader persist future until the acks
    // release and the drainer catches up.
    f.task.run_once().await.expect("run_once");

    assert_eq!(
        f.task.partition_role(PARTITION).await,
        Some(LeaderFollowerState::Standby)
    );
    assert_eq!(
        f.storage.get_raw(PARTITION, b"k"),
        Some(stored_row(1, b"v4"))
    );

    let produced_end = f.broker.end_offset(LOCAL_URL, VT, PARTITION);
    let record = f.task.offset_record(PARTITION).await.expect("offset record");
    assert_eq!(record.local_version_topic_offset(), produced_end - 1);

    // Resubscribed to the version topic exactly at the persisted offset.
    assert!(f.broker.is_subscribed(VT, PARTITION));
    assert!(!f.broker.is_subscribed(RT, PARTITION));
    assert_eq!(
        f.broker.subscription_position(VT, PARTITION),
        Some(produced_end)
    );
    assert_eq!(f.task.is_consuming_remotely(PARTITION).await, Some(false));

    // The producer segment for the partition was sealed.
    assert!(f.producer.ended_segments().contains(&(PARTITION, true)));
    assert!(!f.reporter.has_error(PARTITION));
}

// ============================================================================
// Chunked values
// ============================================================================

#[tokio::test]
async fn test_chunked_leader_produce_applies_chunks_and_manifest() {
    let f = fixture_with(|_| {}, |builder| builder.hybrid_store(true));

    // Batch push announcing chunking.
    f.broker.set_base_offset(LOCAL_URL, VT, PARTITION, 0);
    f.broker.append(
        LOCAL_URL,
        VT,
        PARTITION,
        RecordKey::control(),
        control_envelope(
            guid(PUSH_GUID),
            0,
            0,
            ControlMessage::StartOfPush { chunked: true },
        ),
    );
    f.broker.append(
        LOCAL_URL,
        VT,
        PARTITION,
        RecordKey::control(),
        control_envelope(guid(PUSH_GUID), 0, 1, ControlMessage::EndOfPush),
    );
    f.task.subscribe(PARTITION).expect("subscribe");
    f.task.run_once().await.expect("run_once");
    assert!(f.task.wait_for_drained(PARTITION, DRAIN_TIMEOUT).await);

    switch_to_rt_and_promote(&f).await;
    f.producer.set_chunk_size_limit(4);

    f.broker.set_base_offset(LOCAL_URL, RT, PARTITION, 50);
    f.broker.append(
        LOCAL_URL,
        RT,
        PARTITION,
        RecordKey::data(&b"big"[..]),
        put_envelope(guid(RT_GUID), 0, 0, b"0123456789"),
    );
    f.task.run_once().await.expect("run_once");
    assert!(f.task.wait_for_drained(PARTITION, DRAIN_TIMEOUT).await);

    // Three chunks and the manifest all reached storage.
    for index in 0..3 {
        let chunk_key = format!("big_chunk_{index}");
        let row = f
            .storage
            .get_raw(PARTITION, chunk_key.as_bytes())
            .unwrap_or_else(|| panic!("chunk {index} missing"));
        assert_eq!(
            i32::from_be_bytes([row[0], row[1], row[2], row[3]]),
            CHUNK_SCHEMA_ID
        );
    }
    let manifest_row = f.storage.get_raw(PARTITION, b"big").expect("manifest row");
    assert_eq!(
        i32::from_be_bytes([
            manifest_row[0],
            manifest_row[1],
            manifest_row[2],
            manifest_row[3]
        ]),
        CHUNKED_VALUE_MANIFEST_SCHEMA_ID
    );

    // Only the manifest moved the checkpoint: local offset is the manifest's
    // produced offset, upstream is the consumed source offset.
    let record = f.task.offset_record(PARTITION).await.expect("offset record");
    let produced_end = f.broker.end_offset(LOCAL_URL, VT, PARTITION);
    assert_eq!(record.local_version_topic_offset(), produced_end - 1);
    assert_eq!(record.upstream_offset(NON_AA_UPSTREAM_OFFSET_KEY), 50);
    assert!(!f.reporter.has_error(PARTITION));
}

// ============================================================================
// Write compute
// ============================================================================

#[tokio::test]
async fn test_update_applies_write_compute_delta() {
    let f = fixture_with(
        |c| c.write_computation_enabled = true,
        |builder| {
            builder
                .hybrid_store(true)
                .update_processor(Arc::new(OverwriteUpdateProcessor))
        },
    );
    run_batch_push(&f).await;
    switch_to_rt_and_promote(&f).await;

    f.broker.set_base_offset(LOCAL_URL, RT, PARTITION, 50);
    f.broker.append(
        LOCAL_URL,
        RT,
        PARTITION,
        RecordKey::data(&b"k"[..]),
        MessageEnvelope {
            producer_metadata: meta(guid(RT_GUID), 0, 0),
            leader_metadata: None,
            payload: MessagePayload::Update(UpdatePayload {
                schema_id: 1,
                derived_schema_id: 1,
                update: Bytes::from_static(b"v9"),
            }),
        },
    );
    f.task.run_once().await.expect("run_once");
    assert!(f.task.wait_for_drained(PARTITION, DRAIN_TIMEOUT).await);

    // The delta replaced the stored value and was produced as a PUT.
    assert_eq!(
        f.storage.get_raw(PARTITION, b"k"),
        Some(stored_row(1, b"v9"))
    );
    let produced = f.broker.records(LOCAL_URL, VT, PARTITION);
    match &produced.last().expect("produced").value.payload {
        MessagePayload::Put(put) => assert_eq!(put.value.as_ref(), b"v9"),
        other => panic!("unexpected payload {other:?}"),
    }
    assert!(!f.reporter.has_error(PARTITION));
}

#[tokio::test]
async fn test_update_in_follower_is_fatal() {
    let f = fixture(|_| {});
    run_batch_push(&f).await;

    f.broker.append(
        LOCAL_URL,
        VT,
        PARTITION,
        RecordKey::data(&b"k"[..]),
        MessageEnvelope {
            producer_metadata: meta(guid(PUSH_GUID), 0, 4),
            leader_metadata: None,
            payload: MessagePayload::Update(UpdatePayload {
                schema_id: 1,
                derived_schema_id: 1,
                update: Bytes::from_static(b"delta"),
            }),
        },
    );
    f.task.run_once().await.expect("run_once");

    assert!(f.reporter.has_error(PARTITION));
    let messages = f.reporter.error_messages(PARTITION);
    assert!(messages.iter().any(|m| m.contains("UPDATE")));
    // The bad record was not applied.
    assert_eq!(
        f.storage.get_raw(PARTITION, b"k"),
        Some(stored_row(1, b"v2"))
    );
}

// ============================================================================
// Restart & duplicates
// ============================================================================

#[tokio::test]
async fn test_restart_in_standby_is_idempotent() {
    let f = fixture(|c| c.offset_sync_interval_records = 1);
    run_batch_push(&f).await;

    let before = f.storage.get_raw(PARTITION, b"k");
    f.task.unsubscribe(PARTITION).expect("unsubscribe");
    f.task.run_once().await.expect("run_once");
    assert!(f.task.partition_role(PARTITION).await.is_none());

    // Resubscribe: restores the checkpoint and replays nothing.
    f.task.subscribe(PARTITION).expect("subscribe");
    f.task.run_once().await.expect("run_once");
    assert!(f.task.wait_for_drained(PARTITION, DRAIN_TIMEOUT).await);
    assert_eq!(f.storage.get_raw(PARTITION, b"k"), before);
    let record = f.task.offset_record(PARTITION).await.expect("offset record");
    assert_eq!(record.local_version_topic_offset(), 102);
    assert_eq!(f.task.is_end_of_push_received(PARTITION).await, Some(true));

    // New records continue the stream seamlessly.
    f.broker.append(
        LOCAL_URL,
        VT,
        PARTITION,
        RecordKey::data(&b"k"[..]),
        put_envelope(guid(PUSH_GUID), 0, 4, b"v5"),
    );
    f.task.run_once().await.expect("run_once");
    assert!(f.task.wait_for_drained(PARTITION, DRAIN_TIMEOUT).await);
    assert_eq!(
        f.storage.get_raw(PARTITION, b"k"),
        Some(stored_row(1, b"v5"))
    );
    assert!(!f.reporter.has_error(PARTITION));
}

#[tokio::test]
async fn test_duplicate_record_is_skipped() {
    let f = fixture(|_| {});
    f.broker.set_base_offset(LOCAL_URL, VT, PARTITION, 99);
    f.broker.append(
        LOCAL_URL,
        VT,
        PARTITION,
        RecordKey::control(),
        control_envelope(
            guid(PUSH_GUID),
            0,
            0,
            ControlMessage::StartOfPush { chunked: false },
        ),
    );
    f.broker.append(
        LOCAL_URL,
        VT,
        PARTITION,
        RecordKey::data(&b"k"[..]),
        put_envelope(guid(PUSH_GUID), 0, 1, b"v1"),
    );
    // Same producer position delivered again: a duplicate, not an error.
    f.broker.append(
        LOCAL_URL,
        VT,
        PARTITION,
        RecordKey::data(&b"k"[..]),
        put_envelope(guid(PUSH_GUID), 0, 1, b"duplicate"),
    );

    f.task.subscribe(PARTITION).expect("subscribe");
    f.task.run_once().await.expect("run_once");
    assert!(f.task.wait_for_drained(PARTITION, DRAIN_TIMEOUT).await);

    assert_eq!(
        f.storage.get_raw(PARTITION, b"k"),
        Some(stored_row(1, b"v1"))
    );
    // The skipped duplicate did not advance the checkpoint.
    let record = f.task.offset_record(PARTITION).await.expect("offset record");
    assert_eq!(record.local_version_topic_offset(), 100);
    assert!(!f.reporter.has_error(PARTITION));
}

// ============================================================================
// Producer fan-out boundary
// ============================================================================

#[tokio::test]
async fn test_callback_for_foreign_partition_skips_drainer() {
    let f = fixture_with(|_| {}, |builder| builder.hybrid_store(true));
    run_batch_push(&f).await;
    switch_to_rt_and_promote(&f).await;

    // The producer reports the record landed in another sub-partition.
    f.producer.override_reported_partition(Some(PARTITION + 1));
    f.broker.set_base_offset(LOCAL_URL, RT, PARTITION, 50);
    f.broker.append(
        LOCAL_URL,
        RT,
        PARTITION,
        RecordKey::data(&b"k"[..]),
        put_envelope(guid(RT_GUID), 0, 0, b"v3"),
    );
    f.task.run_once().await.expect("run_once");
    // The persist future completes without a drainer enqueue.
    assert!(f.task.wait_for_drained(PARTITION, DRAIN_TIMEOUT).await);

    assert_eq!(
        f.storage.get_raw(PARTITION, b"k"),
        Some(stored_row(1, b"v2"))
    );
    let record = f.task.offset_record(PARTITION).await.expect("offset record");
    // The checkpoint still points at the TopicSwitch record.
    assert_eq!(record.local_version_topic_offset(), 103);
    assert!(!f.reporter.has_error(PARTITION));
}

// ============================================================================
// Kill & lifecycle
// ============================================================================

#[tokio::test]
async fn test_kill_stops_the_task() {
    let f = fixture(|_| {});
    f.task.subscribe(PARTITION).expect("subscribe");
    f.task.run_once().await.expect("run_once");
    f.task.kill().expect("kill");
    f.task.run_once().await.expect("final iteration");
    assert!(!f.task.is_running());
    assert!(f.task.subscribe(PARTITION).is_err());
    assert!(f.task.run_once().await.is_err());
}

#[tokio::test]
async fn test_close_syncs_checkpoints_and_closes_producer() {
    let f = fixture_with(|_| {}, |builder| builder.hybrid_store(true));
    run_batch_push(&f).await;
    switch_to_rt_and_promote(&f).await;
    f.task.close().await;

    let persisted = f
        .storage
        .get_metadata("P_3")
        .await
        .expect("metadata read")
        .expect("offset record persisted");
    let persisted = OffsetRecord::from_bytes(&persisted).expect("decodes");
    assert_eq!(persisted.local_version_topic_offset(), 103);
    assert!(f.producer.is_closed());
}

#[tokio::test]
async fn test_drop_partition_removes_data_and_checkpoint() {
    let f = fixture(|_| {});
    run_batch_push(&f).await;
    assert!(f.storage.get_raw(PARTITION, b"k").is_some());

    f.task.drop_partition(PARTITION).expect("drop");
    f.task.run_once().await.expect("run_once");

    assert!(f.task.partition_role(PARTITION).await.is_none());
    assert!(f.storage.get_raw(PARTITION, b"k").is_none());
    assert!(f
        .storage
        .get_metadata("P_3")
        .await
        .expect("metadata read")
        .is_none());
}

// ============================================================================
// Stale role commands
// ============================================================================

#[tokio::test]
async fn test_stale_promotion_command_is_skipped() {
    let f = fixture_with(|_| {}, |builder| builder.hybrid_store(true));
    run_batch_push(&f).await;

    // Capture a checker, then invalidate the session by resubscribing.
    let stale_checker = f.task.session_checker(PARTITION).await;
    f.task.unsubscribe(PARTITION).expect("unsubscribe");
    f.task.run_once().await.expect("run_once");
    f.task.subscribe(PARTITION).expect("subscribe");
    f.task.run_once().await.expect("run_once");

    f.task
        .promote_to_leader(PARTITION, stale_checker)
        .expect("enqueue");
    f.task.run_once().await.expect("run_once");
    f.task.run_once().await.expect("run_once");

    // The late command must not revive leadership.
    assert_eq!(
        f.task.partition_role(PARTITION).await,
        Some(LeaderFollowerState::Standby)
    );
}
