//! End-to-end scenarios: producer pipeline → in-memory broker → consumer
//! pipeline, including outbox, chunking, retry policies and sequence
//! preemption.

#![allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect

use std::sync::Arc;
use std::time::Duration;

use ferrobus_core::consumer::{Consumer, ConsumerStatus};
use ferrobus_core::context::ShutdownSignal;
use ferrobus_core::endpoint::{
    BatchSettings, ChunkSettings, Endpoint, EndpointConfig, EndpointResolver,
};
use ferrobus_core::envelope::OutboundEnvelope;
use ferrobus_core::error_policy::ErrorPolicy;
use ferrobus_core::headers::{Headers, names};
use ferrobus_core::lock::DistributedLock;
use ferrobus_core::message::{DecodedMessage, JsonMessageSerializer};
use ferrobus_core::offset::{OffsetKey, OffsetStore};
use ferrobus_core::outbox::OutboxReader;
use ferrobus_core::producer::{
    DelegatedProducer, DirectProduceStrategy, OutboxProduceStrategy, Producer,
};
use ferrobus_runtime::{InMemoryLock, OutboxWorker, OutboxWorkerConfig};
use ferrobus_testing::{
    CapturingDispatcher, InMemoryBroker, InMemoryOffsetStore, InMemoryOutbox, wait_until,
};

const TOPIC: &str = "topic-a";
const GROUP: &str = "group-1";

fn order(n: i64) -> DecodedMessage {
    DecodedMessage::new("Order.v1".into(), serde_json::json!({ "n": n }))
}

fn direct_producer(broker: &InMemoryBroker, config: EndpointConfig) -> Producer {
    let client = Arc::new(broker.client("producer", &[]));
    Producer::new(
        EndpointResolver::Static(Endpoint::new(TOPIC)),
        Arc::new(config),
        Arc::new(DirectProduceStrategy::new(client)),
    )
}

struct RunningConsumer {
    signal: ShutdownSignal,
    task: tokio::task::JoinHandle<Result<(), ferrobus_core::error::PipelineError>>,
}

impl RunningConsumer {
    fn start(consumer: Consumer) -> Self {
        let signal = ShutdownSignal::new();
        let token = signal.token();
        let task = tokio::spawn(async move { consumer.run(token).await });
        Self { signal, task }
    }

    async fn stop(self) -> Result<(), ferrobus_core::error::PipelineError> {
        self.signal.trigger();
        self.task.await.unwrap()
    }
}

fn consumer(
    broker: &InMemoryBroker,
    dispatcher: &Arc<CapturingDispatcher>,
    offsets: &Arc<InMemoryOffsetStore>,
    config: EndpointConfig,
) -> Consumer {
    Consumer::new(
        Arc::new(broker.client(GROUP, &[TOPIC])),
        GROUP,
        Arc::clone(dispatcher) as _,
    )
    .endpoint(TOPIC, Arc::new(config))
    .offset_store(Arc::clone(offsets) as _)
}

/// Direct produce + consume: the typed message arrives once, the offset
/// advances, commit follows consume order.
#[tokio::test]
async fn direct_produce_and_consume() {
    let broker = InMemoryBroker::new();
    let producer = direct_producer(
        &broker,
        EndpointConfig::builder()
            .serializer(Arc::new(JsonMessageSerializer::new().require_headers()))
            .build(),
    );

    let id = producer.produce(order(1), None).await.unwrap().unwrap();
    assert_eq!(id.offset(), Some(0));

    let dispatcher = Arc::new(CapturingDispatcher::new());
    let offsets = Arc::new(InMemoryOffsetStore::new());
    let config = EndpointConfig::builder()
        .serializer(Arc::new(JsonMessageSerializer::new().require_headers()))
        .message_type("Order.v1")
        .build();
    let running = RunningConsumer::start(consumer(&broker, &dispatcher, &offsets, config));

    assert!(
        wait_until(Duration::from_secs(5), || async {
            dispatcher.dispatched().len() == 1
        })
        .await
    );
    running.stop().await.unwrap();

    let dispatched = dispatcher.dispatched();
    let message = dispatched[0].message.as_ref().unwrap();
    assert_eq!(message.type_name, "Order.v1");
    assert_eq!(message.payload, serde_json::json!({ "n": 1 }));

    assert_eq!(broker.committed(GROUP, TOPIC, 0), Some(0));
    let key = OffsetKey::new(GROUP, TOPIC, 0);
    assert_eq!(offsets.load(&key).await.unwrap(), Some(0));
}

/// FIFO within a partition: subscribers observe envelopes in offset order
/// and commits never overtake.
#[tokio::test]
async fn fifo_within_partition() {
    let broker = InMemoryBroker::new();
    let producer = direct_producer(&broker, EndpointConfig::default());
    for n in 0..5 {
        producer.produce(order(n), None).await.unwrap();
    }

    let dispatcher = Arc::new(CapturingDispatcher::new());
    let offsets = Arc::new(InMemoryOffsetStore::new());
    let running = RunningConsumer::start(consumer(
        &broker,
        &dispatcher,
        &offsets,
        EndpointConfig::default(),
    ));

    assert!(
        wait_until(Duration::from_secs(5), || async {
            dispatcher.dispatched().len() == 5
        })
        .await
    );
    running.stop().await.unwrap();

    let observed: Vec<_> = dispatcher
        .dispatched()
        .iter()
        .map(|e| e.message.as_ref().unwrap().payload["n"].clone())
        .collect();
    assert_eq!(
        observed,
        (0..5).map(|n| serde_json::json!(n)).collect::<Vec<_>>()
    );
    assert_eq!(broker.committed(GROUP, TOPIC, 0), Some(4));
}

/// Chunking: an oversized body travels as three chunks and arrives as one
/// reassembled, deserialized message; the offset advances past all chunks.
#[tokio::test]
async fn chunked_roundtrip() {
    let broker = InMemoryBroker::new();
    let producer = direct_producer(
        &broker,
        EndpointConfig::builder()
            .chunk(ChunkSettings::new(4096).unwrap())
            .build(),
    );

    let blob = "x".repeat(10 * 1024);
    let message = DecodedMessage::new("Blob.v1".into(), serde_json::json!({ "blob": blob }));
    producer.produce(message.clone(), None).await.unwrap();

    // Three chunks on the wire, all keyed by the same sequence id.
    let records = broker.records(TOPIC);
    assert_eq!(records.len(), 3);
    assert!(records[2].headers.is_last_chunk());
    assert_eq!(
        records[0].headers.message_id(),
        records[2].headers.message_id()
    );

    let dispatcher = Arc::new(CapturingDispatcher::new());
    let offsets = Arc::new(InMemoryOffsetStore::new());
    let running = RunningConsumer::start(consumer(
        &broker,
        &dispatcher,
        &offsets,
        EndpointConfig::default(),
    ));

    assert!(
        wait_until(Duration::from_secs(5), || async {
            dispatcher.dispatched().len() == 1
        })
        .await
    );
    running.stop().await.unwrap();

    let dispatched = dispatcher.dispatched();
    assert_eq!(dispatched[0].message.as_ref().unwrap().payload, message.payload);
    assert_eq!(broker.committed(GROUP, TOPIC, 0), Some(2));
    let key = OffsetKey::new(GROUP, TOPIC, 0);
    assert_eq!(offsets.load(&key).await.unwrap(), Some(2));
}

/// Outbox: the message is persisted instead of produced, the elected worker
/// drains it, the consumer sees exactly one copy, and the lock is free after
/// shutdown.
#[tokio::test]
async fn outbox_store_and_forward() {
    let broker = InMemoryBroker::new();
    let outbox = Arc::new(InMemoryOutbox::new());
    let lock = Arc::new(InMemoryLock::new());

    let producer = Producer::new(
        EndpointResolver::Static(Endpoint::new(TOPIC)),
        Arc::new(EndpointConfig::default()),
        Arc::new(OutboxProduceStrategy::new(Arc::clone(&outbox) as _)),
    );

    let id = producer.produce(order(1), None).await.unwrap();
    assert!(id.is_none());
    assert_eq!(outbox.count_pending(), 1);
    assert!(broker.records(TOPIC).is_empty());

    let worker = Arc::new(OutboxWorker::new(
        Arc::clone(&outbox) as _,
        Arc::new(broker.client("outbox", &[])),
        Arc::clone(&lock) as _,
        OutboxWorkerConfig {
            interval: Duration::from_millis(10),
            ..OutboxWorkerConfig::default()
        },
    ));
    let signal = ShutdownSignal::new();
    let worker_task = tokio::spawn({
        let worker = Arc::clone(&worker);
        let token = signal.token();
        async move { worker.run(token).await }
    });

    assert!(
        wait_until(Duration::from_secs(5), || async {
            outbox.count_pending() == 0
        })
        .await
    );
    signal.trigger();
    worker_task.await.unwrap();

    // The lock was released on worker shutdown.
    assert!(
        lock.acquire("outbox-worker", Duration::from_secs(30))
            .await
            .unwrap()
            .is_some()
    );

    let dispatcher = Arc::new(CapturingDispatcher::new());
    let offsets = Arc::new(InMemoryOffsetStore::new());
    let running = RunningConsumer::start(consumer(
        &broker,
        &dispatcher,
        &offsets,
        EndpointConfig::default(),
    ));
    assert!(
        wait_until(Duration::from_secs(5), || async {
            dispatcher.dispatched().len() == 1
        })
        .await
    );
    running.stop().await.unwrap();
}

/// Outbox worker crash between produce and acknowledge: the broker sees a
/// duplicate, but deduplication by message id yields a single subscriber
/// invocation.
#[tokio::test]
async fn outbox_crash_duplicate_is_deduplicated() {
    let broker = InMemoryBroker::new();
    let outbox = Arc::new(InMemoryOutbox::new());

    let producer = Producer::new(
        EndpointResolver::Static(Endpoint::new(TOPIC)),
        Arc::new(EndpointConfig::default()),
        Arc::new(OutboxProduceStrategy::new(Arc::clone(&outbox) as _)),
    );
    producer.produce(order(1), None).await.unwrap();

    // First worker run produces the row but crashes before acknowledging.
    let client = Arc::new(broker.client("outbox", &[]));
    let delegated = DelegatedProducer::new(Arc::clone(&client) as _);
    let rows = outbox.read(10).await.unwrap();
    delegated.produce_stored(&rows[0]).await.unwrap();

    // Restarted worker re-produces and acknowledges.
    let worker = OutboxWorker::new(
        Arc::clone(&outbox) as _,
        client,
        Arc::new(InMemoryLock::new()),
        OutboxWorkerConfig::default(),
    );
    assert_eq!(worker.tick().await.unwrap(), 1);
    assert_eq!(outbox.count_pending(), 0);

    // Two copies on the wire, identical bodies and headers.
    let records = broker.records(TOPIC);
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].body, records[1].body);
    assert_eq!(
        records[0].headers.message_id(),
        records[1].headers.message_id()
    );

    let dispatcher = Arc::new(CapturingDispatcher::new());
    let offsets = Arc::new(InMemoryOffsetStore::new());
    let running = RunningConsumer::start(consumer(
        &broker,
        &dispatcher,
        &offsets,
        EndpointConfig::default(),
    ));

    // Both offsets commit; only one dispatch happens.
    assert!(
        wait_until(Duration::from_secs(5), || async {
            broker.committed(GROUP, TOPIC, 0) == Some(1)
        })
        .await
    );
    running.stop().await.unwrap();
    assert_eq!(dispatcher.dispatched().len(), 1);
}

/// Retry(2) then skip: the pipeline runs exactly three times, the
/// failed-attempts header ends at 2, the offset commits, and the next
/// message is processed.
#[tokio::test]
async fn retry_then_skip_exhausts_and_moves_on() {
    let broker = InMemoryBroker::new();
    let producer = direct_producer(&broker, EndpointConfig::default());
    producer.produce(order(1), None).await.unwrap();
    producer.produce(order(2), None).await.unwrap();

    let dispatcher = Arc::new(CapturingDispatcher::new());
    dispatcher.fail_times(3);

    let offsets = Arc::new(InMemoryOffsetStore::new());
    let config = EndpointConfig::builder()
        .error_policy(ErrorPolicy::retry(2).then_skip())
        .build();
    let running = RunningConsumer::start(consumer(&broker, &dispatcher, &offsets, config));

    assert!(
        wait_until(Duration::from_secs(5), || async {
            broker.committed(GROUP, TOPIC, 0) == Some(1)
        })
        .await
    );
    running.stop().await.unwrap();

    // Three attempts for the first message, then one for the second.
    let attempts = dispatcher.attempts();
    assert_eq!(attempts.len(), 4);
    assert_eq!(attempts[0].headers.failed_attempts(), 0);
    assert_eq!(attempts[1].headers.failed_attempts(), 1);
    assert_eq!(attempts[2].headers.failed_attempts(), 2);

    let dispatched = dispatcher.dispatched();
    assert_eq!(dispatched.len(), 1);
    assert_eq!(
        dispatched[0].message.as_ref().unwrap().payload["n"],
        serde_json::json!(2)
    );
}

/// A failed message can be moved to another endpoint with its headers and
/// body preserved.
#[tokio::test]
async fn failed_message_moves_to_dead_letter_endpoint() {
    let broker = InMemoryBroker::new();
    let producer = direct_producer(&broker, EndpointConfig::default());
    producer.produce(order(13), None).await.unwrap();

    let dispatcher = Arc::new(CapturingDispatcher::new());
    dispatcher.always_fail();

    let offsets = Arc::new(InMemoryOffsetStore::new());
    let config = EndpointConfig::builder()
        .error_policy(ErrorPolicy::move_to(Endpoint::new("dead-letters")))
        .build();
    let running = RunningConsumer::start(consumer(&broker, &dispatcher, &offsets, config));

    assert!(
        wait_until(Duration::from_secs(5), || async {
            broker.records("dead-letters").len() == 1
        })
        .await
    );
    running.stop().await.unwrap();

    let moved = &broker.records("dead-letters")[0];
    assert_eq!(moved.body, br#"{"n":13}"#);
    assert_eq!(moved.headers.get(names::FAILED_ATTEMPTS), Some("1"));
    assert_eq!(broker.committed(GROUP, TOPIC, 0), Some(0));
}

/// Incomplete sequence preemption: a new first chunk aborts the pending
/// sequence; the new sequence completes normally.
#[tokio::test]
async fn incomplete_sequence_is_preempted() {
    let broker = InMemoryBroker::new();
    let client = broker.client("producer", &[]);

    let chunk = |seq: &str, index: u32, body: &[u8], last: bool| {
        let mut headers = Headers::new();
        headers.insert(names::MESSAGE_ID, seq);
        headers.insert(names::MESSAGE_TYPE, "Order.v1");
        headers.insert(names::CHUNK_INDEX, index.to_string());
        if last {
            headers.insert(names::CHUNK_IS_LAST, "true");
        }
        OutboundEnvelope::from_raw(body.to_vec(), headers, Endpoint::new(TOPIC))
    };

    use ferrobus_core::broker::BrokerClient;
    client.produce(&chunk("s1", 0, br#"{"n""#, false)).await.unwrap();
    client.produce(&chunk("s2", 0, br#"{"n":"#, false)).await.unwrap();
    client.produce(&chunk("s2", 1, br#"9}"#, true)).await.unwrap();

    let dispatcher = Arc::new(CapturingDispatcher::new());
    let offsets = Arc::new(InMemoryOffsetStore::new());
    let running = RunningConsumer::start(consumer(
        &broker,
        &dispatcher,
        &offsets,
        EndpointConfig::default(),
    ));

    assert!(
        wait_until(Duration::from_secs(5), || async {
            dispatcher.dispatched().len() == 1
        })
        .await
    );
    running.stop().await.unwrap();

    // S2 completed; S1's lone chunk was aborted and committed past.
    let dispatched = dispatcher.dispatched();
    assert_eq!(
        dispatched[0].message.as_ref().unwrap().payload["n"],
        serde_json::json!(9)
    );
    assert_eq!(broker.committed(GROUP, TOPIC, 0), Some(2));
}

/// Encrypted payloads round-trip through the broker; the key id header is
/// emitted for rotation.
#[tokio::test]
async fn encrypted_roundtrip() {
    use ferrobus_core::encryption::EncryptionSettings;

    let settings = EncryptionSettings::new([3; 32]).with_key_id("key-1");
    let broker = InMemoryBroker::new();
    let producer = direct_producer(
        &broker,
        EndpointConfig::builder().encryption(settings.clone()).build(),
    );
    producer.produce(order(5), None).await.unwrap();

    // Ciphertext on the wire.
    let records = broker.records(TOPIC);
    assert_ne!(records[0].body, br#"{"n":5}"#);
    assert_eq!(records[0].headers.get(names::ENCRYPTION_KEY_ID), Some("key-1"));

    let dispatcher = Arc::new(CapturingDispatcher::new());
    let offsets = Arc::new(InMemoryOffsetStore::new());
    let config = EndpointConfig::builder().encryption(settings).build();
    let running = RunningConsumer::start(consumer(&broker, &dispatcher, &offsets, config));

    assert!(
        wait_until(Duration::from_secs(5), || async {
            dispatcher.dispatched().len() == 1
        })
        .await
    );
    running.stop().await.unwrap();

    assert_eq!(
        dispatcher.dispatched()[0].message.as_ref().unwrap().payload,
        serde_json::json!({ "n": 5 })
    );
}

/// Batch consumption: the window closes on the size limit and all elements
/// commit together.
#[tokio::test]
async fn batch_window_closes_on_size() {
    let broker = InMemoryBroker::new();
    let producer = direct_producer(&broker, EndpointConfig::default());
    for n in 0..4 {
        producer.produce(order(n), None).await.unwrap();
    }

    let dispatcher = Arc::new(CapturingDispatcher::new());
    let offsets = Arc::new(InMemoryOffsetStore::new());
    let config = EndpointConfig::builder()
        .batch(BatchSettings::new(2, Duration::from_secs(60)).unwrap())
        .build();
    let running = RunningConsumer::start(consumer(&broker, &dispatcher, &offsets, config));

    assert!(
        wait_until(Duration::from_secs(5), || async {
            dispatcher.batch_sizes().len() == 2
        })
        .await
    );
    running.stop().await.unwrap();

    assert_eq!(dispatcher.batch_sizes(), vec![2, 2]);
    let dispatched = dispatcher.dispatched();
    assert_eq!(dispatched.len(), 4);
    // Batch headers are stamped on every element.
    assert_eq!(dispatched[0].headers.get(names::BATCH_SIZE), Some("2"));
    assert_eq!(
        dispatched[0].headers.get(names::BATCH_ID),
        dispatched[1].headers.get(names::BATCH_ID)
    );
    assert_eq!(broker.committed(GROUP, TOPIC, 0), Some(3));
}

/// Batch consumption: a partially filled window flushes when the time limit
/// elapses.
#[tokio::test]
async fn batch_window_closes_on_time() {
    let broker = InMemoryBroker::new();
    let producer = direct_producer(&broker, EndpointConfig::default());
    producer.produce(order(1), None).await.unwrap();

    let dispatcher = Arc::new(CapturingDispatcher::new());
    let offsets = Arc::new(InMemoryOffsetStore::new());
    let config = EndpointConfig::builder()
        .batch(BatchSettings::new(100, Duration::from_millis(100)).unwrap())
        .build();
    let running = RunningConsumer::start(consumer(&broker, &dispatcher, &offsets, config));

    assert!(
        wait_until(Duration::from_secs(5), || async {
            dispatcher.batch_sizes() == vec![1]
        })
        .await
    );
    running.stop().await.unwrap();
    assert_eq!(broker.committed(GROUP, TOPIC, 0), Some(0));
}

/// A stopped consumer surfaces its reason on the status watch.
#[tokio::test]
async fn stop_policy_surfaces_consumer_stopped() {
    let broker = InMemoryBroker::new();
    let producer = direct_producer(&broker, EndpointConfig::default());
    producer.produce(order(1), None).await.unwrap();

    let dispatcher = Arc::new(CapturingDispatcher::new());
    dispatcher.always_fail();

    let offsets = Arc::new(InMemoryOffsetStore::new());
    let consumer = consumer(
        &broker,
        &dispatcher,
        &offsets,
        EndpointConfig::default(), // default policy: stop
    );
    let mut status = consumer.status_watch();
    let running = RunningConsumer::start(consumer);

    assert!(
        wait_until(Duration::from_secs(5), || {
            let stopped = matches!(&*status.borrow_and_update(), ConsumerStatus::Stopped(_));
            async move { stopped }
        })
        .await
    );
    assert!(running.task.await.unwrap().is_err());
    running.signal.trigger();

    // Nothing was committed.
    assert_eq!(broker.committed(GROUP, TOPIC, 0), None);
}
