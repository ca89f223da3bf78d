//! Kafka broker client for Ferrobus.
//!
//! This crate implements the [`BrokerClient`] contract from `ferrobus-core`
//! on top of rdkafka. It works against Apache Kafka and every
//! Kafka-compatible broker (Redpanda, AWS MSK, Azure Event Hubs, ...).
//!
//! # Delivery semantics
//!
//! - **Producer**: async sends with configurable acks; when a
//!   `transactional_id` is configured, multi-envelope sets (chunk sequences)
//!   are produced atomically inside a Kafka transaction.
//! - **Consumer**: streaming consumption with manual commits driven by the
//!   core consumer pipeline — offsets are committed only after a unit was
//!   fully processed, giving at-least-once delivery.
//! - **Stored offsets**: when an [`OffsetStore`] is attached, stored offsets
//!   override the broker's committed offsets on start. The client seeks to
//!   `stored + 1` when it first sees a partition and drops records at or
//!   below the stored offset, turning broker redeliveries into no-ops.
//!
//! # Example
//!
//! ```no_run
//! use ferrobus_kafka::KafkaClient;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = KafkaClient::builder()
//!     .brokers("localhost:9092")
//!     .group_id("order-processor")
//!     .topic("order-events")
//!     .producer_acks("all")
//!     .build()?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ferrobus_core::broker::{BrokerClient, ClientStatus, RawRecord, RecordStream};
use ferrobus_core::context::ShutdownToken;
use ferrobus_core::envelope::OutboundEnvelope;
use ferrobus_core::error::{ErrorKind, PipelineError};
use ferrobus_core::headers::Headers;
use ferrobus_core::identifier::BrokerRecordId;
use ferrobus_core::offset::{OffsetKey, OffsetStore};

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers as KafkaHeaders, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer as KafkaProducer};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use tokio::sync::watch;

/// Kafka implementation of the [`BrokerClient`] contract.
///
/// Create it through [`KafkaClient::builder`]. The client is cheap to share
/// (`Arc`) between producers, consumers and the outbox worker.
pub struct KafkaClient {
    producer: FutureProducer,
    brokers: String,
    group_id: String,
    topics: Vec<String>,
    timeout: Duration,
    auto_offset_reset: String,
    buffer_size: usize,
    queue_until_connected: bool,
    transactional: bool,
    offset_store: Option<Arc<dyn OffsetStore>>,
    status_tx: watch::Sender<ClientStatus>,
    consumer: Mutex<Option<Arc<StreamConsumer>>>,
}

impl KafkaClient {
    /// Create a new builder.
    #[must_use]
    pub fn builder() -> KafkaClientBuilder {
        KafkaClientBuilder::default()
    }

    /// The configured broker addresses.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    fn transient(error: &rdkafka::error::KafkaError) -> PipelineError {
        PipelineError::classified(ErrorKind::TransientBroker, error)
    }

    fn set_status(&self, status: ClientStatus) {
        let _ = self.status_tx.send(status);
        tracing::debug!(status = status.as_str(), "kafka client status changed");
    }

    async fn produce_one(&self, envelope: &OutboundEnvelope) -> Result<BrokerRecordId, PipelineError> {
        if self.status() != ClientStatus::Initialized && !self.queue_until_connected {
            return Err(PipelineError::TransientBroker(format!(
                "client is {} and queuing until connected is disabled",
                self.status()
            )));
        }

        let headers = to_kafka_headers(&envelope.headers);
        // The message id keys the record: chunks of one sequence share it,
        // which pins them to the same partition.
        let key = envelope.headers.message_id().unwrap_or("");

        let mut record = FutureRecord::to(&envelope.endpoint.name)
            .payload(&envelope.raw_body)
            .headers(headers);
        if !key.is_empty() {
            record = record.key(key);
        }
        if let Some(partition) = envelope.endpoint.partition {
            record = record.partition(partition);
        }

        match self
            .producer
            .send(record, Timeout::After(self.timeout))
            .await
        {
            Ok((partition, offset)) => {
                tracing::debug!(
                    topic = %envelope.endpoint.name,
                    partition,
                    offset,
                    "record produced"
                );
                Ok(BrokerRecordId::TopicPartitionOffset {
                    topic: envelope.endpoint.name.clone(),
                    partition,
                    offset,
                })
            }
            Err((error, _record)) => {
                tracing::error!(
                    topic = %envelope.endpoint.name,
                    error = %error,
                    "failed to produce record"
                );
                Err(Self::transient(&error))
            }
        }
    }

    /// Run a blocking transaction operation on a clone of the producer.
    async fn transaction_op<F>(&self, op: F) -> Result<(), PipelineError>
    where
        F: FnOnce(&FutureProducer) -> Result<(), rdkafka::error::KafkaError> + Send + 'static,
    {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || op(&producer))
            .await
            .map_err(|join_error| {
                PipelineError::TransientBroker(format!(
                    "transaction task failed: {join_error}"
                ))
            })?
            .map_err(|error| Self::transient(&error))
    }
}

impl BrokerClient for KafkaClient {
    fn status(&self) -> ClientStatus {
        *self.status_tx.borrow()
    }

    fn status_watch(&self) -> watch::Receiver<ClientStatus> {
        self.status_tx.subscribe()
    }

    fn connect(&self) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + '_>> {
        Box::pin(async move {
            self.set_status(ClientStatus::Initializing);
            if self.transactional {
                let timeout = self.timeout;
                self.transaction_op(move |producer| {
                    producer.init_transactions(Timeout::After(timeout))
                })
                .await?;
            }
            self.set_status(ClientStatus::Initialized);
            tracing::info!(brokers = %self.brokers, "kafka client connected");
            Ok(())
        })
    }

    fn disconnect(&self) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + '_>> {
        Box::pin(async move {
            self.set_status(ClientStatus::Disconnecting);
            let producer = self.producer.clone();
            let timeout = self.timeout;
            let flush = tokio::task::spawn_blocking(move || {
                producer.flush(Timeout::After(timeout))
            })
            .await;

            if let Some(consumer) = self.consumer.lock().map(|mut c| c.take()).ok().flatten() {
                drop(consumer);
            }
            self.set_status(ClientStatus::Disconnected);

            match flush {
                Ok(Ok(())) => Ok(()),
                Ok(Err(error)) => Err(Self::transient(&error)),
                Err(join_error) => Err(PipelineError::TransientBroker(format!(
                    "flush task failed: {join_error}"
                ))),
            }
        })
    }

    fn produce<'a>(
        &'a self,
        envelope: &'a OutboundEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<BrokerRecordId, PipelineError>> + Send + 'a>> {
        Box::pin(self.produce_one(envelope))
    }

    fn produce_batch<'a>(
        &'a self,
        envelopes: &'a [OutboundEnvelope],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<BrokerRecordId>, PipelineError>> + Send + 'a>>
    {
        Box::pin(async move {
            if envelopes.len() <= 1 || !self.transactional {
                // Non-transactional sets are produced in order; a failure
                // leaves a partial chunk sequence for the consumer side to
                // abort and retry.
                let mut ids = Vec::with_capacity(envelopes.len());
                for envelope in envelopes {
                    ids.push(self.produce_one(envelope).await?);
                }
                return Ok(ids);
            }

            let timeout = self.timeout;
            self.transaction_op(move |producer| producer.begin_transaction())
                .await?;

            let mut ids = Vec::with_capacity(envelopes.len());
            for envelope in envelopes {
                match self.produce_one(envelope).await {
                    Ok(id) => ids.push(id),
                    Err(error) => {
                        self.transaction_op(move |producer| {
                            producer.abort_transaction(Timeout::After(timeout))
                        })
                        .await?;
                        return Err(error);
                    }
                }
            }

            self.transaction_op(move |producer| {
                producer.commit_transaction(Timeout::After(timeout))
            })
            .await?;
            Ok(ids)
        })
    }

    #[allow(clippy::too_many_lines)] // Seek-to-stored-offset bookkeeping inside the forwarding loop
    fn consume(
        &self,
        shutdown: ShutdownToken,
    ) -> Pin<Box<dyn Future<Output = Result<RecordStream, PipelineError>> + Send + '_>> {
        Box::pin(async move {
            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &self.brokers)
                .set("group.id", &self.group_id)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &self.auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|error| Self::transient(&error))?;

            let topic_refs: Vec<&str> = self.topics.iter().map(String::as_str).collect();
            consumer
                .subscribe(&topic_refs)
                .map_err(|error| Self::transient(&error))?;

            tracing::info!(
                topics = ?self.topics,
                group_id = %self.group_id,
                auto_offset_reset = %self.auto_offset_reset,
                "subscribed"
            );

            let consumer = Arc::new(consumer);
            if let Ok(mut slot) = self.consumer.lock() {
                *slot = Some(Arc::clone(&consumer));
            }

            let (tx, rx) = tokio::sync::mpsc::channel(self.buffer_size);
            let offset_store = self.offset_store.clone();
            let group_id = self.group_id.clone();
            let mut shutdown = shutdown;

            tokio::spawn(async move {
                use futures::StreamExt;

                // Stored offsets already seen per partition; consulted once
                // per partition, then used to drop already-processed
                // records.
                let mut floors: HashMap<(String, i32), Option<i64>> = HashMap::new();
                let mut stream = consumer.stream();

                loop {
                    let message = tokio::select! {
                        () = shutdown.triggered() => break,
                        message = stream.next() => message,
                    };
                    let Some(message) = message else { break };

                    let message = match message {
                        Ok(message) => message,
                        Err(error) => {
                            let transient = Self::transient(&error);
                            if tx.send(Err(transient)).await.is_err() {
                                break;
                            }
                            continue;
                        }
                    };

                    let topic = message.topic().to_string();
                    let partition = message.partition();
                    let offset = message.offset();

                    let floor = match floors.entry((topic.clone(), partition)) {
                        std::collections::hash_map::Entry::Occupied(entry) => *entry.get(),
                        std::collections::hash_map::Entry::Vacant(entry) => {
                            let stored = match &offset_store {
                                Some(store) => {
                                    let key = OffsetKey::new(
                                        group_id.clone(),
                                        topic.clone(),
                                        partition,
                                    );
                                    store.load(&key).await.unwrap_or_else(|error| {
                                        tracing::warn!(
                                            key = %key,
                                            error = %error,
                                            "failed to load stored offset, falling back to broker offsets"
                                        );
                                        None
                                    })
                                }
                                None => None,
                            };
                            if let Some(stored) = stored {
                                if stored >= offset {
                                    // Stored offsets override the broker's
                                    // committed offsets.
                                    if let Err(error) = consumer.seek(
                                        &topic,
                                        partition,
                                        Offset::Offset(stored + 1),
                                        Timeout::After(Duration::from_secs(5)),
                                    ) {
                                        tracing::warn!(
                                            topic = %topic,
                                            partition,
                                            stored,
                                            error = %error,
                                            "seek to stored offset failed"
                                        );
                                    } else {
                                        tracing::info!(
                                            topic = %topic,
                                            partition,
                                            stored,
                                            "seeking past stored offset"
                                        );
                                    }
                                }
                            }
                            *entry.insert(stored)
                        }
                    };

                    if floor.is_some_and(|floor| offset <= floor) {
                        tracing::debug!(
                            topic = %topic,
                            partition,
                            offset,
                            "dropping already-processed record"
                        );
                        continue;
                    }

                    let record = RawRecord {
                        endpoint_name: topic.clone(),
                        body: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                        headers: from_kafka_headers(message.headers()),
                        record_id: BrokerRecordId::TopicPartitionOffset {
                            topic,
                            partition,
                            offset,
                        },
                    };

                    if tx.send(Ok(record)).await.is_err() {
                        tracing::debug!("record receiver dropped, exiting consume task");
                        break;
                    }
                }

                tracing::debug!("consume task exiting");
            });

            let stream = async_stream::stream! {
                let mut rx = rx;
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };
            Ok(Box::pin(stream) as RecordStream)
        })
    }

    fn commit<'a>(
        &'a self,
        ids: &'a [BrokerRecordId],
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            let Some(consumer) = self.consumer.lock().map(|c| c.clone()).ok().flatten() else {
                return Err(PipelineError::TransientBroker(
                    "commit without an active consumer".into(),
                ));
            };

            let mut list = TopicPartitionList::new();
            for ((topic, partition), offset) in aggregate_commits(ids) {
                // Kafka commits the *next* offset to read.
                list.add_partition_offset(&topic, partition, Offset::Offset(offset + 1))
                    .map_err(|error| Self::transient(&error))?;
            }
            if list.count() == 0 {
                return Ok(());
            }

            consumer
                .commit(&list, rdkafka::consumer::CommitMode::Async)
                .map_err(|error| Self::transient(&error))
        })
    }
}

/// Aggregate identifiers into the highest offset per (topic, partition).
fn aggregate_commits(ids: &[BrokerRecordId]) -> HashMap<(String, i32), i64> {
    let mut commits: HashMap<(String, i32), i64> = HashMap::new();
    for id in ids {
        if let BrokerRecordId::TopicPartitionOffset {
            topic,
            partition,
            offset,
        } = id
        {
            commits
                .entry((topic.clone(), *partition))
                .and_modify(|max| *max = (*max).max(*offset))
                .or_insert(*offset);
        }
    }
    commits
}

/// Map Ferrobus headers onto Kafka record headers, preserving duplicates and
/// order.
fn to_kafka_headers(headers: &Headers) -> OwnedHeaders {
    let mut kafka_headers = OwnedHeaders::new_with_capacity(headers.len());
    for header in headers {
        kafka_headers = kafka_headers.insert(Header {
            key: &header.name,
            value: Some(header.value.as_bytes()),
        });
    }
    kafka_headers
}

/// Map Kafka record headers back onto Ferrobus headers. Values that are not
/// UTF-8 are dropped with a warning; the reserved headers are all textual.
fn from_kafka_headers(kafka_headers: Option<&rdkafka::message::BorrowedHeaders>) -> Headers {
    let mut headers = Headers::new();
    let Some(kafka_headers) = kafka_headers else {
        return headers;
    };
    for header in kafka_headers.iter() {
        let Some(value) = header.value else { continue };
        match std::str::from_utf8(value) {
            Ok(value) => headers.insert(header.key, value),
            Err(_) => {
                tracing::warn!(header = header.key, "dropping non-utf8 header value");
            }
        }
    }
    headers
}

/// Builder for [`KafkaClient`].
///
/// # Example
///
/// ```no_run
/// use ferrobus_kafka::KafkaClient;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = KafkaClient::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .group_id("order-processor")
///     .topic("order-events")
///     .producer_acks("all")
///     .compression("lz4")
///     .timeout(Duration::from_secs(10))
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct KafkaClientBuilder {
    brokers: Option<String>,
    group_id: Option<String>,
    topics: Vec<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    auto_offset_reset: Option<String>,
    buffer_size: Option<usize>,
    queue_until_connected: bool,
    transactional_id: Option<String>,
    offset_store: Option<Arc<dyn OffsetStore>>,
}

impl KafkaClientBuilder {
    /// Set the broker addresses (comma-separated).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the consumer group id.
    #[must_use]
    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    /// Add a topic to consume from.
    #[must_use]
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topics.push(topic.into());
        self
    }

    /// Set the producer acknowledgment mode: "0", "1" or "all".
    ///
    /// Default: "1".
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the compression codec: "none", "gzip", "snappy", "lz4", "zstd".
    ///
    /// Default: "none".
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set the produce/flush timeout.
    ///
    /// Default: 5 seconds.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Where new consumer groups start reading: "earliest", "latest" or
    /// "error".
    ///
    /// Default: "latest".
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Set the record buffer between the Kafka consumer and the pipeline.
    ///
    /// Default: 1000.
    ///
    /// # Panics
    ///
    /// Panics if `buffer_size` is 0.
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        assert!(buffer_size > 0, "buffer_size must be greater than 0");
        self.buffer_size = Some(buffer_size);
        self
    }

    /// Queue produces while the client is not connected instead of failing
    /// fast.
    #[must_use]
    pub const fn queue_until_connected(mut self) -> Self {
        self.queue_until_connected = true;
        self
    }

    /// Use a transactional producer; multi-envelope sets (chunk sequences)
    /// are then produced atomically.
    #[must_use]
    pub fn transactional_id(mut self, id: impl Into<String>) -> Self {
        self.transactional_id = Some(id.into());
        self
    }

    /// Override the broker's committed offsets with a client-side offset
    /// store on start.
    #[must_use]
    pub fn offset_store(mut self, store: Arc<dyn OffsetStore>) -> Self {
        self.offset_store = Some(store);
        self
    }

    /// Build the [`KafkaClient`].
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Configuration`] when required settings are
    /// missing or the producer cannot be created.
    pub fn build(self) -> Result<KafkaClient, PipelineError> {
        let brokers = self
            .brokers
            .ok_or_else(|| PipelineError::Configuration("brokers not configured".into()))?;
        let group_id = self
            .group_id
            .ok_or_else(|| PipelineError::Configuration("group id not configured".into()))?;

        let mut producer_config = ClientConfig::new();
        producer_config
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", self.producer_acks.as_deref().unwrap_or("1"))
            .set(
                "compression.type",
                self.compression.as_deref().unwrap_or("none"),
            );
        if let Some(transactional_id) = &self.transactional_id {
            producer_config
                .set("transactional.id", transactional_id)
                .set("enable.idempotence", "true");
        }

        let producer: FutureProducer = producer_config.create().map_err(|error| {
            PipelineError::Configuration(format!("failed to create producer: {error}"))
        })?;

        tracing::info!(
            brokers = %brokers,
            group_id = %group_id,
            topics = ?self.topics,
            acks = self.producer_acks.as_deref().unwrap_or("1"),
            transactional = self.transactional_id.is_some(),
            "kafka client created"
        );

        Ok(KafkaClient {
            producer,
            brokers,
            group_id,
            topics: self.topics,
            timeout: self.timeout.unwrap_or(Duration::from_secs(5)),
            auto_offset_reset: self
                .auto_offset_reset
                .unwrap_or_else(|| "latest".to_string()),
            buffer_size: self.buffer_size.unwrap_or(1000),
            queue_until_connected: self.queue_until_connected,
            transactional: self.transactional_id.is_some(),
            offset_store: self.offset_store,
            status_tx: watch::channel(ClientStatus::Disconnected).0,
            consumer: Mutex::new(None),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    #[test]
    fn kafka_client_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<KafkaClient>();
        assert_sync::<KafkaClient>();
    }

    #[test]
    fn builder_requires_brokers_and_group() {
        assert!(KafkaClient::builder().build().is_err());
        assert!(KafkaClient::builder().brokers("localhost:9092").build().is_err());
    }

    #[test]
    fn aggregate_commits_keeps_highest_offset_per_partition() {
        let ids = vec![
            BrokerRecordId::TopicPartitionOffset {
                topic: "t".into(),
                partition: 0,
                offset: 3,
            },
            BrokerRecordId::TopicPartitionOffset {
                topic: "t".into(),
                partition: 0,
                offset: 5,
            },
            BrokerRecordId::TopicPartitionOffset {
                topic: "t".into(),
                partition: 1,
                offset: 1,
            },
            BrokerRecordId::MessageId {
                endpoint: "q".into(),
                id: "ignored".into(),
            },
        ];

        let commits = aggregate_commits(&ids);
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[&("t".to_string(), 0)], 5);
        assert_eq!(commits[&("t".to_string(), 1)], 1);
    }

    #[test]
    fn header_mapping_roundtrip() {
        let mut headers = Headers::new();
        headers.insert("x-message-id", "m-1");
        headers.insert("x-custom", "a");
        headers.insert("x-custom", "b");

        let kafka_headers = to_kafka_headers(&headers);
        assert_eq!(kafka_headers.count(), 3);
    }
}
