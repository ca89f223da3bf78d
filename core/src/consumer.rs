//! The consumer pipeline: demultiplex, reassemble, decrypt, deserialize,
//! dispatch, commit.
//!
//! A [`Consumer`] owns a broker client subscription and fans the record
//! stream out into one task per partition group key. Within a partition,
//! records are processed strictly in consume order: at most one unit is in
//! flight unless the endpoint enables batching or parallel dispatch, and
//! commit order always equals consume order.
//!
//! Pipeline stages per record:
//!
//! 1. trace-context extraction
//! 2. log enrichment (endpoint, identifier fields on every record)
//! 3. duplicate suppression by `x-message-id`
//! 4. chunk sequence reassembly (commit suspended until the sequence ends)
//! 5. decryption
//! 6. deserialization
//! 7. batch grouping (N envelopes or the window elapsing, whichever first)
//! 8. dispatch to the in-process bus
//! 9. error-policy gate
//! 10. broker commit + offset-store advance
//!
//! Back-pressure: each partition channel is bounded, so a slow partition
//! pauses the demultiplexer (and with it the broker fetch) once the channel
//! fills.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, watch};

use crate::broker::{BrokerClient, RawRecord};
use crate::context::{PipelineContext, ShutdownToken, TraceContext};
use crate::encryption::decrypt_body;
use crate::endpoint::{Endpoint, EndpointConfig};
use crate::envelope::{InboundEnvelope, OutboundEnvelope};
use crate::error::PipelineError;
use crate::error_policy::{ErrorDecision, MoveTransform};
use crate::headers::names;
use crate::identifier::BrokerRecordId;
use crate::message::MessageSerializer;
use crate::offset::{OffsetKey, OffsetStore};
use crate::sequence::{
    AbortReason, BatchSequence, ChunkOutcome, SequenceHandle, SequenceStore,
};

/// Dispatch target of the consumer pipeline; the contract to the in-process
/// message bus.
pub trait InboundDispatcher: Send + Sync {
    /// Dispatch one envelope to its subscribers. The returned future
    /// represents the subscriber's work.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Processing`] when a subscriber fails.
    fn dispatch<'a>(
        &'a self,
        envelope: &'a InboundEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>>;

    /// Dispatch a batch as one unit. The default forwards the elements one
    /// by one; ordering of dispatch within a batch is unspecified for
    /// implementations that override this with parallel fan-out.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Processing`] when a subscriber fails.
    fn dispatch_batch<'a>(
        &'a self,
        envelopes: &'a [InboundEnvelope],
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            for envelope in envelopes {
                self.dispatch(envelope).await?;
            }
            Ok(())
        })
    }
}

/// Lifecycle of a consumer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsumerStatus {
    /// Not started yet.
    Idle,
    /// Consuming.
    Running,
    /// Stopped; carries the reason.
    Stopped(String),
}

/// Tuning knobs of a consumer.
#[derive(Clone, Debug)]
pub struct ConsumerConfig {
    /// Capacity of each partition channel; bounds in-flight records per
    /// partition and provides back-pressure towards the broker fetch.
    pub in_flight_limit: usize,
    /// How long graceful shutdown waits for in-flight units before aborting
    /// them with [`AbortReason::ConsumerAborted`].
    pub drain_timeout: Duration,
    /// Number of recently processed `x-message-id`s remembered per partition
    /// for duplicate suppression.
    pub dedup_window: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            in_flight_limit: 16,
            drain_timeout: Duration::from_secs(30),
            dedup_window: 1024,
        }
    }
}

/// Ring of recently seen message ids, bounded in memory.
struct DedupRing {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
}

impl DedupRing {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    fn record(&mut self, id: String) {
        if self.capacity == 0 || !self.seen.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
    }
}

/// A consumer bound to one broker client and a set of endpoint
/// configurations.
pub struct Consumer {
    client: Arc<dyn BrokerClient>,
    dispatcher: Arc<dyn InboundDispatcher>,
    endpoints: HashMap<String, Arc<EndpointConfig>>,
    offset_store: Option<Arc<dyn OffsetStore>>,
    group_id: String,
    config: ConsumerConfig,
    status_tx: watch::Sender<ConsumerStatus>,
}

impl Consumer {
    /// Create a consumer.
    #[must_use]
    pub fn new(
        client: Arc<dyn BrokerClient>,
        group_id: impl Into<String>,
        dispatcher: Arc<dyn InboundDispatcher>,
    ) -> Self {
        Self {
            client,
            dispatcher,
            endpoints: HashMap::new(),
            offset_store: None,
            group_id: group_id.into(),
            config: ConsumerConfig::default(),
            status_tx: watch::channel(ConsumerStatus::Idle).0,
        }
    }

    /// Register the configuration for records consumed from
    /// `endpoint_name`.
    #[must_use]
    pub fn endpoint(
        mut self,
        endpoint_name: impl Into<String>,
        config: Arc<EndpointConfig>,
    ) -> Self {
        self.endpoints.insert(endpoint_name.into(), config);
        self
    }

    /// Advance a client-side offset store alongside broker commits.
    #[must_use]
    pub fn offset_store(mut self, store: Arc<dyn OffsetStore>) -> Self {
        self.offset_store = Some(store);
        self
    }

    /// Override the tuning knobs.
    #[must_use]
    pub fn config(mut self, config: ConsumerConfig) -> Self {
        self.config = config;
        self
    }

    /// Observe the consumer lifecycle; a stop carries its reason.
    #[must_use]
    pub fn status_watch(&self) -> watch::Receiver<ConsumerStatus> {
        self.status_tx.subscribe()
    }

    /// Run the consume loop until `shutdown` triggers, the stream ends, or
    /// an unrecoverable failure stops the consumer.
    ///
    /// # Errors
    ///
    /// Returns the failure that stopped the consumer; the same reason is
    /// published on the status watch.
    pub async fn run(&self, mut shutdown: ShutdownToken) -> Result<(), PipelineError> {
        let mut stream = match self.client.consume(shutdown.clone()).await {
            Ok(stream) => stream,
            Err(error) => {
                self.stop_with(&error);
                return Err(error);
            }
        };
        let _ = self.status_tx.send(ConsumerStatus::Running);
        tracing::info!(group_id = %self.group_id, "consumer started");

        let endpoints = Arc::new(self.endpoints.clone());
        let mut partitions: HashMap<String, mpsc::Sender<RawRecord>> = HashMap::new();
        let mut workers: Vec<(String, tokio::task::JoinHandle<Result<(), PipelineError>>)> =
            Vec::new();
        let mut stop_error: Option<PipelineError> = None;
        // Workers announce fatal failures here so the fetch loop stops
        // promptly instead of discovering the dead channel on the next send.
        let (failure_tx, mut failure_rx) = mpsc::unbounded_channel::<PipelineError>();

        loop {
            let next = tokio::select! {
                () = shutdown.triggered() => break,
                failure = failure_rx.recv() => {
                    stop_error = failure;
                    break;
                }
                next = stream.next() => next,
            };

            let record = match next {
                None => break,
                Some(Ok(record)) => record,
                Some(Err(error)) => {
                    // Transport hiccups surface per record; the stream
                    // itself ends when the connection is gone for good.
                    tracing::error!(
                        group_id = %self.group_id,
                        error_kind = error.kind().as_str(),
                        error = %error,
                        "failed to receive record"
                    );
                    continue;
                }
            };

            let key = record.record_id.group_key();
            if !partitions.contains_key(&key) {
                let (tx, rx) = mpsc::channel(self.config.in_flight_limit);
                let worker = PartitionWorker {
                    partition_key: key.clone(),
                    rx,
                    client: Arc::clone(&self.client),
                    dispatcher: Arc::clone(&self.dispatcher),
                    endpoints: Arc::clone(&endpoints),
                    offset_store: self.offset_store.clone(),
                    group_id: self.group_id.clone(),
                    dedup: DedupRing::new(self.config.dedup_window),
                    sequences: SequenceStore::new(),
                    batch: None,
                    batch_config: None,
                    batch_handles: Vec::new(),
                    ready: Vec::new(),
                };
                tracing::debug!(partition = %key, "starting partition worker");
                let failure_tx = failure_tx.clone();
                workers.push((
                    key.clone(),
                    tokio::spawn(async move {
                        let result = worker.run().await;
                        if let Err(error) = &result {
                            let _ = failure_tx.send(error.clone());
                        }
                        result
                    }),
                ));
                partitions.insert(key.clone(), tx);
            }

            // A closed channel means the worker stopped with an error; stop
            // consuming and surface it from the join below.
            let worker_alive = match partitions.get(&key) {
                Some(sender) => sender.send(record).await.is_ok(),
                None => false,
            };
            if !worker_alive {
                break;
            }
        }

        // Graceful drain: close the channels and give workers until the
        // drain timeout to finish their in-flight units.
        drop(partitions);
        for (key, handle) in workers {
            match tokio::time::timeout(self.config.drain_timeout, handle).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(error))) => {
                    tracing::error!(
                        partition = %key,
                        error_kind = error.kind().as_str(),
                        error = %error,
                        "partition worker stopped with error"
                    );
                    stop_error.get_or_insert(error);
                }
                Ok(Err(join_error)) => {
                    stop_error.get_or_insert(PipelineError::Processing(format!(
                        "partition worker panicked: {join_error}"
                    )));
                }
                Err(_elapsed) => {
                    tracing::warn!(
                        partition = %key,
                        "partition worker did not drain in time, aborting"
                    );
                }
            }
        }

        match stop_error {
            Some(error) => {
                self.stop_with(&error);
                Err(error)
            }
            None => {
                let _ = self
                    .status_tx
                    .send(ConsumerStatus::Stopped("shutdown".into()));
                tracing::info!(group_id = %self.group_id, "consumer stopped");
                Ok(())
            }
        }
    }

    fn stop_with(&self, error: &PipelineError) {
        let _ = self
            .status_tx
            .send(ConsumerStatus::Stopped(error.to_string()));
    }
}

/// A unit ready for processing: a plain record or a reassembled sequence.
struct ReadyUnit {
    raw: InboundEnvelope,
    records: Vec<BrokerRecordId>,
    handle: Option<SequenceHandle>,
}

/// What the worker should do next.
enum Feed {
    Record(RawRecord),
    BatchExpired,
    Closed,
}

/// What the policy gate decided about a unit.
enum PolicyOutcome {
    /// The unit was processed; commit and remember its id.
    Succeeded,
    /// The unit was skipped or moved; commit without further dispatch.
    Discarded,
}

/// The single-threaded processor owning one partition.
///
/// Owns the partition's sequence store, duplicate-suppression ring and open
/// batch; nothing else touches them (single-writer contract).
struct PartitionWorker {
    partition_key: String,
    rx: mpsc::Receiver<RawRecord>,
    client: Arc<dyn BrokerClient>,
    dispatcher: Arc<dyn InboundDispatcher>,
    endpoints: Arc<HashMap<String, Arc<EndpointConfig>>>,
    offset_store: Option<Arc<dyn OffsetStore>>,
    group_id: String,
    dedup: DedupRing,
    sequences: SequenceStore,
    batch: Option<BatchSequence>,
    batch_config: Option<Arc<EndpointConfig>>,
    batch_handles: Vec<SequenceHandle>,
    ready: Vec<ReadyUnit>,
}

impl PartitionWorker {
    async fn run(mut self) -> Result<(), PipelineError> {
        loop {
            match self.next_feed().await? {
                Feed::Record(record) => self.handle_record(record).await?,
                Feed::BatchExpired => self.flush_batch().await?,
                Feed::Closed => {
                    self.drain().await?;
                    return Ok(());
                }
            }
        }
    }

    /// Wait for the next thing to do: a record, the open batch window
    /// expiring, or the channel closing. Pending parallel units are flushed
    /// before blocking so their latency stays bounded.
    async fn next_feed(&mut self) -> Result<Feed, PipelineError> {
        if !self.ready.is_empty() {
            match self.rx.try_recv() {
                Ok(record) => return Ok(Feed::Record(record)),
                Err(mpsc::error::TryRecvError::Empty) => self.flush_parallel().await?,
                Err(mpsc::error::TryRecvError::Disconnected) => return Ok(Feed::Closed),
            }
        }

        let deadline = self.batch.as_ref().map(BatchSequence::deadline);
        let feed = match deadline {
            Some(deadline) => tokio::select! {
                record = self.rx.recv() => record.map_or(Feed::Closed, Feed::Record),
                () = tokio::time::sleep_until(deadline) => Feed::BatchExpired,
            },
            None => self.rx.recv().await.map_or(Feed::Closed, Feed::Record),
        };
        Ok(feed)
    }

    fn config_for(&self, endpoint_name: &str) -> Result<Arc<EndpointConfig>, PipelineError> {
        self.endpoints.get(endpoint_name).cloned().ok_or_else(|| {
            PipelineError::Configuration(format!(
                "no endpoint configuration registered for '{endpoint_name}'"
            ))
        })
    }

    async fn handle_record(&mut self, record: RawRecord) -> Result<(), PipelineError> {
        let config = self.config_for(&record.endpoint_name)?;

        let endpoint = Endpoint {
            name: record.endpoint_name,
            partition: record.record_id.partition(),
        };
        let envelope =
            InboundEnvelope::new(record.body, record.headers, endpoint, record.record_id);

        tracing::debug!(
            endpoint = %envelope.endpoint.display_name(),
            identifier = %envelope.record_id.log_form(),
            message_type = envelope.headers.message_type().unwrap_or(""),
            "record received"
        );

        // Duplicate suppression: a message id that was already fully
        // processed is committed without dispatch (outbox retries, broker
        // redeliveries). Chunks are exempt; their id is the sequence id.
        if !envelope.is_chunk() {
            if let Some(id) = envelope.message_id() {
                if self.dedup.contains(id) {
                    tracing::debug!(
                        identifier = %envelope.record_id.log_form(),
                        message_id = id,
                        "skipping duplicate message"
                    );
                    let records = vec![envelope.record_id];
                    return self.commit(&records).await;
                }
            }
        }

        let unit = if envelope.is_chunk() {
            match self.feed_chunk(envelope).await? {
                Some(unit) => unit,
                None => return Ok(()),
            }
        } else {
            ReadyUnit {
                records: vec![envelope.record_id.clone()],
                raw: envelope,
                handle: None,
            }
        };

        // A reassembled sequence may itself be a duplicate.
        if let Some(id) = unit.raw.message_id() {
            if self.dedup.contains(id) {
                tracing::debug!(message_id = id, "skipping duplicate reassembled message");
                if let Some(handle) = &unit.handle {
                    handle.mark_processed();
                }
                return self.commit(&unit.records).await;
            }
        }

        self.process_or_enqueue(unit, config).await
    }

    /// Feed a chunk into the partition's sequence store, committing records
    /// of sequences that were preempted by a new first chunk.
    async fn feed_chunk(
        &mut self,
        envelope: InboundEnvelope,
    ) -> Result<Option<ReadyUnit>, PipelineError> {
        let endpoint = envelope.endpoint.clone();
        let feed = match self.sequences.add_chunk(envelope) {
            Ok(feed) => feed,
            Err(error) => {
                tracing::error!(
                    endpoint = %endpoint.display_name(),
                    error_kind = error.kind().as_str(),
                    error = %error,
                    "sequence error"
                );
                return Err(error);
            }
        };

        for aborted in feed.preempted {
            // An incomplete sequence cannot complete anymore within this
            // partition; committing past it avoids an endless redelivery
            // loop while the log records what was dropped.
            tracing::warn!(
                sequence_id = %aborted.id,
                reason = aborted.reason.as_str(),
                dropped_chunks = aborted.records.len(),
                "incomplete sequence aborted"
            );
            self.commit(&aborted.records).await?;
        }

        match feed.outcome {
            ChunkOutcome::Buffered => Ok(None),
            ChunkOutcome::Completed(assembled) => {
                let record_id = assembled.records.last().cloned().unwrap_or_else(|| {
                    BrokerRecordId::MessageId {
                        endpoint: assembled.endpoint.name.clone(),
                        id: assembled.sequence_id.clone(),
                    }
                });
                Ok(Some(ReadyUnit {
                    raw: InboundEnvelope {
                        raw_body: assembled.body,
                        message: None,
                        headers: assembled.headers,
                        endpoint: assembled.endpoint,
                        record_id,
                    },
                    records: assembled.records,
                    handle: Some(assembled.handle),
                }))
            }
        }
    }

    async fn process_or_enqueue(
        &mut self,
        unit: ReadyUnit,
        config: Arc<EndpointConfig>,
    ) -> Result<(), PipelineError> {
        if config.batch.is_some() {
            return self.enqueue_into_batch(unit, &config).await;
        }

        if config.parallel_degree > 1 {
            self.ready.push(unit);
            if self.ready.len() >= config.parallel_degree {
                self.flush_parallel().await?;
            }
            return Ok(());
        }

        self.process_unit(unit, &config).await
    }

    /// Decrypt and deserialize under the error policy, then add the decoded
    /// envelope to the open batch; dispatch when the batch fills.
    async fn enqueue_into_batch(
        &mut self,
        mut unit: ReadyUnit,
        config: &Arc<EndpointConfig>,
    ) -> Result<(), PipelineError> {
        let decoded = loop {
            match self.decode(&unit.raw, config) {
                Ok(decoded) => break decoded,
                Err(error) => {
                    match self.consult_policy(&mut unit.raw, config, &error).await? {
                        PolicyStep::RetryNow => {}
                        PolicyStep::Skip => {
                            if let Some(handle) = &unit.handle {
                                handle.abort(AbortReason::Error);
                            }
                            return self.commit(&unit.records).await;
                        }
                        PolicyStep::Move {
                            endpoint,
                            transform,
                        } => {
                            self.move_envelope(&unit.raw, endpoint, transform.as_deref(), &error)
                                .await?;
                            if let Some(handle) = &unit.handle {
                                handle.abort(AbortReason::Error);
                            }
                            return self.commit(&unit.records).await;
                        }
                    }
                }
            }
        };

        // Settings presence was checked by the caller.
        let Some(settings) = config.batch else {
            return Err(PipelineError::Configuration(
                "batch enqueue without batch settings".into(),
            ));
        };
        let batch = self
            .batch
            .get_or_insert_with(|| BatchSequence::new(settings));
        self.batch_config.get_or_insert_with(|| Arc::clone(config));
        let full = batch.push(decoded, unit.records);
        if let Some(handle) = unit.handle {
            self.batch_handles.push(handle);
        }

        if full {
            return self.flush_batch().await;
        }
        Ok(())
    }

    /// Dispatch the open batch as one unit under the error policy and commit
    /// all its records together.
    async fn flush_batch(&mut self) -> Result<(), PipelineError> {
        let Some(batch) = self.batch.take() else {
            return Ok(());
        };
        let Some(config) = self.batch_config.take() else {
            return Ok(());
        };
        let handles = std::mem::take(&mut self.batch_handles);
        if batch.is_empty() {
            batch.abort(AbortReason::EnumerationAborted);
            return Ok(());
        }
        let mut unit = batch.take();

        tracing::debug!(
            batch_id = %unit.id,
            batch_size = unit.items.len(),
            "dispatching batch"
        );

        let outcome = loop {
            match self.dispatcher.dispatch_batch(&unit.items).await {
                Ok(()) => break PolicyOutcome::Succeeded,
                Err(error) => {
                    // The policy sees the batch through its first element;
                    // the decision applies to the batch as a whole.
                    let mut probe = unit.items[0].clone();
                    match self.consult_policy(&mut probe, &config, &error).await? {
                        PolicyStep::RetryNow => {
                            let attempts = probe.headers.failed_attempts();
                            for item in &mut unit.items {
                                item.headers
                                    .set(names::FAILED_ATTEMPTS, attempts.to_string());
                            }
                        }
                        PolicyStep::Skip => break PolicyOutcome::Discarded,
                        PolicyStep::Move {
                            endpoint,
                            transform,
                        } => {
                            let attempts = probe.headers.failed_attempts();
                            for item in &mut unit.items {
                                item.headers
                                    .set(names::FAILED_ATTEMPTS, attempts.to_string());
                                self.move_envelope(
                                    item,
                                    endpoint.clone(),
                                    transform.as_deref(),
                                    &error,
                                )
                                .await?;
                            }
                            break PolicyOutcome::Discarded;
                        }
                    }
                }
            }
        };

        match outcome {
            PolicyOutcome::Succeeded => {
                unit.handle.mark_processed();
                for handle in &handles {
                    handle.mark_processed();
                }
                for item in &unit.items {
                    if let Some(id) = item.message_id() {
                        self.dedup.record(id.to_string());
                    }
                }
            }
            PolicyOutcome::Discarded => {
                unit.handle.abort(AbortReason::Error);
                for handle in &handles {
                    handle.abort(AbortReason::Error);
                }
            }
        }
        self.commit(&unit.records).await
    }

    /// First attempts of buffered units run concurrently; dispatch order is
    /// explicitly undefined in this mode. Failures fall back to the
    /// sequential policy loop, and commits happen in consume order.
    async fn flush_parallel(&mut self) -> Result<(), PipelineError> {
        let units = std::mem::take(&mut self.ready);
        if units.is_empty() {
            return Ok(());
        }

        let attempts = {
            let this: &Self = &*self;
            futures::future::join_all(units.iter().map(|unit| async move {
                let config = this.config_for(unit.raw.endpoint.name.as_str())?;
                this.attempt(&unit.raw, &config).await
            }))
            .await
        };

        for (mut unit, attempt) in units.into_iter().zip(attempts) {
            match attempt {
                Ok(()) => self.finish_unit(&unit).await?,
                Err(first_error) => {
                    let config = self.config_for(unit.raw.endpoint.name.as_str())?;
                    let outcome = self
                        .policy_loop(&mut unit.raw, &config, first_error)
                        .await?;
                    match outcome {
                        PolicyOutcome::Succeeded => self.finish_unit(&unit).await?,
                        PolicyOutcome::Discarded => {
                            if let Some(handle) = &unit.handle {
                                handle.abort(AbortReason::Error);
                            }
                            self.commit(&unit.records).await?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Process a unit through decrypt, deserialize and dispatch under the
    /// error policy.
    async fn process_unit(
        &mut self,
        mut unit: ReadyUnit,
        config: &Arc<EndpointConfig>,
    ) -> Result<(), PipelineError> {
        let outcome = match self.attempt(&unit.raw, config).await {
            Ok(()) => PolicyOutcome::Succeeded,
            Err(error) => self.policy_loop(&mut unit.raw, config, error).await?,
        };

        match outcome {
            PolicyOutcome::Succeeded => self.finish_unit(&unit).await,
            PolicyOutcome::Discarded => {
                if let Some(handle) = &unit.handle {
                    handle.abort(AbortReason::Error);
                }
                self.commit(&unit.records).await
            }
        }
    }

    async fn finish_unit(&mut self, unit: &ReadyUnit) -> Result<(), PipelineError> {
        if let Some(handle) = &unit.handle {
            handle.mark_processed();
        }
        if let Some(id) = unit.raw.message_id() {
            self.dedup.record(id.to_string());
        }
        self.commit(&unit.records).await
    }

    /// One pipeline attempt: decrypt, deserialize, dispatch.
    async fn attempt(
        &self,
        envelope: &InboundEnvelope,
        config: &Arc<EndpointConfig>,
    ) -> Result<(), PipelineError> {
        let decoded = self.decode(envelope, config)?;
        self.dispatcher.dispatch(&decoded).await
    }

    /// Decrypt and deserialize an envelope; the trace context travels into
    /// the per-unit pipeline context.
    fn decode(
        &self,
        envelope: &InboundEnvelope,
        config: &Arc<EndpointConfig>,
    ) -> Result<InboundEnvelope, PipelineError> {
        let mut decoded = envelope.clone();

        let mut ctx = PipelineContext::detached();
        if let Some(trace) = TraceContext::from_headers(&decoded.headers) {
            ctx.bag.insert(trace);
        }

        if let Some(settings) = &config.encryption {
            decoded.raw_body = decrypt_body(&decoded.raw_body, settings)?;
        }

        decoded.message = Some(config.serializer.deserialize(
            &decoded.raw_body,
            &decoded.headers,
            config.message_type.as_deref(),
        )?);
        Ok(decoded)
    }

    /// Run the sequential retry loop for a unit whose first attempt failed.
    async fn policy_loop(
        &self,
        envelope: &mut InboundEnvelope,
        config: &Arc<EndpointConfig>,
        mut error: PipelineError,
    ) -> Result<PolicyOutcome, PipelineError> {
        loop {
            match self.consult_policy(envelope, config, &error).await? {
                PolicyStep::Skip => return Ok(PolicyOutcome::Discarded),
                PolicyStep::Move {
                    endpoint,
                    transform,
                } => {
                    self.move_envelope(envelope, endpoint, transform.as_deref(), &error)
                        .await?;
                    return Ok(PolicyOutcome::Discarded);
                }
                PolicyStep::RetryNow => match self.attempt(envelope, config).await {
                    Ok(()) => return Ok(PolicyOutcome::Succeeded),
                    Err(next_error) => error = next_error,
                },
            }
        }
    }

    /// Log the failure, evaluate the policy once, and prepare the decision:
    /// stop propagates the error, retry stamps the failed-attempts header
    /// and sleeps out the backoff, skip and move are returned for the caller
    /// to apply to its whole unit.
    async fn consult_policy(
        &self,
        envelope: &mut InboundEnvelope,
        config: &Arc<EndpointConfig>,
        error: &PipelineError,
    ) -> Result<PolicyStep, PipelineError> {
        let failed_attempts = envelope.headers.failed_attempts() + 1;
        self.log_failure(envelope, failed_attempts, error);

        match config.error_policy.evaluate(failed_attempts, error) {
            ErrorDecision::Retry { delay } => {
                envelope
                    .headers
                    .set(names::FAILED_ATTEMPTS, failed_attempts.to_string());
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                Ok(PolicyStep::RetryNow)
            }
            ErrorDecision::Skip => {
                tracing::warn!(
                    endpoint = %envelope.endpoint.display_name(),
                    identifier = %envelope.record_id.log_form(),
                    failed_attempts,
                    "message skipped by error policy"
                );
                Ok(PolicyStep::Skip)
            }
            ErrorDecision::Move {
                endpoint,
                transform,
            } => {
                envelope
                    .headers
                    .set(names::FAILED_ATTEMPTS, failed_attempts.to_string());
                Ok(PolicyStep::Move {
                    endpoint,
                    transform,
                })
            }
            ErrorDecision::Stop => Err(error.clone()),
        }
    }

    /// The single log record every failure produces.
    fn log_failure(
        &self,
        envelope: &InboundEnvelope,
        failed_attempts: u32,
        error: &PipelineError,
    ) {
        tracing::error!(
            endpoint = %envelope.endpoint.display_name(),
            identifier = %envelope.record_id.log_form(),
            message_type = envelope.headers.message_type().unwrap_or(""),
            failed_attempts,
            error_kind = error.kind().as_str(),
            error = %error,
            "message processing failed"
        );
    }

    /// Re-produce a failed envelope to another endpoint, with the failure
    /// count stamped and an optional transformation applied.
    async fn move_envelope(
        &self,
        envelope: &InboundEnvelope,
        target: Endpoint,
        transform: Option<&dyn MoveTransform>,
        error: &PipelineError,
    ) -> Result<(), PipelineError> {
        let mut body = envelope.raw_body.clone();
        let mut headers = envelope.headers.clone();
        if let Some(transform) = transform {
            transform.transform(&mut body, &mut headers, error);
        }

        tracing::warn!(
            identifier = %envelope.record_id.log_form(),
            target = %target.display_name(),
            "moving failed message"
        );
        let outbound = OutboundEnvelope::from_raw(body, headers, target);
        self.client.produce(&outbound).await?;
        Ok(())
    }

    /// Commit identifiers at the broker and advance the offset store.
    async fn commit(&self, records: &[BrokerRecordId]) -> Result<(), PipelineError> {
        if records.is_empty() {
            return Ok(());
        }
        self.client.commit(records).await?;

        if let Some(store) = &self.offset_store {
            for record in records {
                if let (Some(partition), Some(offset)) = (record.partition(), record.offset()) {
                    let key =
                        OffsetKey::new(self.group_id.clone(), record.endpoint_name(), partition);
                    store.store(&key, offset).await?;
                }
            }
        }
        Ok(())
    }

    /// Channel closed: finish what can be finished, abort the rest.
    async fn drain(&mut self) -> Result<(), PipelineError> {
        self.flush_parallel().await?;

        for aborted in self.sequences.abort_all(AbortReason::ConsumerAborted) {
            // Not committed: the chunks are redelivered after a restart.
            tracing::info!(
                sequence_id = %aborted.id,
                dropped_chunks = aborted.records.len(),
                "incomplete sequence aborted on shutdown"
            );
        }

        if let Some(batch) = self.batch.take() {
            let dropped = batch.abort(AbortReason::ConsumerAborted);
            for handle in self.batch_handles.drain(..) {
                handle.abort(AbortReason::ConsumerAborted);
            }
            // Not committed: the batch elements are redelivered.
            tracing::info!(dropped = dropped.len(), "open batch aborted on shutdown");
        }
        self.batch_config = None;
        tracing::debug!(partition = %self.partition_key, "partition worker drained");
        Ok(())
    }
}

/// One step of the policy loop.
enum PolicyStep {
    /// Re-attempt immediately (any backoff already slept).
    RetryNow,
    /// Commit past the unit without dispatching it.
    Skip,
    /// Re-produce the unit to `endpoint`, then commit past it. The caller
    /// applies the move to every envelope of its unit (all batch elements).
    Move {
        /// Target endpoint.
        endpoint: Endpoint,
        /// Optional rewrite applied before producing.
        transform: Option<std::sync::Arc<dyn MoveTransform>>,
    },
}
