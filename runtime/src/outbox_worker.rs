//! The outbox worker: a lock-elected singleton draining the transactional
//! outbox.

use std::sync::Arc;
use std::time::Duration;

use ferrobus_core::broker::BrokerClient;
use ferrobus_core::context::ShutdownToken;
use ferrobus_core::error::{ErrorKind, PipelineError};
use ferrobus_core::lock::{DistributedLock, LockHandle};
use ferrobus_core::outbox::OutboxReader;
use ferrobus_core::producer::DelegatedProducer;

/// Tuning knobs of an [`OutboxWorker`].
#[derive(Clone, Debug)]
pub struct OutboxWorkerConfig {
    /// Name of the distributed lock electing the singleton; one name per
    /// outbox.
    pub lock_name: String,
    /// Lease duration requested from the lock; renewed every tick.
    pub lease_ttl: Duration,
    /// Pause between ticks.
    pub interval: Duration,
    /// Maximum rows read per tick.
    pub batch_size: usize,
    /// Extra pause after a storage failure.
    pub error_backoff: Duration,
}

impl Default for OutboxWorkerConfig {
    fn default() -> Self {
        Self {
            lock_name: "outbox-worker".into(),
            lease_ttl: Duration::from_secs(30),
            interval: Duration::from_secs(1),
            batch_size: 100,
            error_backoff: Duration::from_secs(5),
        }
    }
}

/// Singleton background worker producing stored outbox rows.
///
/// On each tick: hold the distributed lock (acquire or renew) → read a batch
/// in FIFO order → produce each row through a [`DelegatedProducer`]
/// (bypassing routing and serialization, replaying stored bytes and headers
/// exactly) → acknowledge produced rows one by one.
///
/// # Failure policy
///
/// A produce failure leaves the row in place and ends the tick, so later
/// rows never overtake a failed one; the next tick retries. Rows that keep
/// failing are surfaced through the log and the `outbox.produce_failures`
/// counter but never discarded. A crash between produce and acknowledge
/// re-produces the row on restart; consumers deduplicate by `x-message-id`.
pub struct OutboxWorker {
    reader: Arc<dyn OutboxReader>,
    producer: DelegatedProducer,
    lock: Arc<dyn DistributedLock>,
    config: OutboxWorkerConfig,
}

impl OutboxWorker {
    /// Create a worker draining `reader` through `client`.
    #[must_use]
    pub fn new(
        reader: Arc<dyn OutboxReader>,
        client: Arc<dyn BrokerClient>,
        lock: Arc<dyn DistributedLock>,
        config: OutboxWorkerConfig,
    ) -> Self {
        Self {
            reader,
            producer: DelegatedProducer::new(client),
            lock,
            config,
        }
    }

    /// Run until `shutdown` triggers. The lock is released on the way out.
    pub async fn run(&self, mut shutdown: ShutdownToken) {
        tracing::info!(lock = %self.config.lock_name, "outbox worker started");
        let mut handle: Option<LockHandle> = None;

        loop {
            tokio::select! {
                () = shutdown.triggered() => break,
                () = tokio::time::sleep(self.config.interval) => {}
            }

            handle = match handle.take() {
                Some(held) => match self.lock.renew(&held).await {
                    Ok(true) => Some(held),
                    Ok(false) => {
                        tracing::warn!(lock = %self.config.lock_name, "lease lost");
                        None
                    }
                    Err(error) => {
                        tracing::error!(
                            lock = %self.config.lock_name,
                            error = %error,
                            "lease renewal failed"
                        );
                        None
                    }
                },
                None => match self
                    .lock
                    .acquire(&self.config.lock_name, self.config.lease_ttl)
                    .await
                {
                    Ok(handle) => handle,
                    Err(error) => {
                        tracing::error!(
                            lock = %self.config.lock_name,
                            error = %error,
                            "lock acquisition failed"
                        );
                        None
                    }
                },
            };

            if handle.is_none() {
                // Another replica is the elected worker.
                continue;
            }

            match self.tick().await {
                Ok(0) => {}
                Ok(produced) => {
                    tracing::debug!(produced, "outbox tick finished");
                }
                Err(error) if error.kind() == ErrorKind::Storage => {
                    tracing::error!(error = %error, "outbox storage failure, backing off");
                    tokio::time::sleep(self.config.error_backoff).await;
                }
                Err(error) => {
                    tracing::warn!(
                        error_kind = error.kind().as_str(),
                        error = %error,
                        "outbox tick failed, rows retried next tick"
                    );
                }
            }
        }

        if let Some(held) = handle {
            if let Err(error) = self.lock.release(&held).await {
                tracing::warn!(error = %error, "failed to release lock on shutdown");
            }
        }
        tracing::info!(lock = %self.config.lock_name, "outbox worker stopped");
    }

    /// One drain pass; returns the number of rows produced and
    /// acknowledged.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Storage`] when the outbox cannot be read or
    /// acknowledged, and the produce failure when a row cannot be produced
    /// (later rows stay queued to preserve FIFO order).
    pub async fn tick(&self) -> Result<usize, PipelineError> {
        let batch = self.reader.read(self.config.batch_size).await?;
        let mut produced = 0;

        for message in batch {
            match self.producer.produce_stored(&message).await {
                Ok(id) => {
                    self.reader.acknowledge(&[message.id]).await?;
                    produced += 1;
                    metrics::counter!("outbox.messages.produced").increment(1);
                    tracing::debug!(
                        outbox_id = message.id,
                        identifier = %id.log_form(),
                        endpoint = %message.endpoint_name,
                        "outbox row produced"
                    );
                }
                Err(error) => {
                    metrics::counter!("outbox.produce_failures").increment(1);
                    tracing::error!(
                        outbox_id = message.id,
                        endpoint = %message.endpoint_name,
                        message_type = message.message_type.as_deref().unwrap_or(""),
                        failed_attempts = message.headers.failed_attempts(),
                        error_kind = error.kind().as_str(),
                        error = %error,
                        "failed to produce outbox row, will retry"
                    );
                    // Stop the tick: producing later rows first would break
                    // FIFO ordering.
                    return Err(error);
                }
            }
        }
        Ok(produced)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use crate::lock::InMemoryLock;
    use ferrobus_core::broker::{ClientStatus, RawRecord, RecordStream};
    use ferrobus_core::context::{PipelineContext, ShutdownSignal};
    use ferrobus_core::envelope::OutboundEnvelope;
    use ferrobus_core::headers::Headers;
    use ferrobus_core::identifier::BrokerRecordId;
    use ferrobus_core::outbox::{NewOutboxMessage, OutboxMessage, OutboxWriter};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
    use tokio::sync::watch;

    /// Minimal in-memory outbox shared by writer and reader halves.
    #[derive(Default)]
    struct MemoryOutbox {
        rows: Mutex<Vec<OutboxMessage>>,
        next_id: AtomicI64,
    }

    impl OutboxWriter for MemoryOutbox {
        fn add<'a>(
            &'a self,
            message: NewOutboxMessage,
            _ctx: &'a mut PipelineContext,
        ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>> {
            Box::pin(async move {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
                self.rows.lock().unwrap().push(OutboxMessage {
                    id,
                    message_type: message.message_type,
                    content: message.content,
                    headers: message.headers,
                    endpoint_name: message.endpoint_name,
                    serialized_endpoint: message.serialized_endpoint,
                    created: chrono::Utc::now(),
                });
                Ok(())
            })
        }
    }

    impl OutboxReader for MemoryOutbox {
        fn read(
            &self,
            limit: usize,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxMessage>, PipelineError>> + Send + '_>>
        {
            Box::pin(async move {
                Ok(self.rows.lock().unwrap().iter().take(limit).cloned().collect())
            })
        }

        fn acknowledge<'a>(
            &'a self,
            ids: &'a [i64],
        ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>> {
            Box::pin(async move {
                self.rows.lock().unwrap().retain(|row| !ids.contains(&row.id));
                Ok(())
            })
        }
    }

    /// Broker double that can fail the first N produces.
    struct FlakyClient {
        produced: Mutex<Vec<OutboundEnvelope>>,
        failures_left: AtomicU32,
        status_tx: watch::Sender<ClientStatus>,
    }

    impl FlakyClient {
        fn new(failures: u32) -> Self {
            Self {
                produced: Mutex::new(Vec::new()),
                failures_left: AtomicU32::new(failures),
                status_tx: watch::channel(ClientStatus::Initialized).0,
            }
        }
    }

    impl BrokerClient for FlakyClient {
        fn status(&self) -> ClientStatus {
            ClientStatus::Initialized
        }

        fn status_watch(&self) -> watch::Receiver<ClientStatus> {
            self.status_tx.subscribe()
        }

        fn connect(
            &self,
        ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + '_>> {
            Box::pin(async { Ok(()) })
        }

        fn disconnect(
            &self,
        ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + '_>> {
            Box::pin(async { Ok(()) })
        }

        fn produce<'a>(
            &'a self,
            envelope: &'a OutboundEnvelope,
        ) -> Pin<Box<dyn Future<Output = Result<BrokerRecordId, PipelineError>> + Send + 'a>>
        {
            Box::pin(async move {
                let failures = self.failures_left.load(Ordering::SeqCst);
                if failures > 0 {
                    self.failures_left.store(failures - 1, Ordering::SeqCst);
                    return Err(PipelineError::TransientBroker("broker down".into()));
                }
                let mut produced = self.produced.lock().unwrap();
                produced.push(envelope.clone());
                #[allow(clippy::cast_possible_wrap)]
                Ok(BrokerRecordId::TopicPartitionOffset {
                    topic: envelope.endpoint.name.clone(),
                    partition: 0,
                    offset: produced.len() as i64 - 1,
                })
            })
        }

        fn consume(
            &self,
            _shutdown: ShutdownToken,
        ) -> Pin<Box<dyn Future<Output = Result<RecordStream, PipelineError>> + Send + '_>>
        {
            Box::pin(async { Ok(Box::pin(futures::stream::empty()) as RecordStream) })
        }

        fn commit<'a>(
            &'a self,
            _ids: &'a [BrokerRecordId],
        ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>> {
            Box::pin(async { Ok(()) })
        }
    }

    async fn seed(outbox: &MemoryOutbox, count: i64) {
        let mut ctx = PipelineContext::detached();
        for n in 0..count {
            let mut headers = Headers::new();
            headers.insert("x-message-id", format!("m-{n}"));
            outbox
                .add(
                    NewOutboxMessage {
                        message_type: Some("Order.v1".into()),
                        content: Some(format!(r#"{{"n":{n}}}"#).into_bytes()),
                        headers,
                        endpoint_name: "order-events".into(),
                        serialized_endpoint: None,
                    },
                    &mut ctx,
                )
                .await
                .unwrap();
        }
    }

    fn worker(
        outbox: &Arc<MemoryOutbox>,
        client: &Arc<FlakyClient>,
        lock: &Arc<InMemoryLock>,
    ) -> OutboxWorker {
        OutboxWorker::new(
            Arc::clone(outbox) as _,
            Arc::clone(client) as _,
            Arc::clone(lock) as _,
            OutboxWorkerConfig::default(),
        )
    }

    #[tokio::test]
    async fn tick_drains_fifo_and_acknowledges() {
        let outbox = Arc::new(MemoryOutbox::default());
        let client = Arc::new(FlakyClient::new(0));
        let lock = Arc::new(InMemoryLock::new());
        seed(&outbox, 3).await;

        let produced = worker(&outbox, &client, &lock).tick().await.unwrap();

        assert_eq!(produced, 3);
        assert!(outbox.rows.lock().unwrap().is_empty());

        let sent = client.produced.lock().unwrap();
        assert_eq!(sent.len(), 3);
        // FIFO: bodies replayed in insertion order, headers bit-exact.
        assert_eq!(sent[0].raw_body, br#"{"n":0}"#);
        assert_eq!(sent[0].headers.get("x-message-id"), Some("m-0"));
        assert_eq!(sent[2].raw_body, br#"{"n":2}"#);
    }

    #[tokio::test]
    async fn failed_row_stays_and_blocks_later_rows() {
        let outbox = Arc::new(MemoryOutbox::default());
        let client = Arc::new(FlakyClient::new(1));
        let lock = Arc::new(InMemoryLock::new());
        seed(&outbox, 2).await;

        let w = worker(&outbox, &client, &lock);
        assert!(w.tick().await.is_err());

        // Nothing produced, nothing acknowledged.
        assert!(client.produced.lock().unwrap().is_empty());
        assert_eq!(outbox.rows.lock().unwrap().len(), 2);

        // Next tick succeeds and drains both rows in order.
        assert_eq!(w.tick().await.unwrap(), 2);
        assert!(outbox.rows.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_is_elected_through_the_lock() {
        let outbox = Arc::new(MemoryOutbox::default());
        let client = Arc::new(FlakyClient::new(0));
        let lock = Arc::new(InMemoryLock::new());
        seed(&outbox, 1).await;

        // A contender already holds the lock: the worker must not produce.
        let held = lock
            .acquire("outbox-worker", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let w = Arc::new(OutboxWorker::new(
            Arc::clone(&outbox) as _,
            Arc::clone(&client) as _,
            Arc::clone(&lock) as _,
            OutboxWorkerConfig {
                interval: Duration::from_millis(10),
                ..OutboxWorkerConfig::default()
            },
        ));

        let signal = ShutdownSignal::new();
        let task = tokio::spawn({
            let w = Arc::clone(&w);
            let token = signal.token();
            async move { w.run(token).await }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(client.produced.lock().unwrap().is_empty());

        // Release the lock: the worker takes over and drains the outbox.
        lock.release(&held).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(client.produced.lock().unwrap().len(), 1);

        signal.trigger();
        task.await.unwrap();

        // The worker released its lease on shutdown.
        assert!(
            lock.acquire("outbox-worker", Duration::from_secs(30))
                .await
                .unwrap()
                .is_some()
        );
    }
}
