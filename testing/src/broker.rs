//! In-memory broker: a partitioned in-process log with consumer-group
//! commit tracking.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ferrobus_core::broker::{BrokerClient, ClientStatus, RawRecord, RecordStream};
use ferrobus_core::context::ShutdownToken;
use ferrobus_core::envelope::OutboundEnvelope;
use ferrobus_core::error::PipelineError;
use ferrobus_core::headers::Headers;
use ferrobus_core::identifier::BrokerRecordId;
use tokio::sync::{Notify, watch};

/// A record as stored by the in-memory broker.
#[derive(Clone, Debug)]
pub struct StoredRecord {
    /// Body bytes as produced.
    pub body: Vec<u8>,
    /// Headers as produced.
    pub headers: Headers,
}

#[derive(Default)]
struct BrokerState {
    /// Append-only logs per (topic, partition).
    logs: HashMap<(String, i32), Vec<StoredRecord>>,
    /// Last committed offset per (group, topic, partition).
    commits: HashMap<(String, String, i32), i64>,
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    arrivals: Notify,
}

/// An in-process broker hub.
///
/// Cheap to clone; clones share the same logs. Create one [`InMemoryClient`]
/// per consumer group with [`InMemoryBroker::client`].
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                arrivals: Notify::new(),
            }),
        }
    }

    /// Create a client bound to a consumer group and a set of topics.
    #[must_use]
    pub fn client(&self, group_id: impl Into<String>, topics: &[&str]) -> InMemoryClient {
        InMemoryClient {
            inner: Arc::clone(&self.inner),
            group_id: group_id.into(),
            topics: topics.iter().map(ToString::to_string).collect(),
            status_tx: watch::channel(ClientStatus::Initialized).0,
        }
    }

    /// All records of a topic across partitions, in produce order per
    /// partition.
    #[must_use]
    pub fn records(&self, topic: &str) -> Vec<StoredRecord> {
        let state = lock_state(&self.inner);
        let mut partitions: Vec<_> = state
            .logs
            .iter()
            .filter(|((t, _), _)| t == topic)
            .collect();
        partitions.sort_by_key(|((_, partition), _)| *partition);
        partitions
            .into_iter()
            .flat_map(|(_, records)| records.iter().cloned())
            .collect()
    }

    /// The last committed offset of a group on a partition.
    #[must_use]
    pub fn committed(&self, group_id: &str, topic: &str, partition: i32) -> Option<i64> {
        lock_state(&self.inner)
            .commits
            .get(&(group_id.to_string(), topic.to_string(), partition))
            .copied()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_state(inner: &BrokerInner) -> std::sync::MutexGuard<'_, BrokerState> {
    // The mutex only guards plain data; a poisoned lock means a test
    // already panicked, so propagating the panic is fine.
    #[allow(clippy::unwrap_used)]
    inner.state.lock().unwrap()
}

/// Broker client over an [`InMemoryBroker`], bound to one consumer group.
///
/// Consumption resumes from the group's committed offsets, mirroring the
/// behavior of a real broker across client restarts.
pub struct InMemoryClient {
    inner: Arc<BrokerInner>,
    group_id: String,
    topics: Vec<String>,
    status_tx: watch::Sender<ClientStatus>,
}

impl BrokerClient for InMemoryClient {
    fn status(&self) -> ClientStatus {
        *self.status_tx.borrow()
    }

    fn status_watch(&self) -> watch::Receiver<ClientStatus> {
        self.status_tx.subscribe()
    }

    fn connect(&self) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + '_>> {
        Box::pin(async move {
            let _ = self.status_tx.send(ClientStatus::Initialized);
            Ok(())
        })
    }

    fn disconnect(&self) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + '_>> {
        Box::pin(async move {
            let _ = self.status_tx.send(ClientStatus::Disconnected);
            Ok(())
        })
    }

    fn produce<'a>(
        &'a self,
        envelope: &'a OutboundEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<BrokerRecordId, PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            if self.status() != ClientStatus::Initialized {
                return Err(PipelineError::TransientBroker(format!(
                    "client is {}",
                    self.status()
                )));
            }

            let partition = envelope.endpoint.partition.unwrap_or(0);
            let offset;
            {
                let mut state = lock_state(&self.inner);
                let log = state
                    .logs
                    .entry((envelope.endpoint.name.clone(), partition))
                    .or_default();
                log.push(StoredRecord {
                    body: envelope.raw_body.clone(),
                    headers: envelope.headers.clone(),
                });
                #[allow(clippy::cast_possible_wrap)]
                let assigned = log.len() as i64 - 1;
                offset = assigned;
            }
            self.inner.arrivals.notify_waiters();

            Ok(BrokerRecordId::TopicPartitionOffset {
                topic: envelope.endpoint.name.clone(),
                partition,
                offset,
            })
        })
    }

    fn consume(
        &self,
        shutdown: ShutdownToken,
    ) -> Pin<Box<dyn Future<Output = Result<RecordStream, PipelineError>> + Send + '_>> {
        Box::pin(async move {
            let inner = Arc::clone(&self.inner);
            let group_id = self.group_id.clone();
            let topics = self.topics.clone();
            let mut shutdown = shutdown;

            let stream = async_stream::stream! {
                // Reading positions per (topic, partition); resume after the
                // group's committed offsets.
                let mut positions: HashMap<(String, i32), i64> = HashMap::new();

                loop {
                    let mut pending = Vec::new();
                    {
                        let state = lock_state(&inner);
                        for ((topic, partition), log) in &state.logs {
                            if !topics.contains(topic) {
                                continue;
                            }
                            let key = (topic.clone(), *partition);
                            let start = *positions.entry(key.clone()).or_insert_with(|| {
                                state
                                    .commits
                                    .get(&(group_id.clone(), topic.clone(), *partition))
                                    .map_or(0, |committed| committed + 1)
                            });

                            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                            for (index, record) in log.iter().enumerate().skip(start as usize) {
                                #[allow(clippy::cast_possible_wrap)]
                                let offset = index as i64;
                                pending.push(RawRecord {
                                    endpoint_name: topic.clone(),
                                    body: record.body.clone(),
                                    headers: record.headers.clone(),
                                    record_id: BrokerRecordId::TopicPartitionOffset {
                                        topic: topic.clone(),
                                        partition: *partition,
                                        offset,
                                    },
                                });
                            }
                            if let Some(position) = positions.get_mut(&key) {
                                #[allow(clippy::cast_possible_wrap)]
                                {
                                    *position = log.len() as i64;
                                }
                            }
                        }
                    }

                    for record in pending {
                        yield Ok(record);
                    }

                    tokio::select! {
                        () = shutdown.triggered() => break,
                        () = inner.arrivals.notified() => {}
                        // Fallback poll: notify_waiters does not wake
                        // waiters registered after the notification.
                        () = tokio::time::sleep(Duration::from_millis(20)) => {}
                    }
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
            let mut state = lock_state(&self.inner);
            for id in ids {
                if let BrokerRecordId::TopicPartitionOffset {
                    topic,
                    partition,
                    offset,
                } = id
                {
                    let committed = state
                        .commits
                        .entry((self.group_id.clone(), topic.clone(), *partition))
                        .or_insert(-1);
                    *committed = (*committed).max(*offset);
                }
            }
            Ok(())
        })
    }
}
