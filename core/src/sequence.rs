//! Chunk and batch sequences: groups of envelopes processed as one unit.
//!
//! A chunk sequence reassembles a message that was split at produce time;
//! a batch sequence windows independent messages into one processing unit.
//! Both share the same state machine:
//!
//! ```text
//! Pending ──add──▶ Complete ──take──▶ AwaitingProcessing ──▶ Processed
//!    │
//!    └──────────────────── Aborted(reason) ◀────────────────────┘
//! ```
//!
//! Chunk bodies are buffered in a single arena per sequence (one contiguous
//! buffer appended in index order), so reassembly is a move rather than a
//! concatenation of scattered allocations.
//!
//! A [`SequenceStore`] holds the pending sequences of one partition. It is
//! single-writer by contract: only the partition's consumer task touches it.

use std::collections::HashMap;
use tokio::sync::watch;

use crate::endpoint::{BatchSettings, Endpoint};
use crate::envelope::InboundEnvelope;
use crate::error::PipelineError;
use crate::headers::{Headers, names};
use crate::identifier::BrokerRecordId;

/// Why a sequence was terminated early.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbortReason {
    /// A new sequence started before this one received its last chunk.
    IncompleteSequence,
    /// The consumer shut down while the sequence was in flight.
    ConsumerAborted,
    /// Processing of the sequence failed.
    Error,
    /// The downstream enumeration was dropped before completion.
    EnumerationAborted,
}

impl AbortReason {
    /// Stable lowercase name used in structured log fields.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::IncompleteSequence => "incomplete-sequence",
            Self::ConsumerAborted => "consumer-aborted",
            Self::Error => "error",
            Self::EnumerationAborted => "enumeration-aborted",
        }
    }
}

/// Lifecycle state of a sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SequenceState {
    /// Accepting more envelopes.
    Pending,
    /// All envelopes received, not yet handed downstream.
    Complete,
    /// Handed downstream; waiting for processing to finish.
    AwaitingProcessing,
    /// Fully processed and committed.
    Processed,
    /// Terminated early.
    Aborted(AbortReason),
}

impl SequenceState {
    /// Whether the sequence reached a terminal state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Processed | Self::Aborted(_))
    }
}

/// Handle to a sequence's state machine, kept alive after the store removed
/// the sequence so downstream completion can be awaited and signalled.
#[derive(Clone, Debug)]
pub struct SequenceHandle {
    tx: watch::Sender<SequenceState>,
}

impl SequenceHandle {
    fn new(state: SequenceState) -> Self {
        let (tx, _) = watch::channel(state);
        Self { tx }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SequenceState {
        *self.tx.borrow()
    }

    /// Observe state transitions.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<SequenceState> {
        self.tx.subscribe()
    }

    /// Mark the sequence as processed. No-op once terminal.
    pub fn mark_processed(&self) {
        self.transition(SequenceState::Processed);
    }

    /// Abort the sequence. Idempotent: the first terminal transition wins.
    pub fn abort(&self, reason: AbortReason) {
        self.transition(SequenceState::Aborted(reason));
    }

    fn transition(&self, target: SequenceState) {
        self.tx.send_if_modified(|state| {
            if state.is_terminal() {
                return false;
            }
            *state = target;
            true
        });
    }
}

/// Wait until the sequence is processed or aborted; returns the terminal
/// state.
pub async fn await_processed(mut rx: watch::Receiver<SequenceState>) -> SequenceState {
    loop {
        let state = *rx.borrow_and_update();
        if state.is_terminal() {
            return state;
        }
        if rx.changed().await.is_err() {
            // Handle dropped without a terminal transition.
            return SequenceState::Aborted(AbortReason::EnumerationAborted);
        }
    }
}

/// A pending chunk sequence: envelopes sharing a sequence id with
/// monotonically increasing chunk indices.
#[derive(Debug)]
pub struct ChunkSequence {
    id: String,
    endpoint: Endpoint,
    headers: Headers,
    arena: Vec<u8>,
    received: u32,
    expected: Option<u32>,
    records: Vec<BrokerRecordId>,
    handle: SequenceHandle,
}

impl ChunkSequence {
    fn new(envelope: &InboundEnvelope, id: String) -> Self {
        Self {
            id,
            endpoint: envelope.endpoint.clone(),
            headers: envelope.headers.clone(),
            arena: Vec::new(),
            received: 0,
            expected: envelope.headers.chunks_count(),
            records: Vec::new(),
            handle: SequenceHandle::new(SequenceState::Pending),
        }
    }

    /// Sequence id (the shared `x-message-id`).
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Number of chunks received so far.
    #[must_use]
    pub const fn len(&self) -> u32 {
        self.received
    }

    /// Whether no chunk arrived yet.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.received == 0
    }

    /// Identifiers of the buffered chunks, in consume order.
    #[must_use]
    pub fn records(&self) -> &[BrokerRecordId] {
        &self.records
    }

    /// Handle to the sequence's state machine.
    #[must_use]
    pub fn handle(&self) -> &SequenceHandle {
        &self.handle
    }

    /// Append a chunk; returns `true` when the sequence is now complete.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Sequence`] when the chunk index is not the
    /// next expected one or exceeds the declared chunk count.
    fn add_chunk(&mut self, envelope: InboundEnvelope) -> Result<bool, PipelineError> {
        let index = envelope.headers.chunk_index().ok_or_else(|| {
            PipelineError::Sequence(format!("chunk without '{}' header", names::CHUNK_INDEX))
        })?;

        if index != self.received {
            return Err(PipelineError::Sequence(format!(
                "chunk out of order in sequence '{}': expected index {}, got {index}",
                self.id, self.received
            )));
        }
        if let Some(expected) = self.expected {
            if index >= expected {
                return Err(PipelineError::Sequence(format!(
                    "chunk index {index} exceeds declared count {expected} in sequence '{}'",
                    self.id
                )));
            }
        }

        let is_last =
            envelope.headers.is_last_chunk() || self.expected == Some(self.received + 1);

        self.arena.extend_from_slice(&envelope.raw_body);
        self.records.push(envelope.record_id);
        self.received += 1;

        if is_last {
            self.handle.transition(SequenceState::Complete);
        }
        Ok(is_last)
    }

    /// Release buffered chunks on abort.
    fn abort(mut self, reason: AbortReason) -> Vec<BrokerRecordId> {
        self.arena = Vec::new();
        self.handle.abort(reason);
        self.records
    }

    /// Move out the assembled unit; the sequence transitions to
    /// `AwaitingProcessing`.
    fn into_assembled(mut self) -> AssembledSequence {
        self.handle.transition(SequenceState::AwaitingProcessing);

        // Strip the chunking headers: the reassembled envelope is the
        // logical message, not a chunk.
        let mut headers = self.headers;
        headers.remove(names::CHUNK_INDEX);
        headers.remove(names::CHUNKS_COUNT);
        headers.remove(names::CHUNK_IS_LAST);
        headers.remove(names::FIRST_CHUNK_OFFSET);

        AssembledSequence {
            sequence_id: self.id,
            body: self.arena,
            headers,
            endpoint: self.endpoint,
            records: self.records,
            handle: self.handle,
        }
    }
}

/// A completed chunk sequence, reassembled and ready for the rest of the
/// consumer pipeline.
#[derive(Debug)]
pub struct AssembledSequence {
    /// Sequence id (the shared `x-message-id`).
    pub sequence_id: String,
    /// The reassembled body: byte-wise concatenation in index order.
    pub body: Vec<u8>,
    /// Headers of the first chunk, minus the chunking headers.
    pub headers: Headers,
    /// Endpoint the chunks were consumed from.
    pub endpoint: Endpoint,
    /// Identifiers of all chunks, committed together after processing.
    pub records: Vec<BrokerRecordId>,
    /// State machine handle; mark processed (or abort) after dispatch.
    pub handle: SequenceHandle,
}

/// An incomplete sequence that was aborted, with the identifiers it had
/// buffered.
#[derive(Debug)]
pub struct AbortedSequence {
    /// Sequence id.
    pub id: String,
    /// Why it was aborted.
    pub reason: AbortReason,
    /// Identifiers of the chunks it had buffered.
    pub records: Vec<BrokerRecordId>,
}

/// Outcome of feeding one chunk into a [`SequenceStore`].
#[derive(Debug)]
pub enum ChunkOutcome {
    /// The chunk was buffered; commit is deferred until the sequence
    /// terminates.
    Buffered,
    /// The sequence completed; process the assembled unit.
    Completed(AssembledSequence),
}

/// Result of [`SequenceStore::add_chunk`]: the outcome for the fed chunk
/// plus any sequences that were preempted by it.
#[derive(Debug)]
pub struct ChunkFeed {
    /// Outcome for the fed chunk.
    pub outcome: ChunkOutcome,
    /// Sequences aborted with [`AbortReason::IncompleteSequence`] because a
    /// new sequence started.
    pub preempted: Vec<AbortedSequence>,
}

/// The pending chunk sequences of one partition.
///
/// Single-writer by contract: only the owning consumer task mutates a store.
/// For any sequence id at most one sequence object exists at a time.
#[derive(Debug, Default)]
pub struct SequenceStore {
    sequences: HashMap<String, ChunkSequence>,
}

impl SequenceStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending sequences.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.sequences.len()
    }

    /// Feed one chunk envelope.
    ///
    /// A first chunk (index 0) preempts every pending sequence in the store,
    /// including a prior incomplete sequence with the same id: within one
    /// partition chunks of distinct messages never interleave, so a pending
    /// sequence can never complete once a new one starts.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Sequence`] when the envelope carries no
    /// sequence id, when a non-first chunk has no pending sequence, or when
    /// the chunk index is out of order (the affected sequence is aborted with
    /// [`AbortReason::Error`] before the error is returned).
    pub fn add_chunk(&mut self, envelope: InboundEnvelope) -> Result<ChunkFeed, PipelineError> {
        let sequence_id = envelope
            .message_id()
            .ok_or_else(|| {
                PipelineError::Sequence(format!(
                    "chunk without '{}' header cannot join a sequence",
                    names::MESSAGE_ID
                ))
            })?
            .to_string();
        let index = envelope.headers.chunk_index().ok_or_else(|| {
            PipelineError::Sequence(format!("chunk without '{}' header", names::CHUNK_INDEX))
        })?;

        let mut preempted = Vec::new();
        if index == 0 {
            for (id, sequence) in self.sequences.drain() {
                tracing::warn!(
                    sequence_id = %id,
                    buffered_chunks = sequence.len(),
                    "aborting incomplete sequence preempted by a new sequence"
                );
                preempted.push(AbortedSequence {
                    id,
                    reason: AbortReason::IncompleteSequence,
                    records: sequence.abort(AbortReason::IncompleteSequence),
                });
            }
            self.sequences.insert(
                sequence_id.clone(),
                ChunkSequence::new(&envelope, sequence_id.clone()),
            );
        } else if !self.sequences.contains_key(&sequence_id) {
            return Err(PipelineError::Sequence(format!(
                "chunk {index} of sequence '{sequence_id}' arrived without a first chunk"
            )));
        }

        // The entry exists in both branches above.
        let Some(sequence) = self.sequences.get_mut(&sequence_id) else {
            return Err(PipelineError::Sequence(format!(
                "sequence '{sequence_id}' disappeared from its store"
            )));
        };

        let complete = match sequence.add_chunk(envelope) {
            Ok(complete) => complete,
            Err(error) => {
                if let Some(sequence) = self.sequences.remove(&sequence_id) {
                    sequence.abort(AbortReason::Error);
                }
                return Err(error);
            }
        };

        let outcome = if complete {
            // Invariant: a sequence is Complete or Aborted at the moment the
            // store removes it.
            let Some(sequence) = self.sequences.remove(&sequence_id) else {
                return Err(PipelineError::Sequence(format!(
                    "sequence '{sequence_id}' disappeared from its store"
                )));
            };
            ChunkOutcome::Completed(sequence.into_assembled())
        } else {
            ChunkOutcome::Buffered
        };

        Ok(ChunkFeed { outcome, preempted })
    }

    /// Abort every pending sequence; used on consumer shutdown.
    pub fn abort_all(&mut self, reason: AbortReason) -> Vec<AbortedSequence> {
        self.sequences
            .drain()
            .map(|(id, sequence)| AbortedSequence {
                id,
                reason,
                records: sequence.abort(reason),
            })
            .collect()
    }
}

/// A windowed batch of envelopes processed and committed together.
///
/// Chunked messages are reassembled before they reach a batch, so a batch's
/// chunk sub-sequences are complete by construction when the batch fills;
/// the batch (parent) completes only after all its elements were processed.
#[derive(Debug)]
pub struct BatchSequence {
    id: String,
    settings: BatchSettings,
    opened_at: tokio::time::Instant,
    items: Vec<InboundEnvelope>,
    records: Vec<BrokerRecordId>,
    handle: SequenceHandle,
}

impl BatchSequence {
    /// Open a new batch.
    #[must_use]
    pub fn new(settings: BatchSettings) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            settings,
            opened_at: tokio::time::Instant::now(),
            items: Vec::with_capacity(settings.size),
            records: Vec::new(),
            handle: SequenceHandle::new(SequenceState::Pending),
        }
    }

    /// Batch id, emitted as `x-batch-id` on dispatch.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Number of buffered envelopes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the batch holds no envelopes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Instant at which the batch window closes.
    #[must_use]
    pub fn deadline(&self) -> tokio::time::Instant {
        self.opened_at + self.settings.window
    }

    /// Handle to the batch's state machine.
    #[must_use]
    pub fn handle(&self) -> &SequenceHandle {
        &self.handle
    }

    /// Add an envelope (with extra identifiers it carries, e.g. all chunks
    /// of a reassembled message); returns `true` when the batch is full.
    pub fn push(&mut self, envelope: InboundEnvelope, records: Vec<BrokerRecordId>) -> bool {
        self.items.push(envelope);
        self.records.extend(records);
        if self.items.len() >= self.settings.size {
            self.handle.transition(SequenceState::Complete);
            true
        } else {
            false
        }
    }

    /// Close the batch: stamp the batch headers on every element and return
    /// the unit to process. The batch transitions to `AwaitingProcessing`.
    #[must_use]
    pub fn take(mut self) -> BatchUnit {
        self.handle.transition(SequenceState::Complete);
        self.handle.transition(SequenceState::AwaitingProcessing);

        let size = self.items.len().to_string();
        for item in &mut self.items {
            item.headers.set(names::BATCH_ID, self.id.clone());
            item.headers.set(names::BATCH_SIZE, size.clone());
        }

        BatchUnit {
            id: self.id,
            items: self.items,
            records: self.records,
            handle: self.handle,
        }
    }

    /// Abort the batch, releasing buffered envelopes.
    pub fn abort(self, reason: AbortReason) -> Vec<BrokerRecordId> {
        self.handle.abort(reason);
        self.records
    }
}

/// A closed batch ready for dispatch.
#[derive(Debug)]
pub struct BatchUnit {
    /// Batch id.
    pub id: String,
    /// The batched envelopes, in consume order.
    pub items: Vec<InboundEnvelope>,
    /// All identifiers covered by the batch, committed together.
    pub records: Vec<BrokerRecordId>,
    /// State machine handle; mark processed (or abort) after dispatch.
    pub handle: SequenceHandle,
}
