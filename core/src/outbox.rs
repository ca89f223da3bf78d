//! The transactional outbox contracts.
//!
//! The outbox is a durable buffer of pending outbound messages. The writer
//! inserts rows inside the application's database transaction (when one is
//! enlisted in the pipeline context), making the produce intent atomic with
//! the domain write; a background worker drains the rows in FIFO order and
//! produces them through the regular broker client.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;

use crate::context::PipelineContext;
use crate::error::PipelineError;
use crate::headers::Headers;

/// A persisted outbox row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboxMessage {
    /// Monotonically assigned row id; FIFO order follows it.
    pub id: i64,
    /// The `x-message-type` of the stored message, when known.
    pub message_type: Option<String>,
    /// Serialized body bytes; `None` for tombstones.
    pub content: Option<Vec<u8>>,
    /// Wire headers at store time, replayed bit-exactly on produce.
    pub headers: Headers,
    /// Raw name of the target endpoint.
    pub endpoint_name: String,
    /// Persisted endpoint form for dynamically resolved endpoints.
    pub serialized_endpoint: Option<String>,
    /// Insertion timestamp.
    pub created: DateTime<Utc>,
}

/// A row to be inserted into the outbox.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewOutboxMessage {
    /// The `x-message-type` of the message, when known.
    pub message_type: Option<String>,
    /// Serialized body bytes; `None` for tombstones.
    pub content: Option<Vec<u8>>,
    /// Wire headers to replay on produce.
    pub headers: Headers,
    /// Raw name of the target endpoint.
    pub endpoint_name: String,
    /// Persisted endpoint form for dynamically resolved endpoints.
    pub serialized_endpoint: Option<String>,
}

/// Writer half of the outbox.
pub trait OutboxWriter: Send + Sync {
    /// Insert one row.
    ///
    /// When the pipeline context carries an enlisted database transaction,
    /// the insert executes under it; otherwise the write is autonomous and
    /// implementations emit a warning, since atomicity with the caller's
    /// domain writes is lost.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Storage`] when the insert fails.
    fn add<'a>(
        &'a self,
        message: NewOutboxMessage,
        ctx: &'a mut PipelineContext,
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>>;
}

/// Reader half of the outbox, used by the background worker.
pub trait OutboxReader: Send + Sync {
    /// Read up to `limit` rows in FIFO order (by id).
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Storage`] when the read fails.
    fn read(
        &self,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxMessage>, PipelineError>> + Send + '_>>;

    /// Remove rows by id after their messages were produced.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Storage`] when the delete fails.
    fn acknowledge<'a>(
        &'a self,
        ids: &'a [i64],
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>>;
}
