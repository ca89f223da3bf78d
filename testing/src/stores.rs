//! In-memory outbox and offset store.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

use ferrobus_core::context::PipelineContext;
use ferrobus_core::error::PipelineError;
use ferrobus_core::offset::{OffsetKey, OffsetStore};
use ferrobus_core::outbox::{NewOutboxMessage, OutboxMessage, OutboxReader, OutboxWriter};

/// In-memory outbox implementing both the writer and the reader contract.
///
/// Rows get monotonically increasing ids and are read back in FIFO order,
/// matching the database-backed implementation. There is no real
/// transaction; writes are always autonomous.
#[derive(Default)]
pub struct InMemoryOutbox {
    rows: Mutex<Vec<OutboxMessage>>,
    next_id: AtomicI64,
}

impl InMemoryOutbox {
    /// Create an empty outbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending rows.
    ///
    /// # Panics
    ///
    /// Panics when a previous test assertion already poisoned the row
    /// mutex.
    #[must_use]
    #[allow(clippy::unwrap_used)]
    pub fn count_pending(&self) -> usize {
        self.rows.lock().unwrap().len()
    }
}

impl OutboxWriter for InMemoryOutbox {
    #[allow(clippy::unwrap_used)] // Poisoned mutex means a test already failed
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

impl OutboxReader for InMemoryOutbox {
    #[allow(clippy::unwrap_used)] // Poisoned mutex means a test already failed
    fn read(
        &self,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxMessage>, PipelineError>> + Send + '_>>
    {
        Box::pin(async move {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .iter()
                .take(limit)
                .cloned()
                .collect())
        })
    }

    #[allow(clippy::unwrap_used)] // Poisoned mutex means a test already failed
    fn acknowledge<'a>(
        &'a self,
        ids: &'a [i64],
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            self.rows
                .lock()
                .unwrap()
                .retain(|row| !ids.contains(&row.id));
            Ok(())
        })
    }
}

/// In-memory offset store with the monotonicity guarantee of the real one.
#[derive(Default)]
pub struct InMemoryOffsetStore {
    offsets: Mutex<HashMap<OffsetKey, i64>>,
}

impl InMemoryOffsetStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl OffsetStore for InMemoryOffsetStore {
    #[allow(clippy::unwrap_used)] // Poisoned mutex means a test already failed
    fn store<'a>(
        &'a self,
        key: &'a OffsetKey,
        offset: i64,
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            let mut offsets = self.offsets.lock().unwrap();
            let stored = offsets.entry(key.clone()).or_insert(offset);
            *stored = (*stored).max(offset);
            Ok(())
        })
    }

    #[allow(clippy::unwrap_used)] // Poisoned mutex means a test already failed
    fn load<'a>(
        &'a self,
        key: &'a OffsetKey,
    ) -> Pin<Box<dyn Future<Output = Result<Option<i64>, PipelineError>> + Send + 'a>> {
        Box::pin(async move { Ok(self.offsets.lock().unwrap().get(key).copied()) })
    }
}
