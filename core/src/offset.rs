//! The client-side offset store contract.
//!
//! Stores the highest *processed* offset per `(group id, topic, partition)`,
//! independent of the broker's committed offsets. On consumer start the
//! stored offsets override the broker's: the consumer seeks to
//! `stored + 1`, which yields exactly-once processing when the subscriber's
//! side effects were made atomic with the offset update (same database
//! transaction as the outbox write).

use std::future::Future;
use std::pin::Pin;

use crate::error::PipelineError;

/// Key of one stored offset.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OffsetKey {
    /// Consumer group id.
    pub group_id: String,
    /// Topic name.
    pub topic: String,
    /// Partition number.
    pub partition: i32,
}

impl OffsetKey {
    /// Create a key.
    #[must_use]
    pub fn new(group_id: impl Into<String>, topic: impl Into<String>, partition: i32) -> Self {
        Self {
            group_id: group_id.into(),
            topic: topic.into(),
            partition,
        }
    }
}

impl std::fmt::Display for OffsetKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}[{}]", self.group_id, self.topic, self.partition)
    }
}

/// Persistent record of the last processed offset per partition.
///
/// Implementations must keep stored offsets monotonically non-decreasing
/// per key; writing an offset lower than or equal to the stored one is a
/// no-op, which makes duplicate writes idempotent.
pub trait OffsetStore: Send + Sync {
    /// Record `offset` as processed for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Storage`] when the write fails.
    fn store<'a>(
        &'a self,
        key: &'a OffsetKey,
        offset: i64,
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>>;

    /// Load the stored offset for `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Storage`] when the read fails.
    fn load<'a>(
        &'a self,
        key: &'a OffsetKey,
    ) -> Pin<Box<dyn Future<Output = Result<Option<i64>, PipelineError>> + Send + 'a>>;
}
