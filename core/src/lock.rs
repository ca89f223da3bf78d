//! The distributed lock contract.
//!
//! Serializes singleton background workers (outbox worker, offset flusher)
//! across replicas: at most one contender holds the lock for a given name at
//! any instant. The holder must renew before the lease expires; a crashed
//! holder frees the lock within at most the lease duration.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use uuid::Uuid;

use crate::error::PipelineError;

/// Proof of lock ownership, carrying a fencing token.
///
/// The token distinguishes two successive holders of the same name, so a
/// stale holder cannot renew or release a lease it lost.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockHandle {
    /// Lock name.
    pub name: String,
    /// Fencing token of this acquisition.
    pub token: Uuid,
    /// Lease duration granted at acquisition.
    pub ttl: Duration,
}

/// Mutual exclusion among all contenders for a name.
pub trait DistributedLock: Send + Sync {
    /// Try to acquire the lock; returns `None` when another contender holds
    /// it.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Storage`] when the backing store fails.
    fn acquire<'a>(
        &'a self,
        name: &'a str,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Option<LockHandle>, PipelineError>> + Send + 'a>>;

    /// Extend the lease; returns `false` when the lease was lost (expired
    /// and taken by another contender).
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Storage`] when the backing store fails.
    fn renew<'a>(
        &'a self,
        handle: &'a LockHandle,
    ) -> Pin<Box<dyn Future<Output = Result<bool, PipelineError>> + Send + 'a>>;

    /// Release the lease. Releasing a lease that was already lost is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Storage`] when the backing store fails.
    fn release<'a>(
        &'a self,
        handle: &'a LockHandle,
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>>;
}
