//! In-process distributed lock.

use ferrobus_core::error::PipelineError;
use ferrobus_core::lock::{DistributedLock, LockHandle};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Single-process [`DistributedLock`].
///
/// Useful for tests and single-replica deployments; the mutual-exclusion and
/// lease-expiry semantics match the database-backed implementations, so
/// worker code behaves identically against either.
#[derive(Default)]
pub struct InMemoryLock {
    leases: Mutex<HashMap<String, Lease>>,
}

struct Lease {
    token: Uuid,
    expires_at: Instant,
}

impl InMemoryLock {
    /// Create a lock with no held leases.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl DistributedLock for InMemoryLock {
    fn acquire<'a>(
        &'a self,
        name: &'a str,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Option<LockHandle>, PipelineError>> + Send + 'a>>
    {
        Box::pin(async move {
            let mut leases = self.leases.lock().await;
            let now = Instant::now();

            if let Some(lease) = leases.get(name) {
                if lease.expires_at > now {
                    return Ok(None);
                }
            }

            let token = Uuid::new_v4();
            leases.insert(
                name.to_string(),
                Lease {
                    token,
                    expires_at: now + ttl,
                },
            );
            Ok(Some(LockHandle {
                name: name.to_string(),
                token,
                ttl,
            }))
        })
    }

    fn renew<'a>(
        &'a self,
        handle: &'a LockHandle,
    ) -> Pin<Box<dyn Future<Output = Result<bool, PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            let mut leases = self.leases.lock().await;
            match leases.get_mut(&handle.name) {
                Some(lease) if lease.token == handle.token => {
                    lease.expires_at = Instant::now() + handle.ttl;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    fn release<'a>(
        &'a self,
        handle: &'a LockHandle,
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            let mut leases = self.leases.lock().await;
            if leases
                .get(&handle.name)
                .is_some_and(|lease| lease.token == handle.token)
            {
                leases.remove(&handle.name);
            }
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    #[tokio::test]
    async fn lock_is_mutually_exclusive() {
        let lock = InMemoryLock::new();
        let ttl = Duration::from_secs(30);

        let handle = lock.acquire("worker", ttl).await.unwrap();
        assert!(handle.is_some());
        assert!(lock.acquire("worker", ttl).await.unwrap().is_none());

        // Different names do not contend.
        assert!(lock.acquire("other", ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn released_lock_is_acquirable_again() {
        let lock = InMemoryLock::new();
        let ttl = Duration::from_secs(30);

        let handle = lock.acquire("worker", ttl).await.unwrap().unwrap();
        lock.release(&handle).await.unwrap();
        assert!(lock.acquire("worker", ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_lease_is_taken_over_and_stale_renew_fails() {
        let lock = InMemoryLock::new();

        let stale = lock
            .acquire("worker", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let fresh = lock
            .acquire("worker", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(fresh.is_some());
        assert!(!lock.renew(&stale).await.unwrap());

        // Releasing a lost lease must not free the new holder's lease.
        lock.release(&stale).await.unwrap();
        assert!(
            lock.acquire("worker", Duration::from_secs(30))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn renew_extends_the_lease() {
        let lock = InMemoryLock::new();

        let handle = lock
            .acquire("worker", Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(lock.renew(&handle).await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Without the renew the lease would have expired by now.
        assert!(
            lock.acquire("worker", Duration::from_secs(30))
                .await
                .unwrap()
                .is_none()
        );
    }
}
