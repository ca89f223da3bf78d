//! `PostgreSQL` distributed locks.
//!
//! Two implementations with different failure characteristics:
//!
//! - [`PostgresLeaseLock`] — a row per lock name with a fencing token and an
//!   expiry; a crashed holder frees the lock when the lease expires.
//! - [`PostgresAdvisoryLock`] — a session-held `pg_advisory_lock`; a crashed
//!   holder frees the lock the moment its connection drops. The lease
//!   duration is ignored (session semantics).

use ferrobus_core::error::PipelineError;
use ferrobus_core::lock::{DistributedLock, LockHandle};
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

fn storage_error(error: sqlx::Error) -> PipelineError {
    PipelineError::Storage(error.to_string())
}

/// Row-based lease lock over the `distributed_locks` table.
///
/// # Schema
///
/// ```sql
/// CREATE TABLE distributed_locks (
///     name TEXT PRIMARY KEY,
///     token UUID NOT NULL,
///     expires_at TIMESTAMPTZ NOT NULL
/// );
/// ```
pub struct PostgresLeaseLock {
    pool: PgPool,
}

impl PostgresLeaseLock {
    /// Create a lease lock over an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the locks table when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Storage`] when the DDL fails.
    pub async fn migrate(&self) -> Result<(), PipelineError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS distributed_locks (
                name TEXT PRIMARY KEY,
                token UUID NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;
        Ok(())
    }
}

impl DistributedLock for PostgresLeaseLock {
    fn acquire<'a>(
        &'a self,
        name: &'a str,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Option<LockHandle>, PipelineError>> + Send + 'a>>
    {
        Box::pin(async move {
            let token = Uuid::new_v4();
            // Take the row when it is free or its lease expired; losing the
            // upsert race simply returns no row.
            let row: Option<(Uuid,)> = sqlx::query_as(
                r"
                INSERT INTO distributed_locks (name, token, expires_at)
                VALUES ($1, $2, now() + make_interval(secs => $3))
                ON CONFLICT (name) DO UPDATE
                SET token = EXCLUDED.token, expires_at = EXCLUDED.expires_at
                WHERE distributed_locks.expires_at < now()
                RETURNING token
                ",
            )
            .bind(name)
            .bind(token)
            .bind(ttl.as_secs_f64())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)?;

            Ok(row.map(|_| {
                tracing::debug!(lock = name, %token, "lease acquired");
                LockHandle {
                    name: name.to_string(),
                    token,
                    ttl,
                }
            }))
        })
    }

    fn renew<'a>(
        &'a self,
        handle: &'a LockHandle,
    ) -> Pin<Box<dyn Future<Output = Result<bool, PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE distributed_locks
                SET expires_at = now() + make_interval(secs => $3)
                WHERE name = $1 AND token = $2
                ",
            )
            .bind(&handle.name)
            .bind(handle.token)
            .bind(handle.ttl.as_secs_f64())
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;

            let renewed = result.rows_affected() == 1;
            if !renewed {
                tracing::warn!(lock = %handle.name, "lease lost, renew refused");
            }
            Ok(renewed)
        })
    }

    fn release<'a>(
        &'a self,
        handle: &'a LockHandle,
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            sqlx::query("DELETE FROM distributed_locks WHERE name = $1 AND token = $2")
                .bind(&handle.name)
                .bind(handle.token)
                .execute(&self.pool)
                .await
                .map_err(storage_error)?;
            tracing::debug!(lock = %handle.name, "lease released");
            Ok(())
        })
    }
}

/// Session-held advisory lock.
///
/// Each acquisition pins one pooled connection for the lifetime of the
/// handle; the lock is released explicitly or by the connection dropping
/// (process crash included). `ttl` is ignored — advisory locks have session
/// semantics and never expire while the holder lives.
pub struct PostgresAdvisoryLock {
    pool: PgPool,
    held: Mutex<HashMap<Uuid, PoolConnection<Postgres>>>,
}

impl PostgresAdvisoryLock {
    /// Create an advisory lock over an existing connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            held: Mutex::new(HashMap::new()),
        }
    }
}

impl DistributedLock for PostgresAdvisoryLock {
    fn acquire<'a>(
        &'a self,
        name: &'a str,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Option<LockHandle>, PipelineError>> + Send + 'a>>
    {
        Box::pin(async move {
            let mut conn = self.pool.acquire().await.map_err(storage_error)?;

            let (acquired,): (bool,) =
                sqlx::query_as("SELECT pg_try_advisory_lock(hashtext($1))")
                    .bind(name)
                    .fetch_one(&mut *conn)
                    .await
                    .map_err(storage_error)?;

            if !acquired {
                return Ok(None);
            }

            let token = Uuid::new_v4();
            self.held.lock().await.insert(token, conn);
            tracing::debug!(lock = name, %token, "advisory lock acquired");
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
            // Session locks hold as long as the connection lives.
            Ok(self.held.lock().await.contains_key(&handle.token))
        })
    }

    fn release<'a>(
        &'a self,
        handle: &'a LockHandle,
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            let Some(mut conn) = self.held.lock().await.remove(&handle.token) else {
                return Ok(());
            };
            sqlx::query("SELECT pg_advisory_unlock(hashtext($1))")
                .bind(&handle.name)
                .execute(&mut *conn)
                .await
                .map_err(storage_error)?;
            tracing::debug!(lock = %handle.name, "advisory lock released");
            Ok(())
        })
    }
}
