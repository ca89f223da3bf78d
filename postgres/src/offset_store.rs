//! `PostgreSQL` offset store.

use ferrobus_core::error::PipelineError;
use ferrobus_core::offset::{OffsetKey, OffsetStore};
use sqlx::PgPool;
use std::future::Future;
use std::pin::Pin;

use crate::transaction::SharedPgTransaction;

/// `PostgreSQL`-backed offset store over the `stored_offsets` table.
///
/// # Schema
///
/// ```sql
/// CREATE TABLE stored_offsets (
///     group_id TEXT NOT NULL,
///     topic TEXT NOT NULL,
///     partition INT NOT NULL,
///     "offset" BIGINT NOT NULL,
///     PRIMARY KEY (group_id, topic, partition)
/// );
/// ```
///
/// Writes are monotonic: the stored offset only ever grows, so duplicate and
/// out-of-order writes of the same offset are idempotent no-ops.
#[derive(Clone)]
pub struct PostgresOffsetStore {
    pool: PgPool,
}

impl PostgresOffsetStore {
    /// Create an offset store over an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the offsets table when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Storage`] when the DDL fails.
    pub async fn migrate(&self) -> Result<(), PipelineError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stored_offsets (
                group_id TEXT NOT NULL,
                topic TEXT NOT NULL,
                partition INT NOT NULL,
                "offset" BIGINT NOT NULL,
                PRIMARY KEY (group_id, topic, partition)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| PipelineError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Record an offset inside an enlisted transaction, making the offset
    /// advance atomic with the application's domain writes (and outbox
    /// inserts) in the same transaction.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Storage`] when the write fails or the
    /// transaction was already finished.
    pub async fn store_enlisted(
        &self,
        key: &OffsetKey,
        offset: i64,
        shared: &SharedPgTransaction,
    ) -> Result<(), PipelineError> {
        let mut guard = shared.lock().await;
        let tx = guard.as_mut().ok_or_else(|| {
            PipelineError::Storage("enlisted transaction already closed".into())
        })?;
        upsert(key, offset)
            .execute(&mut **tx)
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;
        Ok(())
    }
}

fn upsert(
    key: &OffsetKey,
    offset: i64,
) -> sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments> {
    sqlx::query(
        r#"
        INSERT INTO stored_offsets (group_id, topic, partition, "offset")
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (group_id, topic, partition) DO UPDATE
        SET "offset" = GREATEST(stored_offsets."offset", EXCLUDED."offset")
        "#,
    )
    .bind(&key.group_id)
    .bind(&key.topic)
    .bind(key.partition)
    .bind(offset)
}

impl OffsetStore for PostgresOffsetStore {
    fn store<'a>(
        &'a self,
        key: &'a OffsetKey,
        offset: i64,
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            upsert(key, offset)
                .execute(&self.pool)
                .await
                .map_err(|e| PipelineError::Storage(e.to_string()))?;
            tracing::trace!(key = %key, offset, "offset stored");
            Ok(())
        })
    }

    fn load<'a>(
        &'a self,
        key: &'a OffsetKey,
    ) -> Pin<Box<dyn Future<Output = Result<Option<i64>, PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            let row: Option<(i64,)> = sqlx::query_as(
                r#"
                SELECT "offset" FROM stored_offsets
                WHERE group_id = $1 AND topic = $2 AND partition = $3
                "#,
            )
            .bind(&key.group_id)
            .bind(&key.topic)
            .bind(key.partition)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| PipelineError::Storage(e.to_string()))?;

            Ok(row.map(|(offset,)| offset))
        })
    }
}
