//! `PostgreSQL` transactional outbox.

use ferrobus_core::context::PipelineContext;
use ferrobus_core::error::PipelineError;
use ferrobus_core::headers::Headers;
use ferrobus_core::outbox::{NewOutboxMessage, OutboxMessage, OutboxReader, OutboxWriter};
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;

use crate::transaction::SharedPgTransaction;

/// `PostgreSQL`-backed outbox: writer and reader over the `outbox_messages`
/// table.
///
/// # Schema
///
/// ```sql
/// CREATE TABLE outbox_messages (
///     id BIGSERIAL PRIMARY KEY,
///     message_type TEXT,
///     content BYTEA,
///     headers JSONB NOT NULL,
///     endpoint_name TEXT NOT NULL,
///     serialized_endpoint TEXT,
///     created TIMESTAMPTZ NOT NULL DEFAULT now()
/// );
/// CREATE INDEX idx_outbox_messages_fifo ON outbox_messages (created, id);
/// ```
///
/// The `(created, id)` index serves the worker's FIFO scan.
pub struct PostgresOutbox {
    pool: PgPool,
}

impl PostgresOutbox {
    /// Create an outbox over an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the outbox table and index when they do not exist.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Storage`] when the DDL fails.
    pub async fn migrate(&self) -> Result<(), PipelineError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS outbox_messages (
                id BIGSERIAL PRIMARY KEY,
                message_type TEXT,
                content BYTEA,
                headers JSONB NOT NULL,
                endpoint_name TEXT NOT NULL,
                serialized_endpoint TEXT,
                created TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_outbox_messages_fifo
            ON outbox_messages (created, id)
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;
        Ok(())
    }

    /// Number of pending rows; useful for monitoring.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Storage`] when the query fails.
    pub async fn count_pending(&self) -> Result<i64, PipelineError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM outbox_messages")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_error)?;
        Ok(count)
    }
}

fn storage_error(error: sqlx::Error) -> PipelineError {
    PipelineError::Storage(error.to_string())
}

fn row_to_message(row: &sqlx::postgres::PgRow) -> Result<OutboxMessage, PipelineError> {
    let headers_json: serde_json::Value = row.get("headers");
    let headers = Headers::from_json(&headers_json)
        .map_err(|e| PipelineError::Storage(format!("corrupt headers blob: {e}")))?;

    Ok(OutboxMessage {
        id: row.get("id"),
        message_type: row.get("message_type"),
        content: row.get("content"),
        headers,
        endpoint_name: row.get("endpoint_name"),
        serialized_endpoint: row.get("serialized_endpoint"),
        created: row.get("created"),
    })
}

impl OutboxWriter for PostgresOutbox {
    fn add<'a>(
        &'a self,
        message: NewOutboxMessage,
        ctx: &'a mut PipelineContext,
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            let query = sqlx::query(
                r"
                INSERT INTO outbox_messages
                    (message_type, content, headers, endpoint_name, serialized_endpoint)
                VALUES ($1, $2, $3, $4, $5)
                ",
            )
            .bind(&message.message_type)
            .bind(&message.content)
            .bind(message.headers.to_json())
            .bind(&message.endpoint_name)
            .bind(&message.serialized_endpoint);

            let enlisted = ctx.bag.get::<SharedPgTransaction>().cloned();
            match enlisted {
                Some(shared) => {
                    let mut guard = shared.lock().await;
                    match guard.as_mut() {
                        Some(tx) => {
                            query.execute(&mut **tx).await.map_err(storage_error)?;
                        }
                        None => {
                            // The enlisted transaction was already finished;
                            // at-least-once from the caller's perspective is
                            // no longer guaranteed.
                            tracing::warn!(
                                endpoint = %message.endpoint_name,
                                "enlisted transaction already closed, outbox write is autonomous"
                            );
                            query.execute(&self.pool).await.map_err(storage_error)?;
                        }
                    }
                }
                None => {
                    tracing::warn!(
                        endpoint = %message.endpoint_name,
                        "no transaction enlisted, outbox write is autonomous"
                    );
                    query.execute(&self.pool).await.map_err(storage_error)?;
                }
            }

            metrics::counter!("outbox.messages.added").increment(1);
            tracing::debug!(
                endpoint = %message.endpoint_name,
                message_type = message.message_type.as_deref().unwrap_or(""),
                "outbox row added"
            );
            Ok(())
        })
    }
}

impl OutboxReader for PostgresOutbox {
    fn read(
        &self,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxMessage>, PipelineError>> + Send + '_>>
    {
        Box::pin(async move {
            #[allow(clippy::cast_possible_wrap)] // Batch limits are small
            let rows = sqlx::query(
                r"
                SELECT id, message_type, content, headers, endpoint_name,
                       serialized_endpoint, created
                FROM outbox_messages
                ORDER BY created, id
                LIMIT $1
                ",
            )
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_error)?;

            rows.iter().map(row_to_message).collect()
        })
    }

    fn acknowledge<'a>(
        &'a self,
        ids: &'a [i64],
    ) -> Pin<Box<dyn Future<Output = Result<(), PipelineError>> + Send + 'a>> {
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM outbox_messages WHERE id = ANY($1)")
                .bind(ids)
                .execute(&self.pool)
                .await
                .map_err(storage_error)?;

            metrics::counter!("outbox.messages.acknowledged").increment(result.rows_affected());
            Ok(())
        })
    }
}
